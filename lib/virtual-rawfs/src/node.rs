//! Node descriptors and host metadata.

use std::convert::TryFrom;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// File-type bits of a mode value, in the guest's numeric encoding.
pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// A filesystem entry as seen by the virtual layer at the instant of
/// resolution.
///
/// Produced fresh on every resolution call and discarded after use; no
/// identity is claimed across host-side mutations between calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsNode {
    /// Stable identity: the host inode number.
    pub id: u64,
    /// Type and permission bits.
    pub mode: u32,
    /// The host path this node was resolved from.
    pub path: PathBuf,
}

impl FsNode {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

/// Options for [`resolve_path`](crate::NodeOps::resolve_path).
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Strip the final path segment before resolving, producing the
    /// containing directory's node (used for not-yet-existing targets).
    pub want_parent: bool,
}

/// Strip the final segment of `path` when a parent resolution was
/// requested. The root keeps itself as its own parent.
pub(crate) fn parent_of(path: &Path) -> &Path {
    path.parent().unwrap_or(path)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct FileType {
    pub dir: bool,
    pub file: bool,
    pub symlink: bool,
    pub char_device: bool,
    pub block_device: bool,
    pub socket: bool,
    pub fifo: bool,
}

impl FileType {
    pub fn is_dir(&self) -> bool {
        self.dir
    }

    pub fn is_file(&self) -> bool {
        self.file
    }

    pub fn is_symlink(&self) -> bool {
        self.symlink
    }
}

/// Host metadata translated into the virtual layer's shape.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Metadata {
    /// Type and permission bits.
    pub mode: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Access time in nanoseconds since the UNIX epoch.
    pub accessed: u64,
    /// Modification time in nanoseconds since the UNIX epoch.
    pub modified: u64,
    /// Creation (or status-change) time in nanoseconds since the UNIX epoch.
    pub created: u64,
    /// Size in bytes.
    pub len: u64,
    /// Host inode number.
    pub inode: u64,
    /// File type.
    pub ft: FileType,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.ft.is_dir()
    }

    pub fn is_file(&self) -> bool {
        self.ft.is_file()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn file_type(&self) -> FileType {
        self.ft
    }
}

fn system_time_to_nanos(time: io::Result<SystemTime>) -> u64 {
    time.and_then(|time| {
        time.duration_since(UNIX_EPOCH)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    })
    .map_or(0, |time| time.as_nanos() as u64)
}

impl TryFrom<fs::Metadata> for Metadata {
    type Error = io::Error;

    fn try_from(metadata: fs::Metadata) -> std::result::Result<Self, Self::Error> {
        let filetype = metadata.file_type();
        let (char_device, block_device, socket, fifo) = {
            #[cfg(unix)]
            {
                use std::os::unix::fs::FileTypeExt;
                (
                    filetype.is_char_device(),
                    filetype.is_block_device(),
                    filetype.is_socket(),
                    filetype.is_fifo(),
                )
            }
            #[cfg(not(unix))]
            {
                (false, false, false, false)
            }
        };

        let (mode, uid, gid, inode) = {
            #[cfg(unix)]
            {
                use std::os::unix::fs::MetadataExt;
                (
                    metadata.mode(),
                    metadata.uid(),
                    metadata.gid(),
                    metadata.ino(),
                )
            }
            #[cfg(not(unix))]
            {
                // synthesize mode bits; the host exposes no inode identity
                let mode = if filetype.is_dir() {
                    S_IFDIR | 0o777
                } else if filetype.is_symlink() {
                    S_IFLNK | 0o777
                } else {
                    S_IFREG | 0o666
                };
                (mode, 0, 0, 0)
            }
        };

        Ok(Metadata {
            mode,
            uid,
            gid,
            accessed: system_time_to_nanos(metadata.accessed()),
            modified: system_time_to_nanos(metadata.modified()),
            created: system_time_to_nanos(metadata.created()),
            len: metadata.len(),
            inode,
            ft: FileType {
                dir: filetype.is_dir(),
                file: filetype.is_file(),
                symlink: filetype.is_symlink(),
                char_device,
                block_device,
                socket,
                fifo,
            },
        })
    }
}
