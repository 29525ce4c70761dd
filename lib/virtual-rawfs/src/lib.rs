//! Host-passthrough backend for a virtual filesystem.
//!
//! This crate implements the virtual filesystem's node-operation and
//! stream-operation contracts directly on top of the host's synchronous
//! file I/O, instead of an in-memory emulation. It bridges two error
//! domains (host errno vs. virtual error kinds), two descriptor spaces
//! (guest descriptors vs. host descriptors) and two memory models
//! (memory maps are emulated by explicit buffer copies into the guest
//! heap).
//!
//! The backend is registered with a [`BackendRegistry`] and consulted by
//! the surrounding virtual filesystem; it never mutates shared global
//! state. Streams that were created by the in-memory backend carry a
//! provenance tag and have their operations delegated unchanged.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

mod flags;
mod node;
mod raw_fs;
mod registry;
mod stream;

pub use flags::{MmapFlags, MmapProt, OpenFlags, SEEK_CUR, SEEK_END, SEEK_SET};
pub use node::{
    FileType, FsNode, Metadata, ResolveOptions, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK,
    S_IFMT, S_IFREG, S_IFSOCK,
};
pub use raw_fs::RawFs;
pub use registry::BackendRegistry;
pub use stream::{Fd, SharedIdx, Stream, StreamOrigin, StreamSpec};

pub type Result<T, E = BackendError> = std::result::Result<T, E>;

/// Error kinds of the virtual filesystem.
///
/// A failure carrying one of these kinds is indistinguishable, at the
/// virtual-filesystem boundary, from the equivalent failure of the
/// in-memory backend.
#[derive(Error, Copy, Clone, Debug, PartialEq, Eq)]
pub enum FsError {
    /// The requested file or directory could not be found
    #[error("entry not found")]
    EntryNotFound,
    /// Caller was not allowed to perform this operation
    #[error("permission denied")]
    PermissionDenied,
    /// File or directory exists
    #[error("entry already exists")]
    AlreadyExists,
    /// A directory was required but the entry is not one
    #[error("not a directory")]
    NotADirectory,
    /// A non-directory was required but the entry is a directory
    #[error("is a directory")]
    IsADirectory,
    /// The directory is not empty
    #[error("directory not empty")]
    DirectoryNotEmpty,
    /// The provided data is invalid
    #[error("invalid input")]
    InvalidInput,
    /// Invalid internal data, if the argument data is invalid, use `InvalidInput`
    #[error("invalid internal data")]
    InvalidData,
    /// The guest descriptor given was not usable
    #[error("invalid fd")]
    InvalidFd,
    /// The stream does not support seeking
    #[error("not seekable")]
    NotSeekable,
    /// A pipe was closed
    #[error("broken pipe (was closed)")]
    BrokenPipe,
    /// The operation was interrupted before it could finish
    #[error("operation interrupted")]
    Interrupted,
    /// Operation would block, this error lets the caller know that they can try again
    #[error("blocking operation. try again")]
    WouldBlock,
    /// Found EOF when EOF was not expected
    #[error("unexpected eof")]
    UnexpectedEof,
    /// A call to write returned 0
    #[error("write returned 0")]
    WriteZero,
    /// The operation did not complete within the given amount of time
    #[error("time out")]
    TimedOut,
    /// The storage device holding the file is full
    #[error("storage full")]
    StorageFull,
    /// The file grew beyond what the host allows
    #[error("file too large")]
    FileTooLarge,
    /// Too many levels of symbolic links during resolution
    #[error("filesystem loop")]
    FilesystemLoop,
    /// The filesystem was mounted read-only
    #[error("read-only filesystem")]
    ReadOnlyFilesystem,
    /// No host-specific equivalent is modeled for this operation
    #[error("operation not supported")]
    Unsupported,
    /// The descriptor does not refer to a terminal device
    #[error("inappropriate ioctl for device")]
    NotATty,
}

/// Error returned by every backend operation.
///
/// Host failures with a recognized error code are translated into
/// [`FsError`]; anything else propagates unmodified as [`Unexpected`],
/// signaling a defect or an unmodeled condition rather than a
/// filesystem-semantics outcome.
///
/// [`Unexpected`]: BackendError::Unexpected
#[derive(Error, Debug)]
pub enum BackendError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("unexpected host failure: {0}")]
    Unexpected(#[source] io::Error),
}

impl BackendError {
    /// The translated error kind, if this failure carried a recognized
    /// host error code.
    pub fn fs_kind(&self) -> Option<FsError> {
        match self {
            Self::Fs(kind) => Some(*kind),
            Self::Unexpected(_) => None,
        }
    }
}

impl PartialEq for BackendError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Fs(a), Self::Fs(b)) => a == b,
            // untranslated host failures carry no stable identity
            _ => false,
        }
    }
}

impl PartialEq<FsError> for BackendError {
    fn eq(&self, other: &FsError) -> bool {
        matches!(self, Self::Fs(kind) if kind == other)
    }
}

impl From<io::Error> for BackendError {
    fn from(io_error: io::Error) -> Self {
        let kind = match io_error.kind() {
            io::ErrorKind::NotFound => FsError::EntryNotFound,
            io::ErrorKind::PermissionDenied => FsError::PermissionDenied,
            io::ErrorKind::AlreadyExists => FsError::AlreadyExists,
            io::ErrorKind::NotADirectory => FsError::NotADirectory,
            io::ErrorKind::IsADirectory => FsError::IsADirectory,
            io::ErrorKind::DirectoryNotEmpty => FsError::DirectoryNotEmpty,
            io::ErrorKind::InvalidInput => FsError::InvalidInput,
            io::ErrorKind::InvalidData => FsError::InvalidData,
            io::ErrorKind::NotSeekable => FsError::NotSeekable,
            io::ErrorKind::BrokenPipe => FsError::BrokenPipe,
            io::ErrorKind::Interrupted => FsError::Interrupted,
            io::ErrorKind::WouldBlock => FsError::WouldBlock,
            io::ErrorKind::UnexpectedEof => FsError::UnexpectedEof,
            io::ErrorKind::WriteZero => FsError::WriteZero,
            io::ErrorKind::TimedOut => FsError::TimedOut,
            io::ErrorKind::StorageFull => FsError::StorageFull,
            io::ErrorKind::FileTooLarge => FsError::FileTooLarge,
            io::ErrorKind::ReadOnlyFilesystem => FsError::ReadOnlyFilesystem,
            io::ErrorKind::Unsupported => FsError::Unsupported,
            _ => {
                // symlink loops carry no matchable kind; go by the raw errno
                #[cfg(unix)]
                if io_error.raw_os_error() == Some(libc::ELOOP) {
                    return BackendError::Fs(FsError::FilesystemLoop);
                }
                // no recognized code: do not mask it as a filesystem error
                return BackendError::Unexpected(io_error);
            }
        };
        BackendError::Fs(kind)
    }
}

/// The node-operation contract expected by the surrounding virtual
/// filesystem.
///
/// Every method performs a fresh host call; nothing is cached across
/// invocations.
pub trait NodeOps {
    /// Resolve `name` inside `parent`, producing a fresh node descriptor.
    fn resolve(&self, parent: &FsNode, name: &str) -> Result<FsNode>;

    /// Resolve a path, producing a fresh node descriptor.
    fn resolve_path(&self, path: &Path, opts: ResolveOptions) -> Result<FsNode>;

    /// Create a directory or an empty regular file, depending on the
    /// file-type bits of `mode`.
    fn mknod(&self, path: &Path, mode: u32) -> Result<()>;

    fn mkdir(&self, path: &Path, mode: u32) -> Result<()>;

    fn symlink(&self, target: &Path, link: &Path) -> Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    fn rmdir(&self, path: &Path) -> Result<()>;

    /// List a directory. The result always begins with `.` and `..`,
    /// followed by the host's entries in host order.
    fn readdir(&self, path: &Path) -> Result<Vec<String>>;

    fn unlink(&self, path: &Path) -> Result<()>;

    fn readlink(&self, path: &Path) -> Result<PathBuf>;

    fn stat(&self, path: &Path) -> Result<Metadata>;

    fn lstat(&self, path: &Path) -> Result<Metadata>;

    fn chmod(&self, path: &Path, mode: u32) -> Result<()>;

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<()>;

    /// Change access and modification times, given in milliseconds since
    /// the UNIX epoch.
    fn utime(&self, path: &Path, atime_ms: u64, mtime_ms: u64) -> Result<()>;

    fn truncate(&self, path: &Path, len: u64) -> Result<()>;
}

/// The stream-operation contract expected by the surrounding virtual
/// filesystem.
pub trait StreamOps {
    /// Open a host file and register a stream for it. Returns the guest
    /// descriptor.
    fn open(&mut self, path: &Path, flags: OpenFlags, mode: u32) -> Result<Fd>;

    /// Close a stream. The host descriptor is released only when the
    /// last duplicate over the same open is closed.
    fn close(&mut self, fd: Fd) -> Result<()>;

    /// Register a duplicate stream over the same host open.
    fn duplicate(&mut self, fd: Fd, target: Option<Fd>) -> Result<Fd>;

    /// Reposition the stream cursor. `whence` is one of [`SEEK_SET`],
    /// [`SEEK_CUR`] or [`SEEK_END`]; anything else is invalid input.
    fn llseek(&mut self, fd: Fd, offset: i64, whence: i32) -> Result<u64>;

    /// Read into `buf`. With an explicit `position` the stored cursor is
    /// left untouched; otherwise the cursor of a seekable stream is used
    /// and advanced by the bytes transferred.
    fn read(&mut self, fd: Fd, buf: &mut [u8], position: Option<u64>) -> Result<usize>;

    /// Write from `buf`, with the same positional rules as [`read`].
    /// Append-mode streams always write at the then-current end of file.
    ///
    /// [`read`]: StreamOps::read
    fn write(&mut self, fd: Fd, buf: &[u8], position: Option<u64>) -> Result<usize>;

    /// Always fails with [`FsError::Unsupported`].
    fn allocate(&mut self, fd: Fd, offset: u64, len: u64) -> Result<()>;

    /// Map a region of the stream into the guest heap by copy. The
    /// returned region is always freshly allocated; this backend never
    /// establishes a real host memory mapping.
    fn mmap(
        &mut self,
        fd: Fd,
        heap: &mut dyn GuestHeap,
        length: usize,
        position: u64,
        prot: MmapProt,
        flags: MmapFlags,
    ) -> Result<MmapRegion>;

    /// Write a mapped region back to the host file at `offset`.
    fn msync(&mut self, fd: Fd, buf: &[u8], offset: u64, flags: MmapFlags) -> Result<()>;

    /// Always succeeds; freeing the emulated region is the caller's
    /// responsibility.
    fn munmap(&mut self, fd: Fd) -> Result<()>;

    /// Always fails with [`FsError::NotATty`].
    fn ioctl(&mut self, fd: Fd, request: u64) -> Result<i32>;

    fn fchmod(&mut self, fd: Fd, mode: u32) -> Result<()>;

    fn fchown(&mut self, fd: Fd, uid: u32, gid: u32) -> Result<()>;

    /// Truncate by descriptor. Negative lengths fail with
    /// [`FsError::InvalidInput`] before the file is touched.
    fn ftruncate(&mut self, fd: Fd, len: i64) -> Result<()>;
}

/// A complete backend implementation, as consulted through the
/// [`BackendRegistry`].
pub trait FsBackend: NodeOps + StreamOps + fmt::Debug {}

impl<T: NodeOps + StreamOps + fmt::Debug> FsBackend for T {}

/// The guest heap allocator, used only to obtain destination buffers for
/// mapped regions.
pub trait GuestHeap {
    /// Allocate `len` bytes, returning the guest address of the region.
    fn alloc(&mut self, len: usize) -> Result<u64>;

    /// Borrow an allocated region mutably.
    fn region_mut(&mut self, ptr: u64, len: usize) -> Result<&mut [u8]>;
}

/// A mapped region handed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapRegion {
    /// Guest address of the region.
    pub ptr: u64,
    /// Whether the region was freshly allocated and must be freed by the
    /// caller. Always `true` for this backend.
    pub allocated: bool,
}

/// A stream created by the in-memory backend.
///
/// Streams carrying this object as their origin have every operation
/// delegated to it unchanged.
pub trait FallbackStream: fmt::Debug {
    fn llseek(&mut self, offset: i64, whence: i32) -> Result<u64>;

    fn read(&mut self, buf: &mut [u8], position: Option<u64>) -> Result<usize>;

    fn write(&mut self, buf: &[u8], position: Option<u64>) -> Result<usize>;

    fn mmap(
        &mut self,
        heap: &mut dyn GuestHeap,
        length: usize,
        position: u64,
        prot: MmapProt,
        flags: MmapFlags,
    ) -> Result<MmapRegion>;

    fn msync(&mut self, buf: &[u8], offset: u64, flags: MmapFlags) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}
