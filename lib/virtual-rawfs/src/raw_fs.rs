//! The host-passthrough backend.
//!
//! Every operation issues a fresh synchronous host call; nothing is
//! cached across invocations, so host-side races surface as the host
//! error of whichever call hits them.

use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;
use tracing::{debug, trace};

use crate::node::{parent_of, S_IFDIR, S_IFMT};
use crate::stream::{SharedArena, StreamTable};
use crate::{
    Fd, FsError, FsNode, GuestHeap, Metadata, MmapFlags, MmapProt, MmapRegion,
    NodeOps, OpenFlags, ResolveOptions, Result, Stream, StreamOps, StreamOrigin, StreamSpec,
    SEEK_CUR, SEEK_END, SEEK_SET,
};

/// Maximum length of a single path segment passed to the host, in bytes.
const MAX_SEGMENT_LEN: usize = 255;

/// The host-passthrough backend: streams live in a guest descriptor
/// table, host descriptors in a reference-counted arena shared by
/// duplicate streams.
#[derive(Debug, Default)]
pub struct RawFs {
    streams: StreamTable,
    shared: SharedArena,
}

/// Cap every segment at [`MAX_SEGMENT_LEN`] bytes (on a character
/// boundary) before handing the path to the host. Only the host call
/// sees the truncated form; stored paths keep their full segments.
fn truncate_segments(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(segment) => match segment.to_str() {
                Some(s) if s.len() > MAX_SEGMENT_LEN => {
                    let mut end = MAX_SEGMENT_LEN;
                    while !s.is_char_boundary(end) {
                        end -= 1;
                    }
                    out.push(&s[..end]);
                }
                _ => out.push(segment),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn host_open_options(flags: OpenFlags, mode: u32) -> fs::OpenOptions {
    // the host rejects truncate+append together; truncate is applied
    // first and append would be ignored anyway
    let append = flags.contains(OpenFlags::APPEND) && !flags.contains(OpenFlags::TRUNC);

    let mut options = fs::OpenOptions::new();
    options
        .read(flags.is_read())
        .write(flags.is_write())
        .create(flags.contains(OpenFlags::CREAT))
        .create_new(flags.contains(OpenFlags::EXCL))
        .truncate(flags.contains(OpenFlags::TRUNC))
        .append(append);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
        if flags.contains(OpenFlags::NOFOLLOW) {
            options.custom_flags(libc::O_NOFOLLOW);
        }
    }
    #[cfg(not(unix))]
    let _ = mode;
    options
}

#[cfg(unix)]
fn read_at(file: &fs::File, buf: &mut [u8], position: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, position)
}

#[cfg(windows)]
fn read_at(file: &fs::File, buf: &mut [u8], position: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, position)
}

#[cfg(unix)]
fn write_at(file: &fs::File, buf: &[u8], position: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, position)
}

#[cfg(windows)]
fn write_at(file: &fs::File, buf: &[u8], position: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, position)
}

impl RawFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream, initializing or incrementing the reference
    /// count of its shared host state. With `at` the stream lands on a
    /// caller-chosen descriptor; otherwise the lowest free one is used.
    pub fn create_stream(&mut self, spec: StreamSpec, at: Option<Fd>) -> Result<Fd> {
        let fd = match at {
            Some(fd) => {
                if self.streams.get(fd).is_some() {
                    return Err(FsError::AlreadyExists.into());
                }
                fd
            }
            None => self.streams.next_free(),
        };
        if let StreamOrigin::Host(idx) = &spec.origin {
            self.shared.retain(*idx);
        }
        self.streams.insert(Stream {
            fd,
            path: spec.path,
            flags: spec.flags,
            position: spec.position,
            seekable: spec.seekable,
            tty: spec.tty,
            node: spec.node,
            origin: spec.origin,
        })?;
        Ok(fd)
    }

    /// Look up a registered stream.
    pub fn stream(&self, fd: Fd) -> Result<&Stream> {
        self.streams.get(fd).ok_or(FsError::InvalidFd.into())
    }

    /// [`open`](StreamOps::open) with a symbolic mode string (`"r"`,
    /// `"w+"`, ...) instead of numeric flags.
    pub fn open_symbolic(&mut self, path: &Path, mode: &str, perm: u32) -> Result<Fd> {
        self.open(path, OpenFlags::from_symbolic(mode)?, perm)
    }

    /// Pre-register the standard streams: descriptor 0 read-oriented,
    /// 1 and 2 write-oriented, all terminal-attached and non-seekable.
    ///
    /// Each one is bound to a duplicate of the corresponding host
    /// descriptor, so the final release of a duplicated standard stream
    /// closes only the duplicate, never the process's own stdio.
    #[cfg(unix)]
    pub fn install_standard_streams(&mut self) -> Result<()> {
        use std::os::fd::AsFd;

        // check all three slots before duplicating or adopting anything,
        // so a failure leaves no host descriptor behind
        for fd in [Fd(0), Fd(1), Fd(2)] {
            if self.streams.get(fd).is_some() {
                return Err(FsError::AlreadyExists.into());
            }
        }

        let stdin = io::stdin().as_fd().try_clone_to_owned()?;
        let stdout = io::stdout().as_fd().try_clone_to_owned()?;
        let stderr = io::stderr().as_fd().try_clone_to_owned()?;

        let write_flags = OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC;
        let streams = [
            (Fd(0), fs::File::from(stdin), OpenFlags::empty()),
            (Fd(1), fs::File::from(stdout), write_flags),
            (Fd(2), fs::File::from(stderr), write_flags),
        ];
        for (fd, file, flags) in streams {
            let idx = self.shared.insert(file);
            self.create_stream(
                StreamSpec {
                    path: PathBuf::new(),
                    flags,
                    position: 0,
                    seekable: false,
                    tty: true,
                    node: None,
                    origin: StreamOrigin::Host(idx),
                },
                Some(fd),
            )?;
        }
        debug!("standard streams registered");
        Ok(())
    }

    /// Host process working directory.
    pub fn cwd(&self) -> Result<PathBuf> {
        Ok(env::current_dir()?)
    }

    /// Change the host process working directory.
    pub fn chdir(&self, path: &Path) -> Result<()> {
        Ok(env::set_current_dir(path)?)
    }

    fn host_file(&self, fd: Fd) -> Result<&fs::File> {
        let stream = self.streams.get(fd).ok_or(FsError::InvalidFd)?;
        match stream.origin {
            StreamOrigin::Host(idx) => Ok(self.shared.file(idx).ok_or(FsError::InvalidFd)?),
            StreamOrigin::Memory(_) => Err(FsError::Unsupported.into()),
        }
    }
}

impl NodeOps for RawFs {
    fn resolve(&self, parent: &FsNode, name: &str) -> Result<FsNode> {
        self.resolve_path(&parent.path.join(name), ResolveOptions::default())
    }

    fn resolve_path(&self, path: &Path, opts: ResolveOptions) -> Result<FsNode> {
        let path = if opts.want_parent {
            parent_of(path)
        } else {
            path
        };
        let metadata = self.lstat(path)?;
        Ok(FsNode {
            id: metadata.inode,
            mode: metadata.mode,
            path: path.to_owned(),
        })
    }

    fn mknod(&self, path: &Path, mode: u32) -> Result<()> {
        if mode & S_IFMT == S_IFDIR {
            self.mkdir(path, mode & 0o777)
        } else {
            let mut options = fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(mode & 0o777);
            }
            options.open(path)?;
            Ok(())
        }
    }

    fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        builder.create(path)?;
        Ok(())
    }

    #[cfg(unix)]
    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        std::os::unix::fs::symlink(target, link)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn symlink(&self, _target: &Path, _link: &Path) -> Result<()> {
        Err(FsError::Unsupported.into())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn rmdir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(path)?;
        Ok(())
    }

    fn readdir(&self, path: &Path) -> Result<Vec<String>> {
        let mut entries = vec![".".to_owned(), "..".to_owned()];
        for entry in fs::read_dir(path)? {
            entries.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(entries)
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn readlink(&self, path: &Path) -> Result<PathBuf> {
        Ok(fs::read_link(path)?)
    }

    fn stat(&self, path: &Path) -> Result<Metadata> {
        let metadata = fs::metadata(path)?;
        Ok(Metadata::try_from(metadata)?)
    }

    fn lstat(&self, path: &Path) -> Result<Metadata> {
        let metadata = fs::symlink_metadata(path)?;
        Ok(Metadata::try_from(metadata)?)
    }

    #[cfg(unix)]
    fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn chmod(&self, _path: &Path, _mode: u32) -> Result<()> {
        Err(FsError::Unsupported.into())
    }

    #[cfg(unix)]
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn chown(&self, _path: &Path, _uid: u32, _gid: u32) -> Result<()> {
        Err(FsError::Unsupported.into())
    }

    fn utime(&self, path: &Path, atime_ms: u64, mtime_ms: u64) -> Result<()> {
        let to_filetime = |ms: u64| {
            FileTime::from_unix_time((ms / 1000) as i64, ((ms % 1000) * 1_000_000) as u32)
        };
        filetime::set_file_times(path, to_filetime(atime_ms), to_filetime(mtime_ms))?;
        Ok(())
    }

    fn truncate(&self, path: &Path, len: u64) -> Result<()> {
        let file = fs::OpenOptions::new().write(true).open(path)?;
        file.set_len(len)?;
        Ok(())
    }
}

impl StreamOps for RawFs {
    fn open(&mut self, path: &Path, flags: OpenFlags, mode: u32) -> Result<Fd> {
        let host_path = truncate_segments(path);
        let file = host_open_options(flags, mode).open(&host_path)?;
        let metadata = Metadata::try_from(file.metadata()?)?;
        if flags.contains(OpenFlags::DIRECTORY) && !metadata.is_dir() {
            // release the just-opened descriptor before raising
            drop(file);
            return Err(FsError::NotADirectory.into());
        }

        trace!(path = %path.display(), ?flags, "opened host file");
        let node = FsNode {
            id: metadata.inode,
            mode: metadata.mode,
            path: path.to_owned(),
        };
        let idx = self.shared.insert(file);
        self.create_stream(
            StreamSpec {
                path: path.to_owned(),
                flags,
                position: 0,
                seekable: true,
                tty: false,
                node: Some(node),
                origin: StreamOrigin::Host(idx),
            },
            None,
        )
    }

    fn close(&mut self, fd: Fd) -> Result<()> {
        // deregister first; the host descriptor goes only with the last
        // duplicate
        let stream = self.streams.remove(fd).ok_or(FsError::InvalidFd)?;
        match stream.origin {
            StreamOrigin::Memory(mut fallback) => fallback.close(),
            StreamOrigin::Host(idx) => {
                if let Some(file) = self.shared.release(idx) {
                    trace!(path = %stream.path.display(), "closing host descriptor");
                    drop(file);
                }
                Ok(())
            }
        }
    }

    fn duplicate(&mut self, fd: Fd, target: Option<Fd>) -> Result<Fd> {
        let stream = self.streams.get(fd).ok_or(FsError::InvalidFd)?;
        let idx = match stream.origin {
            StreamOrigin::Host(idx) => idx,
            StreamOrigin::Memory(_) => return Err(FsError::Unsupported.into()),
        };
        let spec = StreamSpec {
            path: stream.path.clone(),
            flags: stream.flags,
            position: stream.position,
            seekable: stream.seekable,
            tty: stream.tty,
            node: stream.node.clone(),
            origin: StreamOrigin::Host(idx),
        };
        self.create_stream(spec, target)
    }

    fn llseek(&mut self, fd: Fd, offset: i64, whence: i32) -> Result<u64> {
        let stream = self.streams.get_mut(fd).ok_or(FsError::InvalidFd)?;
        let idx = match &mut stream.origin {
            StreamOrigin::Memory(fallback) => return fallback.llseek(offset, whence),
            StreamOrigin::Host(idx) => *idx,
        };
        let position = match whence {
            SEEK_SET => offset,
            SEEK_CUR => stream.position as i64 + offset,
            SEEK_END => {
                let file = self.shared.file(idx).ok_or(FsError::InvalidFd)?;
                i64::try_from(file.metadata()?.len()).map_err(|_| FsError::InvalidInput)? + offset
            }
            _ => return Err(FsError::InvalidInput.into()),
        };
        if position < 0 {
            return Err(FsError::InvalidInput.into());
        }
        stream.position = position as u64;
        Ok(position as u64)
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8], position: Option<u64>) -> Result<usize> {
        let stream = self.streams.get_mut(fd).ok_or(FsError::InvalidFd)?;
        let idx = match &mut stream.origin {
            StreamOrigin::Memory(fallback) => return fallback.read(buf, position),
            StreamOrigin::Host(idx) => *idx,
        };
        let file = self.shared.file(idx).ok_or(FsError::InvalidFd)?;
        let effective = match position {
            Some(p) => Some(p),
            None if stream.seekable => Some(stream.position),
            None => None,
        };
        let bytes_read = match effective {
            Some(p) => read_at(file, buf, p)?,
            None => {
                let mut file = file;
                file.read(buf)?
            }
        };
        if position.is_none() && stream.seekable {
            stream.position += bytes_read as u64;
        }
        Ok(bytes_read)
    }

    fn write(&mut self, fd: Fd, buf: &[u8], position: Option<u64>) -> Result<usize> {
        let stream = self.streams.get_mut(fd).ok_or(FsError::InvalidFd)?;
        let idx = match &mut stream.origin {
            StreamOrigin::Memory(fallback) => return fallback.write(buf, position),
            StreamOrigin::Host(idx) => *idx,
        };
        let file = self.shared.file(idx).ok_or(FsError::InvalidFd)?;

        if stream.flags.contains(OpenFlags::APPEND) {
            // force the cursor to the end of file; the descriptor itself
            // carries the host's append mode, so the bytes land at the
            // then-current end regardless of any supplied position
            stream.position = file.metadata()?.len();
            let bytes_written = {
                let mut file = file;
                file.write(buf)?
            };
            if position.is_none() && stream.seekable {
                stream.position += bytes_written as u64;
            }
            return Ok(bytes_written);
        }

        let effective = match position {
            Some(p) => Some(p),
            None if stream.seekable => Some(stream.position),
            None => None,
        };
        let bytes_written = match effective {
            Some(p) => write_at(file, buf, p)?,
            None => {
                let mut file = file;
                file.write(buf)?
            }
        };
        if position.is_none() && stream.seekable {
            stream.position += bytes_written as u64;
        }
        Ok(bytes_written)
    }

    fn allocate(&mut self, _fd: Fd, _offset: u64, _len: u64) -> Result<()> {
        Err(FsError::Unsupported.into())
    }

    fn mmap(
        &mut self,
        fd: Fd,
        heap: &mut dyn GuestHeap,
        length: usize,
        position: u64,
        prot: MmapProt,
        flags: MmapFlags,
    ) -> Result<MmapRegion> {
        let stream = self.streams.get_mut(fd).ok_or(FsError::InvalidFd)?;
        let idx = match &mut stream.origin {
            StreamOrigin::Memory(fallback) => {
                return fallback.mmap(heap, length, position, prot, flags)
            }
            StreamOrigin::Host(idx) => *idx,
        };
        let file = self.shared.file(idx).ok_or(FsError::InvalidFd)?;

        // never a real mapping: copy the file contents into a fresh
        // guest-heap region
        let ptr = heap.alloc(length)?;
        let region = heap.region_mut(ptr, length)?;
        let mut filled = 0;
        while filled < length {
            let n = read_at(file, &mut region[filled..], position + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(MmapRegion {
            ptr,
            allocated: true,
        })
    }

    fn msync(&mut self, fd: Fd, buf: &[u8], offset: u64, flags: MmapFlags) -> Result<()> {
        let stream = self.streams.get_mut(fd).ok_or(FsError::InvalidFd)?;
        if let StreamOrigin::Memory(fallback) = &mut stream.origin {
            return fallback.msync(buf, offset, flags);
        }
        // positional write-back; the stream cursor is left untouched
        self.write(fd, buf, Some(offset))?;
        Ok(())
    }

    fn munmap(&mut self, _fd: Fd) -> Result<()> {
        Ok(())
    }

    fn ioctl(&mut self, _fd: Fd, _request: u64) -> Result<i32> {
        Err(FsError::NotATty.into())
    }

    fn fchmod(&mut self, fd: Fd, mode: u32) -> Result<()> {
        let file = self.host_file(fd)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(mode))?;
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = (file, mode);
            Err(FsError::Unsupported.into())
        }
    }

    fn fchown(&mut self, fd: Fd, uid: u32, gid: u32) -> Result<()> {
        let file = self.host_file(fd)?;
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            let ret = unsafe { libc::fchown(file.as_raw_fd(), uid, gid) };
            if ret != 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = (file, uid, gid);
            Err(FsError::Unsupported.into())
        }
    }

    fn ftruncate(&mut self, fd: Fd, len: i64) -> Result<()> {
        // reject before any host call so the file length is untouched
        if len < 0 {
            return Err(FsError::InvalidInput.into());
        }
        let file = self.host_file(fd)?;
        file.set_len(len as u64)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct TestHeap {
        mem: Vec<u8>,
    }

    impl GuestHeap for TestHeap {
        fn alloc(&mut self, len: usize) -> Result<u64> {
            let ptr = self.mem.len() as u64;
            self.mem.resize(self.mem.len() + len, 0);
            Ok(ptr)
        }

        fn region_mut(&mut self, ptr: u64, len: usize) -> Result<&mut [u8]> {
            let start = ptr as usize;
            self.mem
                .get_mut(start..start + len)
                .ok_or_else(|| FsError::InvalidInput.into())
        }
    }

    #[cfg(target_os = "linux")]
    fn open_host_descriptors() -> usize {
        fs::read_dir("/proc/self/fd").unwrap().count()
    }

    #[test]
    fn sequential_io_advances_the_cursor() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file.txt");

        let mut rawfs = RawFs::new();
        let fd = rawfs.open_symbolic(&path, "w", 0o644).unwrap();
        assert_eq!(rawfs.write(fd, b"hello world", None).unwrap(), 11);
        assert_eq!(rawfs.stream(fd).unwrap().position, 11);
        rawfs.close(fd).unwrap();

        let fd = rawfs.open_symbolic(&path, "r", 0).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(rawfs.read(fd, &mut buf, None).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(rawfs.stream(fd).unwrap().position, 5);
        rawfs.close(fd).unwrap();
    }

    #[test]
    fn explicit_position_leaves_the_cursor_untouched() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file.txt");
        fs::write(&path, b"abcdef").unwrap();

        let mut rawfs = RawFs::new();
        let fd = rawfs.open_symbolic(&path, "r+", 0).unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(rawfs.read(fd, &mut buf, Some(2)).unwrap(), 3);
        assert_eq!(&buf, b"cde");
        assert_eq!(rawfs.stream(fd).unwrap().position, 0);

        assert_eq!(rawfs.write(fd, b"XY", Some(1)).unwrap(), 2);
        assert_eq!(rawfs.stream(fd).unwrap().position, 0);
        assert_eq!(fs::read(&path).unwrap(), b"aXYdef");

        rawfs.close(fd).unwrap();
    }

    #[test]
    fn directory_flag_on_a_regular_file_fails_without_leaking() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file.txt");
        fs::write(&path, b"").unwrap();

        let mut rawfs = RawFs::new();
        #[cfg(target_os = "linux")]
        let before = open_host_descriptors();

        let err = rawfs
            .open(&path, OpenFlags::DIRECTORY, 0)
            .expect_err("a regular file is not a directory");
        assert_eq!(err, FsError::NotADirectory);

        #[cfg(target_os = "linux")]
        assert_eq!(open_host_descriptors(), before, "host descriptor leaked");
    }

    #[test]
    fn opening_a_directory_with_the_directory_flag_succeeds() {
        let temp = TempDir::new().unwrap();

        let mut rawfs = RawFs::new();
        let fd = rawfs.open(temp.path(), OpenFlags::DIRECTORY, 0).unwrap();
        let stream = rawfs.stream(fd).unwrap();
        assert!(stream.node.as_ref().unwrap().is_dir());
        rawfs.close(fd).unwrap();
    }

    #[test]
    fn negative_truncate_is_rejected_before_touching_the_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file.txt");
        fs::write(&path, b"hello").unwrap();

        let mut rawfs = RawFs::new();
        let fd = rawfs.open_symbolic(&path, "r+", 0).unwrap();
        assert_eq!(rawfs.ftruncate(fd, -1).unwrap_err(), FsError::InvalidInput);
        assert_eq!(fs::metadata(&path).unwrap().len(), 5);

        rawfs.ftruncate(fd, 2).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 2);
        rawfs.close(fd).unwrap();
    }

    #[test]
    fn readdir_starts_with_the_synthetic_entries() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), b"").unwrap();
        fs::create_dir(temp.path().join("sub")).unwrap();

        let rawfs = RawFs::new();
        let entries = rawfs.readdir(temp.path()).unwrap();
        assert_eq!(&entries[..2], &[".".to_owned(), "..".to_owned()]);
        assert_eq!(entries.len(), 4);
        assert!(entries.contains(&"a.txt".to_owned()));
        assert!(entries.contains(&"sub".to_owned()));
    }

    #[test]
    fn duplicates_release_the_host_descriptor_exactly_once() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file.txt");
        fs::write(&path, b"shared").unwrap();

        let mut rawfs = RawFs::new();
        let first = rawfs.open_symbolic(&path, "r", 0).unwrap();
        let second = rawfs.duplicate(first, None).unwrap();
        let third = rawfs.duplicate(first, None).unwrap();
        assert_ne!(first, second);
        assert_ne!(second, third);

        rawfs.close(first).unwrap();
        rawfs.close(third).unwrap();

        // the remaining duplicate still reaches the host descriptor
        let mut buf = [0u8; 6];
        assert_eq!(rawfs.read(second, &mut buf, Some(0)).unwrap(), 6);
        assert_eq!(&buf, b"shared");

        rawfs.close(second).unwrap();
        assert_eq!(
            rawfs.read(second, &mut buf, Some(0)).unwrap_err(),
            FsError::InvalidFd,
        );
        assert_eq!(rawfs.close(second).unwrap_err(), FsError::InvalidFd);
    }

    #[test]
    fn append_writes_land_at_end_of_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("log.txt");
        fs::write(&path, b"abc").unwrap();

        let mut rawfs = RawFs::new();
        let fd = rawfs.open_symbolic(&path, "a", 0o644).unwrap();

        // point the cursor somewhere else entirely
        rawfs.llseek(fd, 0, SEEK_SET).unwrap();
        assert_eq!(rawfs.write(fd, b"xyz", None).unwrap(), 3);
        assert_eq!(fs::read(&path).unwrap(), b"abcxyz");
        assert_eq!(rawfs.stream(fd).unwrap().position, 6);

        // even an explicit position cannot defeat append mode
        assert_eq!(rawfs.write(fd, b"!", Some(0)).unwrap(), 1);
        assert_eq!(fs::read(&path).unwrap(), b"abcxyz!");

        rawfs.close(fd).unwrap();
    }

    #[test]
    fn seek_rejects_bad_whence_and_negative_positions() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file.txt");
        fs::write(&path, b"0123456789").unwrap();

        let mut rawfs = RawFs::new();
        let fd = rawfs.open_symbolic(&path, "r", 0).unwrap();
        rawfs.llseek(fd, 4, SEEK_SET).unwrap();

        assert_eq!(rawfs.llseek(fd, 0, 7).unwrap_err(), FsError::InvalidInput);
        assert_eq!(rawfs.stream(fd).unwrap().position, 4);

        assert_eq!(
            rawfs.llseek(fd, -5, SEEK_SET).unwrap_err(),
            FsError::InvalidInput,
        );
        assert_eq!(rawfs.stream(fd).unwrap().position, 4);

        assert_eq!(rawfs.llseek(fd, -2, SEEK_END).unwrap(), 8);
        assert_eq!(rawfs.llseek(fd, 1, SEEK_CUR).unwrap(), 9);

        rawfs.close(fd).unwrap();
    }

    #[test]
    fn mmap_copies_and_msync_writes_back() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file.txt");
        fs::write(&path, b"hello world").unwrap();

        let mut rawfs = RawFs::new();
        let mut heap = TestHeap::default();
        let fd = rawfs.open_symbolic(&path, "r+", 0).unwrap();

        let region = rawfs
            .mmap(fd, &mut heap, 5, 6, MmapProt::READ | MmapProt::WRITE, MmapFlags::SHARED)
            .unwrap();
        assert!(region.allocated, "the region is always freshly allocated");
        assert_eq!(heap.region_mut(region.ptr, 5).unwrap(), b"world");

        heap.region_mut(region.ptr, 5).unwrap().copy_from_slice(b"WORLD");
        let mapped = heap.region_mut(region.ptr, 5).unwrap().to_vec();
        rawfs.msync(fd, &mapped, 6, MmapFlags::SHARED).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello WORLD");

        assert!(rawfs.munmap(fd).is_ok(), "munmap never reports failure");
        // the cursor never moved: mmap and msync are positional
        assert_eq!(rawfs.stream(fd).unwrap().position, 0);

        rawfs.close(fd).unwrap();
    }

    #[test]
    fn mmap_past_end_of_file_fills_what_the_host_has() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file.txt");
        fs::write(&path, b"abc").unwrap();

        let mut rawfs = RawFs::new();
        let mut heap = TestHeap::default();
        let fd = rawfs.open_symbolic(&path, "r", 0).unwrap();

        let region = rawfs
            .mmap(fd, &mut heap, 8, 0, MmapProt::READ, MmapFlags::PRIVATE)
            .unwrap();
        assert_eq!(heap.region_mut(region.ptr, 8).unwrap(), b"abc\0\0\0\0\0");

        rawfs.close(fd).unwrap();
    }

    #[test]
    fn allocate_and_ioctl_are_not_modeled() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file.txt");
        fs::write(&path, b"").unwrap();

        let mut rawfs = RawFs::new();
        let fd = rawfs.open_symbolic(&path, "r+", 0).unwrap();
        assert_eq!(rawfs.allocate(fd, 0, 64).unwrap_err(), FsError::Unsupported);
        assert_eq!(rawfs.ioctl(fd, 0x5401).unwrap_err(), FsError::NotATty);
        rawfs.close(fd).unwrap();
    }

    #[test]
    fn resolution_is_bound_to_the_host_inode() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file.txt");
        fs::write(&path, b"id").unwrap();

        let rawfs = RawFs::new();
        let node = rawfs
            .resolve_path(&path, ResolveOptions::default())
            .unwrap();
        assert!(node.is_file());

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            assert_eq!(node.id, fs::metadata(&path).unwrap().ino());
        }

        // identity is stable across repeated resolutions of an unchanged
        // path
        let again = rawfs
            .resolve_path(&path, ResolveOptions::default())
            .unwrap();
        assert_eq!(node.id, again.id);

        let parent = rawfs
            .resolve_path(&path, ResolveOptions { want_parent: true })
            .unwrap();
        assert!(parent.is_dir());
        assert_eq!(parent.path, temp.path());

        let dir_node = rawfs
            .resolve_path(temp.path(), ResolveOptions::default())
            .unwrap();
        let child = rawfs.resolve(&dir_node, "file.txt").unwrap();
        assert_eq!(child.id, node.id);
    }

    #[test]
    fn missing_paths_fail_with_the_translated_host_error() {
        let temp = TempDir::new().unwrap();
        let rawfs = RawFs::new();
        assert_eq!(
            rawfs
                .resolve_path(&temp.path().join("nope"), ResolveOptions::default())
                .unwrap_err(),
            FsError::EntryNotFound,
        );
    }

    #[test]
    fn mknod_dispatches_on_the_file_type_bits() {
        let temp = TempDir::new().unwrap();
        let rawfs = RawFs::new();

        rawfs
            .mknod(&temp.path().join("dir"), S_IFDIR | 0o755)
            .unwrap();
        assert!(temp.path().join("dir").is_dir());

        rawfs
            .mknod(&temp.path().join("file"), crate::node::S_IFREG | 0o644)
            .unwrap();
        assert!(temp.path().join("file").is_file());
        assert_eq!(fs::metadata(temp.path().join("file")).unwrap().len(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn chmod_and_fchmod_change_permission_bits() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file.txt");
        fs::write(&path, b"").unwrap();

        let mut rawfs = RawFs::new();
        rawfs.chmod(&path, 0o600).unwrap();
        assert_eq!(
            fs::metadata(&path).unwrap().permissions().mode() & 0o777,
            0o600,
        );

        let fd = rawfs.open_symbolic(&path, "r+", 0).unwrap();
        rawfs.fchmod(fd, 0o644).unwrap();
        assert_eq!(
            fs::metadata(&path).unwrap().permissions().mode() & 0o777,
            0o644,
        );
        rawfs.close(fd).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn nofollow_refuses_to_open_through_a_symlink() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("target.txt");
        let link = temp.path().join("link");
        fs::write(&target, b"behind").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let mut rawfs = RawFs::new();
        assert_eq!(
            rawfs.open(&link, OpenFlags::NOFOLLOW, 0).unwrap_err(),
            FsError::FilesystemLoop,
        );

        // the flag only rejects a symlink final component
        let fd = rawfs.open(&target, OpenFlags::NOFOLLOW, 0).unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(rawfs.read(fd, &mut buf, None).unwrap(), 6);
        assert_eq!(&buf, b"behind");
        rawfs.close(fd).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn reinstalling_standard_streams_fails_cleanly() {
        let mut rawfs = RawFs::new();
        rawfs.install_standard_streams().unwrap();

        #[cfg(target_os = "linux")]
        let before = open_host_descriptors();

        assert_eq!(
            rawfs.install_standard_streams().unwrap_err(),
            FsError::AlreadyExists,
        );

        #[cfg(target_os = "linux")]
        assert_eq!(open_host_descriptors(), before, "host descriptor stranded");
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_round_trip_through_the_host() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("target.txt");
        let link = temp.path().join("link");
        fs::write(&target, b"t").unwrap();

        let rawfs = RawFs::new();
        rawfs.symlink(&target, &link).unwrap();
        assert_eq!(rawfs.readlink(&link).unwrap(), target);

        assert!(rawfs.lstat(&link).unwrap().ft.is_symlink());
        assert!(rawfs.stat(&link).unwrap().is_file());
    }

    #[test]
    fn utime_sets_the_host_timestamps() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file.txt");
        fs::write(&path, b"").unwrap();

        let rawfs = RawFs::new();
        rawfs.utime(&path, 1_500_000_000_000, 1_600_000_000_500).unwrap();

        let metadata = rawfs.stat(&path).unwrap();
        assert_eq!(metadata.accessed / 1_000_000_000, 1_500_000_000);
        assert_eq!(metadata.modified / 1_000_000_000, 1_600_000_000);
    }

    #[test]
    fn long_path_segments_are_truncated_for_the_host_only() {
        let long = "x".repeat(300);
        let truncated = truncate_segments(Path::new(&format!("/tmp/{long}/file")));
        assert_eq!(
            truncated,
            Path::new(&format!("/tmp/{}/file", "x".repeat(255))),
        );

        // multibyte segments are cut on a character boundary
        let wide = "é".repeat(200); // 400 bytes
        let truncated = truncate_segments(Path::new(&wide));
        let segment = truncated.to_str().unwrap();
        assert!(segment.len() <= 255);
        assert_eq!(segment.len(), 254, "255 splits the two-byte character");

        let short = Path::new("/a/b/c");
        assert_eq!(truncate_segments(short), short);
    }

    #[cfg(unix)]
    #[test]
    fn standard_streams_are_preregistered() {
        let mut rawfs = RawFs::new();
        rawfs.install_standard_streams().unwrap();

        let stdin = rawfs.stream(Fd(0)).unwrap();
        assert!(stdin.tty);
        assert!(!stdin.seekable);
        assert!(!stdin.flags.is_write());

        for fd in [Fd(1), Fd(2)] {
            let stream = rawfs.stream(fd).unwrap();
            assert!(stream.tty);
            assert!(!stream.seekable);
            assert_eq!(stream.flags.bits(), 577);
        }

        // the table is occupied: the next open lands on descriptor 3
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file.txt");
        fs::write(&path, b"").unwrap();
        let fd = rawfs.open_symbolic(&path, "r", 0).unwrap();
        assert_eq!(fd, Fd(3));
    }

    #[derive(Debug)]
    struct RecordingFallback {
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl crate::FallbackStream for RecordingFallback {
        fn llseek(&mut self, _offset: i64, _whence: i32) -> Result<u64> {
            self.log.borrow_mut().push("llseek");
            Ok(42)
        }

        fn read(&mut self, buf: &mut [u8], _position: Option<u64>) -> Result<usize> {
            self.log.borrow_mut().push("read");
            buf.fill(b'm');
            Ok(buf.len())
        }

        fn write(&mut self, buf: &[u8], _position: Option<u64>) -> Result<usize> {
            self.log.borrow_mut().push("write");
            Ok(buf.len())
        }

        fn mmap(
            &mut self,
            heap: &mut dyn GuestHeap,
            length: usize,
            _position: u64,
            _prot: MmapProt,
            _flags: MmapFlags,
        ) -> Result<MmapRegion> {
            self.log.borrow_mut().push("mmap");
            let ptr = heap.alloc(length)?;
            Ok(MmapRegion {
                ptr,
                allocated: true,
            })
        }

        fn msync(&mut self, _buf: &[u8], _offset: u64, _flags: MmapFlags) -> Result<()> {
            self.log.borrow_mut().push("msync");
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.log.borrow_mut().push("close");
            Ok(())
        }
    }

    #[test]
    fn memory_origin_streams_delegate_every_operation() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut rawfs = RawFs::new();
        let fd = rawfs
            .create_stream(
                StreamSpec {
                    path: PathBuf::from("/mem/file"),
                    flags: OpenFlags::RDWR,
                    position: 0,
                    seekable: true,
                    tty: false,
                    node: None,
                    origin: StreamOrigin::Memory(Box::new(RecordingFallback {
                        log: Rc::clone(&log),
                    })),
                },
                None,
            )
            .unwrap();
        assert!(!rawfs.stream(fd).unwrap().is_host_backed());

        let mut heap = TestHeap::default();
        let mut buf = [0u8; 4];
        assert_eq!(rawfs.llseek(fd, 0, SEEK_SET).unwrap(), 42);
        assert_eq!(rawfs.read(fd, &mut buf, None).unwrap(), 4);
        assert_eq!(&buf, b"mmmm");
        assert_eq!(rawfs.write(fd, b"data", None).unwrap(), 4);
        rawfs.mmap(fd, &mut heap, 4, 0, MmapProt::READ, MmapFlags::PRIVATE).unwrap();
        rawfs.msync(fd, b"data", 0, MmapFlags::SHARED).unwrap();
        rawfs.close(fd).unwrap();

        assert_eq!(
            log.borrow().as_slice(),
            &["llseek", "read", "write", "mmap", "msync", "close"],
        );
    }

    #[test]
    fn duplicating_a_memory_stream_is_not_supported() {
        let mut rawfs = RawFs::new();
        let fd = rawfs
            .create_stream(
                StreamSpec {
                    path: PathBuf::new(),
                    flags: OpenFlags::empty(),
                    position: 0,
                    seekable: false,
                    tty: false,
                    node: None,
                    origin: StreamOrigin::Memory(Box::new(RecordingFallback {
                        log: Rc::default(),
                    })),
                },
                None,
            )
            .unwrap();
        assert_eq!(rawfs.duplicate(fd, None).unwrap_err(), FsError::Unsupported);
    }

    #[test]
    fn cwd_reports_the_host_working_directory() {
        let rawfs = RawFs::new();
        assert_eq!(rawfs.cwd().unwrap(), env::current_dir().unwrap());
    }
}
