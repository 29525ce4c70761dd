//! Guest-facing open and mmap flags.
//!
//! The numeric values are the ones the guest ABI uses, independent of the
//! host platform; they are normalized to host semantics when a host call
//! is made.

use bitflags::bitflags;

use crate::{BackendError, FsError, Result};

/// `SEEK_SET`
pub const SEEK_SET: i32 = 0;
/// `SEEK_CUR`
pub const SEEK_CUR: i32 = 1;
/// `SEEK_END`
pub const SEEK_END: i32 = 2;

bitflags! {
    /// Open flags in the guest's numeric encoding.
    ///
    /// `O_RDONLY` is the zero access mode and therefore not a flag; use
    /// [`OpenFlags::is_read`] / [`OpenFlags::is_write`] to inspect the
    /// access mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0o1;
        const RDWR = 0o2;
        const CREAT = 0o100;
        const EXCL = 0o200;
        const TRUNC = 0o1000;
        const APPEND = 0o2000;
        const DIRECTORY = 0o200000;
        const NOFOLLOW = 0o400000;
    }
}

const ACCMODE: u32 = 0o3;

impl OpenFlags {
    /// Normalize a symbolic mode string (`"r"`, `"r+"`, `"w"`, `"w+"`,
    /// `"a"`, `"a+"`) to its numeric encoding.
    pub fn from_symbolic(mode: &str) -> Result<Self> {
        let flags = match mode {
            "r" => Self::empty(),
            "r+" => Self::RDWR,
            "w" => Self::TRUNC | Self::CREAT | Self::WRONLY,
            "w+" => Self::TRUNC | Self::CREAT | Self::RDWR,
            "a" => Self::APPEND | Self::CREAT | Self::WRONLY,
            "a+" => Self::APPEND | Self::CREAT | Self::RDWR,
            _ => return Err(BackendError::Fs(FsError::InvalidInput)),
        };
        Ok(flags)
    }

    pub fn is_read(self) -> bool {
        self.bits() & ACCMODE != Self::WRONLY.bits()
    }

    pub fn is_write(self) -> bool {
        self.bits() & ACCMODE != 0
    }
}

bitflags! {
    /// Memory protection bits for [`mmap`](crate::StreamOps::mmap).
    ///
    /// Carried through opaquely; the mapping is always emulated by copy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MmapProt: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

bitflags! {
    /// Mapping flags for [`mmap`](crate::StreamOps::mmap) and
    /// [`msync`](crate::StreamOps::msync).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MmapFlags: u32 {
        const SHARED = 0x01;
        const PRIVATE = 0x02;
        const ANONYMOUS = 0x20;
    }
}
