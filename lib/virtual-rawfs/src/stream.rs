//! Stream handles, shared host-descriptor state and the guest
//! descriptor table.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use crate::{FallbackStream, FsError, FsNode, OpenFlags};

/// A guest-visible descriptor number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Fd(pub u32);

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Index of a [`SharedState`] slot inside the arena.
///
/// Streams hold the index, never a reference to the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SharedIdx(usize);

/// Reference-counted state around one host descriptor, shared by every
/// duplicate stream over the same open.
#[derive(Debug)]
struct SharedState {
    file: fs::File,
    refcnt: u32,
}

/// Arena of [`SharedState`] entries keyed by [`SharedIdx`].
///
/// The host descriptor is closed exactly once, when the reference count
/// transitions to zero. Counts are plain integers: a backend instance is
/// owned by a single logical thread of control.
#[derive(Debug, Default)]
pub(crate) struct SharedArena {
    slots: Vec<Option<SharedState>>,
    free: Vec<usize>,
}

impl SharedArena {
    /// Adopt a host descriptor. The slot starts with a reference count of
    /// zero; registering a stream over it performs the first retain.
    pub(crate) fn insert(&mut self, file: fs::File) -> SharedIdx {
        let state = SharedState { file, refcnt: 0 };
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(state);
                SharedIdx(index)
            }
            None => {
                self.slots.push(Some(state));
                SharedIdx(self.slots.len() - 1)
            }
        }
    }

    pub(crate) fn retain(&mut self, idx: SharedIdx) {
        if let Some(state) = self.slots.get_mut(idx.0).and_then(Option::as_mut) {
            state.refcnt += 1;
        }
    }

    /// Drop one reference. Returns the host descriptor when the count
    /// reached zero; the caller decides how (and whether) to log the
    /// close.
    pub(crate) fn release(&mut self, idx: SharedIdx) -> Option<fs::File> {
        let slot = self.slots.get_mut(idx.0)?;
        let state = slot.as_mut()?;
        state.refcnt = state.refcnt.saturating_sub(1);
        if state.refcnt > 0 {
            return None;
        }
        let state = slot.take()?;
        self.free.push(idx.0);
        Some(state.file)
    }

    pub(crate) fn file(&self, idx: SharedIdx) -> Option<&fs::File> {
        self.slots
            .get(idx.0)
            .and_then(Option::as_ref)
            .map(|state| &state.file)
    }

    #[cfg(test)]
    pub(crate) fn refcnt(&self, idx: SharedIdx) -> Option<u32> {
        self.slots
            .get(idx.0)
            .and_then(Option::as_ref)
            .map(|state| state.refcnt)
    }
}

/// Where a stream came from; every stream operation dispatches on this
/// tag.
#[derive(Debug)]
pub enum StreamOrigin {
    /// Backed by a host descriptor held in the shared arena.
    Host(SharedIdx),
    /// Created by the in-memory backend; operations are delegated to the
    /// carried object unchanged.
    Memory(Box<dyn FallbackStream>),
}

/// An open stream as registered in the guest descriptor table.
#[derive(Debug)]
pub struct Stream {
    /// The guest descriptor.
    pub fd: Fd,
    /// The externally visible path (never segment-truncated).
    pub path: PathBuf,
    /// The open flags the stream was created with.
    pub flags: OpenFlags,
    /// Cursor position; meaningful only when the stream is seekable and
    /// no explicit position is supplied per call.
    pub position: u64,
    pub seekable: bool,
    /// Attached to a host terminal stream.
    pub tty: bool,
    /// The node descriptor built when the stream was opened, if any.
    /// Standard streams carry none.
    pub node: Option<FsNode>,
    pub(crate) origin: StreamOrigin,
}

impl Stream {
    /// Whether the stream is backed by a host descriptor.
    pub fn is_host_backed(&self) -> bool {
        matches!(self.origin, StreamOrigin::Host(_))
    }
}

/// Everything needed to register a stream.
#[derive(Debug)]
pub struct StreamSpec {
    pub path: PathBuf,
    pub flags: OpenFlags,
    pub position: u64,
    pub seekable: bool,
    pub tty: bool,
    pub node: Option<FsNode>,
    pub origin: StreamOrigin,
}

/// Guest descriptor table: descriptor number to stream.
#[derive(Debug, Default)]
pub(crate) struct StreamTable {
    streams: Vec<Option<Stream>>,
}

impl StreamTable {
    /// Lowest unused descriptor.
    pub(crate) fn next_free(&self) -> Fd {
        for (index, slot) in self.streams.iter().enumerate() {
            if slot.is_none() {
                return Fd(index as u32);
            }
        }
        Fd(self.streams.len() as u32)
    }

    pub(crate) fn insert(&mut self, stream: Stream) -> Result<(), FsError> {
        let index = stream.fd.0 as usize;
        if index >= self.streams.len() {
            self.streams.resize_with(index + 1, || None);
        }
        if self.streams[index].is_some() {
            return Err(FsError::AlreadyExists);
        }
        self.streams[index] = Some(stream);
        Ok(())
    }

    pub(crate) fn get(&self, fd: Fd) -> Option<&Stream> {
        self.streams.get(fd.0 as usize).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, fd: Fd) -> Option<&mut Stream> {
        self.streams.get_mut(fd.0 as usize).and_then(Option::as_mut)
    }

    pub(crate) fn remove(&mut self, fd: Fd) -> Option<Stream> {
        self.streams.get_mut(fd.0 as usize).and_then(Option::take)
    }
}
