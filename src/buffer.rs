use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

/// A reference-counted output buffer that can be shared with a background extraction.
///
/// An extraction pins the buffer from the moment it is submitted until it has finished writing.
/// Meanwhile [`SharedBuffer::lock`] (and everything built on it) blocks, so the bytes can neither
/// be resized nor observed half-written. Clones share the same storage.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    unpinned: Condvar,
}

#[derive(Default)]
struct State {
    bytes: Vec<u8>,
    pinned: bool,
}

impl SharedBuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    bytes,
                    pinned: false,
                }),
                unpinned: Condvar::new(),
            }),
        }
    }

    /// Creates a zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    /// Like [`SharedBuffer::zeroed`], but reports allocation failure instead of aborting.
    pub(crate) fn try_zeroed(len: usize) -> Option<Self> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len).ok()?;
        bytes.resize(len, 0);
        Some(Self::new(bytes))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Locks the buffer, blocking while an extraction has it pinned.
    pub fn lock(&self) -> BufferGuard<'_> {
        let mut state = self.lock_state();
        while state.pinned {
            state = self
                .inner
                .unpinned
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        BufferGuard { state }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        // An extraction never leaves the bytes worse than "partially written", which callers
        // already have to expect after an error.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the buffer as in use by an extraction until the returned pin is dropped.
    ///
    /// Waits for any earlier pin to be released first.
    pub(crate) fn pin(&self) -> BufferPin {
        let mut state = self.lock();
        state.state.pinned = true;
        drop(state);
        BufferPin {
            buffer: self.clone(),
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Returns the bytes if this is the only reference, or gives the buffer back otherwise.
    pub fn try_into_inner(self) -> Result<Vec<u8>, Self> {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => Ok(inner
                .state
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner)
                .bytes),
            Err(inner) => Err(Self { inner }),
        }
    }

    /// Number of live references to the storage, including this one.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Exclusive access to the bytes of a [`SharedBuffer`].
pub struct BufferGuard<'a> {
    state: MutexGuard<'a, State>,
}

impl Deref for BufferGuard<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.state.bytes
    }
}

impl DerefMut for BufferGuard<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.state.bytes
    }
}

/// Keeps a [`SharedBuffer`] reserved for one extraction. Unpins on drop.
pub(crate) struct BufferPin {
    buffer: SharedBuffer,
}

impl BufferPin {
    pub(crate) fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    /// Locks the bytes for the pin holder, ignoring its own pin.
    pub(crate) fn lock(&self) -> BufferGuard<'_> {
        BufferGuard {
            state: self.buffer.lock_state(),
        }
    }
}

impl Drop for BufferPin {
    fn drop(&mut self) {
        self.buffer.lock_state().pinned = false;
        self.buffer.inner.unpinned.notify_all();
    }
}

impl From<Vec<u8>> for SharedBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl PartialEq for SharedBuffer {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        // Only one lock is held at a time.
        let mine = self.to_vec();
        *other.lock() == mine
    }
}

impl Eq for SharedBuffer {}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.len())
            .field("holders", &self.holders())
            .finish()
    }
}
