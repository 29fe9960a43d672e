//! Buffer registry
//!
//! Maps tensor names to the device buffers backing them and owns those
//! buffers. Both maps live behind one mutex: every insert, lookup and
//! release takes the lock, so a name and its buffer are always added and
//! removed together. Callers receive `Arc<Mutex<DeviceBuffer>>` handles and
//! lock the buffer itself only for transfers.

use crate::buffer::DeviceBuffer;
use crate::error::{DpuError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

/// Shared handle to a registered buffer
pub type BufferHandle = Arc<Mutex<DeviceBuffer>>;

/// Registry-assigned buffer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

#[derive(Debug, Default)]
struct Inner {
    by_tensor: HashMap<String, BufferId>,
    owned: HashMap<BufferId, BufferHandle>,
    next_id: u64,
}

/// Tensor-to-buffer map plus buffer ownership, guarded by one lock
#[derive(Debug, Default)]
pub struct BufferRegistry {
    inner: Mutex<Inner>,
}

impl BufferRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| DpuError::invalid_state("buffer registry lock poisoned"))
    }

    /// Take ownership of `buffer` and bind it to `tensor`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if `tensor` is already bound.
    pub fn register(&self, tensor: impl Into<String>, buffer: DeviceBuffer) -> Result<(BufferId, BufferHandle)> {
        let tensor = tensor.into();
        let mut inner = self.lock()?;
        if inner.by_tensor.contains_key(&tensor) {
            return Err(DpuError::invalid_state(format!("tensor '{tensor}' already has a buffer")));
        }
        let id = BufferId(inner.next_id);
        inner.next_id += 1;
        let handle = Arc::new(Mutex::new(buffer));
        inner.owned.insert(id, Arc::clone(&handle));
        trace!("Registered '{tensor}' as buffer {}", id.0);
        inner.by_tensor.insert(tensor, id);
        Ok((id, handle))
    }

    /// Buffer bound to `tensor`
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the lock is poisoned.
    pub fn get(&self, tensor: &str) -> Result<Option<BufferHandle>> {
        let inner = self.lock()?;
        Ok(inner
            .by_tensor
            .get(tensor)
            .and_then(|id| inner.owned.get(id))
            .cloned())
    }

    /// Unbind `tensor` and drop the registry's ownership of its buffer.
    ///
    /// The device memory is freed once the last outstanding handle drops.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the lock is poisoned.
    pub fn release(&self, tensor: &str) -> Result<Option<BufferHandle>> {
        let mut inner = self.lock()?;
        let Some(id) = inner.by_tensor.remove(tensor) else {
            return Ok(None);
        };
        trace!("Released '{tensor}' (buffer {})", id.0);
        Ok(inner.owned.remove(&id))
    }

    /// Number of owned buffers
    pub fn len(&self) -> usize {
        self.inner.lock().map_or(0, |inner| inner.owned.len())
    }

    /// Whether no buffer is owned
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `tensor` is bound
    pub fn contains(&self, tensor: &str) -> bool {
        self.inner
            .lock()
            .is_ok_and(|inner| inner.by_tensor.contains_key(tensor))
    }
}
