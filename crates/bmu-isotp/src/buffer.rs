//! Fixed-capacity message buffers
//!
//! Capacity is chosen once at construction. Every write is bounds-checked
//! against it; the storage never grows.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Write of {requested} bytes at offset {offset} exceeds capacity {capacity}")]
pub struct CapacityError {
    pub offset: usize,
    pub requested: usize,
    pub capacity: usize,
}

/// Owned byte buffer with a fixed capacity and a fill level
#[derive(Debug, Clone)]
pub struct FixedBuffer {
    storage: Box<[u8]>,
    len: usize,
}

impl FixedBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Replace the contents with `data`. On error the buffer is unchanged.
    pub fn fill_from(&mut self, data: &[u8]) -> Result<(), CapacityError> {
        let capacity = self.storage.len();
        let dest = self.storage.get_mut(..data.len()).ok_or(CapacityError {
            offset: 0,
            requested: data.len(),
            capacity,
        })?;
        dest.copy_from_slice(data);
        self.len = data.len();
        Ok(())
    }

    /// Write `data` at `offset`, extending the fill level if needed.
    /// On error the buffer is unchanged.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<(), CapacityError> {
        let capacity = self.storage.len();
        let end = offset.checked_add(data.len()).filter(|&end| end <= capacity);
        let Some(end) = end else {
            return Err(CapacityError {
                offset,
                requested: data.len(),
                capacity,
            });
        };
        self.storage[offset..end].copy_from_slice(data);
        self.len = self.len.max(end);
        Ok(())
    }

    /// Filled portion of the buffer
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[..self.len]
    }

    /// A sub-range of the filled portion, or `None` if out of range
    pub fn get(&self, range: std::ops::Range<usize>) -> Option<&[u8]> {
        self.as_slice().get(range)
    }
}
