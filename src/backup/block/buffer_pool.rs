//! Fixed set of scratch buffers shared by the dump workers.
//!
//! A worker leases a [`BufferSlot`] for the lifetime of one block; leasing
//! blocks while every slot is out, which bounds the memory held by in-flight
//! blocks to `slots × regions × region capacity`.

use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

pub const MIN_REGION_CAPACITY: usize = 4096;

/// `max(block_size × 1.1, 4 KiB)`, leaving headroom for data that grows
/// when compressed and for the cipher's nonce and tag.
pub fn region_capacity(block_size: usize) -> usize {
    (block_size + block_size.div_ceil(10)).max(MIN_REGION_CAPACITY)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    Input,
    Compressed,
    Ciphered,
    Output,
}

impl Region {
    pub fn name(&self) -> &'static str {
        match self {
            Region::Input => "input",
            Region::Compressed => "compressed",
            Region::Ciphered => "ciphered",
            Region::Output => "output",
        }
    }
}

#[derive(Debug, Default)]
pub struct BufferSlot {
    id: usize,
    capacity: usize,
    pub(crate) input: Vec<u8>,
    pub(crate) compressed: Vec<u8>,
    pub(crate) ciphered: Vec<u8>,
    pub(crate) output: Vec<u8>,
}

impl BufferSlot {
    fn new(id: usize, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            input: Vec::with_capacity(capacity),
            compressed: Vec::with_capacity(capacity),
            ciphered: Vec::with_capacity(capacity),
            output: Vec::with_capacity(capacity),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Zeroed input region of `len` bytes for the reader to fill.
    pub fn input_mut(&mut self, len: usize) -> &mut [u8] {
        self.input.clear();
        self.input.resize(len, 0);
        &mut self.input
    }

    pub fn region(&self, region: Region) -> &[u8] {
        match region {
            Region::Input => &self.input,
            Region::Compressed => &self.compressed,
            Region::Ciphered => &self.ciphered,
            Region::Output => &self.output,
        }
    }

    /// Empties every region and gives back memory a failed transform grew.
    fn reset(&mut self) {
        let capacity = self.capacity;
        for region in [
            &mut self.input,
            &mut self.compressed,
            &mut self.ciphered,
            &mut self.output,
        ] {
            region.clear();
            region.shrink_to(capacity);
        }
    }
}

#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<BufferSlot>>,
    returned: Condvar,
    size: usize,
    region_capacity: usize,
}

impl BufferPool {
    pub fn new(size: usize, block_size: usize) -> Self {
        let size = size.max(1);
        let region_capacity = region_capacity(block_size);
        tracing::debug!(
            "Buffer pool: {} slots, {} bytes per region",
            size,
            region_capacity
        );
        Self {
            free: Mutex::new(
                (0..size)
                    .map(|id| BufferSlot::new(id, region_capacity))
                    .collect(),
            ),
            returned: Condvar::new(),
            size,
            region_capacity,
        }
    }

    fn free(&self) -> MutexGuard<'_, Vec<BufferSlot>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn region_capacity(&self) -> usize {
        self.region_capacity
    }

    pub fn available(&self) -> usize {
        self.free().len()
    }

    /// Blocks until a slot is free.
    pub fn lease(&self) -> SlotLease<'_> {
        let mut free = self.free();
        loop {
            if let Some(slot) = free.pop() {
                return SlotLease { pool: self, slot };
            }
            free = self
                .returned
                .wait(free)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn try_lease(&self) -> Option<SlotLease<'_>> {
        self.free().pop().map(|slot| SlotLease { pool: self, slot })
    }

    fn give_back(&self, mut slot: BufferSlot) {
        slot.reset();
        self.free().push(slot);
        self.returned.notify_one();
    }
}

/// Exclusive use of one slot; returned to the pool on drop.
#[derive(Debug)]
pub struct SlotLease<'a> {
    pool: &'a BufferPool,
    slot: BufferSlot,
}

impl Deref for SlotLease<'_> {
    type Target = BufferSlot;

    fn deref(&self) -> &Self::Target {
        &self.slot
    }
}

impl DerefMut for SlotLease<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.slot
    }
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        self.pool.give_back(mem::take(&mut self.slot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::result_error::error::Error;
    use crate::backup::result_error::result::Result;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_region_capacity() {
        assert_eq!(region_capacity(0), MIN_REGION_CAPACITY);
        assert_eq!(region_capacity(1024), MIN_REGION_CAPACITY);
        assert_eq!(region_capacity(1 << 20), (1 << 20) + 104_858);
    }

    #[test]
    fn test_extra_lease_blocks_until_release() {
        let pool = BufferPool::new(2, 1024);
        let first = pool.lease();
        let second = pool.lease();
        assert_ne!(first.id(), second.id());
        assert_eq!(pool.available(), 0);
        assert!(pool.try_lease().is_none());

        let acquired = AtomicBool::new(false);
        thread::scope(|s| {
            let waiter = s.spawn(|| {
                let lease = pool.lease();
                acquired.store(true, Ordering::SeqCst);
                lease.id()
            });
            thread::sleep(Duration::from_millis(100));
            assert!(!acquired.load(Ordering::SeqCst));

            let released = first.id();
            drop(first);
            assert_eq!(waiter.join().unwrap(), released);
        });
        assert!(acquired.load(Ordering::SeqCst));
        drop(second);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_failed_worker_returns_its_slot() {
        let pool = BufferPool::new(1, 1024);
        let work = || -> Result<()> {
            let mut lease = pool.lease();
            lease.input_mut(16).fill(1);
            Err(Error::Aborted)
        };
        assert!(work().is_err());
        assert_eq!(pool.available(), 1);

        let lease = pool.try_lease().unwrap();
        assert!(lease.region(Region::Input).is_empty());
    }

    #[test]
    fn test_grown_region_is_shrunk_on_return() {
        let pool = BufferPool::new(1, 1024);
        {
            let mut lease = pool.lease();
            lease.output.resize(MIN_REGION_CAPACITY * 8, 0);
        }
        let lease = pool.lease();
        assert!(lease.output.capacity() < MIN_REGION_CAPACITY * 8);
        assert!(lease.output.is_empty());
        assert_eq!(lease.capacity(), MIN_REGION_CAPACITY);
    }
}
