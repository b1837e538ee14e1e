//! Memory-mapped buffer pool shared with the driver.
//!
//! Slots live in a fixed arena addressed by index. Each slot carries an
//! explicit ownership state; the pool is the only place that changes it:
//!
//! ```text
//!   FreeInKernel ──queue──> QueuedToKernel ──grab──> OwnedByApplication
//!        ▲                        ▲                          │
//!        └──── stream off ────────┴────────── release ───────┘
//! ```

use crate::driver::{Driver, Mapping};
use crate::error::{CameraError, Result};

/// Pool depth. The acquisition protocol assumes double buffering.
pub const BUFFER_COUNT: u32 = 2;

/// Who owns a buffer slot right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Allocated and mapped, not on the driver's incoming queue.
    FreeInKernel,
    /// On the driver's queue, waiting to be filled.
    QueuedToKernel,
    /// Dequeued by a grab; the application may read it until release.
    OwnedByApplication,
}

struct Slot {
    index: u32,
    mapping: Mapping,
    state: SlotState,
}

pub struct BufferPool {
    slots: Vec<Slot>,
}

impl BufferPool {
    /// Request `count` buffers and map every one of them.
    ///
    /// Nothing stays mapped or allocated when this fails.
    pub fn allocate(driver: &impl Driver, count: u32) -> Result<Self> {
        let granted = driver
            .request_buffers(count)
            .map_err(|e| CameraError::BufferAllocationFailed(format!("VIDIOC_REQBUFS: {e}")))?;
        if granted < count {
            release_driver_buffers(driver);
            return Err(CameraError::BufferAllocationFailed(format!(
                "driver granted {granted} of {count} buffers"
            )));
        }

        let mut slots = Vec::with_capacity(count as usize);
        for index in 0..count {
            match driver.map_buffer(index) {
                Ok(mapping) => slots.push(Slot {
                    index,
                    mapping,
                    state: SlotState::FreeInKernel,
                }),
                Err(e) => {
                    for slot in slots.drain(..) {
                        if let Err(unmap_err) = driver.unmap_buffer(slot.mapping) {
                            tracing::warn!(index = slot.index, error = %unmap_err, "unmap during unwind failed");
                        }
                    }
                    release_driver_buffers(driver);
                    return Err(CameraError::BufferAllocationFailed(format!(
                        "mapping buffer {index}: {e}"
                    )));
                }
            }
        }

        tracing::debug!(count, "buffer pool mapped");
        Ok(Self { slots })
    }

    /// Unmap every slot and give the buffers back to the driver.
    ///
    /// Streaming must already be off. Every slot is unmapped even if one
    /// fails; the first error is returned.
    pub fn deallocate(&mut self, driver: &impl Driver) -> Result<()> {
        if self.slots.is_empty() {
            return Ok(());
        }

        let mut first_err = None;
        for slot in self.slots.drain(..) {
            if let Err(e) = driver.unmap_buffer(slot.mapping) {
                tracing::warn!(index = slot.index, error = %e, "munmap failed");
                first_err.get_or_insert(CameraError::io("munmap", e));
            }
        }
        if let Err(e) = driver.release_buffers() {
            first_err.get_or_insert(CameraError::io("VIDIOC_REQBUFS(0)", e));
        }
        tracing::debug!("buffer pool released");
        first_err.map_or(Ok(()), Err)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn state(&self, index: u32) -> Option<SlotState> {
        self.slot(index).map(|s| s.state)
    }

    pub fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|s| s.state == state).count()
    }

    fn slot(&self, index: u32) -> Option<&Slot> {
        self.slots.get(index as usize)
    }

    fn slot_mut(&mut self, index: u32) -> Option<&mut Slot> {
        self.slots.get_mut(index as usize)
    }

    /// Queue every free slot; called right before the stream is switched on.
    pub fn queue_free(&mut self, driver: &impl Driver) -> Result<()> {
        for slot in self.slots.iter_mut().filter(|s| s.state == SlotState::FreeInKernel) {
            driver
                .queue_buffer(slot.index)
                .map_err(|e| CameraError::io("VIDIOC_QBUF", e))?;
            slot.state = SlotState::QueuedToKernel;
        }
        Ok(())
    }

    /// Record that the driver handed back `index` (QueuedToKernel → OwnedByApplication).
    pub fn claim(&mut self, index: u32) -> Result<()> {
        let slot = self
            .slot_mut(index)
            .ok_or(CameraError::InvalidBufferIndex(index))?;
        if slot.state != SlotState::QueuedToKernel {
            return Err(CameraError::InvalidBufferIndex(index));
        }
        slot.state = SlotState::OwnedByApplication;
        Ok(())
    }

    /// Give an application-owned slot back to the driver.
    pub fn release(&mut self, driver: &impl Driver, index: u32) -> Result<()> {
        let slot = self
            .slot_mut(index)
            .ok_or(CameraError::InvalidBufferIndex(index))?;
        if slot.state != SlotState::OwnedByApplication {
            return Err(CameraError::InvalidBufferIndex(index));
        }
        // Ownership moves only once the driver accepted the buffer.
        driver
            .queue_buffer(index)
            .map_err(|e| CameraError::io("VIDIOC_QBUF", e))?;
        slot.state = SlotState::QueuedToKernel;
        Ok(())
    }

    /// After STREAMOFF the driver has dropped its queue: every slot is free.
    pub fn reclaim_all(&mut self) {
        for slot in &mut self.slots {
            slot.state = SlotState::FreeInKernel;
        }
    }

    /// Mapped bytes of an application-owned slot.
    pub fn data(&self, index: u32, len: usize) -> Result<&[u8]> {
        match self.slot(index) {
            Some(slot) if slot.state == SlotState::OwnedByApplication => Ok(slot.mapping.bytes(len)),
            _ => Err(CameraError::InvalidBufferIndex(index)),
        }
    }

    /// Mapped length of a slot.
    pub fn capacity(&self, index: u32) -> Option<usize> {
        self.slot(index).map(|s| s.mapping.len())
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if !self.slots.is_empty() {
            tracing::error!(
                mapped = self.slots.len(),
                "buffer pool dropped while still mapped"
            );
        }
    }
}

fn release_driver_buffers(driver: &impl Driver) {
    if let Err(e) = driver.release_buffers() {
        tracing::warn!(error = %e, "VIDIOC_REQBUFS(0) failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;

    #[test]
    fn test_allocate_maps_all_slots() {
        let mock = MockDriver::new();
        let mut pool = BufferPool::allocate(&mock, BUFFER_COUNT).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.count(SlotState::FreeInKernel), 2);
        assert_eq!(mock.live_mappings(), 2);
        pool.deallocate(&mock).unwrap();
        assert_eq!(mock.live_mappings(), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_short_grant_fails() {
        let mock = MockDriver::new().with_buffer_grant(1);
        let err = BufferPool::allocate(&mock, BUFFER_COUNT).err().unwrap();
        assert!(matches!(err, CameraError::BufferAllocationFailed(_)));
        assert_eq!(mock.live_mappings(), 0);
        assert_eq!(mock.allocated_buffers(), 0);
    }

    #[test]
    fn test_map_failure_unwinds() {
        let mock = MockDriver::new().with_map_failure_at(1);
        let err = BufferPool::allocate(&mock, BUFFER_COUNT).err().unwrap();
        assert!(matches!(err, CameraError::BufferAllocationFailed(_)));
        assert_eq!(mock.live_mappings(), 0);
        assert_eq!(mock.allocated_buffers(), 0);
    }

    #[test]
    fn test_ownership_transitions() {
        let mock = MockDriver::new();
        let mut pool = BufferPool::allocate(&mock, BUFFER_COUNT).unwrap();
        pool.queue_free(&mock).unwrap();
        assert_eq!(pool.count(SlotState::QueuedToKernel), 2);
        mock.stream_on().unwrap();

        let first = mock.dequeue_buffer().unwrap().unwrap().index;
        let other = 1 - first;
        pool.claim(first).unwrap();
        assert_eq!(pool.state(first), Some(SlotState::OwnedByApplication));
        assert!(pool.data(first, 4).is_ok());
        assert!(matches!(pool.data(other, 4), Err(CameraError::InvalidBufferIndex(_))));

        pool.release(&mock, first).unwrap();
        assert_eq!(pool.state(first), Some(SlotState::QueuedToKernel));
        assert!(matches!(pool.release(&mock, first), Err(CameraError::InvalidBufferIndex(_))));
        assert!(matches!(pool.release(&mock, 7), Err(CameraError::InvalidBufferIndex(7))));
        assert!(matches!(pool.claim(5), Err(CameraError::InvalidBufferIndex(5))));

        mock.stream_off().unwrap();
        pool.reclaim_all();
        assert_eq!(pool.count(SlotState::FreeInKernel), 2);
        pool.deallocate(&mock).unwrap();
    }

    #[test]
    fn test_failed_requeue_keeps_application_ownership() {
        let mock = MockDriver::new();
        let mut pool = BufferPool::allocate(&mock, BUFFER_COUNT).unwrap();
        pool.queue_free(&mock).unwrap();
        mock.stream_on().unwrap();
        let index = mock.dequeue_buffer().unwrap().unwrap().index;
        pool.claim(index).unwrap();
        mock.fail_next_queue(libc::EIO);
        assert!(matches!(pool.release(&mock, index), Err(CameraError::Io { .. })));
        assert_eq!(pool.state(index), Some(SlotState::OwnedByApplication));
        pool.release(&mock, index).unwrap();
        mock.stream_off().unwrap();
        pool.reclaim_all();
        pool.deallocate(&mock).unwrap();
    }
}
