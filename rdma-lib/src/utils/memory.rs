use std::{alloc::Layout, ptr::NonNull};

use crate::error::{RdmaLibError, Result};

/// A zero-initialised heap allocation with a caller-chosen alignment.
///
/// The buffer never moves, so it can back a memory registration for as long
/// as it is alive.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    pub fn new(len: usize, align: usize) -> Result<Self> {
        if len == 0 {
            return Err(RdmaLibError::Custom("AlignedBuffer: zero length"));
        }
        let layout = Layout::from_size_align(len, align)
            .map_err(|_| RdmaLibError::Custom("AlignedBuffer: invalid layout"))?;
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
            .ok_or(RdmaLibError::Custom("AlignedBuffer: out of memory"))?;
        Ok(Self { ptr, layout })
    }

    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Copies `data` in at `offset`.
    ///
    /// The fabric may be writing the same bytes concurrently. The copy is
    /// bounds checked but not synchronised with remote writers.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ptr.as_ptr().add(offset),
                data.len(),
            )
        };
        Ok(())
    }

    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check_range(offset, out.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset),
                out.as_mut_ptr(),
                out.len(),
            )
        };
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.len()) {
            return Err(RdmaLibError::OutOfBounds {
                offset: offset as u64,
                length: len as u64,
                limit: self.len() as u64,
            });
        }
        Ok(())
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
