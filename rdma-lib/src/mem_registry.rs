//! Fixed-size pinned blocks registered with one protection domain.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::{
    api::{AccessFlags, RegisteredRegion},
    error::{RdmaLibError, Result},
    provider::RdmaProvider,
    utils::memory::AlignedBuffer,
};

/// An aligned buffer and its registration. Deregisters, then frees, on drop.
pub struct PinnedBlock<P: RdmaProvider> {
    provider: P,
    virtual_offset: u64,
    mr: P::Mr,
    region: RegisteredRegion,
    buffer: AlignedBuffer,
}

impl<P: RdmaProvider> PinnedBlock<P> {
    pub fn pin(
        provider: P,
        pd: P::Pd,
        virtual_offset: u64,
        buffer: AlignedBuffer,
        access: AccessFlags,
    ) -> Result<Self> {
        let (mr, region) =
            unsafe { provider.reg_mr(pd, buffer.ptr(), buffer.len(), access)? };
        Ok(Self { provider, virtual_offset, mr, region, buffer })
    }

    pub fn virtual_offset(&self) -> u64 {
        self.virtual_offset
    }

    pub fn region(&self) -> RegisteredRegion {
        self.region
    }

    pub fn buffer(&self) -> &AlignedBuffer {
        &self.buffer
    }
}

impl<P: RdmaProvider> Drop for PinnedBlock<P> {
    fn drop(&mut self) {
        if let Err(e) = self.provider.dereg_mr(self.mr) {
            warn!(offset = self.virtual_offset, error = %e, "Failed to deregister pinned block");
        }
    }
}

/// A pool of `block_length` sized pinned blocks addressed by virtual offset.
///
/// Reservation is a fetch-add on the cursor. Only publishing a registered
/// block into the table takes the lock.
pub struct MemoryRegistry<P: RdmaProvider> {
    provider: P,
    pd: P::Pd,
    block_length: u64,
    max_size: u64,
    alignment: usize,
    next_offset: AtomicU64,
    blocks: RwLock<Vec<Option<PinnedBlock<P>>>>,
}

impl<P: RdmaProvider> MemoryRegistry<P> {
    pub fn new(
        provider: P,
        pd: P::Pd,
        block_length: u64,
        max_size: u64,
        alignment: usize,
    ) -> Result<Self> {
        if block_length == 0 || !alignment.is_power_of_two() {
            return Err(RdmaLibError::Custom("invalid memory registry geometry"));
        }
        let num_blocks = (max_size / block_length) as usize;
        let mut blocks = Vec::new();
        blocks.resize_with(num_blocks, || None);
        Ok(Self {
            provider,
            pd,
            block_length,
            max_size,
            alignment,
            next_offset: AtomicU64::new(0),
            blocks: RwLock::new(blocks),
        })
    }

    pub fn block_length(&self) -> u64 {
        self.block_length
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Allocation cursor: the virtual offset the next block will get.
    pub fn next_offset(&self) -> u64 {
        self.next_offset.load(Ordering::Acquire)
    }

    pub fn allocated_blocks(&self) -> usize {
        self.blocks.read().iter().filter(|b| b.is_some()).count()
    }

    /// Pins one more block and returns its virtual offset.
    ///
    /// # Panics
    ///
    /// Panics if the reserved table slot is already populated.
    pub fn allocate_next_block(&self, access: AccessFlags) -> Result<u64> {
        let start = self.next_offset.fetch_add(self.block_length, Ordering::AcqRel);
        if start + self.block_length > self.max_size {
            self.next_offset.fetch_sub(self.block_length, Ordering::AcqRel);
            return Err(RdmaLibError::AllocationExhausted {
                offset: start,
                requested: self.block_length,
                max: self.max_size,
            });
        }

        let buffer = AlignedBuffer::new(self.block_length as usize, self.alignment)?;
        let block =
            PinnedBlock::pin(self.provider.clone(), self.pd, start, buffer, access)?;
        debug!(offset = start, region = ?block.region(), "Pinned memory block");

        let index = (start / self.block_length) as usize;
        let mut blocks = self.blocks.write();
        assert!(blocks[index].is_none(), "memory block {index} populated twice");
        blocks[index] = Some(block);
        Ok(start)
    }

    /// Looks up the region of the block containing `virtual_offset`.
    ///
    /// Only whole fixed-length blocks are served: a `length` other than the
    /// block length, or `fixed == false`, is reported as not found.
    pub fn get_pinned_mr(
        &self,
        virtual_offset: u64,
        length: u64,
        fixed: bool,
    ) -> Option<RegisteredRegion> {
        if !fixed || length != self.block_length {
            return None;
        }
        if virtual_offset >= self.next_offset() {
            return None;
        }
        let index = (virtual_offset / self.block_length) as usize;
        self.blocks.read().get(index)?.as_ref().map(|b| b.region())
    }

    /// Copies `data` into the block at `virtual_offset`, `offset` bytes in.
    pub fn write_block(&self, virtual_offset: u64, offset: usize, data: &[u8]) -> Result<()> {
        self.with_block(virtual_offset, |block| block.buffer().write_at(offset, data))
    }

    pub fn read_block(&self, virtual_offset: u64, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.with_block(virtual_offset, |block| block.buffer().read_at(offset, &mut out))?;
        Ok(out)
    }

    fn with_block<T>(
        &self,
        virtual_offset: u64,
        f: impl FnOnce(&PinnedBlock<P>) -> Result<T>,
    ) -> Result<T> {
        let index = (virtual_offset / self.block_length) as usize;
        let blocks = self.blocks.read();
        let block = blocks
            .get(index)
            .and_then(|b| b.as_ref())
            .ok_or(RdmaLibError::Custom("memory block is not pinned"))?;
        f(block)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, thread};

    use super::*;
    use crate::loopback::{FabricOp, LoopbackFabric};

    const BLOCK: u64 = 4096;

    fn registry(fabric: &LoopbackFabric, blocks: u64) -> MemoryRegistry<LoopbackFabric> {
        let ctx = fabric.open_device("lo0");
        let pd = fabric.alloc_pd(ctx).unwrap();
        MemoryRegistry::new(fabric.clone(), pd, BLOCK, blocks * BLOCK, 64).unwrap()
    }

    #[test]
    fn test_allocate_and_lookup() {
        let fabric = LoopbackFabric::new();
        let reg = registry(&fabric, 4);
        let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ;
        assert_eq!(reg.allocate_next_block(access).unwrap(), 0);
        assert_eq!(reg.allocate_next_block(access).unwrap(), BLOCK);

        let region = reg.get_pinned_mr(BLOCK, BLOCK, true).unwrap();
        assert_eq!(region.length, BLOCK);
        assert!(region.addr.is_multiple_of(64));
        // Any offset inside the block resolves to it.
        assert_eq!(reg.get_pinned_mr(BLOCK + 100, BLOCK, true), Some(region));
        assert_ne!(reg.get_pinned_mr(0, BLOCK, true), Some(region));

        assert_eq!(reg.get_pinned_mr(2 * BLOCK, BLOCK, true), None);
        assert_eq!(reg.get_pinned_mr(0, BLOCK / 2, true), None);
        assert_eq!(reg.get_pinned_mr(0, BLOCK, false), None);
    }

    #[test]
    fn test_exhaustion_leaves_cursor() {
        let fabric = LoopbackFabric::new();
        let reg = registry(&fabric, 2);
        reg.allocate_next_block(AccessFlags::LOCAL_WRITE).unwrap();
        reg.allocate_next_block(AccessFlags::LOCAL_WRITE).unwrap();
        let cursor = reg.next_offset();
        for _ in 0..3 {
            assert!(matches!(
                reg.allocate_next_block(AccessFlags::LOCAL_WRITE),
                Err(RdmaLibError::AllocationExhausted { .. })
            ));
            assert_eq!(reg.next_offset(), cursor);
        }
        assert_eq!(reg.allocated_blocks(), 2);
    }

    #[test]
    fn test_concurrent_allocations_are_disjoint() {
        const MAX_BLOCKS: u64 = 16;
        let fabric = LoopbackFabric::new();
        let reg = Arc::new(registry(&fabric, MAX_BLOCKS));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                thread::spawn(move || {
                    (0..4)
                        .filter_map(|_| reg.allocate_next_block(AccessFlags::LOCAL_WRITE).ok())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let offsets: Vec<u64> =
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        assert_eq!(offsets.len() as u64, MAX_BLOCKS);
        let unique: HashSet<_> = offsets.iter().copied().collect();
        assert_eq!(unique.len(), offsets.len());
        assert!(offsets.iter().all(|o| o % BLOCK == 0 && *o < MAX_BLOCKS * BLOCK));
        assert_eq!(reg.next_offset(), MAX_BLOCKS * BLOCK);
    }

    #[test]
    fn test_block_copies_and_drop_deregisters() {
        let fabric = LoopbackFabric::new();
        let reg = registry(&fabric, 2);
        let offset = reg.allocate_next_block(AccessFlags::LOCAL_WRITE).unwrap();
        reg.write_block(offset, 10, b"pinned").unwrap();
        assert_eq!(reg.read_block(offset, 10, 6).unwrap(), b"pinned");
        assert!(reg.write_block(offset, BLOCK as usize - 2, b"xyz").is_err());
        assert!(reg.read_block(BLOCK, 0, 1).is_err());

        let mr_count = fabric.live_mrs();
        drop(reg);
        assert_eq!(fabric.live_mrs(), mr_count - 1);
        assert!(fabric.journal().iter().any(|op| matches!(op, FabricOp::DeregMr(_))));
    }
}
