use std::mem::size_of;

use crate::block::{BlockHeader, BlockList};
use crate::unique_data::{DataHeader, UniqueData};
use crate::{AllocError, CHUNK_SIZE};

/// Variable-size allocation service over a list of chunked blocks.
///
/// A pool is single-threaded: it belongs to one producer (or sits behind an
/// external lock). The handles it hands out travel freely; releasing one
/// from another thread only touches the owning block's atomic counter.
pub struct Pool {
    blocks: BlockList,
    chunks_per_block: usize,
}

impl Pool {
    /// `initial_blocks >= 1` blocks of `chunks_per_block >= 1` chunks each.
    /// Fails only when the system allocator does.
    pub fn new(initial_blocks: usize, chunks_per_block: usize) -> Result<Pool, AllocError> {
        assert!(initial_blocks >= 1, "a pool needs at least one block");
        assert!(chunks_per_block >= 1, "a block needs at least one chunk");
        // Handle provenance is a u32 byte offset back into the block.
        assert!(
            size_of::<BlockHeader>() + chunks_per_block * CHUNK_SIZE <= u32::MAX as usize,
            "block size exceeds provenance range"
        );

        let blocks =
            BlockList::with_blocks(initial_blocks, chunks_per_block).ok_or(AllocError)?;

        Ok(Pool {
            blocks,
            chunks_per_block,
        })
    }

    #[inline]
    fn chunks_for(size: usize) -> usize {
        (size_of::<DataHeader>() + size + CHUNK_SIZE - 1) / CHUNK_SIZE
    }

    // Probes the current block (resetting it first if it has quiesced),
    // then its successor, then gives up. Never grows the pool.
    fn probe(&mut self, chunks: usize) -> Option<UniqueData> {
        for attempt in 0..2 {
            let block = self.blocks.current_mut();
            block.maybe_reset();

            if let Some((region, chunk_at)) = block.try_acquire(chunks) {
                let block_offset = size_of::<BlockHeader>() + chunk_at * CHUNK_SIZE;
                let capacity = chunks * CHUNK_SIZE;
                return Some(unsafe { UniqueData::init_pool(region, block_offset, capacity) });
            }

            if attempt == 0 {
                self.blocks.advance();
            }
        }

        None
    }

    /// Acquires a handle with room for a `size`-byte payload, or `None` when
    /// the resident blocks are sealed or full.
    pub fn try_acquire(&mut self, size: usize) -> Option<UniqueData> {
        self.probe(Self::chunks_for(size))
    }

    /// Like [`Pool::try_acquire`], but grows the pool by one block on
    /// exhaustion. `None` only when the system allocator fails, or when the
    /// request cannot fit a block at all (use [`Pool::acquire_heap`]).
    pub fn acquire(&mut self, size: usize) -> Option<UniqueData> {
        let chunks = Self::chunks_for(size);

        if let Some(data) = self.probe(chunks) {
            return Some(data);
        }

        self.blocks.grow(self.chunks_per_block)?;
        self.probe(chunks)
    }

    /// Typed-size convenience for [`Pool::try_acquire`].
    pub fn try_acquire_for<T>(&mut self) -> Option<UniqueData> {
        self.try_acquire(size_of::<T>())
    }

    /// Typed-size convenience for [`Pool::acquire`].
    pub fn acquire_for<T>(&mut self) -> Option<UniqueData> {
        self.acquire(size_of::<T>())
    }

    /// One system allocation under the same handle ABI, independent of any
    /// pool instance. For payloads larger than a block, or callers that want
    /// heap storage outright.
    pub fn acquire_heap(size: usize) -> Option<UniqueData> {
        UniqueData::alloc_heap(size)
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn chunks_per_block(&self) -> usize {
        self.chunks_per_block
    }

    /// True when no handle carved from this pool is still alive.
    pub fn is_quiescent(&self) -> bool {
        self.blocks.iter().all(|block| block.is_drained())
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Dropping a pool with live handles frees memory those handles will
        // release into; detected in debug builds only.
        debug_assert!(self.is_quiescent(), "pool dropped with live handles");
    }
}
