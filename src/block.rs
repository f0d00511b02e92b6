use std::alloc::{alloc, dealloc, Layout};
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::CHUNK_SIZE;

// Cross-thread part of a block, placed at the base of its allocation so a
// handle can walk back to it by offset alone. `acquired` counts live
// allocations carved from the block; it is the only field ever touched from
// a thread other than the pool owner.
#[repr(C, align(64))]
pub(crate) struct BlockHeader {
    acquired: AtomicUsize,
}

impl BlockHeader {
    // Called by any thread dropping a handle carved from this block.
    #[inline]
    pub(crate) fn release(&self) {
        self.acquired.fetch_sub(1, Ordering::Release);
    }

    #[inline]
    pub(crate) fn outstanding(&self) -> usize {
        self.acquired.load(Ordering::Acquire)
    }
}

// A fixed-capacity arena of `num_chunks` chunks of CHUNK_SIZE bytes, bump
// allocated. The bump cursor and the sealed flag are owner-thread state and
// live here rather than in the shared header; only `acquired` is shared.
pub(crate) struct Block {
    header: NonNull<BlockHeader>,
    num_chunks: usize,
    // Bump position in chunks, 0..=num_chunks.
    offset: usize,
    // Once sealed, no allocation succeeds until every outstanding handle is
    // released and maybe_reset runs.
    sealed: bool,
}

unsafe impl Send for Block {}

impl Block {
    // One allocation holds the header and the chunk area; the header is
    // 64-byte aligned and sized, so the chunk area starts chunk-aligned.
    pub(crate) fn new(num_chunks: usize) -> Option<Block> {
        debug_assert!(num_chunks >= 1);

        let size = size_of::<BlockHeader>() + num_chunks * CHUNK_SIZE;
        let layout = Layout::from_size_align(size, align_of::<BlockHeader>()).ok()?;

        let mem = unsafe { alloc(layout) };
        if mem.is_null() {
            return None;
        }

        let header = mem as *mut BlockHeader;
        unsafe {
            ptr::addr_of_mut!((*header).acquired).write(AtomicUsize::new(0));
        }

        Some(Block {
            header: unsafe { NonNull::new_unchecked(header) },
            num_chunks,
            offset: 0,
            sealed: false,
        })
    }

    #[inline]
    pub(crate) fn header_ptr(&self) -> *mut BlockHeader {
        self.header.as_ptr()
    }

    #[inline]
    fn header(&self) -> &BlockHeader {
        unsafe { self.header.as_ref() }
    }

    #[inline]
    fn data_base(&self) -> *mut u8 {
        unsafe { (self.header.as_ptr() as *mut u8).add(size_of::<BlockHeader>()) }
    }

    // Bump-allocates `chunks` chunks. Returns the raw region and the chunk
    // index it starts at (the caller derives handle provenance from it).
    // Seals the block when the request overflows the remaining capacity or
    // exactly fills it.
    pub(crate) fn try_acquire(&mut self, chunks: usize) -> Option<(NonNull<u8>, usize)> {
        if self.sealed {
            return None;
        }

        if chunks > self.num_chunks - self.offset {
            self.sealed = true;
            return None;
        }

        let at = self.offset;
        let region = unsafe { self.data_base().add(at * CHUNK_SIZE) };

        self.offset += chunks;
        if self.offset == self.num_chunks {
            self.sealed = true;
        }

        self.header().acquired.fetch_add(1, Ordering::Release);

        Some((unsafe { NonNull::new_unchecked(region) }, at))
    }

    // Reuse gate: a sealed block becomes allocatable from chunk 0 again once
    // every handle carved from it has been released. Run at the head of the
    // next allocation attempt touching this block.
    pub(crate) fn maybe_reset(&mut self) {
        if self.sealed && self.header().outstanding() == 0 {
            self.offset = 0;
            self.sealed = false;
        }
    }

    #[inline]
    pub(crate) fn outstanding(&self) -> usize {
        self.header().outstanding()
    }

    #[inline]
    pub(crate) fn is_drained(&self) -> bool {
        self.outstanding() == 0
    }

    #[inline]
    pub(crate) fn is_sealed(&self) -> bool {
        self.sealed
    }

    #[inline]
    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub(crate) fn num_chunks(&self) -> usize {
        self.num_chunks
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // Destroying a block with live handles is a caller bug (the handles
        // would release into freed memory); it is only detected in debug.
        debug_assert!(
            self.is_drained(),
            "block dropped with outstanding allocations"
        );

        let size = size_of::<BlockHeader>() + self.num_chunks * CHUNK_SIZE;
        let layout = Layout::from_size_align(size, align_of::<BlockHeader>())
            .expect("layout validated at construction");
        unsafe {
            dealloc(self.header.as_ptr() as *mut u8, layout);
        }
    }
}

// Growable collection of blocks with a round-robin cursor for allocation
// attempts. Index-based over Vec rather than a hand-rolled linked list.
pub(crate) struct BlockList {
    blocks: Vec<Block>,
    current: usize,
}

impl BlockList {
    pub(crate) fn with_blocks(count: usize, chunks_per_block: usize) -> Option<BlockList> {
        debug_assert!(count >= 1);

        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            blocks.push(Block::new(chunks_per_block)?);
        }

        Some(BlockList { blocks, current: 0 })
    }

    #[inline]
    pub(crate) fn current_mut(&mut self) -> &mut Block {
        &mut self.blocks[self.current]
    }

    #[inline]
    pub(crate) fn advance(&mut self) {
        self.current = (self.current + 1) % self.blocks.len();
    }

    // Appends a fresh block and makes it the cursor target.
    pub(crate) fn grow(&mut self, chunks_per_block: usize) -> Option<()> {
        let block = Block::new(chunks_per_block)?;
        self.blocks.push(block);
        self.current = self.blocks.len() - 1;
        Some(())
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn iter(&self) -> std::slice::Iter<'_, Block> {
        self.blocks.iter()
    }
}
