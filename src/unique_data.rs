use std::alloc::{alloc, dealloc, Layout};
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::block::BlockHeader;
use crate::CHUNK_SIZE;

// Reclaim discriminator carried inline with every allocation.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Pool = 1,
    Heap = 2,
}

// Handover lifecycle bit. Recorded: published to the queue, not yet
// consumed. Utilized: consumed, or a sentinel that never carried a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum HandleState {
    Recorded = 0,
    Utilized = 1,
}

// Inline header placed at the start of every allocation, immediately ahead
// of the payload region. The queue links through `next`; release walks
// `block_offset` bytes back to the owning BlockHeader (pool origin) or
// rebuilds the dealloc layout from `capacity` (heap origin).
#[repr(C)]
pub(crate) struct DataHeader {
    pub(crate) next: AtomicPtr<DataHeader>,
    // HandleState. The owner is the only writer; cross-thread visibility of
    // a publication rides on the queue's next/tail CAS pair, so plain
    // relaxed accesses are enough here.
    state: AtomicU32,
    origin: Origin,
    // Bytes from this header back to its BlockHeader; 0 for heap origin.
    block_offset: u32,
    // Total allocation size in bytes, header included.
    capacity: u32,
}

// Headers start on chunk (64-byte) boundaries and the payload follows the
// 24-byte header, so payloads are 8-aligned.
pub const PAYLOAD_ALIGN: usize = 8;

impl DataHeader {
    pub(crate) unsafe fn init(
        header: *mut DataHeader,
        origin: Origin,
        block_offset: u32,
        capacity: u32,
    ) {
        ptr::addr_of_mut!((*header).next).write(AtomicPtr::new(ptr::null_mut()));
        ptr::addr_of_mut!((*header).state).write(AtomicU32::new(HandleState::Recorded as u32));
        ptr::addr_of_mut!((*header).origin).write(origin);
        ptr::addr_of_mut!((*header).block_offset).write(block_offset);
        ptr::addr_of_mut!((*header).capacity).write(capacity);
    }

    #[inline]
    pub(crate) fn is_recorded(&self) -> bool {
        self.state.load(Ordering::Relaxed) == HandleState::Recorded as u32
    }

    #[inline]
    pub(crate) fn mark_recorded(&self) {
        self.state.store(HandleState::Recorded as u32, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn mark_utilized(&self) {
        self.state.store(HandleState::Utilized as u32, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn origin(&self) -> Origin {
        self.origin
    }

    #[inline]
    fn payload(header: *mut DataHeader) -> *mut u8 {
        unsafe { (header as *mut u8).add(size_of::<DataHeader>()) }
    }

    // Returns the memory to its origin. The caller forfeits the pointer.
    pub(crate) unsafe fn release_raw(header: *mut DataHeader) {
        match (*header).origin {
            Origin::Pool => {
                let block =
                    (header as *mut u8).sub((*header).block_offset as usize) as *const BlockHeader;
                (*block).release();
            }
            Origin::Heap => {
                let layout = Layout::from_size_align_unchecked(
                    (*header).capacity as usize,
                    CHUNK_SIZE,
                );
                dealloc(header as *mut u8, layout);
            }
        }
    }
}

/// Uniquely-owned handle to one variable-sized payload region. The handle is
/// also the queue node: its header carries the intrusive link, the handover
/// state and enough provenance to return the memory to its origin on drop
/// without consulting the pool.
#[derive(Debug)]
pub struct UniqueData {
    // Null once released.
    header: *mut DataHeader,
}

unsafe impl Send for UniqueData {}

impl UniqueData {
    // Takes ownership of a header the pool or queue produced.
    #[inline]
    pub(crate) unsafe fn from_raw(header: *mut DataHeader) -> UniqueData {
        UniqueData { header }
    }

    // Surrenders ownership without releasing; push uses this to hand the
    // node to the queue.
    #[inline]
    pub(crate) fn into_raw(self) -> *mut DataHeader {
        let header = self.header;
        std::mem::forget(self);
        header
    }

    // Writes a fresh pool-provenance header into `region` and wraps it.
    pub(crate) unsafe fn init_pool(
        region: NonNull<u8>,
        block_offset: usize,
        capacity: usize,
    ) -> UniqueData {
        let header = region.as_ptr() as *mut DataHeader;
        DataHeader::init(header, Origin::Pool, block_offset as u32, capacity as u32);
        UniqueData { header }
    }

    // One system allocation under the same header ABI; `capacity` makes the
    // dealloc layout recoverable at release time.
    pub(crate) fn alloc_heap(size: usize) -> Option<UniqueData> {
        let capacity = size_of::<DataHeader>().checked_add(size)?;
        if capacity > u32::MAX as usize {
            return None;
        }

        let layout = Layout::from_size_align(capacity, CHUNK_SIZE).ok()?;
        let mem = unsafe { alloc(layout) };
        if mem.is_null() {
            return None;
        }

        let header = mem as *mut DataHeader;
        unsafe {
            DataHeader::init(header, Origin::Heap, 0, capacity as u32);
        }
        Some(UniqueData { header })
    }

    /// True until the handle is released.
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.header.is_null()
    }

    pub fn origin(&self) -> Origin {
        assert!(self.is_valid());
        unsafe { (*self.header).origin() }
    }

    /// Bytes available for the payload.
    pub fn payload_capacity(&self) -> usize {
        assert!(self.is_valid());
        unsafe { (*self.header).capacity as usize - size_of::<DataHeader>() }
    }

    /// Raw payload pointer.
    #[inline]
    pub fn raw(&self) -> *mut u8 {
        debug_assert!(self.is_valid());
        DataHeader::payload(self.header)
    }

    /// In-place constructs the payload.
    ///
    /// Panics when `T` does not fit the region or needs more than
    /// [`PAYLOAD_ALIGN`] alignment.
    pub fn emplace<T>(&mut self, value: T) -> &mut T {
        assert!(size_of::<T>() <= self.payload_capacity());
        assert!(align_of::<T>() <= PAYLOAD_ALIGN);

        unsafe {
            let payload = self.raw() as *mut T;
            payload.write(value);
            &mut *payload
        }
    }

    /// Typed view of the payload.
    ///
    /// # Safety
    /// A `T` must have been constructed in the payload region and the handle
    /// must be valid.
    #[inline]
    pub unsafe fn get<T>(&self) -> &T {
        &*(self.raw() as *const T)
    }

    /// # Safety
    /// Same contract as [`UniqueData::get`].
    #[inline]
    pub unsafe fn get_mut<T>(&mut self) -> &mut T {
        &mut *(self.raw() as *mut T)
    }

    /// Moves the payload out, leaving the region logically uninitialized.
    ///
    /// # Safety
    /// A `T` must have been constructed in the payload region, and it must
    /// not be read or taken again afterwards.
    #[inline]
    pub unsafe fn take<T>(&mut self) -> T {
        ptr::read(self.raw() as *const T)
    }

    /// Returns the backing memory to its origin. Idempotent; `Drop` calls
    /// this, so an explicit call is only useful to release early.
    pub fn release(&mut self) {
        if self.header.is_null() {
            return;
        }

        unsafe {
            DataHeader::release_raw(self.header);
        }
        self.header = ptr::null_mut();
    }
}

impl Drop for UniqueData {
    fn drop(&mut self) {
        self.release();
    }
}
