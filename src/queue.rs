use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::unique_data::{DataHeader, UniqueData};
use crate::AllocError;

/// Intrusive wait-free MPSC queue of [`UniqueData`] handles.
///
/// The handles are the nodes: `push` links a handle's inline header into a
/// singly-linked chain rooted at a permanent dummy sentinel, so no
/// allocation happens per message. `push` is safe from any thread; `pop`
/// must only ever be called from one consumer thread. Calling `pop` from
/// two threads is a program bug this type does not detect.
///
/// When `pop` drains the queue completely, the last handle it returned
/// stays rooted as the resident dummy node until the next push or pop
/// detaches it. Its memory must therefore outlive that detachment: for
/// pool-backed handles this holds as long as the backing block is not
/// re-carved first, for heap-backed handles the caller has to keep the
/// last popped handle alive until a subsequent push. Block reuse rules are
/// what make the scheme safe without tagged pointers: a block only resets
/// once every handle carved from it is gone.
pub struct MpscQueue {
    head: CachePadded<AtomicPtr<DataHeader>>,
    tail: CachePadded<AtomicPtr<DataHeader>>,
    len: CachePadded<AtomicUsize>,
    // The permanently owned dummy; freed by the queue alone, whether still
    // linked or long since detached.
    sentinel: *mut DataHeader,
}

unsafe impl Send for MpscQueue {}
unsafe impl Sync for MpscQueue {}

impl MpscQueue {
    /// Fails only when the sentinel allocation does.
    pub fn new() -> Result<MpscQueue, AllocError> {
        let sentinel = UniqueData::alloc_heap(0).ok_or(AllocError)?.into_raw();
        unsafe {
            // The sentinel never carries a payload.
            (*sentinel).mark_utilized();
        }

        Ok(MpscQueue {
            head: CachePadded::new(AtomicPtr::new(sentinel)),
            tail: CachePadded::new(AtomicPtr::new(sentinel)),
            len: CachePadded::new(AtomicUsize::new(0)),
            sentinel,
        })
    }

    /// Publishes a handle. Any thread. An invalid (already released) handle
    /// is rejected and handed back; the queue is untouched.
    ///
    /// The payload written before `push` happens-before the consumer's read
    /// of the popped handle; the linking CAS carries the publication.
    pub fn push(&self, data: UniqueData) -> Result<(), UniqueData> {
        if !data.is_valid() {
            return Err(data);
        }

        let node = data.into_raw();
        unsafe {
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
            (*node).mark_recorded();
        }

        loop {
            let tail = self.tail.load(Ordering::Acquire);

            if tail == node {
                // A fully drained chain stays rooted in the last popped
                // node; when that chunk is re-carved and republished, the
                // chain is already rooted right here. Linking would tie the
                // node to itself, so only republish the root.
                let _ = self.tail.compare_exchange(
                    node,
                    node,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                self.len.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            let next = unsafe { (*tail).next.load(Ordering::Acquire) };

            if next.is_null() {
                let linked = unsafe {
                    (*tail)
                        .next
                        .compare_exchange_weak(
                            ptr::null_mut(),
                            node,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                };

                if linked {
                    // A failure here means another producer already swung
                    // the tail past us; the chain stays intact either way.
                    let _ = self.tail.compare_exchange(
                        tail,
                        node,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
            } else {
                // Tail lag: help the producer that linked but has not swung
                // the tail yet, then retry.
                let _ =
                    self.tail
                        .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire);
            }
        }
    }

    /// Takes the oldest unconsumed handle, or `None` when the queue holds
    /// none. Single consumer only.
    pub fn pop(&self) -> Option<UniqueData> {
        // One extra round steps over a single stale detached dummy; the
        // chain never stacks two in front of a recorded node.
        for _ in 0..2 {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);

            if head == tail {
                let tail_next = unsafe { (*tail).next.load(Ordering::Acquire) };

                if unsafe { (*head).is_recorded() } {
                    // The resident dummy is the most recent push, not yet
                    // consumed: hand it out in place.
                    unsafe { (*head).mark_utilized() };
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    return Some(unsafe { UniqueData::from_raw(head) });
                }

                if !tail_next.is_null() {
                    // Tail lag repair on the consumer side.
                    let _ = self.tail.compare_exchange(
                        tail,
                        tail_next,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }

                return None;
            }

            let head_next = unsafe { (*head).next.load(Ordering::Acquire) };
            if head_next.is_null() {
                // head != tail implies a link in between; a null here is a
                // transient view, nothing consumable yet.
                return None;
            }

            self.head.store(head_next, Ordering::Release);

            if unsafe { (*head).is_recorded() } {
                unsafe { (*head).mark_utilized() };
                self.len.fetch_sub(1, Ordering::Relaxed);
                return Some(unsafe { UniqueData::from_raw(head) });
            }

            // Detached node was already handed out (stale dummy): not ours
            // to release. Go around once more.
        }

        None
    }

    /// Best-effort element count.
    #[inline]
    pub fn size(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

impl Drop for MpscQueue {
    fn drop(&mut self) {
        // Drain whatever the consumer never took; each drop releases to the
        // pool or heap that backs it.
        while let Some(data) = self.pop() {
            drop(data);
        }

        // The sentinel is always ours: pop never returns it (it is never
        // recorded), it is merely skipped once detached.
        unsafe {
            drop(UniqueData::from_raw(self.sentinel));
        }
    }
}
