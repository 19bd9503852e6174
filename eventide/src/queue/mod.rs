//! Lock-free multi-producer multi-consumer queue of type-erased callables.
//!
//! Entries of varying size are stored inline inside fixed-size blocks, so a
//! warm queue pushes without allocating: writers claim space by bumping an
//! atomic pre-write index, and exactly one writer wins the right to install
//! a fresh block when the current one overflows. Readers consume entries by
//! bumping a per-block read cursor; the queue-level read-block pointer is
//! fenced by an [`AtomicSharedMutex`] so late readers can finish inside an
//! old block while the queue moves on. A drained block is recycled into a
//! single spare slot or freed.
//!
//! Ordering: pushes from one producer are observed in program order;
//! entries from different producers interleave arbitrarily. An entry only
//! becomes visible once its `ready` flag is set, after the payload is fully
//! constructed.

pub mod block;

use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use log::trace;

use crate::error::{Completion, ErrorKind};
use crate::exception::Exception;
use crate::functor::{Functor, FunctorView, FunctorVt};
use crate::sync::{AtomicSharedMutex, Backoff};

use block::{
    align_up, alloc_block, free_block, wipe_block, Block, BLOCK_PREAMBLE_SIZE,
    ENTRY_PREAMBLE_SIZE, FIRST_ENTRY_IDX,
};

pub use block::DEFAULT_BLOCK_SIZE;

/// State carried by the writer that won a block flip.
struct Flip {
    /// The block being flipped away from; its `next` link publishes the new
    /// block to readers.
    prev: Block,
    /// Pre-write index to install once the flip commits.
    next_idx: usize,
}

/// Block-allocated MPMC queue of callables `FnMut(&A) -> R`.
///
/// # Example
///
/// ```
/// use eventide::{Completion, ConcurrentFunctorQueue};
///
/// let queue = ConcurrentFunctorQueue::<u32>::new().unwrap();
/// queue
///     .push(|n: &u32| {
///         assert_eq!(*n, 7);
///         Completion::Done
///     })
///     .unwrap();
/// assert!(matches!(queue.try_call_and_pop(&7), Ok(Some(Completion::Done))));
/// ```
pub struct ConcurrentFunctorQueue<A: 'static, R: Default + 'static = Completion> {
    /// Block currently being drained; guarded by `flip_lock`.
    read_block: AtomicPtr<u8>,
    /// Block currently being filled.
    write_block: AtomicPtr<u8>,
    /// At most one cached empty block.
    spare_block: AtomicPtr<u8>,
    /// Write cursor into the write block. A value above `block_size` means
    /// a flip is in progress and writers must wait.
    pre_write_idx: AtomicUsize,
    /// Writers currently inside the push path; the flip winner waits for
    /// this to drain before publishing the new block.
    pre_lock_shared: AtomicU32,
    /// Fences read-block replacement against readers snapshotting it.
    flip_lock: AtomicSharedMutex,
    block_size: usize,
    /// Total blocks ever allocated; diagnostics.
    blocks_allocated: AtomicUsize,
    _marker: PhantomData<fn(&A) -> R>,
}

// SAFETY: every push requires the payload to be `Send`; all shared state is
// atomics or fenced by `flip_lock`, so the queue can move between threads
// and be driven from several at once.
unsafe impl<A: 'static, R: Default + 'static> Send for ConcurrentFunctorQueue<A, R> {}
// SAFETY: as above.
unsafe impl<A: 'static, R: Default + 'static> Sync for ConcurrentFunctorQueue<A, R> {}

impl<A: 'static, R: Default + 'static> ConcurrentFunctorQueue<A, R> {
    /// Queue with the default 64 KiB block size.
    pub fn new() -> Result<Self, ErrorKind> {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    /// Queue with an explicit block size. The size must be a multiple of
    /// the functor alignment unit and large enough for at least one
    /// minimal entry.
    pub fn with_block_size(block_size: usize) -> Result<Self, ErrorKind> {
        if block_size % crate::functor::FUNCTOR_ALIGN != 0
            || block_size < BLOCK_PREAMBLE_SIZE + crate::functor::FUNCTOR_ALIGN
        {
            return Err(ErrorKind::InvalidArgument);
        }
        let first = alloc_block(block_size).ok_or(ErrorKind::OutOfMemory)?;
        // A missing spare is fine; one gets allocated on the first flip.
        let spare = alloc_block(block_size);
        let allocated = 1 + usize::from(spare.is_some());
        Ok(Self {
            read_block: AtomicPtr::new(first.0),
            write_block: AtomicPtr::new(first.0),
            spare_block: AtomicPtr::new(spare.map_or(ptr::null_mut(), |b| b.0)),
            pre_write_idx: AtomicUsize::new(FIRST_ENTRY_IDX),
            pre_lock_shared: AtomicU32::new(0),
            flip_lock: AtomicSharedMutex::new(),
            block_size,
            blocks_allocated: AtomicUsize::new(allocated),
            _marker: PhantomData,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of blocks allocated over the queue's lifetime.
    pub fn blocks_allocated(&self) -> usize {
        self.blocks_allocated.load(Ordering::Relaxed)
    }

    /// Whether an empty block is currently cached for reuse.
    pub fn has_spare(&self) -> bool {
        !self.spare_block.load(Ordering::Acquire).is_null()
    }

    /// Push a callable. Fails with [`ErrorKind::OutOfMemory`] when the
    /// entry cannot fit a block or a needed block cannot be allocated.
    pub fn push<F>(&self, f: F) -> Result<(), ErrorKind>
    where
        F: FnMut(&A) -> R + Send + 'static,
    {
        let vt = FunctorVt::of_static::<F>();
        let mut value = Some(f);
        // SAFETY: the constructor writes one `F` payload, matching `vt`,
        // and does not unwind.
        unsafe {
            self.push_with(vt, |dst| {
                if let Some(f) = value.take() {
                    // SAFETY: `dst` is exclusive storage of at least
                    // `vt.size()` bytes on the alignment grid.
                    unsafe { dst.cast::<F>().write(f) };
                }
            })
        }
    }

    /// Push the payload of an owning [`Functor`], moving it into the queue.
    pub fn push_functor(&self, mut f: Functor<A, R>) -> Result<(), ErrorKind> {
        let vt = f.vt();
        let src = f.payload_mut_ptr();
        let size = vt.size();
        // SAFETY: the constructor relocates the live payload bytes; on
        // success the source storage is released without dropping the
        // payload, on failure the functor still owns it.
        unsafe {
            self.push_with(vt, |dst| {
                // SAFETY: `src` is the live payload, `dst` is exclusive
                // storage of `size` bytes; the regions cannot overlap.
                unsafe { ptr::copy_nonoverlapping(src, dst, size) };
            })?;
            f.release_moved();
        }
        Ok(())
    }

    /// Push through a [`FunctorView`]: a movable view forwards its payload
    /// (emptying the source), any other view clones it.
    pub fn push_view(&self, mut view: FunctorView<'_, A, R>) -> Result<(), ErrorKind> {
        if view.movable() {
            let vt = view.vt();
            let src = view.payload_ptr();
            let size = vt.size();
            // SAFETY: the constructor relocates the live payload bytes; the
            // forward is completed (source released, view emptied) only
            // after the push succeeded.
            unsafe {
                self.push_with(vt, |dst| {
                    // SAFETY: `src` is the live payload, `dst` is exclusive
                    // storage of `size` bytes; the regions cannot overlap.
                    unsafe { ptr::copy_nonoverlapping(src, dst, size) };
                })?;
                view.complete_forward();
            }
            Ok(())
        } else {
            self.push_functor(view.to_functor(false)?)
        }
    }

    /// Claim a slot, construct the payload through `construct`, and
    /// publish the entry.
    ///
    /// # Safety
    ///
    /// `construct` must write one complete payload of `vt`'s type at the
    /// given pointer, and must not unwind.
    unsafe fn push_with(
        &self,
        vt: &'static FunctorVt<A, R>,
        construct: impl FnOnce(*mut u8),
    ) -> Result<(), ErrorKind> {
        let block_size = self.block_size;
        let sz = align_up(ENTRY_PREAMBLE_SIZE + vt.size());
        if sz + BLOCK_PREAMBLE_SIZE > block_size {
            return Err(ErrorKind::OutOfMemory);
        }

        let mut idx = self.pre_write_idx.load(Ordering::SeqCst);
        let mut block = Block(self.write_block.load(Ordering::Acquire));
        let mut pre_locked = false;
        let mut flip: Option<Flip> = None;
        let next_idx;

        loop {
            if idx > block_size {
                // Another writer is mid-flip; step out of its drain set and
                // wait for the new block.
                if pre_locked {
                    self.pre_lock_shared.fetch_sub(1, Ordering::AcqRel);
                    pre_locked = false;
                }
                let mut backoff = Backoff::new();
                loop {
                    backoff.snooze();
                    idx = self.pre_write_idx.load(Ordering::SeqCst);
                    block = Block(self.write_block.load(Ordering::Acquire));
                    if idx <= block_size {
                        break;
                    }
                }
            }
            let claimed = idx + sz;
            if !pre_locked {
                self.pre_lock_shared.fetch_add(1, Ordering::AcqRel);
                pre_locked = true;
            }
            if let Err(current) = self.pre_write_idx.compare_exchange(
                idx,
                claimed,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                idx = current;
                block = Block(self.write_block.load(Ordering::Acquire));
                continue;
            }

            if claimed <= block_size {
                // Plain slot inside the current block.
                next_idx = claimed;
                break;
            }

            // This writer won the flip: `pre_write_idx` now parks everyone
            // else. Wait until this is the only writer in flight.
            let mut backoff = Backoff::new();
            while self.pre_lock_shared.load(Ordering::Acquire) != 1 {
                backoff.snooze();
            }

            let prev = block;
            idx = FIRST_ENTRY_IDX;
            next_idx = idx + sz;

            let spare = self.spare_block.swap(ptr::null_mut(), Ordering::AcqRel);
            let fresh = if spare.is_null() {
                match alloc_block(block_size) {
                    Some(b) => {
                        self.blocks_allocated.fetch_add(1, Ordering::Relaxed);
                        trace!("functor queue allocated block {:p}", b.0);
                        b
                    }
                    None => {
                        // Restore the cursor and release the flip. Every
                        // other writer is parked on `idx > block_size`, so
                        // the plain store cannot race a concurrent claim.
                        self.pre_write_idx.store(claimed - sz, Ordering::SeqCst);
                        self.pre_lock_shared.fetch_sub(1, Ordering::AcqRel);
                        return Err(ErrorKind::OutOfMemory);
                    }
                }
            } else {
                trace!("functor queue reusing spare block {:p}", spare);
                Block(spare)
            };
            flip = Some(Flip {
                prev,
                next_idx,
            });
            block = fresh;
            break;
        }

        // SAFETY: the slot at `idx` is claimed exclusively; metadata and
        // payload are written before the ready flag publishes the entry.
        unsafe {
            block.set_entry_meta(idx, vt as *const FunctorVt<A, R> as *const (), sz);
            construct(block.payload_ptr(idx));
            #[cfg(debug_assertions)]
            block.preamble().live_objects.fetch_add(1, Ordering::Relaxed);
        }

        match flip {
            Some(f) => {
                self.write_block.store(block.0, Ordering::Release);
                // SAFETY: entry position inside the freshly installed block.
                unsafe { block.entry_ready(idx) }.store(1, Ordering::Release);
                self.pre_lock_shared.fetch_sub(1, Ordering::AcqRel);
                // Late pre-lockers may still be committing ready flags in
                // the previous block; only link it once they are gone.
                let mut backoff = Backoff::new();
                while self.pre_lock_shared.load(Ordering::Acquire) != 0 {
                    backoff.snooze();
                }
                // SAFETY: `prev` stays alive while it is the read block or
                // has readers registered; linking publishes the new block.
                unsafe { f.prev.preamble() }.next.store(block.0, Ordering::Release);
                // Unpark the other writers.
                self.pre_write_idx.store(f.next_idx, Ordering::SeqCst);
            }
            None => {
                // SAFETY: entry position inside the current write block.
                unsafe { block.entry_ready(idx) }.store(1, Ordering::Release);
                self.pre_lock_shared.fetch_sub(1, Ordering::AcqRel);
            }
        }
        debug_assert!(next_idx <= block_size);
        Ok(())
    }

    /// Pop one entry and invoke it with `arg`.
    ///
    /// Returns `Ok(Some(r))` after invoking an entry, `Ok(None)` when the
    /// queue is empty, and `Err(e)` when the invoked callable panicked (the
    /// entry is still consumed and destroyed).
    pub fn try_call_and_pop(&self, arg: &A) -> Result<Option<R>, Exception> {
        let block_size = self.block_size;

        // Register on the current read block.
        self.flip_lock.lock_shared();
        let mut block = Block(self.read_block.load(Ordering::Acquire));
        // SAFETY: the read block is a live wiped block while the queue
        // exists; registration keeps it alive below.
        unsafe { block.preamble() }
            .read_shared
            .fetch_add(1, Ordering::AcqRel);
        self.flip_lock.unlock_shared();

        // SAFETY: registered on `block`.
        let mut read_idx = unsafe { block.preamble() }.read_idx.load(Ordering::Acquire);

        let claimed_idx = loop {
            let ready = read_idx < block_size
                // SAFETY: `read_idx` is on the entry grid inside the block.
                && unsafe { block.entry_ready(read_idx) }.load(Ordering::Acquire) == 1;

            if !ready {
                // SAFETY: registered on `block`.
                let next = unsafe { block.preamble() }.next.load(Ordering::Acquire);
                if next.is_null() {
                    // Nothing published here and no successor: empty.
                    self.exit_block(block);
                    return Ok(None);
                }

                // Advance the queue to the successor (unless another reader
                // already did) and migrate our registration.
                let old = block;
                self.flip_lock.lock();
                if self.read_block.load(Ordering::Acquire) == old.0 {
                    self.read_block.store(next, Ordering::Release);
                    block = Block(next);
                } else {
                    block = Block(self.read_block.load(Ordering::Acquire));
                }
                // SAFETY: the new read block is live; registration under
                // the exclusive lock keeps the swap consistent.
                unsafe { block.preamble() }
                    .read_shared
                    .fetch_add(1, Ordering::AcqRel);
                // SAFETY: still registered on `old` until this decrement.
                let old_shared =
                    unsafe { old.preamble() }.read_shared.fetch_sub(1, Ordering::AcqRel) - 1;
                self.flip_lock.unlock();

                // SAFETY: registered on the (new) block.
                read_idx = unsafe { block.preamble() }.read_idx.load(Ordering::Acquire);
                if old_shared == 0 {
                    // SAFETY: no readers remain in `old` and it is no
                    // longer the read block.
                    unsafe { self.recycle(old) };
                }
                continue;
            }

            // SAFETY: entry metadata is immutable after ready was observed.
            let entry_size = unsafe { block.entry_size(read_idx) };
            // SAFETY: registered on `block`.
            match unsafe { block.preamble() }.read_idx.compare_exchange(
                read_idx,
                read_idx + entry_size,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break read_idx,
                Err(current) => {
                    // Another reader claimed this entry.
                    read_idx = current;
                }
            }
        };

        // This entry is ours: invoke, destroy, unregister.
        // SAFETY: the queue only stores vtables of type FunctorVt<A, R>;
        // the pointer was written by `push_with` and is 'static.
        let vt = unsafe { &*(block.entry_vt(claimed_idx) as *const FunctorVt<A, R>) };
        // SAFETY: claimed entry inside a registered block.
        let payload = unsafe { block.payload_ptr(claimed_idx) };
        let mut slot: Option<Exception> = None;
        // SAFETY: the payload is live and exclusively claimed; try_invoke
        // never unwinds.
        let result = unsafe { vt.try_invoke(payload, &mut slot, arg) };
        // SAFETY: the payload is destroyed exactly once, by its claimer.
        unsafe { vt.drop_payload(payload) };
        #[cfg(debug_assertions)]
        // SAFETY: registered on `block`.
        unsafe {
            block.preamble().live_objects.fetch_sub(1, Ordering::Relaxed);
        }
        self.exit_block(block);

        match slot {
            Some(e) => Err(e),
            None => Ok(Some(result)),
        }
    }

    /// Drop a reader registration; recycles the block when it was the last
    /// reader of a block the queue has already moved past.
    fn exit_block(&self, block: Block) {
        self.flip_lock.lock_shared();
        // SAFETY: still registered on `block` until this decrement.
        let shared = unsafe { block.preamble() }
            .read_shared
            .fetch_sub(1, Ordering::AcqRel)
            - 1;
        let current = self.read_block.load(Ordering::Acquire);
        self.flip_lock.unlock_shared();
        if current != block.0 && shared == 0 {
            // SAFETY: no readers remain and the block is not current.
            unsafe { self.recycle(block) };
        }
    }

    /// Reset a fully drained block and cache it as the spare, or free it
    /// when the spare slot is taken.
    ///
    /// # Safety
    ///
    /// No reader may be registered on the block and it must not be the
    /// current read or write block.
    unsafe fn recycle(&self, block: Block) {
        #[cfg(debug_assertions)]
        // SAFETY: exclusive access per the caller contract.
        unsafe {
            debug_assert_eq!(
                block.preamble().live_objects.load(Ordering::Relaxed),
                0,
                "recycling a block with live payloads"
            );
        }
        // SAFETY: exclusive access per the caller contract.
        unsafe { wipe_block(block, self.block_size) };
        if self
            .spare_block
            .compare_exchange(
                ptr::null_mut(),
                block.0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_err()
        {
            // SAFETY: the block is drained and unreferenced.
            unsafe { free_block(block, self.block_size) };
            trace!("functor queue freed block {:p}", block.0);
        } else {
            trace!("functor queue cached spare block {:p}", block.0);
        }
    }
}

impl<A: 'static, R: Default + 'static> Drop for ConcurrentFunctorQueue<A, R> {
    fn drop(&mut self) {
        let block_size = self.block_size;
        let spare = *self.spare_block.get_mut();
        if !spare.is_null() {
            // SAFETY: the spare is an empty block owned by the queue.
            unsafe { free_block(Block(spare), block_size) };
        }
        let mut current = *self.read_block.get_mut();
        while !current.is_null() {
            let b = Block(current);
            // Destroy the constructed entries that were never popped.
            // SAFETY: exclusive access; the chain was built by push_with.
            unsafe {
                let mut idx = b.preamble().read_idx.load(Ordering::Relaxed);
                while idx < block_size {
                    if b.entry_ready(idx).load(Ordering::Relaxed) != 1 {
                        break;
                    }
                    let vt = &*(b.entry_vt(idx) as *const FunctorVt<A, R>);
                    vt.drop_payload(b.payload_ptr(idx));
                    idx += b.entry_size(idx);
                }
                current = b.preamble().next.load(Ordering::Relaxed);
                free_block(b, block_size);
            }
        }
    }
}

impl<A: 'static, R: Default + 'static> core::fmt::Debug for ConcurrentFunctorQueue<A, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConcurrentFunctorQueue")
            .field("block_size", &self.block_size)
            .field("blocks_allocated", &self.blocks_allocated())
            .field("has_spare", &self.has_spare())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn test_rejects_bad_block_sizes() {
        assert_eq!(
            ConcurrentFunctorQueue::<u32>::with_block_size(100).err(),
            Some(ErrorKind::InvalidArgument)
        );
        assert_eq!(
            ConcurrentFunctorQueue::<u32>::with_block_size(BLOCK_PREAMBLE_SIZE).err(),
            Some(ErrorKind::InvalidArgument)
        );
    }

    #[test]
    fn test_oversized_entry_is_rejected() {
        let q = ConcurrentFunctorQueue::<u32>::with_block_size(256).unwrap();
        let big = [0u8; 512];
        let r = q.push(move |_: &u32| {
            let _ = big;
            Completion::Done
        });
        assert_eq!(r.err(), Some(ErrorKind::OutOfMemory));
        // The queue stays usable.
        assert!(q.push(|_: &u32| Completion::Done).is_ok());
        assert!(matches!(q.try_call_and_pop(&0), Ok(Some(Completion::Done))));
    }

    #[test]
    fn test_pop_empty_returns_none() {
        let q = ConcurrentFunctorQueue::<u32>::new().unwrap();
        assert!(matches!(q.try_call_and_pop(&0), Ok(None)));
        assert!(matches!(q.try_call_and_pop(&0), Ok(None)));
    }

    #[test]
    fn test_push_pop_passes_argument() {
        let q = ConcurrentFunctorQueue::<u32>::new().unwrap();
        let seen = Arc::new(AtomicU32::new(0));
        let s = Arc::clone(&seen);
        q.push(move |arg: &u32| {
            s.store(*arg, Ordering::Relaxed);
            Completion::Done
        })
        .unwrap();
        assert!(matches!(q.try_call_and_pop(&41), Ok(Some(Completion::Done))));
        assert_eq!(seen.load(Ordering::Relaxed), 41);
    }

    #[test]
    fn test_panicking_entry_is_consumed() {
        let q = ConcurrentFunctorQueue::<u32>::new().unwrap();
        q.push(|_: &u32| -> Completion { panic!("entry failure") })
            .unwrap();
        let e = q.try_call_and_pop(&0).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Other);
        assert_eq!(e.message(), "entry failure");
        e.discard();
        // The panicking entry was popped; the queue is empty again.
        assert!(matches!(q.try_call_and_pop(&0), Ok(None)));
    }

    #[test]
    fn test_drop_destroys_unpopped_entries() {
        let seen = Arc::new(AtomicU32::new(0));
        {
            let q = ConcurrentFunctorQueue::<u32>::new().unwrap();
            for _ in 0..10 {
                let s = Arc::clone(&seen);
                q.push(move |_: &u32| {
                    s.fetch_add(1, Ordering::Relaxed);
                    Completion::Done
                })
                .unwrap();
            }
        }
        // Entries were destroyed, not invoked.
        assert_eq!(seen.load(Ordering::Relaxed), 0);
        assert_eq!(Arc::strong_count(&seen), 1);
    }

    #[test]
    fn test_push_functor_moves_payload() {
        let q = ConcurrentFunctorQueue::<u32>::new().unwrap();
        let owned: Functor<u32> = Functor::new(|_: &u32| Completion::Canceled);
        q.push_functor(owned).unwrap();
        assert!(matches!(
            q.try_call_and_pop(&0),
            Ok(Some(Completion::Canceled))
        ));
    }

    #[test]
    fn test_push_view_forwarding_and_copying() {
        let q = ConcurrentFunctorQueue::<u32>::new().unwrap();

        let mut src: Functor<u32> = Functor::new(|_: &u32| Completion::Done);
        q.push_view(FunctorView::forwarding(&mut src)).unwrap();
        assert!(src.is_empty());
        assert!(matches!(q.try_call_and_pop(&0), Ok(Some(Completion::Done))));

        let mut f = |_: &u32| Completion::Done;
        q.push_view(FunctorView::from_cloneable(&mut f)).unwrap();
        assert!(matches!(q.try_call_and_pop(&0), Ok(Some(Completion::Done))));

        // A plain borrowed view cannot be pushed by copy.
        let mut g = |_: &u32| Completion::Done;
        assert_eq!(
            q.push_view(FunctorView::from_fn(&mut g)).err(),
            Some(ErrorKind::BadCall)
        );
        assert!(matches!(q.try_call_and_pop(&0), Ok(None)));
    }
}
