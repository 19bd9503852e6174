//! Raw block layout for the concurrent functor queue.
//!
//! A block is one contiguous, 64-aligned allocation. It starts with a
//! [`BlockPreamble`] (next-block link, read cursor, reader count), followed
//! by a run of entries. Each entry is an [`EntryPreamble`] (ready flag,
//! vtable pointer, entry size) immediately followed by the payload bytes,
//! padded so the next entry preamble lands on the alignment grid again.
//!
//! The first entry preamble starts at `BLOCK_PREAMBLE_SIZE -
//! ENTRY_PREAMBLE_SIZE`, overlapping the padded tail of the block preamble,
//! so every payload sits at a multiple of [`FUNCTOR_ALIGN`] and the index
//! arithmetic is uniform across the whole block.
//!
//! Fields that are written before a block or entry is published are
//! accessed through raw pointers; the `ready` flag and the preamble
//! atomics are the only concurrently accessed cells.

use core::alloc::Layout;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize};
use std::alloc;

use crate::functor::FUNCTOR_ALIGN;

/// Default block size: 64 KiB.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Round `value` up to the functor alignment grid.
pub(crate) const fn align_up(value: usize) -> usize {
    (value + (FUNCTOR_ALIGN - 1)) & !(FUNCTOR_ALIGN - 1)
}

/// Header at the start of every block.
#[repr(C)]
pub(crate) struct BlockPreamble {
    /// Link to the successor block; published after the successor's first
    /// entry is ready.
    pub next: AtomicPtr<u8>,
    /// Read cursor: byte index of the next entry preamble to consume.
    pub read_idx: AtomicUsize,
    /// Number of readers currently inside this block.
    pub read_shared: AtomicU32,
    /// Constructed-minus-destroyed payloads; verification aid.
    #[cfg(debug_assertions)]
    pub live_objects: AtomicU32,
}

/// Header preceding every entry payload.
#[repr(C)]
pub(crate) struct EntryPreamble {
    /// Publication gate: 0 until the payload is fully constructed.
    pub ready: AtomicUsize,
    /// Type-erased `&'static FunctorVt` of the payload.
    pub vt: *const (),
    /// Entry size in bytes, including this preamble and trailing padding.
    pub size: usize,
}

pub(crate) const ENTRY_PREAMBLE_SIZE: usize = core::mem::size_of::<EntryPreamble>();

/// Aligned size reserved at the head of a block; covers the block preamble
/// plus the overlapping first entry preamble.
pub(crate) const BLOCK_PREAMBLE_SIZE: usize =
    align_up(core::mem::size_of::<BlockPreamble>() + ENTRY_PREAMBLE_SIZE);

/// Byte index of the first entry preamble in a block.
pub(crate) const FIRST_ENTRY_IDX: usize = BLOCK_PREAMBLE_SIZE - ENTRY_PREAMBLE_SIZE;

// The overlapping first entry preamble must not reach back into the live
// fields of the block preamble, and `ready` must sit first in the entry
// preamble (the wipe writes it through a bare usize pointer).
const _: () = assert!(FIRST_ENTRY_IDX >= core::mem::size_of::<BlockPreamble>());
const _: () = assert!(BLOCK_PREAMBLE_SIZE % FUNCTOR_ALIGN == 0);
const _: () = assert!(core::mem::offset_of!(EntryPreamble, ready) == 0);

/// Raw handle to one block allocation.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block(pub *mut u8);

impl Block {
    /// Block preamble reference.
    ///
    /// # Safety
    ///
    /// The block must be a live allocation initialized by [`wipe_block`].
    pub unsafe fn preamble<'a>(self) -> &'a BlockPreamble {
        // SAFETY: per the caller contract the preamble was initialized and
        // the allocation outlives the use.
        unsafe { &*self.0.cast::<BlockPreamble>() }
    }

    /// Ready flag of the entry preamble at `idx`.
    ///
    /// # Safety
    ///
    /// `idx` must be an entry position inside the block (the wipe
    /// initialized a ready word at every alignment step).
    pub unsafe fn entry_ready<'a>(self, idx: usize) -> &'a AtomicUsize {
        // SAFETY: `ready` is at offset 0 of the entry preamble and was
        // zero-initialized by the wipe, so the cell is valid for atomic
        // access.
        unsafe { &*self.0.add(idx).cast::<AtomicUsize>() }
    }

    /// Vtable pointer of the entry at `idx`.
    ///
    /// # Safety
    ///
    /// The entry's metadata must have been written (`ready` observed 1, or
    /// the caller has exclusive access after claiming the entry).
    pub unsafe fn entry_vt(self, idx: usize) -> *const () {
        // SAFETY: reads an initialized field through a raw place, without
        // materializing a reference to the partially initialized struct.
        unsafe { ptr::addr_of!((*self.0.add(idx).cast::<EntryPreamble>()).vt).read() }
    }

    /// Entry size of the entry at `idx`.
    ///
    /// # Safety
    ///
    /// As in [`entry_vt`](Self::entry_vt).
    pub unsafe fn entry_size(self, idx: usize) -> usize {
        // SAFETY: as in `entry_vt`.
        unsafe { ptr::addr_of!((*self.0.add(idx).cast::<EntryPreamble>()).size).read() }
    }

    /// Write vtable pointer and size of the entry at `idx`.
    ///
    /// # Safety
    ///
    /// The caller must have claimed the entry (no concurrent access until
    /// `ready` is set).
    pub unsafe fn set_entry_meta(self, idx: usize, vt: *const (), size: usize) {
        // SAFETY: exclusive pre-publication writes through raw places.
        unsafe {
            let entry = self.0.add(idx).cast::<EntryPreamble>();
            ptr::addr_of_mut!((*entry).vt).write(vt);
            ptr::addr_of_mut!((*entry).size).write(size);
        }
    }

    /// Pointer to the payload bytes of the entry at `idx`.
    ///
    /// # Safety
    ///
    /// `idx` must be an entry position inside the block.
    pub unsafe fn payload_ptr(self, idx: usize) -> *mut u8 {
        // SAFETY: stays within the block allocation per the caller
        // contract.
        unsafe { self.0.add(idx + ENTRY_PREAMBLE_SIZE) }
    }
}

fn block_layout(block_size: usize) -> Layout {
    // Callers validate the block size at queue construction.
    Layout::from_size_align(block_size, FUNCTOR_ALIGN).unwrap_or_else(|_| Layout::new::<u8>())
}

/// Allocate and wipe one block; `None` on allocation failure.
pub(crate) fn alloc_block(block_size: usize) -> Option<Block> {
    let layout = block_layout(block_size);
    // SAFETY: `layout` has non-zero size.
    let ptr = unsafe { alloc::alloc(layout) };
    if ptr.is_null() {
        return None;
    }
    let block = Block(ptr);
    // SAFETY: freshly allocated, exclusively owned.
    unsafe { wipe_block(block, block_size) };
    Some(block)
}

/// Reset a block to the empty state: fresh preamble, all ready flags
/// cleared.
///
/// # Safety
///
/// The caller must have exclusive access to the block (fresh allocation, or
/// a drained block with no registered readers).
pub(crate) unsafe fn wipe_block(block: Block, block_size: usize) {
    // SAFETY: exclusive access per the caller contract; plain writes are
    // fine before the block is (re-)published.
    unsafe {
        block.0.cast::<BlockPreamble>().write(BlockPreamble {
            next: AtomicPtr::new(ptr::null_mut()),
            read_idx: AtomicUsize::new(FIRST_ENTRY_IDX),
            read_shared: AtomicU32::new(0),
            #[cfg(debug_assertions)]
            live_objects: AtomicU32::new(0),
        });
        let mut idx = FIRST_ENTRY_IDX;
        while idx < block_size {
            block.0.add(idx).cast::<usize>().write(0);
            idx += FUNCTOR_ALIGN;
        }
    }
}

/// Free one block allocation.
///
/// # Safety
///
/// The block must have been allocated with [`alloc_block`] using the same
/// `block_size`, and no references into it may remain.
pub(crate) unsafe fn free_block(block: Block, block_size: usize) {
    // SAFETY: same layout as the allocation, per the caller contract.
    unsafe { alloc::dealloc(block.0, block_layout(block_size)) };
}
