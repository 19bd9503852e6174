//! Owning and borrowing containers for type-erased callables.
//!
//! [`Functor`] owns one callable behind a [`FunctorVt`]: payloads up to
//! seven machine words live inline, larger ones spill to a 64-byte-aligned
//! heap allocation. [`FunctorView`] borrows a callable without owning it
//! and carries a *movable* flag; a movable view can hand its payload off
//! exactly once (to a [`Functor`] or into the queue), after which both the
//! view and the source are left holding the empty vtable so a second move
//! is caught as [`ErrorKind::BadCall`] instead of double-using the payload.

pub mod vtable;

use core::alloc::Layout;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use std::alloc;

use crate::error::{Completion, ErrorKind};
use crate::exception::Exception;

pub use vtable::{FunctorVt, FUNCTOR_ALIGN};

/// Payload bytes stored inline inside a [`Functor`].
pub const INLINE_CAPACITY: usize = 7 * core::mem::size_of::<*const ()>();

union Storage {
    ptr: *mut u8,
    data: [MaybeUninit<u8>; INLINE_CAPACITY],
}

fn heap_layout(size: usize) -> Layout {
    // Size and alignment are validated when the vtable is built, so this
    // cannot fail for any payload the crate accepts.
    Layout::from_size_align(size.max(1), FUNCTOR_ALIGN)
        .unwrap_or_else(|_| Layout::new::<u8>())
}

/// Owning container for one type-erased callable `FnMut(&A) -> R`.
///
/// A default-constructed functor is *empty*: it carries the empty vtable
/// and invoking it raises [`ErrorKind::BadCall`].
#[repr(C, align(64))]
pub struct Functor<A: 'static, R: Default + 'static = Completion> {
    storage: Storage,
    vt: &'static FunctorVt<A, R>,
}

// SAFETY: every constructor requires the payload type to be `Send`, and the
// vtable reference is 'static shared data.
unsafe impl<A: 'static, R: Default + 'static> Send for Functor<A, R> {}

impl<A: 'static, R: Default + 'static> Functor<A, R> {
    /// Take ownership of a callable.
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut(&A) -> R + Send + 'static,
    {
        Self::construct(FunctorVt::of_static::<F>(), f)
    }

    /// Take ownership of a cloneable callable, enabling the copy paths
    /// ([`try_clone`](Self::try_clone), non-forwarding view promotion).
    pub fn cloneable<F>(f: F) -> Self
    where
        F: FnMut(&A) -> R + Clone + Send + 'static,
    {
        Self::construct(FunctorVt::of_cloneable_static::<F>(), f)
    }

    /// The empty functor; invoking it raises [`ErrorKind::BadCall`].
    pub fn empty() -> Self {
        Self {
            storage: Storage {
                data: [MaybeUninit::uninit(); INLINE_CAPACITY],
            },
            vt: FunctorVt::empty_static(),
        }
    }

    fn construct<F>(vt: &'static FunctorVt<A, R>, f: F) -> Self
    where
        F: FnMut(&A) -> R + Send + 'static,
    {
        let mut storage = Storage {
            data: [MaybeUninit::uninit(); INLINE_CAPACITY],
        };
        if core::mem::size_of::<F>() > INLINE_CAPACITY {
            let layout = heap_layout(vt.size());
            // SAFETY: `layout` has non-zero size and valid alignment.
            let ptr = unsafe { alloc::alloc(layout) };
            if ptr.is_null() {
                alloc::handle_alloc_error(layout);
            }
            // SAFETY: freshly allocated storage of sufficient size and
            // alignment for `F`.
            unsafe { ptr.cast::<F>().write(f) };
            storage.ptr = ptr;
        } else {
            // SAFETY: the inline buffer is 64-aligned (struct alignment)
            // and at least `size_of::<F>()` bytes.
            unsafe {
                storage.data.as_mut_ptr().cast::<F>().write(f);
            }
        }
        Self { storage, vt }
    }

    /// Move-construct from raw payload bytes described by `vt`.
    ///
    /// # Safety
    ///
    /// `src` must point at a live payload of `vt`'s type. Ownership of the
    /// payload transfers to the new functor; the caller must not drop the
    /// source payload afterwards.
    pub(crate) unsafe fn move_construct(vt: &'static FunctorVt<A, R>, src: *const u8) -> Self {
        let mut storage = Storage {
            data: [MaybeUninit::uninit(); INLINE_CAPACITY],
        };
        let size = vt.size();
        let dst = if size > INLINE_CAPACITY {
            let layout = heap_layout(size);
            // SAFETY: `layout` has non-zero size and valid alignment.
            let ptr = unsafe { alloc::alloc(layout) };
            if ptr.is_null() {
                alloc::handle_alloc_error(layout);
            }
            storage.ptr = ptr;
            ptr
        } else {
            // SAFETY: union field selection; inline storage is in use for
            // payloads within capacity.
            unsafe { storage.data.as_mut_ptr().cast::<u8>() }
        };
        // SAFETY: `dst` is writable storage of `size` bytes; `src` is a
        // live payload per the caller contract.
        unsafe { core::ptr::copy_nonoverlapping(src, dst, size) };
        Self { storage, vt }
    }

    /// Clone-construct from raw payload bytes described by `vt`.
    ///
    /// # Safety
    ///
    /// `src` must point at a live payload of `vt`'s type.
    pub(crate) unsafe fn clone_construct(
        vt: &'static FunctorVt<A, R>,
        src: *const u8,
    ) -> Result<Self, ErrorKind> {
        if !vt.is_cloneable() {
            return Err(ErrorKind::BadCall);
        }
        let mut storage = Storage {
            data: [MaybeUninit::uninit(); INLINE_CAPACITY],
        };
        let size = vt.size();
        let dst = if size > INLINE_CAPACITY {
            let layout = heap_layout(size);
            // SAFETY: `layout` has non-zero size and valid alignment.
            let ptr = unsafe { alloc::alloc(layout) };
            if ptr.is_null() {
                alloc::handle_alloc_error(layout);
            }
            storage.ptr = ptr;
            ptr
        } else {
            // SAFETY: union field selection; inline storage is in use for
            // payloads within capacity.
            unsafe { storage.data.as_mut_ptr().cast::<u8>() }
        };
        // SAFETY: `dst` is writable storage of `size` bytes; `src` is a
        // live payload per the caller contract.
        unsafe { vt.clone_payload(dst, src)? };
        Ok(Self { storage, vt })
    }

    /// Invoke the callable. Empty functors raise [`ErrorKind::BadCall`].
    pub fn call(&mut self, arg: &A) -> R {
        let vt = self.vt;
        let ptr = self.payload_mut_ptr();
        // SAFETY: the payload is live and exclusively borrowed.
        unsafe { vt.invoke(ptr, arg) }
    }

    /// Invoke the callable, capturing any unwind into `slot`.
    pub fn try_call(&mut self, slot: &mut Option<Exception>, arg: &A) -> R {
        let vt = self.vt;
        let ptr = self.payload_mut_ptr();
        // SAFETY: the payload is live and exclusively borrowed.
        unsafe { vt.try_invoke(ptr, slot, arg) }
    }

    /// Clone the functor; fails with [`ErrorKind::BadCall`] when the
    /// callable type is not cloneable.
    pub fn try_clone(&self) -> Result<Self, ErrorKind> {
        // SAFETY: the payload is live for the duration of the clone.
        unsafe { Self::clone_construct(self.vt, self.payload_ptr()) }
    }

    /// Whether this functor holds no callable.
    pub fn is_empty(&self) -> bool {
        self.vt.is_empty()
    }

    pub fn vt(&self) -> &'static FunctorVt<A, R> {
        self.vt
    }

    pub(crate) fn payload_ptr(&self) -> *const u8 {
        if self.vt.size() > INLINE_CAPACITY {
            // SAFETY: heap storage is in use for payloads above capacity.
            unsafe { self.storage.ptr }
        } else {
            // SAFETY: inline storage is in use for payloads within
            // capacity.
            unsafe { self.storage.data.as_ptr().cast() }
        }
    }

    pub(crate) fn payload_mut_ptr(&mut self) -> *mut u8 {
        if self.vt.size() > INLINE_CAPACITY {
            // SAFETY: heap storage is in use for payloads above capacity.
            unsafe { self.storage.ptr }
        } else {
            // SAFETY: inline storage is in use for payloads within
            // capacity.
            unsafe { self.storage.data.as_mut_ptr().cast() }
        }
    }

    /// Release storage after the payload has been moved out: the heap
    /// buffer (if any) is freed without running the destructor and the
    /// functor is left empty.
    ///
    /// # Safety
    ///
    /// The payload must have been moved out (its bytes copied to storage
    /// that now owns it) and must not be used through this functor again.
    pub(crate) unsafe fn release_moved(&mut self) {
        let size = self.vt.size();
        if size > INLINE_CAPACITY {
            // SAFETY: heap storage is in use and the payload inside it has
            // been moved out, so only the buffer itself remains.
            unsafe { alloc::dealloc(self.storage.ptr, heap_layout(size)) };
        }
        self.vt = FunctorVt::empty_static();
    }
}

impl<A: 'static, R: Default + 'static> Default for Functor<A, R> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<A: 'static, R: Default + 'static> Drop for Functor<A, R> {
    fn drop(&mut self) {
        let size = self.vt.size();
        if size > INLINE_CAPACITY {
            // SAFETY: heap storage is in use; destroy the payload, then
            // free the buffer.
            unsafe {
                let ptr = self.storage.ptr;
                self.vt.drop_payload(ptr);
                alloc::dealloc(ptr, heap_layout(size));
            }
        } else {
            // SAFETY: inline storage is in use and the payload is live
            // (empty vtables have a no-op destructor).
            unsafe {
                self.vt.drop_payload(self.storage.data.as_mut_ptr().cast());
            }
        }
    }
}

impl<A: 'static, R: Default + 'static> core::fmt::Debug for Functor<A, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Functor")
            .field("size", &self.vt.size())
            .field("empty", &self.is_empty())
            .field("inline", &(self.vt.size() <= INLINE_CAPACITY))
            .finish()
    }
}

/// Non-owning reference to a callable, with a movable flag.
///
/// Views over a borrowed closure are never movable; views created with
/// [`forwarding`](FunctorView::forwarding) over an owning [`Functor`] are.
/// Consuming the move capability (via [`to_functor`](FunctorView::to_functor)
/// with `forward = true`, or a queue push) empties both the view and the
/// source functor.
pub struct FunctorView<'a, A: 'static, R: Default + 'static = Completion> {
    vt: &'static FunctorVt<A, R>,
    ptr: *mut u8,
    /// Present when the view may consume the payload of an owning functor.
    owner: Option<NonNull<Functor<A, R>>>,
    _borrow: PhantomData<&'a mut ()>,
}

impl<'a, A: 'static, R: Default + 'static> FunctorView<'a, A, R> {
    /// View of a borrowed callable. Not movable; not promotable to an
    /// owning functor (the callable type is not known to be cloneable).
    pub fn from_fn<F>(f: &'a mut F) -> Self
    where
        F: FnMut(&A) -> R + Send + 'static,
    {
        Self {
            vt: FunctorVt::of_static::<F>(),
            ptr: (f as *mut F).cast(),
            owner: None,
            _borrow: PhantomData,
        }
    }

    /// View of a borrowed cloneable callable. Not movable, but promotable
    /// by copy.
    pub fn from_cloneable<F>(f: &'a mut F) -> Self
    where
        F: FnMut(&A) -> R + Clone + Send + 'static,
    {
        Self {
            vt: FunctorVt::of_cloneable_static::<F>(),
            ptr: (f as *mut F).cast(),
            owner: None,
            _borrow: PhantomData,
        }
    }

    /// View of an owning functor. Not movable.
    pub fn of(f: &'a mut Functor<A, R>) -> Self {
        Self {
            vt: f.vt(),
            ptr: f.payload_mut_ptr(),
            owner: None,
            _borrow: PhantomData,
        }
    }

    /// View of an owning functor that may consume its payload.
    pub fn forwarding(f: &'a mut Functor<A, R>) -> Self {
        Self {
            vt: f.vt(),
            ptr: f.payload_mut_ptr(),
            owner: Some(NonNull::from(f)),
            _borrow: PhantomData,
        }
    }

    /// Whether the view may move the payload out of its source.
    pub fn movable(&self) -> bool {
        self.owner.is_some()
    }

    pub fn vt(&self) -> &'static FunctorVt<A, R> {
        self.vt
    }

    pub fn is_empty(&self) -> bool {
        self.vt.is_empty()
    }

    pub(crate) fn payload_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Invoke the referenced callable.
    pub fn call(&mut self, arg: &A) -> R {
        // SAFETY: the view exclusively borrows the callable for 'a and the
        // payload is live (empty views dispatch to the empty table, which
        // ignores the pointer).
        unsafe { self.vt.invoke(self.ptr, arg) }
    }

    /// Invoke the referenced callable, capturing any unwind into `slot`.
    pub fn try_call(&mut self, slot: &mut Option<Exception>, arg: &A) -> R {
        // SAFETY: as in `call`.
        unsafe { self.vt.try_invoke(self.ptr, slot, arg) }
    }

    /// Promote the view to an owning [`Functor`].
    ///
    /// With `forward = true` on a movable view the payload is moved out of
    /// the source functor, which is left empty, and the view becomes
    /// empty too. Otherwise the payload is cloned; fails with
    /// [`ErrorKind::BadCall`] when the callable type is not cloneable.
    pub fn to_functor(&mut self, forward: bool) -> Result<Functor<A, R>, ErrorKind> {
        if forward {
            if let Some(mut owner) = self.owner.take() {
                // SAFETY: the view holds the exclusive borrow of the owner
                // for 'a; the payload is moved out and the owner is
                // released without running the payload destructor.
                let moved = unsafe {
                    let src = owner.as_mut();
                    let moved = Functor::move_construct(self.vt, src.payload_ptr());
                    src.release_moved();
                    moved
                };
                self.vt = FunctorVt::empty_static();
                self.ptr = core::ptr::null_mut();
                return Ok(moved);
            }
        }
        // SAFETY: the payload is live for the duration of the clone.
        unsafe { Functor::clone_construct(self.vt, self.ptr) }
    }

    /// Finish a forwarding hand-off after the payload bytes were copied
    /// out by a receiver (the queue push path): the source functor is
    /// released without running the payload destructor and the view is
    /// emptied.
    ///
    /// # Safety
    ///
    /// The payload must have been moved out of the source storage.
    pub(crate) unsafe fn complete_forward(&mut self) {
        if let Some(mut owner) = self.owner.take() {
            // SAFETY: exclusive borrow held for 'a; caller guarantees the
            // payload was moved out.
            unsafe { owner.as_mut().release_moved() };
        }
        self.vt = FunctorVt::empty_static();
        self.ptr = core::ptr::null_mut();
    }
}

impl<A: 'static, R: Default + 'static> core::fmt::Debug for FunctorView<'_, A, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FunctorView")
            .field("size", &self.vt.size())
            .field("movable", &self.movable())
            .field("empty", &self.is_empty())
            .finish()
    }
}
