//! Per-type dispatch tables for type-erased callables.
//!
//! A [`FunctorVt`] is a plain value: the payload size plus the function
//! pointers needed to destroy, clone, and invoke a callable through a raw
//! pointer. There is exactly one table per distinct callable type, obtained
//! by constant promotion, so a `&'static FunctorVt` can be stored next to
//! raw payload bytes (in a [`Functor`](crate::Functor) or a queue block)
//! and shared freely between threads.
//!
//! Rust moves are bitwise, so unlike a classical vtable there is no move
//! entry: relocating a payload is `copy_nonoverlapping` plus not running
//! the destructor on the source. Copying collapses into `clone_into`,
//! present only for `Clone` callables.

use core::marker::PhantomData;

use crate::error::ErrorKind;
use crate::exception::{fault, Exception};

/// Alignment unit for functor payload storage, in bytes.
pub const FUNCTOR_ALIGN: usize = 64;

/// Dispatch table describing one callable type `F: FnMut(&A) -> R`.
pub struct FunctorVt<A: 'static, R: 'static> {
    /// Payload size in bytes (`size_of::<F>()`, unaligned; storage sites
    /// round up to [`FUNCTOR_ALIGN`]).
    size: usize,
    /// Whether this is the distinguished empty table.
    empty: bool,
    drop_in_place: unsafe fn(*mut u8),
    clone_into: Option<unsafe fn(*mut u8, *const u8)>,
    invoke: unsafe fn(*mut u8, &A) -> R,
    try_invoke: unsafe fn(*mut u8, &mut Option<Exception>, &A) -> R,
}

/// # Safety
///
/// `ptr` must point at a live, properly aligned `F`.
unsafe fn drop_fn<F>(ptr: *mut u8) {
    // SAFETY: forwarded caller contract.
    unsafe { core::ptr::drop_in_place(ptr.cast::<F>()) }
}

/// # Safety
///
/// `src` must point at a live `F`; `dst` must point at writable storage
/// for one `F`.
unsafe fn clone_fn<F: Clone>(dst: *mut u8, src: *const u8) {
    // SAFETY: forwarded caller contract.
    unsafe { dst.cast::<F>().write((*src.cast::<F>()).clone()) }
}

/// # Safety
///
/// `ptr` must point at a live `F` with exclusive access for the duration
/// of the call.
unsafe fn invoke_fn<A, R, F: FnMut(&A) -> R>(ptr: *mut u8, arg: &A) -> R {
    // SAFETY: forwarded caller contract.
    let f = unsafe { &mut *ptr.cast::<F>() };
    f(arg)
}

/// # Safety
///
/// As in [`invoke_fn`].
unsafe fn try_invoke_fn<A, R: Default, F: FnMut(&A) -> R>(
    ptr: *mut u8,
    slot: &mut Option<Exception>,
    arg: &A,
) -> R {
    // SAFETY: forwarded caller contract.
    let f = unsafe { &mut *ptr.cast::<F>() };
    Exception::catch_into(slot, || f(arg))
}

fn noop_drop(_: *mut u8) {}

fn noop_clone(_: *mut u8, _: *const u8) {}

fn empty_invoke<A, R>(_: *mut u8, _: &A) -> R {
    fault(ErrorKind::BadCall, "empty functor invoked")
}

fn empty_try_invoke<A, R: Default>(_: *mut u8, slot: &mut Option<Exception>, _: &A) -> R {
    Exception::catch_into(slot, || -> R {
        fault(ErrorKind::BadCall, "empty functor invoked")
    })
}

impl<A: 'static, R: Default + 'static> FunctorVt<A, R> {
    /// Table for a callable type.
    pub const fn of<F: FnMut(&A) -> R + 'static>() -> Self {
        assert!(
            core::mem::align_of::<F>() <= FUNCTOR_ALIGN,
            "callable alignment exceeds the functor alignment unit"
        );
        Self {
            size: core::mem::size_of::<F>(),
            empty: false,
            drop_in_place: drop_fn::<F>,
            clone_into: None,
            invoke: invoke_fn::<A, R, F>,
            try_invoke: try_invoke_fn::<A, R, F>,
        }
    }

    /// Table for a cloneable callable type; enables the copy paths
    /// (`Functor::try_clone`, non-forwarding view promotion).
    pub const fn of_cloneable<F: FnMut(&A) -> R + Clone + 'static>() -> Self {
        assert!(
            core::mem::align_of::<F>() <= FUNCTOR_ALIGN,
            "callable alignment exceeds the functor alignment unit"
        );
        Self {
            size: core::mem::size_of::<F>(),
            empty: false,
            drop_in_place: drop_fn::<F>,
            clone_into: Some(clone_fn::<F>),
            invoke: invoke_fn::<A, R, F>,
            try_invoke: try_invoke_fn::<A, R, F>,
        }
    }

    /// The empty table: zero size, no-op destructor, invoke paths that
    /// raise [`ErrorKind::BadCall`]. Default-constructed and moved-out
    /// functors carry it.
    pub const fn empty() -> Self {
        Self {
            size: 0,
            empty: true,
            drop_in_place: noop_drop,
            clone_into: Some(noop_clone),
            invoke: empty_invoke::<A, R>,
            try_invoke: empty_try_invoke::<A, R>,
        }
    }

    /// Process-wide table for `F`, created on first use.
    pub fn of_static<F: FnMut(&A) -> R + 'static>() -> &'static Self {
        struct Anchor<A: 'static, R: 'static, F>(PhantomData<(fn(&A) -> R, F)>);
        impl<A: 'static, R: Default + 'static, F: FnMut(&A) -> R + 'static> Anchor<A, R, F> {
            const VT: FunctorVt<A, R> = FunctorVt::of::<F>();
        }
        &Anchor::<A, R, F>::VT
    }

    /// Process-wide cloneable table for `F`.
    pub fn of_cloneable_static<F: FnMut(&A) -> R + Clone + 'static>() -> &'static Self {
        struct Anchor<A: 'static, R: 'static, F>(PhantomData<(fn(&A) -> R, F)>);
        impl<A: 'static, R: Default + 'static, F: FnMut(&A) -> R + Clone + 'static>
            Anchor<A, R, F>
        {
            const VT: FunctorVt<A, R> = FunctorVt::of_cloneable::<F>();
        }
        &Anchor::<A, R, F>::VT
    }

    /// Process-wide empty table.
    pub fn empty_static() -> &'static Self {
        struct Anchor<A: 'static, R: 'static>(PhantomData<fn(&A) -> R>);
        impl<A: 'static, R: Default + 'static> Anchor<A, R> {
            const VT: FunctorVt<A, R> = FunctorVt::empty();
        }
        &Anchor::<A, R>::VT
    }
}

impl<A: 'static, R: 'static> FunctorVt<A, R> {
    /// Payload size in bytes, unaligned.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this is the empty table.
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    /// Whether the copy paths are available for this callable type.
    pub fn is_cloneable(&self) -> bool {
        self.clone_into.is_some()
    }

    /// Destroy the payload in place.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live payload of the type this table was built
    /// for; the payload must not be used afterwards.
    pub unsafe fn drop_payload(&self, ptr: *mut u8) {
        // SAFETY: forwarded caller contract.
        unsafe { (self.drop_in_place)(ptr) }
    }

    /// Clone the payload at `src` into `dst`.
    ///
    /// Fails with [`ErrorKind::BadCall`] when the callable type is not
    /// cloneable.
    ///
    /// # Safety
    ///
    /// `src` must point at a live payload of this table's type; `dst` must
    /// point at writable, properly aligned storage of at least
    /// [`size`](Self::size) bytes that does not overlap `src`.
    pub unsafe fn clone_payload(&self, dst: *mut u8, src: *const u8) -> Result<(), ErrorKind> {
        match self.clone_into {
            // SAFETY: forwarded caller contract.
            Some(clone) => {
                unsafe { clone(dst, src) };
                Ok(())
            }
            None => Err(ErrorKind::BadCall),
        }
    }

    /// Invoke the payload. Panics from the callable propagate to the
    /// caller.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live payload of this table's type, with
    /// exclusive access for the duration of the call.
    pub unsafe fn invoke(&self, ptr: *mut u8, arg: &A) -> R {
        // SAFETY: forwarded caller contract.
        unsafe { (self.invoke)(ptr, arg) }
    }

    /// Invoke the payload, capturing any unwind into `slot` and returning
    /// `R::default()` in that case. Never unwinds past this call.
    ///
    /// # Safety
    ///
    /// As in [`invoke`](Self::invoke).
    pub unsafe fn try_invoke(&self, ptr: *mut u8, slot: &mut Option<Exception>, arg: &A) -> R {
        // SAFETY: forwarded caller contract.
        unsafe { (self.try_invoke)(ptr, slot, arg) }
    }
}

impl<A: 'static, R: 'static> core::fmt::Debug for FunctorVt<A, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FunctorVt")
            .field("size", &self.size)
            .field("empty", &self.empty)
            .field("cloneable", &self.is_cloneable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Completion;

    #[test]
    fn test_vtable_reports_payload_size() {
        let vt = FunctorVt::<u32, Completion>::of_static::<fn(&u32) -> Completion>();
        assert_eq!(vt.size(), core::mem::size_of::<fn(&u32) -> Completion>());
        assert!(!vt.is_empty());
        assert!(!vt.is_cloneable());
    }

    #[test]
    fn test_empty_vtable_try_invoke_captures_bad_call() {
        let vt = FunctorVt::<u32, Completion>::empty_static();
        let mut slot = None;
        // SAFETY: the empty table never dereferences the payload pointer.
        let r = unsafe { vt.try_invoke(core::ptr::null_mut(), &mut slot, &0) };
        assert_eq!(r, Completion::Done);
        let e = slot.take().expect("BadCall must be captured");
        assert_eq!(e.kind(), ErrorKind::BadCall);
        e.discard();
    }

    fn vt_of<A: 'static, R: Default + 'static, F: FnMut(&A) -> R + 'static>(
        _f: &F,
    ) -> &'static FunctorVt<A, R> {
        FunctorVt::of_static::<F>()
    }

    #[test]
    fn test_invoke_runs_closure() {
        let mut f = |arg: &u32| {
            if *arg == 3 {
                Completion::Done
            } else {
                Completion::Canceled
            }
        };
        let vt = vt_of(&f);
        // SAFETY: `f` is live and exclusively borrowed for the call.
        let r = unsafe { vt.invoke(&mut f as *mut _ as *mut u8, &3) };
        assert_eq!(r, Completion::Done);
        // SAFETY: as above.
        let r = unsafe { vt.invoke(&mut f as *mut _ as *mut u8, &4) };
        assert_eq!(r, Completion::Canceled);
    }
}
