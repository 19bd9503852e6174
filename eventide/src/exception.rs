//! Cross-boundary exception transport.
//!
//! A panic raised inside a queued callable must not tear down the worker
//! thread that happened to invoke it. This module captures unwinds into an
//! [`Exception`] handle that can cross thread boundaries and be re-raised at
//! the right place: the `invoke` call site, or the event loop's error
//! handler.
//!
//! A handle carries either the native panic payload (when it was captured by
//! this crate, identified by a *rethrower tag*) or just a categorized
//! [`ErrorKind`] with a message. Re-raising a native payload preserves the
//! exact panic value; anything else is reconstructed as a [`Fault`] chosen
//! from the error code.
//!
//! Handles for bare error codes come from a process-wide table keyed by
//! code, so capturing an error code allocates at most once per code for the
//! lifetime of the process. The table is guarded by an
//! [`AtomicSharedMutex`]; a shared read is the fast path.

use std::any::Any;
use std::borrow::Cow;
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;

use lazy_static::lazy_static;

use crate::error::ErrorKind;
use crate::sync::AtomicSharedMutex;

/// Typed panic payload raised and recognized by this crate.
///
/// Raising a `Fault` instead of a bare string gives the capture path a
/// category to transport; a rethrown foreign or code-only handle is
/// reconstructed as a `Fault` as well, so callers can downcast the payload
/// and inspect kind and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    kind: ErrorKind,
    message: Cow<'static, str>,
}

impl Fault {
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Fault {}

/// Raise a categorized failure as a panic.
pub fn fault(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> ! {
    panic::panic_any(Fault::new(kind, message))
}

/// Backing record of an [`Exception`] handle.
struct ExceptionRecord {
    /// Native panic payload; present only for locally captured unwinds.
    payload: Option<Box<dyn Any + Send>>,
    message: Cow<'static, str>,
    /// Identifies the library that captured the payload. Only a handle whose
    /// tag equals [`local_tag`] may resume the payload as-is.
    rethrower: usize,
    kind: ErrorKind,
    /// Static records are process-wide and never freed.
    is_static: bool,
}

/// Tag value meaning "no native payload; reconstruct from the code".
const CODE_ONLY_TAG: usize = 0;

static TAG_ANCHOR: u8 = 0;

/// Rethrower tag of this crate's capture machinery.
fn local_tag() -> usize {
    core::ptr::addr_of!(TAG_ANCHOR) as usize
}

/// Process-wide table of per-code static records.
struct CodeTable {
    lock: AtomicSharedMutex,
    map: UnsafeCell<HashMap<ErrorKind, &'static ExceptionRecord>>,
}

// SAFETY: all access to `map` goes through `lock`: lookups hold the shared
// lock, the insert path holds the unique lock, and the stored references
// point at leaked (immutable, 'static) records.
unsafe impl Sync for CodeTable {}

/// Wrapper for records stored in statics. Static records never carry a
/// payload and are immutable after creation, so sharing them is sound.
struct StaticRecord(ExceptionRecord);

// SAFETY: see above; the non-`Sync` payload field is always `None` in a
// static record.
unsafe impl Sync for StaticRecord {}

lazy_static! {
    static ref CODE_TABLE: CodeTable = CodeTable {
        lock: AtomicSharedMutex::new(),
        map: UnsafeCell::new(HashMap::new()),
    };

    /// Distinguished record for capture failure.
    static ref BAD_CAPTURE: StaticRecord = StaticRecord(ExceptionRecord {
        payload: None,
        message: Cow::Borrowed(ErrorKind::BadException.as_str()),
        rethrower: CODE_ONLY_TAG,
        kind: ErrorKind::BadException,
        is_static: true,
    });
}

/// Owning handle to a captured exception.
///
/// "No error" is represented by the absence of a handle
/// (`Option<Exception>`). Ownership enforces the single-consumption
/// contract: a handle is either [`rethrow`](Exception::rethrow)n or
/// discarded (dropped) exactly once.
pub struct Exception {
    rec: NonNull<ExceptionRecord>,
}

// SAFETY: the record owns its payload (`Box<dyn Any + Send>`) and strings;
// static records are immutable. Nothing in a record is tied to a thread.
unsafe impl Send for Exception {}

impl Exception {
    /// Handle for a bare error code, from the process-wide table.
    ///
    /// No allocation after the first use of a given code.
    pub fn from_kind(kind: ErrorKind) -> Self {
        let table = &*CODE_TABLE;
        table.lock.lock_shared();
        // SAFETY: shared lock held; the map is only mutated under the
        // unique lock.
        let found = unsafe { (*table.map.get()).get(&kind).copied() };
        table.lock.unlock_shared();
        if let Some(rec) = found {
            return Self::from_static(rec);
        }

        table.lock.lock();
        // SAFETY: unique lock held, no shared readers remain.
        let rec = unsafe {
            let map = &mut *table.map.get();
            *map.entry(kind).or_insert_with(|| {
                &*Box::leak(Box::new(ExceptionRecord {
                    payload: None,
                    message: Cow::Borrowed(kind.as_str()),
                    rethrower: CODE_ONLY_TAG,
                    kind,
                    is_static: true,
                }))
            })
        };
        table.lock.unlock();
        Self::from_static(rec)
    }

    /// Handle carrying an explicit message, without a native payload.
    pub fn with_message(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self::from_record(ExceptionRecord {
            payload: None,
            message: message.into(),
            rethrower: CODE_ONLY_TAG,
            kind,
            is_static: false,
        })
    }

    /// The distinguished capture-failure handle.
    pub fn bad_capture() -> Self {
        Self::from_static(&BAD_CAPTURE.0)
    }

    fn from_static(rec: &'static ExceptionRecord) -> Self {
        Self {
            rec: NonNull::from(rec),
        }
    }

    fn from_record(rec: ExceptionRecord) -> Self {
        Self {
            // Box never returns null.
            rec: NonNull::from(Box::leak(Box::new(rec))),
        }
    }

    /// Run `f`, capturing any unwind into a handle.
    ///
    /// The closure is wrapped in `AssertUnwindSafe`: callers hand whole
    /// callables across this boundary and the crate makes no attempt to
    /// reason about their interior state after a panic.
    pub fn catch<R>(f: impl FnOnce() -> R) -> Result<R, Exception> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(r) => Ok(r),
            Err(payload) => Err(Self::from_panic(payload)),
        }
    }

    /// Run `f`, writing a captured unwind into `slot` and returning the
    /// default value. The vtable try-invoke path is built on this.
    pub fn catch_into<R: Default>(slot: &mut Option<Exception>, f: impl FnOnce() -> R) -> R {
        match Self::catch(f) {
            Ok(r) => r,
            Err(e) => {
                debug_assert!(slot.is_none(), "exception slot already occupied");
                if slot.is_none() {
                    *slot = Some(e);
                }
                R::default()
            }
        }
    }

    /// Categorize a caught panic payload.
    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        // A payload that is itself a handle cannot be nested; treat it as a
        // capture failure and release the inner handle.
        let payload = match payload.downcast::<Exception>() {
            Ok(inner) => {
                drop(*inner);
                return Self::bad_capture();
            }
            Err(p) => p,
        };

        let (kind, message): (ErrorKind, Cow<'static, str>) =
            if let Some(f) = payload.downcast_ref::<Fault>() {
                (f.kind(), Cow::Owned(f.message().to_owned()))
            } else if let Some(s) = payload.downcast_ref::<&'static str>() {
                (ErrorKind::Other, Cow::Borrowed(*s))
            } else if let Some(s) = payload.downcast_ref::<String>() {
                (ErrorKind::Other, Cow::Owned(s.clone()))
            } else {
                (ErrorKind::Other, Cow::Borrowed("unknown panic"))
            };

        Self::from_record(ExceptionRecord {
            payload: Some(payload),
            message,
            rethrower: local_tag(),
            kind,
            is_static: false,
        })
    }

    pub fn kind(&self) -> ErrorKind {
        // SAFETY: the handle owns (or statically references) its record.
        unsafe { self.rec.as_ref().kind }
    }

    pub fn message(&self) -> &str {
        // SAFETY: as in `kind`.
        unsafe { &self.rec.as_ref().message }
    }

    /// Whether this handle was captured by this crate and still carries the
    /// native payload.
    pub fn is_native(&self) -> bool {
        // SAFETY: as in `kind`.
        let rec = unsafe { self.rec.as_ref() };
        rec.rethrower == local_tag() && rec.payload.is_some()
    }

    /// Re-raise the captured exception, consuming the handle.
    ///
    /// A handle captured by this crate resumes the original panic payload
    /// unchanged; any other handle is reconstructed as a [`Fault`] with the
    /// handle's kind and message.
    pub fn rethrow(self) -> ! {
        let ptr = self.into_raw();
        // SAFETY: the handle owned the record and has been consumed; `ptr`
        // is the unique access path from here on.
        let rec = unsafe { &*ptr };
        if rec.is_static {
            fault(rec.kind, rec.message.clone());
        }
        // SAFETY: non-static records were leaked from a Box in
        // `from_record` and are uniquely owned by the handle.
        let mut boxed = unsafe { Box::from_raw(ptr) };
        if boxed.rethrower == local_tag() {
            if let Some(payload) = boxed.payload.take() {
                drop(boxed);
                panic::resume_unwind(payload);
            }
        }
        let kind = boxed.kind;
        let message = core::mem::replace(&mut boxed.message, Cow::Borrowed(""));
        drop(boxed);
        fault(kind, message)
    }

    /// Release the handle without re-raising. Equivalent to dropping it;
    /// provided for call sites that want the discard to be visible.
    pub fn discard(self) {
        drop(self);
    }

    fn into_raw(self) -> *mut ExceptionRecord {
        let ptr = self.rec.as_ptr();
        core::mem::forget(self);
        ptr
    }
}

impl Drop for Exception {
    fn drop(&mut self) {
        // SAFETY: the handle owns its record; static records are shared and
        // never freed.
        unsafe {
            if !self.rec.as_ref().is_static {
                drop(Box::from_raw(self.rec.as_ptr()));
            }
        }
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exception")
            .field("kind", &self.kind())
            .field("message", &self.message())
            .field("native", &self.is_native())
            .finish()
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_kind_is_shared_static() {
        let a = Exception::from_kind(ErrorKind::OutOfMemory);
        let b = Exception::from_kind(ErrorKind::OutOfMemory);
        assert_eq!(a.rec.as_ptr(), b.rec.as_ptr());
        assert_eq!(a.kind(), ErrorKind::OutOfMemory);
        assert_eq!(a.message(), "out of memory");
        a.discard();
        b.discard();
    }

    #[test]
    fn test_catch_categorizes_fault() {
        let err = Exception::catch(|| -> () { fault(ErrorKind::InvalidArgument, "bad") })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.message(), "bad");
        assert!(err.is_native());
        err.discard();
    }

    #[test]
    fn test_catch_categorizes_str_panic() {
        let err = Exception::catch(|| -> () { panic!("boom") }).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert_eq!(err.message(), "boom");
        err.discard();
    }

    #[test]
    fn test_rethrow_preserves_native_payload() {
        let err = Exception::catch(|| -> () { fault(ErrorKind::Range, "r") }).unwrap_err();
        let again = Exception::catch(move || -> () { err.rethrow() }).unwrap_err();
        assert_eq!(again.kind(), ErrorKind::Range);
        assert_eq!(again.message(), "r");
        again.discard();
    }

    #[test]
    fn test_rethrow_reconstructs_code_only_handle() {
        let err = Exception::from_kind(ErrorKind::Domain);
        let caught = Exception::catch(move || -> () { err.rethrow() }).unwrap_err();
        assert_eq!(caught.kind(), ErrorKind::Domain);
        caught.discard();
    }

    #[test]
    fn test_nested_handle_is_bad_capture() {
        let inner = Exception::from_kind(ErrorKind::Io);
        let err =
            Exception::catch(move || -> () { panic::panic_any(inner) }).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadException);
        err.discard();
    }

    #[test]
    fn test_catch_into_returns_default() {
        let mut slot = None;
        let v: i32 = Exception::catch_into(&mut slot, || -> i32 { panic!("x") });
        assert_eq!(v, 0);
        assert_eq!(slot.take().map(|e| e.kind()), Some(ErrorKind::Other));
    }
}
