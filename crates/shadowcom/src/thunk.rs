//! Native-callable entry points
//!
//! `#[shadow_interface]` generates one `extern` thunk per method; each forwards here.
//! The helpers recover the callback from `this`, look up the typed view, run the call
//! under `catch_unwind` and turn every failure into a status code. Nothing unwinds into
//! the native caller.
//!
//! The IUnknown thunks at slots 0-2 of every COM shadow are defined here as well.

use std::any::Any;
use std::ffi::c_void;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::com::{
    E_INVALIDARG, E_NOINTERFACE, E_POINTER, E_UNEXPECTED, GUID, HRESULT, RPC_E_DISCONNECTED,
    S_OK,
};
use crate::error::{CallbackError, CallbackResult, Error};
use crate::shadow::{ShadowHeader, ShadowInterface};

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("callback panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("callback panicked: {message}")
    } else {
        "callback panicked".to_string()
    }
}

/// Run `call` against the `I` view of the object behind `this`.
///
/// # Safety
/// `this` must be null or a live shadow.
unsafe fn dispatch<I, R, F>(this: *mut c_void, call: F) -> CallbackResult<R>
where
    I: ShadowInterface + ?Sized,
    F: FnOnce(&I) -> CallbackResult<R>,
{
    let Some(core) = (unsafe { ShadowHeader::core(this) }) else {
        return Err(CallbackError::new(
            E_POINTER,
            format!("{} called with a null this pointer", I::NAME),
        ));
    };

    let result = match core.view::<I>() {
        Some(target) => match catch_unwind(AssertUnwindSafe(|| call(&*target))) {
            Ok(result) => result,
            Err(payload) => Err(CallbackError::new(E_UNEXPECTED, panic_message(&*payload))),
        },
        None => Err(CallbackError::new(
            RPC_E_DISCONNECTED,
            format!("{} is no longer alive", core.type_name()),
        )),
    };

    if let Err(err) = &result {
        core.report_failure(I::NAME, err);
    }
    result
}

/// `fn(&self, ..) -> CallbackResult` → `HRESULT`
///
/// # Safety
/// `this` must be null or a live shadow.
pub unsafe fn dispatch_status<I, F>(this: *mut c_void, call: F) -> HRESULT
where
    I: ShadowInterface + ?Sized,
    F: FnOnce(&I) -> CallbackResult,
{
    match unsafe { dispatch::<I, (), _>(this, call) } {
        Ok(()) => S_OK,
        Err(err) => err.code(),
    }
}

/// `fn(&self, ..) -> CallbackResult<T>` → `HRESULT` with `T` written to `out`
///
/// # Safety
/// `this` must be null or a live shadow; `out` must be null or writable.
pub unsafe fn dispatch_out<I, T, F>(this: *mut c_void, out: *mut T, call: F) -> HRESULT
where
    I: ShadowInterface + ?Sized,
    F: FnOnce(&I) -> CallbackResult<T>,
{
    if out.is_null() {
        return E_POINTER;
    }
    match unsafe { dispatch::<I, T, _>(this, call) } {
        Ok(value) => {
            unsafe { out.write(value) };
            S_OK
        }
        Err(err) => err.code(),
    }
}

/// `fn(&self, ..) -> T` → `T`, `T::default()` on failure
///
/// # Safety
/// `this` must be null or a live shadow.
pub unsafe fn dispatch_value<I, R, F>(this: *mut c_void, call: F) -> R
where
    I: ShadowInterface + ?Sized,
    R: Default,
    F: FnOnce(&I) -> R,
{
    unsafe { dispatch::<I, R, _>(this, |target| Ok(call(target))) }.unwrap_or_default()
}

/// `fn(&self, ..)` → void
///
/// # Safety
/// `this` must be null or a live shadow.
pub unsafe fn dispatch_void<I, F>(this: *mut c_void, call: F)
where
    I: ShadowInterface + ?Sized,
    F: FnOnce(&I),
{
    let _ = unsafe { dispatch::<I, (), _>(this, |target| Ok(call(target))) };
}

// =============================================================================
// IUnknown thunks
// =============================================================================

macro_rules! com_entry {
    ($(#[$meta:meta])* fn $name:ident($($arg:ident: $ty:ty),*) -> $ret:ty $body:block) => {
        $(#[$meta])*
        #[cfg(target_arch = "x86")]
        pub(crate) unsafe extern "stdcall" fn $name($($arg: $ty),*) -> $ret $body

        $(#[$meta])*
        #[cfg(not(target_arch = "x86"))]
        pub(crate) unsafe extern "C" fn $name($($arg: $ty),*) -> $ret $body
    };
}

unsafe fn query_interface_impl(
    this: *mut c_void,
    riid: *const GUID,
    ppv: *mut *mut c_void,
) -> HRESULT {
    if ppv.is_null() {
        return E_POINTER;
    }
    unsafe { *ppv = std::ptr::null_mut() };
    if riid.is_null() {
        return E_INVALIDARG;
    }
    let Some(core) = (unsafe { ShadowHeader::core(this) }) else {
        return E_POINTER;
    };
    let iid = unsafe { *riid };

    match catch_unwind(AssertUnwindSafe(|| core.query_interface(&iid))) {
        Ok(Ok(shadow)) => {
            unsafe { *ppv = shadow };
            S_OK
        }
        Ok(Err(Error::InterfaceNotImplemented { .. } | Error::ConfigurationMissing { .. })) => {
            E_NOINTERFACE
        }
        Ok(Err(err)) => err.code(),
        Err(payload) => {
            let err = CallbackError::new(E_UNEXPECTED, panic_message(&*payload));
            core.report_failure("IUnknown", &err);
            err.code()
        }
    }
}

com_entry! {
    /// Slot 0
    fn query_interface(this: *mut c_void, riid: *const GUID, ppv: *mut *mut c_void) -> HRESULT {
        unsafe { query_interface_impl(this, riid, ppv) }
    }
}

com_entry! {
    /// Slot 1
    fn add_ref(this: *mut c_void) -> u32 {
        match unsafe { ShadowHeader::core(this) } {
            Some(core) => core.add_ref(),
            None => 0,
        }
    }
}

com_entry! {
    /// Slot 2
    fn release(this: *mut c_void) -> u32 {
        match unsafe { ShadowHeader::core(this) } {
            Some(core) => core.release(),
            None => 0,
        }
    }
}
