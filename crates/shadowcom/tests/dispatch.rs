//! Tests for calling Rust callbacks through shadow vtables

use shadowcom::proc::shadow_interface;
use shadowcom::{
    Callback, CallbackError, CallbackResult, E_FAIL, E_POINTER, E_UNEXPECTED, HRESULT,
    RPC_E_DISCONNECTED, S_OK, VtableRegistry, read_slot,
};
use std::ffi::c_void;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Reinterpret vtable slot `index` of `this` as a function pointer of type `F`.
unsafe fn slot<F: Copy>(this: *mut c_void, index: usize) -> F {
    unsafe { std::mem::transmute_copy(&read_slot(this, index)) }
}

// =============================================================================
// Test: Plain (non-COM) callback interface
// =============================================================================

#[shadow_interface("0b3c8d2a-5e61-4f7a-9c0d-1e2f3a4b5c6d", plain)]
pub trait ICallback {
    fn increment(&self, param: i32) -> i32;
}

struct Incrementer;

impl ICallback for Incrementer {
    fn increment(&self, param: i32) -> i32 {
        param + 1
    }
}

type IncrementFn = unsafe extern "C" fn(*mut c_void, i32) -> i32;

#[test]
fn test_increment_through_slot_zero() {
    let registry = Arc::new(VtableRegistry::new());
    registry.ensure_registered::<dyn ICallback>().unwrap();

    let object = Arc::new(Incrementer);
    let callback = Callback::builder(&registry, object.clone())
        .implements::<dyn ICallback>(object)
        .build();
    let shadow = callback.shadow_for::<dyn ICallback>().unwrap();

    unsafe {
        let increment: IncrementFn = slot(shadow, 0);
        assert_eq!(increment(shadow, 2), 3);
        assert_eq!(increment(shadow, -1), 0);
    }
}

// =============================================================================
// Test: COM interface return mapping
// =============================================================================

#[shadow_interface("7d1e2f30-4a5b-4c6d-8e9f-a0b1c2d3e4f5")]
pub trait IAccumulator {
    fn add(&self, value: i32) -> CallbackResult;
    fn total(&self) -> CallbackResult<i64>;
    fn peek(&self) -> i32;
    fn touch(&self);
}

#[derive(Default)]
struct Accumulator {
    total: AtomicI64,
    touched: AtomicUsize,
}

impl IAccumulator for Accumulator {
    fn add(&self, value: i32) -> CallbackResult {
        if value < 0 {
            return Err(CallbackError::fail("negative values are not accepted"));
        }
        self.total.fetch_add(value as i64, Ordering::SeqCst);
        Ok(())
    }

    fn total(&self) -> CallbackResult<i64> {
        Ok(self.total.load(Ordering::SeqCst))
    }

    fn peek(&self) -> i32 {
        let total = self.total.load(Ordering::SeqCst);
        if total > 100 {
            panic!("accumulator overflow");
        }
        total as i32
    }

    fn touch(&self) {
        self.touched.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(target_arch = "x86")]
mod abi {
    use super::*;
    pub type AddFn = unsafe extern "stdcall" fn(*mut c_void, i32) -> HRESULT;
    pub type TotalFn = unsafe extern "stdcall" fn(*mut c_void, *mut i64) -> HRESULT;
    pub type PeekFn = unsafe extern "stdcall" fn(*mut c_void) -> i32;
    pub type TouchFn = unsafe extern "stdcall" fn(*mut c_void);
}

#[cfg(not(target_arch = "x86"))]
mod abi {
    use super::*;
    pub type AddFn = unsafe extern "C" fn(*mut c_void, i32) -> HRESULT;
    pub type TotalFn = unsafe extern "C" fn(*mut c_void, *mut i64) -> HRESULT;
    pub type PeekFn = unsafe extern "C" fn(*mut c_void) -> i32;
    pub type TouchFn = unsafe extern "C" fn(*mut c_void);
}

use abi::*;

// IUnknown occupies slots 0-2
const ADD: usize = 3;
const TOTAL: usize = 4;
const PEEK: usize = 5;
const TOUCH: usize = 6;

fn accumulator_callback(
    failures: Arc<Mutex<Vec<HRESULT>>>,
) -> (Arc<Accumulator>, Callback) {
    let registry = Arc::new(VtableRegistry::new());
    registry.ensure_registered::<dyn IAccumulator>().unwrap();

    let object = Arc::new(Accumulator::default());
    let callback = Callback::builder(&registry, object.clone())
        .implements::<dyn IAccumulator>(object.clone())
        .on_failure(move |err| failures.lock().unwrap().push(err.code()))
        .build();
    (object, callback)
}

#[test]
fn test_status_and_out_parameter() {
    let failures = Arc::new(Mutex::new(Vec::new()));
    let (_object, callback) = accumulator_callback(failures.clone());
    let shadow = callback.shadow_for::<dyn IAccumulator>().unwrap();

    unsafe {
        let add: AddFn = slot(shadow, ADD);
        let total: TotalFn = slot(shadow, TOTAL);

        assert_eq!(add(shadow, 5), S_OK);
        assert_eq!(add(shadow, 7), S_OK);
        assert_eq!(add(shadow, -1), E_FAIL);

        let mut value = 0i64;
        assert_eq!(total(shadow, &mut value), S_OK);
        assert_eq!(value, 12);
        assert_eq!(total(shadow, std::ptr::null_mut()), E_POINTER);
    }

    assert_eq!(*failures.lock().unwrap(), vec![E_FAIL]);
}

#[test]
fn test_value_and_void_methods() {
    let (object, callback) = accumulator_callback(Arc::default());
    let shadow = callback.shadow_for::<dyn IAccumulator>().unwrap();

    unsafe {
        let add: AddFn = slot(shadow, ADD);
        let peek: PeekFn = slot(shadow, PEEK);
        let touch: TouchFn = slot(shadow, TOUCH);

        add(shadow, 41);
        assert_eq!(peek(shadow), 41);
        touch(shadow);
        touch(shadow);
    }

    assert_eq!(object.touched.load(Ordering::SeqCst), 2);
}

#[test]
fn test_panic_is_contained() {
    let failures = Arc::new(Mutex::new(Vec::new()));
    let (_object, callback) = accumulator_callback(failures.clone());
    let shadow = callback.shadow_for::<dyn IAccumulator>().unwrap();

    unsafe {
        let add: AddFn = slot(shadow, ADD);
        let peek: PeekFn = slot(shadow, PEEK);

        assert_eq!(add(shadow, 500), S_OK);
        // Panics inside the callback come back as the default value
        assert_eq!(peek(shadow), 0);
        // ...and the shadow keeps working afterwards
        assert_eq!(add(shadow, 1), S_OK);
    }

    assert_eq!(*failures.lock().unwrap(), vec![E_UNEXPECTED]);
}

#[test]
fn test_dead_object_reports_disconnected() {
    let failures = Arc::new(Mutex::new(Vec::new()));
    let (object, callback) = accumulator_callback(failures.clone());
    let shadow = callback.shadow_for::<dyn IAccumulator>().unwrap();

    // Native side keeps its own reference
    assert_eq!(callback.add_ref(), 2);
    drop(callback);
    drop(object);

    unsafe {
        let add: AddFn = slot(shadow, ADD);
        let total: TotalFn = slot(shadow, TOTAL);
        let peek: PeekFn = slot(shadow, PEEK);

        assert_eq!(add(shadow, 1), RPC_E_DISCONNECTED);
        let mut value = -1i64;
        assert_eq!(total(shadow, &mut value), RPC_E_DISCONNECTED);
        assert_eq!(value, -1);
        assert_eq!(peek(shadow), 0);

        let unknown = shadowcom::com::IUnknownVTable::of(shadow);
        assert_eq!((unknown.release)(shadow), 0);
    }

    assert_eq!(failures.lock().unwrap().len(), 3);
}

#[test]
fn test_failure_hook_panic_is_contained() {
    let registry = Arc::new(VtableRegistry::new());
    registry.ensure_registered::<dyn IAccumulator>().unwrap();

    let object = Arc::new(Accumulator::default());
    let callback = Callback::builder(&registry, object.clone())
        .implements::<dyn IAccumulator>(object)
        .on_failure(|_| panic!("hook failure"))
        .build();
    let shadow = callback.shadow_for::<dyn IAccumulator>().unwrap();

    unsafe {
        let add: AddFn = slot(shadow, ADD);
        assert_eq!(add(shadow, -5), E_FAIL);
    }
}
