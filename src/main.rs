//! Walkthrough of the shadowcom object model
//!
//! The "native host" functions below only ever see raw `*mut c_void` pointers and
//! call through vtable slots, the way C or C++ code on the other side of the
//! boundary would.

use shadowcom::proc::shadow_interface;
use shadowcom::{
    Callback, CallbackError, CallbackResult, ComObject, IID_IUNKNOWN, NativeHandle,
    ObjectTracker, TrackerConfig, VtableRegistry, read_slot,
};
use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

// =============================================================================
// Interfaces
// =============================================================================

/// Plain C++-style callback: no IUnknown, `increment` lives in slot 0.
#[shadow_interface("0b3c8d2a-5e61-4f7a-9c0d-1e2f3a4b5c6d", plain)]
pub trait ICallback {
    fn increment(&self, param: i32) -> i32;
}

#[shadow_interface("6a4b2f3e-0c1d-4e5f-8a9b-0c1d2e3f4a5b")]
pub trait ICounter {
    fn bump(&self, by: i32) -> CallbackResult;
    fn value(&self) -> CallbackResult<i32>;
}

#[shadow_interface("6a4b2f3e-0c1d-4e5f-8a9b-0c1d2e3f4a5c", extends(ICounter))]
pub trait IResettableCounter: ICounter {
    fn reset(&self);
}

// =============================================================================
// Rust implementations
// =============================================================================

struct Incrementer;

impl ICallback for Incrementer {
    fn increment(&self, param: i32) -> i32 {
        param + 1
    }
}

#[derive(Default)]
struct Counter {
    value: AtomicI32,
}

impl ICounter for Counter {
    fn bump(&self, by: i32) -> CallbackResult {
        if by < 0 {
            return Err(CallbackError::fail("counters only go up"));
        }
        self.value.fetch_add(by, Ordering::SeqCst);
        Ok(())
    }

    fn value(&self) -> CallbackResult<i32> {
        Ok(self.value.load(Ordering::SeqCst))
    }
}

impl IResettableCounter for Counter {
    fn reset(&self) {
        self.value.store(0, Ordering::SeqCst);
    }
}

// =============================================================================
// Native host
// =============================================================================

#[cfg(target_arch = "x86")]
mod abi {
    use shadowcom::HRESULT;
    use std::ffi::c_void;

    pub type BumpFn = unsafe extern "stdcall" fn(*mut c_void, i32) -> HRESULT;
    pub type ValueFn = unsafe extern "stdcall" fn(*mut c_void, *mut i32) -> HRESULT;
    pub type ResetFn = unsafe extern "stdcall" fn(*mut c_void);
}

#[cfg(not(target_arch = "x86"))]
mod abi {
    use shadowcom::HRESULT;
    use std::ffi::c_void;

    pub type BumpFn = unsafe extern "C" fn(*mut c_void, i32) -> HRESULT;
    pub type ValueFn = unsafe extern "C" fn(*mut c_void, *mut i32) -> HRESULT;
    pub type ResetFn = unsafe extern "C" fn(*mut c_void);
}

type IncrementFn = unsafe extern "C" fn(*mut c_void, i32) -> i32;

/// What a C++ caller does with an `ICallback*`.
unsafe fn host_increment(callback: *mut c_void, param: i32) -> i32 {
    unsafe {
        let increment: IncrementFn = std::mem::transmute_copy(&read_slot(callback, 0));
        increment(callback, param)
    }
}

/// Bump an `ICounter*`, returning the bump status and the value read back.
unsafe fn host_bump(counter: *mut c_void, by: i32) -> (shadowcom::HRESULT, i32) {
    unsafe {
        let bump: abi::BumpFn = std::mem::transmute_copy(&read_slot(counter, 3));
        let value: abi::ValueFn = std::mem::transmute_copy(&read_slot(counter, 4));

        let hr = bump(counter, by);
        let mut current = 0;
        value(counter, &mut current);
        (hr, current)
    }
}

fn main() -> shadowcom::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shadowcom=debug"));
    fmt().with_env_filter(filter).compact().try_init().ok();

    println!("=== shadowcom walkthrough ===\n");

    let registry = Arc::new(VtableRegistry::new());
    let tracker = Arc::new(ObjectTracker::new(TrackerConfig::tracking()));
    info!(?tracker, "tracker ready");

    // =========================================================================
    // Plain callback
    // =========================================================================
    println!("--- Plain callback ---");
    registry.ensure_registered::<dyn ICallback>()?;

    let incrementer = Arc::new(Incrementer);
    let callback = Callback::builder(&registry, incrementer.clone())
        .implements::<dyn ICallback>(incrementer)
        .build();
    let shadow = callback.shadow_for::<dyn ICallback>()?;
    println!("  host_increment(2) = {}", unsafe { host_increment(shadow, 2) });

    // =========================================================================
    // COM callback
    // =========================================================================
    println!("\n--- COM callback ---");
    let descriptor = registry.ensure_registered::<dyn IResettableCounter>()?;
    for (index, slot) in descriptor.slots().iter().enumerate() {
        println!("  slot {index}: {}", slot.name);
    }

    let counter = Arc::new(Counter::default());
    let callback = Callback::builder(&registry, counter.clone())
        .implements::<dyn IResettableCounter>(counter)
        .on_failure(|err| println!("  callback failed: {err}"))
        .build();

    let shadow = callback.shadow_for::<dyn IResettableCounter>()?;
    unsafe {
        let (hr, value) = host_bump(shadow, 5);
        println!("  bump(5) -> 0x{hr:08X}, value {value}");
        let (hr, value) = host_bump(shadow, -1);
        println!("  bump(-1) -> 0x{hr:08X}, value {value}");

        let reset: abi::ResetFn = std::mem::transmute_copy(&read_slot(shadow, 5));
        reset(shadow);
    }

    // =========================================================================
    // Wrapping the shadow as a native object
    // =========================================================================
    println!("\n--- Native object wrapper ---");
    callback.add_ref();
    let object = unsafe { ComObject::from_handle(&tracker, NativeHandle::from_ptr(shadow)) };
    let base = object.cast(&IID_ICOUNTER)?;
    let unknown = object.cast(&IID_IUNKNOWN)?;
    println!("  IResettableCounter {}", object.native_handle());
    println!("  ICounter           {}", base.native_handle());
    println!("  IUnknown           {}", unknown.native_handle());
    println!("  references held: {}", callback.ref_count());

    let (_, value) = unsafe { host_bump(base.native_handle().as_ptr(), 3) };
    println!("  bump(3) through ICounter, value {value}");

    println!("\n{}", tracker.report_active_objects());

    unknown.dispose();
    base.dispose();
    object.dispose();
    println!("  references after dispose: {}", callback.ref_count());
    println!("  tracked handles: {}", tracker.handle_count());

    Ok(())
}
