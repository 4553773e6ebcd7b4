//! Shadow vtables and native object identity for COM/C++ interop
//!
//! Two halves:
//!
//! ## Inbound: native code calling Rust
//!
//! Declare an interface with `#[shadow_interface]`, register it, and wrap an object in a
//! [`Callback`]. [`Callback::shadow`] hands out a pointer native code can call through
//! like any COM or C++ object.
//!
//! ```ignore
//! use std::sync::Arc;
//! use shadowcom::proc::shadow_interface;
//! use shadowcom::{Callback, CallbackResult, VtableRegistry};
//!
//! #[shadow_interface("6a4b2f3e-0c1d-4e5f-8a9b-0c1d2e3f4a5b")]
//! pub trait ICounter {
//!     fn increment(&self, value: i32) -> i32;
//!     fn reset(&self) -> CallbackResult;
//! }
//!
//! struct Counter;
//!
//! impl ICounter for Counter {
//!     fn increment(&self, value: i32) -> i32 { value + 1 }
//!     fn reset(&self) -> CallbackResult { Ok(()) }
//! }
//!
//! let registry = Arc::new(VtableRegistry::new());
//! registry.ensure_registered::<dyn ICounter>()?;
//!
//! let counter = Arc::new(Counter);
//! let callback = Callback::builder(&registry, counter.clone())
//!     .implements::<dyn ICounter>(counter)
//!     .build();
//! let shadow = callback.shadow_for::<dyn ICounter>()?;  // pass to native code
//! ```
//!
//! ## Outbound: Rust holding native objects
//!
//! [`CppObject`] and [`ComObject`] own native handles and keep an [`ObjectTracker`] in
//! step with them, so every live wrapper of a native object can be found by its
//! address and leaks can be reported.
//!
//! ## Calling Conventions
//!
//! - COM interfaces: `stdcall` on x86, `C` elsewhere
//! - Plain interfaces: `cdecl`, `stdcall` or `thiscall` on x86, `C` elsewhere

pub mod com;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod object;
pub mod shadow;
pub mod thunk;
pub mod tracker;

/// Proc-macro re-exports from shadowcom-macro
pub mod proc {
    pub use shadowcom_macro::shadow_interface;
}

pub use com::{
    ComRefCount, E_FAIL, E_INVALIDARG, E_NOINTERFACE, E_NOTIMPL, E_POINTER, E_UNEXPECTED, GUID,
    HRESULT, IID_IUNKNOWN, RPC_E_DISCONNECTED, ResultDescriptor, S_FALSE, S_OK, failed, succeeded,
};
pub use config::{TrackerConfig, TrackingMode};
pub use descriptor::{
    CallingConvention, InterfaceDecl, Slot, SlotDecl, SlotFn, VtableDescriptor, VtableLayout,
    VtableRegistry,
};
pub use error::{CallbackError, CallbackResult, Error, Result};
pub use object::{ComObject, CppObject, DisposeEvent, DisposeStage, ReleaseMode, read_slot};
pub use shadow::{Callback, CallbackBuilder, InterfaceViews, ShadowInterface};
pub use tracker::{
    NativeHandle, ObjectReference, ObjectTracker, SubscriptionId, Trackable, TrackingEvent,
    TrackingEventKind,
};
