//! Rust wrappers around native objects
//!
//! A [`CppObject`] owns at most one [`NativeHandle`] and keeps the [`ObjectTracker`] in
//! step with it: tracked while bound, migrated on rebind, untracked before the native
//! object is released. [`ComObject`] adds IUnknown semantics on top.
//!
//! Disposal, explicit or by drop, runs in this order:
//!
//! ```text
//! Disposing event → untrack → clear handle → native release → Disposed event
//! ```

use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::com::{self, GUID, IUnknownVTable};
use crate::error::{Error, Result};
use crate::tracker::{NativeHandle, ObjectTracker, Subscribers, SubscriptionId, Trackable};

/// What to do with the native object when the wrapper lets go of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// The wrapper does not own a native reference
    Borrowed,
    /// The wrapper owns one COM reference, given back with IUnknown::Release
    ComReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeStage {
    /// Still bound and tracked
    Disposing,
    /// Untracked, handle cleared and native reference released
    Disposed,
}

/// Raised twice per disposal of a bound wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisposeEvent {
    pub stage: DisposeStage,
    /// Handle being let go of
    pub handle: NativeHandle,
    /// `true` for [`CppObject::dispose`], `false` when the wrapper is dropped still bound
    pub explicit: bool,
}

/// A Rust wrapper bound to a native object.
pub struct CppObject {
    handle: AtomicUsize,
    /// Serializes bind/rebind/dispose of this wrapper
    binding: Mutex<()>,
    tracker: Arc<ObjectTracker>,
    release: ReleaseMode,
    type_name: &'static str,
    dispose_handlers: Subscribers<DisposeEvent>,
}

impl CppObject {
    /// Wrap a borrowed native pointer.
    pub fn new(tracker: &Arc<ObjectTracker>, handle: NativeHandle) -> Arc<Self> {
        Self::with_release(tracker, handle, ReleaseMode::Borrowed, "CppObject")
    }

    /// A wrapper with no native object yet.
    pub fn unbound(tracker: &Arc<ObjectTracker>) -> Arc<Self> {
        Self::new(tracker, NativeHandle::NULL)
    }

    pub fn with_release(
        tracker: &Arc<ObjectTracker>,
        handle: NativeHandle,
        release: ReleaseMode,
        type_name: &'static str,
    ) -> Arc<Self> {
        let object = Arc::new(Self {
            handle: AtomicUsize::new(handle.0),
            binding: Mutex::new(()),
            tracker: Arc::clone(tracker),
            release,
            type_name,
            dispose_handlers: Subscribers::new(),
        });
        if !handle.is_null() {
            trace!(%handle, type_name, "bound");
            tracker.track(&object);
        }
        object
    }

    pub fn native_handle(&self) -> NativeHandle {
        NativeHandle(self.handle.load(Ordering::Acquire))
    }

    pub fn is_bound(&self) -> bool {
        !self.native_handle().is_null()
    }

    pub fn release_mode(&self) -> ReleaseMode {
        self.release
    }

    pub fn tracker(&self) -> &Arc<ObjectTracker> {
        &self.tracker
    }

    /// Bind or rebind to `handle`.
    ///
    /// The tracker is updated before the new handle becomes visible, so a lookup by
    /// the new handle never misses this wrapper once it can observe it.
    pub fn set_native_handle(self: &Arc<Self>, handle: NativeHandle) {
        let _binding = self.binding.lock();
        let old = self.native_handle();
        if old == handle {
            return;
        }
        trace!(%old, new = %handle, type_name = self.type_name, "rebinding");
        self.tracker.migrate(self, old, handle);
        self.handle.store(handle.0, Ordering::Release);
    }

    /// Bind an unbound wrapper.
    pub fn bind(self: &Arc<Self>, handle: NativeHandle) {
        self.set_native_handle(handle);
    }

    /// Untrack, clear the handle and release the native object. Idempotent.
    ///
    /// Dispose handlers run with the wrapper's binding lock held and must not dispose
    /// or rebind this same wrapper.
    pub fn dispose(&self) {
        let _binding = self.binding.lock();
        let handle = self.native_handle();
        if handle.is_null() {
            return;
        }
        trace!(%handle, type_name = self.type_name, "disposing");
        self.raise(DisposeStage::Disposing, handle, true);
        self.tracker.untrack_as(self.address(), handle);
        self.handle.store(0, Ordering::Release);
        self.release_native(handle);
        self.raise(DisposeStage::Disposed, handle, true);
    }

    /// Run `handler` right before a bound wrapper is disposed or dropped.
    pub fn on_disposing(
        &self,
        handler: impl Fn(&DisposeEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.on_dispose(DisposeStage::Disposing, handler)
    }

    /// Run `handler` once the native object has been let go of.
    pub fn on_disposed(
        &self,
        handler: impl Fn(&DisposeEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.on_dispose(DisposeStage::Disposed, handler)
    }

    /// Remove a handler added by [`on_disposing`](Self::on_disposing) or
    /// [`on_disposed`](Self::on_disposed).
    pub fn remove_dispose_handler(&self, id: SubscriptionId) -> bool {
        self.dispose_handlers.unsubscribe(id)
    }

    fn on_dispose(
        &self,
        stage: DisposeStage,
        handler: impl Fn(&DisposeEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.dispose_handlers.subscribe(move |event: &DisposeEvent| {
            if event.stage == stage {
                handler(event);
            }
        })
    }

    fn raise(&self, stage: DisposeStage, handle: NativeHandle, explicit: bool) {
        if self.dispose_handlers.is_empty() {
            return;
        }
        let event = DisposeEvent {
            stage,
            handle,
            explicit,
        };
        self.dispose_handlers.notify(&event, self.type_name);
    }

    /// Read vtable slot `index` of the bound object.
    ///
    /// # Safety
    /// The object must be alive and its vtable must have more than `index` slots.
    pub unsafe fn vtable_slot(&self, index: usize) -> Result<*const c_void> {
        let handle = self.native_handle();
        if handle.is_null() {
            return Err(Error::Disposed);
        }
        Ok(unsafe { read_slot(handle.as_ptr(), index) })
    }

    fn address(&self) -> *const () {
        self as *const Self as *const ()
    }

    fn release_native(&self, handle: NativeHandle) {
        match self.release {
            ReleaseMode::Borrowed => {}
            ReleaseMode::ComReference => {
                let remaining = unsafe { (IUnknownVTable::of(handle.as_ptr()).release)(handle.as_ptr()) };
                trace!(%handle, remaining, "released native reference");
            }
        }
    }
}

impl Trackable for CppObject {
    fn native_handle(&self) -> NativeHandle {
        CppObject::native_handle(self)
    }

    fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl Drop for CppObject {
    fn drop(&mut self) {
        let handle = NativeHandle(*self.handle.get_mut());
        if handle.is_null() {
            return;
        }
        self.raise(DisposeStage::Disposing, handle, false);
        let config = self.tracker.config();
        if config.enabled && !config.release_on_drop && self.release == ReleaseMode::ComReference {
            warn!(
                %handle,
                type_name = self.type_name,
                "native object dropped without dispose, potential leak"
            );
        }
        self.tracker.untrack_as(self.address(), handle);
        *self.handle.get_mut() = 0;
        if config.release_on_drop {
            self.release_native(handle);
        }
        self.raise(DisposeStage::Disposed, handle, false);
    }
}

impl std::fmt::Debug for CppObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CppObject")
            .field("type_name", &self.type_name)
            .field("handle", &self.native_handle())
            .field("release", &self.release)
            .finish()
    }
}

/// Read slot `index` of the vtable of the object at `this`.
///
/// # Safety
/// `this` must point to a live object whose vtable has more than `index` slots.
pub unsafe fn read_slot(this: *mut c_void, index: usize) -> *const c_void {
    unsafe {
        let vtable = *(this as *const *const *const c_void);
        *vtable.add(index)
    }
}

// =============================================================================
// ComObject
// =============================================================================

/// A wrapper owning one reference to a native COM object.
#[derive(Clone, Debug)]
pub struct ComObject {
    inner: Arc<CppObject>,
}

impl ComObject {
    /// Take ownership of one reference to the COM object at `handle`.
    ///
    /// # Safety
    /// `handle` must be null or a live COM object whose reference is transferred.
    pub unsafe fn from_handle(tracker: &Arc<ObjectTracker>, handle: NativeHandle) -> Self {
        Self {
            inner: CppObject::with_release(tracker, handle, ReleaseMode::ComReference, "ComObject"),
        }
    }

    pub fn object(&self) -> &Arc<CppObject> {
        &self.inner
    }

    pub fn native_handle(&self) -> NativeHandle {
        self.inner.native_handle()
    }

    fn vtable(&self) -> Result<(&IUnknownVTable, *mut c_void)> {
        let handle = self.native_handle();
        if handle.is_null() {
            return Err(Error::Disposed);
        }
        let this = handle.as_ptr::<c_void>();
        Ok((unsafe { IUnknownVTable::of(this) }, this))
    }

    /// IUnknown::QueryInterface. The returned handle carries its own reference.
    pub fn query_interface(&self, iid: &GUID) -> Result<NativeHandle> {
        let (vtable, this) = self.vtable()?;
        let mut out: *mut c_void = std::ptr::null_mut();
        let hr = unsafe { (vtable.query_interface)(this, iid, &mut out) };
        com::check("IUnknown::QueryInterface", hr)?;
        Ok(NativeHandle::from_ptr(out))
    }

    /// Like [`query_interface`](Self::query_interface), NULL on any failure.
    pub fn query_interface_or_null(&self, iid: &GUID) -> NativeHandle {
        self.query_interface(iid).unwrap_or(NativeHandle::NULL)
    }

    /// QueryInterface into a new wrapper sharing this one's tracker.
    pub fn cast(&self, iid: &GUID) -> Result<ComObject> {
        let handle = self.query_interface(iid)?;
        Ok(unsafe { ComObject::from_handle(self.inner.tracker(), handle) })
    }

    pub fn add_ref(&self) -> Result<u32> {
        let (vtable, this) = self.vtable()?;
        Ok(unsafe { (vtable.add_ref)(this) })
    }

    pub fn release(&self) -> Result<u32> {
        let (vtable, this) = self.vtable()?;
        Ok(unsafe { (vtable.release)(this) })
    }

    /// Rebind this wrapper to `other`'s object queried for `iid`.
    ///
    /// The reference held on the previous object, if any, is released.
    pub fn query_interface_from(&self, other: &ComObject, iid: &GUID) -> Result<()> {
        let handle = other.query_interface(iid)?;
        let previous = self.native_handle();
        self.inner.set_native_handle(handle);
        if !previous.is_null() {
            self.inner.release_native(previous);
        }
        Ok(())
    }

    pub fn dispose(&self) {
        self.inner.dispose();
    }
}
