//! Shadow instances: native-addressable stand-ins for Rust callback objects
//!
//! A [`Callback`] wraps a Rust object together with weak views of the interfaces it
//! implements. For each requested interface it allocates one [`ShadowHeader`]:
//!
//! ```text
//! shadow ──► [ vtbl ─────────► [slot 0][slot 1]...   (VtableDescriptor::table)
//!            [ core ─────────► CallbackCore { views, shadows, refs }
//!            [ descriptor ]
//! ```
//!
//! Native code only ever sees the address of the header. All headers of one callback
//! share one reference count; they are freed together when it reaches zero.

use std::any::Any;
use std::collections::HashMap;
use std::ffi::c_void;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::com::{ComRefCount, GUID, IID_IUNKNOWN};
use crate::descriptor::{InterfaceDecl, VtableDescriptor, VtableLayout, VtableRegistry};
use crate::error::{CallbackError, Error, Result};

/// A Rust interface that native code can call through a shadow vtable.
///
/// Implemented for `dyn Trait` by `#[shadow_interface]`.
///
/// # Safety
/// Every slot in [`declaration`](Self::declaration) must be a thunk whose signature
/// matches the native declaration of the interface and which dispatches through
/// `dyn Self` views.
pub unsafe trait ShadowInterface: Send + Sync + 'static {
    const IID: GUID;
    const NAME: &'static str;

    /// Slots this interface adds to its base.
    fn declaration() -> InterfaceDecl;

    /// Register the base chain (not `Self`).
    fn register_bases(registry: &VtableRegistry) -> Result<()> {
        let _ = registry;
        Ok(())
    }

    /// Add views of every base interface of `view`.
    fn expose_bases(view: &Arc<Self>, views: &mut InterfaceViews) {
        let _ = (view, views);
    }
}

// =============================================================================
// InterfaceViews
// =============================================================================

/// Weak, typed views of one object, keyed by interface id.
#[derive(Default)]
pub struct InterfaceViews {
    views: HashMap<GUID, Box<dyn Any + Send + Sync>>,
    order: Vec<GUID>,
}

impl InterfaceViews {
    /// Add a view. The first view inserted for an iid wins.
    pub fn insert<I: ShadowInterface + ?Sized>(&mut self, view: &Arc<I>) -> bool {
        if self.views.contains_key(&I::IID) {
            return false;
        }
        let weak: Weak<I> = Arc::downgrade(view);
        self.views.insert(I::IID, Box::new(weak));
        self.order.push(I::IID);
        true
    }

    /// Upgrade the view for `I`; `None` if absent or the object is gone.
    pub fn get<I: ShadowInterface + ?Sized>(&self) -> Option<Arc<I>> {
        self.views
            .get(&I::IID)?
            .downcast_ref::<Weak<I>>()?
            .upgrade()
    }

    pub fn contains(&self, iid: &GUID) -> bool {
        self.views.contains_key(iid)
    }

    /// Interface ids in insertion order.
    pub fn iids(&self) -> &[GUID] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// =============================================================================
// ShadowHeader
// =============================================================================

/// The block native code holds a pointer to. Word 0 is the vtable pointer.
#[repr(C)]
pub(crate) struct ShadowHeader {
    vtbl: *const *const c_void,
    /// Owns one strong count of the core
    core: *const CallbackCore,
    descriptor: Arc<VtableDescriptor>,
}

#[derive(Clone, Copy)]
struct ShadowPtr(NonNull<ShadowHeader>);

// Headers are only mutated at allocation and free, both under the shadow lock
unsafe impl Send for ShadowPtr {}
unsafe impl Sync for ShadowPtr {}

impl ShadowPtr {
    fn as_raw(self) -> *mut c_void {
        self.0.as_ptr() as *mut c_void
    }
}

impl ShadowHeader {
    fn allocate(descriptor: Arc<VtableDescriptor>, core: &Arc<CallbackCore>) -> ShadowPtr {
        let header = Box::new(ShadowHeader {
            vtbl: descriptor.table(),
            core: Arc::into_raw(Arc::clone(core)),
            descriptor,
        });
        ShadowPtr(NonNull::from(Box::leak(header)))
    }

    /// # Safety
    /// `ptr` must come from [`allocate`](Self::allocate) and not be used afterwards.
    unsafe fn free(ptr: ShadowPtr) {
        let header = unsafe { Box::from_raw(ptr.0.as_ptr()) };
        debug_assert_eq!(header.vtbl, header.descriptor.table());
        trace!(interface = header.descriptor.name(), shadow = ?ptr.as_raw(), "freed shadow");
        drop(unsafe { Arc::from_raw(header.core) });
    }

    /// Recover a strong reference to the callback behind a shadow pointer.
    ///
    /// # Safety
    /// `this` must be null or a shadow whose callback still holds references.
    pub(crate) unsafe fn core(this: *mut c_void) -> Option<Arc<CallbackCore>> {
        let header = NonNull::new(this as *mut ShadowHeader)?;
        unsafe {
            let core = header.as_ref().core;
            Arc::increment_strong_count(core);
            Some(Arc::from_raw(core))
        }
    }
}

// =============================================================================
// CallbackCore
// =============================================================================

type FailureHook = Box<dyn Fn(&CallbackError) + Send + Sync>;

/// Shared state behind every shadow of one callback.
pub(crate) struct CallbackCore {
    type_name: &'static str,
    registry: Arc<VtableRegistry>,
    views: InterfaceViews,
    shadows: Mutex<HashMap<GUID, ShadowPtr>>,
    refs: ComRefCount,
    on_failure: Option<FailureHook>,
}

impl CallbackCore {
    pub(crate) fn view<I: ShadowInterface + ?Sized>(&self) -> Option<Arc<I>> {
        self.views.get::<I>()
    }

    pub(crate) fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Existing shadow for `iid`, or a new one while references remain.
    fn shadow(self: &Arc<Self>, iid: &GUID) -> Result<*mut c_void> {
        let iid = if *iid == IID_IUNKNOWN {
            self.primary()?
        } else {
            *iid
        };

        let mut shadows = self.shadows.lock();
        if self.refs.count() == 0 {
            return Err(Error::Disposed);
        }
        if let Some(shadow) = shadows.get(&iid) {
            return Ok(shadow.as_raw());
        }
        if !self.views.contains(&iid) {
            return Err(Error::InterfaceNotImplemented { iid });
        }

        let descriptor = self.registry.resolve(&iid).inspect_err(|_| {
            error!(callback = self.type_name, %iid, "interface was never registered");
        })?;
        let name = descriptor.name();
        let shadow = ShadowHeader::allocate(descriptor, self);
        shadows.insert(iid, shadow);
        debug!(
            callback = self.type_name,
            interface = name,
            shadow = ?shadow.as_raw(),
            "created shadow"
        );
        Ok(shadow.as_raw())
    }

    /// The first implemented COM interface stands in for IUnknown.
    fn primary(&self) -> Result<GUID> {
        self.views
            .iids()
            .iter()
            .copied()
            .find(|iid| {
                self.registry
                    .get(iid)
                    .is_some_and(|d| d.layout() == VtableLayout::Com)
            })
            .ok_or(Error::InterfaceNotImplemented { iid: IID_IUNKNOWN })
    }

    /// Shadow for `iid` with one added reference.
    pub(crate) fn query_interface(self: &Arc<Self>, iid: &GUID) -> Result<*mut c_void> {
        let shadow = self.shadow(iid)?;
        self.refs.try_add_ref().ok_or(Error::Disposed)?;
        Ok(shadow)
    }

    pub(crate) fn add_ref(&self) -> u32 {
        self.refs.try_add_ref().unwrap_or(0)
    }

    pub(crate) fn release(&self) -> u32 {
        match self.refs.try_release() {
            Some(0) => {
                self.free_shadows();
                0
            }
            Some(count) => count,
            None => {
                warn!(callback = self.type_name, "release on a callback with no references");
                0
            }
        }
    }

    fn free_shadows(&self) {
        let shadows: Vec<ShadowPtr> = self.shadows.lock().drain().map(|(_, s)| s).collect();
        trace!(callback = self.type_name, shadows = shadows.len(), "freeing shadows");
        for shadow in shadows {
            unsafe { ShadowHeader::free(shadow) };
        }
    }

    /// Log a dispatch failure and notify the failure hook.
    pub(crate) fn report_failure(&self, interface: &'static str, err: &CallbackError) {
        warn!(
            callback = self.type_name,
            interface,
            code = format_args!("0x{:08X}", err.code()),
            message = err.message(),
            "callback failed"
        );
        if let Some(hook) = &self.on_failure
            && catch_unwind(AssertUnwindSafe(|| hook(err))).is_err()
        {
            warn!(callback = self.type_name, "failure hook panicked");
        }
    }
}

impl Drop for CallbackCore {
    fn drop(&mut self) {
        trace!(callback = self.type_name, "callback core dropped");
    }
}

// =============================================================================
// Callback
// =============================================================================

/// A Rust object exposed to native code through shadow vtables.
///
/// The `Callback` owns one reference of the shared count and one strong reference to
/// the object. Dropping it gives both up; shadows handed to native code stay
/// allocated until native code releases them, but dispatch then reports
/// `RPC_E_DISCONNECTED` once the object itself is gone.
pub struct Callback {
    core: Arc<CallbackCore>,
    owner: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    disposed: AtomicBool,
}

impl Callback {
    /// Start building a callback around `object`.
    ///
    /// ```ignore
    /// let callback = Callback::builder(&registry, counter.clone())
    ///     .implements::<dyn ICounter>(counter)
    ///     .build();
    /// ```
    pub fn builder<T: Send + Sync + 'static>(
        registry: &Arc<VtableRegistry>,
        object: Arc<T>,
    ) -> CallbackBuilder {
        CallbackBuilder {
            registry: Arc::clone(registry),
            owner: object,
            type_name: std::any::type_name::<T>(),
            views: InterfaceViews::default(),
            on_failure: None,
        }
    }

    /// The shadow for `iid`, created on first request.
    ///
    /// The same address is returned for the same interface for as long as the
    /// callback has references. `IUnknown` maps to the primary interface.
    ///
    /// No reference is added: the pointer is borrowed from this callback and
    /// dangles once the last reference is released. Use [`query_interface`]
    /// when native code will own and `Release` the pointer.
    ///
    /// [`query_interface`]: Callback::query_interface
    pub fn shadow(&self, iid: &GUID) -> Result<*mut c_void> {
        self.core.shadow(iid)
    }

    /// The shadow for `iid` with one added reference, as `QueryInterface`
    /// hands it out. The caller owns that reference.
    pub fn query_interface(&self, iid: &GUID) -> Result<*mut c_void> {
        self.core.query_interface(iid)
    }

    pub fn shadow_for<I: ShadowInterface + ?Sized>(&self) -> Result<*mut c_void> {
        self.shadow(&I::IID)
    }

    /// Whether the callback exposes `iid` (directly or as a base interface).
    pub fn implements(&self, iid: &GUID) -> bool {
        (*iid == IID_IUNKNOWN && self.core.primary().is_ok()) || self.core.views.contains(iid)
    }

    /// Implemented interface ids, primary first.
    pub fn interfaces(&self) -> &[GUID] {
        self.core.views.iids()
    }

    pub fn add_ref(&self) -> u32 {
        self.core.add_ref()
    }

    pub fn release(&self) -> u32 {
        self.core.release()
    }

    pub fn ref_count(&self) -> u32 {
        self.core.refs.count()
    }

    /// Give up the Rust-side reference and the strong reference to the object.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(callback = self.core.type_name, "disposing callback");
        self.owner.lock().take();
        self.core.release();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for Callback {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("type", &self.core.type_name)
            .field("interfaces", &self.core.views.iids())
            .field("refs", &self.core.refs.count())
            .finish()
    }
}

pub struct CallbackBuilder {
    registry: Arc<VtableRegistry>,
    owner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    views: InterfaceViews,
    on_failure: Option<FailureHook>,
}

impl CallbackBuilder {
    /// Expose `view` as interface `I` along with all of `I`'s bases.
    pub fn implements<I: ShadowInterface + ?Sized>(mut self, view: Arc<I>) -> Self {
        self.views.insert(&view);
        I::expose_bases(&view, &mut self.views);
        self
    }

    /// Called with every error a dispatch turns into a status code.
    pub fn on_failure(mut self, hook: impl Fn(&CallbackError) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Callback {
        trace!(
            callback = self.type_name,
            interfaces = self.views.len(),
            "built callback"
        );
        Callback {
            core: Arc::new(CallbackCore {
                type_name: self.type_name,
                registry: self.registry,
                views: self.views,
                shadows: Mutex::new(HashMap::new()),
                refs: ComRefCount::new(),
                on_failure: self.on_failure,
            }),
            owner: Mutex::new(Some(self.owner)),
            disposed: AtomicBool::new(false),
        }
    }
}
