//! Vtable descriptors and the registry that owns them
//!
//! An [`InterfaceDecl`] lists the slots one interface adds on top of its base. Registering
//! it with a [`VtableRegistry`] produces a [`VtableDescriptor`]: the flattened slot list
//! (inherited slots first) and, on first use, the native function table built from it.
//!
//! Slot layout for a COM interface `IDerived : IBase : IUnknown`:
//!
//! ```text
//! [0] QueryInterface  [1] AddRef  [2] Release  [3..] IBase slots  [..] IDerived slots
//! ```

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::com::{E_NOTIMPL, GUID, HRESULT, IID_IUNKNOWN};
use crate::error::{Error, Result};
use crate::shadow::ShadowInterface;
use crate::thunk;

/// Calling convention of the slots of a vtable (x86 only; every other target uses C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallingConvention {
    #[default]
    Cdecl,
    /// COM convention
    Stdcall,
    /// C++ member functions on MSVC (this in ECX)
    Thiscall,
}

/// Vtable shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VtableLayout {
    /// Starts with QueryInterface, AddRef, Release
    Com,
    /// Plain C++ vtable, no IUnknown prefix
    Plain,
}

/// A native-callable function pointer stored in a vtable slot.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotFn(*const c_void);

// Tables are handed out as arrays of machine words
const _: () = assert!(std::mem::size_of::<SlotFn>() == std::mem::size_of::<usize>());

// Slot functions are code pointers
unsafe impl Send for SlotFn {}
unsafe impl Sync for SlotFn {}

impl SlotFn {
    pub const fn new(function: *const c_void) -> Self {
        Self(function)
    }

    pub const fn as_ptr(self) -> *const c_void {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// One method slot as declared by an interface.
#[derive(Debug, Clone)]
pub struct SlotDecl {
    pub name: &'static str,
    /// Position relative to the first slot of this interface; `None` means "next"
    pub index: Option<usize>,
    pub function: SlotFn,
}

/// Everything needed to register an interface.
#[derive(Debug, Clone)]
pub struct InterfaceDecl {
    pub iid: GUID,
    pub name: &'static str,
    pub base: Option<GUID>,
    pub layout: VtableLayout,
    pub convention: CallingConvention,
    pub slots: Vec<SlotDecl>,
}

impl InterfaceDecl {
    pub fn new(
        iid: GUID,
        name: &'static str,
        layout: VtableLayout,
        convention: CallingConvention,
    ) -> Self {
        Self {
            iid,
            name,
            base: None,
            layout,
            convention,
            slots: Vec::new(),
        }
    }

    pub fn extends(mut self, base: GUID) -> Self {
        self.base = Some(base);
        self
    }

    pub fn slot(mut self, name: &'static str, function: SlotFn) -> Self {
        self.slots.push(SlotDecl {
            name,
            index: None,
            function,
        });
        self
    }

    pub fn slot_at(mut self, index: usize, name: &'static str, function: SlotFn) -> Self {
        self.slots.push(SlotDecl {
            name,
            index: Some(index),
            function,
        });
        self
    }
}

/// A resolved slot.
#[derive(Debug, Clone)]
pub struct Slot {
    pub name: &'static str,
    pub function: SlotFn,
    /// Interface that declared the slot
    pub declared_by: GUID,
    /// Filler for an index gap
    pub reserved: bool,
}

/// Flattened, immutable description of one interface's vtable.
#[derive(Debug)]
pub struct VtableDescriptor {
    iid: GUID,
    name: &'static str,
    base: Option<GUID>,
    layout: VtableLayout,
    convention: CallingConvention,
    slots: Box<[Slot]>,
    table: OnceCell<Box<[SlotFn]>>,
}

impl VtableDescriptor {
    pub fn iid(&self) -> GUID {
        self.iid
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn base(&self) -> Option<GUID> {
        self.base
    }

    pub fn layout(&self) -> VtableLayout {
        self.layout
    }

    pub fn convention(&self) -> CallingConvention {
        self.convention
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    /// Index of the first non-reserved slot named `name`.
    pub fn slot_index(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| !slot.reserved && slot.name == name)
    }

    /// Whether the native table has been built.
    pub fn is_realized(&self) -> bool {
        self.table.get().is_some()
    }

    /// The native function table, built once and never moved afterwards.
    pub fn table(&self) -> *const *const c_void {
        let table = self.table.get_or_init(|| {
            debug!(interface = self.name, slots = self.slots.len(), "realizing vtable");
            self.slots.iter().map(|slot| slot.function).collect()
        });
        table.as_ptr() as *const *const c_void
    }
}

fn reserved_slot_called() -> HRESULT {
    error!("native code called a reserved vtable slot");
    E_NOTIMPL
}

// Reserved stubs take only `this`, which a stdcall callee pops itself
unsafe extern "C" fn reserved_slot_cdecl(_this: *mut c_void) -> HRESULT {
    reserved_slot_called()
}

#[cfg(target_arch = "x86")]
unsafe extern "stdcall" fn reserved_slot_stdcall(_this: *mut c_void) -> HRESULT {
    reserved_slot_called()
}

#[cfg(target_arch = "x86")]
unsafe extern "thiscall" fn reserved_slot_thiscall(_this: *mut c_void) -> HRESULT {
    reserved_slot_called()
}

/// The gap filler matching `convention` on this target.
fn reserved_slot(convention: CallingConvention) -> SlotFn {
    #[cfg(target_arch = "x86")]
    let function = match convention {
        CallingConvention::Cdecl => reserved_slot_cdecl as *const c_void,
        CallingConvention::Stdcall => reserved_slot_stdcall as *const c_void,
        CallingConvention::Thiscall => reserved_slot_thiscall as *const c_void,
    };
    #[cfg(not(target_arch = "x86"))]
    let function = {
        let _ = convention;
        reserved_slot_cdecl as *const c_void
    };
    SlotFn::new(function)
}

fn reserved(declared_by: GUID, convention: CallingConvention) -> Slot {
    Slot {
        name: "<reserved>",
        function: reserved_slot(convention),
        declared_by,
        reserved: true,
    }
}

fn invalid(decl: &InterfaceDecl, reason: impl Into<String>) -> Error {
    Error::InvalidDescriptor {
        name: decl.name,
        reason: reason.into(),
    }
}

fn iunknown_descriptor() -> VtableDescriptor {
    let slot = |name, function: *const c_void| Slot {
        name,
        function: SlotFn::new(function),
        declared_by: IID_IUNKNOWN,
        reserved: false,
    };
    VtableDescriptor {
        iid: IID_IUNKNOWN,
        name: "IUnknown",
        base: None,
        layout: VtableLayout::Com,
        convention: CallingConvention::Stdcall,
        slots: vec![
            slot("QueryInterface", thunk::query_interface as *const c_void),
            slot("AddRef", thunk::add_ref as *const c_void),
            slot("Release", thunk::release as *const c_void),
        ]
        .into_boxed_slice(),
        table: OnceCell::new(),
    }
}

// =============================================================================
// VtableRegistry
// =============================================================================

/// Maps interface ids to their descriptors.
///
/// Registration is explicit and happens before shadows are built; lookups afterwards
/// only take the read lock. IUnknown is always present.
pub struct VtableRegistry {
    descriptors: RwLock<HashMap<GUID, Arc<VtableDescriptor>>>,
}

static GLOBAL: Lazy<Arc<VtableRegistry>> = Lazy::new(|| Arc::new(VtableRegistry::new()));

impl VtableRegistry {
    pub fn new() -> Self {
        let mut descriptors = HashMap::new();
        descriptors.insert(IID_IUNKNOWN, Arc::new(iunknown_descriptor()));
        Self {
            descriptors: RwLock::new(descriptors),
        }
    }

    /// Process-wide registry.
    pub fn global() -> Arc<VtableRegistry> {
        Arc::clone(&GLOBAL)
    }

    /// Register an interface. Its base must already be registered.
    pub fn register(&self, decl: InterfaceDecl) -> Result<Arc<VtableDescriptor>> {
        let descriptor = Arc::new(self.build(&decl)?);

        let mut descriptors = self.descriptors.write();
        if descriptors.contains_key(&decl.iid) {
            return Err(Error::DuplicateRegistration {
                iid: decl.iid,
                name: decl.name,
            });
        }
        descriptors.insert(decl.iid, Arc::clone(&descriptor));
        drop(descriptors);

        debug!(
            interface = decl.name,
            iid = %decl.iid,
            slots = descriptor.slot_count(),
            "registered vtable descriptor"
        );
        Ok(descriptor)
    }

    /// Register a shadow interface (without its bases).
    pub fn register_interface<I: ShadowInterface + ?Sized>(&self) -> Result<Arc<VtableDescriptor>> {
        self.register(I::declaration())
    }

    /// Register a shadow interface and its base chain unless already present.
    pub fn ensure_registered<I: ShadowInterface + ?Sized>(&self) -> Result<Arc<VtableDescriptor>> {
        if let Some(descriptor) = self.get(&I::IID) {
            return Ok(descriptor);
        }
        I::register_bases(self)?;
        match self.register(I::declaration()) {
            Err(Error::DuplicateRegistration { iid, .. }) => self.resolve(&iid),
            other => other,
        }
    }

    pub fn resolve(&self, iid: &GUID) -> Result<Arc<VtableDescriptor>> {
        self.get(iid)
            .ok_or(Error::ConfigurationMissing { iid: *iid })
    }

    pub fn get(&self, iid: &GUID) -> Option<Arc<VtableDescriptor>> {
        self.descriptors.read().get(iid).cloned()
    }

    pub fn contains(&self, iid: &GUID) -> bool {
        self.descriptors.read().contains_key(iid)
    }

    pub fn len(&self) -> usize {
        self.descriptors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.read().is_empty()
    }

    fn build(&self, decl: &InterfaceDecl) -> Result<VtableDescriptor> {
        let base_iid = match (decl.layout, decl.base) {
            (VtableLayout::Com, None) => Some(IID_IUNKNOWN),
            (_, base) => base,
        };
        if base_iid == Some(decl.iid) {
            return Err(invalid(decl, "interface cannot extend itself"));
        }

        let base = base_iid.map(|iid| self.resolve(&iid)).transpose()?;

        match (decl.layout, decl.convention) {
            (VtableLayout::Com, CallingConvention::Stdcall) => {}
            (VtableLayout::Com, other) => {
                return Err(invalid(decl, format!("COM vtables use stdcall, not {other:?}")));
            }
            (VtableLayout::Plain, _) => {}
        }
        if let Some(base) = &base {
            if base.layout != decl.layout {
                return Err(invalid(
                    decl,
                    format!("base {} has a {:?} layout", base.name, base.layout),
                ));
            }
            if base.layout == VtableLayout::Plain && base.convention != decl.convention {
                return Err(invalid(
                    decl,
                    format!("base {} uses {:?}", base.name, base.convention),
                ));
            }
        }

        let mut slots: Vec<Slot> = base
            .as_ref()
            .map(|base| base.slots.to_vec())
            .unwrap_or_default();
        let first = slots.len();

        for slot in &decl.slots {
            if slot.function.is_null() {
                return Err(invalid(decl, format!("slot '{}' has no function", slot.name)));
            }
            let next = slots.len() - first;
            let index = slot.index.unwrap_or(next);
            if index < next {
                return Err(invalid(
                    decl,
                    format!("slot '{}' at index {} overlaps an earlier slot", slot.name, index),
                ));
            }
            while slots.len() - first < index {
                slots.push(reserved(decl.iid, decl.convention));
            }
            slots.push(Slot {
                name: slot.name,
                function: slot.function,
                declared_by: decl.iid,
                reserved: false,
            });
        }

        Ok(VtableDescriptor {
            iid: decl.iid,
            name: decl.name,
            base: base_iid,
            layout: decl.layout,
            convention: decl.convention,
            slots: slots.into_boxed_slice(),
            table: OnceCell::new(),
        })
    }
}

impl Default for VtableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VtableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let descriptors = self.descriptors.read();
        f.debug_struct("VtableRegistry")
            .field("interfaces", &descriptors.values().map(|d| d.name).collect::<Vec<_>>())
            .finish()
    }
}
