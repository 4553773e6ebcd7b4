//! Tests for interface declarations and the vtable registry

use shadowcom::proc::shadow_interface;
use shadowcom::{
    Callback, CallingConvention, Error, IID_IUNKNOWN, ShadowInterface, VtableLayout,
    VtableRegistry, read_slot,
};
use std::ffi::c_void;
use std::sync::Arc;

// =============================================================================
// Test: Generated interface ids
// =============================================================================

#[shadow_interface("12345678-1234-5678-9abc-def012345678")]
pub trait ICalculator {
    fn add(&self, a: i32, b: i32) -> i32;
    #[slot(3)]
    fn multiply(&self, a: i32, b: i32) -> i32;
}

#[test]
fn test_interface_iid() {
    assert_eq!(IID_ICALCULATOR.data1, 0x12345678);
    assert_eq!(IID_ICALCULATOR.data2, 0x1234);
    assert_eq!(IID_ICALCULATOR.data3, 0x5678);
    assert_eq!(
        IID_ICALCULATOR.data4,
        [0x9a, 0xbc, 0xde, 0xf0, 0x12, 0x34, 0x56, 0x78]
    );
    assert_eq!(<dyn ICalculator as ShadowInterface>::IID, IID_ICALCULATOR);
    assert_eq!(<dyn ICalculator as ShadowInterface>::NAME, "ICalculator");
}

#[test]
fn test_declaration() {
    let decl = <dyn ICalculator as ShadowInterface>::declaration();
    assert_eq!(decl.layout, VtableLayout::Com);
    assert_eq!(decl.convention, CallingConvention::Stdcall);
    assert_eq!(decl.base, None);
    assert_eq!(decl.slots.len(), 2);
    assert_eq!(decl.slots[0].name, "add");
    assert_eq!(decl.slots[0].index, None);
    assert_eq!(decl.slots[1].index, Some(3));
}

// =============================================================================
// Test: Slot layout
// =============================================================================

#[test]
fn test_explicit_slot_reserves_gap() {
    let registry = VtableRegistry::new();
    let descriptor = registry.register_interface::<dyn ICalculator>().unwrap();

    // IUnknown (3) + add + 2 reserved + multiply
    assert_eq!(descriptor.slot_count(), 7);
    assert_eq!(descriptor.base(), Some(IID_IUNKNOWN));
    assert_eq!(descriptor.slot_index("QueryInterface"), Some(0));
    assert_eq!(descriptor.slot_index("add"), Some(3));
    assert!(descriptor.slot(4).unwrap().reserved);
    assert!(descriptor.slot(5).unwrap().reserved);
    assert_eq!(descriptor.slot_index("multiply"), Some(6));
    assert_eq!(descriptor.slot(6).unwrap().declared_by, IID_ICALCULATOR);
}

struct Calculator;

impl ICalculator for Calculator {
    fn add(&self, a: i32, b: i32) -> i32 {
        a + b
    }

    fn multiply(&self, a: i32, b: i32) -> i32 {
        a * b
    }
}

#[cfg(target_arch = "x86")]
type BinaryFn = unsafe extern "stdcall" fn(*mut c_void, i32, i32) -> i32;
#[cfg(not(target_arch = "x86"))]
type BinaryFn = unsafe extern "C" fn(*mut c_void, i32, i32) -> i32;

#[test]
fn test_explicit_slot_dispatch() {
    let registry = Arc::new(VtableRegistry::new());
    registry.ensure_registered::<dyn ICalculator>().unwrap();

    let calculator = Arc::new(Calculator);
    let callback = Callback::builder(&registry, calculator.clone())
        .implements::<dyn ICalculator>(calculator)
        .build();
    let shadow = callback.shadow_for::<dyn ICalculator>().unwrap();

    unsafe {
        let add: BinaryFn = std::mem::transmute_copy(&read_slot(shadow, 3));
        let multiply: BinaryFn = std::mem::transmute_copy(&read_slot(shadow, 6));
        assert_eq!(add(shadow, 10, 20), 30);
        assert_eq!(multiply(shadow, 6, 7), 42);
    }
}

// =============================================================================
// Test: Registration rules
// =============================================================================

#[shadow_interface("aaaaaaaa-0000-4000-8000-000000000001")]
pub trait IAnimal {
    fn legs(&self) -> i32;
}

#[shadow_interface("aaaaaaaa-0000-4000-8000-000000000002", extends(IAnimal))]
pub trait IDog: IAnimal {
    fn bark(&self);
}

#[test]
fn test_duplicate_registration() {
    let registry = VtableRegistry::new();
    registry.register_interface::<dyn IAnimal>().unwrap();

    let err = registry.register_interface::<dyn IAnimal>().unwrap_err();
    assert_eq!(
        err,
        Error::DuplicateRegistration {
            iid: IID_IANIMAL,
            name: "IAnimal"
        }
    );
}

#[test]
fn test_missing_base() {
    let registry = VtableRegistry::new();
    let err = registry.register_interface::<dyn IDog>().unwrap_err();
    assert_eq!(err, Error::ConfigurationMissing { iid: IID_IANIMAL });
    assert!(!registry.contains(&IID_IDOG));
}

#[test]
fn test_inherited_slots_first() {
    let registry = VtableRegistry::new();
    registry.register_interface::<dyn IAnimal>().unwrap();
    let dog = registry.register_interface::<dyn IDog>().unwrap();

    assert_eq!(dog.base(), Some(IID_IANIMAL));
    let names: Vec<_> = dog.slots().iter().map(|slot| slot.name).collect();
    assert_eq!(names, ["QueryInterface", "AddRef", "Release", "legs", "bark"]);
    assert_eq!(dog.slot(3).unwrap().declared_by, IID_IANIMAL);
    assert_eq!(dog.slot(4).unwrap().declared_by, IID_IDOG);
}

#[test]
fn test_ensure_registered_is_idempotent() {
    let registry = VtableRegistry::new();
    assert_eq!(registry.len(), 1);

    let first = registry.ensure_registered::<dyn IDog>().unwrap();
    assert!(registry.contains(&IID_IANIMAL));
    assert_eq!(registry.len(), 3);

    let second = registry.ensure_registered::<dyn IDog>().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.len(), 3);
}

#[test]
fn test_resolve_unknown() {
    let registry = VtableRegistry::new();
    assert_eq!(
        registry.resolve(&IID_IDOG).unwrap_err(),
        Error::ConfigurationMissing { iid: IID_IDOG }
    );
}

#[test]
fn test_global_registry() {
    let registry = VtableRegistry::global();
    assert!(Arc::ptr_eq(&registry, &VtableRegistry::global()));
    assert!(registry.contains(&IID_IUNKNOWN));
}

// =============================================================================
// Test: Plain C++ layouts
// =============================================================================

#[shadow_interface("bbbbbbbb-0000-4000-8000-000000000001", plain, thiscall)]
pub trait IWidget {
    fn width(&self) -> i32;
    fn height(&self) -> i32;
}

#[shadow_interface("bbbbbbbb-0000-4000-8000-000000000002", plain)]
pub trait IPlainBase {
    fn id(&self) -> u32;
}

#[test]
fn test_plain_layout_has_no_iunknown() {
    let registry = VtableRegistry::new();
    let widget = registry.register_interface::<dyn IWidget>().unwrap();

    assert_eq!(widget.layout(), VtableLayout::Plain);
    assert_eq!(widget.convention(), CallingConvention::Thiscall);
    assert_eq!(widget.base(), None);
    assert_eq!(widget.slot_index("width"), Some(0));
    assert_eq!(widget.slot_index("height"), Some(1));
}

#[test]
fn test_convention_mismatch_rejected() {
    let registry = VtableRegistry::new();
    registry.register_interface::<dyn IPlainBase>().unwrap();

    let decl = <dyn IWidget as ShadowInterface>::declaration().extends(IID_IPLAINBASE);
    let err = registry.register(decl).unwrap_err();
    assert!(matches!(err, Error::InvalidDescriptor { name: "IWidget", .. }));
}
