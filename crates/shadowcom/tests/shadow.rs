//! Tests for shadow identity, interface composition and IUnknown semantics

use shadowcom::com::IUnknownVTable;
use shadowcom::proc::shadow_interface;
use shadowcom::{
    Callback, E_INVALIDARG, E_NOINTERFACE, E_POINTER, Error, GUID, IID_IUNKNOWN, S_OK,
    VtableRegistry, read_slot,
};
use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;

unsafe fn slot<F: Copy>(this: *mut c_void, index: usize) -> F {
    unsafe { std::mem::transmute_copy(&read_slot(this, index)) }
}

#[shadow_interface("c0ffee00-0000-4000-8000-000000000001")]
pub trait IShape {
    fn area(&self) -> i32;
}

#[shadow_interface("c0ffee00-0000-4000-8000-000000000002", extends(IShape))]
pub trait ISolid: IShape {
    fn volume(&self) -> i32;
}

struct Cube {
    side: i32,
}

impl IShape for Cube {
    fn area(&self) -> i32 {
        6 * self.side * self.side
    }
}

impl ISolid for Cube {
    fn volume(&self) -> i32 {
        self.side * self.side * self.side
    }
}

#[cfg(target_arch = "x86")]
type MeasureFn = unsafe extern "stdcall" fn(*mut c_void) -> i32;
#[cfg(not(target_arch = "x86"))]
type MeasureFn = unsafe extern "C" fn(*mut c_void) -> i32;

fn cube_callback(side: i32) -> (Arc<Cube>, Callback) {
    let registry = Arc::new(VtableRegistry::new());
    registry.ensure_registered::<dyn ISolid>().unwrap();

    let cube = Arc::new(Cube { side });
    let callback = Callback::builder(&registry, cube.clone())
        .implements::<dyn ISolid>(cube.clone())
        .build();
    (cube, callback)
}

// =============================================================================
// Test: Shadow identity
// =============================================================================

#[test]
fn test_shadow_is_idempotent() {
    let (_cube, callback) = cube_callback(2);

    let first = callback.shadow_for::<dyn ISolid>().unwrap();
    let second = callback.shadow_for::<dyn ISolid>().unwrap();
    assert_eq!(first, second);

    let shape = callback.shadow_for::<dyn IShape>().unwrap();
    assert_ne!(first, shape);
    assert_eq!(callback.shadow_for::<dyn IShape>().unwrap(), shape);

    // IUnknown is the primary interface
    assert_eq!(callback.shadow(&IID_IUNKNOWN).unwrap(), first);
}

#[test]
fn test_interfaces_primary_first() {
    let (_cube, callback) = cube_callback(2);
    assert_eq!(callback.interfaces(), &[IID_ISOLID, IID_ISHAPE]);
    assert!(callback.implements(&IID_ISHAPE));
    assert!(callback.implements(&IID_IUNKNOWN));
    assert!(!callback.implements(&GUID::ZERO));
}

#[test]
fn test_shadow_word_zero_is_vtable() {
    let registry = Arc::new(VtableRegistry::new());
    let descriptor = registry.ensure_registered::<dyn ISolid>().unwrap();

    let cube = Arc::new(Cube { side: 1 });
    let callback = Callback::builder(&registry, cube.clone())
        .implements::<dyn ISolid>(cube)
        .build();
    let shadow = callback.shadow_for::<dyn ISolid>().unwrap();

    let vtbl = unsafe { *(shadow as *const *const *const c_void) };
    assert_eq!(vtbl, descriptor.table());
    assert!(descriptor.is_realized());
}

// =============================================================================
// Test: Composition
// =============================================================================

#[test]
fn test_composition_reaches_same_object() {
    let (_cube, callback) = cube_callback(3);
    let solid = callback.shadow_for::<dyn ISolid>().unwrap();
    let shape = callback.shadow_for::<dyn IShape>().unwrap();

    unsafe {
        // ISolid: [0..3) IUnknown, [3] area, [4] volume
        let area_via_solid: MeasureFn = slot(solid, 3);
        let volume: MeasureFn = slot(solid, 4);
        let area_via_shape: MeasureFn = slot(shape, 3);

        assert_eq!(area_via_solid(solid), 54);
        assert_eq!(area_via_shape(shape), 54);
        assert_eq!(volume(solid), 27);
    }
}

#[test]
fn test_base_view_without_derived() {
    let registry = Arc::new(VtableRegistry::new());
    registry.ensure_registered::<dyn IShape>().unwrap();

    let cube = Arc::new(Cube { side: 1 });
    let callback = Callback::builder(&registry, cube.clone())
        .implements::<dyn IShape>(cube)
        .build();

    assert!(callback.shadow_for::<dyn IShape>().is_ok());
    assert_eq!(
        callback.shadow_for::<dyn ISolid>(),
        Err(Error::InterfaceNotImplemented { iid: IID_ISOLID })
    );
}

#[test]
fn test_unregistered_interface() {
    let registry = Arc::new(VtableRegistry::new());
    let cube = Arc::new(Cube { side: 1 });
    let callback = Callback::builder(&registry, cube.clone())
        .implements::<dyn IShape>(cube)
        .build();

    assert_eq!(
        callback.shadow_for::<dyn IShape>(),
        Err(Error::ConfigurationMissing { iid: IID_ISHAPE })
    );
}

// =============================================================================
// Test: IUnknown
// =============================================================================

#[test]
fn test_query_interface() {
    let (_cube, callback) = cube_callback(2);
    let solid = callback.shadow_for::<dyn ISolid>().unwrap();
    let shape = callback.shadow_for::<dyn IShape>().unwrap();
    assert_eq!(callback.ref_count(), 1);

    unsafe {
        let unknown = IUnknownVTable::of(solid);
        let mut out: *mut c_void = ptr::null_mut();

        assert_eq!((unknown.query_interface)(solid, &IID_ISHAPE, &mut out), S_OK);
        assert_eq!(out, shape);
        assert_eq!(callback.ref_count(), 2);

        assert_eq!((unknown.query_interface)(shape, &IID_IUNKNOWN, &mut out), S_OK);
        assert_eq!(out, solid);
        assert_eq!(callback.ref_count(), 3);

        let missing = GUID::from_u128(0xdeadbeef_0000_0000_0000_000000000000);
        out = shape;
        assert_eq!((unknown.query_interface)(solid, &missing, &mut out), E_NOINTERFACE);
        assert!(out.is_null());
        assert_eq!(callback.ref_count(), 3);

        assert_eq!(
            (unknown.query_interface)(solid, &IID_ISHAPE, ptr::null_mut()),
            E_POINTER
        );
        assert_eq!(
            (unknown.query_interface)(solid, ptr::null(), &mut out),
            E_INVALIDARG
        );

        assert_eq!((unknown.release)(solid), 2);
        assert_eq!((unknown.release)(shape), 1);
    }
}

#[test]
fn test_add_ref_release_share_one_count() {
    let (_cube, callback) = cube_callback(2);
    let solid = callback.shadow_for::<dyn ISolid>().unwrap();
    let shape = callback.shadow_for::<dyn IShape>().unwrap();

    unsafe {
        let unknown = IUnknownVTable::of(solid);
        assert_eq!((unknown.add_ref)(solid), 2);
        assert_eq!((unknown.add_ref)(shape), 3);
        assert_eq!((unknown.release)(solid), 2);
        assert_eq!((unknown.release)(shape), 1);
    }
    assert_eq!(callback.ref_count(), 1);
}

#[test]
fn test_shadows_outlive_callback_handle() {
    let (cube, callback) = cube_callback(2);
    let solid = callback.shadow_for::<dyn ISolid>().unwrap();
    assert_eq!(callback.add_ref(), 2);
    drop(callback);

    unsafe {
        let volume: MeasureFn = slot(solid, 4);
        assert_eq!(volume(solid), 8);

        let unknown = IUnknownVTable::of(solid);
        assert_eq!((unknown.release)(solid), 0);
    }
    assert_eq!(Arc::strong_count(&cube), 1);
}

#[test]
fn test_no_shadows_after_final_release() {
    let (_cube, callback) = cube_callback(2);
    callback.shadow_for::<dyn ISolid>().unwrap();

    assert_eq!(callback.release(), 0);
    assert_eq!(callback.shadow_for::<dyn ISolid>(), Err(Error::Disposed));
    assert_eq!(callback.add_ref(), 0);
    assert_eq!(callback.release(), 0);
}

#[test]
fn test_query_interface_hands_out_a_reference() {
    let (_cube, callback) = cube_callback(2);
    let borrowed = callback.shadow_for::<dyn IShape>().unwrap();
    assert_eq!(callback.ref_count(), 1);

    let owned = callback.query_interface(&IID_ISHAPE).unwrap();
    assert_eq!(owned, borrowed);
    assert_eq!(callback.ref_count(), 2);

    unsafe {
        let unknown = IUnknownVTable::of(owned);
        assert_eq!((unknown.release)(owned), 1);
    }
    assert_eq!(callback.release(), 0);
    assert_eq!(callback.query_interface(&IID_ISHAPE), Err(Error::Disposed));
}

#[test]
fn test_dispose_is_idempotent() {
    let (cube, callback) = cube_callback(2);
    assert_eq!(Arc::strong_count(&cube), 2);
    callback.add_ref();

    callback.dispose();
    callback.dispose();
    assert!(callback.is_disposed());
    assert_eq!(callback.ref_count(), 1);
    assert_eq!(Arc::strong_count(&cube), 1);
}
