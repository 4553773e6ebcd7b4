//! COM (Component Object Model) support types
//!
//! ## Key Types
//! - [`GUID`] - 128-bit globally unique identifier for interfaces
//! - [`HRESULT`] - COM return type for error handling
//! - [`IUnknownVTable`] - Slots 0-2 of every COM vtable, used to call native objects
//! - [`ComRefCount`] - Atomic reference counter shared by all shadows of a callback
//! - [`ResultDescriptor`] - Symbolic names for well known and registered result codes

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering, fence};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

// =============================================================================
// GUID - Globally Unique Identifier
// =============================================================================

/// 128-bit globally unique identifier (GUID/UUID/IID).
///
/// Used for interface identification in COM. Format: `{XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX}`
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GUID {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl GUID {
    /// Create a new GUID from components
    #[must_use]
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    /// Create a GUID from its big-endian 128-bit value, e.g. `0x12345678_1234_1234_1234_123456789abc`
    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        let b = value.to_be_bytes();
        Self::new(
            u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            u16::from_be_bytes([b[4], b[5]]),
            u16::from_be_bytes([b[6], b[7]]),
            [b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]],
        )
    }

    /// The nil/zero GUID
    pub const ZERO: GUID = GUID::new(0, 0, 0, [0; 8]);
}

impl std::fmt::Debug for GUID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}}}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7]
        )
    }
}

impl std::fmt::Display for GUID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7]
        )
    }
}

// =============================================================================
// HRESULT - COM error codes
// =============================================================================

/// COM result type. 0 (S_OK) indicates success, negative values indicate errors.
pub type HRESULT = i32;

/// Success
pub const S_OK: HRESULT = 0;
/// Success, but returned false
pub const S_FALSE: HRESULT = 1;
/// Not implemented
pub const E_NOTIMPL: HRESULT = 0x8000_4001_u32 as i32;
/// No such interface supported
pub const E_NOINTERFACE: HRESULT = 0x8000_4002_u32 as i32;
/// Invalid pointer
pub const E_POINTER: HRESULT = 0x8000_4003_u32 as i32;
/// Operation aborted
pub const E_ABORT: HRESULT = 0x8000_4004_u32 as i32;
/// Unspecified failure
pub const E_FAIL: HRESULT = 0x8000_4005_u32 as i32;
/// Catastrophic failure
pub const E_UNEXPECTED: HRESULT = 0x8000_FFFF_u32 as i32;
/// General access denied error
pub const E_ACCESSDENIED: HRESULT = 0x8007_0005_u32 as i32;
/// Invalid handle
pub const E_HANDLE: HRESULT = 0x8007_0006_u32 as i32;
/// Out of memory
pub const E_OUTOFMEMORY: HRESULT = 0x8007_000E_u32 as i32;
/// Invalid argument
pub const E_INVALIDARG: HRESULT = 0x8007_0057_u32 as i32;
/// The object invoked has disconnected from its clients
pub const RPC_E_DISCONNECTED: HRESULT = 0x8001_0108_u32 as i32;

/// Check if an HRESULT indicates success (non-negative)
#[inline]
#[must_use]
pub const fn succeeded(hr: HRESULT) -> bool {
    hr >= 0
}

/// Check if an HRESULT indicates failure (negative)
#[inline]
#[must_use]
pub const fn failed(hr: HRESULT) -> bool {
    hr < 0
}

/// Turn a failed HRESULT returned by `api` into [`crate::Error::NativeCallFailed`].
pub fn check(api: &'static str, hr: HRESULT) -> crate::Result<()> {
    if failed(hr) {
        Err(crate::Error::NativeCallFailed { api, code: hr })
    } else {
        Ok(())
    }
}

// =============================================================================
// ResultDescriptor - symbolic names for result codes
// =============================================================================

/// Describes a result code: which module defines it and what it means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultDescriptor {
    pub code: HRESULT,
    pub module: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

impl ResultDescriptor {
    pub const fn new(
        code: HRESULT,
        module: &'static str,
        name: &'static str,
        description: &'static str,
    ) -> Self {
        Self {
            code,
            module,
            name,
            description,
        }
    }

    /// Look up a descriptor, registered codes first, then the built-in table.
    pub fn find(code: HRESULT) -> Option<ResultDescriptor> {
        if let Some(descriptor) = REGISTERED.read().get(&code) {
            return Some(*descriptor);
        }
        BUILTIN.iter().find(|d| d.code == code).copied()
    }

    /// Register a module-specific result code. Returns the descriptor it replaced, if any.
    pub fn register(descriptor: ResultDescriptor) -> Option<ResultDescriptor> {
        REGISTERED.write().insert(descriptor.code, descriptor)
    }
}

impl std::fmt::Display for ResultDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HRESULT: [0x{:08X}], Module: [{}], ApiCode: [{}], Message: {}",
            self.code, self.module, self.name, self.description
        )
    }
}

static REGISTERED: Lazy<RwLock<HashMap<HRESULT, ResultDescriptor>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

const BUILTIN: &[ResultDescriptor] = &[
    ResultDescriptor::new(S_OK, "General", "S_OK", "Operation successful"),
    ResultDescriptor::new(S_FALSE, "General", "S_FALSE", "Operation successful, returned false"),
    ResultDescriptor::new(E_NOTIMPL, "General", "E_NOTIMPL", "Not implemented"),
    ResultDescriptor::new(E_NOINTERFACE, "General", "E_NOINTERFACE", "No such interface supported"),
    ResultDescriptor::new(E_POINTER, "General", "E_POINTER", "Invalid pointer"),
    ResultDescriptor::new(E_ABORT, "General", "E_ABORT", "Operation aborted"),
    ResultDescriptor::new(E_FAIL, "General", "E_FAIL", "Unspecified error"),
    ResultDescriptor::new(E_UNEXPECTED, "General", "E_UNEXPECTED", "Catastrophic failure"),
    ResultDescriptor::new(E_ACCESSDENIED, "General", "E_ACCESSDENIED", "General access denied error"),
    ResultDescriptor::new(E_HANDLE, "General", "E_HANDLE", "Invalid handle"),
    ResultDescriptor::new(E_OUTOFMEMORY, "General", "E_OUTOFMEMORY", "Out of memory"),
    ResultDescriptor::new(E_INVALIDARG, "General", "E_INVALIDARG", "Invalid arguments"),
    ResultDescriptor::new(
        RPC_E_DISCONNECTED,
        "RPC",
        "RPC_E_DISCONNECTED",
        "The object invoked has disconnected from its clients",
    ),
];

// =============================================================================
// IUnknown - Base COM interface
// =============================================================================

/// IUnknown interface ID
pub const IID_IUNKNOWN: GUID = GUID::new(
    0x00000000,
    0x0000,
    0x0000,
    [0xC0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x46],
);

#[cfg(target_arch = "x86")]
pub type QueryInterfaceFn =
    unsafe extern "stdcall" fn(this: *mut c_void, riid: *const GUID, ppv: *mut *mut c_void) -> HRESULT;
#[cfg(not(target_arch = "x86"))]
pub type QueryInterfaceFn =
    unsafe extern "C" fn(this: *mut c_void, riid: *const GUID, ppv: *mut *mut c_void) -> HRESULT;

#[cfg(target_arch = "x86")]
pub type AddRefFn = unsafe extern "stdcall" fn(this: *mut c_void) -> u32;
#[cfg(not(target_arch = "x86"))]
pub type AddRefFn = unsafe extern "C" fn(this: *mut c_void) -> u32;

#[cfg(target_arch = "x86")]
pub type ReleaseFn = unsafe extern "stdcall" fn(this: *mut c_void) -> u32;
#[cfg(not(target_arch = "x86"))]
pub type ReleaseFn = unsafe extern "C" fn(this: *mut c_void) -> u32;

/// Slots 0, 1, 2 of every COM vtable.
#[repr(C)]
pub struct IUnknownVTable {
    pub query_interface: QueryInterfaceFn,
    pub add_ref: AddRefFn,
    pub release: ReleaseFn,
}

impl IUnknownVTable {
    /// Read the IUnknown part of the vtable of a COM object.
    ///
    /// # Safety
    /// `this` must point to a live COM object.
    pub unsafe fn of<'a>(this: *mut c_void) -> &'a IUnknownVTable {
        unsafe { &**(this as *const *const IUnknownVTable) }
    }
}

// =============================================================================
// ComRefCount - Atomic reference counter for COM objects
// =============================================================================

/// Atomic reference counter for COM objects.
///
/// All shadows of one callback share a single counter.
#[repr(transparent)]
pub struct ComRefCount(AtomicU32);

impl ComRefCount {
    /// Create a new reference counter with count = 1
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    /// Increment the reference count. Returns the new count.
    #[inline]
    pub fn add_ref(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Increment unless the count already reached zero.
    #[inline]
    pub fn try_add_ref(&self) -> Option<u32> {
        self.0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                (count != 0).then(|| count + 1)
            })
            .ok()
            .map(|previous| previous + 1)
    }

    /// Decrement the reference count. Returns the new count.
    ///
    /// When count reaches 0, the caller should destroy the object.
    /// Releasing an object whose count is already 0 returns 0 without wrapping.
    #[inline]
    pub fn release(&self) -> u32 {
        self.try_release().unwrap_or(0)
    }

    /// Decrement the reference count, `None` if it already was zero.
    #[inline]
    pub fn try_release(&self) -> Option<u32> {
        let previous = self
            .0
            .fetch_update(Ordering::Release, Ordering::Relaxed, |count| {
                count.checked_sub(1)
            })
            .ok()?;
        if previous == 1 {
            // Synchronize with every earlier release before teardown
            fence(Ordering::Acquire);
        }
        Some(previous - 1)
    }

    /// Get the current reference count.
    #[inline]
    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for ComRefCount {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// windows-core interop
// =============================================================================

#[cfg(feature = "windows-compat")]
impl From<GUID> for windows_core::GUID {
    fn from(guid: GUID) -> Self {
        windows_core::GUID::from_values(guid.data1, guid.data2, guid.data3, guid.data4)
    }
}

#[cfg(feature = "windows-compat")]
impl From<windows_core::GUID> for GUID {
    fn from(guid: windows_core::GUID) -> Self {
        GUID::new(guid.data1, guid.data2, guid.data3, guid.data4)
    }
}

#[cfg(feature = "windows-compat")]
impl From<crate::Error> for windows_core::Error {
    fn from(err: crate::Error) -> Self {
        windows_core::Error::new(windows_core::HRESULT(err.code()), err.to_string())
    }
}
