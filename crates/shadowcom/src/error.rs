//! Error types
//!
//! [`Error`] is returned by the managed-side API. [`CallbackError`] is what a callback
//! implementation returns to native code; the thunks turn it into an HRESULT.

use thiserror::Error;

use crate::com::{
    E_FAIL, E_NOINTERFACE, E_NOTIMPL, E_UNEXPECTED, GUID, HRESULT, RPC_E_DISCONNECTED,
    ResultDescriptor,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("no vtable descriptor is registered for interface {iid}")]
    ConfigurationMissing { iid: GUID },
    #[error("interface {name} ({iid}) is already registered")]
    DuplicateRegistration { iid: GUID, name: &'static str },
    #[error("invalid vtable descriptor for {name}: {reason}")]
    InvalidDescriptor { name: &'static str, reason: String },
    #[error("{api} failed with HRESULT 0x{:08X}{}", .code, describe(.code))]
    NativeCallFailed { api: &'static str, code: HRESULT },
    #[error(transparent)]
    ManagedCallbackFailed(#[from] CallbackError),
    #[error("object tracking inconsistency: {0}")]
    TrackingInconsistency(String),
    #[error("tracker configuration is immutable after first use")]
    ConfigurationImmutable,
    #[error("callback does not implement interface {iid}")]
    InterfaceNotImplemented { iid: GUID },
    #[error("object has been disposed")]
    Disposed,
}

impl Error {
    /// The HRESULT reported to native callers for this error.
    pub fn code(&self) -> HRESULT {
        match self {
            Error::ConfigurationMissing { .. } | Error::InterfaceNotImplemented { .. } => {
                E_NOINTERFACE
            }
            Error::NativeCallFailed { code, .. } => *code,
            Error::ManagedCallbackFailed(err) => err.code(),
            Error::Disposed => RPC_E_DISCONNECTED,
            Error::DuplicateRegistration { .. }
            | Error::InvalidDescriptor { .. }
            | Error::TrackingInconsistency(_)
            | Error::ConfigurationImmutable => E_UNEXPECTED,
        }
    }
}

fn describe(code: &HRESULT) -> String {
    match ResultDescriptor::find(*code) {
        Some(descriptor) => format!(" ({}: {})", descriptor.name, descriptor.description),
        None => String::new(),
    }
}

/// Failure raised by a callback implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("callback failed with HRESULT 0x{code:08X}: {message}")]
pub struct CallbackError {
    code: HRESULT,
    message: String,
}

impl CallbackError {
    pub fn new(code: HRESULT, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// `E_FAIL` with a message
    pub fn fail(message: impl Into<String>) -> Self {
        Self::new(E_FAIL, message)
    }

    /// `E_NOTIMPL` for the named method
    pub fn not_implemented(method: &str) -> Self {
        Self::new(E_NOTIMPL, format!("{method} is not implemented"))
    }

    pub fn code(&self) -> HRESULT {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<Error> for CallbackError {
    fn from(err: Error) -> Self {
        match err {
            Error::ManagedCallbackFailed(inner) => inner,
            other => Self::new(other.code(), other.to_string()),
        }
    }
}

/// Return type of fallible callback methods.
pub type CallbackResult<T = ()> = std::result::Result<T, CallbackError>;
