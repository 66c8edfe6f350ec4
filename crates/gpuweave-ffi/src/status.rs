//! Status codes returned by every `gw_*` entry point, and the per-thread
//! message of the last failure.

use std::cell::RefCell;
use std::ffi::{c_char, c_int, CStr, CString};

use gpuweave_core::CoreError;
use gpuweave_vk::GpuError;
use tracing::warn;

pub type GwStatus = c_int;

pub const GW_OK: GwStatus = 0;
/// The arena refused the resource; it needs a different memory class.
pub const GW_REJECTED: GwStatus = 1;
pub const GW_ERROR_INVALID_VALUE: GwStatus = -1;
pub const GW_ERROR_INVALID_HANDLE: GwStatus = -2;
pub const GW_ERROR_CONFIGURATION: GwStatus = -3;
pub const GW_ERROR_RESOURCE_STATE: GwStatus = -4;
pub const GW_ERROR_DRIVER: GwStatus = -5;
pub const GW_ERROR_TIMEOUT: GwStatus = -6;
pub const GW_ERROR_VALIDATION: GwStatus = -7;
pub const GW_ERROR_COLLABORATOR: GwStatus = -8;
pub const GW_ERROR_UNMAPPED_LAYOUT: GwStatus = -9;
pub const GW_ERROR_LOADING: GwStatus = -10;

#[derive(Debug, thiserror::Error)]
pub enum FfiError {
    #[error("invalid argument: {0}")]
    InvalidValue(&'static str),

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl FfiError {
    pub fn status(&self) -> GwStatus {
        match self {
            FfiError::InvalidValue(_) => GW_ERROR_INVALID_VALUE,
            FfiError::Core(e) => core_status(e),
            FfiError::Gpu(e) => match e {
                GpuError::Configuration(_) => GW_ERROR_CONFIGURATION,
                GpuError::ResourceState(_) => GW_ERROR_RESOURCE_STATE,
                GpuError::Driver { .. } => GW_ERROR_DRIVER,
                GpuError::Timeout { .. } => GW_ERROR_TIMEOUT,
                GpuError::UnmappedLayout(_) => GW_ERROR_UNMAPPED_LAYOUT,
                GpuError::Validation(_) => GW_ERROR_VALIDATION,
                GpuError::Collaborator { .. } => GW_ERROR_COLLABORATOR,
                GpuError::Loading(_) => GW_ERROR_LOADING,
                GpuError::Core(e) => core_status(e),
            },
        }
    }
}

fn core_status(error: &CoreError) -> GwStatus {
    match error {
        CoreError::HandleNotFound(_) => GW_ERROR_INVALID_HANDLE,
        CoreError::ConfigError(_) | CoreError::Parse(_) | CoreError::Io(_) => {
            GW_ERROR_CONFIGURATION
        }
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Run an entry point body, turning a failure into its status code and
/// remembering the message for `gw_last_error`.
pub(crate) fn guard(
    call: &'static str,
    body: impl FnOnce() -> Result<GwStatus, FfiError>,
) -> GwStatus {
    match body() {
        Ok(status) => status,
        Err(e) => {
            let status = e.status();
            warn!(call, status, "{}", e);
            set_last_error(&format!("{call}: {e}"));
            status
        }
    }
}

fn set_last_error(message: &str) {
    let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

/// Message of the last failed call on this thread, or null if none failed.
///
/// The pointer stays valid until the next failing call on the same thread.
#[no_mangle]
pub extern "C" fn gw_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(std::ptr::null(), |m| m.as_ptr())
    })
}

#[no_mangle]
pub extern "C" fn gw_clear_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

macro_rules! cstr {
    ($s:literal) => {
        concat!($s, "\0").as_ptr() as *const c_char
    };
}

/// Static name of a status code.
#[no_mangle]
pub extern "C" fn gw_status_name(status: GwStatus) -> *const c_char {
    match status {
        GW_OK => cstr!("GW_OK"),
        GW_REJECTED => cstr!("GW_REJECTED"),
        GW_ERROR_INVALID_VALUE => cstr!("GW_ERROR_INVALID_VALUE"),
        GW_ERROR_INVALID_HANDLE => cstr!("GW_ERROR_INVALID_HANDLE"),
        GW_ERROR_CONFIGURATION => cstr!("GW_ERROR_CONFIGURATION"),
        GW_ERROR_RESOURCE_STATE => cstr!("GW_ERROR_RESOURCE_STATE"),
        GW_ERROR_DRIVER => cstr!("GW_ERROR_DRIVER"),
        GW_ERROR_TIMEOUT => cstr!("GW_ERROR_TIMEOUT"),
        GW_ERROR_VALIDATION => cstr!("GW_ERROR_VALIDATION"),
        GW_ERROR_COLLABORATOR => cstr!("GW_ERROR_COLLABORATOR"),
        GW_ERROR_UNMAPPED_LAYOUT => cstr!("GW_ERROR_UNMAPPED_LAYOUT"),
        GW_ERROR_LOADING => cstr!("GW_ERROR_LOADING"),
        _ => cstr!("GW_ERROR_UNKNOWN"),
    }
}

/// Copy of the last error message, for Rust callers and tests.
pub fn last_error_message() -> Option<String> {
    let ptr = gw_last_error();
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null pointers come from the thread-local CString.
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}
