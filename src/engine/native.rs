// src/engine/native.rs

//! Binding to the native detection library (`libtdt`).
//!
//! Only built with the `native` feature. The C API identifies an agent by
//! an opaque handle and calls a single plain function pointer for every
//! notification, so the registry that maps contexts back to callbacks has
//! to be reachable from a `static`: it is installed once by
//! `NativeBackend::new` and lives for the rest of the process.
//!
//! Key responsibilities:
//! - Declare the C entry points and translate raw codes.
//! - Own each native handle and destruct it on drop.
//! - Bridge notifications into the registry without unwinding into C.

use crate::codes::{ProtocolFormat, ResultCode};
use crate::engine::{Engine, EngineBackend, FillReply};
use crate::notify::{Context, NotificationRegistry};
use crate::tdt_log;
use log::Level;
use std::{
    ffi::{c_char, c_longlong, c_uint, c_void, CStr},
    panic::{self, AssertUnwindSafe},
    process,
    ptr::{self, NonNull},
    sync::{Arc, OnceLock},
};
use thiserror::Error;

type NotificationFn = extern "C" fn(context: c_longlong, msg: *const c_char, msg_len: usize);

#[link(name = "tdt")]
unsafe extern "C" {
    fn construct_agent(proto_fmt: c_uint) -> *mut c_void;
    fn destruct_agent(hagent: *mut c_void) -> c_uint;
    fn discover(hagent: *mut c_void, capabilities: *mut c_char, caps_buffer_len: usize, caps_len: *mut usize) -> c_uint;
    fn get_configuration(
        hagent: *mut c_void,
        opt_profile_name: *const c_char,
        opt_profile_name_len: usize,
        config: *mut c_char,
        config_buffer_len: usize,
        config_len: *mut usize,
    ) -> c_uint;
    fn set_configuration(
        hagent: *mut c_void,
        opt_profile_name: *const c_char,
        opt_profile_name_len: usize,
        opt_config: *const c_char,
        opt_config_buffer_len: usize,
    ) -> c_uint;
    fn start(hagent: *mut c_void) -> c_uint;
    fn stop(hagent: *mut c_void, opt_profile_name: *const c_char, opt_profile_name_len: usize) -> c_uint;
    fn set_notification_callback(hagent: *mut c_void, callback: NotificationFn, context: c_longlong) -> c_uint;
    fn get_error_string(code: c_uint) -> *const c_char;
}

static REGISTRY: OnceLock<Arc<NotificationRegistry>> = OnceLock::new();

#[derive(Debug, Error)]
pub enum NativeError {
    #[error("a different notification registry is already bound to the native library")]
    RegistryAlreadyInstalled,
}

/// Codes outside the known range are reported as internal errors.
fn code(raw: c_uint) -> ResultCode {
    ResultCode::from_raw(raw).unwrap_or_else(|| {
        tdt_log!(Level::Warn, "native", "library returned unknown code {}", raw);
        ResultCode::Internal
    })
}

fn name_ptr(profile: Option<&str>) -> (*const c_char, usize) {
    match profile {
        Some(p) => (p.as_ptr().cast(), p.len()),
        None => (ptr::null(), 0),
    }
}

fn buffer_ptr(buffer: Option<&mut [u8]>) -> (*mut c_char, usize) {
    match buffer {
        Some(b) => (b.as_mut_ptr().cast(), b.len()),
        None => (ptr::null_mut(), 0),
    }
}

fn fill_reply(raw: c_uint, len: usize) -> FillReply {
    let code = code(raw);
    FillReply::new(code, (len > 0).then_some(len))
}

extern "C" fn notification_bridge(context: c_longlong, msg: *const c_char, msg_len: usize) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let text = if msg.is_null() {
            String::new()
        } else {
            // SAFETY: the library passes `msg_len` readable bytes at `msg`
            // for the duration of the call.
            let bytes = unsafe { std::slice::from_raw_parts(msg.cast::<u8>(), msg_len) };
            String::from_utf8_lossy(bytes.strip_suffix(b"\0").unwrap_or(bytes)).into_owned()
        };
        match REGISTRY.get() {
            Some(registry) => registry
                .try_dispatch(context as u64, &text)
                .map_err(|e| e.to_string()),
            None => Err(format!("notification for context {context} before any registry was installed")),
        }
    }));

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tdt_log!(Level::Error, "native", "fatal notification dispatch: {}", e);
            log::logger().flush();
            process::abort();
        }
        Err(_) => {
            tdt_log!(Level::Error, "native", "notification callback panicked for context {}", context);
            log::logger().flush();
            process::abort();
        }
    }
}

/// Backend that creates engines through `libtdt`.
pub struct NativeBackend;

impl NativeBackend {
    /// Bind `registry` as the target of every native notification.
    pub fn new(registry: Arc<NotificationRegistry>) -> Result<Self, NativeError> {
        let installed = REGISTRY.get_or_init(|| Arc::clone(&registry));
        if !Arc::ptr_eq(installed, &registry) {
            return Err(NativeError::RegistryAlreadyInstalled);
        }
        Ok(NativeBackend)
    }
}

impl EngineBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn construct(&self, format: ProtocolFormat) -> Option<Box<dyn Engine>> {
        // SAFETY: plain value argument; a null return means failure.
        let raw = unsafe { construct_agent(format.as_raw()) };
        let handle = NonNull::new(raw)?;
        Some(Box::new(NativeEngine { handle }))
    }

    fn error_string(&self, code: ResultCode) -> Option<String> {
        // SAFETY: returns null or a static NUL-terminated string.
        let text = unsafe { get_error_string(code.as_raw()) };
        if text.is_null() {
            return None;
        }
        // SAFETY: checked non-null above; the library owns the storage.
        Some(unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned())
    }
}

/// One `libtdt` agent handle.
pub struct NativeEngine {
    handle: NonNull<c_void>,
}

// SAFETY: the library serialises calls on a handle internally and the
// handle is only freed in `drop`.
unsafe impl Send for NativeEngine {}
unsafe impl Sync for NativeEngine {}

impl NativeEngine {
    fn raw(&self) -> *mut c_void {
        self.handle.as_ptr()
    }
}

impl Engine for NativeEngine {
    fn start(&self) -> ResultCode {
        // SAFETY: live handle.
        code(unsafe { start(self.raw()) })
    }

    fn stop(&self, profile: Option<&str>) -> ResultCode {
        let (name, name_len) = name_ptr(profile);
        // SAFETY: live handle; `name` is valid for `name_len` bytes or null.
        code(unsafe { stop(self.raw(), name, name_len) })
    }

    fn discover(&self, buffer: Option<&mut [u8]>) -> FillReply {
        let (buf, buf_len) = buffer_ptr(buffer);
        let mut len = 0usize;
        // SAFETY: live handle; `buf` is writable for `buf_len` bytes or null.
        let raw = unsafe { discover(self.raw(), buf, buf_len, &mut len) };
        fill_reply(raw, len)
    }

    fn get_configuration(&self, profile: Option<&str>, buffer: Option<&mut [u8]>) -> FillReply {
        let (name, name_len) = name_ptr(profile);
        let (buf, buf_len) = buffer_ptr(buffer);
        let mut len = 0usize;
        // SAFETY: as for `discover`, plus `name` valid for `name_len` bytes.
        let raw = unsafe { get_configuration(self.raw(), name, name_len, buf, buf_len, &mut len) };
        fill_reply(raw, len)
    }

    fn set_configuration(&self, profile: Option<&str>, payload: &str) -> ResultCode {
        let (name, name_len) = name_ptr(profile);
        // SAFETY: both pointers valid for their lengths for the whole call.
        code(unsafe { set_configuration(self.raw(), name, name_len, payload.as_ptr().cast(), payload.len()) })
    }

    fn set_notification_callback(&self, context: Context, registry: Arc<NotificationRegistry>) -> ResultCode {
        if !REGISTRY.get().is_some_and(|installed| Arc::ptr_eq(installed, &registry)) {
            tdt_log!(Level::Error, "native", "context {} belongs to a registry the library cannot reach", context);
            return ResultCode::InvalidParam;
        }
        let Ok(raw_context) = c_longlong::try_from(context.get()) else {
            return ResultCode::InvalidParam;
        };
        // SAFETY: live handle; the bridge is a `'static` function.
        code(unsafe { set_notification_callback(self.raw(), notification_bridge, raw_context) })
    }
}

impl Drop for NativeEngine {
    fn drop(&mut self) {
        // SAFETY: the handle came from `construct_agent` and is released once.
        let raw = unsafe { destruct_agent(self.raw()) };
        let rc = code(raw);
        if !rc.is_success() {
            tdt_log!(Level::Warn, "native", "destruct_agent returned {}", rc);
        }
    }
}
