// src/engine/mod.rs

//! Boundary to the detection engine.
//!
//! The engine itself (plugins, pipelines, how a threat is recognised) lives
//! outside this crate. These traits are the contract the agent layer relies
//! on; `simulated` implements it in-process and `native` (feature `native`)
//! binds the C library.

pub mod buffer;
#[cfg(feature = "native")]
pub mod native;
pub mod simulated;

use crate::codes::{ProtocolFormat, ResultCode};
use crate::notify::{Context, NotificationRegistry};
use std::sync::Arc;

pub use buffer::{negotiate, MAX_FILL_ATTEMPTS};
pub use simulated::{ProfileSpec, SimulatedBackend};

/// Reply of a size-negotiated call: the code plus the buffer length the
/// engine needs (NUL terminator included), when it reported one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillReply {
    pub code: ResultCode,
    pub required: Option<usize>,
}

impl FillReply {
    pub fn new(code: ResultCode, required: Option<usize>) -> Self {
        Self { code, required }
    }

    /// "Buffer too small, `required` bytes needed".
    pub fn insufficient(required: usize) -> Self {
        Self::new(ResultCode::InsufficientBufferSize, Some(required))
    }

    pub fn code(code: ResultCode) -> Self {
        Self::new(code, None)
    }
}

/// Factory for engine instances plus the engine's static error table.
pub trait EngineBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Create a new engine speaking `format`. `None` on allocation failure
    /// or an unsupported format.
    fn construct(&self, format: ProtocolFormat) -> Option<Box<dyn Engine>>;

    /// The engine's description of `code`, if its table has one.
    fn error_string(&self, code: ResultCode) -> Option<String>;
}

/// One live engine instance. Dropping it is the engine's `destruct`.
///
/// Calls are synchronous and may block for as long as the engine needs.
pub trait Engine: Send + Sync {
    /// Begin detection on every configured profile.
    fn start(&self) -> ResultCode;

    /// Stop one profile, or all of them when `profile` is `None`.
    fn stop(&self, profile: Option<&str>) -> ResultCode;

    /// Capabilities and profiles. With `buffer == None` only the required
    /// size is reported.
    fn discover(&self, buffer: Option<&mut [u8]>) -> FillReply;

    /// Configuration for one profile, or all of them when `profile` is `None`.
    fn get_configuration(&self, profile: Option<&str>, buffer: Option<&mut [u8]>) -> FillReply;

    fn set_configuration(&self, profile: Option<&str>, payload: &str) -> ResultCode;

    /// Tag future notifications with `context` and deliver them through
    /// `registry` from whichever thread produces them.
    fn set_notification_callback(
        &self,
        context: Context,
        registry: Arc<NotificationRegistry>,
    ) -> ResultCode;
}

/// Write `payload` plus a NUL terminator into `buffer`, following the C
/// API rules: a missing or too-small buffer yields the required size.
pub fn fill_buffer(payload: &str, code: ResultCode, buffer: Option<&mut [u8]>) -> FillReply {
    let required = payload.len() + 1;
    match buffer {
        Some(buf) if buf.len() >= required => {
            buf[..payload.len()].copy_from_slice(payload.as_bytes());
            buf[payload.len()] = 0;
            FillReply::new(code, Some(required))
        }
        _ => FillReply::insufficient(required),
    }
}
