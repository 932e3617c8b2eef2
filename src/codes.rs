// src/codes.rs

//! Result codes and protocol formats shared with the detection engine.
//!
//! Both enums are closed sets whose numeric values match the native C
//! boundary, so a raw `u32` crossing the FFI line maps onto exactly one
//! variant (or none, for out-of-range values).
//!
//! Key responsibilities:
//! - Define `ResultCode`, the outcome of every engine-crossing operation.
//! - Define `ProtocolFormat`, the payload serialization fixed per agent.
//! - Map codes to human-readable descriptions with a generic fallback.

use serde::Deserialize;
use std::fmt;

/// Description returned for codes the engine table does not know.
pub const UNKNOWN_ERROR: &str = "Unknown error code";

/// Outcome of an engine operation.
///
/// `NotAllProfilesLoaded` is the only warning: it still carries a
/// (partial) payload. Everything else except `Success` is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResultCode {
    Success = 0,
    NullParam = 1,
    InvalidParam = 2,
    OutOfMemory = 3,
    Internal = 4,
    InsufficientBufferSize = 5,
    NotImplemented = 6,
    StartupFailure = 7,
    InvalidPlugin = 8,
    InvalidConfig = 9,
    NoExecution = 10,
    AgentRunning = 11,
    AgentNotRunning = 12,
    AgentAborted = 13,
    SignVerifyFailed = 14,
    NoProfilesAvailable = 15,
    NotAllProfilesLoaded = 16,
    ProfilesDirNotExists = 17,
    AgentUnableToStop = 18,
    PipelineNotFunctional = 19,
}

impl ResultCode {
    /// Every code in boundary order.
    pub const ALL: [ResultCode; 20] = [
        ResultCode::Success,
        ResultCode::NullParam,
        ResultCode::InvalidParam,
        ResultCode::OutOfMemory,
        ResultCode::Internal,
        ResultCode::InsufficientBufferSize,
        ResultCode::NotImplemented,
        ResultCode::StartupFailure,
        ResultCode::InvalidPlugin,
        ResultCode::InvalidConfig,
        ResultCode::NoExecution,
        ResultCode::AgentRunning,
        ResultCode::AgentNotRunning,
        ResultCode::AgentAborted,
        ResultCode::SignVerifyFailed,
        ResultCode::NoProfilesAvailable,
        ResultCode::NotAllProfilesLoaded,
        ResultCode::ProfilesDirNotExists,
        ResultCode::AgentUnableToStop,
        ResultCode::PipelineNotFunctional,
    ];

    /// Map a raw boundary value onto a code. `None` for out-of-range values.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }

    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }

    pub fn is_warning(self) -> bool {
        self == ResultCode::NotAllProfilesLoaded
    }

    /// Success or the partial-result warning: the only codes that come
    /// with a (possibly partial) payload.
    pub fn carries_payload(self) -> bool {
        self.is_success() || self.is_warning()
    }

    /// `Ok(())` on success, the code itself otherwise, so callers can use `?`.
    /// The partial-result warning is treated as an error here; use
    /// `carries_payload` when partial data is acceptable.
    pub fn into_result(self) -> Result<(), ResultCode> {
        if self.is_success() { Ok(()) } else { Err(self) }
    }

    pub fn description(self) -> &'static str {
        error_string(self)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl std::error::Error for ResultCode {}

/// Serialization used for discovery and configuration payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum ProtocolFormat {
    #[default]
    Json = 0,
    Xml = 1,
}

impl ProtocolFormat {
    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ProtocolFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolFormat::Json => f.write_str("json"),
            ProtocolFormat::Xml => f.write_str("xml"),
        }
    }
}

/// Human-readable description of `code`, as found in the engine's table.
pub fn error_string(code: ResultCode) -> &'static str {
    match code {
        ResultCode::Success => "Success",
        ResultCode::NullParam => "One or more of required args is null",
        ResultCode::InvalidParam => "One or more of required args has invalid value",
        ResultCode::OutOfMemory => "Out of memory",
        ResultCode::Internal => "An internal error has occurred",
        ResultCode::InsufficientBufferSize => "Insufficient buffer size",
        ResultCode::NotImplemented => "API is not implemented",
        ResultCode::StartupFailure => "Failed to start TDT agent",
        ResultCode::InvalidPlugin => "Invalid plugin",
        ResultCode::InvalidConfig => "Invalid configuration",
        ResultCode::NoExecution => "Cannot execute",
        ResultCode::AgentRunning => "TDT agent is already running",
        ResultCode::AgentNotRunning => "TDT agent is not running",
        ResultCode::AgentAborted => "TDT agent has aborted",
        ResultCode::SignVerifyFailed => "Failed to verify plugin",
        ResultCode::NoProfilesAvailable => "No profiles are available",
        ResultCode::NotAllProfilesLoaded => "Not all profiles loaded and parsed successfully",
        ResultCode::ProfilesDirNotExists => "Profiles directory does not exist",
        ResultCode::AgentUnableToStop => "Unable to stop TDT agent",
        ResultCode::PipelineNotFunctional => "Detection pipeline is not functional",
    }
}

/// Description for a raw boundary value; never fails.
pub fn describe_raw(raw: u32) -> &'static str {
    ResultCode::from_raw(raw).map_or(UNKNOWN_ERROR, error_string)
}
