// src/lib.rs
// ────────────────────────────────────────────────────────────────────────────
// Public library entry point.  Re-export everything for both `main.rs` and
// integration tests.

#[macro_use]
pub mod macros;

pub mod agent;
pub mod codes;
pub mod config;
pub mod engine;
pub mod logging;
pub mod notify;
pub mod payload;

pub use agent::{Agent, AgentError};
pub use codes::{error_string, ProtocolFormat, ResultCode};
pub use notify::{Context, NotificationRegistry};
