// src/agent.rs

//! Agent handle: owns at most one live engine instance.
//!
//! A handle starts empty, becomes live through `construct` and returns to
//! empty through `destruct` (or when it is dropped). Every engine-crossing
//! operation answers with a `ResultCode`; on an empty handle that code is
//! `NullParam` and the engine is never touched.
//!
//! Teardown order matters: the engine is released first, which stops its
//! pipeline threads, and only then is the registry entry removed. Nothing
//! can be dispatched into a destructed handle, and a notification that
//! still shows up for the old context is a fatal unknown-context error.

use crate::codes::{self, ProtocolFormat, ResultCode};
use crate::engine::{negotiate, Engine, EngineBackend};
use crate::notify::{AgentId, Context, NotificationRegistry, Notifier, Registration, RegistryError};
use crate::tdt_log;
use log::Level;
use std::{fmt, sync::Arc};
use thiserror::Error;

/// Lifecycle misuse reported by the agent layer itself, as opposed to
/// codes reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("agent already owns a live engine")]
    AlreadyConstructed,

    #[error("engine construction failed for format {format} (invalid argument or out of memory)")]
    ConstructionFailed { format: ProtocolFormat },

    #[error("agent has no live engine")]
    NotConstructed,
}

struct Live {
    engine: Box<dyn Engine>,
    format: ProtocolFormat,
}

/// Handle to one detection-engine instance. Move-only.
pub struct Agent {
    id: AgentId,
    backend: Arc<dyn EngineBackend>,
    registry: Arc<NotificationRegistry>,
    live: Option<Live>,
    notifier: Option<Registration>,
}

impl Agent {
    /// Empty handle bound to `backend` and `registry`.
    pub fn new(backend: Arc<dyn EngineBackend>, registry: Arc<NotificationRegistry>) -> Self {
        Self {
            id: AgentId::next(),
            backend,
            registry,
            live: None,
            notifier: None,
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// Format chosen at construction, while live.
    pub fn format(&self) -> Option<ProtocolFormat> {
        self.live.as_ref().map(|l| l.format)
    }

    /// Context of the active notifier registration, if any.
    pub fn notifier_context(&self) -> Option<Context> {
        self.notifier.as_ref().map(Registration::context)
    }

    pub fn registry(&self) -> &Arc<NotificationRegistry> {
        &self.registry
    }

    fn engine(&self) -> Option<&dyn Engine> {
        self.live.as_ref().map(|l| l.engine.as_ref())
    }

    /// Create and take ownership of a new engine speaking `format`.
    pub fn construct(&mut self, format: ProtocolFormat) -> Result<(), AgentError> {
        if self.live.is_some() {
            return Err(AgentError::AlreadyConstructed);
        }
        let engine = self
            .backend
            .construct(format)
            .ok_or(AgentError::ConstructionFailed { format })?;
        self.live = Some(Live { engine, format });
        tdt_log!(Level::Info, "agent", "{} constructed ({} engine, {})", self.id, self.backend.name(), format);
        Ok(())
    }

    /// Release the engine, then the notifier registration.
    pub fn destruct(&mut self) -> Result<(), AgentError> {
        let live = self.live.take().ok_or(AgentError::NotConstructed)?;
        drop(live);
        if let Some(registration) = self.notifier.take() {
            tdt_log!(Level::Debug, "agent", "{} releasing context {}", self.id, registration.context());
            drop(registration);
        }
        tdt_log!(Level::Info, "agent", "{} destructed", self.id);
        Ok(())
    }

    /// Begin detection on all configured profiles.
    #[must_use]
    pub fn start(&self) -> ResultCode {
        match self.engine() {
            Some(engine) => engine.start(),
            None => ResultCode::NullParam,
        }
    }

    /// Stop every profile (`profile == ""`) or just the named one.
    #[must_use]
    pub fn stop(&self, profile: &str) -> ResultCode {
        match self.engine() {
            Some(engine) => engine.stop(optional(profile)),
            None => ResultCode::NullParam,
        }
    }

    /// Capabilities and profiles in the agent's protocol format.
    ///
    /// The payload is empty unless the code is success or the
    /// not-all-profiles-loaded warning.
    pub fn discover(&self) -> (String, ResultCode) {
        match self.engine() {
            Some(engine) => negotiate("discover", |buf| engine.discover(buf)),
            None => (String::new(), ResultCode::NullParam),
        }
    }

    /// Configuration of every profile (`profile == ""`) or the named one.
    pub fn get_configuration(&self, profile: &str) -> (String, ResultCode) {
        let Some(engine) = self.engine() else {
            return (String::new(), ResultCode::NullParam);
        };
        let profile = optional(profile);
        negotiate("get_configuration", |buf| engine.get_configuration(profile, buf))
    }

    /// Apply `payload` to every profile (`profile == ""`) or the named one.
    /// An empty payload is rejected before the engine is called.
    #[must_use]
    pub fn set_configuration(&self, profile: &str, payload: &str) -> ResultCode {
        let Some(engine) = self.engine() else {
            return ResultCode::NullParam;
        };
        if payload.is_empty() {
            return ResultCode::InvalidParam;
        }
        engine.set_configuration(optional(profile), payload)
    }

    /// Route notifications tagged with `context` to `callback`.
    ///
    /// `context` must be nonzero and not owned by another agent; a context
    /// held by a different agent yields `InvalidParam` with no registration
    /// and no engine call. Registering again under the same context
    /// replaces the callback; a different context releases the old one.
    #[must_use]
    pub fn set_notifier<F>(&mut self, callback: F, context: u64) -> ResultCode
    where
        F: Fn(u64, &str) + Send + Sync + 'static,
    {
        if self.live.is_none() || context == 0 {
            return ResultCode::NullParam;
        }

        let notifier: Notifier = Arc::new(callback);
        let (registration, displaced) = match self.registry.register(context, self.id, notifier) {
            Ok(pair) => pair,
            Err(RegistryError::ContextInUse { owner, .. }) => {
                tdt_log!(Level::Warn, "agent", "{} cannot use context {}: owned by {}", self.id, context, owner);
                return ResultCode::InvalidParam;
            }
            Err(RegistryError::ZeroContext) => return ResultCode::NullParam,
        };

        let code = match self.engine() {
            Some(engine) => engine.set_notification_callback(registration.context(), Arc::clone(&self.registry)),
            None => ResultCode::NullParam,
        };

        if code.is_success() {
            // Replacing the token releases a previous, different context.
            self.notifier = Some(registration);
            tdt_log!(Level::Info, "agent", "{} notifications routed via context {}", self.id, context);
        } else {
            tdt_log!(Level::Warn, "agent", "{} engine refused notifier: {}", self.id, code);
            self.registry.rollback(registration, displaced);
        }
        code
    }

    /// Description of `code` from the engine's table, falling back to the
    /// built-in one.
    pub fn error_string(&self, code: ResultCode) -> String {
        self.backend
            .error_string(code)
            .unwrap_or_else(|| codes::error_string(code).to_owned())
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if self.live.is_some() {
            let _ = self.destruct();
        }
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("backend", &self.backend.name())
            .field("format", &self.format())
            .field("notifier", &self.notifier_context())
            .finish()
    }
}

/// Empty profile name means "all profiles".
fn optional(profile: &str) -> Option<&str> {
    (!profile.is_empty()).then_some(profile)
}

/// Description for a raw code as reported across the boundary, using the
/// backend's table first. Unknown values get the generic fallback.
pub fn describe(backend: &dyn EngineBackend, raw: u32) -> String {
    match ResultCode::from_raw(raw) {
        Some(code) => backend
            .error_string(code)
            .unwrap_or_else(|| codes::error_string(code).to_owned()),
        None => codes::UNKNOWN_ERROR.to_owned(),
    }
}
