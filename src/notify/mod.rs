//! Notification routing between the engine's threads and agent callbacks.

pub mod registry;

pub use registry::{
    AgentId, Context, DispatchError, Entry, NotificationRegistry, Notifier, Registration,
    RegistryError,
};
