// src/notify/registry.rs

//! Process-wide routing table for engine notifications.
//!
//! The detection engine only knows the numeric context it was handed in
//! `set_notification_callback`; when it reports a threat or a runtime error
//! from one of its own threads, the registry turns that context back into
//! the owning agent's callback.
//!
//! Locking rules:
//! - One `Mutex` guards the whole map. It is held for lookups and updates
//!   only, never while a callback runs, so a callback may call back into
//!   its agent (or register another one) without deadlocking.
//! - A lookup clones the callback `Arc` out of the map and releases the
//!   lock before invoking it.

use crate::tdt_log;
use log::Level;
use std::{
    collections::HashMap,
    fmt,
    num::NonZeroU64,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use thiserror::Error;

/// Callback invoked with `(context, message)` for every notification.
pub type Notifier = Arc<dyn Fn(u64, &str) + Send + Sync + 'static>;

/// Caller-chosen, nonzero token identifying which agent a notification
/// belongs to. Zero is reserved and can't be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Context(NonZeroU64);

impl Context {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Context)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one agent handle, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentId(u64);

impl AgentId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        AgentId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent#{}", self.0)
    }
}

/// Why a registration was refused. The map is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("notification context 0 is reserved")]
    ZeroContext,

    #[error("notification context {context} is owned by {owner}")]
    ContextInUse { context: Context, owner: AgentId },
}

/// Registry/lifecycle invariant violations found while dispatching.
/// Both mean a registration was dropped, never made, or corrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("unknown notification context {0}")]
    UnknownContext(u64),

    #[error("notification context mismatch: looked up {requested}, entry holds {stored}")]
    ContextMismatch { requested: u64, stored: u64 },
}

/// One routing entry.
#[derive(Clone)]
pub struct Entry {
    context: Context,
    agent: AgentId,
    generation: u64,
    notifier: Notifier,
}

impl Entry {
    pub fn context(&self) -> Context {
        self.context
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("context", &self.context)
            .field("agent", &self.agent)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// The routing table. Construct one per process and hand the `Arc` to
/// every agent and engine backend that needs it.
#[derive(Default)]
pub struct NotificationRegistry {
    entries: Mutex<HashMap<Context, Entry>>,
    generation: AtomicU64,
    issued: AtomicU64,
}

impl NotificationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Context, Entry>> {
        // Callbacks never run under the lock, so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomic check-and-insert.
    ///
    /// Fails without touching the map when `context` is zero or belongs to
    /// another agent. The same agent re-registering the same context
    /// overwrites its entry in place; the displaced entry is returned so a
    /// caller can put it back with [`NotificationRegistry::rollback`].
    pub fn register(
        self: &Arc<Self>,
        context: u64,
        agent: AgentId,
        notifier: Notifier,
    ) -> Result<(Registration, Option<Entry>), RegistryError> {
        let context = Context::new(context).ok_or(RegistryError::ZeroContext)?;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let mut map = self.lock();
        if let Some(existing) = map.get(&context) {
            if existing.agent != agent {
                let owner = existing.agent;
                drop(map);
                tdt_log!(Level::Warn, "registry", "context {} refused for {}: owned by {}", context, agent, owner);
                return Err(RegistryError::ContextInUse { context, owner });
            }
        }
        let displaced = map.insert(context, Entry { context, agent, generation, notifier });
        drop(map);

        if displaced.is_some() {
            tdt_log!(Level::Debug, "registry", "context {} overwritten by {}", context, agent);
        } else {
            tdt_log!(Level::Debug, "registry", "context {} registered to {}", context, agent);
        }

        Ok((
            Registration { registry: Arc::clone(self), context, generation },
            displaced,
        ))
    }

    /// Withdraw `registration` and reinstate `displaced` in its place.
    ///
    /// Both steps happen under one lock acquisition, so a dispatcher never
    /// observes the context as missing while it is being restored. A slot
    /// since taken by a newer registration is left alone.
    pub fn rollback(&self, registration: Registration, displaced: Option<Entry>) {
        let context = registration.context;
        {
            let mut map = self.lock();
            let ours = map
                .get(&context)
                .is_some_and(|e| e.generation == registration.generation);
            match displaced {
                Some(entry) if ours || !map.contains_key(&context) => {
                    map.insert(context, entry);
                }
                None if ours => {
                    map.remove(&context);
                }
                _ => {}
            }
        }
        tdt_log!(Level::Debug, "registry", "context {} rolled back", context);
        // The slot no longer carries this generation, so the drop is a no-op.
        drop(registration);
    }

    /// Hand out a fresh context that is not currently registered.
    pub fn issue_context(&self) -> Context {
        loop {
            let raw = self.issued.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if let Some(context) = Context::new(raw) {
                if !self.lock().contains_key(&context) {
                    return context;
                }
            }
        }
    }

    /// Route one notification. Invoked by the engine on any of its threads.
    ///
    /// The lock covers only the lookup; the callback runs unlocked.
    pub fn try_dispatch(&self, context: u64, message: &str) -> Result<(), DispatchError> {
        let notifier = {
            let map = self.lock();
            let entry = Context::new(context)
                .and_then(|c| map.get(&c))
                .ok_or(DispatchError::UnknownContext(context))?;
            // Corruption guard: keys and entries are only ever written together.
            if entry.context.get() != context {
                return Err(DispatchError::ContextMismatch {
                    requested: context,
                    stored: entry.context.get(),
                });
            }
            Arc::clone(&entry.notifier)
        };

        notifier(context, message);
        Ok(())
    }

    /// Like [`try_dispatch`](Self::try_dispatch), but an invariant
    /// violation is a programmer error and panics.
    pub fn dispatch(&self, context: u64, message: &str) {
        if let Err(e) = self.try_dispatch(context, message) {
            tdt_log!(Level::Error, "registry", "fatal dispatch: {}", e);
            panic!("{e}");
        }
    }

    pub fn owner(&self, context: u64) -> Option<AgentId> {
        let context = Context::new(context)?;
        self.lock().get(&context).map(|e| e.agent)
    }

    pub fn is_registered(&self, context: u64) -> bool {
        self.owner(context).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn release(&self, context: Context, generation: u64) {
        let mut map = self.lock();
        if map.get(&context).is_some_and(|e| e.generation == generation) {
            map.remove(&context);
            drop(map);
            tdt_log!(Level::Debug, "registry", "context {} released", context);
        }
    }
}

impl fmt::Debug for NotificationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationRegistry")
            .field("entries", &self.len())
            .finish()
    }
}

/// Capability token for one registry entry.
///
/// Dropping it removes the entry, unless the slot has since been taken by a
/// newer registration (same agent, same context).
#[must_use = "dropping a Registration unregisters it"]
pub struct Registration {
    registry: Arc<NotificationRegistry>,
    context: Context,
    generation: u64,
}

impl Registration {
    pub fn context(&self) -> Context {
        self.context
    }

    /// Whether this token still owns its slot.
    pub fn is_current(&self) -> bool {
        self.registry
            .lock()
            .get(&self.context)
            .is_some_and(|e| e.generation == self.generation)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(self.context, self.generation);
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("context", &self.context)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    fn recorder() -> (Notifier, mpsc::Receiver<(u64, String)>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let notifier: Notifier = Arc::new(move |ctx: u64, msg: &str| {
            let _ = tx.lock().unwrap().send((ctx, msg.to_owned()));
        });
        (notifier, rx)
    }

    #[test]
    fn zero_context_is_rejected() {
        let registry = NotificationRegistry::new();
        let (cb, _rx) = recorder();
        let err = registry.register(0, AgentId::next(), cb).unwrap_err();
        assert_eq!(err, RegistryError::ZeroContext);
        assert!(registry.is_empty());
    }

    #[test]
    fn foreign_context_is_refused_and_owner_kept() {
        let registry = NotificationRegistry::new();
        let (a, b) = (AgentId::next(), AgentId::next());
        let (cb_a, rx_a) = recorder();
        let (cb_b, rx_b) = recorder();

        let (_token, displaced) = registry.register(7, a, cb_a).unwrap();
        assert!(displaced.is_none());

        let err = registry.register(7, b, cb_b).unwrap_err();
        assert!(matches!(err, RegistryError::ContextInUse { owner, .. } if owner == a));
        assert_eq!(registry.owner(7), Some(a));

        registry.dispatch(7, "still a");
        assert_eq!(rx_a.try_recv().unwrap(), (7, "still a".to_owned()));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn same_agent_overwrites_in_place() {
        let registry = NotificationRegistry::new();
        let agent = AgentId::next();
        let (old_cb, old_rx) = recorder();
        let (new_cb, new_rx) = recorder();

        let (first, _) = registry.register(9, agent, old_cb).unwrap();
        let (second, displaced) = registry.register(9, agent, new_cb).unwrap();
        assert!(displaced.is_some());
        assert_eq!(registry.len(), 1);

        // The stale token must not remove the newer entry.
        assert!(!first.is_current());
        drop(first);
        assert!(registry.is_registered(9));

        registry.dispatch(9, "hello");
        assert!(old_rx.try_recv().is_err());
        assert_eq!(new_rx.try_recv().unwrap().1, "hello");

        drop(second);
        assert!(registry.is_empty());
    }

    #[test]
    fn rollback_restores_displaced_entry() {
        let registry = NotificationRegistry::new();
        let agent = AgentId::next();
        let (old_cb, old_rx) = recorder();
        let (new_cb, _new_rx) = recorder();

        let (_keep, _) = registry.register(3, agent, old_cb).unwrap();
        let (token, displaced) = registry.register(3, agent, new_cb).unwrap();
        registry.rollback(token, displaced);

        registry.dispatch(3, "back");
        assert_eq!(old_rx.try_recv().unwrap().1, "back");
    }

    #[test]
    fn refused_reregistration_never_hides_the_context() {
        let registry = NotificationRegistry::new();
        let agent = AgentId::next();
        let (cb, _rx) = recorder();
        let (_keep, _) = registry.register(5, agent, Arc::clone(&cb)).unwrap();

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let dispatcher = {
            let registry = Arc::clone(&registry);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut misses = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    if registry.try_dispatch(5, "tick").is_err() {
                        misses += 1;
                    }
                }
                misses
            })
        };

        for _ in 0..5_000 {
            let (token, displaced) = registry.register(5, agent, Arc::clone(&cb)).unwrap();
            registry.rollback(token, displaced);
        }
        stop.store(true, Ordering::Relaxed);

        assert_eq!(dispatcher.join().unwrap(), 0);
        assert!(registry.is_registered(5));
    }

    #[test]
    fn rollback_without_displaced_entry_removes_it() {
        let registry = NotificationRegistry::new();
        let (cb, _rx) = recorder();
        let (token, displaced) = registry.register(6, AgentId::next(), cb).unwrap();
        registry.rollback(token, displaced);
        assert!(registry.is_empty());
    }

    #[test]
    fn corrupted_entry_is_a_context_mismatch() {
        let registry = NotificationRegistry::new();
        let (cb, _rx) = recorder();
        let (token, _) = registry.register(9, AgentId::next(), cb).unwrap();
        {
            let mut map = registry.lock();
            let entry = map.remove(&token.context()).unwrap();
            map.insert(Context::new(8).unwrap(), entry);
        }
        assert_eq!(
            registry.try_dispatch(8, "x"),
            Err(DispatchError::ContextMismatch { requested: 8, stored: 9 })
        );
    }

    #[test]
    fn unknown_context_is_an_error() {
        let registry = NotificationRegistry::new();
        assert_eq!(
            registry.try_dispatch(42, "x"),
            Err(DispatchError::UnknownContext(42))
        );
        assert_eq!(
            registry.try_dispatch(0, "x"),
            Err(DispatchError::UnknownContext(0))
        );
    }

    #[test]
    #[should_panic(expected = "unknown notification context 5")]
    fn dispatch_panics_on_unknown_context() {
        NotificationRegistry::new().dispatch(5, "stray");
    }

    #[test]
    fn callback_may_reenter_registry() {
        let registry = NotificationRegistry::new();
        let inner = Arc::clone(&registry);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let cb: Notifier = Arc::new(move |ctx: u64, _msg: &str| {
            // Would deadlock if the map lock were held during the call.
            let owner = inner.owner(ctx);
            let _ = tx.lock().unwrap().send(owner.is_some());
        });
        let (_token, _) = registry.register(11, AgentId::next(), cb).unwrap();
        registry.dispatch(11, "reenter");
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn concurrent_dispatch_for_distinct_contexts() {
        let registry = NotificationRegistry::new();
        let (cb, rx) = recorder();
        let tokens: Vec<_> = (1..=4u64)
            .map(|ctx| registry.register(ctx, AgentId::next(), Arc::clone(&cb)).unwrap().0)
            .collect();

        let handles: Vec<_> = (1..=4u64)
            .map(|ctx| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..25 {
                        registry.dispatch(ctx, &format!("{ctx}:{i}"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let got: Vec<_> = rx.try_iter().collect();
        assert_eq!(got.len(), 100);
        for ctx in 1..=4u64 {
            assert_eq!(got.iter().filter(|(c, _)| *c == ctx).count(), 25);
        }
        drop(tokens);
        assert!(registry.is_empty());
    }

    #[test]
    fn issued_contexts_skip_registered_ones() {
        let registry = NotificationRegistry::new();
        let (cb, _rx) = recorder();
        let (_token, _) = registry.register(1, AgentId::next(), cb).unwrap();
        let issued = registry.issue_context();
        assert_ne!(issued.get(), 1);
        assert_ne!(registry.issue_context(), issued);
    }
}
