// src/engine/simulated.rs

//! In-process engine with the native library's observable behaviour.
//!
//! Profiles come from configuration instead of a profiles directory, and
//! the "pipeline" is a single thread that forwards messages pushed into the
//! backend's detection feed to the registry. Everything the agent layer can
//! see (codes, payload shapes, buffer sizing, running/stopped rules) follows
//! the C API, so the binary and the tests run without `libtdt`.

use crate::codes::{self, ProtocolFormat, ResultCode};
use crate::engine::{fill_buffer, Engine, EngineBackend, FillReply};
use crate::notify::{Context, NotificationRegistry};
use crate::tdt_log;
use chrono::{DateTime, Local};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use crossbeam::select;
use log::Level;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

/// Version reported by `discover`.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long `stop` waits for the pipeline thread by default.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(100);

/// A detection profile as declared in configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProfileSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

impl ProfileSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self { name: name.into(), description: description.into(), settings: Map::new() }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }
}

/// Factory for simulated engines. All engines built by one backend share
/// its detection feed.
pub struct SimulatedBackend {
    profiles: Vec<ProfileSpec>,
    stop_timeout: Duration,
    built: DateTime<Local>,
    feed_tx: Sender<String>,
    feed_rx: Receiver<String>,
}

impl SimulatedBackend {
    pub fn new(profiles: Vec<ProfileSpec>) -> Self {
        let (feed_tx, feed_rx) = channel::unbounded();
        Self {
            profiles,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            built: Local::now(),
            feed_tx,
            feed_rx,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Sender for synthetic detections. A running pipeline picks each
    /// message up and delivers it as a notification.
    pub fn detections(&self) -> Sender<String> {
        self.feed_tx.clone()
    }
}

impl EngineBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn construct(&self, format: ProtocolFormat) -> Option<Box<dyn Engine>> {
        if format != ProtocolFormat::Json {
            tdt_log!(Level::Warn, "simulated", "protocol format {} not supported", format);
            return None;
        }
        Some(Box::new(SimulatedEngine::new(self)))
    }

    fn error_string(&self, code: ResultCode) -> Option<String> {
        Some(codes::error_string(code).to_owned())
    }
}

/// Where the pipeline delivers notifications.
type Route = Arc<Mutex<Option<(Context, Arc<NotificationRegistry>)>>>;

struct Profile {
    description: String,
    settings: Value,
}

/// A running pipeline thread. `done_rx` disconnects once the thread has
/// left its loop, which every waiter observes.
struct Pipeline {
    profiles: BTreeSet<String>,
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    profiles: BTreeMap<String, Profile>,
    /// Profiles that the next `start` runs.
    selected: BTreeSet<String>,
    pipeline: Option<Pipeline>,
}

pub struct SimulatedEngine {
    state: Mutex<State>,
    route: Route,
    feed: Receiver<String>,
    stop_timeout: Duration,
    built: DateTime<Local>,
}

impl SimulatedEngine {
    fn new(backend: &SimulatedBackend) -> Self {
        let profiles = backend
            .profiles
            .iter()
            .map(|p| {
                let profile = Profile {
                    description: p.description.clone(),
                    settings: Value::Object(p.settings.clone()),
                };
                (p.name.clone(), profile)
            })
            .collect();
        Self {
            state: Mutex::new(State { profiles, ..State::default() }),
            route: Arc::new(Mutex::new(None)),
            feed: backend.feed_rx.clone(),
            stop_timeout: backend.stop_timeout,
            built: backend.built,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn capabilities(&self, state: &State) -> (Value, ResultCode) {
        let build = json!({
            "date": self.built.format("%b %e %Y").to_string(),
            "time": self.built.format("%H:%M:%S").to_string(),
        });
        if state.profiles.is_empty() {
            let doc = json!({ "version": ENGINE_VERSION, "build": build, "profiles": null });
            return (doc, ResultCode::NoProfilesAvailable);
        }

        let running = state.pipeline.as_ref().map(|p| &p.profiles);
        let mut list: Vec<Value> = state
            .profiles
            .iter()
            .map(|(name, profile)| {
                let active = running.is_some_and(|set| set.contains(name));
                let label = if active { "active" } else { "inactive" };
                json!({ name.as_str(): { "description": profile.description, "state": label } })
            })
            .collect();
        list.push(json!({ "eof": null }));

        let doc = json!({ "version": ENGINE_VERSION, "build": build, "profiles": list });
        (doc, ResultCode::Success)
    }

    fn configurations(state: &State, profile: Option<&str>) -> (Value, ResultCode) {
        if state.profiles.is_empty() {
            return (json!({ "configurations": [] }), ResultCode::NoProfilesAvailable);
        }
        let mut list: Vec<Value> = state
            .profiles
            .iter()
            .filter(|(name, _)| profile.is_none_or(|p| p == name.as_str()))
            .map(|(name, p)| json!({ name.as_str(): p.settings }))
            .collect();
        list.push(json!({ "eof": null }));
        (json!({ "configurations": list }), ResultCode::Success)
    }

    fn configure_one(state: &mut State, name: &str, doc: Value) -> ResultCode {
        let Some(profile) = state.profiles.get_mut(name) else {
            tdt_log!(Level::Warn, "simulated", "unknown profile '{}'", name);
            return ResultCode::InvalidConfig;
        };
        // Either the bare settings or `{ "<name>": settings }`.
        let settings = match doc {
            Value::Object(mut map) if map.len() == 1 && map.get(name).is_some_and(Value::is_object) => {
                map.remove(name).unwrap_or_default()
            }
            obj @ Value::Object(_) => obj,
            _ => return ResultCode::InvalidConfig,
        };
        merge(&mut profile.settings, settings);
        state.selected = BTreeSet::from([name.to_owned()]);
        ResultCode::Success
    }

    fn configure_many(state: &mut State, doc: Value) -> ResultCode {
        let Value::Object(mut top) = doc else {
            return ResultCode::InvalidConfig;
        };
        // `{"configurations": [{name: settings}, ...]}` or `{name: settings, ...}`.
        let entries: Vec<(String, Value)> = match top.remove("configurations") {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .flatten()
                .collect(),
            Some(_) => return ResultCode::InvalidConfig,
            None => top.into_iter().collect(),
        };

        let mut matched = BTreeSet::new();
        for (name, settings) in entries {
            if name == "eof" || !settings.is_object() {
                continue;
            }
            if let Some(profile) = state.profiles.get_mut(&name) {
                merge(&mut profile.settings, settings);
                matched.insert(name);
            } else {
                tdt_log!(Level::Debug, "simulated", "skipping unknown profile '{}'", name);
            }
        }

        if matched.is_empty() {
            return ResultCode::InvalidConfig;
        }
        state.selected = matched;
        ResultCode::Success
    }

    fn spawn_pipeline(&self, profiles: BTreeSet<String>) -> std::io::Result<Pipeline> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let (done_tx, done_rx) = channel::bounded::<()>(1);
        let feed = self.feed.clone();
        let route = Arc::clone(&self.route);

        let handle = thread::Builder::new()
            .name("tdt-pipeline".into())
            .spawn(move || {
                let _done = done_tx;
                tdt_log!(Level::Info, "simulated", "pipeline started");
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(feed) -> msg => match msg {
                            Ok(msg) => deliver(&route, &msg),
                            Err(_) => {
                                // Feed closed: idle until stopped.
                                let _ = stop_rx.recv();
                                break;
                            }
                        },
                    }
                }
                tdt_log!(Level::Info, "simulated", "pipeline stopped");
            })?;

        Ok(Pipeline { profiles, stop_tx, done_rx, handle })
    }

    /// Signal the pipeline and wait up to `stop_timeout` for it to leave
    /// its loop. Returns whether it did.
    fn signal_and_wait(&self, stop_tx: &Sender<()>, done_rx: &Receiver<()>) -> bool {
        let _ = stop_tx.try_send(());
        match done_rx.recv_timeout(self.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => {
                tdt_log!(Level::Warn, "simulated", "pipeline did not stop within {:?}", self.stop_timeout);
                false
            }
        }
    }
}

/// Hand one message to the registry under the current context.
fn deliver(route: &Route, msg: &str) {
    let target = route.lock().unwrap_or_else(PoisonError::into_inner).clone();
    match target {
        Some((context, registry)) => registry.dispatch(context.get(), msg),
        None => tdt_log!(Level::Debug, "simulated", "no notifier set, dropping message"),
    }
}

/// Recursively overlay `src` onto `dst`.
fn merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(d), Value::Object(s)) => {
            for (k, v) in s {
                merge(d.entry(k).or_insert(Value::Null), v);
            }
        }
        (d, s) => *d = s,
    }
}

impl Engine for SimulatedEngine {
    fn start(&self) -> ResultCode {
        let mut state = self.lock();
        if state.pipeline.is_some() {
            return ResultCode::AgentRunning;
        }
        if state.selected.is_empty() {
            tdt_log!(Level::Info, "simulated", "no profiles have been set to run");
            return ResultCode::NoProfilesAvailable;
        }
        match self.spawn_pipeline(state.selected.clone()) {
            Ok(pipeline) => {
                state.pipeline = Some(pipeline);
                ResultCode::Success
            }
            Err(e) => {
                tdt_log!(Level::Error, "simulated", "unable to start pipeline: {}", e);
                ResultCode::StartupFailure
            }
        }
    }

    fn stop(&self, profile: Option<&str>) -> ResultCode {
        // The pipeline stays in the state while we wait, so the engine keeps
        // reporting itself running until the thread has actually exited.
        let (stop_tx, done_rx) = {
            let state = self.lock();
            let Some(running) = state.pipeline.as_ref() else {
                return ResultCode::AgentNotRunning;
            };
            if profile.is_some_and(|p| !running.profiles.contains(p)) {
                return ResultCode::NoProfilesAvailable;
            }
            // Per-profile stop halts the whole pipeline, like the library.
            (running.stop_tx.clone(), running.done_rx.clone())
        };

        if !self.signal_and_wait(&stop_tx, &done_rx) {
            return ResultCode::AgentUnableToStop;
        }

        let finished = {
            let mut state = self.lock();
            state
                .pipeline
                .take_if(|p| p.done_rx.same_channel(&done_rx))
        };
        if let Some(p) = finished {
            if p.handle.join().is_err() {
                tdt_log!(Level::Error, "simulated", "pipeline thread panicked");
            }
        }
        ResultCode::Success
    }

    fn discover(&self, buffer: Option<&mut [u8]>) -> FillReply {
        let (doc, code) = self.capabilities(&self.lock());
        if !code.carries_payload() {
            return FillReply::code(code);
        }
        fill_buffer(&doc.to_string(), code, buffer)
    }

    fn get_configuration(&self, profile: Option<&str>, buffer: Option<&mut [u8]>) -> FillReply {
        let (doc, code) = Self::configurations(&self.lock(), profile);
        if !code.carries_payload() {
            return FillReply::code(code);
        }
        fill_buffer(&doc.to_string(), code, buffer)
    }

    fn set_configuration(&self, profile: Option<&str>, payload: &str) -> ResultCode {
        let mut state = self.lock();
        if state.pipeline.is_some() {
            return ResultCode::AgentRunning;
        }
        let doc: Value = match serde_json::from_str(payload) {
            Ok(doc) => doc,
            Err(e) => {
                tdt_log!(Level::Warn, "simulated", "configuration is not valid JSON: {}", e);
                return ResultCode::InvalidConfig;
            }
        };
        match profile {
            Some(name) => Self::configure_one(&mut state, name, doc),
            None => Self::configure_many(&mut state, doc),
        }
    }

    fn set_notification_callback(
        &self,
        context: Context,
        registry: Arc<NotificationRegistry>,
    ) -> ResultCode {
        *self.route.lock().unwrap_or_else(PoisonError::into_inner) = Some((context, registry));
        ResultCode::Success
    }
}

impl Drop for SimulatedEngine {
    fn drop(&mut self) {
        let pipeline = self.lock().pipeline.take();
        let Some(p) = pipeline else {
            return;
        };
        if !self.signal_and_wait(&p.stop_tx, &p.done_rx) {
            tdt_log!(Level::Warn, "simulated", "waiting for pipeline to finish before release");
        }
        if p.handle.join().is_err() {
            tdt_log!(Level::Error, "simulated", "pipeline thread panicked");
        }
    }
}
