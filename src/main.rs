// src/main.rs

//! Console entry-point for the threat-detection agent.
//!
//! 1. Load configuration & set up structured logging
//! 2. Build the notification registry and the engine backend
//! 3. Construct the agent, route notifications to the log
//! 4. Apply configuration and start detection
//! 5. Wait for Ctrl-C, then stop and destruct cleanly
//!

// ───── std / 3rd-party imports ──────────────────────────────────────────────
use anyhow::{bail, Context as _, Result};
use chrono::Local;
use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::runtime::Runtime;

// ───── local imports ────────────────────────────────────────────────────────
use tdt_agent::{
    config::{self, BackendKind, Config},
    engine::{EngineBackend, SimulatedBackend},
    logging,
    payload::Capabilities,
    Agent, NotificationRegistry, ResultCode,
};

// ───── helpers ──────────────────────────────────────────────────────────────

/// Directory containing the running executable.
fn exe_dir() -> Result<PathBuf> {
    let exe = env::current_exe().context("cannot locate executable")?;
    exe.parent()
        .map(Path::to_path_buf)
        .context("executable has no parent directory")
}

/// `default.toml` next to the executable, unless a path is given.
fn config_path(exe_dir: &Path) -> PathBuf {
    env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| exe_dir.join("default.toml"))
}

fn build_backend(cfg: &Config, registry: &Arc<NotificationRegistry>) -> Result<Arc<dyn EngineBackend>> {
    match cfg.engine.backend {
        BackendKind::Simulated => Ok(Arc::new(
            SimulatedBackend::new(cfg.engine.profiles.clone()).with_stop_timeout(cfg.engine.stop_timeout),
        )),
        #[cfg(feature = "native")]
        BackendKind::Native => Ok(Arc::new(tdt_agent::engine::native::NativeBackend::new(Arc::clone(registry))?)),
        #[cfg(not(feature = "native"))]
        BackendKind::Native => {
            let _ = registry;
            bail!("native backend requested but this build lacks the `native` feature")
        }
    }
}

/// Turn a failing code into an error carrying the engine's description.
fn check(agent: &Agent, op: &str, code: ResultCode) -> Result<()> {
    if code.is_success() {
        return Ok(());
    }
    if code.is_warning() {
        log::warn!("{}: {}", op, agent.error_string(code));
        return Ok(());
    }
    bail!("{} failed: {} ({:?})", op, agent.error_string(code), code)
}

// ───── agent logic ──────────────────────────────────────────────────────────

fn run() -> Result<()> {
    // 1 ─ Context
    let exe_dir = exe_dir()?;
    let path = config_path(&exe_dir);
    let cfg = config::load(&path).with_context(|| format!("loading {}", path.display()))?;

    // 2 ─ Logging
    logging::setup(&exe_dir, &cfg.logging).context("logging setup failed")?;
    log::info!("Agent bootstrap initiated ({:?} backend)", cfg.engine.backend);

    // 3 ─ Registry & backend
    let registry = NotificationRegistry::new();
    let backend = build_backend(&cfg, &registry)?;

    // 4 ─ Agent
    let mut agent = Agent::new(backend, Arc::clone(&registry));
    agent.construct(cfg.agent.format)?;

    let context = cfg.agent.context.unwrap_or_else(|| registry.issue_context());
    let code = agent.set_notifier(
        |ctx: u64, msg: &str| log::warn!("notification [context={}]: {}", ctx, msg),
        context.get(),
    );
    check(&agent, "set_notifier", code)?;

    // 5 ─ Configuration
    if let Some(payload) = cfg.agent.configuration.as_deref() {
        let profile = cfg.agent.profile.as_deref().unwrap_or("");
        check(&agent, "set_configuration", agent.set_configuration(profile, payload))?;
    }

    let (caps, code) = agent.discover();
    check(&agent, "discover", code)?;
    match Capabilities::parse(&caps) {
        Ok(caps) => {
            log::info!("Engine {} built {} {}", caps.version, caps.build.date, caps.build.time);
            for p in &caps.profiles {
                log::info!("  profile {} ({}): {}", p.name, p.state, p.description);
            }
        }
        Err(e) => log::warn!("Unparseable capabilities: {}", e),
    }

    // 6 ─ Start & wait for shutdown
    check(&agent, "start", agent.start())?;
    log::info!("Detection running, notifications on context {}", context);

    let rt = Runtime::new().context("Tokio runtime creation failed")?;
    rt.block_on(tokio::signal::ctrl_c()).context("waiting for Ctrl-C")?;
    log::warn!("Shutdown initiated");

    // 7 ─ Teardown
    let code = agent.stop("");
    if !code.is_success() {
        log::warn!("stop: {}", agent.error_string(code));
    }
    agent.destruct()?;
    log::info!("Agent stopped cleanly");
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("[{}][ERROR][main] {:#}", Local::now().to_rfc3339(), e);
        std::process::exit(1);
    }
}
