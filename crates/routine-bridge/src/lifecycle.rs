//! Process lifecycle: engine readiness wait and shutdown hook.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(unix)]
use smol_str::SmolStr;
use tracing::{info, warn};

use crate::cache::HandleCache;
use crate::policy::PolicyFlags;

/// Capability to observe the engine process on the host.
pub trait EngineWatch: Send + Sync {
    /// How long an engine instance has been running, if one is present.
    fn engine_uptime(&self) -> Option<Duration>;
}

/// Outcome of the readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineReady {
    Ready,
    /// Managed-restart sub-mode: the hosting process should exit and let its
    /// supervisor restart it once the engine reappears.
    RestartRequested,
}

/// Startup/shutdown hooks around one handle cache.
///
/// All lifecycle state lives on this object: the minimum-uptime threshold,
/// the process watch and the restart sub-mode are fields, so independent
/// instances never interfere.
pub struct Lifecycle {
    cache: Arc<HandleCache>,
    watch: Box<dyn EngineWatch>,
    min_uptime: Duration,
    poll_interval: Duration,
    managed_restart: bool,
    exited: AtomicBool,
}

impl Lifecycle {
    #[must_use]
    pub fn new(cache: Arc<HandleCache>, watch: Box<dyn EngineWatch>, min_uptime: Duration) -> Self {
        Self {
            cache,
            watch,
            min_uptime,
            poll_interval: Duration::from_secs(1),
            managed_restart: false,
            exited: AtomicBool::new(false),
        }
    }

    /// Override the coarse readiness poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Request restart-on-absence instead of waiting for the engine.
    #[must_use]
    pub fn with_managed_restart(mut self, managed: bool) -> Self {
        self.managed_restart = managed;
        self
    }

    /// Block until an engine instance has been running for at least the
    /// configured minimum uptime.
    ///
    /// Only applies under the do-not-auto-start policy; otherwise the engine
    /// is activated on demand and this returns immediately. In the
    /// managed-restart sub-mode an absent or too-young engine yields
    /// [`EngineReady::RestartRequested`] instead of blocking.
    pub fn await_engine_ready(&self) -> EngineReady {
        if !self.cache.policy().contains(PolicyFlags::NO_AUTO_START) {
            return EngineReady::Ready;
        }
        loop {
            let uptime = self.watch.engine_uptime();
            if uptime.is_some_and(|up| up >= self.min_uptime) {
                return EngineReady::Ready;
            }
            if self.managed_restart {
                warn!("engine not ready, requesting supervisor restart");
                return EngineReady::RestartRequested;
            }
            info!(
                uptime_secs = uptime.map_or(0, |up| up.as_secs()),
                required_secs = self.min_uptime.as_secs(),
                "waiting for engine"
            );
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Shutdown hook; effective at most once per lifecycle instance.
    pub fn at_exit(&self) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        let policy = self.cache.policy();
        if policy.contains(PolicyFlags::ALWAYS_STOP_ON_EXIT) {
            self.cache.stop_all(false);
        } else if policy.contains(PolicyFlags::STOP_ON_EXIT_IF_STARTED) {
            self.cache.stop_all(true);
        }
    }
}

/// Engine watch that never sees an engine process.
#[derive(Debug, Default)]
pub struct NoWatch;

impl EngineWatch for NoWatch {
    fn engine_uptime(&self) -> Option<Duration> {
        None
    }
}

/// `/proc`-based watch for a named engine process.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct ProcessTableWatch {
    process_name: SmolStr,
}

#[cfg(unix)]
impl ProcessTableWatch {
    // The kernel exports process start times in USER_HZ ticks (100 on Linux).
    const USER_HZ: f64 = 100.0;

    #[must_use]
    pub fn new(process_name: &str) -> Self {
        Self {
            process_name: SmolStr::new(process_name),
        }
    }

    fn system_uptime() -> Option<f64> {
        let text = std::fs::read_to_string("/proc/uptime").ok()?;
        text.split_whitespace().next()?.parse::<f64>().ok()
    }

    fn start_ticks(pid_dir: &std::path::Path) -> Option<f64> {
        let stat = std::fs::read_to_string(pid_dir.join("stat")).ok()?;
        // The comm field may contain spaces; fields resume after the last ')'.
        let rest = &stat[stat.rfind(')')? + 1..];
        // starttime is field 22 of stat; 19 fields after state.
        rest.split_whitespace().nth(19)?.parse::<f64>().ok()
    }
}

#[cfg(unix)]
impl EngineWatch for ProcessTableWatch {
    fn engine_uptime(&self) -> Option<Duration> {
        let system_uptime = Self::system_uptime()?;
        let mut best: Option<f64> = None;
        for entry in std::fs::read_dir("/proc").ok()?.flatten() {
            let path = entry.path();
            if !entry.file_name().to_string_lossy().bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let Ok(comm) = std::fs::read_to_string(path.join("comm")) else {
                continue;
            };
            if comm.trim() != self.process_name {
                continue;
            }
            let Some(ticks) = Self::start_ticks(&path) else {
                continue;
            };
            let uptime = system_uptime - ticks / Self::USER_HZ;
            if uptime >= 0.0 && best.is_none_or(|b| uptime > b) {
                best = Some(uptime);
            }
        }
        best.map(Duration::from_secs_f64)
    }
}
