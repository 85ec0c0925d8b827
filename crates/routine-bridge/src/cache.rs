//! Routine handle cache and connection lifecycle.

#![allow(missing_docs)]

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;
use smol_str::SmolStr;
use tracing::{info, warn};

use crate::engine::{Credentials, Engine, EngineConnector, Routine};
use crate::error::BridgeError;
use crate::policy::PolicyFlags;

/// Cached live reference to a routine plus acquisition metadata.
#[derive(Clone)]
pub struct RoutineHandle {
    pub routine: Arc<dyn Routine>,
    /// Acquired in a mode permitting concurrent re-entrant invocation.
    pub reentrant: bool,
    /// This process started the routine because it was idle.
    pub auto_started: bool,
}

// The routine reference itself carries no Debug bound.
impl fmt::Debug for RoutineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutineHandle")
            .field("reentrant", &self.reentrant)
            .field("auto_started", &self.auto_started)
            .finish_non_exhaustive()
    }
}

struct CacheInner {
    engine: Option<Box<dyn Engine>>,
    routines: IndexMap<SmolStr, RoutineHandle>,
}

/// Cache of routine handles over a single shared engine connection.
///
/// One lock guards the handle map and the connection; acquisition is a
/// critical section, so concurrent first-time acquisitions serialize but a
/// routine identity is never activated twice concurrently. Invocations on a
/// handle already returned to a caller do not hold the lock.
pub struct HandleCache {
    connector: Box<dyn EngineConnector>,
    host: Option<SmolStr>,
    credentials: Option<Credentials>,
    policy: PolicyFlags,
    inner: Mutex<CacheInner>,
}

impl HandleCache {
    #[must_use]
    pub fn new(
        connector: Box<dyn EngineConnector>,
        host: Option<&str>,
        credentials: Option<Credentials>,
        policy: PolicyFlags,
    ) -> Self {
        Self {
            connector,
            host: host.filter(|h| !h.is_empty()).map(SmolStr::new),
            credentials,
            policy,
            inner: Mutex::new(CacheInner {
                engine: None,
                routines: IndexMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn policy(&self) -> PolicyFlags {
        self.policy
    }

    #[must_use]
    pub fn host_name(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().expect("handle cache poisoned")
    }

    /// Return a verified-live handle for `identity`, acquiring or
    /// re-acquiring as needed.
    ///
    /// Reentrancy is sticky upward only: once a routine is known reentrant,
    /// every future handle for it is acquired reentrantly regardless of what
    /// the caller asked for.
    pub fn get_handle(
        &self,
        identity: &str,
        want_reentrant: bool,
    ) -> Result<RoutineHandle, BridgeError> {
        let mut inner = self.lock();
        let mut sticky = want_reentrant;
        let mut was_auto_started = false;
        if let Some(handle) = inner.routines.get(identity) {
            sticky = sticky || handle.reentrant;
            let live = handle.routine.is_live();
            if live && (handle.reentrant || !want_reentrant) {
                return Ok(handle.clone());
            }
            // Probe failed, or the caller needs a reentrant handle and the
            // cached one is not: fall through as if uncached. A still-live
            // routine keeps its start record across the re-acquisition; it
            // is running now precisely because this process started it.
            was_auto_started = live && handle.auto_started;
        }
        self.acquire(&mut inner, identity, sticky, was_auto_started)
    }

    /// Abort every cached, non-idle routine passing the filter.
    ///
    /// Individual abort failures are logged and swallowed so one failure
    /// does not block cleanup of the rest.
    pub fn stop_all(&self, only_if_auto_started: bool) {
        let inner = self.lock();
        for (identity, handle) in &inner.routines {
            if only_if_auto_started && !handle.auto_started {
                continue;
            }
            match handle.routine.exec_state() {
                Ok(state) if !state.is_idle() => {
                    info!(routine = %identity, "stopping routine at shutdown");
                    if let Err(err) = handle.routine.abort() {
                        warn!(routine = %identity, error = %err, "error stopping routine");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(routine = %identity, error = %err, "cannot query routine at shutdown");
                }
            }
        }
    }

    fn acquire(
        &self,
        inner: &mut CacheInner,
        identity: &str,
        want_reentrant: bool,
        was_auto_started: bool,
    ) -> Result<RoutineHandle, BridgeError> {
        self.ensure_connection(inner)?;
        let Some(engine) = inner.engine.as_mut() else {
            return Err(BridgeError::EngineUnreachable("no engine connection".into()));
        };
        let (routine, reentrant) = open_routine(engine.as_mut(), identity, want_reentrant)?;

        let mut auto_started = was_auto_started;
        let state = routine
            .exec_state()
            .map_err(|err| acquisition_error(identity, &err))?;
        if state.is_idle() {
            if self.policy.contains(PolicyFlags::START_IF_IDLE) {
                info!(routine = %identity, host = %self.host_name(), "starting idle routine");
                routine
                    .start()
                    .map_err(|err| acquisition_error(identity, &err))?;
                auto_started = true;
            } else if self.policy.contains(PolicyFlags::WARN_IF_IDLE) {
                warn!(
                    routine = %identity,
                    host = %self.host_name(),
                    "routine is idle and auto-start is disabled"
                );
            }
        }

        let handle = RoutineHandle {
            routine,
            reentrant,
            auto_started,
        };
        inner.routines.insert(SmolStr::new(identity), handle.clone());
        Ok(handle)
    }

    fn ensure_connection(&self, inner: &mut CacheInner) -> Result<(), BridgeError> {
        if inner
            .engine
            .as_ref()
            .is_some_and(|engine| engine.check_connection())
        {
            return Ok(());
        }
        let engine = match &self.host {
            Some(host) => {
                info!(host = %host, "(re)connecting to engine");
                self.connector.connect_remote(host, self.credentials.as_ref())
            }
            None => {
                info!("(re)connecting to engine on localhost");
                self.connector.connect_local()
            }
        }
        .map_err(|err| match err {
            unreachable @ BridgeError::EngineUnreachable(_) => unreachable,
            other => BridgeError::EngineUnreachable(other.to_string().into()),
        })?;
        inner.engine = Some(engine);
        Ok(())
    }
}

fn open_routine(
    engine: &mut dyn Engine,
    identity: &str,
    want_reentrant: bool,
) -> Result<(Arc<dyn Routine>, bool), BridgeError> {
    let wrap = |err: &BridgeError| acquisition_error(identity, err);
    if want_reentrant {
        let routine = engine
            .open_routine(identity, true)
            .map_err(|err| wrap(&err))?;
        return Ok((routine, true));
    }
    let routine = engine
        .open_routine(identity, false)
        .map_err(|err| wrap(&err))?;
    // An inherently reentrant routine must always be held reentrantly.
    if routine.is_reentrant().map_err(|err| wrap(&err))? {
        let routine = engine
            .open_routine(identity, true)
            .map_err(|err| wrap(&err))?;
        return Ok((routine, true));
    }
    Ok((routine, false))
}

fn acquisition_error(identity: &str, err: &BridgeError) -> BridgeError {
    BridgeError::RoutineAcquisition {
        identity: identity.into(),
        detail: err.to_string().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecState;
    use crate::sim::SimEngine;
    use crate::value::DynValue;

    fn cache(sim: &SimEngine, policy: PolicyFlags) -> HandleCache {
        HandleCache::new(Box::new(sim.connector()), None, None, policy)
    }

    #[test]
    fn cached_handle_is_reused() {
        let sim = SimEngine::new();
        sim.define_routine("/r/a");
        let cache = cache(&sim, PolicyFlags::default());
        let first = cache.get_handle("/r/a", false).unwrap();
        let second = cache.get_handle("/r/a", false).unwrap();
        assert!(Arc::ptr_eq(&first.routine, &second.routine));
        assert_eq!(sim.open_count("/r/a"), 1);
        assert_eq!(sim.connect_count(), 1);
    }

    #[test]
    fn dead_reference_triggers_fresh_acquisition() {
        let sim = SimEngine::new();
        sim.define_routine("/r/a");
        let cache = cache(&sim, PolicyFlags::default());
        let stale = cache.get_handle("/r/a", false).unwrap();
        sim.kill_routine("/r/a");
        assert!(!stale.routine.is_live());
        let fresh = cache.get_handle("/r/a", false).unwrap();
        assert!(fresh.routine.is_live());
        assert_eq!(sim.open_count("/r/a"), 2);
    }

    #[test]
    fn broken_connection_is_reestablished() {
        let sim = SimEngine::new();
        sim.define_routine("/r/a");
        let cache = cache(&sim, PolicyFlags::default());
        cache.get_handle("/r/a", false).unwrap();
        sim.drop_connection();
        sim.kill_routine("/r/a");
        cache.get_handle("/r/a", false).unwrap();
        assert_eq!(sim.connect_count(), 2);
    }

    #[test]
    fn live_handle_survives_refused_connections() {
        let sim = SimEngine::new();
        sim.define_routine("/r/a");
        let cache = cache(&sim, PolicyFlags::default());
        cache.get_handle("/r/a", false).unwrap();
        sim.refuse_connections(true);
        // The cached handle is still live, so no reconnect is attempted.
        assert!(cache.get_handle("/r/a", false).is_ok());
    }

    #[test]
    fn connection_failure_is_engine_unreachable() {
        let sim = SimEngine::new();
        sim.define_routine("/r/a");
        sim.refuse_connections(true);
        let cache = cache(&sim, PolicyFlags::default());
        let err = cache.get_handle("/r/a", false).unwrap_err();
        assert!(matches!(err, BridgeError::EngineUnreachable(_)));
    }

    #[test]
    fn unknown_identity_is_acquisition_failure() {
        let sim = SimEngine::new();
        let cache = cache(&sim, PolicyFlags::default());
        let err = cache.get_handle("/r/missing", false).unwrap_err();
        assert!(matches!(err, BridgeError::RoutineAcquisition { .. }));
    }

    #[test]
    fn inherently_reentrant_routine_upgrades_acquisition() {
        let sim = SimEngine::new();
        sim.define_routine("/r/cb");
        sim.set_inherently_reentrant("/r/cb", true);
        let cache = cache(&sim, PolicyFlags::default());
        let handle = cache.get_handle("/r/cb", false).unwrap();
        assert!(handle.reentrant);
        // Initial non-reentrant open plus the reentrant re-acquisition.
        assert_eq!(sim.open_count("/r/cb"), 2);
    }

    #[test]
    fn reentrancy_is_sticky_upward_only() {
        let sim = SimEngine::new();
        sim.define_routine("/r/a");
        let cache = cache(&sim, PolicyFlags::default());
        let plain = cache.get_handle("/r/a", false).unwrap();
        assert!(!plain.reentrant);
        let upgraded = cache.get_handle("/r/a", true).unwrap();
        assert!(upgraded.reentrant);
        // A later non-reentrant request still yields the reentrant handle.
        let sticky = cache.get_handle("/r/a", false).unwrap();
        assert!(sticky.reentrant);
        assert!(Arc::ptr_eq(&upgraded.routine, &sticky.routine));
    }

    #[test]
    fn reentrant_upgrade_keeps_start_record() {
        let sim = SimEngine::new();
        sim.define_routine("/r/a");
        let cache = cache(&sim, PolicyFlags::START_IF_IDLE | PolicyFlags::STOP_ON_EXIT_IF_STARTED);
        let plain = cache.get_handle("/r/a", false).unwrap();
        assert!(plain.auto_started);
        // The routine is running now, but we are still the ones who started it.
        let upgraded = cache.get_handle("/r/a", true).unwrap();
        assert!(upgraded.reentrant);
        assert!(upgraded.auto_started);
        cache.stop_all(true);
        assert_eq!(sim.exec_state("/r/a"), Some(ExecState::Idle));
    }

    #[test]
    fn handle_debug_shows_metadata_only() {
        let sim = SimEngine::new();
        sim.define_routine("/r/a");
        let cache = cache(&sim, PolicyFlags::default());
        let handle = cache.get_handle("/r/a", false).unwrap();
        let shown = format!("{handle:?}");
        assert!(shown.contains("reentrant: false"));
        assert!(shown.contains("auto_started: false"));
    }

    #[test]
    fn idle_routine_started_when_policy_set() {
        let sim = SimEngine::new();
        sim.define_routine("/r/a");
        let cache = cache(&sim, PolicyFlags::START_IF_IDLE);
        let handle = cache.get_handle("/r/a", false).unwrap();
        assert!(handle.auto_started);
        assert_eq!(sim.exec_state("/r/a"), Some(ExecState::RunTopLevel));
    }

    #[test]
    fn idle_routine_left_alone_without_policy() {
        let sim = SimEngine::new();
        sim.define_routine("/r/a");
        let cache = cache(&sim, PolicyFlags::WARN_IF_IDLE);
        let handle = cache.get_handle("/r/a", false).unwrap();
        assert!(!handle.auto_started);
        assert_eq!(sim.exec_state("/r/a"), Some(ExecState::Idle));
    }

    #[test]
    fn already_running_routine_is_not_marked_auto_started() {
        let sim = SimEngine::new();
        sim.define_routine("/r/a");
        sim.set_exec_state("/r/a", ExecState::Running);
        let cache = cache(&sim, PolicyFlags::START_IF_IDLE);
        let handle = cache.get_handle("/r/a", false).unwrap();
        assert!(!handle.auto_started);
    }

    #[test]
    fn stop_all_honors_auto_started_filter() {
        let sim = SimEngine::new();
        sim.define_routine("/r/auto");
        sim.define_routine("/r/external");
        sim.set_exec_state("/r/external", ExecState::Running);
        let cache = cache(&sim, PolicyFlags::START_IF_IDLE);
        cache.get_handle("/r/auto", false).unwrap();
        cache.get_handle("/r/external", false).unwrap();

        cache.stop_all(true);
        assert_eq!(sim.exec_state("/r/auto"), Some(ExecState::Idle));
        // Started by some other actor, left untouched.
        assert_eq!(sim.exec_state("/r/external"), Some(ExecState::Running));

        sim.set_exec_state("/r/auto", ExecState::Running);
        cache.stop_all(false);
        assert_eq!(sim.exec_state("/r/auto"), Some(ExecState::Idle));
        assert_eq!(sim.exec_state("/r/external"), Some(ExecState::Idle));
    }

    #[test]
    fn remote_host_activation_carries_credentials() {
        let sim = SimEngine::new();
        sim.define_routine("/r/a");
        let credentials = Credentials {
            username: "operator".into(),
            password: "secret".into(),
        };
        let cache = HandleCache::new(
            Box::new(sim.connector()),
            Some("rig-host"),
            Some(credentials.clone()),
            PolicyFlags::default(),
        );
        cache.get_handle("/r/a", false).unwrap();
        assert_eq!(sim.remote_hosts(), vec![SmolStr::new("rig-host")]);
        assert_eq!(sim.remote_credentials(), vec![Some(credentials)]);
    }

    #[test]
    fn handle_invocations_do_not_need_the_cache() {
        let sim = SimEngine::new();
        sim.define_routine("/r/a");
        let cache = cache(&sim, PolicyFlags::default());
        let handle = cache.get_handle("/r/a", false).unwrap();
        drop(cache);
        handle
            .routine
            .set_control_value("Gain", DynValue::Float(3.5))
            .unwrap();
        assert_eq!(sim.control("/r/a", "Gain"), Some(DynValue::Float(3.5)));
    }
}
