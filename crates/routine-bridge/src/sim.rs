//! In-process simulator engine.
//!
//! Backs the unit tests, the integration scenario and the demo binary with a
//! table of routines and control values. Knobs cover the failure modes the
//! cache has to recover from: dead routine references, dropped connections
//! and refused activations.

#![allow(missing_docs)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::engine::{Credentials, Engine, EngineConnector, ExecState, Routine};
use crate::error::BridgeError;
use crate::lifecycle::EngineWatch;
use crate::value::DynValue;

#[derive(Debug, Default)]
struct RoutineState {
    controls: IndexMap<SmolStr, DynValue>,
    exec: Option<ExecState>,
    inherently_reentrant: bool,
    external_interface: bool,
    generation: u64,
    open_count: u32,
    auto_clear: IndexMap<SmolStr, u32>,
}

impl RoutineState {
    fn exec(&self) -> ExecState {
        self.exec.unwrap_or(ExecState::Idle)
    }
}

/// One recorded argument-vector invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub routine: SmolStr,
    pub names: Vec<SmolStr>,
    pub values: Vec<DynValue>,
    pub acquired_reentrant: bool,
}

#[derive(Debug, Default)]
struct SimState {
    routines: IndexMap<SmolStr, RoutineState>,
    connection_live: bool,
    refuse_connections: bool,
    connect_count: u32,
    remote_hosts: Vec<SmolStr>,
    remote_credentials: Vec<Option<Credentials>>,
    calls: Vec<RecordedCall>,
    uptime: Option<Duration>,
}

/// Handle to the shared simulator state.
#[derive(Debug, Clone, Default)]
pub struct SimEngine {
    state: Arc<Mutex<SimState>>,
}

impl SimEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().expect("simulator state poisoned")
    }

    /// Define a routine the engine can open.
    pub fn define_routine(&self, identity: &str) {
        self.lock()
            .routines
            .entry(SmolStr::new(identity))
            .or_default();
    }

    pub fn set_control(&self, identity: &str, control: &str, value: DynValue) {
        let mut state = self.lock();
        let routine = state.routines.entry(SmolStr::new(identity)).or_default();
        routine.controls.insert(SmolStr::new(control), value);
    }

    #[must_use]
    pub fn control(&self, identity: &str, control: &str) -> Option<DynValue> {
        self.lock()
            .routines
            .get(identity)
            .and_then(|routine| routine.controls.get(control).cloned())
    }

    pub fn set_exec_state(&self, identity: &str, exec: ExecState) {
        let mut state = self.lock();
        let routine = state.routines.entry(SmolStr::new(identity)).or_default();
        routine.exec = Some(exec);
    }

    #[must_use]
    pub fn exec_state(&self, identity: &str) -> Option<ExecState> {
        self.lock().routines.get(identity).map(RoutineState::exec)
    }

    pub fn set_inherently_reentrant(&self, identity: &str, reentrant: bool) {
        let mut state = self.lock();
        let routine = state.routines.entry(SmolStr::new(identity)).or_default();
        routine.inherently_reentrant = reentrant;
    }

    /// Mark a routine as the shared external-interface indirection: calling
    /// it applies slot 3 of the argument vector to the routine/control named
    /// in slots 0 and 1.
    pub fn mark_external_interface(&self, identity: &str) {
        let mut state = self.lock();
        let routine = state.routines.entry(SmolStr::new(identity)).or_default();
        routine.external_interface = true;
    }

    /// Reads of `control` return its current value for `polls` probes, then
    /// the control flips to false. Models commit triggers the target routine
    /// clears on its own.
    pub fn auto_clear_after(&self, identity: &str, control: &str, polls: u32) {
        let mut state = self.lock();
        let routine = state.routines.entry(SmolStr::new(identity)).or_default();
        routine.auto_clear.insert(SmolStr::new(control), polls);
    }

    /// Invalidate every handle previously issued for a routine.
    pub fn kill_routine(&self, identity: &str) {
        if let Some(routine) = self.lock().routines.get_mut(identity) {
            routine.generation += 1;
        }
    }

    /// Make the current engine connection fail its liveness check.
    pub fn drop_connection(&self) {
        self.lock().connection_live = false;
    }

    /// Refuse subsequent activation attempts.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    pub fn set_uptime(&self, uptime: Option<Duration>) {
        self.lock().uptime = uptime;
    }

    #[must_use]
    pub fn connect_count(&self) -> u32 {
        self.lock().connect_count
    }

    #[must_use]
    pub fn open_count(&self, identity: &str) -> u32 {
        self.lock()
            .routines
            .get(identity)
            .map_or(0, |routine| routine.open_count)
    }

    #[must_use]
    pub fn remote_hosts(&self) -> Vec<SmolStr> {
        self.lock().remote_hosts.clone()
    }

    #[must_use]
    pub fn remote_credentials(&self) -> Vec<Option<Credentials>> {
        self.lock().remote_credentials.clone()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Connector handing out connections to this simulator.
    #[must_use]
    pub fn connector(&self) -> SimConnector {
        SimConnector {
            engine: self.clone(),
        }
    }
}

/// Connection factory for [`SimEngine`].
#[derive(Debug, Clone)]
pub struct SimConnector {
    engine: SimEngine,
}

impl SimConnector {
    fn connect(&self) -> Result<Box<dyn Engine>, BridgeError> {
        let mut state = self.engine.lock();
        if state.refuse_connections {
            return Err(BridgeError::EngineUnreachable(
                "simulator refusing connections".into(),
            ));
        }
        state.connection_live = true;
        state.connect_count += 1;
        Ok(Box::new(SimConnection {
            engine: self.engine.clone(),
        }))
    }
}

impl EngineConnector for SimConnector {
    fn connect_local(&self) -> Result<Box<dyn Engine>, BridgeError> {
        self.connect()
    }

    fn connect_remote(
        &self,
        host: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn Engine>, BridgeError> {
        {
            let mut state = self.engine.lock();
            state.remote_hosts.push(SmolStr::new(host));
            state.remote_credentials.push(credentials.cloned());
        }
        self.connect()
    }
}

#[derive(Debug)]
struct SimConnection {
    engine: SimEngine,
}

impl Engine for SimConnection {
    fn check_connection(&self) -> bool {
        self.engine.lock().connection_live
    }

    fn open_routine(
        &mut self,
        identity: &str,
        reentrant: bool,
    ) -> Result<Arc<dyn Routine>, BridgeError> {
        let mut state = self.engine.lock();
        let Some(routine) = state.routines.get_mut(identity) else {
            return Err(BridgeError::EngineCall(
                format!("unknown routine '{identity}'").into(),
            ));
        };
        routine.open_count += 1;
        let generation = routine.generation;
        Ok(Arc::new(SimRoutine {
            engine: self.engine.clone(),
            identity: SmolStr::new(identity),
            generation,
            acquired_reentrant: reentrant,
        }))
    }
}

#[derive(Debug)]
struct SimRoutine {
    engine: SimEngine,
    identity: SmolStr,
    generation: u64,
    acquired_reentrant: bool,
}

impl SimRoutine {
    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut RoutineState) -> Result<T, BridgeError>,
    ) -> Result<T, BridgeError> {
        let mut state = self.engine.lock();
        let Some(routine) = state.routines.get_mut(self.identity.as_str()) else {
            return Err(BridgeError::EngineCall(
                format!("routine '{}' gone", self.identity).into(),
            ));
        };
        if routine.generation != self.generation {
            return Err(BridgeError::EngineCall(
                format!("stale reference to '{}'", self.identity).into(),
            ));
        }
        f(routine)
    }
}

impl Routine for SimRoutine {
    fn is_live(&self) -> bool {
        let state = self.engine.lock();
        state
            .routines
            .get(self.identity.as_str())
            .is_some_and(|routine| routine.generation == self.generation)
    }

    fn exec_state(&self) -> Result<ExecState, BridgeError> {
        self.with_state(|routine| Ok(routine.exec()))
    }

    fn is_reentrant(&self) -> Result<bool, BridgeError> {
        self.with_state(|routine| Ok(routine.inherently_reentrant))
    }

    fn start(&self) -> Result<(), BridgeError> {
        self.with_state(|routine| {
            routine.exec = Some(ExecState::RunTopLevel);
            Ok(())
        })
    }

    fn abort(&self) -> Result<(), BridgeError> {
        self.with_state(|routine| {
            routine.exec = Some(ExecState::Idle);
            Ok(())
        })
    }

    fn control_value(&self, control: &str) -> Result<DynValue, BridgeError> {
        self.with_state(|routine| {
            if let Some(remaining) = routine.auto_clear.get_mut(control) {
                if *remaining == 0 {
                    routine
                        .controls
                        .insert(SmolStr::new(control), DynValue::Bool(false));
                } else {
                    *remaining -= 1;
                }
            }
            Ok(routine.controls.get(control).cloned().unwrap_or_default())
        })
    }

    fn set_control_value(&self, control: &str, value: DynValue) -> Result<(), BridgeError> {
        if control.is_empty() {
            return Err(BridgeError::EngineCall("empty control name".into()));
        }
        self.with_state(|routine| {
            routine.controls.insert(SmolStr::new(control), value);
            Ok(())
        })
    }

    fn call(&self, names: &[SmolStr], values: &mut [DynValue]) -> Result<(), BridgeError> {
        let mut state = self.engine.lock();
        state.calls.push(RecordedCall {
            routine: self.identity.clone(),
            names: names.to_vec(),
            values: values.to_vec(),
            acquired_reentrant: self.acquired_reentrant,
        });
        let is_extint = state
            .routines
            .get(self.identity.as_str())
            .is_some_and(|routine| routine.external_interface);
        if is_extint {
            if values.len() < 6 {
                return Err(BridgeError::EngineCall("argument vector too short".into()));
            }
            let target = values[0].to_text();
            let control = values[1].to_text();
            let value = values[3].clone();
            let Some(routine) = state.routines.get_mut(target.as_str()) else {
                return Err(BridgeError::EngineCall(
                    format!("unknown routine '{target}'").into(),
                ));
            };
            routine.controls.insert(SmolStr::new(&control), value);
            values[5] = DynValue::Str("ok".into());
        }
        Ok(())
    }
}

impl EngineWatch for SimEngine {
    fn engine_uptime(&self) -> Option<Duration> {
        self.lock().uptime
    }
}
