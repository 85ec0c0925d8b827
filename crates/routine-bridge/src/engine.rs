//! Engine capability traits.
//!
//! The remote-object transport is an external collaborator; these traits are
//! the capability surface the bridge relies on, not a protocol to implement.
//! Connection objects are created explicitly and passed into the handle
//! cache; there is no hidden process-global initialization.

#![allow(missing_docs)]

use std::sync::Arc;

use smol_str::SmolStr;

use crate::error::BridgeError;
use crate::value::DynValue;

/// Execution state of a routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Idle,
    Running,
    RunTopLevel,
}

impl ExecState {
    #[must_use]
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// Caller identity used for remote activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: SmolStr,
    pub password: SmolStr,
}

/// A live reference to an acquired routine.
pub trait Routine: Send + Sync {
    /// Cheap liveness probe; an explicit result, not an exception signal.
    fn is_live(&self) -> bool;

    fn exec_state(&self) -> Result<ExecState, BridgeError>;

    /// Whether the routine is inherently reentrant.
    fn is_reentrant(&self) -> Result<bool, BridgeError>;

    /// Start an idle routine.
    fn start(&self) -> Result<(), BridgeError>;

    /// Abort a running routine.
    fn abort(&self) -> Result<(), BridgeError>;

    fn control_value(&self, control: &str) -> Result<DynValue, BridgeError>;

    fn set_control_value(&self, control: &str, value: DynValue) -> Result<(), BridgeError>;

    /// Invoke the routine with a named argument vector; outputs are written
    /// back into `values`.
    fn call(&self, names: &[SmolStr], values: &mut [DynValue]) -> Result<(), BridgeError>;
}

/// A live connection to the engine application.
pub trait Engine: Send {
    /// Liveness check on the connection itself.
    fn check_connection(&self) -> bool;

    /// Acquire a routine reference by identity.
    fn open_routine(
        &mut self,
        identity: &str,
        reentrant: bool,
    ) -> Result<Arc<dyn Routine>, BridgeError>;
}

/// Connection factory, local or remote with caller identity.
pub trait EngineConnector: Send + Sync {
    fn connect_local(&self) -> Result<Box<dyn Engine>, BridgeError>;

    fn connect_remote(
        &self,
        host: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn Engine>, BridgeError>;
}
