//! `routine-bridge` - bridge from slow-control instrumentation to a remote
//! automation engine's routines.
//!
//! The engine hosts named routines whose front-panel controls are the only
//! process variables. This crate maps logical parameters onto those controls
//! through an XML configuration document, caches live routine references so
//! repeated operations skip reconnection, and presents one typed read/write
//! surface to the hosting framework.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

/// Routine handle cache and connection lifecycle.
pub mod cache;
/// Configuration document and query resolver.
pub mod config;
/// Instrument-I/O boundary adapter.
pub mod driver;
/// Engine capability traits.
pub mod engine;
/// Bridge error taxonomy.
pub mod error;
/// Configuration-driven parameter reads and writes.
pub mod facade;
/// Engine readiness wait and shutdown hook.
pub mod lifecycle;
/// Process-lifetime policy flags.
pub mod policy;
/// In-process simulator engine for tests and demos.
pub mod sim;
/// Dynamic engine values and conversions.
pub mod value;

pub use cache::{HandleCache, RoutineHandle};
pub use config::{ConfigDocument, ParamType, Resolver};
pub use driver::{BridgeDriver, DriverResult, DIAG_LIMIT};
pub use engine::{Credentials, Engine, EngineConnector, ExecState, Routine};
pub use error::BridgeError;
pub use facade::{ParamRef, ParameterFacade};
#[cfg(unix)]
pub use lifecycle::ProcessTableWatch;
pub use lifecycle::{EngineReady, EngineWatch, Lifecycle, NoWatch};
pub use policy::PolicyFlags;
pub use value::DynValue;
