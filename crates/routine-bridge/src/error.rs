//! Bridge errors.

#![allow(missing_docs)]

use smol_str::SmolStr;
use thiserror::Error;

/// Errors raised by the bridge layers.
///
/// Lower layers raise the narrow variants; the parameter façade is the single
/// point that normalizes them into [`BridgeError::Parameter`] for the
/// instrument-I/O boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Configuration document could not be read or parsed. Fatal at
    /// construction: no document, no resolver, no driver instance.
    #[error("cannot load config '{path}': {detail}")]
    ConfigLoad { path: SmolStr, detail: SmolStr },

    /// A driver entry point was used before any configuration was attached.
    #[error("no configuration loaded")]
    ConfigUnavailable,

    /// A query the façade requires resolved to nothing; the document is
    /// missing the named attribute.
    #[error("missing config attribute: {0}")]
    ConfigMissing(SmolStr),

    /// Connection or activation of the remote engine failed.
    #[error("engine unreachable: {0}")]
    EngineUnreachable(SmolStr),

    /// Engine connection succeeded but the routine identity could not be
    /// resolved to a live reference.
    #[error("cannot acquire routine '{identity}': {detail}")]
    RoutineAcquisition { identity: SmolStr, detail: SmolStr },

    /// Remote value's dynamic type does not match the requested local type.
    #[error("type mismatch (expected {expected}, got {got})")]
    TypeMismatch {
        expected: &'static str,
        got: &'static str,
    },

    /// An invocation on a held routine reference failed.
    #[error("engine call failed: {0}")]
    EngineCall(SmolStr),

    /// Uniform façade-level error for the framework boundary.
    #[error("parameter '{param}' operation failed (value={value}): {cause}")]
    Parameter {
        param: SmolStr,
        value: SmolStr,
        cause: SmolStr,
    },
}

impl BridgeError {
    /// Wrap any bridge error as a façade-level parameter failure.
    #[must_use]
    pub fn for_parameter(self, param: &str, value: &str) -> Self {
        match self {
            Self::Parameter { .. } => self,
            other => Self::Parameter {
                param: param.into(),
                value: value.into(),
                cause: other.to_string().into(),
            },
        }
    }
}
