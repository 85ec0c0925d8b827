//! Dynamic engine values and local-type conversions.

#![allow(missing_docs)]

use crate::error::BridgeError;

/// Dynamically-typed value exchanged with the engine.
///
/// A closed tagged union: controls carry scalars, strings or flat numeric
/// arrays. Conversion to a concrete local type goes through the explicit
/// table below so that a mismatch is a first-class result.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DynValue {
    #[default]
    Empty,
    Bool(bool),
    Int(i32),
    Float(f64),
    Str(String),
    IntArray(Vec<i32>),
    FloatArray(Vec<f64>),
}

impl DynValue {
    /// Name of the dynamic type, used in mismatch diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int32",
            Self::Float(_) => "float64",
            Self::Str(_) => "string",
            Self::IntArray(_) => "int32array",
            Self::FloatArray(_) => "float64array",
        }
    }

    fn mismatch(&self, expected: &'static str) -> BridgeError {
        BridgeError::TypeMismatch {
            expected,
            got: self.type_name(),
        }
    }

    /// Coerce to a 32-bit integer.
    ///
    /// Bools map to 0/1, floats round to nearest, numeric strings parse.
    /// Arrays and empty values do not convert.
    pub fn to_i32(&self) -> Result<i32, BridgeError> {
        match self {
            Self::Bool(value) => Ok(i32::from(*value)),
            Self::Int(value) => Ok(*value),
            Self::Float(value) => Ok(value.round() as i32),
            Self::Str(text) => {
                let trimmed = text.trim();
                if let Ok(value) = trimmed.parse::<i32>() {
                    return Ok(value);
                }
                trimmed
                    .parse::<f64>()
                    .map(|value| value.round() as i32)
                    .map_err(|_| self.mismatch("int32"))
            }
            _ => Err(self.mismatch("int32")),
        }
    }

    /// Coerce to a 64-bit float.
    pub fn to_f64(&self) -> Result<f64, BridgeError> {
        match self {
            Self::Bool(value) => Ok(if *value { 1.0 } else { 0.0 }),
            Self::Int(value) => Ok(f64::from(*value)),
            Self::Float(value) => Ok(*value),
            Self::Str(text) => text
                .trim()
                .parse::<f64>()
                .map_err(|_| self.mismatch("float64")),
            _ => Err(self.mismatch("float64")),
        }
    }

    /// Generic to-string coercion; always available.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Bool(value) => value.to_string(),
            Self::Int(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
            Self::Str(text) => text.clone(),
            Self::IntArray(values) => join(values.iter()),
            Self::FloatArray(values) => join(values.iter()),
        }
    }

    /// Copy an int32 array into `buf`, at most `buf.len()` elements.
    ///
    /// The remote value must be an int32 array; truncation is not an error
    /// and the number of elements copied is returned.
    pub fn copy_i32_array(&self, buf: &mut [i32]) -> Result<usize, BridgeError> {
        match self {
            Self::IntArray(values) => {
                let count = values.len().min(buf.len());
                buf[..count].copy_from_slice(&values[..count]);
                Ok(count)
            }
            _ => Err(self.mismatch("int32array")),
        }
    }

    /// Copy a float64 array into `buf`, at most `buf.len()` elements.
    pub fn copy_f64_array(&self, buf: &mut [f64]) -> Result<usize, BridgeError> {
        match self {
            Self::FloatArray(values) => {
                let count = values.len().min(buf.len());
                buf[..count].copy_from_slice(&values[..count]);
                Ok(count)
            }
            _ => Err(self.mismatch("float64array")),
        }
    }
}

fn join<T: ToString>(values: impl Iterator<Item = T>) -> String {
    values
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl From<bool> for DynValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for DynValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for DynValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for DynValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for DynValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}
