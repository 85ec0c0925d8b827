//! Parameter façade: configuration-driven reads and writes.

#![allow(missing_docs)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use smol_str::SmolStr;
use tracing::debug;

use crate::cache::HandleCache;
use crate::config::Resolver;
use crate::error::BridgeError;
use crate::value::DynValue;

/// Fixed delay between post-action confirmation probes.
pub const POST_POLL_DELAY: Duration = Duration::from_millis(100);

/// Control names of the external-interface argument vector, in slot order.
const EXTINT_SLOTS: [&str; 6] = [
    "Routine Name",
    "Control Name",
    "String Control Value",
    "Variant Control Value",
    "Machine Name",
    "Return Message",
];

/// Logical parameter selector.
///
/// Parameters are normally addressed by name; the legacy addressing mode
/// selects by the numeric id attribute instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRef<'a> {
    Name(&'a str),
    Address(i32),
}

impl ParamRef<'_> {
    fn selector(&self) -> String {
        match self {
            Self::Name(name) => format!("param[@name='{name}']"),
            Self::Address(addr) => format!("param[@id={addr}]"),
        }
    }
}

impl fmt::Display for ParamRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Address(addr) => write!(f, "#{addr}"),
        }
    }
}

impl<'a> From<&'a str> for ParamRef<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

impl From<i32> for ParamRef<'_> {
    fn from(addr: i32) -> Self {
        Self::Address(addr)
    }
}

/// Façade mapping logical parameters onto routine controls.
///
/// Every failure from resolution, acquisition or invocation is re-raised as
/// one uniform [`BridgeError::Parameter`] carrying the parameter name, the
/// attempted value and the underlying cause.
pub struct ParameterFacade {
    section: SmolStr,
    resolver: Arc<Resolver>,
    cache: Arc<HandleCache>,
    extint: SmolStr,
    post_delay: Duration,
}

impl ParameterFacade {
    #[must_use]
    pub fn new(section: &str, resolver: Arc<Resolver>, cache: Arc<HandleCache>) -> Self {
        let extint = resolver.resolve_native_path("/bridge/extint/@path");
        Self {
            section: SmolStr::new(section),
            resolver,
            cache,
            extint: SmolStr::new(extint),
            post_delay: POST_POLL_DELAY,
        }
    }

    /// Override the post-action poll delay.
    #[must_use]
    pub fn with_post_delay(mut self, delay: Duration) -> Self {
        self.post_delay = delay;
        self
    }

    #[must_use]
    pub fn section(&self) -> &str {
        &self.section
    }

    #[must_use]
    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<HandleCache> {
        &self.cache
    }

    /// Read a parameter's dynamic value.
    pub fn read(&self, param: ParamRef<'_>) -> Result<DynValue, BridgeError> {
        self.read_inner(param)
            .map_err(|err| err.for_parameter(&param.to_string(), ""))
    }

    /// Read a parameter via the generic to-string coercion.
    pub fn read_text(&self, param: ParamRef<'_>) -> Result<String, BridgeError> {
        self.read(param).map(|value| value.to_text())
    }

    /// Read an int32 array parameter into `buf`; returns the count filled.
    pub fn read_i32_array(
        &self,
        param: ParamRef<'_>,
        buf: &mut [i32],
    ) -> Result<usize, BridgeError> {
        self.read_inner(param)
            .and_then(|value| value.copy_i32_array(buf))
            .map_err(|err| err.for_parameter(&param.to_string(), ""))
    }

    /// Read a float64 array parameter into `buf`; returns the count filled.
    pub fn read_f64_array(
        &self,
        param: ParamRef<'_>,
        buf: &mut [f64],
    ) -> Result<usize, BridgeError> {
        self.read_inner(param)
            .and_then(|value| value.copy_f64_array(buf))
            .map_err(|err| err.for_parameter(&param.to_string(), ""))
    }

    /// Write a parameter, honoring the extended-invocation flag and any
    /// configured post-action.
    pub fn write(&self, param: ParamRef<'_>, value: DynValue) -> Result<(), BridgeError> {
        let shown = value.to_text();
        self.write_inner(param, value)
            .map_err(|err| err.for_parameter(&param.to_string(), &shown))
    }

    fn read_inner(&self, param: ParamRef<'_>) -> Result<DynValue, BridgeError> {
        let routine = self.routine_path()?;
        let control = self.require(&self.param_query(param, "read", "target"))?;
        debug!(param = %param, routine = %routine, control = %control, "read");
        self.get_direct(&routine, &control)
    }

    fn write_inner(&self, param: ParamRef<'_>, value: DynValue) -> Result<(), BridgeError> {
        let routine = self.routine_path()?;
        let control = self.require(&self.param_query(param, "set", "target"))?;
        let extended = self
            .resolver
            .resolve_bool(&self.param_query(param, "set", "extint"));
        debug!(param = %param, routine = %routine, control = %control, extended, "write");
        self.put(&routine, &control, value, extended)?;

        let post = self
            .resolver
            .resolve_string(&self.param_query(param, "set", "post"));
        if post.is_empty() {
            return Ok(());
        }
        // Fire-and-confirm: press the post button, optionally wait for the
        // routine to clear it.
        self.put(&routine, &post, DynValue::Bool(true), extended)?;
        if self
            .resolver
            .resolve_bool(&self.param_query(param, "set", "wait"))
        {
            loop {
                let current = self.get_direct(&routine, &post)?;
                if !is_set(&current) {
                    break;
                }
                std::thread::sleep(self.post_delay);
            }
        }
        Ok(())
    }

    fn get_direct(&self, routine: &str, control: &str) -> Result<DynValue, BridgeError> {
        let handle = self.cache.get_handle(routine, false)?;
        handle.routine.control_value(control)
    }

    fn put(
        &self,
        routine: &str,
        control: &str,
        value: DynValue,
        extended: bool,
    ) -> Result<(), BridgeError> {
        if extended {
            return self.call_external(routine, control, value);
        }
        let handle = self.cache.get_handle(routine, false)?;
        handle.routine.set_control_value(control, value)
    }

    /// Set a control by invoking the shared external-interface routine with
    /// the fixed 6-slot argument vector. Always acquired reentrantly:
    /// callers invoke it concurrently on behalf of different parameters.
    fn call_external(
        &self,
        routine: &str,
        control: &str,
        value: DynValue,
    ) -> Result<(), BridgeError> {
        if self.extint.is_empty() {
            return Err(BridgeError::ConfigMissing("/bridge/extint/@path".into()));
        }
        let names: Vec<SmolStr> = EXTINT_SLOTS.iter().copied().map(SmolStr::new).collect();
        let mut values = vec![
            DynValue::Str(routine.to_string()),
            DynValue::Str(control.to_string()),
            DynValue::Empty,
            value,
            DynValue::Empty,
            DynValue::Empty,
        ];
        let handle = self.cache.get_handle(&self.extint, true)?;
        handle.routine.call(&names, &mut values)
    }

    /// Resolve a query the operation cannot proceed without; an empty answer
    /// is a misconfiguration, not a control named `""`.
    fn require(&self, query: &str) -> Result<String, BridgeError> {
        let answer = self.resolver.resolve_string(query);
        if answer.is_empty() {
            return Err(BridgeError::ConfigMissing(query.into()));
        }
        Ok(answer)
    }

    fn routine_path(&self) -> Result<String, BridgeError> {
        let query = format!("/bridge/section[@name='{}']/routine/@path", self.section);
        self.require(&query)?;
        Ok(self.resolver.resolve_native_path(&query))
    }

    fn param_query(&self, param: ParamRef<'_>, direction: &str, attr: &str) -> String {
        format!(
            "/bridge/section[@name='{}']/routine/{}/{direction}/@{attr}",
            self.section,
            param.selector()
        )
    }
}

fn is_set(value: &DynValue) -> bool {
    value.to_i32().map(|v| v != 0).unwrap_or(false)
}
