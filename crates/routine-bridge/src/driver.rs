//! Instrument-I/O boundary adapter.

#![allow(missing_docs)]

use std::sync::Arc;

use indexmap::IndexMap;
use smol_str::SmolStr;
use tracing::debug;

use crate::config::ParamType;
use crate::error::BridgeError;
use crate::facade::{ParamRef, ParameterFacade};
use crate::value::DynValue;

/// Upper bound on one failure diagnostic, sized for a single log line.
pub const DIAG_LIMIT: usize = 256;

/// Outcome of one driver operation: success, or one bounded diagnostic line.
pub type DriverResult<T> = Result<T, SmolStr>;

/// Typed read/write surface presented to the instrument-I/O framework.
///
/// Every failure, from whichever internal layer, becomes one diagnostic
/// string carrying the driver name, operation, parameter name, attempted
/// value and cause.
pub struct BridgeDriver {
    name: SmolStr,
    facade: Option<Arc<ParameterFacade>>,
    params: IndexMap<SmolStr, ParamType>,
}

impl BridgeDriver {
    /// Build a driver over a configured façade; the parameter table comes
    /// from the façade's configuration section.
    #[must_use]
    pub fn new(name: &str, facade: Arc<ParameterFacade>) -> Self {
        let params = facade.resolver().params(facade.section());
        Self {
            name: SmolStr::new(name),
            facade: Some(facade),
            params,
        }
    }

    /// Driver shell with no configuration attached; every operation fails
    /// with the config-unavailable diagnostic.
    #[must_use]
    pub fn unconfigured(name: &str) -> Self {
        Self {
            name: SmolStr::new(name),
            facade: None,
            params: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured parameters, in document order.
    #[must_use]
    pub fn params(&self) -> &IndexMap<SmolStr, ParamType> {
        &self.params
    }

    pub fn write_float64(&self, param: &str, value: f64) -> DriverResult<()> {
        self.write_value("write_float64", param, DynValue::Float(value))
    }

    pub fn write_int32(&self, param: &str, value: i32) -> DriverResult<()> {
        self.write_value("write_int32", param, DynValue::Int(value))
    }

    pub fn write_octet(&self, param: &str, value: &str) -> DriverResult<()> {
        self.write_value("write_octet", param, DynValue::Str(value.to_string()))
    }

    pub fn read_float64(&self, param: &str) -> DriverResult<f64> {
        self.read_value("read_float64", param, |value| value.to_f64())
    }

    pub fn read_int32(&self, param: &str) -> DriverResult<i32> {
        self.read_value("read_int32", param, |value| value.to_i32())
    }

    /// Read a string parameter, truncated to `max_chars`.
    pub fn read_octet(&self, param: &str, max_chars: usize) -> DriverResult<String> {
        const OP: &str = "read_octet";
        let text = match self.facade().and_then(|f| f.read_text(ParamRef::Name(param))) {
            Ok(text) => text,
            Err(err) => return Err(self.diagnostic(OP, param, "", &err)),
        };
        if text.chars().count() > max_chars {
            let truncated: String = text.chars().take(max_chars).collect();
            debug!(
                driver = %self.name, op = OP, param,
                value = %truncated, total = text.chars().count(),
                "read ok (truncated)"
            );
            return Ok(truncated);
        }
        debug!(driver = %self.name, op = OP, param, value = %text, "read ok");
        Ok(text)
    }

    /// Read a float64 array into `buf`; the buffer is zero-filled first so a
    /// failure never leaves it undefined.
    pub fn read_float64_array(&self, param: &str, buf: &mut [f64]) -> DriverResult<usize> {
        const OP: &str = "read_float64_array";
        buf.fill(0.0);
        match self
            .facade()
            .and_then(|f| f.read_f64_array(ParamRef::Name(param), buf))
        {
            Ok(count) => {
                debug!(driver = %self.name, op = OP, param, count, "read ok");
                Ok(count)
            }
            Err(err) => Err(self.diagnostic(OP, param, "", &err)),
        }
    }

    /// Read an int32 array into `buf`; zero-filled first.
    pub fn read_int32_array(&self, param: &str, buf: &mut [i32]) -> DriverResult<usize> {
        const OP: &str = "read_int32_array";
        buf.fill(0);
        match self
            .facade()
            .and_then(|f| f.read_i32_array(ParamRef::Name(param), buf))
        {
            Ok(count) => {
                debug!(driver = %self.name, op = OP, param, count, "read ok");
                Ok(count)
            }
            Err(err) => Err(self.diagnostic(OP, param, "", &err)),
        }
    }

    fn write_value(&self, op: &str, param: &str, value: DynValue) -> DriverResult<()> {
        let shown = value.to_text();
        match self.facade().and_then(|f| f.write(ParamRef::Name(param), value)) {
            Ok(()) => {
                debug!(driver = %self.name, op, param, value = %shown, "write ok");
                Ok(())
            }
            Err(err) => Err(self.diagnostic(op, param, &shown, &err)),
        }
    }

    fn read_value<T: std::fmt::Display>(
        &self,
        op: &str,
        param: &str,
        convert: impl FnOnce(&DynValue) -> Result<T, BridgeError>,
    ) -> DriverResult<T> {
        let outcome = self
            .facade()
            .and_then(|f| f.read(ParamRef::Name(param)))
            .and_then(|value| {
                convert(&value).map_err(|err| err.for_parameter(param, &value.to_text()))
            });
        match outcome {
            Ok(value) => {
                debug!(driver = %self.name, op, param, value = %value, "read ok");
                Ok(value)
            }
            Err(err) => Err(self.diagnostic(op, param, "", &err)),
        }
    }

    fn facade(&self) -> Result<&Arc<ParameterFacade>, BridgeError> {
        self.facade.as_ref().ok_or(BridgeError::ConfigUnavailable)
    }

    fn diagnostic(&self, op: &str, param: &str, value: &str, err: &BridgeError) -> SmolStr {
        let line = format!(
            "{}:{op}: name={param}, value={value}, error={err}",
            self.name
        );
        if line.chars().count() <= DIAG_LIMIT {
            return SmolStr::new(line);
        }
        SmolStr::new(line.chars().take(DIAG_LIMIT).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::HandleCache;
    use crate::config::{ConfigDocument, Resolver};
    use crate::policy::PolicyFlags;
    use crate::sim::SimEngine;

    const DOC: &str = r#"
<bridge>
  <extint path="/routines/extint"/>
  <section name="rig">
    <routine path="/routines/rig/panel">
      <param name="gain" type="float64">
        <read target="Gain"/>
        <set target="Gain"/>
      </param>
      <param name="count" type="int32">
        <read target="Count"/>
        <set target="Count"/>
      </param>
      <param name="label" type="string">
        <read target="Label"/>
        <set target="Label"/>
      </param>
      <param name="trace" type="float64array">
        <read target="Trace"/>
      </param>
    </routine>
  </section>
</bridge>
"#;

    fn fixture() -> (SimEngine, BridgeDriver) {
        let sim = SimEngine::new();
        sim.define_routine("/routines/rig/panel");
        let resolver = Arc::new(Resolver::new(ConfigDocument::from_str(DOC).unwrap()));
        let cache = Arc::new(HandleCache::new(
            Box::new(sim.connector()),
            None,
            None,
            PolicyFlags::default(),
        ));
        let facade = Arc::new(ParameterFacade::new("rig", resolver, cache));
        (sim, BridgeDriver::new("rig0", facade))
    }

    #[test]
    fn param_table_built_from_config() {
        let (_sim, driver) = fixture();
        assert_eq!(driver.params().len(), 4);
        assert_eq!(driver.params().get("count"), Some(&ParamType::Int32));
    }

    #[test]
    fn typed_round_trips() {
        let (_sim, driver) = fixture();
        driver.write_float64("gain", 1.5).unwrap();
        assert_eq!(driver.read_float64("gain").unwrap(), 1.5);
        driver.write_int32("count", 42).unwrap();
        assert_eq!(driver.read_int32("count").unwrap(), 42);
        driver.write_octet("label", "beamline").unwrap();
        assert_eq!(driver.read_octet("label", 64).unwrap(), "beamline");
    }

    #[test]
    fn octet_read_truncates_to_caller_buffer() {
        let (_sim, driver) = fixture();
        driver.write_octet("label", "a long status line").unwrap();
        assert_eq!(driver.read_octet("label", 6).unwrap(), "a long");
    }

    #[test]
    fn array_read_zero_fills_on_failure() {
        let (sim, driver) = fixture();
        sim.set_control("/routines/rig/panel", "Trace", DynValue::Int(5));
        let mut buf = [9.0f64; 4];
        let err = driver.read_float64_array("trace", &mut buf).unwrap_err();
        assert_eq!(buf, [0.0; 4]);
        assert!(err.contains("type mismatch"));
    }

    #[test]
    fn diagnostic_line_carries_context_and_is_bounded() {
        let (sim, driver) = fixture();
        sim.refuse_connections(true);
        let err = driver.write_float64("gain", 2.5).unwrap_err();
        assert!(err.starts_with("rig0:write_float64: name=gain, value=2.5"));
        assert!(err.contains("unreachable"));
        assert!(err.chars().count() <= DIAG_LIMIT);
    }

    #[test]
    fn unconfigured_driver_reports_config_unavailable() {
        let driver = BridgeDriver::unconfigured("rig0");
        let err = driver.read_float64("gain").unwrap_err();
        assert!(err.contains("no configuration loaded"));
    }

    #[test]
    fn type_mismatch_surfaces_through_read() {
        let (sim, driver) = fixture();
        sim.set_control("/routines/rig/panel", "Gain", DynValue::Str("junk".into()));
        let err = driver.read_float64("gain").unwrap_err();
        assert!(err.contains("type mismatch"));
    }
}
