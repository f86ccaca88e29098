//! Serializable configuration for simulations and trace sets
//!
//! Launchers that build simulations declaratively deserialize these structs
//! (JSON, YAML, ...) and hand them to `Simulation::from_config` and
//! `TraceSet::from_config`.

use crate::core::error::SimError;
use serde::{Deserialize, Serialize};

/// Simulation-wide configuration
///
/// # Example
/// ```
/// use des_kernel::SimulationConfig;
///
/// let config: SimulationConfig =
///     serde_json::from_str(r#"{"ticks_per_unit_time": 1000.0}"#).unwrap();
/// assert!(config.tracing_enabled);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Ticks per unit of simulation time
    pub ticks_per_unit_time: f64,

    /// Master switch for trace-set output
    pub tracing_enabled: bool,

    /// Capture a backtrace when each event is scheduled
    pub stack_trace_mode: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            ticks_per_unit_time: 1.0,
            tracing_enabled: true,
            stack_trace_mode: false,
        }
    }
}

impl SimulationConfig {
    /// Check the configuration before a simulation is built from it
    pub fn validate(&self) -> Result<(), SimError> {
        if !self.ticks_per_unit_time.is_finite() || self.ticks_per_unit_time <= 0.0 {
            return Err(SimError::InvalidConfig(format!(
                "ticks_per_unit_time must be finite and positive, got {}",
                self.ticks_per_unit_time
            )));
        }
        Ok(())
    }
}

/// Output format for trace sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceFormat {
    /// `[<level> name @ ticks (time)]: message`
    #[default]
    Text,

    /// One JSON-encoded `TraceRecord` per line
    JsonLines,
}

/// Trace-set configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceSetConfig {
    /// Configured level; calls at this level or above are emitted
    pub level: i32,

    /// Capture the call stack at each trace call
    pub stack_trace_mode: bool,

    /// Maximum number of stack frames written (0 = unlimited)
    pub stack_trace_limit: usize,

    /// Output format
    pub format: TraceFormat,
}

impl Default for TraceSetConfig {
    fn default() -> Self {
        Self {
            level: 0,
            stack_trace_mode: false,
            stack_trace_limit: 0,
            format: TraceFormat::Text,
        }
    }
}

impl TraceSetConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        if self.stack_trace_limit > 0 && !self.stack_trace_mode {
            return Err(SimError::InvalidConfig(
                "stack_trace_limit is set but stack_trace_mode is off".to_string(),
            ));
        }
        Ok(())
    }
}
