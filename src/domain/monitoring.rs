//! Monitoring sidecars.
//!
//! A `start-sidecar` step carries the monitored program's configuration. Its
//! single `output` entry says where collected data is shipped; every
//! [`SidecarKind`] runs its own binary configured with that output.

use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

use super::program::ProgramConfig;

/// Configuration key holding the monitoring output
pub const OUTPUT_KEY: &str = "output";

/// What a sidecar collects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SidecarKind {
    Logs,
    Metrics,
}

impl SidecarKind {
    pub const ALL: [SidecarKind; 2] = [SidecarKind::Logs, SidecarKind::Metrics];

    /// Binary run as this sidecar
    pub fn binary(self) -> &'static str {
        match self {
            SidecarKind::Logs => "filebeat",
            SidecarKind::Metrics => "metricbeat",
        }
    }
}

impl fmt::Display for SidecarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SidecarKind::Logs => write!(f, "logs"),
            SidecarKind::Metrics => write!(f, "metrics"),
        }
    }
}

/// Rejected monitoring output
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitoringError {
    #[error("Monitoring output not found")]
    MissingOutput,

    #[error("Monitoring output is not a map")]
    NotAMap,

    #[error("Monitoring output is empty")]
    NoOutput,

    #[error("Monitoring has {0} outputs, expected exactly one")]
    TooManyOutputs(usize),

    #[error("Monitoring output has no type")]
    MissingType,

    #[error("Monitoring output type must be a string, got {0}")]
    InvalidType(String),
}

/// The one output monitoring data is shipped to
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoringOutput {
    /// Output type, e.g. `elasticsearch`
    pub output_type: String,

    /// Output settings (including `type`)
    pub settings: Map<String, Value>,
}

impl MonitoringOutput {
    /// Extract the output from a monitored program's configuration
    pub fn from_config(config: &ProgramConfig) -> Result<Self, MonitoringError> {
        let outputs = match config.get(OUTPUT_KEY) {
            None | Some(Value::Null) => return Err(MonitoringError::MissingOutput),
            Some(Value::Object(outputs)) => outputs,
            Some(_) => return Err(MonitoringError::NotAMap),
        };

        // The key an output is declared under does not matter, only that
        // there is exactly one
        let mut entries = outputs.values();
        let (Some(entry), None) = (entries.next(), entries.next()) else {
            return Err(if outputs.is_empty() {
                MonitoringError::NoOutput
            } else {
                MonitoringError::TooManyOutputs(outputs.len())
            });
        };

        let Value::Object(settings) = entry else {
            return Err(MonitoringError::NotAMap);
        };

        let output_type = match settings.get("type") {
            None => return Err(MonitoringError::MissingType),
            Some(Value::String(output_type)) => output_type.clone(),
            Some(other) => return Err(MonitoringError::InvalidType(other.to_string())),
        };

        Ok(Self {
            output_type,
            settings: settings.clone(),
        })
    }

    /// Sidecar configuration: the output keyed by its type
    pub fn sidecar_config(&self) -> ProgramConfig {
        let mut output = Map::new();
        output.insert(
            self.output_type.clone(),
            Value::Object(self.settings.clone()),
        );

        let mut config = ProgramConfig::new();
        config.insert(OUTPUT_KEY.to_string(), Value::Object(output));
        config
    }
}
