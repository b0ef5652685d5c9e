//! Lifecycle events delivered by the event bus.
//!
//! An envelope carries ordered steps; each step names a kind (`run`,
//! `remove`, `start-sidecar`, `stop-sidecar`) and the program it targets.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::program::ProgramConfig;

/// Start or reconfigure a program
pub const STEP_RUN: &str = "run";

/// Stop and remove a program
pub const STEP_REMOVE: &str = "remove";

/// Start (or refresh) the monitoring sidecars of a program
pub const STEP_START_SIDECAR: &str = "start-sidecar";

/// Stop the monitoring sidecars of a program
pub const STEP_STOP_SIDECAR: &str = "stop-sidecar";

/// Meta key holding the program configuration
pub const META_CONFIG: &str = "config";

/// Envelope of ordered steps published on a topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    /// Topic the envelope was published on
    pub topic: String,

    /// Steps, processed in order
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl StateChange {
    pub fn new(topic: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            topic: topic.into(),
            steps,
        }
    }
}

/// Program named by a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramDescriptor {
    /// Binary name
    pub cmd: String,
}

/// A single lifecycle step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step kind, looked up in the operator's handler table
    pub kind: String,

    /// Program version
    #[serde(default)]
    pub version: String,

    /// Target program
    pub program: ProgramDescriptor,

    /// Free-form metadata (configuration, ...)
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl Step {
    pub fn new(kind: impl Into<String>, cmd: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            version: version.into(),
            program: ProgramDescriptor { cmd: cmd.into() },
            meta: Map::new(),
        }
    }

    /// Attach a configuration blob
    pub fn with_config(mut self, config: ProgramConfig) -> Self {
        self.meta.insert(META_CONFIG.to_string(), Value::Object(config));
        self
    }

    /// Attach a metadata entry
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Configuration blob from meta (empty when absent)
    pub fn config(&self) -> anyhow::Result<ProgramConfig> {
        match self.meta.get(META_CONFIG) {
            None | Some(Value::Null) => Ok(ProgramConfig::new()),
            Some(Value::Object(config)) => Ok(config.clone()),
            Some(other) => anyhow::bail!(
                "Step '{}' for '{}' has a non-map configuration: {}",
                self.kind,
                self.program.cmd,
                other
            ),
        }
    }
}
