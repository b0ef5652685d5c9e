//! Domain types for the warden orchestrator.
//!
//! - ExecutionContext: deterministic identity of a program instance
//! - ProcessSpec: how a program's binary is launched and configured
//! - Program: the unit every operation acts on
//! - StateChange/Step: lifecycle events from the bus
//! - SidecarKind/MonitoringOutput: monitoring sidecars and where they ship data

pub mod context;
pub mod monitoring;
pub mod program;
pub mod spec;
pub mod step;
pub mod tag;

pub use context::{hash_tags, ExecutionContext};
pub use monitoring::{MonitoringError, MonitoringOutput, SidecarKind};
pub use program::{Platform, Program, ProgramConfig};
pub use spec::{with_config_arg, Configurable, ProcessSpec};
pub use step::{
    ProgramDescriptor, StateChange, Step, META_CONFIG, STEP_REMOVE, STEP_RUN, STEP_START_SIDECAR,
    STEP_STOP_SIDECAR,
};
pub use tag::{is_sidecar, parse_tags, sidecar_tags, Tag, Tags};
