//! warden - local process orchestrator
//!
//! Fetches, installs, starts, reconfigures and stops child worker processes
//! on behalf of a supervising agent, and keeps managing them across crashes
//! of the children and restarts of warden itself.
//!
//! # Architecture
//!
//! - Lifecycle events arrive on an event bus as envelopes of steps
//! - The operator resolves each step into a program and a flow of operations
//! - Each operation checks whether it is needed before running
//! - Started processes are watched; crashes are restarted under a rate limit
//! - Running processes are recorded on disk so leftovers can be purged
//!
//! # Modules
//!
//! - `adapters`: artifact retrieval, OS processes, credentials, event bus
//! - `core`: operator, operations, reattach state, watcher, retry
//! - `domain`: execution contexts, programs, process specs, steps
//! - `config`: layered configuration
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the operator and start a program
//! echo '{"topic":"state-change","steps":[{"kind":"run","version":"1.0","program":{"cmd":"long"}}]}' \
//!     | warden serve
//!
//! # Inspect recorded processes
//! warden list
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use config::OperatorConfig;
pub use core::{Collaborators, Operator, ReattachCollection, ReattachInfo};
pub use domain::{ExecutionContext, Program, StateChange, Step};
