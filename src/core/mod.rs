//! Core orchestration logic.
//!
//! This module contains:
//! - Operator: event dispatch and lifecycle flows
//! - Operations: the steps flows are built from
//! - ReattachCollection: durable record of running processes
//! - ProcessWatcher and RestartLimiter: crash detection and self-healing
//! - Retry: bounded retry with backoff for configuration pushes

pub mod clients;
pub mod operation;
pub mod operator;
pub mod rate_limit;
pub mod reattach;
pub mod retry;
pub mod watcher;

pub use clients::{
    ClientError, ClientRegistry, ConfigClient, ConnectionProvider, Endpoint, UnavailableProvider,
};
pub use operation::{Flow, Operation, OperationContext};
pub use operator::{purge_leftovers, Collaborators, Operator};
pub use rate_limit::RestartLimiter;
pub use reattach::{ReattachCollection, ReattachError, ReattachInfo};
pub use retry::{retry, retry_with_backoff, Backoff, RetryError, RetryPolicy};
pub use watcher::{ExitReason, ProcessWatcher, WatchEvent};
