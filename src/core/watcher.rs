//! Exit watching for spawned processes.
//!
//! Each watched child is awaited on its own task. The exit is classified as
//! [`ExitReason::Closed`] for a successful status and [`ExitReason::Crashed`]
//! otherwise, then delivered on the channel handed out by
//! [`ProcessWatcher::new`]. Unwatched processes are still reaped but never
//! reported, unless [`ProcessWatcher::rewatch`] turns reporting back on
//! before they exit.

use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::Program;

/// Capacity of the watch event channel
const EVENT_BUFFER: usize = 100;

/// Why a watched process went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Non-zero exit, killed by a signal, or wait failure
    Crashed,

    /// Clean exit
    Closed,
}

impl ExitReason {
    fn from_status(status: &std::io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) if status.success() => Self::Closed,
            _ => Self::Crashed,
        }
    }
}

/// Exit report for a watched process
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub program: Program,
    pub pid: u32,
    pub reason: ExitReason,

    /// Exit code, when the process exited normally
    pub code: Option<i32>,

    pub exited_at: DateTime<Utc>,
}

/// Reports the exit of spawned processes
#[derive(Clone)]
pub struct ProcessWatcher {
    events: mpsc::Sender<WatchEvent>,
    /// Live children and whether their exit is reported
    watched: Arc<Mutex<HashMap<u32, bool>>>,
}

impl ProcessWatcher {
    /// Create a watcher and the receiving end of its events
    pub fn new() -> (Self, mpsc::Receiver<WatchEvent>) {
        let (events, rx) = mpsc::channel(EVENT_BUFFER);
        (
            Self {
                events,
                watched: Arc::new(Mutex::new(HashMap::new())),
            },
            rx,
        )
    }

    /// Take ownership of `child` and report its exit
    pub fn watch(&self, program: Program, pid: u32, mut child: Child) {
        self.lock().insert(pid, true);

        let watched = self.watched.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let status = child.wait().await;
            let reason = ExitReason::from_status(&status);
            let code = status.as_ref().ok().and_then(ExitStatus::code);

            let reported = watched
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&pid)
                .unwrap_or(false);

            if !reported {
                debug!(program = %program, pid, ?reason, "Unwatched process exited");
                return;
            }

            let event = WatchEvent {
                program,
                pid,
                reason,
                code,
                exited_at: Utc::now(),
            };

            if events.send(event).await.is_err() {
                warn!(pid, "Watch event dropped: dispatcher has shut down");
            }
        });
    }

    /// Stop reporting `pid`; returns whether it was being watched
    pub fn unwatch(&self, pid: u32) -> bool {
        self.lock()
            .get_mut(&pid)
            .map(|reported| std::mem::replace(reported, false))
            .unwrap_or(false)
    }

    /// Report `pid` again after an [`unwatch`](Self::unwatch).
    ///
    /// Returns false when the child has already exited.
    pub fn rewatch(&self, pid: u32) -> bool {
        match self.lock().get_mut(&pid) {
            Some(reported) => {
                *reported = true;
                true
            }
            None => false,
        }
    }

    pub fn is_watched(&self, pid: u32) -> bool {
        self.lock().get(&pid).copied().unwrap_or(false)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, bool>> {
        self.watched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
