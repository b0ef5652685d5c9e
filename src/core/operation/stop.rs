use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Operation, OperationContext};
use crate::adapters::ProcessError;
use crate::domain::Program;

/// Stops the program's recorded process, if any
pub struct StopOperation {
    ctx: Arc<OperationContext>,
    program: Program,
}

impl StopOperation {
    pub fn new(ctx: Arc<OperationContext>, program: Program) -> Self {
        Self { ctx, program }
    }
}

#[async_trait]
impl Operation for StopOperation {
    fn name(&self) -> &'static str {
        "stop"
    }

    async fn check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn run(&self) -> Result<()> {
        let Some(record) = self.ctx.reattach.find(self.program.id())? else {
            debug!(program = %self.program, "Not running, nothing to stop");
            return Ok(());
        };

        let pid = record.pid;

        // Unwatch first so the deliberate kill is not reported as a crash
        let was_watched = self.ctx.watcher.unwatch(pid);

        match self.ctx.launcher.stop(pid).await {
            Ok(()) => {}
            Err(ProcessError::NotFound(_)) => {
                debug!(program = %self.program, pid, "Process already gone");
            }
            // Still alive: its exit must reach crash handling again
            Err(e) if !was_watched || self.ctx.watcher.rewatch(pid) => {
                return Err(e).with_context(|| format!("Failed to stop process {}", pid));
            }
            Err(e) => {
                warn!(program = %self.program, pid, error = %e, "Stop failed but the process exited");
            }
        }

        self.ctx.clients.remove(self.program.id());
        self.ctx.reattach.remove_process(pid)?;

        let config_file = self.ctx.config_file_path(self.program.id());
        match tokio::fs::remove_file(&config_file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to delete config file: {}", config_file.display())
                });
            }
        }

        info!(program = %self.program, pid, "Program stopped");
        Ok(())
    }
}
