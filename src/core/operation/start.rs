use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use super::{Operation, OperationContext};
use crate::adapters::{Credentials, LaunchRequest, ProcessError};
use crate::core::clients::Endpoint;
use crate::core::reattach::ReattachInfo;
use crate::domain::{with_config_arg, Configurable, Program};

/// Spawns the program and records it for reattachment.
///
/// Any failure after the spawn rolls back everything done so far, so a
/// failed start leaves no record and no running process.
pub struct StartOperation {
    ctx: Arc<OperationContext>,
    program: Program,
}

impl StartOperation {
    pub fn new(ctx: Arc<OperationContext>, program: Program) -> Self {
        Self { ctx, program }
    }

    async fn write_config_file(&self) -> Result<PathBuf> {
        let path = self.ctx.config_file_path(self.program.id());
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }

        let content = serde_yaml::to_string(self.program.config())
            .context("Failed to serialize program configuration")?;
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(path)
    }

    /// Register the client and the reattach record for a spawned process
    fn register(
        &self,
        pid: u32,
        address: &str,
        configurable: Configurable,
        credentials: Option<Credentials>,
    ) -> Result<()> {
        if configurable == Configurable::Grpc {
            self.ctx
                .clients
                .update_client(
                    self.program.id(),
                    &Endpoint {
                        address: address.to_string(),
                        credentials,
                    },
                )
                .context("Failed to connect configuration client")?;
        }

        self.ctx
            .reattach
            .add_process(ReattachInfo {
                execution_context: self.program.context().clone(),
                network_address: address.to_string(),
                pid,
            })
            .context("Failed to persist reattach record")?;

        Ok(())
    }

    async fn rollback(&self, pid: u32, config_file: Option<&Path>) {
        warn!(program = %self.program, pid, "Rolling back failed start");

        self.ctx.watcher.unwatch(pid);
        match self.ctx.launcher.stop(pid).await {
            Ok(()) | Err(ProcessError::NotFound(_)) => {}
            Err(e) => warn!(pid, error = %e, "Failed to stop process during rollback"),
        }
        self.ctx.clients.remove(self.program.id());
        if let Err(e) = self.ctx.reattach.remove_process(pid) {
            warn!(pid, error = %e, "Failed to remove reattach record during rollback");
        }
        if let Some(path) = config_file {
            remove_config_file(path).await;
        }
    }
}

#[async_trait]
impl Operation for StartOperation {
    fn name(&self) -> &'static str {
        "start"
    }

    async fn check(&self) -> Result<bool> {
        Ok(!self.ctx.reattach.contains(self.program.id())?)
    }

    async fn run(&self) -> Result<()> {
        let spec = self.program.spec()?;
        let configurable = spec.configurable;

        let credentials = if configurable == Configurable::Grpc {
            Some(self.ctx.credentials.issue(self.program.id())?)
        } else {
            None
        };

        let (config_file, args) = if configurable == Configurable::File {
            let path = self.write_config_file().await?;
            let args = with_config_arg(&spec.args, &path);
            (Some(path), args)
        } else {
            (None, spec.args.clone())
        };

        let (uid, gid) = binary_owner(&spec.binary_path);
        let directory = self.program.directory();

        let launched = self
            .ctx
            .launcher
            .start(LaunchRequest {
                program_id: self.program.id(),
                spec,
                args,
                working_dir: &directory,
                uid,
                gid,
                credentials: credentials.as_ref(),
            })
            .await;

        let process = match launched {
            Ok(process) => process,
            Err(e) => {
                if let Some(path) = &config_file {
                    remove_config_file(path).await;
                }
                return Err(e.into());
            }
        };

        let pid = process.pid;
        self.ctx
            .watcher
            .watch(self.program.clone(), pid, process.child);

        if let Err(e) = self.register(pid, &process.address, configurable, credentials) {
            self.rollback(pid, config_file.as_deref()).await;
            return Err(e);
        }

        info!(program = %self.program, pid, address = %process.address, "Program started");
        Ok(())
    }
}

async fn remove_config_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete config file"),
    }
}

/// User and group the child should run as.
///
/// Only a root operator can switch users; it then runs each child as the
/// owner of its binary.
#[cfg(unix)]
fn binary_owner(binary: &Path) -> (Option<u32>, Option<u32>) {
    use std::os::unix::fs::MetadataExt;

    let running_as_root = std::fs::metadata("/proc/self")
        .map(|meta| meta.uid() == 0)
        .unwrap_or(false);
    if !running_as_root {
        return (None, None);
    }

    match std::fs::metadata(binary) {
        Ok(meta) if meta.uid() != 0 => (Some(meta.uid()), Some(meta.gid())),
        _ => (None, None),
    }
}

#[cfg(not(unix))]
fn binary_owner(_binary: &Path) -> (Option<u32>, Option<u32>) {
    (None, None)
}
