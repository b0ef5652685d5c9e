//! Lifecycle operations.
//!
//! An operation first reports whether it needs to run (`check`) and then
//! performs its work (`run`). Flows are ordered lists of operations built
//! fresh for each invocation.

mod config;
mod fetch;
mod install;
mod remove;
mod start;
mod stop;
mod verify;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::adapters::{CredentialIssuer, Downloader, Installer, ProcessLauncher};
use crate::config::OperatorConfig;

use super::clients::ClientRegistry;
use super::reattach::ReattachCollection;
use super::watcher::ProcessWatcher;

pub use config::ConfigOperation;
pub use fetch::FetchOperation;
pub use install::InstallOperation;
pub use remove::RemoveOperation;
pub use start::StartOperation;
pub use stop::StopOperation;
pub use verify::VerifyOperation;

/// One step of a lifecycle flow
#[async_trait]
pub trait Operation: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `run` is needed
    async fn check(&self) -> Result<bool>;

    async fn run(&self) -> Result<()>;
}

/// Ordered operations executed by the operator
pub type Flow = Vec<Box<dyn Operation>>;

/// Collaborators and settings shared by every operation
pub struct OperationContext {
    pub config: OperatorConfig,
    pub reattach: ReattachCollection,
    pub clients: ClientRegistry,
    pub watcher: ProcessWatcher,
    pub downloader: Arc<dyn Downloader>,
    pub installer: Arc<dyn Installer>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub credentials: Arc<dyn CredentialIssuer>,
}

impl OperationContext {
    /// Generated configuration file for a file-configured program
    pub fn config_file_path(&self, program_id: &str) -> PathBuf {
        self.config.config_dir.join(format!("{}.yml", program_id))
    }
}
