use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::{Operation, OperationContext};
use crate::domain::Program;

/// Installs the downloaded artifact into the program's directory
pub struct InstallOperation {
    ctx: Arc<OperationContext>,
    program: Program,
}

impl InstallOperation {
    pub fn new(ctx: Arc<OperationContext>, program: Program) -> Self {
        Self { ctx, program }
    }
}

#[async_trait]
impl Operation for InstallOperation {
    fn name(&self) -> &'static str {
        "install"
    }

    async fn check(&self) -> Result<bool> {
        Ok(!tokio::fs::try_exists(self.program.directory()).await?)
    }

    async fn run(&self) -> Result<()> {
        self.ctx
            .installer
            .install(
                self.program.binary_name(),
                self.program.version(),
                &self.program.directory(),
            )
            .await
    }
}
