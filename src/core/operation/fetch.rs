use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::{Operation, OperationContext};
use crate::domain::Program;

/// Downloads the program's artifact unless it is already present
pub struct FetchOperation {
    ctx: Arc<OperationContext>,
    program: Program,
}

impl FetchOperation {
    pub fn new(ctx: Arc<OperationContext>, program: Program) -> Self {
        Self { ctx, program }
    }
}

#[async_trait]
impl Operation for FetchOperation {
    fn name(&self) -> &'static str {
        "fetch"
    }

    async fn check(&self) -> Result<bool> {
        let path = self
            .ctx
            .config
            .download
            .artifact_path(self.program.binary_name(), self.program.version());

        let present = tokio::fs::try_exists(&path).await?;
        if present {
            debug!(program = %self.program, path = %path.display(), "Artifact already downloaded");
        }
        Ok(!present)
    }

    async fn run(&self) -> Result<()> {
        self.ctx
            .downloader
            .download(self.program.binary_name(), self.program.version())
            .await?;
        Ok(())
    }
}
