use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::{Operation, OperationContext};
use crate::core::retry::{retry, retry_with_backoff, RetryError};
use crate::domain::{Configurable, Program};

/// Pushes the program's configuration over its remote client.
///
/// Transient client failures are retried under the operator's retry policy;
/// anything else ends the push immediately.
pub struct ConfigOperation {
    ctx: Arc<OperationContext>,
    program: Program,
}

impl ConfigOperation {
    pub fn new(ctx: Arc<OperationContext>, program: Program) -> Self {
        Self { ctx, program }
    }
}

#[async_trait]
impl Operation for ConfigOperation {
    fn name(&self) -> &'static str {
        "config"
    }

    async fn check(&self) -> Result<bool> {
        Ok(self.program.configurable()? == Configurable::Grpc)
    }

    async fn run(&self) -> Result<()> {
        let yaml = serde_yaml::to_string(self.program.config())
            .context("Failed to serialize program configuration")?;
        let client = self.ctx.clients.get_client(self.program.id())?;

        let push = |attempt: u32| {
            let client = client.clone();
            let yaml = yaml.as_str();
            async move {
                client.config(yaml).await.map_err(|e| {
                    if e.is_transient() {
                        RetryError::transient(e)
                    } else {
                        RetryError::fatal(e)
                    }
                })?;
                Ok::<u32, RetryError>(attempt)
            }
        };

        let policy = &self.ctx.config.retry;
        let attempts = match client.backoff() {
            Some(backoff) => retry_with_backoff(policy, backoff.as_ref(), push).await,
            None => retry(policy, push).await,
        }?;

        info!(program = %self.program, attempts, "Configuration pushed");
        Ok(())
    }
}
