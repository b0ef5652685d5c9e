use anyhow::Result;
use async_trait::async_trait;

use super::Operation;

/// Artifact verification.
///
/// Signature checking is not performed; the step only keeps its place in the
/// start flow.
#[derive(Debug, Default)]
pub struct VerifyOperation;

#[async_trait]
impl Operation for VerifyOperation {
    fn name(&self) -> &'static str {
        "verify"
    }

    async fn check(&self) -> Result<bool> {
        Ok(false)
    }

    async fn run(&self) -> Result<()> {
        Ok(())
    }
}
