use anyhow::Result;
use async_trait::async_trait;

use super::Operation;

/// Final step of the remove flow; installed files are left in place
#[derive(Debug, Default)]
pub struct RemoveOperation;

#[async_trait]
impl Operation for RemoveOperation {
    fn name(&self) -> &'static str {
        "remove"
    }

    async fn check(&self) -> Result<bool> {
        Ok(false)
    }

    async fn run(&self) -> Result<()> {
        Ok(())
    }
}
