//! Remote configuration clients, one per running grpc-configurable process.
//!
//! The transport itself lives behind [`ConnectionProvider`]; the registry only
//! tracks which client belongs to which execution context.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use super::retry::Backoff;
use crate::adapters::Credentials;

/// Errors returned by configuration clients
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Client not found for {0}")]
    NotFound(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("Configuration rejected: {0}")]
    Rejected(String),

    #[error("Failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },
}

impl ClientError {
    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_))
    }
}

/// Pushes configuration to one process
#[async_trait]
pub trait ConfigClient: Send + Sync {
    async fn config(&self, yaml: &str) -> Result<(), ClientError>;

    /// Client-specific backoff; the retry policy's own delays otherwise
    fn backoff(&self) -> Option<Arc<dyn Backoff>> {
        None
    }
}

/// Where and how to reach a process
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub address: String,
    pub credentials: Option<Credentials>,
}

/// Opens configuration clients
pub trait ConnectionProvider: Send + Sync {
    fn connect(&self, program_id: &str, endpoint: &Endpoint)
        -> Result<Arc<dyn ConfigClient>, ClientError>;
}

/// Provider used when no transport is wired in.
///
/// Connecting succeeds so processes can start, but every push fails fatally.
#[derive(Debug, Default)]
pub struct UnavailableProvider;

struct UnavailableClient {
    address: String,
}

#[async_trait]
impl ConfigClient for UnavailableClient {
    async fn config(&self, _yaml: &str) -> Result<(), ClientError> {
        Err(ClientError::Rejected(format!(
            "no configuration transport for {}",
            self.address
        )))
    }
}

impl ConnectionProvider for UnavailableProvider {
    fn connect(
        &self,
        _program_id: &str,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn ConfigClient>, ClientError> {
        Ok(Arc::new(UnavailableClient {
            address: endpoint.address.clone(),
        }))
    }
}

/// Clients keyed by execution context id
pub struct ClientRegistry {
    provider: Arc<dyn ConnectionProvider>,
    clients: RwLock<HashMap<String, Arc<dyn ConfigClient>>>,
}

impl ClientRegistry {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            provider,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Connect to `endpoint` and replace any client registered for `id`
    pub fn update_client(&self, id: &str, endpoint: &Endpoint) -> Result<(), ClientError> {
        let client = self.provider.connect(id, endpoint)?;
        self.clients
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.to_string(), client);
        debug!(program = id, address = %endpoint.address, "Client registered");
        Ok(())
    }

    pub fn get_client(&self, id: &str) -> Result<Arc<dyn ConfigClient>, ClientError> {
        self.clients
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(id.to_string()))
    }

    /// Drop the client for `id`; returns whether one was registered
    pub fn remove(&self, id: &str) -> bool {
        self.clients
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id)
            .is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(id)
    }
}
