//! Directory collaborator: shard ownership and server endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{ServerId, ShardId};

/// Cluster directory consumed by the destination resolver.
///
/// # Responsibilities
///
/// 1. **Shard ownership**: which server is currently responsible for a shard
/// 2. **Endpoint lookup**: which network endpoint a server listens on
///
/// Both lookups may be served from a cache; a stale answer surfaces as a
/// connection failure that the batch coordinator retries.
pub trait Directory: Send + Sync + 'static {
    /// Server currently responsible for `shard`.
    fn responsible_server(&self, shard: &str) -> Option<ServerId>;

    /// Endpoint of `server`, e.g. `tcp://10.0.0.1:8529`.
    fn server_endpoint(&self, server: &str) -> Option<String>;
}

impl<D: Directory + ?Sized> Directory for Arc<D> {
    fn responsible_server(&self, shard: &str) -> Option<ServerId> {
        (**self).responsible_server(shard)
    }

    fn server_endpoint(&self, server: &str) -> Option<String> {
        (**self).server_endpoint(server)
    }
}

/// In-memory directory.
///
/// ```text
/// ┌─────────────────────────────────────┐
/// │ StaticDirectory                     │
/// │  owners:    ShardId  → ServerId     │
/// │  endpoints: ServerId → endpoint     │
/// └─────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use shardcomm_core::{Directory, StaticDirectory};
///
/// let directory = StaticDirectory::new();
/// directory.assign_shard("s1", "dbserver-1");
/// directory.set_endpoint("dbserver-1", "tcp://h:1");
///
/// assert_eq!(directory.responsible_server("s1").as_deref(), Some("dbserver-1"));
/// assert_eq!(directory.server_endpoint("dbserver-1").as_deref(), Some("tcp://h:1"));
/// ```
#[derive(Debug, Default)]
pub struct StaticDirectory {
    owners: RwLock<HashMap<ShardId, ServerId>>,
    endpoints: RwLock<HashMap<ServerId, String>>,
}

impl StaticDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `server` responsible for `shard`, replacing any previous owner.
    pub fn assign_shard(&self, shard: impl Into<ShardId>, server: impl Into<ServerId>) {
        self.owners.write().insert(shard.into(), server.into());
    }

    /// Forget the owner of `shard`.
    pub fn unassign_shard(&self, shard: &str) -> Option<ServerId> {
        self.owners.write().remove(shard)
    }

    /// Record the endpoint of `server`.
    pub fn set_endpoint(&self, server: impl Into<ServerId>, endpoint: impl Into<String>) {
        self.endpoints.write().insert(server.into(), endpoint.into());
    }

    /// Forget the endpoint of `server`.
    pub fn remove_endpoint(&self, server: &str) -> Option<String> {
        self.endpoints.write().remove(server)
    }
}

impl Directory for StaticDirectory {
    fn responsible_server(&self, shard: &str) -> Option<ServerId> {
        self.owners.read().get(shard).cloned()
    }

    fn server_endpoint(&self, server: &str) -> Option<String> {
        self.endpoints
            .read()
            .get(server)
            .filter(|endpoint| !endpoint.is_empty())
            .cloned()
    }
}
