//! Entity store interface
//!
//! The coordinator only ever reads through `get_snapshot`; API handlers
//! write through `create`/`update`/`delete`. Implementations must return
//! snapshots that are isolated from concurrent writes.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;
use crate::model::{Certificate, Entity, EntityDraft, EntityId, EntityKind, ProxyHost, Upstream};

/// Per-kind revision counters. Each committed write bumps the counter of
/// every kind it touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VersionVector {
    pub proxy_hosts: u64,
    pub certificates: u64,
    pub upstreams: u64,
    pub upstream_servers: u64,
}

impl VersionVector {
    /// Logical timestamp of the store state, used to tag apply intents.
    /// Monotonic because every component is.
    pub fn logical_time(&self) -> u64 {
        self.proxy_hosts + self.certificates + self.upstreams + self.upstream_servers
    }
}

/// Point-in-time consistent view of every entity
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub proxy_hosts: Vec<ProxyHost>,
    pub certificates: Vec<Certificate>,
    /// Upstreams with their servers attached
    pub upstreams: Vec<Upstream>,
    pub versions: VersionVector,
}

impl Snapshot {
    pub fn certificate(&self, id: EntityId) -> Option<&Certificate> {
        self.certificates.iter().find(|c| c.id == id)
    }

    pub fn revision(&self) -> u64 {
        self.versions.logical_time()
    }
}

/// Result of a committed write, with the store revision it produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Committed<T> {
    pub value: T,
    pub revision: u64,
}

pub trait EntityStore: Send + Sync {
    /// Consistent view of all entities and the version vector they belong to
    fn get_snapshot(&self) -> Result<Snapshot, StoreError>;

    fn get(&self, kind: EntityKind, id: EntityId) -> Result<Entity, StoreError>;

    fn list(&self, kind: EntityKind) -> Result<Vec<Entity>, StoreError>;

    fn create(&self, draft: EntityDraft) -> Result<Committed<Entity>, StoreError>;

    /// Replace the entity `id` of the draft's kind
    fn update(&self, id: EntityId, draft: EntityDraft) -> Result<Committed<Entity>, StoreError>;

    fn delete(&self, kind: EntityKind, id: EntityId) -> Result<Committed<()>, StoreError>;

    /// Current logical timestamp
    fn revision(&self) -> Result<u64, StoreError>;

    /// Move every active certificate with `expires_at <= now` to expired.
    /// Returns the ids that changed.
    fn expire_certificates(&self, now: DateTime<Utc>)
        -> Result<Committed<Vec<EntityId>>, StoreError>;
}
