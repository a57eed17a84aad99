//! Storage collaborator seams.
//!
//! The gateway consumes three external storage capabilities: a distributed
//! key-value cache (cache + rate-limit layers), a usage/cost record store
//! and an audit-log store. Each is a trait so deployments can plug Redis,
//! SQL or whatever they run; the in-memory implementations
//! ([`MemoryKvStore`], [`MemoryUsageStore`], [`MemoryAuditStore`]) back
//! tests and single-process setups.

mod memory;

pub use memory::{MemoryAuditStore, MemoryKvStore, MemoryUsageStore};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

use crate::types::UsageRecord;
use crate::Result;

/// Distributed key-value cache with per-entry TTL.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;
    fn name(&self) -> &'static str;
}

/// Usage/cost record store.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Persist a newly opened (`Running`) record.
    async fn record_start(&self, record: &UsageRecord) -> Result<()>;
    /// Persist the terminal state of a record previously opened with
    /// [`record_start`](Self::record_start).
    async fn record_completion(&self, record: &UsageRecord) -> Result<()>;
    async fn query_by_user(
        &self,
        user: &str,
        from: SystemTime,
        to: SystemTime,
    ) -> Result<Vec<UsageRecord>>;
}

/// One audit-log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub trace_id: String,
    pub client: String,
    pub model: String,
    pub user: String,
    pub input_preview: String,
    pub output_preview: String,
    pub success: bool,
    pub error: Option<String>,
    pub created_at: SystemTime,
}

/// Audit-log store.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn save(&self, record: &AuditRecord) -> Result<()>;
    async fn query_by_trace(&self, trace_id: &str) -> Result<Vec<AuditRecord>>;
}
