//! In-memory store implementations.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};

use super::{AuditRecord, AuditStore, KvStore, UsageStore};
use crate::types::UsageRecord;
use crate::Result;

#[derive(Clone)]
struct KvEntry {
    data: Vec<u8>,
    created_at: Instant,
    ttl: Duration,
}

impl KvEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

/// Process-local [`KvStore`] with TTL expiry and a size cap.
pub struct MemoryKvStore {
    entries: Arc<RwLock<HashMap<String, KvEntry>>>,
    max_entries: usize,
}

impl MemoryKvStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_entries,
        }
    }

    /// Drop every entry. Not part of the [`KvStore`] seam; used by tests
    /// and local cache invalidation.
    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap()
            .values()
            .filter(|e| !e.is_expired())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_if_needed(&self, entries: &mut HashMap<String, KvEntry>) {
        entries.retain(|_, e| !e.is_expired());
        while entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone());
            if let Some(k) = oldest {
                entries.remove(&k);
            } else {
                break;
            }
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.get(key) {
            if entry.is_expired() {
                entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.data.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        self.evict_if_needed(&mut entries);
        entries.insert(
            key.to_string(),
            KvEntry {
                data: value.to_vec(),
                created_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().unwrap().remove(key).is_some())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Process-local [`UsageStore`] keyed by record id.
#[derive(Default)]
pub struct MemoryUsageStore {
    records: Arc<RwLock<HashMap<String, UsageRecord>>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<UsageRecord> {
        self.records.read().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn record_start(&self, record: &UsageRecord) -> Result<()> {
        self.records
            .write()
            .unwrap()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn record_completion(&self, record: &UsageRecord) -> Result<()> {
        self.records
            .write()
            .unwrap()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn query_by_user(
        &self,
        user: &str,
        from: SystemTime,
        to: SystemTime,
    ) -> Result<Vec<UsageRecord>> {
        Ok(self
            .records
            .read()
            .unwrap()
            .values()
            .filter(|r| r.user == user && r.started_at >= from && r.started_at <= to)
            .cloned()
            .collect())
    }
}

/// Process-local [`AuditStore`].
#[derive(Default)]
pub struct MemoryAuditStore {
    records: Arc<RwLock<Vec<AuditRecord>>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn save(&self, record: &AuditRecord) -> Result<()> {
        self.records.write().unwrap().push(record.clone());
        Ok(())
    }

    async fn query_by_trace(&self, trace_id: &str) -> Result<Vec<AuditRecord>> {
        Ok(self
            .records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.trace_id == trace_id)
            .cloned()
            .collect())
    }
}
