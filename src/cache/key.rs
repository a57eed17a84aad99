//! Exact cache key generation.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::types::ChatRequest;

/// Builds the exact-cache key for a request: a sha256 over the model id,
/// temperature, top-p and the ordered role:text pairs. Canonicalization
/// goes through a `BTreeMap` so field insertion order can never change
/// the hash.
#[derive(Debug, Clone, Default)]
pub struct CacheKeyBuilder {
    prefix: Option<String>,
    salt: Option<String>,
}

impl CacheKeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespace keys per client so invalidation of one name cannot be
    /// confused with another's entries.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn build(&self, model: &str, request: &ChatRequest) -> String {
        let mut parts: BTreeMap<&str, String> = BTreeMap::new();
        parts.insert("model", model.to_string());
        if let Some(t) = request.options.temperature {
            parts.insert("temperature", format!("{:.2}", t));
        }
        if let Some(p) = request.options.top_p {
            parts.insert("top_p", format!("{:.2}", p));
        }
        let messages: Vec<String> = request
            .messages
            .iter()
            .map(|m| format!("{}:{}", m.role, m.content))
            .collect();
        parts.insert("messages", messages.join("\u{1f}"));
        if let Some(ref s) = self.salt {
            parts.insert("salt", s.clone());
        }

        let mut hasher = Sha256::new();
        for (k, v) in &parts {
            hasher.update(k.as_bytes());
            hasher.update([0u8]);
            hasher.update(v.as_bytes());
            hasher.update([0u8]);
        }
        let hash: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();

        match &self.prefix {
            Some(p) => format!("{}:{}", p, hash),
            None => hash,
        }
    }
}
