//! Key-value persistence for subscriber metadata.
//!
//! Entries are keyed `<schema>:<key>`; each module that persists through
//! the KV store owns one schema.

use std::collections::BTreeMap;
use std::sync::RwLock;

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KvError {
    #[error("kv backend error: {reason}")]
    Backend { reason: String },
}

pub trait KvStore: Send + Sync {
    fn put(&self, schema: &str, key: &str, value: &[u8]) -> Result<(), KvError>;
    fn get(&self, schema: &str, key: &str) -> Result<Option<Vec<u8>>, KvError>;
    fn delete(&self, schema: &str, key: &str) -> Result<(), KvError>;
    /// All `(key, value)` pairs under a schema.
    fn entries(&self, schema: &str) -> Result<Vec<(String, Vec<u8>)>, KvError>;
    fn check(&self) -> Result<(), KvError>;
}

/// In-memory KV store, suitable for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryKvStore {
    state: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn composite_key(schema: &str, key: &str) -> String {
    format!("{schema}:{key}")
}

impl KvStore for MemoryKvStore {
    fn put(&self, schema: &str, key: &str, value: &[u8]) -> Result<(), KvError> {
        let mut state = self.state.write().expect("kv store lock poisoned");
        state.insert(composite_key(schema, key), value.to_vec());
        Ok(())
    }

    fn get(&self, schema: &str, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let state = self.state.read().expect("kv store lock poisoned");
        Ok(state.get(&composite_key(schema, key)).cloned())
    }

    fn delete(&self, schema: &str, key: &str) -> Result<(), KvError> {
        let mut state = self.state.write().expect("kv store lock poisoned");
        state.remove(&composite_key(schema, key));
        Ok(())
    }

    fn entries(&self, schema: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let prefix = format!("{schema}:");
        let state = self.state.read().expect("kv store lock poisoned");
        Ok(state
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k[prefix.len()..].to_string(), v.clone()))
            .collect())
    }

    fn check(&self) -> Result<(), KvError> {
        Ok(())
    }
}
