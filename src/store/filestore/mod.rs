//! File-backed message store: one append-only partition per topic root.

mod files;
mod index_list;
mod partition;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

pub use index_list::{IndexEntry, IndexList, SearchOutcome};
pub use partition::{MessagePartition, PartitionConfig};

use super::{FetchRequest, MessageStore, StoreError};

/// Message store backed by per-partition log and index files under a
/// single directory. Partitions are opened lazily and kept for the life
/// of the store.
pub struct FileMessageStore {
    dir: PathBuf,
    node_id: u8,
    config: PartitionConfig,
    partitions: RwLock<HashMap<String, Arc<MessagePartition>>>,
}

impl FileMessageStore {
    pub fn open(dir: PathBuf, node_id: u8, config: PartitionConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: Some(dir.clone()),
            source,
        })?;
        Ok(Self {
            dir,
            node_id,
            config,
            partitions: RwLock::new(HashMap::new()),
        })
    }

    pub fn partition(&self, name: &str) -> Result<Arc<MessagePartition>, StoreError> {
        validate_partition_name(name)?;
        {
            let partitions = self.partitions.read().expect("partition map lock poisoned");
            if let Some(partition) = partitions.get(name) {
                return Ok(Arc::clone(partition));
            }
        }

        let mut partitions = self.partitions.write().expect("partition map lock poisoned");
        // A racing opener may have won the write lock first.
        if let Some(partition) = partitions.get(name) {
            return Ok(Arc::clone(partition));
        }
        let partition = Arc::new(MessagePartition::open(
            self.dir.clone(),
            name,
            self.config,
        )?);
        partitions.insert(name.to_string(), Arc::clone(&partition));
        Ok(partition)
    }
}

impl MessageStore for FileMessageStore {
    fn store(&self, partition: &str, id: u64, message: &[u8]) -> Result<(), StoreError> {
        self.partition(partition)?.store(id, message)
    }

    fn generate_next_id(&self, partition: &str, time: i64) -> Result<u64, StoreError> {
        Ok(self.partition(partition)?.generate_next_id(self.node_id, time))
    }

    fn max_message_id(&self, partition: &str) -> Result<u64, StoreError> {
        Ok(self.partition(partition)?.max_message_id())
    }

    fn fetch(&self, request: FetchRequest) {
        match self.partition(&request.partition) {
            Ok(partition) => partition.fetch(request),
            Err(err) => request.fail(err),
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        let meta = std::fs::metadata(&self.dir).map_err(|source| StoreError::Io {
            path: Some(self.dir.clone()),
            source,
        })?;
        if !meta.is_dir() {
            return Err(StoreError::Io {
                path: Some(self.dir.clone()),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotADirectory,
                    "store path is not a directory",
                ),
            });
        }
        Ok(())
    }
}

fn validate_partition_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() {
        return Err(StoreError::InvalidPartition {
            raw: name.to_string(),
            reason: "empty",
        });
    }
    if name.contains(['/', '\\', '.']) {
        return Err(StoreError::InvalidPartition {
            raw: name.to_string(),
            reason: "contains path characters",
        });
    }
    Ok(())
}
