//! Append-only message partition: rotation, id assignment, fetch engine.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::files::{
    index_file_name, log_file_name, parse_index_file_id, read_index_file, IndexWriter, LogReader,
    LogWriter,
};
use super::index_list::{IndexEntry, IndexList};
use crate::store::{FetchRequest, FetchedMessage, StoreError};

/// Low 56 bits of a message id carry the per-partition sequence; the top
/// byte carries the originating node.
const SEQ_MASK: u64 = (1 << 56) - 1;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Rotate when the active log file would exceed this size.
    pub max_file_bytes: u64,
    /// Rotate when the active file already holds this many records.
    pub max_file_records: u64,
    /// How many sealed index lists to keep in memory for fetches.
    pub index_cache_files: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 256 * 1024 * 1024,
            max_file_records: 1_000_000,
            index_cache_files: 8,
        }
    }
}

struct Writer {
    log: LogWriter,
    index: IndexWriter,
    file_id: u64,
}

struct View {
    file_id: u64,
    active: Arc<IndexList>,
}

/// One partition of the file-backed message store.
///
/// A single writer appends under the writer lock; any number of readers
/// fetch concurrently against index snapshots. A message becomes visible
/// to fetches only once its entry is in the in-memory index list.
pub struct MessagePartition {
    name: String,
    dir: PathBuf,
    config: PartitionConfig,
    writer: Mutex<Writer>,
    view: RwLock<View>,
    sealed: Mutex<SealedIndexCache>,
    max_id: AtomicU64,
    next_seq: AtomicU64,
}

impl MessagePartition {
    /// Open a partition in `dir`, resuming from existing files when present.
    pub fn open(dir: PathBuf, name: &str, config: PartitionConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: Some(dir.clone()),
            source,
        })?;

        let file_id = newest_file_id(&dir, name)?.unwrap_or(0);
        let log = LogWriter::open(dir.join(log_file_name(name, file_id)))?;
        let index = IndexWriter::open(dir.join(index_file_name(name, file_id)))?;
        let active = read_index_file(&dir.join(index_file_name(name, file_id)), file_id)?;
        let max_id = active.back().map(|entry| entry.id).unwrap_or(0);

        Ok(Self {
            name: name.to_string(),
            dir,
            config,
            writer: Mutex::new(Writer {
                log,
                index,
                file_id,
            }),
            view: RwLock::new(View {
                file_id,
                active: Arc::new(active),
            }),
            sealed: Mutex::new(SealedIndexCache::new(config.index_cache_files)),
            max_id: AtomicU64::new(max_id),
            next_seq: AtomicU64::new(max_id & SEQ_MASK),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Highest stored id, or 0 when the partition is empty.
    pub fn max_message_id(&self) -> u64 {
        self.max_id.load(Ordering::Acquire)
    }

    /// Reserve the next id. The top byte embeds the node id so ids from
    /// different nodes are globally unique while staying monotonic within
    /// a node's partition.
    pub fn generate_next_id(&self, node_id: u8, _time: i64) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel) + 1;
        (u64::from(node_id) << 56) | (seq & SEQ_MASK)
    }

    /// Append one message. `id` must be strictly greater than every id
    /// already stored.
    pub fn store(&self, id: u64, message: &[u8]) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().expect("partition writer lock poisoned");

        let max = self.max_id.load(Ordering::Acquire);
        if id <= max && max != 0 {
            return Err(StoreError::DuplicateId { id, max });
        }

        if self.should_rotate(&writer, message.len()) {
            self.rotate(&mut writer)
                .map_err(|source| StoreError::StoreFull {
                    partition: self.name.clone(),
                    source: Box::new(source),
                })?;
        }

        let (offset, size) = writer.log.append(message)?;
        let entry = IndexEntry {
            id,
            file_id: writer.file_id,
            offset,
            size,
        };
        writer.index.append(&entry)?;
        self.view
            .read()
            .expect("partition view lock poisoned")
            .active
            .insert([entry]);
        self.max_id.store(id, Ordering::Release);
        self.next_seq
            .fetch_max(id & SEQ_MASK, Ordering::AcqRel);
        Ok(())
    }

    /// Answer a fetch request on its channels from a dedicated thread.
    pub fn fetch(self: &Arc<Self>, request: FetchRequest) {
        let partition = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("fetch-{}", self.name))
            .spawn(move || partition.run_fetch(request));
        if let Err(source) = spawned {
            tracing::error!(partition = %self.name, %source, "fetch thread spawn failed");
        }
    }

    fn run_fetch(&self, request: FetchRequest) {
        let entries = match self.fetch_entries(&request) {
            Ok(entries) => entries,
            Err(err) => {
                request.fail(err);
                return;
            }
        };

        if request.start_tx.send(entries.len()).is_err() {
            return;
        }

        let mut readers: HashMap<u64, LogReader> = HashMap::new();
        for entry in entries {
            let reader = match readers.entry(entry.file_id) {
                std::collections::hash_map::Entry::Occupied(occupied) => occupied.into_mut(),
                std::collections::hash_map::Entry::Vacant(vacant) => {
                    let path = self.dir.join(log_file_name(&self.name, entry.file_id));
                    match LogReader::open(path) {
                        Ok(reader) => vacant.insert(reader),
                        Err(err) => {
                            request.fail(err);
                            return;
                        }
                    }
                }
            };
            let payload = match reader.read_payload(entry.offset, entry.size) {
                Ok(payload) => payload,
                Err(err) => {
                    request.fail(err);
                    return;
                }
            };
            let fetched = FetchedMessage {
                id: entry.id,
                message: Bytes::from(payload),
            };
            // A dropped receiver cancels the fetch.
            if request.message_tx.send(fetched).is_err() {
                return;
            }
        }
    }

    /// Resolve the entries a request reaches, merging sealed index files
    /// with the active in-memory list.
    fn fetch_entries(&self, request: &FetchRequest) -> Result<Vec<IndexEntry>, StoreError> {
        let (active_file_id, active) = {
            let view = self.view.read().expect("partition view lock poisoned");
            (view.file_id, Arc::clone(&view.active))
        };

        let forward = request.direction >= 0;
        let merged = IndexList::new();
        let mut reachable = 0usize;

        let mut file_ids: Vec<u64> = (0..active_file_id).collect();
        if !forward {
            file_ids.reverse();
        }
        let sealed_lists = file_ids.into_iter().map(|file_id| (file_id, None));
        let all_files = if forward {
            let mut files: Vec<(u64, Option<Arc<IndexList>>)> = sealed_lists.collect();
            files.push((active_file_id, Some(Arc::clone(&active))));
            files
        } else {
            let mut files = vec![(active_file_id, Some(active))];
            files.extend(sealed_lists);
            files
        };

        for (file_id, known) in all_files {
            if reachable >= request.count {
                break;
            }
            let list = match known {
                Some(list) => list,
                None => self.sealed_list(file_id)?,
            };
            let (Some(front), Some(back)) = (list.front(), list.back()) else {
                continue;
            };
            if forward && back.id < request.start_id {
                continue;
            }
            if !forward && front.id > request.start_id {
                continue;
            }
            reachable += reachable_in(&list, request.start_id, forward);
            merged.insert_list(&list);
        }

        Ok(merged.extract(request.start_id, request.direction, request.count))
    }

    fn sealed_list(&self, file_id: u64) -> Result<Arc<IndexList>, StoreError> {
        let mut cache = self.sealed.lock().expect("sealed index cache lock poisoned");
        if let Some(list) = cache.get(file_id) {
            return Ok(list);
        }
        let path = self.dir.join(index_file_name(&self.name, file_id));
        let list = Arc::new(read_index_file(&path, file_id)?);
        cache.insert(file_id, Arc::clone(&list));
        Ok(list)
    }

    fn should_rotate(&self, writer: &Writer, next_payload: usize) -> bool {
        if writer.log.len() + 4 + next_payload as u64 > self.config.max_file_bytes {
            return true;
        }
        writer.index.records() >= self.config.max_file_records
    }

    fn rotate(&self, writer: &mut Writer) -> Result<(), StoreError> {
        let next_id = writer.file_id + 1;
        let log = LogWriter::open(self.dir.join(log_file_name(&self.name, next_id)))?;
        let index = IndexWriter::open(self.dir.join(index_file_name(&self.name, next_id)))?;
        writer.log = log;
        writer.index = index;
        writer.file_id = next_id;

        let sealed = {
            let mut view = self.view.write().expect("partition view lock poisoned");
            let sealed_id = view.file_id;
            let sealed = std::mem::replace(&mut view.active, Arc::new(IndexList::new()));
            view.file_id = next_id;
            (sealed_id, sealed)
        };
        self.sealed
            .lock()
            .expect("sealed index cache lock poisoned")
            .insert(sealed.0, sealed.1);

        tracing::debug!(partition = %self.name, file_id = next_id, "rotated partition files");
        Ok(())
    }
}

/// How many entries of `list` lie on the requested side of `start_id`.
fn reachable_in(list: &IndexList, start_id: u64, forward: bool) -> usize {
    let len = list.len();
    let Some(outcome) = list.search(start_id) else {
        return 0;
    };
    if forward {
        // Entries at ids >= start_id.
        let first = if outcome.found {
            outcome.position
        } else {
            outcome.position // insertion point: first entry above start_id
        };
        len.saturating_sub(first)
    } else {
        let last = if outcome.found {
            outcome.position + 1
        } else {
            outcome.position
        };
        last
    }
}

/// LRU of sealed index lists, keyed by file id.
struct SealedIndexCache {
    capacity: usize,
    entries: VecDeque<(u64, Arc<IndexList>)>,
}

impl SealedIndexCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    fn get(&mut self, file_id: u64) -> Option<Arc<IndexList>> {
        let position = self.entries.iter().position(|(id, _)| *id == file_id)?;
        let entry = self.entries.remove(position).expect("position is valid");
        let list = Arc::clone(&entry.1);
        self.entries.push_back(entry);
        Some(list)
    }

    fn insert(&mut self, file_id: u64, list: Arc<IndexList>) {
        self.entries.retain(|(id, _)| *id != file_id);
        self.entries.push_back((file_id, list));
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }
}

fn newest_file_id(dir: &std::path::Path, partition: &str) -> Result<Option<u64>, StoreError> {
    let mut newest = None;
    let read_dir = std::fs::read_dir(dir).map_err(|source| StoreError::Io {
        path: Some(dir.to_path_buf()),
        source,
    })?;
    for entry in read_dir {
        let entry = entry.map_err(|source| StoreError::Io {
            path: Some(dir.to_path_buf()),
            source,
        })?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(file_id) = parse_index_file_id(partition, name) {
            newest = Some(newest.map_or(file_id, |current: u64| current.max(file_id)));
        }
    }
    Ok(newest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir, config: PartitionConfig) -> Arc<MessagePartition> {
        Arc::new(MessagePartition::open(dir.path().to_path_buf(), "events", config).unwrap())
    }

    fn store_n(partition: &MessagePartition, from: u64, to: u64) {
        for id in from..=to {
            partition
                .store(id, format!("payload {id}").as_bytes())
                .unwrap();
        }
    }

    fn fetch_ids(partition: &Arc<MessagePartition>, start_id: u64, count: usize) -> Vec<u64> {
        let (request, result) = FetchRequest::forward("events", start_id, count);
        partition.fetch(request);
        let announced = result.start_rx.recv().unwrap();
        let ids: Vec<u64> = result.message_rx.iter().map(|m| m.id).collect();
        assert_eq!(announced, ids.len());
        ids
    }

    #[test]
    fn ids_are_strictly_monotonic() {
        let dir = TempDir::new().unwrap();
        let partition = open(&dir, PartitionConfig::default());

        store_n(&partition, 1, 5);
        assert_eq!(partition.max_message_id(), 5);

        let err = partition.store(5, b"again").unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId { id: 5, max: 5 }));
        let err = partition.store(3, b"earlier").unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId { id: 3, max: 5 }));
    }

    #[test]
    fn generate_next_id_embeds_node_in_top_byte() {
        let dir = TempDir::new().unwrap();
        let partition = open(&dir, PartitionConfig::default());

        assert_eq!(partition.generate_next_id(0, 0), 1);
        assert_eq!(partition.generate_next_id(0, 0), 2);

        let clustered = partition.generate_next_id(3, 0);
        assert_eq!(clustered >> 56, 3);
        assert_eq!(clustered & SEQ_MASK, 3);
    }

    #[test]
    fn fetch_returns_requested_range_in_order() {
        let dir = TempDir::new().unwrap();
        let partition = open(&dir, PartitionConfig::default());
        store_n(&partition, 1, 20);

        assert_eq!(fetch_ids(&partition, 1, usize::MAX), (1..=20).collect::<Vec<_>>());
        assert_eq!(fetch_ids(&partition, 15, 3), vec![15, 16, 17]);
        assert_eq!(fetch_ids(&partition, 21, 10), Vec::<u64>::new());
    }

    #[test]
    fn fetch_spans_rotated_files() {
        let dir = TempDir::new().unwrap();
        let config = PartitionConfig {
            max_file_records: 4,
            ..PartitionConfig::default()
        };
        let partition = open(&dir, config);
        store_n(&partition, 1, 19);

        assert_eq!(fetch_ids(&partition, 1, usize::MAX), (1..=19).collect::<Vec<_>>());
        assert_eq!(fetch_ids(&partition, 6, 6), (6..=11).collect::<Vec<_>>());
    }

    #[test]
    fn fetch_backward() {
        let dir = TempDir::new().unwrap();
        let config = PartitionConfig {
            max_file_records: 3,
            ..PartitionConfig::default()
        };
        let partition = open(&dir, config);
        store_n(&partition, 1, 10);

        let (request, result) = FetchRequest::new("events", 8, -1, 4);
        partition.fetch(request);
        assert_eq!(result.start_rx.recv().unwrap(), 4);
        let ids: Vec<u64> = result.message_rx.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![8, 7, 6, 5]);
    }

    #[test]
    fn fetched_bytes_match_stored_bytes() {
        let dir = TempDir::new().unwrap();
        let partition = open(&dir, PartitionConfig::default());
        store_n(&partition, 1, 3);

        let (request, result) = FetchRequest::forward("events", 2, 1);
        partition.fetch(request);
        result.start_rx.recv().unwrap();
        let fetched = result.message_rx.recv().unwrap();
        assert_eq!(fetched.id, 2);
        assert_eq!(&fetched.message[..], b"payload 2");
    }

    #[test]
    fn reopen_resumes_ids_and_data() {
        let dir = TempDir::new().unwrap();
        let config = PartitionConfig {
            max_file_records: 4,
            ..PartitionConfig::default()
        };
        {
            let partition = open(&dir, config);
            store_n(&partition, 1, 10);
        }

        let partition = open(&dir, config);
        assert_eq!(partition.max_message_id(), 10);
        assert_eq!(partition.generate_next_id(0, 0), 11);
        store_n(&partition, 11, 12);
        assert_eq!(fetch_ids(&partition, 1, usize::MAX), (1..=12).collect::<Vec<_>>());
    }

    #[test]
    fn rotation_keeps_store_available() {
        let dir = TempDir::new().unwrap();
        let config = PartitionConfig {
            max_file_bytes: 64,
            ..PartitionConfig::default()
        };
        let partition = open(&dir, config);
        // Each payload is ~16 bytes; several rotations happen here.
        store_n(&partition, 1, 40);
        assert_eq!(fetch_ids(&partition, 1, usize::MAX).len(), 40);
    }

    #[test]
    fn fetch_error_on_unknown_partition_files() {
        let dir = TempDir::new().unwrap();
        let partition = open(&dir, PartitionConfig::default());
        store_n(&partition, 1, 2);

        // Remove the log file behind the store's back.
        std::fs::remove_file(dir.path().join(log_file_name("events", 0))).unwrap();

        let (request, result) = FetchRequest::forward("events", 1, usize::MAX);
        partition.fetch(request);
        result.start_rx.recv().unwrap();
        let err = result.error_rx.recv().unwrap();
        assert!(matches!(err, StoreError::Io { .. }));
    }
}
