//! Persistence contracts: the message store and the KV store.

use std::path::PathBuf;

use bytes::Bytes;
use crossbeam::channel::{bounded, Receiver, Sender};
use thiserror::Error;

pub mod filestore;
pub mod kv;

pub use kv::{KvError, KvStore, MemoryKvStore};

/// Fetch forward from the start id.
pub const FETCH_FORWARD: i8 = 1;
/// Fetch backward from the start id.
pub const FETCH_BACKWARD: i8 = -1;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("partition {partition} is full and rotation failed")]
    StoreFull {
        partition: String,
        #[source]
        source: Box<StoreError>,
    },
    #[error("duplicate message id {id}: partition already holds id {max}")]
    DuplicateId { id: u64, max: u64 },
    #[error("file version unsupported: got {got}, supported {supported}")]
    UnsupportedVersion { got: u8, supported: u8 },
    #[error("store file corrupt at {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("partition name `{raw}` is invalid: {reason}")]
    InvalidPartition { raw: String, reason: &'static str },
}

/// A message as returned by a fetch: the stored id plus the raw bytes that
/// were originally passed to `store`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchedMessage {
    pub id: u64,
    pub message: Bytes,
}

/// A read query against a partition.
///
/// The store answers on the request's channels: first the number of
/// messages it will produce on the start channel, then that many messages
/// in id order, then it closes the channels by dropping them. An error is
/// terminal and arrives on the error channel instead.
pub struct FetchRequest {
    pub partition: String,
    pub start_id: u64,
    pub direction: i8,
    pub count: usize,
    pub(crate) start_tx: Sender<usize>,
    pub(crate) message_tx: Sender<FetchedMessage>,
    pub(crate) error_tx: Sender<StoreError>,
}

/// The consumer half of a [`FetchRequest`].
pub struct FetchResult {
    pub start_rx: Receiver<usize>,
    pub message_rx: Receiver<FetchedMessage>,
    pub error_rx: Receiver<StoreError>,
}

impl FetchRequest {
    pub fn new(
        partition: impl Into<String>,
        start_id: u64,
        direction: i8,
        count: usize,
    ) -> (Self, FetchResult) {
        let (start_tx, start_rx) = bounded(1);
        // Rendezvous channel: the fetch suspends on each send until the
        // consumer is ready, which is the read-side backpressure.
        let (message_tx, message_rx) = bounded(0);
        let (error_tx, error_rx) = bounded(1);
        (
            Self {
                partition: partition.into(),
                start_id,
                direction,
                count,
                start_tx,
                message_tx,
                error_tx,
            },
            FetchResult {
                start_rx,
                message_rx,
                error_rx,
            },
        )
    }

    pub fn forward(
        partition: impl Into<String>,
        start_id: u64,
        count: usize,
    ) -> (Self, FetchResult) {
        Self::new(partition, start_id, FETCH_FORWARD, count)
    }

    pub(crate) fn fail(&self, err: StoreError) {
        let _ = self.error_tx.send(err);
    }
}

/// Durable, per-partition ordered message persistence.
pub trait MessageStore: Send + Sync {
    /// Append a message to its partition. Ids must be strictly increasing
    /// per partition; a non-increasing id is a programmer error surfaced as
    /// [`StoreError::DuplicateId`].
    fn store(&self, partition: &str, id: u64, message: &[u8]) -> Result<(), StoreError>;

    /// Reserve the next message id for a partition.
    fn generate_next_id(&self, partition: &str, time: i64) -> Result<u64, StoreError>;

    /// The highest id stored in the partition, or 0 when empty.
    fn max_message_id(&self, partition: &str) -> Result<u64, StoreError>;

    /// Answer a fetch request asynchronously on the request's channels.
    fn fetch(&self, request: FetchRequest);

    /// Probe that the store is usable.
    fn check(&self) -> Result<(), StoreError>;
}
