//! A persistent subscription: identity, cursor, and the drain loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crossbeam::channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::queue::{Queue, Request};
use super::ConnectorError;
use crate::protocol::{Message, Path};
use crate::router::{Route, RouteConfig, RouteParams, Router};
use crate::store::FetchRequest;

/// Cooperative cancellation handle.
///
/// Cancelling drops the sender half, which makes the receiver observable
/// inside `crossbeam::select!` as a disconnected channel.
#[derive(Clone)]
pub struct CancelToken {
    sender: Arc<Mutex<Option<Sender<()>>>>,
    receiver: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.lock().expect("cancel token lock poisoned").take();
    }

    pub fn is_canceled(&self) -> bool {
        self.sender
            .lock()
            .expect("cancel token lock poisoned")
            .is_none()
    }

    /// Channel that disconnects once the token is cancelled.
    pub fn done(&self) -> &Receiver<()> {
        &self.receiver
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Persistent form of a subscriber, as stored in the KV store.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubscriberData {
    pub path: Path,
    pub params: RouteParams,
    pub last_id: u64,
}

struct Runtime {
    route: Arc<Route>,
    cancel: CancelToken,
}

/// A subscription identity that outlives its runtime route.
///
/// The key is derived deterministically from the path and the sorted route
/// params at creation. `last_id` is the replay cursor: the id of the last
/// message handed to the queue.
pub struct Subscriber {
    key: String,
    path: Path,
    channel_size: usize,
    last_id: AtomicU64,
    runtime: RwLock<Runtime>,
}

/// Derive the deterministic subscriber key from a path and its params.
pub fn subscriber_key(path: &Path, params: &RouteParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_str().as_bytes());
    hasher.update(b"|");
    for (k, v) in params {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b",");
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

impl Subscriber {
    pub fn new(path: Path, params: RouteParams, channel_size: usize) -> Arc<Self> {
        Self::with_last_id(path, params, channel_size, 0)
    }

    pub fn with_last_id(
        path: Path,
        params: RouteParams,
        channel_size: usize,
        last_id: u64,
    ) -> Arc<Self> {
        let key = subscriber_key(&path, &params);
        let route = Route::new(RouteConfig {
            path: path.clone(),
            params,
            channel_size,
        });
        Arc::new(Self {
            key,
            path,
            channel_size,
            last_id: AtomicU64::new(last_id),
            runtime: RwLock::new(Runtime {
                route,
                cancel: CancelToken::new(),
            }),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn route(&self) -> Arc<Route> {
        Arc::clone(&self.runtime.read().expect("subscriber lock poisoned").route)
    }

    pub fn last_id(&self) -> u64 {
        self.last_id.load(Ordering::Acquire)
    }

    pub fn set_last_id(&self, id: u64) {
        self.last_id.store(id, Ordering::Release);
    }

    /// Cancel the current drain loop.
    pub fn cancel(&self) {
        self.runtime
            .read()
            .expect("subscriber lock poisoned")
            .cancel
            .cancel();
    }

    fn cancel_token(&self) -> CancelToken {
        self.runtime
            .read()
            .expect("subscriber lock poisoned")
            .cancel
            .clone()
    }

    /// Rebuild the route and cancellation token, preserving identity and
    /// cursor. Called by the supervisor before a restart.
    pub fn reset(&self) {
        let mut runtime = self.runtime.write().expect("subscriber lock poisoned");
        let params = runtime.route.params();
        runtime.route = Route::new(RouteConfig {
            path: self.path.clone(),
            params,
            channel_size: self.channel_size,
        });
        runtime.cancel = CancelToken::new();
    }

    pub fn data(&self) -> SubscriberData {
        SubscriberData {
            path: self.path.clone(),
            params: self.route().params(),
            last_id: self.last_id(),
        }
    }

    pub fn from_data(data: SubscriberData, channel_size: usize) -> Arc<Self> {
        Self::with_last_id(data.path, data.params, channel_size, data.last_id)
    }

    /// Drain the subscription until cancelled or the route closes.
    ///
    /// Two phases: when the cursor is behind the partition head, fetch the
    /// gap from the store and submit it to the queue; then drain the live
    /// route channel. Advances (and persists, via `persist`) the cursor on
    /// each submission.
    pub fn run_loop(
        self: &Arc<Self>,
        shutdown: &CancelToken,
        router: &Router,
        queue: &Queue,
        mut persist: impl FnMut(&Subscriber),
    ) -> Result<(), ConnectorError> {
        let cancel = self.cancel_token();
        let route = self.route();
        let partition = self.path.partition().to_string();

        // Fetching: catch up from the store before going live.
        let max_id = router.message_store().max_message_id(&partition)?;
        if self.last_id() < max_id {
            let (request, result) =
                FetchRequest::forward(partition, self.last_id() + 1, usize::MAX);
            router.fetch(request)?;

            let announced = crossbeam::select! {
                recv(result.start_rx) -> count => match count {
                    Ok(count) => count,
                    // The fetch dropped its channels before announcing:
                    // a terminal error is waiting on the error channel.
                    Err(_) => match result.error_rx.recv() {
                        Ok(err) => return Err(ConnectorError::Store(err)),
                        Err(_) => 0,
                    },
                },
                recv(result.error_rx) -> err => match err {
                    Ok(err) => return Err(ConnectorError::Store(err)),
                    Err(_) => result.start_rx.recv().unwrap_or(0),
                },
                recv(shutdown.done()) -> _ => return Err(ConnectorError::Canceled),
                recv(cancel.done()) -> _ => return Err(ConnectorError::Canceled),
            };
            tracing::debug!(key = %self.key, announced, "fetching missed messages");

            let message_rx = result.message_rx;
            let error_rx = result.error_rx;
            let mut draining = true;
            while draining {
                crossbeam::select! {
                    recv(message_rx) -> fetched => match fetched {
                        Ok(fetched) => {
                            let message = Message::decode(&fetched.message)?;
                            queue.push(Request {
                                subscriber: Arc::clone(self),
                                message: Arc::new(message),
                            })?;
                            self.set_last_id(fetched.id);
                            persist(self);
                        }
                        // Channel closed: the fetch is complete unless an
                        // error is still pending.
                        Err(_) => match error_rx.try_recv() {
                            Ok(err) => return Err(ConnectorError::Store(err)),
                            Err(_) => draining = false,
                        },
                    },
                    // Both channels disconnect together when the fetch
                    // finishes; a bare disconnect carries no error and no
                    // undelivered messages remain.
                    recv(error_rx) -> err => match err {
                        Ok(err) => return Err(ConnectorError::Store(err)),
                        Err(_) => draining = false,
                    },
                    recv(shutdown.done()) -> _ => return Err(ConnectorError::Canceled),
                    recv(cancel.done()) -> _ => return Err(ConnectorError::Canceled),
                }
            }
        }

        // Subscribing: drain the live route channel.
        loop {
            crossbeam::select! {
                recv(route.receiver()) -> message => {
                    let Ok(message) = message else {
                        return Err(ConnectorError::RouteChannelClosed);
                    };
                    let id = message.id;
                    queue.push(Request {
                        subscriber: Arc::clone(self),
                        message,
                    })?;
                    self.set_last_id(id);
                    persist(self);
                }
                recv(shutdown.done()) -> _ => return Err(ConnectorError::Canceled),
                recv(cancel.done()) -> _ => return Err(ConnectorError::Canceled),
            }
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("last_id", &self.last_id())
            .finish()
    }
}
