//! The in-memory router: subscribe/unsubscribe/publish event loop.

mod access;
pub mod counters;
mod route;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::channel::{bounded, Receiver, Sender};
use thiserror::Error;

pub use access::{AccessManager, AccessType, AllowAll};
pub use route::{Route, RouteConfig, RouteParams, APPLICATION_ID_KEY, USER_ID_KEY};

use crate::protocol::{Message, Path};
use crate::store::{FetchRequest, KvError, KvStore, MessageStore, StoreError};

const HANDLE_CHANNEL_CAPACITY: usize = 500;
const SUBSCRIBE_CHANNEL_CAPACITY: usize = 10;
const UNSUBSCRIBE_CHANNEL_CAPACITY: usize = 10;
const OVERLOADED_HANDLE_RATIO: f32 = 0.9;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RouterError {
    #[error("module Router is stopping")]
    ModuleStopping,
    #[error("permission denied for user `{user_id}` to {access} path `{path}`")]
    PermissionDenied {
        user_id: String,
        access: AccessType,
        path: Path,
    },
    #[error("invalid route")]
    InvalidRoute,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Kv(#[from] KvError),
}

/// Outbound replication seam. The transport is external; the router only
/// hands locally-originated messages over.
pub trait ClusterSink: Send + Sync {
    fn broadcast(&self, message: &Message);
}

struct SubRequest {
    route: Arc<Route>,
    respond: Sender<()>,
}

struct LoopChannels {
    handle_rx: Receiver<Arc<Message>>,
    subscribe_rx: Receiver<SubRequest>,
    unsubscribe_rx: Receiver<SubRequest>,
    stop_rx: Receiver<()>,
}

/// The pub/sub router.
///
/// A single event-loop thread owns the routes map; all mutation arrives
/// over the input channels, and subscribe/unsubscribe requests carry a
/// completion channel so callers get synchronous semantics.
pub struct Router {
    handle_tx: Sender<Arc<Message>>,
    subscribe_tx: Sender<SubRequest>,
    unsubscribe_tx: Sender<SubRequest>,
    stop_tx: Sender<()>,
    stopping: Arc<AtomicBool>,

    access: Arc<dyn AccessManager>,
    store: Arc<dyn MessageStore>,
    kv: Arc<dyn KvStore>,
    node_id: u8,
    cluster: Option<Arc<dyn ClusterSink>>,

    channels: Mutex<Option<LoopChannels>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    pub fn new(
        access: Arc<dyn AccessManager>,
        store: Arc<dyn MessageStore>,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        let (handle_tx, handle_rx) = bounded(HANDLE_CHANNEL_CAPACITY);
        let (subscribe_tx, subscribe_rx) = bounded(SUBSCRIBE_CHANNEL_CAPACITY);
        let (unsubscribe_tx, unsubscribe_rx) = bounded(UNSUBSCRIBE_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = bounded(1);
        Self {
            handle_tx,
            subscribe_tx,
            unsubscribe_tx,
            stop_tx,
            stopping: Arc::new(AtomicBool::new(false)),
            access,
            store,
            kv,
            node_id: 0,
            cluster: None,
            channels: Mutex::new(Some(LoopChannels {
                handle_rx,
                subscribe_rx,
                unsubscribe_rx,
                stop_rx,
            })),
            handle: Mutex::new(None),
        }
    }

    /// Configure the cluster identity of this node. Node 0 is standalone.
    pub fn with_cluster(mut self, node_id: u8, sink: Arc<dyn ClusterSink>) -> Self {
        self.node_id = node_id;
        self.cluster = Some(sink);
        self
    }

    /// Spawn the event loop. Must be called exactly once.
    pub fn start(&self) -> Result<(), RouterError> {
        let channels = self
            .channels
            .lock()
            .expect("router channels lock poisoned")
            .take()
            .expect("router started twice");
        let stopping = Arc::clone(&self.stopping);

        tracing::info!("starting router");
        let handle = std::thread::Builder::new()
            .name("router".to_string())
            .spawn(move || run_loop(channels, stopping))
            .map_err(|source| StoreError::Io {
                path: None,
                source,
            })?;
        *self.handle.lock().expect("router handle lock poisoned") = Some(handle);
        Ok(())
    }

    /// Signal the loop to stop, wait for it to drain its channels, close
    /// every route, and exit.
    pub fn stop(&self) {
        tracing::info!("stopping router");
        self.stopping.store(true, Ordering::Release);
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.lock().expect("router handle lock poisoned").take() {
            let _ = handle.join();
        }
    }

    /// Store the message in its partition (assigning a fresh id and time
    /// when locally originated), then hand it to the dispatch loop and,
    /// when clustered, to the replication sink.
    pub fn handle_message(&self, mut message: Message) -> Result<u64, RouterError> {
        counters::add(&counters::MESSAGES_INCOMING, 1);
        self.ensure_running()?;

        if !self
            .access
            .is_allowed(AccessType::Write, &message.user_id, &message.path)
        {
            return Err(RouterError::PermissionDenied {
                user_id: message.user_id,
                access: AccessType::Write,
                path: message.path,
            });
        }

        let partition = message.path.partition().to_string();
        let local_origin = message.node_id == 0 || message.node_id == self.node_id;
        if local_origin {
            let time = unix_now();
            let id = self
                .store
                .generate_next_id(&partition, time)
                .inspect_err(|_| counters::add(&counters::STORE_ERRORS, 1))?;
            message.id = id;
            message.time = time;
            message.node_id = self.node_id;
        }

        self.store
            .store(&partition, message.id, &message.encode())
            .inspect_err(|_| counters::add(&counters::STORE_ERRORS, 1))?;

        if self.handle_tx.len() as f32 > HANDLE_CHANNEL_CAPACITY as f32 * OVERLOADED_HANDLE_RATIO
        {
            counters::add(&counters::OVERLOADED_HANDLE_CHANNEL, 1);
            tracing::warn!(
                queued = self.handle_tx.len(),
                capacity = HANDLE_CHANNEL_CAPACITY,
                "handle channel is almost full"
            );
        }

        let id = message.id;
        let message = Arc::new(message);
        if self.handle_tx.send(Arc::clone(&message)).is_err() {
            return Err(RouterError::ModuleStopping);
        }

        if local_origin {
            if let Some(cluster) = self.cluster.clone() {
                std::thread::spawn(move || cluster.broadcast(&message));
            }
        }
        Ok(id)
    }

    /// Register a route. An existing route with the same
    /// `(application_id, path)` is replaced.
    pub fn subscribe(&self, route: Arc<Route>) -> Result<Arc<Route>, RouterError> {
        tracing::debug!(path = %route.path(), user_id = %route.user_id(), "subscribe");
        self.ensure_running()?;

        if !self
            .access
            .is_allowed(AccessType::Read, &route.user_id(), route.path())
        {
            return Err(RouterError::PermissionDenied {
                user_id: route.user_id(),
                access: AccessType::Read,
                path: route.path().clone(),
            });
        }

        let (respond, done) = bounded(1);
        self.subscribe_tx
            .send(SubRequest {
                route: Arc::clone(&route),
                respond,
            })
            .map_err(|_| RouterError::ModuleStopping)?;
        done.recv().map_err(|_| RouterError::ModuleStopping)?;
        Ok(route)
    }

    /// Remove a route. A no-op when the route is not registered.
    pub fn unsubscribe(&self, route: &Arc<Route>) {
        tracing::debug!(path = %route.path(), user_id = %route.user_id(), "unsubscribe");
        let (respond, done) = bounded(1);
        if self
            .unsubscribe_tx
            .send(SubRequest {
                route: Arc::clone(route),
                respond,
            })
            .is_ok()
        {
            let _ = done.recv();
        }
    }

    /// Forward a fetch request to the message store.
    pub fn fetch(&self, request: FetchRequest) -> Result<(), RouterError> {
        self.ensure_running()?;
        self.store.fetch(request);
        Ok(())
    }

    pub fn access_manager(&self) -> Arc<dyn AccessManager> {
        Arc::clone(&self.access)
    }

    pub fn message_store(&self) -> Arc<dyn MessageStore> {
        Arc::clone(&self.store)
    }

    pub fn kv_store(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.kv)
    }

    /// Probe the router's collaborators.
    pub fn check(&self) -> Result<(), RouterError> {
        self.store.check()?;
        self.kv.check()?;
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), RouterError> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(RouterError::ModuleStopping);
        }
        Ok(())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct RouteTable {
    routes: HashMap<Path, Vec<Arc<Route>>>,
}

fn run_loop(channels: LoopChannels, stopping: Arc<AtomicBool>) {
    let mut table = RouteTable {
        routes: HashMap::new(),
    };

    loop {
        if stopping.load(Ordering::Acquire) && channels_empty(&channels) {
            table.close_all();
            tracing::info!("router stopped");
            return;
        }

        // One event per iteration; a panic loses that iteration only.
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            crossbeam::select! {
                recv(channels.handle_rx) -> message => {
                    if let Ok(message) = message {
                        table.route_message(&message);
                    }
                }
                recv(channels.subscribe_rx) -> request => {
                    if let Ok(request) = request {
                        table.subscribe(request.route);
                        let _ = request.respond.send(());
                    }
                }
                recv(channels.unsubscribe_rx) -> request => {
                    if let Ok(request) = request {
                        table.unsubscribe(&request.route);
                        let _ = request.respond.send(());
                    }
                }
                recv(channels.stop_rx) -> _ => {
                    stopping.store(true, Ordering::Release);
                }
            }
        }));
        if outcome.is_err() {
            tracing::error!("router loop iteration panicked, continuing");
        }
    }
}

fn channels_empty(channels: &LoopChannels) -> bool {
    channels.handle_rx.is_empty()
        && channels.subscribe_rx.is_empty()
        && channels.unsubscribe_rx.is_empty()
}

impl RouteTable {
    fn route_message(&mut self, message: &Arc<Message>) {
        counters::add(&counters::MESSAGES_ROUTED, 1);

        let mut invalid = Vec::new();
        let mut matched = false;
        for (path, routes) in &self.routes {
            if !message.path.matches(path) {
                continue;
            }
            matched = true;
            for route in routes {
                if let Err(RouterError::InvalidRoute) = route.deliver(message) {
                    invalid.push(Arc::clone(route));
                }
            }
        }

        // Evict slow or closed consumers inline.
        for route in invalid {
            self.unsubscribe(&route);
        }

        if !matched {
            counters::add(&counters::MESSAGES_UNMATCHED, 1);
            tracing::debug!(topic = %message.path, "no route matched");
        }
    }

    fn subscribe(&mut self, route: Arc<Route>) {
        counters::add(&counters::SUBSCRIPTION_ATTEMPTS, 1);

        let routes = self.routes.entry(route.path().clone()).or_default();
        let replaced = remove_matching(routes, &route);
        routes.push(route);
        if replaced {
            counters::add(&counters::DUPLICATE_SUBSCRIPTIONS, 1);
        } else {
            counters::add(&counters::CURRENT_SUBSCRIPTIONS, 1);
        }
    }

    fn unsubscribe(&mut self, route: &Arc<Route>) {
        let Some(routes) = self.routes.get_mut(route.path()) else {
            return;
        };
        if remove_matching(routes, route) {
            counters::decrement(&counters::CURRENT_SUBSCRIPTIONS);
        }
        if routes.is_empty() {
            self.routes.remove(route.path());
        }
    }

    fn close_all(&mut self) {
        for routes in self.routes.values() {
            for route in routes {
                tracing::debug!(path = %route.path(), "closing route");
                route.close();
                counters::decrement(&counters::CURRENT_SUBSCRIPTIONS);
            }
        }
        self.routes.clear();
    }
}

/// Remove the route with the same `(application_id, path)`, if present.
fn remove_matching(routes: &mut Vec<Arc<Route>>, route: &Route) -> bool {
    let before = routes.len();
    routes.retain(|existing| !existing.same_target(route));
    routes.len() != before
}
