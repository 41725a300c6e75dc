//! The connector subsystem: a reusable subscription engine binding
//! subscribers to topics, draining the router, and pushing through a
//! bounded worker pool to an external endpoint.

mod api;
mod manager;
mod queue;
mod subscriber;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::bounded;
use crossbeam::sync::WaitGroup;
use thiserror::Error;

pub use api::api_router;
pub use manager::Manager;
pub use queue::{Queue, Request};
pub use subscriber::{subscriber_key, CancelToken, Subscriber, SubscriberData};

use crate::protocol::{Path, ProtocolError};
use crate::router::{RouteParams, Router, RouterError};
use crate::store::{KvError, StoreError};

/// Route-param key recording which connector owns a subscription.
pub const CONNECTOR_PARAM: &str = "connector";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectorError {
    #[error("subscription already exists")]
    SubscriberExists,
    #[error("route channel closed")]
    RouteChannelClosed,
    #[error("canceled")]
    Canceled,
    #[error("queue is stopped")]
    QueueStopped,
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("subscriber record encode failed: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
}

/// Failure of a push attempt, as classified by the sender.
#[derive(Debug, Error)]
pub enum SenderError {
    #[error("transient send failure: {reason}")]
    Transient { reason: String },
    #[error("permanent send failure: {reason}")]
    Permanent { reason: String },
}

impl SenderError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, SenderError::Permanent { .. })
    }
}

/// Facts about a completed send attempt.
#[derive(Clone, Copy, Debug)]
pub struct Metadata {
    pub latency: Duration,
}

/// Converts a delivery request into an external push call.
pub trait Sender: Send + Sync {
    fn send(&self, request: &Request) -> Result<serde_json::Value, SenderError>;
}

/// Policy applied after every send: retry, drop, or remove the
/// subscriber. Must not block a queue worker indefinitely.
pub trait ResponseHandler: Send + Sync {
    fn handle_response(
        &self,
        request: Request,
        result: Result<serde_json::Value, SenderError>,
        metadata: Metadata,
    );
}

#[derive(Clone, Debug)]
pub struct ConnectorConfig {
    /// Connector name, recorded on every subscription's route params.
    pub name: String,
    /// KV schema under which subscribers are persisted.
    pub schema: String,
    /// URL pattern for subscription endpoints; path params become route
    /// params, `{*topic}` captures the topic.
    pub url_pattern: String,
    pub workers: usize,
    pub channel_size: usize,
    pub queue_capacity: usize,
    pub stop_grace: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            name: "connector".to_string(),
            schema: "connector".to_string(),
            url_pattern: "/{device_token}/{user_id}/{*topic}".to_string(),
            workers: 1,
            channel_size: 10,
            queue_capacity: 100,
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// Supervises one runner per subscriber: subscribe, drain, push, and
/// recover from transient route closure by refetching from the store.
pub struct Connector {
    config: ConnectorConfig,
    router: Arc<Router>,
    manager: Arc<Manager>,
    queue: Arc<Queue>,
    shutdown: CancelToken,
    runners: Mutex<WaitGroup>,
}

impl Connector {
    pub fn new(router: Arc<Router>, sender: Arc<dyn Sender>, config: ConnectorConfig) -> Arc<Self> {
        let manager = Arc::new(Manager::new(
            config.schema.clone(),
            config.channel_size,
            router.kv_store(),
        ));
        let queue = Arc::new(Queue::new(sender, config.workers, config.queue_capacity));
        Arc::new(Self {
            config,
            router,
            manager,
            queue,
            shutdown: CancelToken::new(),
            runners: Mutex::new(WaitGroup::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn set_response_handler(&self, handler: Arc<dyn ResponseHandler>) {
        self.queue.set_response_handler(handler);
    }

    /// Load persisted subscribers and start a runner for each.
    pub fn start(self: &Arc<Self>) -> Result<(), ConnectorError> {
        tracing::info!(name = %self.config.name, "starting connector");
        self.manager.load()?;
        for subscriber in self.manager.list() {
            self.run(subscriber);
        }
        tracing::info!(name = %self.config.name, "started connector");
        Ok(())
    }

    /// Spawn the supervision routine for one subscriber.
    pub fn run(self: &Arc<Self>, subscriber: Arc<Subscriber>) {
        let wait = self
            .runners
            .lock()
            .expect("connector runners lock poisoned")
            .clone();
        self.spawn_runner(subscriber, wait);
    }

    fn spawn_runner(self: &Arc<Self>, subscriber: Arc<Subscriber>, wait: WaitGroup) {
        let connector = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("subscriber-{:.8}", subscriber.key()))
            .spawn(move || connector.supervise(subscriber, wait));
        if let Err(source) = spawned {
            tracing::error!(%source, "subscriber runner spawn failed");
        }
    }

    fn supervise(self: &Arc<Self>, subscriber: Arc<Subscriber>, wait: WaitGroup) {
        // Provide the route concurrently with the loop's initial fetch; a
        // provide failure cancels the loop and is examined afterwards.
        let provide_err: Arc<Mutex<Option<RouterError>>> = Arc::new(Mutex::new(None));
        {
            let router = Arc::clone(&self.router);
            let route = subscriber.route();
            let loop_subscriber = Arc::clone(&subscriber);
            let provide_err = Arc::clone(&provide_err);
            std::thread::spawn(move || {
                if let Err(err) = route.provide(&router, true) {
                    *provide_err.lock().expect("provide error lock poisoned") = Some(err);
                    loop_subscriber.cancel();
                }
            });
        }

        let manager = Arc::clone(&self.manager);
        let result = subscriber.run_loop(&self.shutdown, &self.router, &self.queue, |s| {
            if let Err(err) = manager.update(s) {
                tracing::warn!(key = %s.key(), %err, "persisting subscriber cursor failed");
            }
        });

        let provide_err = provide_err
            .lock()
            .expect("provide error lock poisoned")
            .take();
        if let Some(err) = provide_err {
            match err {
                // The router evicted the route: try a restart.
                RouterError::InvalidRoute => self.restart(subscriber, wait),
                RouterError::ModuleStopping => {}
                err => {
                    tracing::error!(key = %subscriber.key(), %err, "route provide error");
                }
            }
            return;
        }

        match result {
            Err(ConnectorError::Canceled) => {
                self.router.unsubscribe(&subscriber.route());
            }
            Err(ConnectorError::RouteChannelClosed) => self.restart(subscriber, wait),
            Err(err) => {
                tracing::error!(key = %subscriber.key(), %err, "subscriber loop failed");
            }
            Ok(()) => {}
        }
    }

    /// Reset the subscriber's route and re-enter the runner, resuming
    /// from the persisted cursor.
    fn restart(self: &Arc<Self>, subscriber: Arc<Subscriber>, wait: WaitGroup) {
        if self.shutdown.is_canceled() {
            return;
        }
        tracing::info!(key = %subscriber.key(), "restarting subscriber");
        subscriber.cancel();
        subscriber.reset();
        self.spawn_runner(subscriber, wait);
    }

    /// List topics of subscribers matching all filter pairs.
    pub fn list_topics(&self, filters: &RouteParams) -> Vec<String> {
        self.manager
            .filter(filters)
            .iter()
            .map(|subscriber| subscriber.path().without_leading_slash().to_string())
            .collect()
    }

    /// Create a subscription from URL params and start its runner.
    pub fn create_subscription(
        self: &Arc<Self>,
        topic: &str,
        mut params: RouteParams,
    ) -> Result<Arc<Subscriber>, ConnectorError> {
        params.insert(CONNECTOR_PARAM.to_string(), self.config.name.clone());
        let subscriber = self
            .manager
            .create(Path::new(format!("/{topic}")), params)?;
        self.run(Arc::clone(&subscriber));
        tracing::info!(topic, "subscription created");
        Ok(subscriber)
    }

    /// Remove the subscription identified by the URL params, if present.
    pub fn delete_subscription(
        &self,
        topic: &str,
        mut params: RouteParams,
    ) -> Result<Option<()>, ConnectorError> {
        params.insert(CONNECTOR_PARAM.to_string(), self.config.name.clone());
        let key = subscriber_key(&Path::new(format!("/{topic}")), &params);
        let Some(subscriber) = self.manager.find(&key) else {
            return Ok(None);
        };
        self.manager.remove(&subscriber)?;
        tracing::info!(topic, "subscription deleted");
        Ok(Some(()))
    }

    /// Rewrite one route-param value across all matching subscribers.
    /// Returns how many were modified.
    pub fn substitute(
        &self,
        field_name: &str,
        old_value: &str,
        new_value: &str,
    ) -> Result<usize, ConnectorError> {
        let mut filters = RouteParams::new();
        filters.insert(field_name.to_string(), old_value.to_string());
        let matching = self.manager.filter(&filters);
        for subscriber in &matching {
            subscriber.route().set(field_name, new_value);
            self.manager.update(subscriber)?;
        }
        tracing::info!(field_name, modified = matching.len(), "substituted subscriber info");
        Ok(matching.len())
    }

    /// Cancel every runner, stop the queue, and wait out the grace period.
    pub fn stop(&self) {
        tracing::info!(name = %self.config.name, "stopping connector");
        self.shutdown.cancel();
        self.queue.stop();

        let wait = {
            let mut runners = self.runners.lock().expect("connector runners lock poisoned");
            std::mem::replace(&mut *runners, WaitGroup::new())
        };
        let (done_tx, done_rx) = bounded(1);
        std::thread::spawn(move || {
            wait.wait();
            let _ = done_tx.send(());
        });
        if done_rx.recv_timeout(self.config.stop_grace).is_err() {
            tracing::warn!(
                name = %self.config.name,
                "subscriber runners did not finish within the grace period"
            );
        }
        tracing::info!(name = %self.config.name, "stopped connector");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::protocol::Message;
    use crate::router::{AllowAll, USER_ID_KEY};
    use crate::store::filestore::{FileMessageStore, PartitionConfig};
    use crate::store::MemoryKvStore;

    struct OkSender;
    impl Sender for OkSender {
        fn send(&self, _request: &Request) -> Result<serde_json::Value, SenderError> {
            Ok(serde_json::json!({}))
        }
    }

    struct NotRegisteredSender;
    impl Sender for NotRegisteredSender {
        fn send(&self, _request: &Request) -> Result<serde_json::Value, SenderError> {
            Err(SenderError::Permanent {
                reason: "NotRegistered".to_string(),
            })
        }
    }

    /// Removes the subscriber on permanent failures, the policy a push
    /// connector applies when the remote token is gone.
    struct RemoveOnPermanent {
        manager: Arc<Manager>,
        removed: AtomicUsize,
    }
    impl ResponseHandler for RemoveOnPermanent {
        fn handle_response(
            &self,
            request: Request,
            result: Result<serde_json::Value, SenderError>,
            _metadata: Metadata,
        ) {
            if let Err(err) = result {
                if err.is_permanent() {
                    let _ = self.manager.remove(&request.subscriber);
                    self.removed.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    fn started_router(dir: &TempDir) -> Arc<Router> {
        let store = FileMessageStore::open(
            dir.path().to_path_buf(),
            0,
            PartitionConfig::default(),
        )
        .unwrap();
        let router = Arc::new(Router::new(
            Arc::new(AllowAll),
            Arc::new(store),
            Arc::new(MemoryKvStore::new()),
        ));
        router.start().unwrap();
        router
    }

    fn test_message(path: &str, body: &str) -> Message {
        Message {
            id: 0,
            node_id: 0,
            time: 0,
            path: Path::from(path),
            user_id: "user01".to_string(),
            application_id: "phone01".to_string(),
            publisher_message_id: None,
            headers: BTreeMap::new(),
            body: bytes::Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let end = std::time::Instant::now() + deadline;
        while std::time::Instant::now() < end {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn subscriber_receives_published_messages() {
        let dir = TempDir::new().unwrap();
        let router = started_router(&dir);
        let connector = Connector::new(
            Arc::clone(&router),
            Arc::new(OkSender),
            ConnectorConfig::default(),
        );
        connector.start().unwrap();

        let mut params = RouteParams::new();
        params.insert(USER_ID_KEY.to_string(), "user01".to_string());
        let subscriber = connector.create_subscription("foo/bar", params).unwrap();

        // Republish until the route is live; the runner subscribes
        // concurrently with the loop start.
        assert!(wait_until(Duration::from_secs(5), || {
            router
                .handle_message(test_message("/foo/bar", "hi"))
                .unwrap();
            subscriber.last_id() >= 1
        }));

        connector.stop();
        router.stop();
    }

    #[test]
    fn permanent_sender_failure_removes_subscriber() {
        let dir = TempDir::new().unwrap();
        let router = started_router(&dir);
        let connector = Connector::new(
            Arc::clone(&router),
            Arc::new(NotRegisteredSender),
            ConnectorConfig::default(),
        );
        let handler = Arc::new(RemoveOnPermanent {
            manager: Arc::clone(connector.manager()),
            removed: AtomicUsize::new(0),
        });
        connector.set_response_handler(Arc::clone(&handler) as Arc<dyn ResponseHandler>);
        connector.start().unwrap();

        let mut params = RouteParams::new();
        params.insert(USER_ID_KEY.to_string(), "user01".to_string());
        connector.create_subscription("foo/bar", params).unwrap();
        assert_eq!(connector.manager().count(), 1);

        assert!(wait_until(Duration::from_secs(5), || {
            if connector.manager().count() == 0 {
                return true;
            }
            router
                .handle_message(test_message("/foo/bar", "push me"))
                .unwrap();
            false
        }));
        assert!(handler.removed.load(Ordering::SeqCst) >= 1);

        connector.stop();
        router.stop();
    }

    #[test]
    fn substitute_rewrites_matching_params() {
        let dir = TempDir::new().unwrap();
        let router = started_router(&dir);
        let connector = Connector::new(
            Arc::clone(&router),
            Arc::new(OkSender),
            ConnectorConfig::default(),
        );
        connector.start().unwrap();

        for i in 0..3 {
            let mut params = RouteParams::new();
            params.insert(USER_ID_KEY.to_string(), format!("user{i}"));
            params.insert("device".to_string(), "old".to_string());
            connector
                .create_subscription(&format!("topic{i}"), params)
                .unwrap();
        }

        let modified = connector.substitute("device", "old", "new").unwrap();
        assert_eq!(modified, 3);

        let mut filters = RouteParams::new();
        filters.insert("device".to_string(), "new".to_string());
        assert_eq!(connector.manager().filter(&filters).len(), 3);

        connector.stop();
        router.stop();
    }
}
