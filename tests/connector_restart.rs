//! Restart-from-cursor behavior of the connector: a subscriber that comes
//! back behind the partition head first replays the gap from the store,
//! then continues live.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use fanout::connector::{subscriber_key, SubscriberData, CONNECTOR_PARAM};
use fanout::router::USER_ID_KEY;
use fanout::store::filestore::{FileMessageStore, PartitionConfig};
use fanout::store::KvStore;
use fanout::{
    AllowAll, Connector, ConnectorConfig, Message, Metadata, Path, Request, ResponseHandler,
    Router, MemoryKvStore, Sender, SenderError,
};

/// Records the id of every message it pushes.
struct RecordingSender {
    delivered: Mutex<Vec<u64>>,
}

impl RecordingSender {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
        })
    }

    fn ids(&self) -> Vec<u64> {
        self.delivered.lock().unwrap().clone()
    }
}

impl Sender for RecordingSender {
    fn send(&self, request: &Request) -> Result<serde_json::Value, SenderError> {
        self.delivered.lock().unwrap().push(request.message.id);
        Ok(serde_json::json!({}))
    }
}

struct CountingHandler {
    handled: AtomicUsize,
}

impl ResponseHandler for CountingHandler {
    fn handle_response(
        &self,
        _request: Request,
        result: Result<serde_json::Value, SenderError>,
        _metadata: Metadata,
    ) {
        assert!(result.is_ok());
        self.handled.fetch_add(1, Ordering::SeqCst);
    }
}

fn started_router(dir: &tempfile::TempDir, kv: Arc<MemoryKvStore>) -> Arc<Router> {
    let store =
        FileMessageStore::open(dir.path().to_path_buf(), 0, PartitionConfig::default()).unwrap();
    let router = Arc::new(Router::new(Arc::new(AllowAll), Arc::new(store), kv));
    router.start().unwrap();
    router
}

fn message(path: &str, body: &str) -> Message {
    Message {
        id: 0,
        node_id: 0,
        time: 0,
        path: Path::from(path),
        user_id: "user01".to_string(),
        application_id: "phone01".to_string(),
        publisher_message_id: None,
        headers: BTreeMap::new(),
        body: Bytes::copy_from_slice(body.as_bytes()),
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
fn startup_behind_head_fetches_gap_then_goes_live() {
    let dir = tempfile::tempdir().unwrap();
    let kv = Arc::new(MemoryKvStore::new());
    let router = started_router(&dir, Arc::clone(&kv));

    // Four messages already stored before the connector starts.
    for i in 1..=4 {
        router
            .handle_message(message("/foo/bar", &format!("m{i}")))
            .unwrap();
    }

    // A persisted subscriber whose cursor stops at id 2.
    let mut params = fanout::RouteParams::new();
    params.insert(USER_ID_KEY.to_string(), "user01".to_string());
    params.insert(CONNECTOR_PARAM.to_string(), "apns".to_string());
    let path = Path::from("/foo/bar");
    let key = subscriber_key(&path, &params);
    let record = SubscriberData {
        path,
        params,
        last_id: 2,
    };
    kv.put("apns", &key, &serde_json::to_vec(&record).unwrap())
        .unwrap();

    let sender = RecordingSender::new();
    let connector = Connector::new(
        Arc::clone(&router),
        Arc::clone(&sender) as Arc<dyn Sender>,
        ConnectorConfig {
            name: "apns".to_string(),
            schema: "apns".to_string(),
            ..ConnectorConfig::default()
        },
    );
    let handler = Arc::new(CountingHandler {
        handled: AtomicUsize::new(0),
    });
    connector.set_response_handler(Arc::clone(&handler) as Arc<dyn ResponseHandler>);
    connector.start().unwrap();

    // The gap (ids 3 and 4) is replayed from the store.
    assert!(wait_until(Duration::from_secs(5), || sender.ids() == vec![3, 4]));
    let subscriber = connector.manager().find(&key).unwrap();
    assert_eq!(subscriber.last_id(), 4);

    // Live traffic continues after the replay. Publish until a live
    // message lands; the runner's subscribe may still be in flight for
    // the first few.
    let mut published = Vec::new();
    assert!(wait_until(Duration::from_secs(5), || {
        let ids = sender.ids();
        if published.last().is_some_and(|last| ids.last() == Some(last)) {
            return true;
        }
        published.push(router.handle_message(message("/foo/bar", "live")).unwrap());
        false
    }));

    let ids = sender.ids();
    assert_eq!(&ids[..2], &[3, 4]);
    // Live deliveries are a contiguous ascending run of published ids.
    let live: Vec<u64> = ids[2..].to_vec();
    assert!(!live.is_empty());
    assert!(live.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(live.iter().all(|id| published.contains(id)));
    assert_eq!(subscriber.last_id(), *live.last().unwrap());

    connector.stop();
    router.stop();

    // Once the queue has drained, every delivery was handled.
    assert_eq!(handler.handled.load(Ordering::SeqCst), sender.ids().len());
}

#[test]
fn evicted_subscriber_restarts_and_replays_missed_messages() {
    let dir = tempfile::tempdir().unwrap();
    let kv = Arc::new(MemoryKvStore::new());
    let router = started_router(&dir, Arc::clone(&kv));

    let sender = RecordingSender::new();
    let connector = Connector::new(
        Arc::clone(&router),
        Arc::clone(&sender) as Arc<dyn Sender>,
        ConnectorConfig {
            name: "apns".to_string(),
            schema: "apns".to_string(),
            // A tiny channel so an undrained burst evicts the route.
            channel_size: 1,
            ..ConnectorConfig::default()
        },
    );
    connector.start().unwrap();

    let mut params = fanout::RouteParams::new();
    params.insert(USER_ID_KEY.to_string(), "user01".to_string());
    let subscriber = connector.create_subscription("foo/bar", params).unwrap();

    // Close the route under the subscriber to force the restart path.
    let pre_close_cursor = subscriber.last_id();
    subscriber.route().close();

    // Messages published while the subscriber is down are replayed from
    // the store after the restart.
    let mut published = Vec::new();
    for i in 1..=5 {
        published.push(
            router
                .handle_message(message("/foo/bar", &format!("m{i}")))
                .unwrap(),
        );
    }

    assert!(wait_until(Duration::from_secs(10), || {
        subscriber.last_id() == *published.last().unwrap()
    }));

    // Everything after the pre-close cursor arrived at least once, and
    // first deliveries came in id order (duplicates are allowed where a
    // message was both fetched and delivered live).
    let mut seen = std::collections::BTreeSet::new();
    let mut first_deliveries = Vec::new();
    for id in sender.ids() {
        if id > pre_close_cursor && seen.insert(id) {
            first_deliveries.push(id);
        }
    }
    assert_eq!(first_deliveries, published);

    connector.stop();
    router.stop();
}
