//! Per-subscriber delivery channel.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};

use super::{Router, RouterError};
use crate::protocol::{Message, Path};

/// Route-param key carrying the subscribing user.
pub const USER_ID_KEY: &str = "user_id";
/// Route-param key identifying the application; at most one route exists
/// per `(application_id, path)` in the router.
pub const APPLICATION_ID_KEY: &str = "application_id";

pub type RouteParams = BTreeMap<String, String>;

#[derive(Clone, Debug)]
pub struct RouteConfig {
    pub path: Path,
    pub params: RouteParams,
    pub channel_size: usize,
}

/// A subscriber's live delivery channel.
///
/// The router owns delivery (`deliver`), the subscriber owns draining
/// (`receiver`). Delivery never blocks: a full channel closes the route,
/// which evicts the slow consumer and lets its supervisor restart it.
pub struct Route {
    path: Path,
    params: RwLock<RouteParams>,
    sender: Mutex<Option<Sender<Arc<Message>>>>,
    receiver: Receiver<Arc<Message>>,
}

impl Route {
    pub fn new(config: RouteConfig) -> Arc<Self> {
        let (sender, receiver) = bounded(config.channel_size.max(1));
        Arc::new(Self {
            path: config.path,
            params: RwLock::new(config.params),
            sender: Mutex::new(Some(sender)),
            receiver,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.params
            .read()
            .expect("route params lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.params
            .write()
            .expect("route params lock poisoned")
            .insert(key.into(), value.into());
    }

    pub fn params(&self) -> RouteParams {
        self.params
            .read()
            .expect("route params lock poisoned")
            .clone()
    }

    pub fn user_id(&self) -> String {
        self.get(USER_ID_KEY).unwrap_or_default()
    }

    pub fn application_id(&self) -> String {
        self.get(APPLICATION_ID_KEY).unwrap_or_default()
    }

    /// The consumer half; disconnects once the route is closed.
    pub fn receiver(&self) -> &Receiver<Arc<Message>> {
        &self.receiver
    }

    /// Register this route with the router. `fetch_first` marks routes
    /// whose caller drains historical messages via fetch before the live
    /// channel; the router treats both the same.
    pub fn provide(self: &Arc<Self>, router: &Router, fetch_first: bool) -> Result<(), RouterError> {
        let _ = fetch_first;
        router.subscribe(Arc::clone(self)).map(|_| ())
    }

    /// Non-blocking delivery. A closed or full channel yields
    /// [`RouterError::InvalidRoute`]; on overflow the route is closed so
    /// the draining side observes the eviction.
    pub fn deliver(&self, message: &Arc<Message>) -> Result<(), RouterError> {
        let mut sender = self.sender.lock().expect("route sender lock poisoned");
        let Some(tx) = sender.as_ref() else {
            return Err(RouterError::InvalidRoute);
        };
        match tx.try_send(Arc::clone(message)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(path = %self.path, "route channel full, closing route");
                *sender = None;
                Err(RouterError::InvalidRoute)
            }
            Err(TrySendError::Disconnected(_)) => {
                *sender = None;
                Err(RouterError::InvalidRoute)
            }
        }
    }

    /// Close the delivery channel. Idempotent.
    pub fn close(&self) {
        let mut sender = self.sender.lock().expect("route sender lock poisoned");
        *sender = None;
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .expect("route sender lock poisoned")
            .is_none()
    }

    /// Routes are replaced on `(application_id, path)` collisions.
    pub(crate) fn same_target(&self, other: &Route) -> bool {
        self.path == other.path && self.application_id() == other.application_id()
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("path", &self.path)
            .field("params", &self.params())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn route(channel_size: usize) -> Arc<Route> {
        let mut params = RouteParams::new();
        params.insert(USER_ID_KEY.to_string(), "user01".to_string());
        params.insert(APPLICATION_ID_KEY.to_string(), "phone01".to_string());
        Route::new(RouteConfig {
            path: Path::from("/foo"),
            params,
            channel_size,
        })
    }

    fn message(id: u64) -> Arc<Message> {
        Arc::new(Message {
            id,
            node_id: 0,
            time: 0,
            path: Path::from("/foo"),
            user_id: "user01".to_string(),
            application_id: "phone01".to_string(),
            publisher_message_id: None,
            headers: BTreeMap::new(),
            body: Bytes::from_static(b"hi"),
        })
    }

    #[test]
    fn deliver_and_drain() {
        let route = route(4);
        route.deliver(&message(1)).unwrap();
        route.deliver(&message(2)).unwrap();

        assert_eq!(route.receiver().recv().unwrap().id, 1);
        assert_eq!(route.receiver().recv().unwrap().id, 2);
    }

    #[test]
    fn overflow_closes_route() {
        let route = route(1);
        route.deliver(&message(1)).unwrap();

        let err = route.deliver(&message(2)).unwrap_err();
        assert!(matches!(err, RouterError::InvalidRoute));
        assert!(route.is_closed());

        // The queued message is still drainable, then the channel ends.
        assert_eq!(route.receiver().recv().unwrap().id, 1);
        assert!(route.receiver().recv().is_err());
    }

    #[test]
    fn close_is_idempotent_and_rejects_delivery() {
        let route = route(4);
        route.close();
        route.close();
        assert!(route.is_closed());
        assert!(matches!(
            route.deliver(&message(1)),
            Err(RouterError::InvalidRoute)
        ));
    }

    #[test]
    fn params_can_be_substituted() {
        let route = route(1);
        route.set("device_token", "old");
        assert_eq!(route.get("device_token").as_deref(), Some("old"));
        route.set("device_token", "new");
        assert_eq!(route.get("device_token").as_deref(), Some("new"));
    }
}
