//! The subscriber population and its persistence.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::subscriber::{subscriber_key, Subscriber, SubscriberData};
use super::ConnectorError;
use crate::protocol::Path;
use crate::router::RouteParams;
use crate::store::KvStore;

/// Keeps the in-memory subscriber population in sync with the KV store.
///
/// Records live under the manager's schema, keyed by the subscriber key.
pub struct Manager {
    schema: String,
    channel_size: usize,
    kv: Arc<dyn KvStore>,
    subscribers: RwLock<HashMap<String, Arc<Subscriber>>>,
}

impl Manager {
    pub fn new(schema: impl Into<String>, channel_size: usize, kv: Arc<dyn KvStore>) -> Self {
        Self {
            schema: schema.into(),
            channel_size,
            kv,
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the population from the KV store. Called once at startup.
    pub fn load(&self) -> Result<(), ConnectorError> {
        let mut subscribers = self.subscribers.write().expect("manager lock poisoned");
        subscribers.clear();
        for (key, value) in self.kv.entries(&self.schema)? {
            let data: SubscriberData = match serde_json::from_slice(&value) {
                Ok(data) => data,
                Err(source) => {
                    tracing::warn!(%key, %source, "skipping undecodable subscriber record");
                    continue;
                }
            };
            let subscriber = Subscriber::from_data(data, self.channel_size);
            subscribers.insert(subscriber.key().to_string(), subscriber);
        }
        tracing::info!(count = subscribers.len(), schema = %self.schema, "loaded subscribers");
        Ok(())
    }

    /// Create and persist a new subscriber.
    pub fn create(
        &self,
        path: Path,
        params: RouteParams,
    ) -> Result<Arc<Subscriber>, ConnectorError> {
        let key = subscriber_key(&path, &params);
        let mut subscribers = self.subscribers.write().expect("manager lock poisoned");
        if subscribers.contains_key(&key) {
            return Err(ConnectorError::SubscriberExists);
        }
        let subscriber = Subscriber::new(path, params, self.channel_size);
        self.persist(&subscriber)?;
        subscribers.insert(key, Arc::clone(&subscriber));
        Ok(subscriber)
    }

    pub fn find(&self, key: &str) -> Option<Arc<Subscriber>> {
        self.subscribers
            .read()
            .expect("manager lock poisoned")
            .get(key)
            .cloned()
    }

    /// Subscribers whose route params contain every filter pair.
    pub fn filter(&self, filters: &RouteParams) -> Vec<Arc<Subscriber>> {
        self.subscribers
            .read()
            .expect("manager lock poisoned")
            .values()
            .filter(|subscriber| {
                let params = subscriber.route().params();
                filters
                    .iter()
                    .all(|(k, v)| params.get(k).is_some_and(|actual| actual == v))
            })
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<Arc<Subscriber>> {
        self.subscribers
            .read()
            .expect("manager lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.subscribers
            .read()
            .expect("manager lock poisoned")
            .len()
    }

    /// Persist the subscriber's current state (params and cursor).
    pub fn update(&self, subscriber: &Subscriber) -> Result<(), ConnectorError> {
        self.persist(subscriber)
    }

    /// Remove the subscriber from the store and the population, and cancel
    /// its drain loop.
    pub fn remove(&self, subscriber: &Subscriber) -> Result<(), ConnectorError> {
        self.kv.delete(&self.schema, subscriber.key())?;
        self.subscribers
            .write()
            .expect("manager lock poisoned")
            .remove(subscriber.key());
        subscriber.cancel();
        Ok(())
    }

    fn persist(&self, subscriber: &Subscriber) -> Result<(), ConnectorError> {
        let value = serde_json::to_vec(&subscriber.data())
            .map_err(|source| ConnectorError::Encode { source })?;
        self.kv.put(&self.schema, subscriber.key(), &value)?;
        Ok(())
    }
}
