use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// The field/value pairs of a hash entry
pub type Fields = BTreeMap<String, String>;

const BUS_CAPACITY: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("the key-value store is unavailable")]
    Unavailable,
    #[error("key `{key}` holds a {found} value, but a {expected} value was expected")]
    WrongKind {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// A message published on a pub/sub channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub channel: Arc<str>,
    pub payload: String,
}

/// The key-value and pub/sub backend shared with the scenario controller, the LB selector and the
/// sidecars
///
/// Keys are namespaced by module (`<module>:...`). Hash entries hold string fields, JSON entries
/// hold a whole document.
pub trait Store: Send + Sync {
    fn set_entry(&self, key: &str, fields: Fields) -> Result<(), StoreError>;
    fn get_entry(&self, key: &str) -> Result<Option<Fields>, StoreError>;
    fn del_entry(&self, key: &str) -> Result<(), StoreError>;
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    fn json_get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn json_set(&self, key: &str, json: String) -> Result<(), StoreError>;
    /// Removes every key belonging to `module`
    fn flush(&self, module: &str) -> Result<(), StoreError>;
    fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;
    /// Receives every message published from now on, regardless of the channel
    fn subscribe(&self) -> broadcast::Receiver<Message>;
}

#[derive(Clone, Debug)]
enum Value {
    Hash(Fields),
    Json(String),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Hash(_) => "hash",
            Value::Json(_) => "json",
        }
    }
}

#[derive(Default)]
struct StoreInner {
    entries: BTreeMap<String, Value>,
    published: Vec<Message>,
    unavailable: bool,
}

impl StoreInner {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}

/// A [`Store`] kept in process memory, used by the command-line driver and the tests
///
/// Published messages are recorded, and can be observed through [`InMemoryStore::published`] in
/// addition to the subscription channel.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Mutex<StoreInner>>,
    bus: broadcast::Sender<Message>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(StoreInner::default())),
            bus,
        }
    }

    /// Simulates a backend outage: every operation fails until availability is restored
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    /// All messages published so far, in order
    pub fn published(&self) -> Vec<Message> {
        self.inner.lock().published.clone()
    }

    /// Messages published on `channel`, in order
    pub fn published_on(&self, channel: &str) -> Vec<String> {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|m| &*m.channel == channel)
            .map(|m| m.payload.clone())
            .collect()
    }

    /// Hash entries whose key starts with `prefix`, sorted by key
    pub fn hashes_with_prefix(&self, prefix: &str) -> Vec<(String, Fields)> {
        self.inner
            .lock()
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter_map(|(key, value)| match value {
                Value::Hash(fields) => Some((key.clone(), fields.clone())),
                Value::Json(_) => None,
            })
            .collect()
    }
}

impl Store for InMemoryStore {
    fn set_entry(&self, key: &str, fields: Fields) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        inner.entries.insert(key.to_string(), Value::Hash(fields));
        Ok(())
    }

    fn get_entry(&self, key: &str) -> Result<Option<Fields>, StoreError> {
        let inner = self.inner.lock();
        inner.check_available()?;
        match inner.entries.get(key) {
            None => Ok(None),
            Some(Value::Hash(fields)) => Ok(Some(fields.clone())),
            Some(value) => Err(StoreError::WrongKind {
                key: key.to_string(),
                expected: "hash",
                found: value.kind(),
            }),
        }
    }

    fn del_entry(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        inner.entries.remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock();
        inner.check_available()?;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn json_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock();
        inner.check_available()?;
        match inner.entries.get(key) {
            None => Ok(None),
            Some(Value::Json(json)) => Ok(Some(json.clone())),
            Some(value) => Err(StoreError::WrongKind {
                key: key.to_string(),
                expected: "json",
                found: value.kind(),
            }),
        }
    }

    fn json_set(&self, key: &str, json: String) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        inner.entries.insert(key.to_string(), Value::Json(json));
        Ok(())
    }

    fn flush(&self, module: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        let prefix = format!("{module}:");
        inner.entries.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }

    fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let message = Message {
            channel: channel.into(),
            payload: payload.to_string(),
        };

        {
            let mut inner = self.inner.lock();
            inner.check_available()?;
            inner.published.push(message.clone());
        }

        // Nobody listening is fine
        _ = self.bus.send(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn prefix_queries_only_return_matching_keys() {
        let store = InMemoryStore::new();
        store.set_entry("tc-engine:net:a", fields(&[("x", "1")])).unwrap();
        store.set_entry("tc-engine:net:b", fields(&[("x", "2")])).unwrap();
        store.set_entry("tc-engine:lb:a", fields(&[("x", "3")])).unwrap();
        store.set_entry("tc-engine:netz", fields(&[("x", "4")])).unwrap();

        let keys = store.keys_with_prefix("tc-engine:net:").unwrap();
        assert_eq!(keys, vec!["tc-engine:net:a", "tc-engine:net:b"]);
    }

    #[test]
    fn flush_only_removes_the_module_keys() {
        let store = InMemoryStore::new();
        store.set_entry("tc-engine:net:a", Fields::new()).unwrap();
        store.set_entry("tc-engine-other:a", Fields::new()).unwrap();
        store.json_set("ctrl-engine:active", "{}".to_string()).unwrap();

        store.flush("tc-engine").unwrap();

        assert!(store.get_entry("tc-engine:net:a").unwrap().is_none());
        assert!(store.get_entry("tc-engine-other:a").unwrap().is_some());
        assert!(store.json_get("ctrl-engine:active").unwrap().is_some());
    }

    #[test]
    fn wrong_value_kind_is_reported() {
        let store = InMemoryStore::new();
        store.json_set("k", "{}".to_string()).unwrap();
        let err = store.get_entry("k").unwrap_err();
        assert!(matches!(err, StoreError::WrongKind { found: "json", .. }));
    }

    #[test]
    fn unavailable_store_rejects_everything() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert_eq!(
            store.set_entry("k", Fields::new()),
            Err(StoreError::Unavailable)
        );
        assert_eq!(store.publish("c", "1"), Err(StoreError::Unavailable));
        assert!(store.published().is_empty());

        store.set_unavailable(false);
        store.publish("c", "1").unwrap();
        assert_eq!(store.published_on("c"), vec!["1"]);
    }

    #[tokio::test]
    async fn subscribers_receive_published_messages() {
        let store = InMemoryStore::new();
        let mut rx = store.subscribe();
        store.publish("tc-engine-net", "7").unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(&*message.channel, "tc-engine-net");
        assert_eq!(message.payload, "7");
    }
}
