//! RocksDB-backed subscription store.
//!
//! # Key Design
//!
//! All keys are ASCII namespaces separated by `0x1F`:
//!
//! - `i␟<id:be64>` → subscription JSON (primary record)
//! - `t␟<topic>␟<id:be64>` → subscription JSON (topic index, prefix scans)
//! - `f␟<feed>␟<id:be64>` → empty (feed index)
//! - `m␟next_id` → next id as big-endian u64
//!
//! Big-endian ids keep index entries of one topic in insertion order.
//! Topics and feeds containing `0x1F` are rejected on insert and never match
//! a lookup.

use super::SubscriptionStore;
use crate::{Error, Result};
use feedspool_core::Subscription;
use parking_lot::Mutex;
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const SEP: u8 = 0x1F;
const NEXT_ID_KEY: &[u8] = b"m\x1Fnext_id";

/// Subscription store persisted in RocksDB.
///
/// Thread-safe: can be shared across threads via `Arc`.
pub struct RocksSubscriptionStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    // Serializes id allocation and index maintenance.
    write_lock: Mutex<()>,
}

impl RocksSubscriptionStore {
    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening subscription store at {}", path.display());

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.increase_parallelism(num_cpus::get() as i32);

        let db = DBWithThreadMode::<MultiThreaded>::open(&opts, path)?;
        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    fn next_id(&self) -> Result<u64> {
        let current = match self.db.get(NEXT_ID_KEY)? {
            Some(bytes) => decode_id(&bytes)?,
            None => 1,
        };
        Ok(current)
    }

    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }

    fn decode_all(entries: Vec<(Box<[u8]>, Box<[u8]>)>) -> Result<HashSet<Subscription>> {
        entries
            .into_iter()
            .map(|(_, value)| serde_json::from_slice(&value).map_err(Error::from))
            .collect()
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl SubscriptionStore for RocksSubscriptionStore {
    fn insert(&self, mut subscription: Subscription) -> Result<u64> {
        for (what, value) in [
            ("topic", &subscription.topic),
            ("feed", &subscription.metadata.feed),
        ] {
            if has_separator(value) {
                return Err(Error::Store(format!(
                    "{what} {value:?} contains the key separator 0x1F"
                )));
            }
        }

        let _guard = self.write_lock.lock();

        let id = self.next_id()?;
        subscription.id = id;
        let value = serde_json::to_vec(&subscription)?;

        let mut batch = WriteBatch::default();
        batch.put(id_key(id), &value);
        batch.put(topic_key(&subscription.topic, id), &value);
        batch.put(feed_key(&subscription.metadata.feed, id), b"");
        batch.put(NEXT_ID_KEY, (id + 1).to_be_bytes());
        self.db.write(batch)?;

        debug!(id, topic = %subscription.topic, "Stored subscription");
        Ok(id)
    }

    fn delete(&self, id: u64) -> Result<Option<Subscription>> {
        let _guard = self.write_lock.lock();

        let Some(subscription) = self.load(id)? else {
            return Ok(None);
        };

        let mut batch = WriteBatch::default();
        batch.delete(id_key(id));
        batch.delete(topic_key(&subscription.topic, id));
        batch.delete(feed_key(&subscription.metadata.feed, id));
        self.db.write(batch)?;

        debug!(id, topic = %subscription.topic, "Deleted subscription");
        Ok(Some(subscription))
    }

    fn load(&self, id: u64) -> Result<Option<Subscription>> {
        match self.db.get(id_key(id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn load_by_topic(&self, topic: &str) -> Result<HashSet<Subscription>> {
        if has_separator(topic) {
            return Ok(HashSet::new());
        }
        let mut prefix = namespaced(b't', topic.as_bytes());
        prefix.push(SEP);
        Self::decode_all(self.scan(&prefix)?)
    }

    fn load_by_starts_with_topic(&self, prefix: &str) -> Result<HashSet<Subscription>> {
        if has_separator(prefix) {
            return Ok(HashSet::new());
        }
        Self::decode_all(self.scan(&namespaced(b't', prefix.as_bytes()))?)
    }

    fn load_by_feed(&self, feed: &str) -> Result<HashSet<Subscription>> {
        if has_separator(feed) {
            return Ok(HashSet::new());
        }
        let mut prefix = namespaced(b'f', feed.as_bytes());
        prefix.push(SEP);

        let mut subscriptions = HashSet::new();
        for (key, _) in self.scan(&prefix)? {
            let id = decode_id(&key[prefix.len()..])?;
            if let Some(subscription) = self.load(id)? {
                subscriptions.insert(subscription);
            }
        }
        Ok(subscriptions)
    }

    fn clean_up(&self) {
        if let Err(e) = self.flush() {
            tracing::warn!("Failed to flush subscription store: {}", e);
        }
    }
}

fn has_separator(value: &str) -> bool {
    value.as_bytes().contains(&SEP)
}

fn namespaced(namespace: u8, value: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(value.len() + 2 + 8);
    key.push(namespace);
    key.push(SEP);
    key.extend_from_slice(value);
    key
}

fn id_key(id: u64) -> Vec<u8> {
    namespaced(b'i', &id.to_be_bytes())
}

fn topic_key(topic: &str, id: u64) -> Vec<u8> {
    let mut key = namespaced(b't', topic.as_bytes());
    key.push(SEP);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn feed_key(feed: &str, id: u64) -> Vec<u8> {
    let mut key = namespaced(b'f', feed.as_bytes());
    key.push(SEP);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn decode_id(bytes: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Store(format!("invalid id of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedspool_core::EventMetadata;
    use tempfile::TempDir;

    fn subscription(topic: &str, feed: &str, channel: &str) -> Subscription {
        Subscription::new(topic, EventMetadata::new(feed), channel)
    }

    #[test]
    fn test_insert_and_load() {
        let tmp = TempDir::new().unwrap();
        let store = RocksSubscriptionStore::open(tmp.path()).unwrap();

        let id = store.insert(subscription("user:1", "feed", "chan")).unwrap();
        let loaded = store.load(id).unwrap().unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.topic, "user:1");
        assert!(store.load(id + 100).unwrap().is_none());
    }

    #[test]
    fn test_topic_lookups() {
        let tmp = TempDir::new().unwrap();
        let store = RocksSubscriptionStore::open(tmp.path()).unwrap();

        store.insert(subscription("user:1", "feed", "c1")).unwrap();
        store.insert(subscription("user:1", "feed", "c2")).unwrap();
        store.insert(subscription("user:12", "feed", "c3")).unwrap();
        store.insert(subscription("group", "feed", "c4")).unwrap();

        assert_eq!(store.load_by_topic("user:1").unwrap().len(), 2);
        assert_eq!(store.load_by_starts_with_topic("user:1").unwrap().len(), 3);
        assert_eq!(store.load_by_starts_with_topic("user").unwrap().len(), 3);
        assert!(store.load_by_topic("user").unwrap().is_empty());
    }

    #[test]
    fn test_separator_in_topic_or_feed_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = RocksSubscriptionStore::open(tmp.path()).unwrap();

        store.insert(subscription("a", "feed", "c1")).unwrap();
        assert!(matches!(
            store.insert(subscription("a\x1Fb", "feed", "c2")),
            Err(Error::Store(_))
        ));
        assert!(matches!(
            store.insert(subscription("b", "feed\x1F", "c3")),
            Err(Error::Store(_))
        ));

        // A lookup spelled with the separator cannot reach topic "a".
        assert!(store.load_by_starts_with_topic("a\x1F").unwrap().is_empty());
        assert!(store.load_by_topic("a\x1F").unwrap().is_empty());
        assert_eq!(store.load_by_topic("a").unwrap().len(), 1);
        assert_eq!(store.load_by_feed("feed").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_removes_indexes() {
        let tmp = TempDir::new().unwrap();
        let store = RocksSubscriptionStore::open(tmp.path()).unwrap();

        let id = store.insert(subscription("t", "feed-a", "c1")).unwrap();
        assert_eq!(store.load_by_feed("feed-a").unwrap().len(), 1);

        let removed = store.delete(id).unwrap().unwrap();
        assert_eq!(removed.channel, "c1");
        assert!(store.load_by_topic("t").unwrap().is_empty());
        assert!(store.load_by_feed("feed-a").unwrap().is_empty());
        assert!(store.delete(id).unwrap().is_none());
    }

    #[test]
    fn test_ids_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let first = {
            let store = RocksSubscriptionStore::open(tmp.path()).unwrap();
            store.insert(subscription("a", "f", "c")).unwrap()
        };

        let store = RocksSubscriptionStore::open(tmp.path()).unwrap();
        let second = store.insert(subscription("b", "f", "c")).unwrap();
        assert!(second > first);
        assert_eq!(store.load_by_topic("a").unwrap().len(), 1);
    }
}
