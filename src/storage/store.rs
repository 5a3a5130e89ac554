//! Event store: keyed blob storage for property values and object-id snapshots

use crate::core::event::{ObjectId, PropertyId};
use crate::core::time_id::TimeId;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Subfile name of the HEAD entry
pub const TIME_ID_ENTRY: &str = "time_id";

/// Subfile name of the serialized event graph
pub const EVENTS_ENTRY: &str = "events";

/// Subfile suffix of live-object-id snapshots
pub const OBJECT_IDS_ENTRY: &str = "object_ids";

/// Address of one entry in the store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StoreKey {
    /// Current HEAD
    TimeId,
    /// The serialized event graph
    Events,
    /// A property value at a point in time
    Value {
        time: TimeId,
        object: ObjectId,
        property: PropertyId,
    },
    /// Live-object-id snapshot taken at a point in time
    ObjectIds(TimeId),
}

impl StoreKey {
    /// Key of a property value
    pub fn value(time: TimeId, object: ObjectId, property: PropertyId) -> Self {
        Self::Value {
            time,
            object,
            property,
        }
    }

    /// Time this entry belongs to, if any
    pub fn time(&self) -> Option<TimeId> {
        match self {
            Self::Value { time, .. } | Self::ObjectIds(time) => Some(*time),
            Self::TimeId | Self::Events => None,
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimeId => write!(f, "{}", TIME_ID_ENTRY),
            Self::Events => write!(f, "{}", EVENTS_ENTRY),
            Self::Value {
                time,
                object,
                property,
            } => write!(f, "{}/{}/{}", time.to_key(), object, property),
            Self::ObjectIds(time) => write!(f, "{}/{}", time.to_key(), OBJECT_IDS_ENTRY),
        }
    }
}

impl FromStr for StoreKey {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            TIME_ID_ENTRY => return Ok(Self::TimeId),
            EVENTS_ENTRY => return Ok(Self::Events),
            _ => {}
        }

        let mut parts = name.splitn(3, '/');
        let time = parts
            .next()
            .ok_or_else(|| Error::Storage(format!("Invalid entry name: {}", name)))
            .and_then(TimeId::from_key)?;

        match (parts.next(), parts.next()) {
            (Some(OBJECT_IDS_ENTRY), None) => Ok(Self::ObjectIds(time)),
            (Some(object), Some(property)) => {
                let object = object
                    .parse()
                    .map(ObjectId)
                    .map_err(|_| Error::Storage(format!("Invalid object id in entry: {}", name)))?;
                let property = PropertyId::try_from(property.to_string())
                    .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(Self::value(time, object, property))
            }
            _ => Err(Error::Storage(format!("Invalid entry name: {}", name))),
        }
    }
}

/// Trait for store implementations.
///
/// Entries are only removed by merge, archive or branch pruning; undo and
/// redo never mutate the store.
pub trait EventStore {
    /// Write an entry, replacing any previous value
    fn put(&mut self, key: StoreKey, data: Vec<u8>) -> Result<()>;

    /// Read an entry
    fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>>;

    /// Remove an entry, returning whether it existed
    fn remove(&mut self, key: &StoreKey) -> Result<bool>;

    /// Whether an entry exists
    fn contains(&self, key: &StoreKey) -> bool;

    /// All keys in order
    fn keys(&self) -> Vec<StoreKey>;

    /// Remove every entry
    fn clear(&mut self) -> Result<()>;

    /// Persist pending mutations
    fn flush(&mut self) -> Result<()>;

    /// Read an entry that the event graph says must exist
    fn get_required(&self, key: &StoreKey) -> Result<Vec<u8>> {
        self.get(key)?.ok_or_else(|| Error::StorageRead {
            key: key.to_string(),
        })
    }

    /// Keys of every entry stored for `time`
    fn keys_at(&self, time: TimeId) -> Vec<StoreKey> {
        self.keys()
            .into_iter()
            .filter(|key| key.time() == Some(time))
            .collect()
    }
}

/// In-memory implementation of the event store
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    entries: BTreeMap<StoreKey, Vec<u8>>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl EventStore for InMemoryStore {
    fn put(&mut self, key: StoreKey, data: Vec<u8>) -> Result<()> {
        self.entries.insert(key, data);
        Ok(())
    }

    fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).cloned())
    }

    fn remove(&mut self, key: &StoreKey) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn contains(&self, key: &StoreKey) -> bool {
        self.entries.contains_key(key)
    }

    fn keys(&self) -> Vec<StoreKey> {
        self.entries.keys().cloned().collect()
    }

    fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        // In-memory store doesn't need flushing
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_names() {
        let key = StoreKey::value(TimeId::new(12, 3), ObjectId(7), PropertyId::named("a/b"));
        assert_eq!(key.to_string(), "12_3/7/p:a/b");
        assert_eq!("12_3/7/p:a/b".parse::<StoreKey>().unwrap(), key);

        let key = StoreKey::ObjectIds(TimeId::new(12, 3));
        assert_eq!(key.to_string(), "12_3/object_ids");
        assert_eq!("12_3/object_ids".parse::<StoreKey>().unwrap(), key);

        assert_eq!("time_id".parse::<StoreKey>().unwrap(), StoreKey::TimeId);
        assert_eq!("events".parse::<StoreKey>().unwrap(), StoreKey::Events);
        assert!("12_3".parse::<StoreKey>().is_err());
        assert!("12_3/x/creation".parse::<StoreKey>().is_err());
    }

    #[test]
    fn test_in_memory_store() {
        let mut store = InMemoryStore::new();
        let t1 = TimeId::new(1, 0);
        let key = StoreKey::value(t1, ObjectId(1), PropertyId::Creation);

        store.put(key.clone(), b"snapshot".to_vec()).unwrap();
        store.put(StoreKey::ObjectIds(t1), b"[1]".to_vec()).unwrap();
        store.put(StoreKey::Events, b"graph".to_vec()).unwrap();

        assert_eq!(store.get(&key).unwrap(), Some(b"snapshot".to_vec()));
        assert_eq!(store.keys_at(t1).len(), 2);
        assert!(store.remove(&key).unwrap());
        assert!(!store.remove(&key).unwrap());

        let err = store.get_required(&key).unwrap_err();
        assert!(matches!(err, Error::StorageRead { .. }));
    }
}
