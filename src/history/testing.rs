//! Test fixtures: an in-memory scene collaborator and a store that fails
//! on demand

use super::HistoryManager;
use crate::collaborator::{ChangeKind, Collaborator, Restoration, RestoreType};
use crate::config::HistoryConfig;
use crate::core::event::{ObjectId, PropertyData, PropertyId, ValueBag};
use crate::core::time_id::TimeId;
use crate::error::{Error, Result};
use crate::storage::store::{EventStore, InMemoryStore, StoreKey};
use serde_json::Value;
use std::collections::BTreeMap;

/// Every entry of a store, for before/after comparisons
pub(crate) fn store_dump<S: EventStore>(store: &S) -> BTreeMap<StoreKey, Vec<u8>> {
    store
        .keys()
        .into_iter()
        .filter_map(|key| {
            let data = store.get(&key).unwrap()?;
            Some((key, data))
        })
        .collect()
}

/// Fresh history over an in-memory store
pub(crate) fn manager() -> HistoryManager<InMemoryStore> {
    HistoryManager::new(InMemoryStore::new(), HistoryConfig::default()).unwrap()
}

/// A bag of objects with named JSON properties
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Scene {
    objects: BTreeMap<ObjectId, PropertyData>,
}

impl Scene {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Create an object and record its creation
    pub(crate) fn create<S: EventStore>(
        &mut self,
        history: &mut HistoryManager<S>,
        id: u64,
        props: &[(&str, Value)],
    ) {
        let data = props
            .iter()
            .map(|(name, value)| (PropertyId::named(*name), ValueBag::new(value.clone())))
            .collect();
        self.objects.insert(ObjectId(id), data);
        history
            .record_creation(ObjectId(id), &*self, &format!("Create {}", id))
            .unwrap();
    }

    /// Change a property and record it
    pub(crate) fn set<S: EventStore>(
        &mut self,
        history: &mut HistoryManager<S>,
        id: u64,
        name: &str,
        value: Value,
    ) {
        self.objects
            .get_mut(&ObjectId(id))
            .unwrap()
            .insert(PropertyId::named(name), ValueBag::new(value));
        history
            .record_change(ObjectId(id), PropertyId::named(name), &*self, &format!("Set {}", name))
            .unwrap();
    }

    /// Record the destruction of an object, then remove it
    pub(crate) fn remove<S: EventStore>(&mut self, history: &mut HistoryManager<S>, id: u64) {
        history
            .record_destruction(ObjectId(id), &*self, &format!("Delete {}", id))
            .unwrap();
        self.objects.remove(&ObjectId(id));
    }

    pub(crate) fn insert(&mut self, id: u64, data: PropertyData) {
        self.objects.insert(ObjectId(id), data);
    }

    pub(crate) fn get(&self, id: u64, name: &str) -> Option<Value> {
        self.objects
            .get(&ObjectId(id))
            .and_then(|data| data.get(&PropertyId::named(name)))
            .map(|bag| bag.main.clone())
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.objects.contains_key(&ObjectId(id))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Collaborator for Scene {
    fn data_to_store(&self, object: ObjectId, kind: ChangeKind) -> Result<PropertyData> {
        let data = self
            .objects
            .get(&object)
            .ok_or_else(|| Error::Collaborator(format!("no object {}", object)))?;
        match kind {
            ChangeKind::Creation => Ok(data.clone()),
            ChangeKind::PropChange(property) => {
                let value = data
                    .get(&property)
                    .cloned()
                    .ok_or_else(|| Error::Collaborator(format!("no property {}", property)))?;
                Ok(PropertyData::from([(property, value)]))
            }
        }
    }

    fn restore_data(
        &mut self,
        object: ObjectId,
        data: Restoration,
        _restore: RestoreType,
        _old_time: TimeId,
        _new_time: TimeId,
    ) -> Result<()> {
        match data {
            Restoration::Object(snapshot) => {
                self.objects.insert(object, snapshot);
            }
            Restoration::Properties(values) => {
                self.objects
                    .get_mut(&object)
                    .ok_or_else(|| Error::Collaborator(format!("no object {}", object)))?
                    .extend(values);
            }
        }
        Ok(())
    }

    fn destroy(&mut self, object: ObjectId, _add_to_history: bool) -> Result<()> {
        self.objects.remove(&object);
        Ok(())
    }
}

/// In-memory store whose writes and removals of one named property fail
/// while armed
pub(crate) struct FailingStore {
    inner: InMemoryStore,
    property: PropertyId,
    armed: bool,
}

impl FailingStore {
    pub(crate) fn failing_on(name: &str) -> Self {
        Self {
            inner: InMemoryStore::new(),
            property: PropertyId::named(name),
            armed: true,
        }
    }

    /// Like `failing_on`, but accepting everything until armed
    pub(crate) fn disarmed(name: &str) -> Self {
        Self {
            armed: false,
            ..Self::failing_on(name)
        }
    }

    pub(crate) fn arm(&mut self) {
        self.armed = true;
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }

    fn refuses(&self, key: &StoreKey) -> bool {
        self.armed && matches!(key, StoreKey::Value { property, .. } if *property == self.property)
    }
}

impl EventStore for FailingStore {
    fn put(&mut self, key: StoreKey, data: Vec<u8>) -> Result<()> {
        if self.refuses(&key) {
            return Err(Error::Storage(format!("write of {} refused", key)));
        }
        self.inner.put(key, data)
    }

    fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn remove(&mut self, key: &StoreKey) -> Result<bool> {
        if self.refuses(key) {
            return Err(Error::Storage(format!("removal of {} refused", key)));
        }
        self.inner.remove(key)
    }

    fn contains(&self, key: &StoreKey) -> bool {
        self.inner.contains(key)
    }

    fn keys(&self) -> Vec<StoreKey> {
        self.inner.keys()
    }

    fn clear(&mut self) -> Result<()> {
        self.inner.clear()
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}
