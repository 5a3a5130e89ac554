//! Staging buffer: edits made since the last commit

use crate::core::event::{ChangeMap, ObjectId, PropertyData, PropertyId, ValueBag};
use crate::core::time_id::TimeId;
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// A staged value: a single property, or a full-object snapshot for the
/// reserved `creation`/`object` ids
#[derive(Debug, Clone, PartialEq)]
pub enum StagedValue {
    Property(ValueBag),
    Snapshot(PropertyData),
}

impl From<ValueBag> for StagedValue {
    fn from(bag: ValueBag) -> Self {
        Self::Property(bag)
    }
}

impl From<PropertyData> for StagedValue {
    fn from(snapshot: PropertyData) -> Self {
        Self::Snapshot(snapshot)
    }
}

/// In-flight batch of edits, committed as one history event
#[derive(Debug, Clone, Default)]
pub struct StagingBuffer {
    changes: BTreeMap<ObjectId, BTreeMap<PropertyId, StagedValue>>,
    /// Properties changed on an object before it was destroyed and
    /// recreated in this batch
    touched: BTreeMap<ObjectId, BTreeSet<PropertyId>>,
    description: String,
    pending_time: Option<TimeId>,
}

impl StagingBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an edit into the batch.
    ///
    /// Later writes to the same `(object, property)` replace earlier ones.
    /// An object created and destroyed within the batch is dropped. An
    /// object destroyed and then recreated keeps both its `object` and its
    /// `creation` snapshot; later property writes go into the latter.
    pub fn record(
        &mut self,
        object: ObjectId,
        property: PropertyId,
        value: StagedValue,
        description: &str,
    ) -> Result<()> {
        match (&property, &value) {
            (PropertyId::Named(_), StagedValue::Property(_)) => {}
            (PropertyId::Creation | PropertyId::Object, StagedValue::Snapshot(_)) => {}
            _ => {
                return Err(Error::Collaborator(format!(
                    "Value kind does not match property {} of object {}",
                    property, object
                )))
            }
        }

        self.append_description(description);

        let entry = self.changes.entry(object).or_default();
        let destroyed = entry.contains_key(&PropertyId::Object);
        let created = entry.contains_key(&PropertyId::Creation);
        match property {
            PropertyId::Object if created && destroyed => {
                // destroyed again: only the original destruction remains
                entry.retain(|p, _| *p == PropertyId::Object);
            }
            PropertyId::Object if created => {
                self.changes.remove(&object);
                self.touched.remove(&object);
            }
            PropertyId::Creation if destroyed => {
                let earlier: Vec<PropertyId> =
                    entry.keys().filter(|p| !p.is_reserved()).cloned().collect();
                for p in &earlier {
                    entry.remove(p);
                }
                entry.insert(property, value);
                self.touched.entry(object).or_default().extend(earlier);
            }
            PropertyId::Named(_) if created && destroyed => {
                if let (Some(StagedValue::Snapshot(snapshot)), StagedValue::Property(bag)) =
                    (entry.get_mut(&PropertyId::Creation), value)
                {
                    snapshot.insert(property, bag);
                }
            }
            _ => {
                entry.insert(property, value);
            }
        }
        Ok(())
    }

    fn append_description(&mut self, description: &str) {
        let description = description.trim();
        if description.is_empty() || self.description.lines().any(|l| l == description) {
            return;
        }
        if !self.description.is_empty() {
            self.description.push('\n');
        }
        self.description.push_str(description);
    }

    /// Whether nothing is staged
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Staged changes
    pub fn changes(&self) -> &BTreeMap<ObjectId, BTreeMap<PropertyId, StagedValue>> {
        &self.changes
    }

    /// Changed map the committed event will carry
    pub fn change_map(&self) -> ChangeMap {
        self.changes
            .iter()
            .map(|(object, props)| (*object, props.keys().cloned().collect()))
            .collect()
    }

    /// Accumulated description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Properties of `object` changed before it was destroyed and
    /// recreated in this batch
    pub fn touched(&self, object: ObjectId) -> Option<&BTreeSet<PropertyId>> {
        self.touched.get(&object)
    }

    /// Time id reserved for this batch
    pub fn pending_time(&self) -> Option<TimeId> {
        self.pending_time
    }

    /// Reserve the time id for this batch
    pub fn set_pending_time(&mut self, time: TimeId) {
        self.pending_time = Some(time);
    }

    /// Empty the buffer
    pub fn clear(&mut self) {
        self.changes.clear();
        self.touched.clear();
        self.description.clear();
        self.pending_time = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag(v: i64) -> StagedValue {
        ValueBag::new(json!(v)).into()
    }

    fn snapshot() -> StagedValue {
        let mut data = PropertyData::new();
        data.insert(PropertyId::named("x"), ValueBag::new(json!(0)));
        data.into()
    }

    #[test]
    fn test_latest_value_wins() {
        let mut buffer = StagingBuffer::new();
        let a = ObjectId(1);
        let x = PropertyId::named("x");
        buffer.record(a, x.clone(), bag(1), "move").unwrap();
        buffer.record(a, x.clone(), bag(2), "move").unwrap();

        assert_eq!(buffer.changes()[&a][&x], bag(2));
        assert_eq!(buffer.description(), "move");
    }

    #[test]
    fn test_creation_marker_survives_later_writes() {
        let mut buffer = StagingBuffer::new();
        let a = ObjectId(1);
        buffer.record(a, PropertyId::Creation, snapshot(), "create").unwrap();
        buffer.record(a, PropertyId::named("x"), bag(5), "move").unwrap();

        let changed = buffer.change_map();
        assert!(changed[&a].contains(&PropertyId::Creation));
        assert!(changed[&a].contains(&PropertyId::named("x")));
        assert_eq!(buffer.description(), "create\nmove");
    }

    #[test]
    fn test_transient_object_dropped() {
        let mut buffer = StagingBuffer::new();
        let a = ObjectId(1);
        buffer.record(a, PropertyId::Creation, snapshot(), "create").unwrap();
        buffer.record(a, PropertyId::named("x"), bag(5), "").unwrap();
        buffer.record(a, PropertyId::Object, snapshot(), "delete").unwrap();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_destroy_then_recreate_keeps_both_snapshots() {
        let mut buffer = StagingBuffer::new();
        let a = ObjectId(1);
        let x = PropertyId::named("x");
        buffer.record(a, x.clone(), bag(4), "move").unwrap();
        buffer.record(a, PropertyId::Object, snapshot(), "delete").unwrap();
        buffer.record(a, PropertyId::Creation, snapshot(), "create").unwrap();
        buffer.record(a, x.clone(), bag(7), "move").unwrap();

        let changed = buffer.change_map();
        assert_eq!(
            changed[&a].iter().collect::<Vec<_>>(),
            vec![&PropertyId::Creation, &PropertyId::Object]
        );
        assert_eq!(buffer.touched(a).unwrap().iter().collect::<Vec<_>>(), vec![&x]);
        match &buffer.changes()[&a][&PropertyId::Creation] {
            StagedValue::Snapshot(data) => assert_eq!(data[&x], ValueBag::new(json!(7))),
            other => panic!("unexpected {:?}", other),
        }

        // destroyed once more: back to a plain destruction
        buffer.record(a, PropertyId::Object, snapshot(), "delete").unwrap();
        assert_eq!(
            buffer.change_map()[&a].iter().collect::<Vec<_>>(),
            vec![&PropertyId::Object]
        );
        assert!(buffer.touched(a).is_some());

        buffer.clear();
        assert!(buffer.touched(a).is_none());
    }

    #[test]
    fn test_mismatched_value_kind() {
        let mut buffer = StagingBuffer::new();
        let err = buffer
            .record(ObjectId(1), PropertyId::Creation, bag(1), "")
            .unwrap_err();
        assert!(matches!(err, Error::Collaborator(_)));
        assert!(buffer.is_empty());
    }
}
