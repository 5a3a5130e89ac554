//! Recording edits and committing them as history events

use super::staging::StagedValue;
use super::{decode_object_ids, encode_object_ids, HistoryManager};
use crate::collaborator::{ChangeKind, Collaborator};
use crate::core::event::{encode_snapshot, HistoryEvent, ObjectId, PropertyId};
use crate::core::time_id::TimeId;
use crate::error::Result;
use crate::storage::store::{EventStore, StoreKey};
use tracing::{debug, info, warn};

impl<S: EventStore> HistoryManager<S> {
    /// Merge one edit into the staged batch
    pub fn record(
        &mut self,
        object: ObjectId,
        property: PropertyId,
        value: impl Into<StagedValue>,
        description: &str,
    ) -> Result<()> {
        self.staging.record(object, property, value.into(), description)?;
        if self.staging.pending_time().is_none() {
            let time = self.generator.next();
            self.staging.set_pending_time(time);
        }
        Ok(())
    }

    /// Stage the creation of `object`, snapshotting it through the collaborator
    pub fn record_creation(
        &mut self,
        object: ObjectId,
        collaborator: &dyn Collaborator,
        description: &str,
    ) -> Result<()> {
        let snapshot = collaborator.data_to_store(object, ChangeKind::Creation)?;
        self.record(object, PropertyId::Creation, snapshot, description)
    }

    /// Stage a property change of `object`, reading the new value(s) from
    /// the collaborator
    pub fn record_change(
        &mut self,
        object: ObjectId,
        property: PropertyId,
        collaborator: &dyn Collaborator,
        description: &str,
    ) -> Result<()> {
        let data = collaborator.data_to_store(object, ChangeKind::PropChange(property))?;
        for (property, value) in data {
            self.record(object, property, value, description)?;
        }
        Ok(())
    }

    /// Stage the destruction of `object`. Must be called while the object
    /// still exists so its final state can be snapshotted.
    pub fn record_destruction(
        &mut self,
        object: ObjectId,
        collaborator: &dyn Collaborator,
        description: &str,
    ) -> Result<()> {
        let snapshot = collaborator.data_to_store(object, ChangeKind::Creation)?;
        self.record(object, PropertyId::Object, snapshot, description)
    }

    /// Drop the staged batch without committing it
    pub fn discard_pending(&mut self) {
        if !self.staging.is_empty() {
            debug!(changes = self.staging.changes().len(), "discarded staged changes");
        }
        self.staging.clear();
    }

    /// Commit the staged batch as a new event below HEAD.
    ///
    /// Does nothing on an empty batch. `description` replaces the
    /// accumulated description when given. Every store write happens
    /// before the event is linked, and a failed write leaves the graph and
    /// the staged batch untouched.
    pub fn commit(&mut self, description: Option<&str>) -> Result<Option<TimeId>> {
        if self.staging.is_empty() {
            self.staging.clear();
            return Ok(None);
        }

        let time = match self.staging.pending_time() {
            Some(time) => time,
            None => self.generator.next(),
        };
        let parent = self.graph.require(self.current_time)?;
        let parent_time = parent.id;
        let parent_ref = parent.object_ids_ref;

        let mut writes = Vec::new();
        for (object, props) in self.staging.changes() {
            for (property, value) in props {
                let data = match (value, property, self.staging.touched(*object)) {
                    (StagedValue::Property(bag), _, _) => bag.encode()?,
                    (StagedValue::Snapshot(snapshot), PropertyId::Object, Some(touched)) => {
                        // properties changed before the destruction go back
                        // to their parent values
                        let mut snapshot = snapshot.clone();
                        self.rewind_snapshot(
                            *object,
                            &mut snapshot,
                            touched.iter().cloned(),
                            parent_time,
                        )?;
                        encode_snapshot(&snapshot)?
                    }
                    (StagedValue::Snapshot(snapshot), _, _) => encode_snapshot(snapshot)?,
                };
                writes.push((StoreKey::value(time, *object, property.clone()), data));
            }
        }

        let changed = self.staging.change_map();
        let mut object_ids_ref = parent_ref;
        let changes_object_set = changed.values().any(|props| {
            props.contains(&PropertyId::Creation) || props.contains(&PropertyId::Object)
        });
        if changes_object_set {
            let mut live = decode_object_ids(
                &self.store.get_required(&StoreKey::ObjectIds(parent_ref))?,
            )?;
            for (object, props) in &changed {
                if props.contains(&PropertyId::Creation) {
                    live.insert(*object);
                } else if props.contains(&PropertyId::Object) {
                    live.remove(object);
                }
            }
            writes.push((StoreKey::ObjectIds(time), encode_object_ids(&live)?));
            object_ids_ref = time;
        }

        let mut written = Vec::with_capacity(writes.len());
        for (key, data) in writes {
            if let Err(e) = self.store.put(key.clone(), data) {
                self.rollback_writes(&written);
                return Err(e);
            }
            written.push(key);
        }
        if let Err(e) = self.store.flush() {
            self.rollback_writes(&written);
            return Err(e);
        }

        let description = description
            .map(str::to_string)
            .unwrap_or_else(|| self.staging.description().to_string());
        let event = HistoryEvent::builder(time)
            .prev(parent_time)
            .changed(changed)
            .description(description)
            .object_ids_ref(object_ids_ref)
            .build();
        let objects = event.changed.len();
        self.graph.link_child(event)?;

        self.current_time = time;
        self.staging.clear();
        info!(%time, parent = %parent_time, objects, "committed history event");
        Ok(Some(time))
    }

    fn rollback_writes(&mut self, written: &[StoreKey]) {
        warn!(entries = written.len(), "rolling back partial commit");
        for key in written {
            if let Err(e) = self.store.remove(key) {
                warn!(%key, error = %e, "failed to roll back store entry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{manager, FailingStore, Scene};
    use super::*;
    use crate::config::HistoryConfig;
    use crate::core::event::ValueBag;
    use crate::error::Error;
    use serde_json::json;

    #[test]
    fn test_empty_commit_is_noop() {
        let mut history = manager();
        assert_eq!(history.commit(Some("nothing")).unwrap(), None);
        assert_eq!(history.graph().len(), 1);
        assert_eq!(history.pending_time(), None);
        assert_eq!(history.current_time(), TimeId::ROOT);
    }

    #[test]
    fn test_batch_reuses_pending_time() {
        let mut history = manager();
        let mut scene = Scene::new();
        scene.create(&mut history, 1, &[("transform", json!(0))]);
        let pending = history.pending_time().unwrap();
        scene.create(&mut history, 2, &[("transform", json!(0))]);
        assert_eq!(history.pending_time(), Some(pending));

        let committed = history.commit(None).unwrap().unwrap();
        assert_eq!(committed, pending);
        assert_eq!(history.pending_time(), None);
        assert!(history.staging().is_empty());

        let event = history.event(committed).unwrap();
        assert_eq!(event.changed.len(), 2);
        assert_eq!(event.prev, Some(TimeId::ROOT));
        assert_eq!(history.event(TimeId::ROOT).unwrap().next, vec![committed]);
    }

    #[test]
    fn test_commit_writes_values_and_object_ids() {
        let mut history = manager();
        let mut scene = Scene::new();
        scene.create(&mut history, 1, &[("transform", json!(0))]);
        let e1 = history.commit(Some("create A")).unwrap().unwrap();

        let store = history.store();
        assert!(store.contains(&StoreKey::value(e1, ObjectId(1), PropertyId::Creation)));
        assert!(store.contains(&StoreKey::ObjectIds(e1)));
        assert_eq!(history.event(e1).unwrap().description, "create A");
        assert_eq!(history.event(e1).unwrap().object_ids_ref, e1);

        scene.set(&mut history, 1, "transform", json!(5));
        let e2 = history.commit(None).unwrap().unwrap();
        let event = history.event(e2).unwrap();
        assert_eq!(event.object_ids_ref, e1);
        assert!(!history.store().contains(&StoreKey::ObjectIds(e2)));
        assert_eq!(
            ValueBag::decode(
                &history
                    .store()
                    .get_required(&StoreKey::value(e2, ObjectId(1), PropertyId::named("transform")))
                    .unwrap()
            )
            .unwrap(),
            ValueBag::new(json!(5))
        );
        assert_eq!(history.live_objects().unwrap().len(), 1);
    }

    #[test]
    fn test_destruction_updates_live_set() {
        let mut history = manager();
        let mut scene = Scene::new();
        scene.create(&mut history, 1, &[("transform", json!(0))]);
        scene.create(&mut history, 2, &[("transform", json!(0))]);
        history.commit(None).unwrap();

        scene.remove(&mut history, 1);
        let e2 = history.commit(None).unwrap().unwrap();
        assert_eq!(
            history.live_objects_at(e2).unwrap().into_iter().collect::<Vec<_>>(),
            vec![ObjectId(2)]
        );
    }

    #[test]
    fn test_destroy_and_recreate_in_one_batch() {
        let mut history = manager();
        let mut scene = Scene::new();
        scene.create(&mut history, 1, &[("transform", json!(0))]);
        let e1 = history.commit(None).unwrap().unwrap();

        scene.set(&mut history, 1, "transform", json!(5));
        scene.remove(&mut history, 1);
        scene.create(&mut history, 1, &[("transform", json!(9)), ("color", json!("red"))]);
        let e2 = history.commit(None).unwrap().unwrap();

        let event = history.event(e2).unwrap();
        assert_eq!(
            event.changed[&ObjectId(1)].iter().collect::<Vec<_>>(),
            vec![&PropertyId::Creation, &PropertyId::Object]
        );
        assert_eq!(history.live_objects_at(e2).unwrap().len(), 1);

        // the destruction snapshot holds the state at e1
        let destroyed = crate::core::event::decode_snapshot(
            &history
                .store()
                .get_required(&StoreKey::value(e2, ObjectId(1), PropertyId::Object))
                .unwrap(),
        )
        .unwrap();
        assert_eq!(destroyed[&PropertyId::named("transform")], ValueBag::new(json!(0)));
        assert_eq!(
            history
                .value_at(ObjectId(1), &PropertyId::named("color"), e2)
                .unwrap(),
            ValueBag::new(json!("red"))
        );
        assert!(history
            .value_at(ObjectId(1), &PropertyId::named("color"), e1)
            .is_err());
    }

    #[test]
    fn test_failed_write_leaves_graph_untouched() {
        let store = FailingStore::failing_on("zebra");
        let mut history = HistoryManager::new(store, HistoryConfig::default()).unwrap();
        let mut scene = Scene::new();
        scene.create(&mut history, 1, &[("transform", json!(0)), ("zebra", json!(1))]);
        history.commit(None).unwrap();
        scene.set(&mut history, 1, "transform", json!(1));
        scene.set(&mut history, 1, "zebra", json!(2));

        let before = history.graph().clone();
        let head = history.current_time();
        let err = history.commit(None).unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(history.graph(), &before);
        assert_eq!(history.current_time(), head);
        assert!(!history.staging().is_empty());

        let pending = history.pending_time().unwrap();
        assert!(history.store().keys_at(pending).is_empty());
    }
}
