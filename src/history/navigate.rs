//! Moving HEAD through the graph: undo, redo and jumps between branches

use super::HistoryManager;
use crate::collaborator::{Collaborator, Restoration, RestoreType};
use crate::core::event::{decode_snapshot, ObjectId, PropertyData, PropertyId, ValueBag};
use crate::core::time_id::TimeId;
use crate::error::{Error, Result};
use crate::storage::store::{EventStore, StoreKey};
use tracing::{debug, info};

/// Collaborator calls needed to move HEAD across one event.
///
/// Plans only read the graph and the store, so a whole multi-step move can
/// be planned (and fail on a missing blob) before anything is applied.
#[derive(Debug, Default)]
struct StepPlan {
    from: TimeId,
    to: TimeId,
    rebuild: Vec<(ObjectId, PropertyData)>,
    restore: Vec<(ObjectId, PropertyData)>,
    destroy: Vec<ObjectId>,
}

impl StepPlan {
    fn apply(&self, collaborator: &mut dyn Collaborator, restore: RestoreType) -> Result<()> {
        for (object, snapshot) in &self.rebuild {
            collaborator.restore_data(
                *object,
                Restoration::Object(snapshot.clone()),
                restore,
                self.from,
                self.to,
            )?;
        }
        for (object, values) in &self.restore {
            collaborator.restore_data(
                *object,
                Restoration::Properties(values.clone()),
                restore,
                self.from,
                self.to,
            )?;
        }
        for object in &self.destroy {
            collaborator.destroy(*object, false)?;
        }
        Ok(())
    }
}

impl<S: EventStore> HistoryManager<S> {
    /// Step HEAD back to its parent. Commits any staged batch first.
    ///
    /// Returns the new HEAD, or `None` when already at the root.
    pub fn undo(&mut self, collaborator: &mut dyn Collaborator) -> Result<Option<TimeId>> {
        self.commit(None)?;
        if self.graph.require(self.current_time)?.prev.is_none() {
            debug!("undo at root ignored");
            return Ok(None);
        }

        let plan = self.plan_undo(self.current_time)?;
        plan.apply(collaborator, RestoreType::Undo)?;
        self.current_time = plan.to;
        info!(from = %plan.from, to = %plan.to, "undo");
        Ok(Some(plan.to))
    }

    /// Step HEAD forward along the most recently created branch. Commits
    /// any staged batch first.
    ///
    /// Returns the new HEAD, or `None` when there is nothing to redo.
    pub fn redo(&mut self, collaborator: &mut dyn Collaborator) -> Result<Option<TimeId>> {
        self.commit(None)?;
        let Some(next) = self.graph.require(self.current_time)?.latest_next() else {
            debug!("redo without branch ignored");
            return Ok(None);
        };

        let plan = self.plan_redo(next)?;
        plan.apply(collaborator, RestoreType::Redo)?;
        self.current_time = plan.to;
        info!(from = %plan.from, to = %plan.to, "redo");
        Ok(Some(plan.to))
    }

    /// Move HEAD to any event: undo up to the common ancestor, then redo
    /// down the target's branch.
    ///
    /// Returns `None` when HEAD already is `target`.
    pub fn travel_to(
        &mut self,
        target: TimeId,
        collaborator: &mut dyn Collaborator,
    ) -> Result<Option<TimeId>> {
        self.commit(None)?;
        self.graph.require(target)?;
        if target == self.current_time {
            return Ok(None);
        }

        let path = self.graph.path_between(self.current_time, target)?;
        let mut plans = Vec::with_capacity(path.undo.len() + path.redo.len());
        for time in &path.undo {
            plans.push(self.plan_undo(*time)?);
        }
        for time in &path.redo {
            plans.push(self.plan_redo(*time)?);
        }

        for plan in &plans {
            plan.apply(collaborator, RestoreType::UndoRedo)?;
            self.current_time = plan.to;
        }
        info!(
            to = %target,
            undone = path.undo.len(),
            redone = path.redo.len(),
            "travelled through history"
        );
        Ok(Some(target))
    }

    fn plan_undo(&self, time: TimeId) -> Result<StepPlan> {
        let event = self.graph.require(time)?;
        let parent = event
            .prev
            .ok_or_else(|| Error::InvalidOperation(format!("Cannot undo root event {}", time)))?;
        let mut plan = StepPlan {
            from: time,
            to: parent,
            ..StepPlan::default()
        };

        for (object, props) in &event.changed {
            // an `object` snapshot means the object was alive at the parent,
            // even when it was recreated at this event
            if props.contains(&PropertyId::Object) {
                let key = StoreKey::value(time, *object, PropertyId::Object);
                let snapshot = decode_snapshot(&self.store.get_required(&key)?)?;
                plan.rebuild.push((*object, snapshot));
            } else if props.contains(&PropertyId::Creation) {
                plan.destroy.push(*object);
                continue;
            }

            let mut values = PropertyData::new();
            for property in props.iter().filter(|p| !p.is_reserved()) {
                values.insert(property.clone(), self.value_at(*object, property, parent)?);
            }
            if !values.is_empty() {
                plan.restore.push((*object, values));
            }
        }
        Ok(plan)
    }

    fn plan_redo(&self, time: TimeId) -> Result<StepPlan> {
        let event = self.graph.require(time)?;
        let parent = event
            .prev
            .ok_or_else(|| Error::InvalidOperation(format!("Cannot redo root event {}", time)))?;
        let mut plan = StepPlan {
            from: parent,
            to: time,
            ..StepPlan::default()
        };

        for (object, props) in &event.changed {
            if props.contains(&PropertyId::Creation) {
                let key = StoreKey::value(time, *object, PropertyId::Creation);
                let snapshot = decode_snapshot(&self.store.get_required(&key)?)?;
                plan.rebuild.push((*object, snapshot));
            } else if props.contains(&PropertyId::Object) {
                plan.destroy.push(*object);
                continue;
            }

            let mut values = PropertyData::new();
            for property in props.iter().filter(|p| !p.is_reserved()) {
                let key = StoreKey::value(time, *object, property.clone());
                values.insert(property.clone(), ValueBag::decode(&self.store.get_required(&key)?)?);
            }
            if !values.is_empty() {
                plan.restore.push((*object, values));
            }
        }
        Ok(plan)
    }
}
