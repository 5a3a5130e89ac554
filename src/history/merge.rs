//! Merge/compaction and archive.
//!
//! A run of consecutive non-milestone events is folded forward into its
//! last event: that event ends up holding the net change of the whole run
//! and the intermediate events are removed together with their blobs.
//! Objects created and destroyed inside a run disappear entirely.
//!
//! Both operations either complete or leave the graph and the store as
//! they found them.

use super::{encode_object_ids, HistoryManager};
use crate::collaborator::Collaborator;
use crate::core::event::{
    decode_snapshot, encode_snapshot, ChangeMap, HistoryEvent, ObjectId, PropertyData, PropertyId,
    ValueBag,
};
use crate::core::graph::EventGraph;
use crate::core::time_id::TimeId;
use crate::error::{Error, Result};
use crate::storage::store::{EventStore, StoreKey};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Summary of a merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Runs folded
    pub runs: usize,
    /// Events folded away
    pub removed_events: usize,
    /// Events discarded with pruned side branches
    pub pruned_events: usize,
    /// Store entries deleted
    pub removed_entries: usize,
}

/// Net effect of a run on one object
#[derive(Debug, Clone)]
enum NetChange {
    /// Born inside the run and alive at its end
    Created(PropertyData),
    /// Born and destroyed inside the run
    Transient,
    /// Pre-existing, alive at the end, some properties changed
    Changed(PropertyData),
    /// Pre-existing and destroyed inside the run
    Destroyed {
        snapshot: PropertyData,
        touched: BTreeSet<PropertyId>,
    },
    /// Pre-existing, destroyed, then created again under the same id
    Replaced {
        old: PropertyData,
        touched: BTreeSet<PropertyId>,
        new: PropertyData,
    },
}

impl NetChange {
    fn after_creation(prior: Option<Self>, snapshot: PropertyData) -> Self {
        match prior {
            Some(NetChange::Changed(mut values)) => {
                values.extend(snapshot);
                NetChange::Changed(values)
            }
            Some(NetChange::Destroyed { snapshot: old, touched })
            | Some(NetChange::Replaced { old, touched, .. }) => NetChange::Replaced {
                old,
                touched,
                new: snapshot,
            },
            _ => NetChange::Created(snapshot),
        }
    }

    fn after_destruction(prior: Option<Self>, snapshot: PropertyData) -> Self {
        match prior {
            Some(NetChange::Created(_)) | Some(NetChange::Transient) => NetChange::Transient,
            Some(NetChange::Changed(values)) => NetChange::Destroyed {
                snapshot,
                touched: values.into_keys().collect(),
            },
            Some(NetChange::Destroyed { touched, .. }) => {
                NetChange::Destroyed { snapshot, touched }
            }
            // the first destruction holds the pre-run object
            Some(NetChange::Replaced { old, touched, .. }) => NetChange::Destroyed {
                snapshot: old,
                touched,
            },
            None => NetChange::Destroyed {
                snapshot,
                touched: BTreeSet::new(),
            },
        }
    }

    fn set(&mut self, property: PropertyId, value: ValueBag) {
        match self {
            NetChange::Created(values)
            | NetChange::Changed(values)
            | NetChange::Replaced { new: values, .. } => {
                values.insert(property, value);
            }
            NetChange::Transient | NetChange::Destroyed { .. } => {}
        }
    }
}

/// Folded content of a run, ready to be stored under the run's last event
#[derive(Debug, Default)]
struct Fold {
    changed: ChangeMap,
    entries: Vec<(ObjectId, PropertyId, Vec<u8>)>,
}

/// Everything read for one run before the history is touched
#[derive(Debug)]
struct PlannedRun {
    fold: Fold,
    object_ids: Option<Vec<u8>>,
    pruned: Vec<TimeId>,
}

/// Prior content of every store entry written or removed, newest last
#[derive(Debug, Default)]
struct EntryJournal {
    prior: Vec<(StoreKey, Option<Vec<u8>>)>,
}

impl<S: EventStore> HistoryManager<S> {
    /// Compact the current chain down to the configured retained-event budget
    pub fn merge(&mut self, collaborator: &mut dyn Collaborator) -> Result<MergeReport> {
        self.merge_from(self.current_time, self.config.max_event_count, collaborator)
    }

    /// Compact the chain ending at `end`, keeping its `retain` most recent
    /// events as they are.
    ///
    /// When HEAD sits inside a run that would be folded away, it is first
    /// moved to the nearest surviving boundary of that run.
    pub fn merge_from(
        &mut self,
        end: TimeId,
        retain: usize,
        collaborator: &mut dyn Collaborator,
    ) -> Result<MergeReport> {
        self.commit(None)?;
        let runs = self.plan_runs(end, retain)?;

        for run in &runs {
            let Some(index) = run.iter().position(|t| *t == self.current_time) else {
                continue;
            };
            let last = run.len() - 1;
            if index == last {
                break;
            }
            // distance to the run end vs. to the event before the run
            let target = if last - index <= index + 1 {
                run[last]
            } else {
                self.graph.require(run[0])?.prev.unwrap_or(TimeId::ROOT)
            };
            debug!(from = %self.current_time, to = %target, "moving HEAD out of merged run");
            self.travel_to(target, collaborator)?;
            break;
        }

        self.merge_chain(end, retain)
    }

    /// Fold the runs of the chain ending at `end`. HEAD must not be an
    /// intermediate event of any run.
    pub(crate) fn merge_chain(&mut self, end: TimeId, retain: usize) -> Result<MergeReport> {
        let runs = self.plan_runs(end, retain)?;
        let mut report = MergeReport::default();
        if runs.is_empty() {
            return Ok(report);
        }
        for run in &runs {
            if run[..run.len() - 1].contains(&self.current_time) {
                return Err(Error::InvalidOperation(format!(
                    "HEAD {} lies inside a run to be merged",
                    self.current_time
                )));
            }
        }

        // Read and fold everything before mutating anything.
        let mut planned = Vec::with_capacity(runs.len());
        for run in &runs {
            let before = self.graph.require(run[0])?.prev;
            let fold = self.fold_run(run, before)?;
            let end = run[run.len() - 1];
            let end_ref = self.graph.require(end)?.object_ids_ref;
            let object_ids = if run.contains(&end_ref) {
                Some(self.store.get_required(&StoreKey::ObjectIds(end_ref))?)
            } else {
                None
            };
            let pruned = self.pruned_side_branches(run)?;
            planned.push(PlannedRun {
                fold,
                object_ids,
                pruned,
            });
        }

        let graph = self.graph.clone();
        let saved_time = self.saved_time;
        let mut journal = EntryJournal::default();
        let applied = self
            .apply_folds(&runs, planned, &mut journal, &mut report)
            .and_then(|()| self.store.flush());
        if let Err(e) = applied {
            warn!(error = %e, "merge failed, restoring history");
            self.graph = graph;
            self.saved_time = saved_time;
            self.rollback_journal(journal);
            return Err(e);
        }

        self.graph_modified = true;
        info!(
            runs = report.runs,
            removed = report.removed_events,
            pruned = report.pruned_events,
            entries = report.removed_entries,
            "merged history"
        );
        Ok(report)
    }

    fn apply_folds(
        &mut self,
        runs: &[Vec<TimeId>],
        planned: Vec<PlannedRun>,
        journal: &mut EntryJournal,
        report: &mut MergeReport,
    ) -> Result<()> {
        for (run, plan) in runs.iter().zip(planned) {
            let end = run[run.len() - 1];
            let start = run[0];
            let before = self.graph.require(start)?.prev.unwrap_or(TimeId::ROOT);

            // write the folded entries under `end`
            let mut keep: BTreeSet<StoreKey> = BTreeSet::new();
            for (object, property, data) in plan.fold.entries {
                let key = StoreKey::value(end, object, property);
                self.journaled_put(journal, key.clone(), data)?;
                keep.insert(key);
            }
            if let Some(data) = plan.object_ids {
                self.journaled_put(journal, StoreKey::ObjectIds(end), data)?;
                keep.insert(StoreKey::ObjectIds(end));
            }

            // drop everything the run and its pruned branches stored
            let mut doomed: BTreeSet<TimeId> = run.iter().copied().collect();
            doomed.extend(plan.pruned.iter().copied());
            for key in self.store.keys() {
                let stale = key.time().map(|t| doomed.contains(&t)).unwrap_or(false);
                if stale && !keep.contains(&key) && self.journaled_remove(journal, &key)? {
                    report.removed_entries += 1;
                }
            }

            // relink: `before` -> `end`
            let description = run
                .iter()
                .filter_map(|t| self.graph.get(*t))
                .map(|e| e.display_description().to_string())
                .filter(|d| !d.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            if let Some(parent) = self.graph.get_mut(before) {
                for child in parent.next.iter_mut() {
                    if *child == start {
                        *child = end;
                    }
                }
            }
            let merged_ref = {
                let event = self.graph.require_mut(end)?;
                event.prev = Some(before);
                event.changed = plan.fold.changed;
                event.description = description;
                event.user_description.clear();
                if run.contains(&event.object_ids_ref) {
                    event.object_ids_ref = end;
                }
                event.object_ids_ref
            };

            for time in &run[..run.len() - 1] {
                self.graph.remove(*time);
                report.removed_events += 1;
            }
            for time in &plan.pruned {
                if self.graph.remove(*time).is_some() {
                    report.pruned_events += 1;
                }
            }

            let removed: BTreeSet<TimeId> = run[..run.len() - 1].iter().copied().collect();
            let descendants = self.graph.subtree(end)?;
            for time in descendants {
                if let Some(event) = self.graph.get_mut(time) {
                    if removed.contains(&event.object_ids_ref) {
                        event.object_ids_ref = merged_ref;
                    }
                }
            }
            if self.saved_time.map(|t| doomed.contains(&t) && t != end).unwrap_or(false) {
                self.saved_time = None;
            }
            report.runs += 1;
            debug!(%start, %end, events = run.len(), "folded run");
        }

        self.graph.recompute_milestone_counts();
        Ok(())
    }

    fn journaled_put(
        &mut self,
        journal: &mut EntryJournal,
        key: StoreKey,
        data: Vec<u8>,
    ) -> Result<()> {
        let prior = self.store.get(&key)?;
        self.store.put(key.clone(), data)?;
        journal.prior.push((key, prior));
        Ok(())
    }

    fn journaled_remove(&mut self, journal: &mut EntryJournal, key: &StoreKey) -> Result<bool> {
        let prior = self.store.get(key)?;
        let removed = self.store.remove(key)?;
        if removed {
            journal.prior.push((key.clone(), prior));
        }
        Ok(removed)
    }

    fn rollback_journal(&mut self, journal: EntryJournal) {
        warn!(entries = journal.prior.len(), "rolling back store entries");
        for (key, prior) in journal.prior.into_iter().rev() {
            let restored = match prior {
                Some(data) => self.store.put(key.clone(), data),
                None => self.store.remove(&key).map(|_| ()),
            };
            if let Err(e) = restored {
                warn!(%key, error = %e, "failed to roll back store entry");
            }
        }
    }

    /// Split the chain ending at `end` into foldable runs, oldest first.
    ///
    /// The `retain` most recent events are left alone. Milestones, and
    /// events with a side branch holding a milestone or HEAD, break runs.
    /// Only runs of two or more events are returned.
    fn plan_runs(&self, end: TimeId, retain: usize) -> Result<Vec<Vec<TimeId>>> {
        let chain = self.graph.chain_to_root(end)?;
        // chain is newest first and ends with the root
        let candidates = &chain[..chain.len() - 1];
        let older = candidates.iter().skip(retain);

        let mut runs: Vec<Vec<TimeId>> = Vec::new();
        let mut current: Vec<TimeId> = Vec::new();
        for (offset, time) in older.enumerate() {
            let successor = if offset + retain == 0 {
                None
            } else {
                Some(chain[offset + retain - 1])
            };
            if self.is_foldable(*time, successor)? {
                current.push(*time);
            } else if !current.is_empty() {
                runs.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            runs.push(current);
        }

        let mut runs: Vec<Vec<TimeId>> = runs
            .into_iter()
            .filter(|run| run.len() >= 2)
            .map(|mut run| {
                run.reverse();
                run
            })
            .collect();
        runs.reverse();
        Ok(runs)
    }

    fn is_foldable(&self, time: TimeId, successor: Option<TimeId>) -> Result<bool> {
        let event = self.graph.require(time)?;
        if event.is_milestone {
            return Ok(false);
        }
        for child in event.next.iter().filter(|c| Some(**c) != successor) {
            let child_event = self.graph.require(*child)?;
            if child_event.is_milestone || child_event.milestone_count > 0 {
                return Ok(false);
            }
            if self.graph.is_ancestor(*child, self.current_time)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Events in side branches hanging off the intermediate events of a run
    fn pruned_side_branches(&self, run: &[TimeId]) -> Result<Vec<TimeId>> {
        let mut pruned = Vec::new();
        for pair in run.windows(2) {
            let event = self.graph.require(pair[0])?;
            for child in event.next.iter().filter(|c| **c != pair[1]) {
                pruned.extend(self.graph.subtree(*child)?);
            }
        }
        Ok(pruned)
    }

    fn load_entry(&self, time: TimeId, object: ObjectId, property: &PropertyId) -> Result<Vec<u8>> {
        self.store.get_required(&StoreKey::value(time, object, property.clone()))
    }

    /// Fold the changes of `run` (oldest first) forward. `before` is the
    /// event preceding the run, used to patch destruction snapshots back to
    /// pre-run values.
    fn fold_run(&self, run: &[TimeId], before: Option<TimeId>) -> Result<Fold> {
        let mut net: BTreeMap<ObjectId, NetChange> = BTreeMap::new();

        for time in run {
            let event = self.graph.require(*time)?;
            for (object, props) in &event.changed {
                let destroyed = props.contains(&PropertyId::Object);
                let created = props.contains(&PropertyId::Creation);

                // destroyed and recreated by one event: the destruction comes first
                if destroyed && created {
                    let snapshot =
                        decode_snapshot(&self.load_entry(*time, *object, &PropertyId::Object)?)?;
                    let next = NetChange::after_destruction(net.remove(object), snapshot);
                    net.insert(*object, next);
                }

                if created {
                    let snapshot =
                        decode_snapshot(&self.load_entry(*time, *object, &PropertyId::Creation)?)?;
                    let next = NetChange::after_creation(net.remove(object), snapshot);
                    net.insert(*object, next);
                }

                for property in props.iter().filter(|p| !p.is_reserved()) {
                    let value = ValueBag::decode(&self.load_entry(*time, *object, property)?)?;
                    net.entry(*object)
                        .or_insert_with(|| NetChange::Changed(PropertyData::new()))
                        .set(property.clone(), value);
                }

                if destroyed && !created {
                    let snapshot =
                        decode_snapshot(&self.load_entry(*time, *object, &PropertyId::Object)?)?;
                    let next = NetChange::after_destruction(net.remove(object), snapshot);
                    net.insert(*object, next);
                }
            }
        }

        let mut fold = Fold::default();
        for (object, change) in net {
            match change {
                NetChange::Transient => {}
                NetChange::Created(snapshot) => {
                    fold.changed.entry(object).or_default().insert(PropertyId::Creation);
                    fold.entries
                        .push((object, PropertyId::Creation, encode_snapshot(&snapshot)?));
                }
                NetChange::Changed(values) => {
                    if values.is_empty() {
                        continue;
                    }
                    let props = fold.changed.entry(object).or_default();
                    for (property, value) in values {
                        props.insert(property.clone());
                        fold.entries.push((object, property, value.encode()?));
                    }
                }
                NetChange::Destroyed {
                    mut snapshot,
                    touched,
                } => {
                    let Some(before) = before else {
                        // destroyed before anything existed: nothing to keep
                        continue;
                    };
                    self.rewind_snapshot(object, &mut snapshot, touched, before)?;
                    fold.changed.entry(object).or_default().insert(PropertyId::Object);
                    fold.entries
                        .push((object, PropertyId::Object, encode_snapshot(&snapshot)?));
                }
                NetChange::Replaced {
                    mut old,
                    touched,
                    new,
                } => {
                    let props = fold.changed.entry(object).or_default();
                    props.insert(PropertyId::Creation);
                    // without a preceding event only the final object matters
                    if let Some(before) = before {
                        self.rewind_snapshot(object, &mut old, touched, before)?;
                        props.insert(PropertyId::Object);
                        fold.entries
                            .push((object, PropertyId::Object, encode_snapshot(&old)?));
                    }
                    fold.entries
                        .push((object, PropertyId::Creation, encode_snapshot(&new)?));
                }
            }
        }
        Ok(fold)
    }

    /// Collapse the chain from the root to HEAD into a new root event and
    /// discard every other branch. Irreversible.
    pub fn archive(&mut self) -> Result<()> {
        self.commit(None)?;

        let mut chain = self.graph.chain_to_root(self.current_time)?;
        chain.reverse();
        let fold = self.fold_run(&chain, None)?;
        let live = self.live_objects()?;
        let object_ids = encode_object_ids(&live)?;

        let mut journal = EntryJournal::default();
        let written = self
            .write_root_entries(fold.entries, object_ids, &mut journal)
            .and_then(|removed| self.store.flush().map(|()| removed));
        let removed_entries = match written {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "archive failed, restoring history");
                self.rollback_journal(journal);
                return Err(e);
            }
        };

        let removed_events = self.graph.len() - 1;
        let mut root = HistoryEvent::root();
        root.changed = fold.changed;
        self.graph = EventGraph::with_root(root);
        self.current_time = TimeId::ROOT;
        self.saved_time = None;
        self.graph_modified = true;

        info!(removed_events, removed_entries, objects = live.len(), "archived history");
        Ok(())
    }

    /// Store the folded entries under the root and drop every other entry.
    /// Returns the number of entries removed.
    fn write_root_entries(
        &mut self,
        entries: Vec<(ObjectId, PropertyId, Vec<u8>)>,
        object_ids: Vec<u8>,
        journal: &mut EntryJournal,
    ) -> Result<usize> {
        let mut keep: BTreeSet<StoreKey> = BTreeSet::new();
        for (object, property, data) in entries {
            let key = StoreKey::value(TimeId::ROOT, object, property);
            self.journaled_put(journal, key.clone(), data)?;
            keep.insert(key);
        }
        self.journaled_put(journal, StoreKey::ObjectIds(TimeId::ROOT), object_ids)?;
        keep.insert(StoreKey::ObjectIds(TimeId::ROOT));

        let mut removed = 0;
        for key in self.store.keys() {
            let stale = key.time().is_some() && !keep.contains(&key);
            if stale && self.journaled_remove(journal, &key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
