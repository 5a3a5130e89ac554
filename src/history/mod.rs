//! History manager: staging, commit, undo/redo, compaction and persistence
//!
//! One [`HistoryManager`] owns the event graph, the store handle and the
//! staging buffer. Domain objects are reached only through the
//! [`Collaborator`](crate::collaborator::Collaborator) passed to the
//! operations that need it.
//!
//! # Example
//!
//! ```no_run
//! use temporal_history::prelude::*;
//!
//! # fn example(scene: &mut dyn Collaborator) -> temporal_history::error::Result<()> {
//! let mut history = HistoryManager::new(InMemoryStore::new(), HistoryConfig::default())?;
//!
//! history.record_creation(ObjectId(1), scene, "Create box")?;
//! history.commit(None)?;
//!
//! history.undo(scene)?;
//! history.redo(scene)?;
//! # Ok(())
//! # }
//! ```

mod commit;
mod merge;
mod navigate;
mod persist;
mod staging;

#[cfg(test)]
pub(crate) mod testing;

pub use merge::MergeReport;
pub use staging::{StagedValue, StagingBuffer};

use crate::config::HistoryConfig;
use crate::core::event::{
    decode_snapshot, HistoryEvent, ObjectId, PropertyData, PropertyId, ValueBag,
};
use crate::core::graph::{EventGraph, ValueSource};
use crate::core::time_id::{TimeId, TimeIdGenerator};
use crate::error::{Error, Result};
use crate::storage::store::{EventStore, StoreKey};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Outcome of one scheduler poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Automatic steps were skipped because a long operation is running
    pub deferred: bool,
    /// Event committed from the staging buffer
    pub committed: Option<TimeId>,
    /// Automatic compaction result
    pub merged: Option<MergeReport>,
    /// Backup file written
    pub backup: Option<PathBuf>,
}

/// Branching undo/redo history over a keyed event store
pub struct HistoryManager<S: EventStore> {
    store: S,
    graph: EventGraph,
    current_time: TimeId,
    saved_time: Option<TimeId>,
    graph_modified: bool,
    generator: TimeIdGenerator,
    staging: StagingBuffer,
    config: HistoryConfig,
    long_operation: bool,
    last_merge: DateTime<Utc>,
    last_backup: DateTime<Utc>,
    document_path: Option<PathBuf>,
}

pub(crate) fn encode_object_ids(ids: &BTreeSet<ObjectId>) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(ids)?)
}

pub(crate) fn decode_object_ids(data: &[u8]) -> Result<BTreeSet<ObjectId>> {
    Ok(serde_json::from_slice(data)?)
}

impl<S: EventStore> HistoryManager<S> {
    /// Start a fresh history on `store`; any previous store content is
    /// discarded
    pub fn new(mut store: S, config: HistoryConfig) -> Result<Self> {
        config.validate()?;
        store.clear()?;
        store.put(
            StoreKey::ObjectIds(TimeId::ROOT),
            encode_object_ids(&BTreeSet::new())?,
        )?;
        store.flush()?;

        Ok(Self::from_parts(store, EventGraph::new(), TimeId::ROOT, config))
    }

    fn from_parts(store: S, graph: EventGraph, current_time: TimeId, config: HistoryConfig) -> Self {
        let mut generator = TimeIdGenerator::new();
        if let Some(last) = graph.events().map(|e| e.id).max() {
            generator.observe(last);
        }
        let now = Utc::now();
        Self {
            store,
            graph,
            current_time,
            saved_time: None,
            graph_modified: false,
            generator,
            staging: StagingBuffer::new(),
            config,
            long_operation: false,
            last_merge: now,
            last_backup: now,
            document_path: None,
        }
    }

    /// Current HEAD
    pub fn current_time(&self) -> TimeId {
        self.current_time
    }

    /// Time id the staged batch will be committed under
    pub fn pending_time(&self) -> Option<TimeId> {
        self.staging.pending_time()
    }

    /// HEAD at the last save or load
    pub fn saved_time(&self) -> Option<TimeId> {
        self.saved_time
    }

    /// Whether the history differs from the last saved document
    pub fn is_dirty(&self) -> bool {
        self.graph_modified || self.saved_time != Some(self.current_time) || !self.staging.is_empty()
    }

    /// The event graph
    pub fn graph(&self) -> &EventGraph {
        &self.graph
    }

    /// One event
    pub fn event(&self, time: TimeId) -> Option<&HistoryEvent> {
        self.graph.get(time)
    }

    /// All events in time order
    pub fn events(&self) -> impl Iterator<Item = &HistoryEvent> {
        self.graph.events()
    }

    /// Events from the root to HEAD, root first
    pub fn current_chain(&self) -> Result<Vec<TimeId>> {
        let mut chain = self.graph.chain_to_root(self.current_time)?;
        chain.reverse();
        Ok(chain)
    }

    /// The store handle
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Configuration in use
    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Staged, uncommitted edits
    pub fn staging(&self) -> &StagingBuffer {
        &self.staging
    }

    /// Path of the last saved or loaded document
    pub fn document_path(&self) -> Option<&Path> {
        self.document_path.as_deref()
    }

    /// Whether HEAD has a parent to undo to
    pub fn can_undo(&self) -> bool {
        !self.current_time.is_root() || !self.staging.is_empty()
    }

    /// Whether HEAD has a branch to redo
    pub fn can_redo(&self) -> bool {
        self.staging.is_empty()
            && self
                .graph
                .get(self.current_time)
                .map(|e| !e.next.is_empty())
                .unwrap_or(false)
    }

    /// Mark the start or end of a long operation; automatic commits,
    /// merges and backups are deferred while it runs
    pub fn set_long_operation(&mut self, in_progress: bool) {
        self.long_operation = in_progress;
    }

    /// Whether a long operation is in progress
    pub fn is_long_operation(&self) -> bool {
        self.long_operation
    }

    /// Set the user description of an event
    pub fn rename_event(&mut self, time: TimeId, user_description: &str) -> Result<()> {
        let event = self.graph.require_mut(time)?;
        event.user_description = user_description.to_string();
        self.graph_modified = true;
        debug!(%time, "renamed event");
        Ok(())
    }

    /// Pin or unpin an event against compaction. The root cannot be a
    /// milestone; returns whether anything changed.
    pub fn set_milestone(&mut self, time: TimeId, is_milestone: bool) -> Result<bool> {
        let event = self.graph.require_mut(time)?;
        let Some(parent) = event.prev else {
            return Ok(false);
        };
        if event.is_milestone == is_milestone {
            return Ok(false);
        }
        event.is_milestone = is_milestone;
        self.graph
            .adjust_milestone_count(parent, if is_milestone { 1 } else { -1 });
        self.graph_modified = true;
        info!(%time, is_milestone, "milestone toggled");
        Ok(true)
    }

    /// Ids of the objects alive at `time`
    pub fn live_objects_at(&self, time: TimeId) -> Result<BTreeSet<ObjectId>> {
        let event = self.graph.require(time)?;
        let data = self
            .store
            .get_required(&StoreKey::ObjectIds(event.object_ids_ref))?;
        decode_object_ids(&data)
    }

    /// Ids of the objects alive at HEAD
    pub fn live_objects(&self) -> Result<BTreeSet<ObjectId>> {
        self.live_objects_at(self.current_time)
    }

    /// Value of a named property of `object` as it was at `at`
    pub fn value_at(&self, object: ObjectId, property: &PropertyId, at: TimeId) -> Result<ValueBag> {
        let missing = || Error::MissingValue {
            object,
            property: property.clone(),
            time: at,
        };
        match self.graph.last_change(object, property, at)? {
            Some(ValueSource::Property(time)) => {
                let key = StoreKey::value(time, object, property.clone());
                ValueBag::decode(&self.store.get_required(&key)?)
            }
            Some(ValueSource::Creation(time)) => {
                let key = StoreKey::value(time, object, PropertyId::Creation);
                let mut snapshot = decode_snapshot(&self.store.get_required(&key)?)?;
                snapshot.remove(property).ok_or_else(missing)
            }
            None => Err(missing()),
        }
    }

    /// Reset `properties` of an object snapshot to their values at `at`.
    /// Properties the object did not have at `at` are dropped.
    pub(crate) fn rewind_snapshot(
        &self,
        object: ObjectId,
        snapshot: &mut PropertyData,
        properties: impl IntoIterator<Item = PropertyId>,
        at: TimeId,
    ) -> Result<()> {
        for property in properties {
            match self.value_at(object, &property, at) {
                Ok(value) => {
                    snapshot.insert(property, value);
                }
                Err(Error::MissingValue { .. }) => {
                    snapshot.remove(&property);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Scheduler poll using the wall clock
    pub fn tick(&mut self) -> Result<TickReport> {
        self.tick_at(Utc::now())
    }

    /// Scheduler poll: commit the staged batch, then run automerge and
    /// autobackup when their intervals have elapsed
    pub fn tick_at(&mut self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        if self.long_operation {
            if !self.staging.is_empty() {
                debug!("commit deferred during long operation");
            }
            report.deferred = true;
            return Ok(report);
        }

        report.committed = self.commit(None)?;

        let merge_interval = Duration::seconds(self.config.automerge_interval_secs as i64);
        if self.config.automerge_enabled && now - self.last_merge >= merge_interval {
            self.last_merge = now;
            let chain_len = self.graph.chain_to_root(self.current_time)?.len() - 1;
            if chain_len > self.config.max_event_count {
                let merged = self.merge_chain(self.current_time, self.config.max_event_count)?;
                report.merged = Some(merged);
            }
        }

        let backup_interval = Duration::seconds(self.config.autobackup_interval_secs as i64);
        if self.config.autobackup_enabled && now - self.last_backup >= backup_interval {
            self.last_backup = now;
            match self.backup() {
                Ok(path) => report.backup = path,
                Err(e) => warn!(error = %e, "autobackup failed"),
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{manager, Scene};
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_new_history() {
        let history = manager();
        assert_eq!(history.current_time(), TimeId::ROOT);
        assert_eq!(history.graph().len(), 1);
        assert!(history.live_objects().unwrap().is_empty());
        assert!(!history.can_undo());
        assert!(!history.can_redo());
        assert!(history.is_dirty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = HistoryConfig {
            compression_level: 0,
            ..HistoryConfig::default()
        };
        assert!(HistoryManager::new(crate::storage::InMemoryStore::new(), config).is_err());
    }

    #[test]
    fn test_rename_and_milestone() {
        let mut history = manager();
        let mut scene = Scene::new();
        scene.create(&mut history, 1, &[("transform", json!(0))]);
        let e1 = history.commit(None).unwrap().unwrap();
        scene.set(&mut history, 1, "transform", json!(1));
        let e2 = history.commit(None).unwrap().unwrap();

        history.rename_event(e1, "my box").unwrap();
        assert_eq!(history.event(e1).unwrap().display_description(), "my box");

        assert!(history.set_milestone(e2, true).unwrap());
        assert!(!history.set_milestone(e2, true).unwrap());
        assert_eq!(history.event(e1).unwrap().milestone_count, 1);
        assert_eq!(history.event(TimeId::ROOT).unwrap().milestone_count, 1);
        assert!(!history.set_milestone(TimeId::ROOT, true).unwrap());

        assert!(history.set_milestone(e2, false).unwrap());
        assert_eq!(history.event(TimeId::ROOT).unwrap().milestone_count, 0);

        let unknown = TimeId::new(1, 99);
        assert!(matches!(
            history.rename_event(unknown, "x"),
            Err(Error::UnknownEvent(_))
        ));
    }

    #[test]
    fn test_tick_commits_batch() {
        let mut history = manager();
        let mut scene = Scene::new();
        scene.create(&mut history, 1, &[("transform", json!(0))]);
        scene.set(&mut history, 1, "transform", json!(3));

        let report = history.tick().unwrap();
        let committed = report.committed.unwrap();
        assert_eq!(history.current_time(), committed);
        assert_eq!(history.graph().len(), 2);
        assert!(history.staging().is_empty());

        let report = history.tick().unwrap();
        assert_eq!(report.committed, None);
        assert_eq!(history.graph().len(), 2);
    }

    #[test]
    fn test_tick_deferred_during_long_operation() {
        let mut history = manager();
        let mut scene = Scene::new();
        history.set_long_operation(true);
        scene.create(&mut history, 1, &[("transform", json!(0))]);

        let report = history.tick().unwrap();
        assert!(report.deferred);
        assert_eq!(report.committed, None);
        assert!(!history.staging().is_empty());

        history.set_long_operation(false);
        assert!(history.tick().unwrap().committed.is_some());
    }

    #[test]
    fn test_tick_automerge() {
        let config = HistoryConfig {
            max_event_count: 2,
            automerge_interval_secs: 60,
            ..HistoryConfig::default()
        };
        let mut history =
            HistoryManager::new(crate::storage::InMemoryStore::new(), config).unwrap();
        let mut scene = Scene::new();
        scene.create(&mut history, 1, &[("transform", json!(0))]);
        history.commit(None).unwrap();
        for i in 1..=5 {
            scene.set(&mut history, 1, "transform", json!(i));
            history.commit(None).unwrap();
        }
        assert_eq!(history.graph().len(), 7);

        let later = Utc.timestamp_opt(4_000_000_000, 0).unwrap();
        let report = history.tick_at(later).unwrap();
        let merged = report.merged.unwrap();
        assert_eq!(merged.runs, 1);
        // root + one merged event + two retained
        assert_eq!(history.graph().len(), 4);
        assert_eq!(
            history
                .value_at(ObjectId(1), &PropertyId::named("transform"), history.current_time())
                .unwrap(),
            ValueBag::new(json!(5))
        );

        // interval not elapsed again
        let report = history.tick_at(later).unwrap();
        assert!(report.merged.is_none());
    }
}
