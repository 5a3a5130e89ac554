//! Event graph: the branching tree of history events rooted at `TimeId::ROOT`

use crate::core::event::{HistoryEvent, ObjectId, PropertyId};
use crate::core::time_id::TimeId;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where the value of a property at some point in history is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    /// The property's own blob at this time
    Property(TimeId),
    /// Inside the creation snapshot stored at this time
    Creation(TimeId),
}

/// Steps needed to move between two events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    /// Events to undo, starting at the origin
    pub undo: Vec<TimeId>,
    /// Deepest common ancestor
    pub ancestor: TimeId,
    /// Events to redo, ending at the target
    pub redo: Vec<TimeId>,
}

/// The history graph, keyed by event time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventGraph {
    /// Events ordered by time (BTreeMap for ordered iteration)
    events: BTreeMap<TimeId, HistoryEvent>,
}

impl EventGraph {
    /// A graph holding only the root event
    pub fn new() -> Self {
        Self::with_root(HistoryEvent::root())
    }

    /// A graph holding only the given root
    pub fn with_root(root: HistoryEvent) -> Self {
        let mut events = BTreeMap::new();
        events.insert(root.id, root);
        Self { events }
    }

    /// Rebuild a graph from a list of events, checking its links
    pub fn from_events(events: Vec<HistoryEvent>) -> Result<Self> {
        let graph = Self {
            events: events.into_iter().map(|e| (e.id, e)).collect(),
        };
        graph.validate()?;
        Ok(graph)
    }

    /// Check that the root exists and every link points at a known event
    pub fn validate(&self) -> Result<()> {
        let root = self
            .events
            .get(&TimeId::ROOT)
            .ok_or_else(|| Error::Storage("Event graph has no root".to_string()))?;
        if root.prev.is_some() {
            return Err(Error::Storage("Root event has a parent".to_string()));
        }
        for event in self.events.values() {
            if let Some(prev) = event.prev {
                let parent = self.require(prev)?;
                if !parent.next.contains(&event.id) {
                    return Err(Error::Storage(format!(
                        "Event {} is not listed as a child of {}",
                        event.id, prev
                    )));
                }
            } else if !event.id.is_root() {
                return Err(Error::Storage(format!("Event {} has no parent", event.id)));
            }
            for child in &event.next {
                self.require(*child)?;
            }
            if !self.events.contains_key(&event.object_ids_ref) {
                return Err(Error::Storage(format!(
                    "Event {} references unknown object id snapshot {}",
                    event.id, event.object_ids_ref
                )));
            }
        }
        Ok(())
    }

    /// Encode the graph for the `events` subfile
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode and validate an `events` subfile
    pub fn decode(data: &[u8]) -> Result<Self> {
        let graph: Self = bincode::deserialize(data)?;
        graph.validate()?;
        Ok(graph)
    }

    /// Get an event
    pub fn get(&self, id: TimeId) -> Option<&HistoryEvent> {
        self.events.get(&id)
    }

    /// Get an event mutably
    pub fn get_mut(&mut self, id: TimeId) -> Option<&mut HistoryEvent> {
        self.events.get_mut(&id)
    }

    /// Get an event or fail with `UnknownEvent`
    pub fn require(&self, id: TimeId) -> Result<&HistoryEvent> {
        self.events.get(&id).ok_or(Error::UnknownEvent(id))
    }

    /// Get an event mutably or fail with `UnknownEvent`
    pub fn require_mut(&mut self, id: TimeId) -> Result<&mut HistoryEvent> {
        self.events.get_mut(&id).ok_or(Error::UnknownEvent(id))
    }

    /// Whether an event exists
    pub fn contains(&self, id: TimeId) -> bool {
        self.events.contains_key(&id)
    }

    /// The root event
    pub fn root(&self) -> Option<&HistoryEvent> {
        self.events.get(&TimeId::ROOT)
    }

    /// All events in time order
    pub fn events(&self) -> impl Iterator<Item = &HistoryEvent> {
        self.events.values()
    }

    /// Number of events including the root
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the graph holds nothing but the root
    pub fn is_empty(&self) -> bool {
        self.events.len() <= 1
    }

    /// Link a new event below its parent. The parent's milestone counts are
    /// updated when the event is a milestone.
    pub fn link_child(&mut self, event: HistoryEvent) -> Result<()> {
        let parent = event
            .prev
            .ok_or_else(|| Error::Storage(format!("Event {} has no parent", event.id)))?;
        if self.events.contains_key(&event.id) {
            return Err(Error::Storage(format!("Event {} already exists", event.id)));
        }
        self.require_mut(parent)?.next.push(event.id);
        let milestones = event.milestone_count + u32::from(event.is_milestone);
        self.events.insert(event.id, event);
        if milestones > 0 {
            self.adjust_milestone_count(parent, i64::from(milestones));
        }
        Ok(())
    }

    /// Remove an event without touching its neighbours' links
    pub fn remove(&mut self, id: TimeId) -> Option<HistoryEvent> {
        self.events.remove(&id)
    }

    /// Chain from `id` back to the root, `id` first
    pub fn chain_to_root(&self, id: TimeId) -> Result<Vec<TimeId>> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(time) = cursor {
            chain.push(time);
            cursor = self.require(time)?.prev;
        }
        Ok(chain)
    }

    /// Whether `ancestor` lies on the chain from `id` to the root
    /// (an event counts as its own ancestor)
    pub fn is_ancestor(&self, ancestor: TimeId, id: TimeId) -> Result<bool> {
        let mut cursor = Some(id);
        while let Some(time) = cursor {
            if time == ancestor {
                return Ok(true);
            }
            cursor = self.require(time)?.prev;
        }
        Ok(false)
    }

    /// Steps to move from `from` to `to`
    pub fn path_between(&self, from: TimeId, to: TimeId) -> Result<Path> {
        let from_chain = self.chain_to_root(from)?;
        let to_chain = self.chain_to_root(to)?;

        let ancestor = from_chain
            .iter()
            .copied()
            .find(|t| to_chain.contains(t))
            .unwrap_or(TimeId::ROOT);

        let undo = from_chain.into_iter().take_while(|t| *t != ancestor).collect();
        let mut redo: Vec<TimeId> = to_chain.into_iter().take_while(|t| *t != ancestor).collect();
        redo.reverse();

        Ok(Path { undo, ancestor, redo })
    }

    /// `id` and all of its descendants
    pub fn subtree(&self, id: TimeId) -> Result<Vec<TimeId>> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(time) = stack.pop() {
            out.push(time);
            stack.extend(self.require(time)?.next.iter().copied());
        }
        Ok(out)
    }

    /// Locate the value of `(object, property)` as it was at `at`.
    ///
    /// Walks back from `at` to the most recent event that changed the
    /// property, falling back to the object's creation snapshot.
    pub fn last_change(
        &self,
        object: ObjectId,
        property: &PropertyId,
        at: TimeId,
    ) -> Result<Option<ValueSource>> {
        let mut cursor = Some(at);
        while let Some(time) = cursor {
            let event = self.require(time)?;
            if let Some(props) = event.changed_properties(object) {
                if props.contains(property) {
                    return Ok(Some(ValueSource::Property(time)));
                }
                if props.contains(&PropertyId::Creation) {
                    return Ok(Some(ValueSource::Creation(time)));
                }
                if props.contains(&PropertyId::Object) {
                    // destroyed here: no value on this side of the chain
                    return Ok(None);
                }
            }
            cursor = event.prev;
        }
        Ok(None)
    }

    /// Add `delta` to the milestone count of `from` and all its ancestors
    pub fn adjust_milestone_count(&mut self, from: TimeId, delta: i64) {
        let mut cursor = Some(from);
        while let Some(time) = cursor {
            match self.events.get_mut(&time) {
                Some(event) => {
                    let count = i64::from(event.milestone_count) + delta;
                    event.milestone_count = count.max(0) as u32;
                    cursor = event.prev;
                }
                None => break,
            }
        }
    }

    /// Recompute every milestone count from scratch
    pub fn recompute_milestone_counts(&mut self) {
        // children always have later times than their parents
        let ids: Vec<TimeId> = self.events.keys().rev().copied().collect();
        let mut counts: BTreeMap<TimeId, u32> = BTreeMap::new();
        for id in ids {
            let Some(event) = self.events.get(&id) else {
                continue;
            };
            let below: u32 = event
                .next
                .iter()
                .map(|child| {
                    let own = self.events.get(child).map(|c| u32::from(c.is_milestone)).unwrap_or(0);
                    own + counts.get(child).copied().unwrap_or(0)
                })
                .sum();
            counts.insert(id, below);
        }
        for (id, count) in counts {
            if let Some(event) = self.events.get_mut(&id) {
                event.milestone_count = count;
            }
        }
    }

    /// Whether the subtree below `id` (excluding `id`) holds a milestone
    pub fn has_milestone_below(&self, id: TimeId) -> bool {
        self.events
            .get(&id)
            .map(|e| e.milestone_count > 0)
            .unwrap_or(false)
    }
}

impl Default for EventGraph {
    fn default() -> Self {
        Self::new()
    }
}
