//! History events and the identifiers they are keyed by

use crate::core::time_id::TimeId;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Identity of a versioned application object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a versioned property.
///
/// `Creation` and `Object` are reserved: the whole object came into
/// existence, or the whole object was destroyed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum PropertyId {
    Creation,
    Object,
    Named(String),
}

impl PropertyId {
    /// Named property shorthand
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    /// Whether this is one of the two reserved whole-object ids
    pub fn is_reserved(&self) -> bool {
        !matches!(self, Self::Named(_))
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creation => write!(f, "creation"),
            Self::Object => write!(f, "object"),
            Self::Named(name) => write!(f, "p:{}", name),
        }
    }
}

impl From<PropertyId> for String {
    fn from(id: PropertyId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for PropertyId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        match s.as_str() {
            "creation" => Ok(Self::Creation),
            "object" => Ok(Self::Object),
            other => other
                .strip_prefix("p:")
                .map(|name| Self::Named(name.to_string()))
                .ok_or_else(|| Error::Serialization(format!("Invalid property id: {}", s))),
        }
    }
}

/// A stored property value: a main value plus optional auxiliary values
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValueBag {
    pub main: serde_json::Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ValueBag {
    /// Bag with only a main value
    pub fn new(main: serde_json::Value) -> Self {
        Self {
            main,
            extra: BTreeMap::new(),
        }
    }

    /// Add an auxiliary value
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Encode as a store blob
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a store blob
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Property values keyed by property id.
///
/// A full-object snapshot (the `creation`/`object` blob) is a
/// `PropertyData` holding every named property of the object.
pub type PropertyData = BTreeMap<PropertyId, ValueBag>;

/// Encode a full-object snapshot as a store blob
pub fn encode_snapshot(snapshot: &PropertyData) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(snapshot)?)
}

/// Decode a full-object snapshot blob
pub fn decode_snapshot(data: &[u8]) -> Result<PropertyData> {
    Ok(serde_json::from_slice(data)?)
}

/// Which object properties changed at each object
pub type ChangeMap = BTreeMap<ObjectId, BTreeSet<PropertyId>>;

/// A node of the history graph: what changed between its parent and itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Key of this event
    pub id: TimeId,
    /// Changed properties per object
    pub changed: ChangeMap,
    /// Parent event (`None` only for the root)
    pub prev: Option<TimeId>,
    /// Child events; the last entry is the one redo follows
    pub next: Vec<TimeId>,
    /// Generated description
    pub description: String,
    /// Description set by the user
    pub user_description: String,
    /// Pinned to survive compaction
    pub is_milestone: bool,
    /// Number of milestones among the descendants
    pub milestone_count: u32,
    /// Event whose stored live-object-id snapshot is valid here
    pub object_ids_ref: TimeId,
}

impl HistoryEvent {
    /// The root event
    pub fn root() -> Self {
        Self::builder(TimeId::ROOT).build()
    }

    /// Start building an event
    pub fn builder(id: TimeId) -> HistoryEventBuilder {
        HistoryEventBuilder {
            event: HistoryEvent {
                id,
                changed: ChangeMap::new(),
                prev: None,
                next: Vec::new(),
                description: String::new(),
                user_description: String::new(),
                is_milestone: false,
                milestone_count: 0,
                object_ids_ref: id,
            },
        }
    }

    /// Whether this is the root event
    pub fn is_root(&self) -> bool {
        self.prev.is_none()
    }

    /// The branch redo follows
    pub fn latest_next(&self) -> Option<TimeId> {
        self.next.last().copied()
    }

    /// Changed properties of one object
    pub fn changed_properties(&self, object: ObjectId) -> Option<&BTreeSet<PropertyId>> {
        self.changed.get(&object)
    }

    /// Whether `(object, property)` changed at this event
    pub fn has_change(&self, object: ObjectId, property: &PropertyId) -> bool {
        self.changed
            .get(&object)
            .map(|props| props.contains(property))
            .unwrap_or(false)
    }

    /// Description shown to users: the user's text when set
    pub fn display_description(&self) -> &str {
        if self.user_description.is_empty() {
            &self.description
        } else {
            &self.user_description
        }
    }

    /// Whether the live-object set changed at this event
    pub fn changes_object_set(&self) -> bool {
        self.changed.values().any(|props| {
            props.contains(&PropertyId::Creation) || props.contains(&PropertyId::Object)
        })
    }
}

/// Builder for events
pub struct HistoryEventBuilder {
    event: HistoryEvent,
}

impl HistoryEventBuilder {
    /// Set the parent
    pub fn prev(mut self, prev: TimeId) -> Self {
        self.event.prev = Some(prev);
        self
    }

    /// Set the changed map
    pub fn changed(mut self, changed: ChangeMap) -> Self {
        self.event.changed = changed;
        self
    }

    /// Record one change
    pub fn change(mut self, object: ObjectId, property: PropertyId) -> Self {
        self.event.changed.entry(object).or_default().insert(property);
        self
    }

    /// Set the description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.event.description = description.into();
        self
    }

    /// Point at the event holding the valid object-id snapshot
    pub fn object_ids_ref(mut self, time: TimeId) -> Self {
        self.event.object_ids_ref = time;
        self
    }

    /// Mark as milestone
    pub fn milestone(mut self, is_milestone: bool) -> Self {
        self.event.is_milestone = is_milestone;
        self
    }

    /// Build the event
    pub fn build(self) -> HistoryEvent {
        self.event
    }
}
