//! Opening a saved document without a collaborator

use crate::core::event::{HistoryEvent, PropertyId};
use crate::core::graph::EventGraph;
use crate::core::time_id::TimeId;
use crate::error::{Error, Result};
use crate::storage::container::{ContainerHeader, ContainerReader};
use crate::storage::store::{StoreKey, EVENTS_ENTRY, TIME_ID_ENTRY};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Summary printed by `info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentInfo {
    pub head: TimeId,
    pub events: usize,
    pub milestones: usize,
    pub entries: usize,
    pub raw_bytes: u64,
    pub compressed_bytes: u64,
}

/// A saved history document, fully read and checksum-verified
#[derive(Debug)]
pub struct Document {
    header: ContainerHeader,
    head: TimeId,
    graph: EventGraph,
    entries: BTreeMap<StoreKey, usize>,
}

impl Document {
    /// Read the document at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = ContainerReader::open(path.as_ref())?;
        let mut head = None;
        let mut graph = None;
        let mut entries = BTreeMap::new();

        for (name, data) in reader.read_entries()? {
            match name.as_str() {
                TIME_ID_ENTRY => {
                    let key = String::from_utf8(data)
                        .map_err(|e| Error::Serialization(e.to_string()))?;
                    head = Some(TimeId::from_key(&key)?);
                }
                EVENTS_ENTRY => graph = Some(EventGraph::decode(&data)?),
                _ => {
                    entries.insert(name.parse::<StoreKey>()?, data.len());
                }
            }
        }
        debug!(path = %path.as_ref().display(), entries = entries.len(), "read document");

        Ok(Self {
            header: reader.header().clone(),
            head: head.ok_or_else(|| Error::Storage("Missing time_id entry".to_string()))?,
            graph: graph.ok_or_else(|| Error::Storage("Missing events entry".to_string()))?,
            entries,
        })
    }

    pub fn head(&self) -> TimeId {
        self.head
    }

    pub fn graph(&self) -> &EventGraph {
        &self.graph
    }

    pub fn info(&self) -> DocumentInfo {
        DocumentInfo {
            head: self.head,
            events: self.graph.len(),
            milestones: self.graph.events().filter(|e| e.is_milestone).count(),
            entries: self.entries.len(),
            raw_bytes: self.header.raw_size,
            compressed_bytes: self.header.body_size,
        }
    }

    /// Events in time order, or only the chain from the root to HEAD
    pub fn events(&self, chain_only: bool) -> Result<Vec<&HistoryEvent>> {
        if !chain_only {
            return Ok(self.graph.events().collect());
        }
        let mut chain = self.graph.chain_to_root(self.head)?;
        chain.reverse();
        chain.into_iter().map(|t| self.graph.require(t)).collect()
    }

    /// Consistency problems between the graph and the stored entries.
    /// An empty list means the document is sound.
    pub fn verify(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if let Err(e) = self.graph.validate() {
            problems.push(e.to_string());
        }
        if !self.graph.contains(self.head) {
            problems.push(format!("HEAD {} is not an event", self.head));
        }

        for event in self.graph.events() {
            for (object, props) in &event.changed {
                for property in props {
                    let key = StoreKey::value(event.id, *object, property.clone());
                    if !self.entries.contains_key(&key) {
                        problems.push(format!("missing entry {}", key));
                    }
                }
            }
            let ids = StoreKey::ObjectIds(event.object_ids_ref);
            if !self.entries.contains_key(&ids) {
                problems.push(format!("event {}: missing entry {}", event.id, ids));
            }
        }

        for key in self.entries.keys() {
            let referenced = match key {
                StoreKey::Value {
                    time,
                    object,
                    property,
                } => self
                    .graph
                    .get(*time)
                    .map(|e| e.has_change(*object, property))
                    .unwrap_or(false),
                StoreKey::ObjectIds(time) => self.graph.contains(*time),
                StoreKey::TimeId | StoreKey::Events => true,
            };
            if !referenced {
                problems.push(format!("orphaned entry {}", key));
            }
        }
        problems
    }
}

/// One line of the `events` listing
pub fn event_line(event: &HistoryEvent, head: TimeId) -> String {
    let next = event
        .next
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let created = event
        .changed
        .values()
        .filter(|props| props.contains(&PropertyId::Creation))
        .count();
    format!(
        "{}{} prev={} next=[{}] objects={} created={}{} {}",
        if event.id == head { "* " } else { "  " },
        event.id,
        event.prev.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string()),
        next,
        event.changed.len(),
        created,
        if event.is_milestone { " milestone" } else { "" },
        event.display_description().replace('\n', " / ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HistoryConfig;
    use crate::history::HistoryManager;
    use crate::storage::{ContainerWriter, InMemoryStore};
    use crate::core::event::{ObjectId, PropertyData, ValueBag};
    use serde_json::json;
    use tempfile::TempDir;

    fn saved(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("doc.hist");
        let mut history = HistoryManager::new(InMemoryStore::new(), HistoryConfig::default()).unwrap();
        let snapshot = PropertyData::from([(PropertyId::named("x"), ValueBag::new(json!(0)))]);
        history
            .record(ObjectId(1), PropertyId::Creation, snapshot, "Create")
            .unwrap();
        let e1 = history.commit(None).unwrap().unwrap();
        history
            .record(ObjectId(1), PropertyId::named("x"), ValueBag::new(json!(2)), "Move")
            .unwrap();
        history.commit(None).unwrap();
        history.set_milestone(e1, true).unwrap();
        history.save(&path).unwrap();
        path
    }

    #[test]
    fn test_info_and_events() {
        let dir = TempDir::new().unwrap();
        let document = Document::open(saved(&dir)).unwrap();
        let info = document.info();
        assert_eq!(info.events, 3);
        assert_eq!(info.milestones, 1);
        // root ids, e1 ids, e1 creation, e2 value
        assert_eq!(info.entries, 4);

        let events = document.events(false).unwrap();
        assert_eq!(events.len(), 3);
        assert!(event_line(events[2], document.head()).starts_with("* "));
        assert!(event_line(events[1], document.head()).contains("milestone"));
        assert_eq!(document.events(true).unwrap().len(), 3);
        assert!(document.verify().is_empty());
    }

    #[test]
    fn test_verify_reports_missing_entry() {
        let dir = TempDir::new().unwrap();
        let source = Document::open(saved(&dir)).unwrap();

        // rewrite the document without the value entry of HEAD
        let broken = dir.path().join("broken.hist");
        let mut writer = ContainerWriter::create(&broken, 3);
        writer.append(TIME_ID_ENTRY, source.head().to_key().as_bytes()).unwrap();
        writer.append(EVENTS_ENTRY, &source.graph().encode().unwrap()).unwrap();
        for key in source.entries.keys() {
            if key.time() != Some(source.head()) {
                writer.append(&key.to_string(), b"{}").unwrap();
            }
        }
        writer.finish().unwrap();

        let problems = Document::open(&broken).unwrap().verify();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].starts_with("missing entry"));
    }

    #[test]
    fn test_open_missing_events_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.hist");
        let mut writer = ContainerWriter::create(&path, 3);
        writer.append(TIME_ID_ENTRY, b"0_0").unwrap();
        writer.finish().unwrap();
        assert!(matches!(Document::open(&path), Err(Error::Storage(_))));
    }
}
