//! Saving the history into a document container, loading it back, and
//! rotating backups

use super::HistoryManager;
use crate::collaborator::{Collaborator, Restoration, RestoreType};
use crate::config::HistoryConfig;
use crate::core::event::{decode_snapshot, ObjectId, PropertyData, PropertyId, ValueBag};
use crate::core::graph::EventGraph;
use crate::core::time_id::TimeId;
use crate::error::{Error, Result};
use crate::storage::container::{ContainerHeader, ContainerReader, ContainerWriter};
use crate::storage::store::{EventStore, StoreKey, EVENTS_ENTRY, TIME_ID_ENTRY};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// `<doc>.bak<n>`
fn backup_path(document: &Path, n: usize) -> PathBuf {
    let mut name = document
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".bak{}", n));
    document.with_file_name(name)
}

impl<S: EventStore> HistoryManager<S> {
    /// Commit any staged batch and write the whole history to `path`
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.commit(None)?;
        let header = self.write_document(path)?;

        self.saved_time = Some(self.current_time);
        self.graph_modified = false;
        self.document_path = Some(path.to_path_buf());
        info!(
            path = %path.display(),
            head = %self.current_time,
            entries = header.entry_count,
            bytes = header.body_size,
            "saved history"
        );
        Ok(())
    }

    /// Read a saved document into `store` and rebuild every object alive
    /// at the saved HEAD through `collaborator`
    pub fn load<P: AsRef<Path>>(
        path: P,
        mut store: S,
        collaborator: &mut dyn Collaborator,
        config: HistoryConfig,
    ) -> Result<Self> {
        let path = path.as_ref();
        config.validate()?;

        let mut reader = ContainerReader::open(path)?;
        let mut head = None;
        let mut graph = None;
        store.clear()?;
        for (name, data) in reader.read_entries()? {
            match name.as_str() {
                TIME_ID_ENTRY => {
                    let key = std::str::from_utf8(&data).map_err(|e| {
                        Error::Serialization(format!("Invalid {} entry: {}", TIME_ID_ENTRY, e))
                    })?;
                    head = Some(TimeId::from_key(key)?);
                }
                EVENTS_ENTRY => graph = Some(EventGraph::decode(&data)?),
                _ => store.put(name.parse::<StoreKey>()?, data)?,
            }
        }
        let head = head
            .ok_or_else(|| Error::Storage(format!("Document lacks a {} entry", TIME_ID_ENTRY)))?;
        let graph = graph
            .ok_or_else(|| Error::Storage(format!("Document lacks an {} entry", EVENTS_ENTRY)))?;
        graph.validate()?;
        graph.require(head)?;
        store.flush()?;

        let mut history = Self::from_parts(store, graph, head, config);
        history.saved_time = Some(head);
        history.document_path = Some(path.to_path_buf());

        let live = history.live_objects()?;
        let mut snapshots = Vec::with_capacity(live.len());
        for object in live {
            snapshots.push((object, history.reconstruct_object(object, head)?));
        }
        for (object, snapshot) in snapshots {
            collaborator.restore_data(
                object,
                Restoration::Object(snapshot),
                RestoreType::Redo,
                TimeId::BEFORE_LOAD,
                head,
            )?;
        }

        info!(
            path = %path.display(),
            head = %head,
            events = history.graph.len(),
            objects = history.live_objects()?.len(),
            "loaded history"
        );
        Ok(history)
    }

    /// Write a rotated backup next to the last saved document.
    ///
    /// Returns `None` when the history was never saved or loaded.
    pub fn backup(&self) -> Result<Option<PathBuf>> {
        let Some(document) = self.document_path.as_deref() else {
            debug!("no document path, backup skipped");
            return Ok(None);
        };

        for n in (1..self.config.backup_count).rev() {
            let from = backup_path(document, n);
            if from.exists() {
                std::fs::rename(&from, backup_path(document, n + 1))?;
            }
        }
        let target = backup_path(document, 1);
        self.write_document(&target)?;
        info!(path = %target.display(), "wrote backup");
        Ok(Some(target))
    }

    fn write_document(&self, path: &Path) -> Result<ContainerHeader> {
        let mut writer = ContainerWriter::create(path, self.config.compression_level);
        writer.append(TIME_ID_ENTRY, self.current_time.to_key().as_bytes())?;
        writer.append(EVENTS_ENTRY, &self.graph.encode()?)?;
        for key in self.store.keys() {
            if key.time().is_some() {
                writer.append(&key.to_string(), &self.store.get_required(&key)?)?;
            }
        }
        writer.finish()
    }

    /// Full state of a live `object` at `at`: its latest creation snapshot
    /// with every later property change laid over it
    fn reconstruct_object(&self, object: ObjectId, at: TimeId) -> Result<PropertyData> {
        let mut overlay = PropertyData::new();
        for time in self.graph.chain_to_root(at)? {
            let Some(props) = self.graph.require(time)?.changed_properties(object) else {
                continue;
            };
            for property in props.iter().filter(|p| !p.is_reserved()) {
                if !overlay.contains_key(property) {
                    let key = StoreKey::value(time, object, property.clone());
                    let value = ValueBag::decode(&self.store.get_required(&key)?)?;
                    overlay.insert(property.clone(), value);
                }
            }
            if props.contains(&PropertyId::Creation) {
                let key = StoreKey::value(time, object, PropertyId::Creation);
                let mut snapshot = decode_snapshot(&self.store.get_required(&key)?)?;
                snapshot.extend(overlay);
                return Ok(snapshot);
            }
        }
        Err(Error::MissingValue {
            object,
            property: PropertyId::Creation,
            time: at,
        })
    }
}
