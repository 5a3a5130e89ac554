//! Disk-backed event store kept in a single container file.
//!
//! The file is read once on open. Mutations are held in memory and the
//! container is rewritten on `flush`, which the history manager calls at
//! the end of every logical operation.

use crate::error::Result;
use crate::storage::container::{ContainerReader, ContainerWriter};
use crate::storage::store::{EventStore, StoreKey};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Event store backed by one container file
pub struct FileStore {
    path: PathBuf,
    entries: BTreeMap<StoreKey, Vec<u8>>,
    dirty: bool,
    compression_level: i32,
}

impl FileStore {
    /// Open the store at `path`, loading its entries if the file exists
    pub fn open<P: AsRef<Path>>(path: P, compression_level: i32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = BTreeMap::new();

        if path.exists() {
            let mut reader = ContainerReader::open(&path)?;
            for (name, data) in reader.read_entries()? {
                entries.insert(name.parse::<StoreKey>()?, data);
            }
            debug!(path = %path.display(), entries = entries.len(), "opened file store");
        }

        Ok(Self {
            path,
            entries,
            dirty: false,
            compression_level,
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether there are mutations not yet flushed
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl EventStore for FileStore {
    fn put(&mut self, key: StoreKey, data: Vec<u8>) -> Result<()> {
        self.entries.insert(key, data);
        self.dirty = true;
        Ok(())
    }

    fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).cloned())
    }

    fn remove(&mut self, key: &StoreKey) -> Result<bool> {
        let removed = self.entries.remove(key).is_some();
        self.dirty |= removed;
        Ok(removed)
    }

    fn contains(&self, key: &StoreKey) -> bool {
        self.entries.contains_key(key)
    }

    fn keys(&self) -> Vec<StoreKey> {
        self.entries.keys().cloned().collect()
    }

    fn clear(&mut self) -> Result<()> {
        self.dirty |= !self.entries.is_empty();
        self.entries.clear();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut writer = ContainerWriter::create(&self.path, self.compression_level);
        for (key, data) in &self.entries {
            writer.append(&key.to_string(), data)?;
        }
        let header = writer.finish()?;
        self.dirty = false;
        debug!(
            path = %self.path.display(),
            entries = header.entry_count,
            bytes = header.body_size,
            "flushed file store"
        );
        Ok(())
    }
}
