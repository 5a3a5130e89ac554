//! Temporal-History: branching undo/redo history for versioned objects
//!
//! Application objects describe themselves as named property values. Every
//! committed batch of edits becomes an event in a tree of events keyed by
//! time, and the values are kept in a keyed blob store so any point of the
//! tree can be restored.
//!
//! # Core Concepts
//!
//! - **Events**: Nodes of the history tree recording which properties of
//!   which objects changed
//! - **Store**: Value blobs keyed by event time, object and property
//! - **Collaborator**: The host that snapshots and restores its objects
//! - **Compaction**: Folding old runs of events into one to bound the history
//!
//! # Example
//!
//! ```no_run
//! use temporal_history::prelude::*;
//!
//! # fn example(scene: &mut dyn Collaborator) -> temporal_history::error::Result<()> {
//! let mut history = HistoryManager::new(InMemoryStore::new(), HistoryConfig::default())?;
//!
//! history.record_change(ObjectId(1), PropertyId::named("transform"), scene, "Move")?;
//! history.tick()?;
//!
//! history.undo(scene)?;
//! history.save("scene.hist")?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod collaborator;
pub mod config;
pub mod core;
pub mod error;
pub mod history;
pub mod storage;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::collaborator::{ChangeKind, Collaborator, Restoration, RestoreType};
    pub use crate::config::HistoryConfig;
    pub use crate::core::*;
    pub use crate::error::{Error, Result};
    pub use crate::history::{HistoryManager, MergeReport, TickReport};
    pub use crate::storage::{EventStore, FileStore, InMemoryStore, StoreKey};
}
