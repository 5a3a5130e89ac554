//! Contract between the history core and the versioned application objects

use crate::core::event::{ObjectId, PropertyData, PropertyId};
use crate::core::time_id::TimeId;
use crate::error::Result;

/// What kind of data the history asks an object for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// A full snapshot of every named property
    Creation,
    /// The current value of one property
    PropChange(PropertyId),
}

/// Direction of a restore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreType {
    Undo,
    Redo,
    /// A step of a multi-step jump across the graph
    UndoRedo,
}

/// Data handed back to an object when history moves
#[derive(Debug, Clone, PartialEq)]
pub enum Restoration {
    /// Rebuild the whole object from a full snapshot, replacing any
    /// existing object with the same id
    Object(PropertyData),
    /// Apply individual property values
    Properties(PropertyData),
}

/// Host-side owner of the versioned objects.
///
/// Every versioned object must be able to describe itself as
/// [`PropertyData`] and be rebuilt from it.
#[cfg_attr(test, mockall::automock)]
pub trait Collaborator {
    /// Data to record for `object`
    fn data_to_store(&self, object: ObjectId, kind: ChangeKind) -> Result<PropertyData>;

    /// Apply stored data to `object`, creating it for [`Restoration::Object`]
    fn restore_data(
        &mut self,
        object: ObjectId,
        data: Restoration,
        restore: RestoreType,
        old_time: TimeId,
        new_time: TimeId,
    ) -> Result<()>;

    /// Destroy `object`; `add_to_history` is false when history itself
    /// drives the destruction
    fn destroy(&mut self, object: ObjectId, add_to_history: bool) -> Result<()>;
}
