//! Storage layer: keyed blob store and the single-file container format

pub mod container;
pub mod file_store;
pub mod store;

pub use container::{ContainerHeader, ContainerReader, ContainerWriter};
pub use file_store::FileStore;
pub use store::*;
