//! Core data types: time ids, history events and the event graph

pub mod event;
pub mod graph;
pub mod time_id;

pub use event::*;
pub use graph::*;
pub use time_id::*;
