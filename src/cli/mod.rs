//! Read-only inspection of saved history documents

pub mod commands;
pub mod inspect;

pub use commands::{Cli, Commands};
pub use inspect::{Document, DocumentInfo};
