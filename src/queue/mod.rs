//! The experiment queue: a tree of samples, task groups and tasks, the
//! client projection of that tree, and the engine that walks it.

pub mod cascade;
pub mod context;
pub mod events;
pub mod execution;
pub mod items;
pub mod manager;
pub mod path;
pub mod persistence;
pub mod projection;
pub mod reorder;
pub mod tree;
pub mod types;

#[cfg(test)]
mod tests;

pub use cascade::*;
pub use context::*;
pub use events::*;
pub use execution::*;
pub use items::*;
pub use manager::*;
pub use path::*;
pub use persistence::*;
pub use projection::*;
pub use tree::*;
pub use types::*;
