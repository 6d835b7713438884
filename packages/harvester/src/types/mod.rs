//! Domain types.

pub mod claim;
pub mod config;
pub mod content;
pub mod gap;
pub mod page;
pub mod plan;
pub mod task;
