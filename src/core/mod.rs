//! Core engine logic — types, parsing, rendering graph, values, planning, execution.

pub mod configuration;
pub mod deferred;
pub mod error;
pub mod executor;
pub mod gitsource;
pub mod graph;
pub mod parser;
pub mod planner;
pub mod recipe;
pub mod resource_id;
pub mod types;
