//! Core engine: types, configuration, deferred values, graph, planning and execution.

pub mod error;
pub mod executor;
pub mod graph;
pub mod output;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod state;
pub mod types;
