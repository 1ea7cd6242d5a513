//! airtek-infra: resource composition for the Air-Tek web stack.
//!
//! Components declare resources into an explicit ownership tree and a
//! dependency DAG of deferred values. A small deterministic engine orders the
//! graph, diffs it against a BLAKE3-hashed state lock, and drives a provider.

pub mod cli;
pub mod components;
pub mod core;
pub mod provider;
pub mod tripwire;
