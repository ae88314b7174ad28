//! # TideSync Testkit
//!
//! Test utilities for the TideSync engine.
//!
//! This crate provides:
//! - A blocking harness over the asynchronous context API
//! - Property-based generators for mutation sequences using proptest
//! - A reference condensation model to check the queue against

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

pub use fixtures::SyncHarness;
pub use generators::{
    collapse, local_mutation_strategy, mutation_sequence_strategy, LocalMutation,
};
