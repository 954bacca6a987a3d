//! # pop-tests
//!
//! Integration tests for the PoP mining client.
//!
//! This crate provides:
//! - A header codec and header generators for a synthetic chain
//! - A scripted chain adapter and header source
//! - Integration tests across tracker, pipelines, manager, automine and node
//! - Property-based tests for tip selection and scheduling rules

pub mod generators;
pub mod harness;



#[cfg(test)]
mod manager_tests;

#[cfg(test)]
mod automine_tests;



pub use generators::*;
pub use harness::*;
