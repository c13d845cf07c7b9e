//! TideFS test and validation infrastructure.
//!
//! The harness mounts a [`tidefs_fs::TideFs`] over the in-memory backend
//! and wires multi-node clusters through the loopback transport. The
//! sibling modules hold the end-to-end scenarios, system invariant checks
//! and property-based tests.

pub mod harness;
pub mod invariant_tests;
pub mod prop_buffers;
pub mod scenarios;

pub use harness::{TestCluster, TestMount};
