//! Scripted collaborators for the Cascade engine.
//!
//! `mockall` is re-exported for tests that prefer expectation-based mocks.

pub mod scripted;

pub use scripted::{RecordedCall, Reply, ScriptedInvoker};
