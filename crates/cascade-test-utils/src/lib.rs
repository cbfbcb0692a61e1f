//! Testing utilities for the Cascade Platform.
//!
//! This crate provides standardized testing utilities for the Cascade engine:
//! scripted collaborators, span sink fakes, step graph and engine builders,
//! and assertion helpers for run results.

pub mod assertions;
pub mod builders;
pub mod implementations;
pub mod mocks;
pub mod util;

/// Re-export commonly used types for convenience
pub use mockall;

pub use builders::{TestEngine, TestEngineBuilder};
pub use implementations::{FailingSpanSink, RecordingSpanSink};
pub use mocks::{Reply, ScriptedInvoker};
pub use util::{bindings, init_test_tracing};
