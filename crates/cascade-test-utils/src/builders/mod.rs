//! Builders for test engines and step graphs.

pub mod engine;
pub mod steps;

pub use engine::{TestEngine, TestEngineBuilder};
