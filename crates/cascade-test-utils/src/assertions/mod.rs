//! Assertion utilities for run results.

pub mod run;

pub use run::*;
