//! In-memory record store for the Cascade Platform
//!
//! This crate provides an in-memory implementation of the record layer
//! interface defined in the cascade-core crate. It is primarily useful for
//! development, testing, and the `cascade-run` binary where persistence is
//! not required.

pub mod repositories;
pub use repositories::{ForeignKey, InMemoryRecordStore, ID_FIELD};
