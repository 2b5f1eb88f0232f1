//! Deterministic, pure logic shared by the pipeline runner.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod context;
pub mod invariants;
pub mod pipeline;
pub mod run;
pub mod types;
