//! Deterministic, pure logic shared by the execution engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod attempt;
pub mod budget;
pub mod example;
pub mod graph;
pub mod output;
pub mod schema;
pub mod template;
pub mod types;
pub mod version;
