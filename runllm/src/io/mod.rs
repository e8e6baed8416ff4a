//! I/O collaborators for the execution engine.

pub mod config;
pub mod credentials;
pub mod model;
pub mod process;
pub mod program;
pub mod prompt;
pub mod sandbox;
pub mod stats;
pub mod worker;
