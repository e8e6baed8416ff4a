//! Contract-enforced execution of small LLM program units.
//!
//! A program unit (`.rllm` file) declares an input schema, an output schema,
//! an instruction template and a model. Running it validates the input, runs
//! its composed dependencies, renders the prompt with an output contract, and
//! retries until the model returns one JSON object that satisfies the output
//! schema or the attempt budget runs out.
//!
//! - **[`core`]**: Pure, deterministic logic (schemas, templates, attempt state
//!   machine, dependency graph). No I/O.
//! - **[`io`]**: Side-effecting collaborators (program files, sandbox worker
//!   processes, model backend, stats store, config).
//!
//! [`resolve`] and [`engine`] coordinate the two into one run.

pub mod cancel;
pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod resolve;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
