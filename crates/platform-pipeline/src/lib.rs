//! Platform Pipelines
//!
//! Renders pipeline templates with the resolved repository metadata of a
//! context and runs the result as a `bash` script.

pub mod executor;
pub mod template;

pub use executor::{ScriptExecutor, DEFAULT_SCRATCH_DIR};
pub use template::{render, Template, Value};
