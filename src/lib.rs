//! Capability-scoped execution of LLM-generated tool-calling code.
//!
//! Generated programs are statically checked against the tool catalog,
//! run in a per-request sandbox where every tool call passes through a
//! runtime guard enforcing capability tokens and compiled constraints,
//! and repaired by regeneration when they fail for code-quality reasons.

pub mod analyzer;
pub mod capability;
pub mod config;
pub mod error;
pub mod llm;
pub mod policy;
pub mod repair;
pub mod sandbox;
pub mod schema;
pub mod script;

pub use error::{ErrorKind, WardenError};
