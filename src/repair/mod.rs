//! Bounded self-repair: regenerate code from a precise diagnostic until
//! it passes, or until the attempt bound is reached.

pub mod controller;
pub mod diagnostic;
pub mod generator;

pub use controller::{
    AttemptOutcome, RepairAttempt, RepairSettings, RepairState, SelfRepairController, TaskRequest,
    TaskResult, TaskStatus,
};
pub use diagnostic::Diagnostic;
pub use generator::{extract_code, CodeGenerator, GenerationRequest, LlmCodeGenerator, ScriptedGenerator};
