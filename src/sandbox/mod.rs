//! Execution sandbox.
//!
//! Every execution request gets its own interpreter and runtime guard,
//! never shared with another request. The executor enforces the budget
//! around them:
//!
//! 1. Tool calls: counted by the guard, checked before dispatch
//! 2. Memory: size accounting of live bindings and intermediate values
//! 3. Wall clock: a host-side deadline; the interpreter yields often
//!    enough that a loop without tool calls is still pre-empted
//!
//! On deadline the guard is cancelled (nothing more is dispatched),
//! in-flight calls get a grace period, and whatever is still running is
//! written off in the trace.

pub mod backend;
pub mod guard;
pub mod interpreter;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use backend::{HttpToolBackend, ToolBackend};
pub use guard::{CallOutcome, CallRecord, GuardSettings, RuntimeGuard};
pub use interpreter::Interpreter;

use crate::capability::{CapabilityToken, TokenValidator};
use crate::error::WardenError;
use crate::policy::{ConstraintCompiler, DenyAllVerifier, PolicyContext, SemanticVerifier};
use crate::schema::SchemaRegistry;
use crate::script::{parse_program, Program};

/// Limits for one execution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBudget {
    pub wall_clock: Duration,
    pub max_memory_bytes: usize,
    pub max_tool_calls: u64,
    /// How long in-flight calls may finish after cancellation.
    pub grace_period: Duration,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            wall_clock: Duration::from_secs(30),
            max_memory_bytes: 64 * 1024 * 1024,
            max_tool_calls: 50,
            grace_period: Duration::from_millis(500),
        }
    }
}

/// Code plus everything it is allowed to do.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    pub tokens: Vec<CapabilityToken>,
    pub budget: ResourceBudget,
    pub context: PolicyContext,
}

/// How an execution ended, and every call it made.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub session: Uuid,
    pub result: Result<Value, WardenError>,
    pub trace: Vec<CallRecord>,
    pub elapsed: Duration,
}

pub struct SandboxExecutor {
    registry: Arc<SchemaRegistry>,
    compiler: Arc<ConstraintCompiler>,
    validator: TokenValidator,
    backend: Arc<dyn ToolBackend>,
    verifier: Arc<dyn SemanticVerifier>,
    semantic_timeout: Duration,
}

impl SandboxExecutor {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        compiler: Arc<ConstraintCompiler>,
        validator: TokenValidator,
        backend: Arc<dyn ToolBackend>,
    ) -> Self {
        Self {
            registry,
            compiler,
            validator,
            backend,
            verifier: Arc::new(DenyAllVerifier),
            semantic_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SemanticVerifier>, timeout: Duration) -> Self {
        self.verifier = verifier;
        self.semantic_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn validator(&self) -> &TokenValidator {
        &self.validator
    }

    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionReport {
        match parse_program(&request.code) {
            Ok(program) => {
                self.execute_program(&program, request.tokens, request.budget, request.context)
                    .await
            }
            Err(e) => ExecutionReport {
                session: Uuid::new_v4(),
                result: Err(e),
                trace: vec![],
                elapsed: Duration::ZERO,
            },
        }
    }

    /// Runs an already parsed (and usually already analyzed) program.
    pub async fn execute_program(
        &self,
        program: &Program,
        tokens: Vec<CapabilityToken>,
        budget: ResourceBudget,
        context: PolicyContext,
    ) -> ExecutionReport {
        let session = Uuid::new_v4();
        let started = Instant::now();

        // Forged tokens abort the request; expired ones stay so the guard
        // can report them as expired.
        let now = Utc::now();
        for token in &tokens {
            match self.validator.verify_at(token, now) {
                Ok(()) | Err(WardenError::Expired { .. }) => {}
                Err(e) => {
                    warn!("[{session}] Rejected token {}: {e}", token.id);
                    return ExecutionReport {
                        session,
                        result: Err(e),
                        trace: vec![],
                        elapsed: started.elapsed(),
                    };
                }
            }
        }

        let guard = RuntimeGuard::new(
            GuardSettings {
                registry: self.registry.clone(),
                compiler: self.compiler.clone(),
                backend: self.backend.clone(),
                verifier: self.verifier.clone(),
                context,
                max_tool_calls: budget.max_tool_calls,
                semantic_timeout: self.semantic_timeout,
                wall_clock: budget.wall_clock,
            },
            tokens,
        );
        let interpreter = Interpreter::new(&guard, budget.max_memory_bytes);
        debug!("[{session}] Executing {} statement(s)", program.body.len());

        let mut run = Box::pin(interpreter.run(program));
        let result = tokio::select! {
            result = &mut run => result,
            _ = tokio::time::sleep(budget.wall_clock) => {
                warn!(
                    "[{session}] Wall-clock budget of {}ms exceeded, cancelling",
                    budget.wall_clock.as_millis()
                );
                guard.cancel();
                let _ = tokio::time::timeout(budget.grace_period, &mut run).await;
                Err(guard.timeout_error())
            }
        };
        drop(run);

        let leftovers = guard.teardown();
        // A budget abort outranks whatever error the run unwound with.
        let result = match (result, guard.abort_reason()) {
            (Err(_), Some(reason)) => Err(reason),
            (other, _) => other,
        };
        let trace = guard.trace();
        let elapsed = started.elapsed();

        match &result {
            Ok(_) => info!(
                "[{session}] Completed in {}ms with {} call(s)",
                elapsed.as_millis(),
                trace.len()
            ),
            Err(e) => info!(
                "[{session}] Failed after {}ms with {} call(s) ({leftovers} torn down): {e}",
                elapsed.as_millis(),
                trace.len()
            ),
        }

        ExecutionReport {
            session,
            result,
            trace,
            elapsed,
        }
    }
}
