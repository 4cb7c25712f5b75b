//! Per-call enforcement.
//!
//! The guard is the only path from a running script to a tool back-end.
//! For every call it admits the call against the budget, resolves the
//! tool's schema and the tokens that grant it, evaluates the compiled
//! constraints, forwards the call, checks and filters the response, and
//! appends a [`CallRecord`] whatever the outcome.
//!
//! Bookkeeping (sequence numbers, call counter, trace, in-flight set)
//! sits behind one mutex that is never held across an await. Constraint
//! evaluation runs outside it, so concurrent calls race only at the
//! back-end.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::backend::ToolBackend;
use crate::capability::{CapabilityToken, TokenIndex};
use crate::error::{ErrorKind, WardenError};
use crate::policy::{CheckEnv, ConstraintCompiler, PolicyContext, SemanticVerifier};
use crate::schema::SchemaRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Allowed,
    Denied,
    Error,
}

/// One intercepted call, as it ended up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRecord {
    pub seq: u64,
    pub tool: String,
    pub arguments: Value,
    /// Descriptions of the constraints that applied, pre then post.
    pub constraints: Vec<String>,
    pub outcome: CallOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The response after redaction; absent unless the call was allowed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Fixed inputs of one guard, i.e. one execution request.
pub struct GuardSettings {
    pub registry: Arc<SchemaRegistry>,
    pub compiler: Arc<ConstraintCompiler>,
    pub backend: Arc<dyn ToolBackend>,
    pub verifier: Arc<dyn SemanticVerifier>,
    pub context: PolicyContext,
    pub max_tool_calls: u64,
    pub semantic_timeout: Duration,
    /// Wall-clock budget, reported in `Timeout` errors.
    pub wall_clock: Duration,
}

struct InFlight {
    tool: String,
    arguments: Value,
    constraints: Vec<String>,
    dispatched: bool,
    timestamp: DateTime<Utc>,
    started: Instant,
}

#[derive(Default)]
struct GuardState {
    next_seq: u64,
    calls: u64,
    trace: Vec<CallRecord>,
    in_flight: BTreeMap<u64, InFlight>,
    abort: Option<WardenError>,
}

pub struct RuntimeGuard {
    settings: GuardSettings,
    index: TokenIndex,
    cancelled: AtomicBool,
    state: Mutex<GuardState>,
}

impl RuntimeGuard {
    /// `tokens` must already have passed signature verification.
    pub fn new(settings: GuardSettings, tokens: Vec<CapabilityToken>) -> Self {
        let index = TokenIndex::new(tokens.into_iter().map(Arc::new));
        Self {
            settings,
            index,
            cancelled: AtomicBool::new(false),
            state: Mutex::new(GuardState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Cancellation ───────────────────────────────────

    /// No call is dispatched after this returns.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn timeout_error(&self) -> WardenError {
        WardenError::Timeout {
            limit_ms: self.settings.wall_clock.as_millis() as u64,
        }
    }

    /// Stops the whole request: records why, then cancels.
    fn abort(&self, error: WardenError) {
        {
            let mut state = self.state();
            if state.abort.is_none() {
                state.abort = Some(error);
            }
        }
        self.cancel();
    }

    /// The error that aborted the request, if one did.
    pub fn abort_reason(&self) -> Option<WardenError> {
        self.state().abort.clone()
    }

    // ── Interception ───────────────────────────────────

    pub async fn call(&self, tool: &str, args: Value) -> Result<Value, WardenError> {
        if self.is_cancelled() {
            return Err(self.timeout_error());
        }
        let seq = self.admit(tool, &args)?;

        let (constraints, result) = self.enforce(seq, tool, &args).await;
        let outcome = match &result {
            Ok(_) => CallOutcome::Allowed,
            Err(WardenError::ToolError { .. }) => CallOutcome::Error,
            Err(_) => CallOutcome::Denied,
        };
        match &result {
            Ok(_) => debug!("#{seq} {tool}: allowed"),
            Err(e) => info!("#{seq} {tool}: {e}"),
        }
        self.finish(seq, constraints, outcome, &result);
        result
    }

    /// Assigns a sequence number and counts the call. Over budget, the
    /// call is recorded as denied and the request is aborted before
    /// anything is dispatched.
    fn admit(&self, tool: &str, args: &Value) -> Result<u64, WardenError> {
        let mut state = self.state();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.calls += 1;

        if state.calls > self.settings.max_tool_calls {
            let error = WardenError::ResourceExhausted {
                resource: "tool_calls".into(),
                limit: self.settings.max_tool_calls,
            };
            state.trace.push(CallRecord {
                seq,
                tool: tool.to_string(),
                arguments: args.clone(),
                constraints: vec![],
                outcome: CallOutcome::Denied,
                error_kind: Some(error.kind()),
                error: Some(error.to_string()),
                response: None,
                timestamp: Utc::now(),
                duration_ms: 0,
            });
            drop(state);
            warn!("{tool}: tool-call budget of {} exhausted", self.settings.max_tool_calls);
            self.abort(error.clone());
            return Err(error);
        }

        state.in_flight.insert(
            seq,
            InFlight {
                tool: tool.to_string(),
                arguments: args.clone(),
                constraints: vec![],
                dispatched: false,
                timestamp: Utc::now(),
                started: Instant::now(),
            },
        );
        Ok(seq)
    }

    async fn enforce(
        &self,
        seq: u64,
        tool: &str,
        args: &Value,
    ) -> (Vec<String>, Result<Value, WardenError>) {
        let schema = match self.settings.registry.fetch(tool).await {
            Ok(schema) => schema,
            Err(e) => return (vec![], Err(e)),
        };

        let tokens = match self.resolve_tokens(tool, schema.operation()) {
            Ok(tokens) => tokens,
            Err(e) => return (vec![], Err(e)),
        };
        let set = match self.settings.compiler.compile(&schema, &tokens) {
            Ok(set) => set,
            Err(WardenError::NoMatchingCapability { tool }) => {
                return (
                    vec![],
                    Err(WardenError::PermissionDenied {
                        tool,
                        reason: "no capability token matches this tool".into(),
                    }),
                )
            }
            Err(e) => return (vec![], Err(e)),
        };
        let constraints = set.descriptions();

        let env = CheckEnv {
            tool,
            ctx: &self.settings.context,
            verifier: self.settings.verifier.as_ref(),
            semantic_timeout: self.settings.semantic_timeout,
        };
        if let Err(e) = set.check_arguments(args, &env).await {
            return (constraints, Err(e));
        }

        if !self.mark_dispatched(seq, &constraints) {
            return (constraints, Err(self.timeout_error()));
        }
        let response = match self.settings.backend.invoke(tool, args).await {
            Ok(response) => response,
            Err(e) => {
                return (
                    constraints,
                    Err(WardenError::ToolError {
                        tool: tool.to_string(),
                        message: e.to_string(),
                    }),
                )
            }
        };

        let result = set.check_response(response, &env).await;
        (constraints, result)
    }

    /// Tokens that match `tool`, are unexpired, and permit `operation`.
    fn resolve_tokens(
        &self,
        tool: &str,
        operation: &str,
    ) -> Result<Vec<Arc<CapabilityToken>>, WardenError> {
        let now = Utc::now();
        let matching = self.index.matching(tool);
        let live: Vec<_> = matching
            .iter()
            .filter(|t| !t.is_expired_at(now))
            .cloned()
            .collect();
        let granted: Vec<_> = live.iter().filter(|t| t.permits(operation)).cloned().collect();
        if !granted.is_empty() {
            return Ok(granted);
        }

        if matching.is_empty() {
            return Err(WardenError::PermissionDenied {
                tool: tool.to_string(),
                reason: "no capability token grants this tool".into(),
            });
        }
        if live.is_empty() {
            let stale = &matching[0];
            return Err(WardenError::Expired {
                token: stale.id.clone(),
                expired_at: stale.expires_at,
            });
        }
        let ids: Vec<&str> = live.iter().map(|t| t.id.as_str()).collect();
        Err(WardenError::PermissionDenied {
            tool: tool.to_string(),
            reason: format!(
                "operation '{operation}' is not permitted by token(s) {}",
                ids.join(", ")
            ),
        })
    }

    /// Flags the call as sent to the back-end, unless cancellation won
    /// the race.
    fn mark_dispatched(&self, seq: u64, constraints: &[String]) -> bool {
        let mut state = self.state();
        if self.is_cancelled() {
            return false;
        }
        if let Some(call) = state.in_flight.get_mut(&seq) {
            call.dispatched = true;
            call.constraints = constraints.to_vec();
        }
        true
    }

    fn finish(
        &self,
        seq: u64,
        constraints: Vec<String>,
        outcome: CallOutcome,
        result: &Result<Value, WardenError>,
    ) {
        let mut state = self.state();
        let Some(call) = state.in_flight.remove(&seq) else {
            // Already written off by teardown.
            return;
        };
        let (error_kind, error, response) = match result {
            Ok(v) => (None, None, Some(v.clone())),
            Err(e) => (Some(e.kind()), Some(e.to_string()), None),
        };
        state.trace.push(CallRecord {
            seq,
            tool: call.tool,
            arguments: call.arguments,
            constraints,
            outcome,
            error_kind,
            error,
            response,
            timestamp: call.timestamp,
            duration_ms: call.started.elapsed().as_millis() as u64,
        });
    }

    /// Writes off every call still in flight after cancellation and the
    /// grace period. Dispatched calls become `ToolError`; calls that
    /// never reached the back-end are recorded as denied.
    pub fn teardown(&self) -> usize {
        let mut state = self.state();
        let leftovers = std::mem::take(&mut state.in_flight);
        let count = leftovers.len();
        for (seq, call) in leftovers {
            let error = if call.dispatched {
                WardenError::ToolError {
                    tool: call.tool.clone(),
                    message: "did not complete before the sandbox was torn down".into(),
                }
            } else {
                self.timeout_error()
            };
            state.trace.push(CallRecord {
                seq,
                tool: call.tool,
                arguments: call.arguments,
                constraints: call.constraints,
                outcome: if call.dispatched {
                    CallOutcome::Error
                } else {
                    CallOutcome::Denied
                },
                error_kind: Some(error.kind()),
                error: Some(error.to_string()),
                response: None,
                timestamp: call.timestamp,
                duration_ms: call.started.elapsed().as_millis() as u64,
            });
        }
        if count > 0 {
            warn!("Tore down sandbox with {count} call(s) in flight");
        }
        count
    }

    /// The execution trace, in admission order.
    pub fn trace(&self) -> Vec<CallRecord> {
        let mut trace = self.state().trace.clone();
        trace.sort_by_key(|r| r.seq);
        trace
    }

    pub fn calls(&self) -> u64 {
        self.state().calls
    }
}
