//! Self-repair controller.
//!
//! Drives one task through `Generating → Validating → Executing` and,
//! on a repairable failure, through `Repairing` back to `Validating`
//! with freshly generated code. The loop is bounded: each entry into
//! `Repairing` counts as one attempt, and reaching `max_attempts` ends
//! the task with the full attempt history.
//!
//! Policy failures (missing grants, bad or expired tokens) end the task
//! at once. New code cannot fix them.

use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::diagnostic::Diagnostic;
use super::generator::{CodeGenerator, GenerationRequest};
use crate::analyzer::StaticAnalyzer;
use crate::capability::CapabilityToken;
use crate::config::RepairConfig;
use crate::error::{ErrorKind, WardenError};
use crate::policy::{GrantSuggestion, PolicyContext};
use crate::sandbox::{CallRecord, ResourceBudget, SandboxExecutor};
use crate::script::Program;
use crate::schema::ToolCatalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairSettings {
    /// Bound on entries into `Repairing`.
    pub max_attempts: u32,
    pub generation_timeout: Duration,
}

impl Default for RepairSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            generation_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&RepairConfig> for RepairSettings {
    fn from(config: &RepairConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            generation_timeout: config.generation_timeout(),
        }
    }
}

/// One user task and the authority it runs with.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task: String,
    pub tokens: Vec<CapabilityToken>,
    pub context: PolicyContext,
    pub budget: ResourceBudget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairState {
    Generating,
    Validating,
    Executing,
    Repairing,
    Succeeded,
    Failed,
}

/// What became of the code produced by one repair attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Still being validated or executed.
    Pending,
    Succeeded,
    Failed { error: ErrorKind, message: String },
    GenerationFailed { message: String },
    /// The attempt bound was reached; nothing was generated.
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairAttempt {
    /// 1-based.
    pub index: u32,
    pub diagnostic: Diagnostic,
    pub code: Option<String>,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
}

/// Final answer for one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(serialize_with = "serialize_error", skip_serializing_if = "Option::is_none")]
    pub error: Option<WardenError>,
    /// The last program generated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub history: Vec<RepairAttempt>,
    pub generations: u32,
    pub transitions: Vec<RepairState>,
    /// Calls made by the last execution.
    pub trace: Vec<CallRecord>,
    /// Advisory grant for a call that was denied for lack of permission.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_suggestion: Option<GrantSuggestion>,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }
}

#[derive(Serialize)]
struct ErrorSummary<'a> {
    kind: ErrorKind,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'a str>,
}

fn serialize_error<S: Serializer>(error: &Option<WardenError>, serializer: S) -> Result<S::Ok, S::Error> {
    error
        .as_ref()
        .map(|e| ErrorSummary {
            kind: e.kind(),
            message: e.to_string(),
            tool: e.tool(),
            field: e.field(),
        })
        .serialize(serializer)
}

/// Where the loop is, with the data the next step needs.
enum Step {
    Generate,
    Validate(String),
    Execute(String, Program),
    Repair(String, WardenError),
    Done(Result<Value, WardenError>),
}

impl Step {
    fn state(&self) -> RepairState {
        match self {
            Step::Generate => RepairState::Generating,
            Step::Validate(_) => RepairState::Validating,
            Step::Execute(..) => RepairState::Executing,
            Step::Repair(..) => RepairState::Repairing,
            Step::Done(Ok(_)) => RepairState::Succeeded,
            Step::Done(Err(_)) => RepairState::Failed,
        }
    }
}

pub struct SelfRepairController {
    executor: Arc<SandboxExecutor>,
    generator: Arc<dyn CodeGenerator>,
    catalog: Arc<ToolCatalog>,
    settings: RepairSettings,
}

impl SelfRepairController {
    pub fn new(
        executor: Arc<SandboxExecutor>,
        generator: Arc<dyn CodeGenerator>,
        catalog: Arc<ToolCatalog>,
        settings: RepairSettings,
    ) -> Self {
        Self {
            executor,
            generator,
            catalog,
            settings,
        }
    }

    pub async fn run_task(&self, request: TaskRequest) -> TaskResult {
        info!(
            "Task started ({} token(s), max {} repair attempt(s))",
            request.tokens.len(),
            self.settings.max_attempts
        );

        let mut result = TaskResult {
            status: TaskStatus::Failed,
            value: None,
            error: None,
            code: None,
            history: Vec::new(),
            generations: 0,
            transitions: Vec::new(),
            trace: Vec::new(),
            grant_suggestion: None,
        };

        // Bad tokens are a policy failure: nothing gets generated.
        if let Err(e) = self.executor.validator().verify_all(&request.tokens) {
            warn!("Task rejected before generation: {e}");
            result.transitions.push(RepairState::Failed);
            result.error = Some(e);
            return result;
        }

        let analyzer = StaticAnalyzer::new(&self.catalog);
        let mut generation = GenerationRequest {
            task: request.task.clone(),
            tools: self.catalog.schemas().map(|s| s.signature()).collect(),
            previous_code: None,
            diagnostic: None,
        };
        let mut attempts = 0u32;
        let mut step = Step::Generate;

        let outcome = loop {
            result.transitions.push(step.state());
            debug!("Task state: {:?}", step.state());

            step = match step {
                Step::Generate => match self.generate(&generation, &mut result).await {
                    Ok(code) => Step::Validate(code),
                    Err(e) => Step::Done(Err(e)),
                },

                Step::Validate(code) => {
                    result.trace.clear();
                    match analyzer.check_source(&code) {
                        Ok((program, report)) => {
                            if !report.fully_checked() {
                                debug!(
                                    "{} call(s) left to the runtime guard",
                                    report.dynamic_calls + report.deferred_calls
                                );
                            }
                            Step::Execute(code, program)
                        }
                        Err(e) => self.after_failure(code, e, &mut result),
                    }
                }

                Step::Execute(code, program) => {
                    let report = self
                        .executor
                        .execute_program(
                            &program,
                            request.tokens.clone(),
                            request.budget,
                            request.context.clone(),
                        )
                        .await;
                    result.trace = report.trace;
                    match report.result {
                        Ok(value) => {
                            settle(&mut result.history, AttemptOutcome::Succeeded);
                            Step::Done(Ok(value))
                        }
                        Err(e) => self.after_failure(code, e, &mut result),
                    }
                }

                Step::Repair(code, error) => {
                    attempts += 1;
                    let diagnostic = Diagnostic::from_error(&error, &self.catalog, &result.trace);
                    warn!(
                        "Repair attempt {attempts}/{}: {}",
                        self.settings.max_attempts, diagnostic.message
                    );

                    if attempts >= self.settings.max_attempts {
                        result.history.push(RepairAttempt {
                            index: attempts,
                            diagnostic,
                            code: None,
                            outcome: AttemptOutcome::NotAttempted,
                        });
                        Step::Done(Err(WardenError::MaxRepairAttemptsExceeded {
                            attempts,
                            last_error: Box::new(error),
                        }))
                    } else {
                        generation.previous_code = Some(code);
                        generation.diagnostic = Some(diagnostic.clone());
                        let generated = self.generate(&generation, &mut result).await;
                        let (code, outcome, next) = match generated {
                            Ok(code) => (
                                Some(code.clone()),
                                AttemptOutcome::Pending,
                                Step::Validate(code),
                            ),
                            Err(e) => (
                                None,
                                AttemptOutcome::GenerationFailed {
                                    message: e.to_string(),
                                },
                                Step::Done(Err(e)),
                            ),
                        };
                        result.history.push(RepairAttempt {
                            index: attempts,
                            diagnostic,
                            code,
                            outcome,
                        });
                        next
                    }
                }

                Step::Done(outcome) => break outcome,
            };
        };

        match outcome {
            Ok(value) => {
                info!(
                    "Task succeeded after {} generation(s), {} repair attempt(s)",
                    result.generations,
                    result.history.len()
                );
                result.status = TaskStatus::Succeeded;
                result.value = Some(value);
            }
            Err(e) => {
                warn!("Task failed: {e}");
                if matches!(
                    e.kind(),
                    ErrorKind::PermissionDenied | ErrorKind::NoMatchingCapability
                ) {
                    result.grant_suggestion = self.suggest_grant(&e, &result.trace, &request.context);
                }
                result.error = Some(e);
            }
        }
        result
    }

    /// Generates under the configured timeout. Any failure is terminal.
    async fn generate(
        &self,
        request: &GenerationRequest,
        result: &mut TaskResult,
    ) -> Result<String, WardenError> {
        let timeout = self.settings.generation_timeout;
        let code = match tokio::time::timeout(timeout, self.generator.generate(request)).await {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                return Err(WardenError::GenerationFailed {
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(WardenError::GenerationFailed {
                    message: format!("no code within {}s", timeout.as_secs_f64()),
                })
            }
        };
        result.generations += 1;
        result.code = Some(code.clone());
        Ok(code)
    }

    fn after_failure(&self, code: String, error: WardenError, result: &mut TaskResult) -> Step {
        settle(
            &mut result.history,
            AttemptOutcome::Failed {
                error: error.kind(),
                message: error.to_string(),
            },
        );
        if error.is_repairable() {
            Step::Repair(code, error)
        } else {
            Step::Done(Err(error))
        }
    }

    fn suggest_grant(
        &self,
        error: &WardenError,
        trace: &[CallRecord],
        ctx: &PolicyContext,
    ) -> Option<GrantSuggestion> {
        let record = trace
            .iter()
            .find(|r| r.error_kind == Some(error.kind()) && Some(r.tool.as_str()) == error.tool())?;
        let schema = self.catalog.get(&record.tool)?;
        let suggestion = GrantSuggestion::for_call(schema, &record.arguments, ctx);
        info!("Suggested grant: {} {:?}", suggestion.pattern, suggestion.operations);
        Some(suggestion)
    }
}

/// Records how the code of the latest attempt fared.
fn settle(history: &mut [RepairAttempt], outcome: AttemptOutcome) {
    if let Some(last) = history.last_mut() {
        if last.outcome == AttemptOutcome::Pending {
            last.outcome = outcome;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ToolPattern, TokenValidator, TrustStore};
    use crate::policy::ConstraintCompiler;
    use crate::repair::ScriptedGenerator;
    use crate::sandbox::ToolBackend;
    use crate::schema::{InMemorySchemaSource, SchemaRegistry, ToolSchema};
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD as Base64;
    use base64::Engine;
    use chrono::{Duration as ChronoDuration, Utc};
    use ed25519_dalek::{Signer, SigningKey};
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    struct EchoBackend;

    #[async_trait]
    impl ToolBackend for EchoBackend {
        async fn invoke(&self, _tool: &str, args: &Value) -> anyhow::Result<Value> {
            Ok(args.clone())
        }
    }

    struct SlowGenerator;

    #[async_trait]
    impl CodeGenerator for SlowGenerator {
        async fn generate(&self, _request: &GenerationRequest) -> anyhow::Result<String> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("return 1;".into())
        }
    }

    fn key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn token(pattern: &str, ops: &[&str]) -> CapabilityToken {
        let mut t = CapabilityToken {
            id: "t1".into(),
            pattern: ToolPattern::parse(pattern).unwrap(),
            operations: ops.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            constraints: vec![],
            issuer: "authority".into(),
            expires_at: Utc::now() + ChronoDuration::hours(1),
            signature: String::new(),
        };
        t.signature = Base64.encode(key().sign(&t.signing_bytes()).to_bytes());
        t
    }

    fn schemas() -> Vec<ToolSchema> {
        serde_json::from_value(json!([
            {"name": "svc.read.get", "parameters": [
                {"name": "id", "type": "integer", "required": true, "bounds": {"min": 1}}
            ]},
            {"name": "svc.write.put", "parameters": [
                {"name": "owner", "type": "string", "required": true}
            ]}
        ]))
        .unwrap()
    }

    fn controller(generator: Arc<dyn CodeGenerator>, max_attempts: u32) -> SelfRepairController {
        let mut trust = TrustStore::new();
        trust.insert("authority", key().verifying_key());
        let executor = SandboxExecutor::new(
            Arc::new(SchemaRegistry::new(Arc::new(InMemorySchemaSource::new(schemas())))),
            Arc::new(ConstraintCompiler::new()),
            TokenValidator::new(Arc::new(trust)),
            Arc::new(EchoBackend),
        );
        SelfRepairController::new(
            Arc::new(executor),
            generator,
            Arc::new(ToolCatalog::new(schemas())),
            RepairSettings {
                max_attempts,
                generation_timeout: Duration::from_millis(200),
            },
        )
    }

    fn request(tokens: Vec<CapabilityToken>) -> TaskRequest {
        TaskRequest {
            task: "fetch item 1".into(),
            tokens,
            context: PolicyContext::for_principal("alice"),
            budget: ResourceBudget::default(),
        }
    }

    #[tokio::test]
    async fn test_first_generation_succeeds() {
        let generator = Arc::new(ScriptedGenerator::new(["let r = svc.read.get({id: 1}); return r.id;"]));
        let result = controller(generator.clone(), 3)
            .run_task(request(vec![token("svc.*", &["read"])]))
            .await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.value, Some(json!(1)));
        assert!(result.history.is_empty());
        assert_eq!(result.generations, 1);
        assert_eq!(
            result.transitions,
            vec![
                RepairState::Generating,
                RepairState::Validating,
                RepairState::Executing,
                RepairState::Succeeded
            ]
        );
        assert!(!generator.requests()[0].is_repair());
    }

    #[tokio::test]
    async fn test_static_failure_is_repaired() {
        let generator = Arc::new(ScriptedGenerator::new([
            "return svc.read.get({id: 0});",
            "return svc.read.get({id: 2}).id;",
        ]));
        let result = controller(generator.clone(), 3)
            .run_task(request(vec![token("svc.*", &["read"])]))
            .await;
        assert!(result.is_success());
        assert_eq!(result.history.len(), 1);
        assert_eq!(result.history[0].outcome, AttemptOutcome::Succeeded);
        assert_eq!(result.history[0].diagnostic.kind, ErrorKind::StaticSchemaViolation);

        let repair = &generator.requests()[1];
        assert_eq!(repair.previous_code.as_deref(), Some("return svc.read.get({id: 0});"));
        assert_eq!(repair.diagnostic.as_ref().unwrap().field.as_deref(), Some("id"));
    }

    #[tokio::test]
    async fn test_permission_denied_is_terminal_with_suggestion() {
        let generator = Arc::new(ScriptedGenerator::new([
            "svc.write.put({owner: \"alice\"});",
            "return 1;",
        ]));
        let result = controller(generator.clone(), 3)
            .run_task(request(vec![token("svc.read.*", &["read"])]))
            .await;
        assert!(!result.is_success());
        assert_eq!(result.error.as_ref().map(|e| e.kind()), Some(ErrorKind::PermissionDenied));
        assert!(result.history.is_empty());
        assert_eq!(generator.requests().len(), 1);
        assert!(!result.transitions.contains(&RepairState::Repairing));

        let suggestion = result.grant_suggestion.unwrap();
        assert_eq!(suggestion.pattern, "svc.write.put");
        assert!(suggestion.operations.contains("write"));
    }

    #[tokio::test]
    async fn test_forged_token_stops_before_generation() {
        let mut forged = token("svc.*", &["read"]);
        forged.operations.insert("write".into());
        let generator = Arc::new(ScriptedGenerator::new(["return 1;"]));
        let result = controller(generator.clone(), 3).run_task(request(vec![forged])).await;
        assert_eq!(result.error.as_ref().map(|e| e.kind()), Some(ErrorKind::InvalidSignature));
        assert!(generator.requests().is_empty());
        assert_eq!(result.generations, 0);
    }

    #[tokio::test]
    async fn test_generation_timeout_is_terminal() {
        let result = controller(Arc::new(SlowGenerator), 3)
            .run_task(request(vec![token("svc.*", &["read"])]))
            .await;
        assert_eq!(result.error.as_ref().map(|e| e.kind()), Some(ErrorKind::GenerationFailed));
        assert_eq!(result.generations, 0);
    }

    #[tokio::test]
    async fn test_failed_repair_generation_is_recorded() {
        let generator = Arc::new(ScriptedGenerator::new(["return nope;"]));
        let result = controller(generator, 3)
            .run_task(request(vec![token("svc.*", &["read"])]))
            .await;
        assert_eq!(result.error.as_ref().map(|e| e.kind()), Some(ErrorKind::GenerationFailed));
        assert_eq!(result.history.len(), 1);
        assert!(matches!(result.history[0].outcome, AttemptOutcome::GenerationFailed { .. }));
        assert!(result.history[0].code.is_none());
    }

    #[tokio::test]
    async fn test_result_serializes() {
        let generator = Arc::new(ScriptedGenerator::new(["return missing;"; 3]));
        let result = controller(generator, 2)
            .run_task(request(vec![token("svc.*", &["read"])]))
            .await;
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["kind"], "max_repair_attempts_exceeded");
        assert_eq!(json["history"][0]["outcome"]["status"], "failed");
        assert_eq!(json["history"][1]["outcome"]["status"], "not_attempted");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_repair_loop_is_bounded(max_attempts in 1u32..6) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let generator = Arc::new(ScriptedGenerator::new(vec!["return undefined_name;"; 10]));
            let result = rt.block_on(
                controller(generator.clone(), max_attempts)
                    .run_task(request(vec![token("svc.*", &["read"])])),
            );
            prop_assert_eq!(result.history.len() as u32, max_attempts);
            prop_assert_eq!(result.generations, max_attempts);
            prop_assert_eq!(generator.requests().len() as u32, max_attempts);
            let is_max_exceeded = matches!(
                result.error,
                Some(WardenError::MaxRepairAttemptsExceeded { attempts, .. }) if attempts == max_attempts
            );
            prop_assert!(is_max_exceeded);
        }
    }
}
