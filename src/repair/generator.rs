//! Code generation: the model behind a text-in/text-out interface.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::Diagnostic;
use crate::llm::{LlmClient, Message};

/// What the generator is asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub task: String,
    /// Signatures of the tools in the session catalog.
    pub tools: Vec<String>,
    /// Set when repairing.
    pub previous_code: Option<String>,
    /// Set when repairing.
    pub diagnostic: Option<Diagnostic>,
}

impl GenerationRequest {
    pub fn is_repair(&self) -> bool {
        self.diagnostic.is_some()
    }
}

/// Source of generated programs.
///
/// The controller wraps every call in a timeout, so implementations do
/// not need their own.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<String>;
}

const SYSTEM_PROMPT: &str = "\
You write programs in Warden script, a small JSON-valued language, to accomplish a task by calling tools.

Language:
- `let x = expr;` declares, `x = expr;` assigns. Values are JSON: null, booleans, numbers, strings, arrays, objects.
- `if cond { ... } else { ... }`, `while cond { ... }`, `loop { ... }`, `for x in expr { ... }`, `break;`, `continue;`, `return expr;`.
- Operators: + - * / % == != < <= > >= && || ! and `in`. Field access `a.b`, indexing `a[0]`.
- Builtins: len(x), str(x), int(x), keys(obj), range(n), push(array, value), has(obj, \"field\").
- Tool call: `ns.op.name({arg: value, ...})` or `call(\"ns.op.name\", {...})`. The result is the tool's JSON response.
- `parallel [callA(...), callB(...)]` runs calls concurrently and returns their results in order.

Rules:
- Only call tools from the list below, with exactly the parameters they declare.
- Required parameters must be present; patterns and bounds must be respected.
- Every call is checked against the caller's permissions; a denied call fails the program.
- Return the final answer with `return`.
- Reply with the program only, in a single ``` fenced block.";

/// Generates code with an LLM.
pub struct LlmCodeGenerator {
    client: Arc<dyn LlmClient>,
}

impl LlmCodeGenerator {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    fn system_prompt(request: &GenerationRequest) -> String {
        format!("{SYSTEM_PROMPT}\n\nAvailable tools:\n{}", request.tools.join("\n"))
    }

    fn messages(request: &GenerationRequest) -> Vec<Message> {
        let mut messages = vec![Message::user(format!("Task: {}", request.task))];
        if let (Some(code), Some(diagnostic)) = (&request.previous_code, &request.diagnostic) {
            messages.push(Message::assistant(format!("```\n{code}\n```")));
            messages.push(Message::user(format!(
                "That program failed.\n\n{}\nReturn the corrected program.",
                diagnostic.render()
            )));
        }
        messages
    }
}

#[async_trait]
impl CodeGenerator for LlmCodeGenerator {
    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<String> {
        debug!(
            "Requesting {} from {}",
            if request.is_repair() { "repair" } else { "code" },
            self.client.description()
        );
        let response = self
            .client
            .complete(&Self::system_prompt(request), &Self::messages(request))
            .await?;
        let code = extract_code(&response.text);
        if code.is_empty() {
            anyhow::bail!("model returned no code");
        }
        Ok(code)
    }
}

/// Returns the body of the first fenced block, or the whole reply when
/// it has none. An unterminated fence runs to the end of the text.
pub fn extract_code(text: &str) -> String {
    let Some(start) = text.find("```") else {
        return text.trim().to_string();
    };
    let after = &text[start + 3..];
    // Skip the info string (```warden, ```js, ...).
    let body = match after.find('\n') {
        Some(nl) => &after[nl + 1..],
        None => after,
    };
    let body = match body.find("```") {
        Some(end) => &body[..end],
        None => body,
    };
    body.trim().to_string()
}

/// Replays a fixed sequence of programs, one per request.
///
/// Used to drive the repair loop without a model, e.g. from recorded
/// generations. Fails once the script is exhausted.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new<I, S>(programs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(programs.into_iter().map(Into::into).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CodeGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<String> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("scripted generator exhausted"))
    }
}
