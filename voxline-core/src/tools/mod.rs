//! Function calls embedded in the live conversation.
//!
//! The backend may pause a turn and ask for one or more tool invocations.
//! Every invocation must be answered with exactly one [`ToolResponse`] before
//! the turn can close, so the dispatcher never drops one: unknown names and
//! handler failures are answered with an error-shaped result instead.
//!
//! ```text
//! ConnectionEvent::ToolCall ─► ToolDispatcher::dispatch ─► ToolHandler::call
//!                                      │                         │
//!                                      └──── TransportLink::send_tool_response
//! ```

pub mod submit_application;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ToolDispatchError;
use crate::session::diagnostics::SessionDiagnostics;
use crate::transport::TransportLink;

pub use submit_application::{
    ApplicationDraft, ApplicationSink, Notifier, QualificationStatus, SubmitApplicationTool,
};

/// A function call requested by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// The single answer to a `ToolInvocation`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    pub id: String,
    pub name: String,
    pub result: Value,
}

impl ToolResponse {
    /// Error-shaped response: `{"error": "<message>"}`.
    pub fn from_error(invocation: &ToolInvocation, error: &ToolDispatchError) -> Self {
        Self {
            id: invocation.id.clone(),
            name: invocation.name.clone(),
            result: json!({ "error": error.to_string() }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.result.get("error").is_some()
    }
}

/// A tool advertised to the backend when the session opens.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema of the `arguments` object.
    pub parameter_schema: Value,
}

/// Where an invocation is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Pending,
    Dispatched,
    Answered,
}

/// A locally implemented tool.
#[async_trait]
pub trait ToolHandler: Send + Sync + 'static {
    fn declaration(&self) -> ToolDeclaration;

    /// Run the tool. The returned value becomes `response.result`.
    async fn call(&self, arguments: Value) -> Result<Value, ToolDispatchError>;
}

/// Name → handler lookup.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its declared name, replacing any previous one.
    pub fn register<H: ToolHandler>(&mut self, handler: H) -> &mut Self {
        let name = handler.declaration().name;
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            warn!(tool = %name, "tool handler replaced");
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Declarations sorted by name so the session-open message is stable.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        let mut out: Vec<_> = self.handlers.values().map(|h| h.declaration()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

/// Bridges inbound tool calls to local handlers and answers each one.
#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    ledger: Arc<Mutex<HashMap<String, InvocationState>>>,
    diagnostics: Arc<SessionDiagnostics>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, diagnostics: Arc<SessionDiagnostics>) -> Self {
        Self {
            registry,
            ledger: Arc::new(Mutex::new(HashMap::new())),
            diagnostics,
        }
    }

    /// Run the invocation on its own task and send the response through `link`.
    ///
    /// Returns immediately so the session event loop is never held up by a
    /// slow handler.
    pub fn dispatch(&self, invocation: ToolInvocation, link: TransportLink) -> JoinHandle<()> {
        self.set_state(&invocation.id, InvocationState::Pending);
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.set_state(&invocation.id, InvocationState::Dispatched);
            let response = dispatcher.resolve(&invocation).await;
            if let Err(e) = link.send_tool_response(response) {
                warn!(tool = %invocation.name, id = %invocation.id, "tool response not sent: {e}");
            }
            dispatcher.set_state(&invocation.id, InvocationState::Answered);
        })
    }

    /// Produce the response for one invocation. Never fails.
    pub async fn resolve(&self, invocation: &ToolInvocation) -> ToolResponse {
        self.diagnostics
            .tool_calls_dispatched
            .fetch_add(1, Ordering::Relaxed);

        let Some(handler) = self.registry.get(&invocation.name) else {
            warn!(tool = %invocation.name, id = %invocation.id, "unknown tool requested");
            self.diagnostics
                .tool_calls_failed
                .fetch_add(1, Ordering::Relaxed);
            return ToolResponse::from_error(
                invocation,
                &ToolDispatchError::UnknownTool(invocation.name.clone()),
            );
        };

        debug!(tool = %invocation.name, id = %invocation.id, "invoking tool");
        match handler.call(invocation.arguments.clone()).await {
            Ok(result) => {
                info!(tool = %invocation.name, id = %invocation.id, "tool answered");
                ToolResponse {
                    id: invocation.id.clone(),
                    name: invocation.name.clone(),
                    result,
                }
            }
            Err(e) => {
                warn!(tool = %invocation.name, id = %invocation.id, "tool failed: {e}");
                self.diagnostics
                    .tool_calls_failed
                    .fetch_add(1, Ordering::Relaxed);
                ToolResponse::from_error(invocation, &e)
            }
        }
    }

    pub fn state_of(&self, id: &str) -> Option<InvocationState> {
        self.ledger.lock().get(id).copied()
    }

    /// Invocations seen but not yet answered.
    pub fn outstanding(&self) -> usize {
        self.ledger
            .lock()
            .values()
            .filter(|s| **s != InvocationState::Answered)
            .count()
    }

    /// Forget everything (new session).
    pub fn reset(&self) {
        self.ledger.lock().clear();
    }

    fn set_state(&self, id: &str, state: InvocationState) {
        self.ledger.lock().insert(id.to_string(), state);
    }
}
