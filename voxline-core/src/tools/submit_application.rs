//! `submit_application`: records the assistant's screening verdict.
//!
//! The only place the voice engine touches application state. Both side
//! effects go through injected seams so the handler can be driven without a
//! database or a UI:
//!
//! - [`ApplicationSink`] persists the record,
//! - [`Notifier`] raises the user-facing notice.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::info;

use crate::error::ToolDispatchError;
use crate::ipc::events::{NoticeLevel, NotificationEvent};
use crate::tools::{ToolDeclaration, ToolHandler};

pub const TOOL_NAME: &str = "submit_application";

/// Screening outcome chosen by the assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualificationStatus {
    QualifiedFunding,
    QualifiedReferral,
    NotQualified,
    NeedsReview,
}

impl QualificationStatus {
    pub const ALL: [Self; 4] = [
        Self::QualifiedFunding,
        Self::QualifiedReferral,
        Self::NotQualified,
        Self::NeedsReview,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::QualifiedFunding => "QUALIFIED_FUNDING",
            Self::QualifiedReferral => "QUALIFIED_REFERRAL",
            Self::NotQualified => "NOT_QUALIFIED",
            Self::NeedsReview => "NEEDS_REVIEW",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == raw.trim())
    }
}

impl fmt::Display for QualificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated arguments of one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationDraft {
    pub qualification_status: QualificationStatus,
    pub reasoning: String,
}

/// Persists application records.
pub trait ApplicationSink: Send + Sync + 'static {
    /// Store one record; returns its id.
    fn record(&self, draft: &ApplicationDraft) -> anyhow::Result<String>;
}

/// Raises user-facing notices.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, event: NotificationEvent);
}

impl Notifier for broadcast::Sender<NotificationEvent> {
    fn notify(&self, event: NotificationEvent) {
        // No subscribers is fine.
        let _ = self.send(event);
    }
}

pub struct SubmitApplicationTool {
    sink: Arc<dyn ApplicationSink>,
    notifier: Arc<dyn Notifier>,
}

impl SubmitApplicationTool {
    pub fn new(sink: Arc<dyn ApplicationSink>, notifier: Arc<dyn Notifier>) -> Self {
        Self { sink, notifier }
    }

    fn parse_arguments(arguments: &Value) -> Result<ApplicationDraft, ToolDispatchError> {
        let invalid = |reason: String| ToolDispatchError::InvalidArguments {
            tool: TOOL_NAME.into(),
            reason,
        };

        let raw_status = arguments
            .get("qualification_status")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing qualification_status".into()))?;
        let qualification_status = QualificationStatus::parse(raw_status)
            .ok_or_else(|| invalid(format!("unsupported qualification_status: {raw_status}")))?;

        let reasoning = arguments
            .get("reasoning")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if reasoning.is_empty() {
            return Err(invalid("missing reasoning".into()));
        }

        Ok(ApplicationDraft {
            qualification_status,
            reasoning: reasoning.to_string(),
        })
    }
}

#[async_trait]
impl ToolHandler for SubmitApplicationTool {
    fn declaration(&self) -> ToolDeclaration {
        let statuses: Vec<&str> = QualificationStatus::ALL.iter().map(|s| s.as_str()).collect();
        ToolDeclaration {
            name: TOOL_NAME.into(),
            description: "Submit the applicant's screening result once the interview is complete."
                .into(),
            parameter_schema: json!({
                "type": "object",
                "properties": {
                    "qualification_status": {
                        "type": "string",
                        "enum": statuses,
                        "description": "Outcome of the screening."
                    },
                    "reasoning": {
                        "type": "string",
                        "description": "Short justification for the outcome."
                    }
                },
                "required": ["qualification_status", "reasoning"]
            }),
        }
    }

    async fn call(&self, arguments: Value) -> Result<Value, ToolDispatchError> {
        let draft = Self::parse_arguments(&arguments)?;

        let id = self
            .sink
            .record(&draft)
            .map_err(|e| ToolDispatchError::Handler {
                tool: TOOL_NAME.into(),
                reason: e.to_string(),
            })?;
        info!(
            application_id = %id,
            status = %draft.qualification_status,
            "application recorded"
        );

        self.notifier.notify(NotificationEvent {
            level: NoticeLevel::Success,
            title: "Application submitted".into(),
            message: format!("Status: {}", draft.qualification_status),
        });

        Ok(json!({
            "result": "success",
            "applicationId": id,
            "qualificationStatus": draft.qualification_status,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MemorySink {
        records: Mutex<Vec<ApplicationDraft>>,
        fail: bool,
    }

    impl ApplicationSink for MemorySink {
        fn record(&self, draft: &ApplicationDraft) -> anyhow::Result<String> {
            if self.fail {
                anyhow::bail!("database locked");
            }
            let mut records = self.records.lock();
            records.push(draft.clone());
            Ok(format!("app-{}", records.len()))
        }
    }

    #[derive(Default)]
    struct MemoryNotifier(Mutex<Vec<NotificationEvent>>);

    impl Notifier for MemoryNotifier {
        fn notify(&self, event: NotificationEvent) {
            self.0.lock().push(event);
        }
    }

    fn tool(sink: Arc<MemorySink>, notifier: Arc<MemoryNotifier>) -> SubmitApplicationTool {
        SubmitApplicationTool::new(sink, notifier)
    }

    #[tokio::test]
    async fn valid_call_records_once_and_notifies_once() {
        let sink = Arc::new(MemorySink::default());
        let notifier = Arc::new(MemoryNotifier::default());
        let t = tool(Arc::clone(&sink), Arc::clone(&notifier));

        let result = t
            .call(json!({
                "qualification_status": "QUALIFIED_FUNDING",
                "reasoning": "stable housing plan"
            }))
            .await
            .unwrap();

        assert_eq!(result["result"], "success");
        assert_eq!(result["applicationId"], "app-1");
        assert_eq!(result["qualificationStatus"], "QUALIFIED_FUNDING");
        let records = sink.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reasoning, "stable housing plan");
        assert_eq!(notifier.0.lock().len(), 1);
        assert_eq!(notifier.0.lock()[0].level, NoticeLevel::Success);
    }

    #[tokio::test]
    async fn unsupported_status_is_rejected_without_side_effects() {
        let sink = Arc::new(MemorySink::default());
        let notifier = Arc::new(MemoryNotifier::default());
        let t = tool(Arc::clone(&sink), Arc::clone(&notifier));

        let err = t
            .call(json!({ "qualification_status": "MAYBE", "reasoning": "x" }))
            .await
            .unwrap_err();

        assert!(matches!(err, ToolDispatchError::InvalidArguments { .. }));
        assert!(sink.records.lock().is_empty());
        assert!(notifier.0.lock().is_empty());
    }

    #[tokio::test]
    async fn blank_reasoning_is_rejected() {
        let t = tool(
            Arc::new(MemorySink::default()),
            Arc::new(MemoryNotifier::default()),
        );
        let err = t
            .call(json!({ "qualification_status": "NEEDS_REVIEW", "reasoning": "  " }))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid arguments for submit_application: missing reasoning"
        );
    }

    #[tokio::test]
    async fn sink_failure_becomes_handler_error() {
        let sink = Arc::new(MemorySink {
            fail: true,
            ..MemorySink::default()
        });
        let notifier = Arc::new(MemoryNotifier::default());
        let t = tool(sink, Arc::clone(&notifier));

        let err = t
            .call(json!({ "qualification_status": "NOT_QUALIFIED", "reasoning": "income" }))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "tool submit_application failed: database locked");
        assert!(notifier.0.lock().is_empty());
    }

    #[test]
    fn declaration_lists_every_status() {
        let t = tool(
            Arc::new(MemorySink::default()),
            Arc::new(MemoryNotifier::default()),
        );
        let decl = t.declaration();
        assert_eq!(decl.name, TOOL_NAME);
        let statuses = decl.parameter_schema["properties"]["qualification_status"]["enum"]
            .as_array()
            .unwrap()
            .len();
        assert_eq!(statuses, 4);
    }

    #[test]
    fn status_parsing_round_trips_names() {
        for status in QualificationStatus::ALL {
            assert_eq!(QualificationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(QualificationStatus::parse("qualified_funding"), None);
    }
}
