mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{wait_for, CallLog, FakeHost, FakeTransport, Handshake};
use parking_lot::Mutex;
use serde_json::json;
use voxline_core::tools::{ToolInvocation, ToolResponse};
use voxline_core::transport::Control;
use voxline_core::{
    ApplicationDraft, ApplicationSink, ConnectionEvent, EngineConfig, NoticeLevel,
    QualificationStatus, SessionManager, SubmitApplicationTool, ToolRegistry,
};

#[derive(Default)]
struct RecordingSink(Mutex<Vec<ApplicationDraft>>);

impl ApplicationSink for RecordingSink {
    fn record(&self, draft: &ApplicationDraft) -> anyhow::Result<String> {
        let mut records = self.0.lock();
        records.push(draft.clone());
        Ok(format!("rec-{}", records.len()))
    }
}

struct Harness {
    manager: SessionManager,
    transport: Arc<FakeTransport>,
    sink: Arc<RecordingSink>,
}

async fn open_with_tools() -> Harness {
    open_with_handshake(Handshake::Ack).await
}

async fn open_with_handshake(handshake: Handshake) -> Harness {
    let log = CallLog::default();
    let host = Arc::new(FakeHost::new(log.clone()));
    let transport = Arc::new(FakeTransport::new(log, handshake));
    let sink = Arc::new(RecordingSink::default());

    let manager = SessionManager::new(
        EngineConfig {
            poll_interval: Duration::from_millis(10),
            ..EngineConfig::default()
        },
        host,
        transport.clone(),
    );
    let mut tools = ToolRegistry::new();
    tools.register(SubmitApplicationTool::new(sink.clone(), manager.notifier()));
    let manager = manager.with_tools(tools);

    manager.connect().await.unwrap();
    Harness {
        manager,
        transport,
        sink,
    }
}

fn responses(controls: Vec<Control>) -> Vec<ToolResponse> {
    controls
        .into_iter()
        .filter_map(|c| match c {
            Control::ToolResponse(r) => Some(r),
            Control::Close => None,
        })
        .collect()
}

#[tokio::test]
async fn tools_are_declared_when_the_session_opens() {
    let h = open_with_tools().await;
    let config = h.transport.last_config.lock().clone().unwrap();
    let names: Vec<_> = config.tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["submit_application"]);
}

#[tokio::test]
async fn submit_application_round_trip() {
    let h = open_with_tools().await;
    let mut notices = h.manager.subscribe_notifications();

    h.transport.emit(ConnectionEvent::ToolCall(vec![ToolInvocation {
        id: "abc".into(),
        name: "submit_application".into(),
        arguments: json!({
            "qualification_status": "QUALIFIED_FUNDING",
            "reasoning": "stable housing plan"
        }),
    }]));

    let manager = &h.manager;
    wait_for("tool answered", || {
        manager.diagnostics_snapshot().tool_calls_dispatched == 1
            && manager.outstanding_tool_calls() == 0
    })
    .await;

    let sent = responses(h.transport.sent_controls());
    assert_eq!(sent.len(), 1, "exactly one response");
    assert_eq!(sent[0].id, "abc");
    assert_eq!(sent[0].name, "submit_application");
    assert!(!sent[0].is_error());

    let records = h.sink.0.lock();
    assert_eq!(records.len(), 1, "exactly one record");
    assert_eq!(
        records[0].qualification_status,
        QualificationStatus::QualifiedFunding
    );
    assert_eq!(records[0].reasoning, "stable housing plan");
    drop(records);

    let notice = notices.recv().await.unwrap();
    assert_eq!(notice.level, NoticeLevel::Success);
}

#[tokio::test]
async fn unknown_tool_still_gets_an_answer() {
    let h = open_with_tools().await;

    h.transport.emit(ConnectionEvent::ToolCall(vec![ToolInvocation {
        id: "zz".into(),
        name: "open_pod_bay_doors".into(),
        arguments: json!({}),
    }]));

    let manager = &h.manager;
    wait_for("tool answered", || {
        manager.diagnostics_snapshot().tool_calls_failed == 1
            && manager.outstanding_tool_calls() == 0
    })
    .await;

    let sent = responses(h.transport.sent_controls());
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].id, "zz");
    assert_eq!(sent[0].result["error"], "unknown tool: open_pod_bay_doors");
    assert!(h.sink.0.lock().is_empty());
}

#[tokio::test]
async fn every_invocation_in_a_batch_is_answered() {
    let h = open_with_tools().await;

    h.transport.emit(ConnectionEvent::ToolCall(vec![
        ToolInvocation {
            id: "1".into(),
            name: "submit_application".into(),
            arguments: json!({ "qualification_status": "NEEDS_REVIEW", "reasoning": "unclear income" }),
        },
        ToolInvocation {
            id: "2".into(),
            name: "submit_application".into(),
            arguments: json!({ "qualification_status": "PROBABLY", "reasoning": "?" }),
        },
    ]));

    let manager = &h.manager;
    wait_for("both answered", || {
        manager.diagnostics_snapshot().tool_calls_dispatched == 2
            && manager.outstanding_tool_calls() == 0
    })
    .await;

    let mut sent = responses(h.transport.sent_controls());
    sent.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(sent.len(), 2);
    assert!(!sent[0].is_error());
    assert!(sent[1].is_error());
    assert_eq!(h.sink.0.lock().len(), 1);
}

#[tokio::test]
async fn tool_call_during_handshake_is_still_answered() {
    let h = open_with_handshake(Handshake::ToolCallFirst(ToolInvocation {
        id: "early".into(),
        name: "submit_application".into(),
        arguments: json!({ "qualification_status": "NOT_QUALIFIED", "reasoning": "over income limit" }),
    }))
    .await;

    let manager = &h.manager;
    wait_for("early call answered", || {
        manager.diagnostics_snapshot().tool_calls_dispatched == 1
            && manager.outstanding_tool_calls() == 0
    })
    .await;

    let sent = responses(h.transport.sent_controls());
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].id, "early");
    assert!(!sent[0].is_error());
    assert_eq!(h.sink.0.lock().len(), 1);
}
