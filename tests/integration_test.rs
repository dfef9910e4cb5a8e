// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end scenarios driving the agent loop, the tool dependency
//! analyzer, and the file-edit transaction through their public APIs with
//! [`ScriptedMockProvider`] standing in for a live model.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use corvid_config::{AgentConfig, AgentMode, Config, ToolsConfig};
use corvid_core::{
    extract_critical_messages, select_split, Agent, AgentEvent, AgentRuntimeContext,
    EditResolution, CRITICAL_TOOLS,
};
use corvid_model::{Message, MessagePart, ScriptedMockProvider};
use corvid_tools::{
    events::ToolEvent, tool::ToolCall, EditFileTool, ReadFileTool, ToolRegistry, WriteTool,
};

fn agent_with(
    model: Arc<ScriptedMockProvider>,
    tools: ToolRegistry,
    tools_config: ToolsConfig,
) -> Agent {
    let mode_lock = Arc::new(Mutex::new(AgentMode::Agent));
    let (_tx, tool_event_rx) = mpsc::channel::<ToolEvent>(64);
    Agent::new(
        model,
        Arc::new(tools),
        Arc::new(AgentConfig::default()),
        Arc::new(tools_config),
        AgentRuntimeContext::new(),
        mode_lock,
        tool_event_rx,
        100_000,
    )
}

async fn run_to_completion(agent: &mut Agent, input: &str) -> Vec<AgentEvent> {
    let (tx, mut rx) = mpsc::channel(256);
    agent.submit(input, tx).await.unwrap();
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ── Scenario 1: single text reply, no tools ──────────────────────────────────

#[tokio::test]
async fn scenario_single_text_reply_no_tools() {
    let model = Arc::new(ScriptedMockProvider::always_text("Hi there"));
    let mut agent = agent_with(model, ToolRegistry::new(), ToolsConfig::default());

    let events = run_to_completion(&mut agent, "Say hi").await;

    let deltas: String = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::TextDelta(t) => Some(t.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, "Hi there");

    let complete = events.iter().any(|e| matches!(e, AgentEvent::TextComplete(t) if t == "Hi there"));
    assert!(complete, "expected TextComplete(\"Hi there\")");

    let last = agent.session().messages.last().unwrap();
    assert_eq!(last.as_text().as_deref(), Some("Hi there"));
}

// ── Scenario 2: read-then-answer with one tool call ──────────────────────────

#[tokio::test]
async fn scenario_read_then_answer_with_one_tool_call() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.txt");
    std::fs::write(&path, "X").unwrap();

    let args = json!({"path": path.to_str().unwrap()}).to_string();
    let model = Arc::new(ScriptedMockProvider::tool_then_text(
        "c1",
        "read_file",
        &args,
        "File says X",
    ));
    let mut tools = ToolRegistry::new();
    tools.register(ReadFileTool);
    let mut agent = agent_with(model, tools, ToolsConfig::default());

    let events = run_to_completion(&mut agent, "read the file").await;

    let finished = events.iter().find_map(|e| match e {
        AgentEvent::ToolCallFinished { call_id, tool_name, output, is_error } => {
            Some((call_id.clone(), tool_name.clone(), output.clone(), *is_error))
        }
        _ => None,
    });
    let (call_id, tool_name, output, is_error) = finished.expect("tool call must finish");
    assert_eq!(call_id, "c1");
    assert_eq!(tool_name, "read_file");
    assert!(!is_error);
    assert!(output.contains('X'));

    let complete = events
        .iter()
        .any(|e| matches!(e, AgentEvent::TextComplete(t) if t == "File says X"));
    assert!(complete);

    let tool_calls: Vec<&Message> = agent
        .session()
        .messages
        .iter()
        .filter(|m| !m.tool_calls().is_empty())
        .collect();
    assert_eq!(tool_calls.len(), 1, "exactly one assistant message carries the tool call");
}

// ── Scenario 3: parallel read + concurrent edits on different files ─────────

#[tokio::test]
async fn scenario_parallel_read_and_concurrent_edits_on_different_files() {
    let mut tools = ToolRegistry::new();
    tools.register(ReadFileTool);
    tools.register(EditFileTool);

    let read_a = ToolCall {
        id: "1".into(),
        name: "read_file".into(),
        args: json!({"path": "/ws/a"}),
    };
    let edit_a = ToolCall {
        id: "2".into(),
        name: "edit_file".into(),
        args: json!({"path": "/ws/a", "edits": [{"old": "x", "new": "y"}]}),
    };
    let edit_b = ToolCall {
        id: "3".into(),
        name: "edit_file".into(),
        args: json!({"path": "/ws/b", "edits": [{"old": "x", "new": "y"}]}),
    };
    let calls = vec![read_a, edit_a, edit_b];

    let plan = corvid_core::plan(&calls, &tools);

    let ids = |phase: &[ToolCall]| -> Vec<&str> { phase.iter().map(|c| c.id.as_str()).collect() };

    assert_eq!(plan.call_count(), 3);
    assert_eq!(plan.phases.len(), 2);
    assert_eq!(ids(&plan.phases[0]), vec!["1"]);
    assert_eq!(ids(&plan.phases[1]), vec!["2", "3"]);
}

// ── Scenario 4: smart-match edit with a corrected old-string ─────────────────

#[tokio::test]
async fn scenario_smart_match_edit_with_corrected_old_string() {
    use corvid_tools::tool::Tool;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("code.rs");
    std::fs::write(&path, "  return 42;\n").unwrap();

    let call = ToolCall {
        id: "e1".into(),
        name: "edit_file".into(),
        args: json!({
            "path": path.to_str().unwrap(),
            "edits": [{"old": "return 42;", "new": "return 43;"}]
        }),
    };
    let output = EditFileTool.execute(&call).await;

    assert!(!output.is_error, "{}", output.content);
    assert!(output.content.contains("fuzzy"), "smart match should be reported: {}", output.content);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "  return 43;\n");
}

// ── Scenario 5: review reject with feedback ──────────────────────────────────

#[tokio::test]
async fn scenario_review_reject_with_feedback() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    std::fs::write(&path, "original").unwrap();

    let args = json!({"path": path.to_str().unwrap(), "content": "updated"}).to_string();
    let model = Arc::new(ScriptedMockProvider::tool_then_text("c1", "write", &args, "done"));
    let mut tools = ToolRegistry::new();
    tools.register(WriteTool);
    let mut agent = agent_with(model, tools, ToolsConfig::default());

    let pending = agent.pending_edits().clone();
    let (tx, mut rx) = mpsc::channel(256);
    let handle = tokio::spawn(async move {
        agent.submit("update the file", tx).await.unwrap();
        agent
    });

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while pending.pending_count().await == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("pending edit was never raised");

    assert!(pending.resolve("c1", EditResolution::Rejected { feedback: Some("wrong variable".into()) }).await);

    let _agent = handle.await.unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "original", "rejected edit must not touch disk");
    assert!(pending.change_log().await.is_empty(), "rejected edit leaves no change-log entry");

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let finished = events.iter().find_map(|e| match e {
        AgentEvent::ToolCallFinished { output, is_error, .. } => Some((output.clone(), *is_error)),
        _ => None,
    });
    let (output, is_error) = finished.expect("write tool call must finish");
    assert!(!is_error);
    assert_eq!(output, "Edit rejected. Feedback: wrong variable");
}

// ── Scenario 6: compaction preserves a critical tool-call/result pair ───────

#[test]
fn scenario_compaction_preserves_critical_tool_pair() {
    let critical_tool = CRITICAL_TOOLS[0];

    let history = vec![
        Message::user("turn 1"),
        Message::assistant("reply 1"),
        Message::user("turn 2"),
        Message::assistant("reply 2"),
        Message::user("turn 3"),
        Message::assistant_with_parts(vec![MessagePart::tool_call(
            "c1",
            critical_tool,
            json!({"todos": []}),
        )]),
        Message::tool_message(vec![MessagePart::tool_result(
            "c1",
            critical_tool,
            "ok",
        )]),
        Message::assistant("done"),
        Message::user("next"),
    ];
    assert_eq!(history.len(), 9, "9 non-system messages, as if 10 with a leading system message");

    let summarize_count = select_split(&history, 2);
    assert_eq!(summarize_count, 7, "naive split keeps only the trailing done/next pair");

    let to_compact = &history[..summarize_count];
    let recent = &history[summarize_count..];
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].as_text().as_deref(), Some("done"));
    assert_eq!(recent[1].as_text().as_deref(), Some("next"));
    assert!(
        !recent.iter().any(|m| !m.tool_calls().is_empty() || !m.tool_results().is_empty()),
        "naively preserved tail carries no tool parts — the critical pair would be lost without extraction"
    );

    let critical = extract_critical_messages(to_compact);
    assert_eq!(critical.len(), 2, "call and result for the critical tool are both recovered");
    assert_eq!(critical[0].tool_calls().len(), 1);
    assert_eq!(critical[0].tool_calls()[0].call_id(), Some("c1"));
    assert_eq!(critical[1].tool_results().len(), 1);
    assert_eq!(critical[1].tool_results()[0].call_id(), Some("c1"));
}

// ── Ambient config / policy sanity ───────────────────────────────────────────

#[test]
fn config_defaults_are_valid() {
    let cfg = Config::default();
    assert!(cfg.agent.max_tool_rounds > 0);
    assert!(cfg.agent.compaction_threshold > 0.0);
}

#[test]
fn tool_policy_auto_approve_and_deny() {
    use corvid_tools::{policy::ApprovalPolicy, policy::ToolPolicy};

    let cfg = ToolsConfig::default();
    let policy = ToolPolicy::from_config(&cfg);
    assert_eq!(policy.decide("cat /etc/hosts"), ApprovalPolicy::Auto);
    assert_eq!(policy.decide("ls /tmp"), ApprovalPolicy::Auto);

    let deny_cfg = ToolsConfig { deny_patterns: vec!["rm -rf /*".into()], ..ToolsConfig::default() };
    let deny_policy = ToolPolicy::from_config(&deny_cfg);
    assert_eq!(deny_policy.decide("rm -rf /*"), ApprovalPolicy::Deny);
}

#[tokio::test]
async fn shell_tool_executes_echo() {
    use corvid_tools::tool::Tool;
    use corvid_tools::ShellTool;

    let tool = ShellTool::default();
    let call = ToolCall {
        id: "1".into(),
        name: "shell".into(),
        args: json!({ "shell_command": "echo hello_world", "workdir": ".", "timeout_secs": 5 }),
    };
    let output = tool.execute(&call).await;
    assert!(!output.is_error, "{}", output.content);
    assert!(output.content.contains("hello_world"));
}
