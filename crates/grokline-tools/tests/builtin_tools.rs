//! Integration tests for the built-in tools.
//!
//! These drive the tools through the agent's [`ToolScheduler`], the way a
//! session runs them: approval, execution and the function responses the
//! model receives.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use grokline_agent::scheduler::SchedulerHost;
use grokline_agent::{
    ConfirmationDetails, ConfirmationOutcome, Part, SchedulerConfig, ToolCallRequestInfo,
    ToolCallStatus, ToolScheduler,
};
use grokline_tools::{builtin_registry, load_memories};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// Answers every approval with a fixed outcome and records the titles asked.
struct Approver {
    outcome: ConfirmationOutcome,
    asked: Mutex<Vec<String>>,
}

impl Approver {
    fn new(outcome: ConfirmationOutcome) -> Self {
        Self {
            outcome,
            asked: Mutex::new(Vec::new()),
        }
    }

    fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl SchedulerHost for Approver {
    async fn request_approval(
        &self,
        _call: &ToolCallRequestInfo,
        details: &ConfirmationDetails,
    ) -> ConfirmationOutcome {
        self.asked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(details.title().to_owned());
        self.outcome
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: std::path::PathBuf,
    memory: std::path::PathBuf,
    scheduler: ToolScheduler,
}

fn fixture(auto_approve: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap().join("project");
    std::fs::create_dir_all(&root).unwrap();
    let memory = dir.path().join("memory").join("GROKLINE.md");
    let (registry, _shell) = builtin_registry(&root, &memory);
    let scheduler = ToolScheduler::new(
        Arc::new(registry),
        SchedulerConfig {
            max_concurrency: 4,
            auto_approve,
        },
        Default::default(),
    );
    Fixture {
        _dir: dir,
        root,
        memory,
        scheduler,
    }
}

fn call(id: &str, name: &str, args: Value) -> ToolCallRequestInfo {
    ToolCallRequestInfo {
        call_id: id.into(),
        name: name.into(),
        args: args.as_object().cloned().unwrap(),
        is_client_initiated: false,
        prompt_id: "test########1".into(),
    }
}

fn response(part: &Part) -> &Value {
    match part {
        Part::FunctionResponse(r) => &r.response,
        other => panic!("expected a function response, got {other:?}"),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Registry
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn registry_declares_every_builtin_tool() {
    let fx = fixture(false);
    let names: Vec<String> = fx
        .scheduler
        .registry()
        .declarations()
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(
        names,
        [
            "list_directory",
            "read_file",
            "replace",
            "run_shell_command",
            "save_memory",
            "write_file"
        ]
    );
}

// ═══════════════════════════════════════════════════════════════════════
//  Filesystem
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn write_then_read_and_list() {
    let fx = fixture(false);
    let host = Approver::new(ConfirmationOutcome::ProceedOnce);
    let cancel = CancellationToken::new();

    let batch = fx
        .scheduler
        .schedule(
            vec![call("w1", "write_file", json!({"file_path": "src/main.rs", "content": "fn main() {}\n"}))],
            &[],
            &cancel,
            &host,
        )
        .await;
    assert_eq!(batch[0].status, ToolCallStatus::Success);
    assert_eq!(host.asked(), ["Confirm Write: src/main.rs"]);
    assert_eq!(
        std::fs::read_to_string(fx.root.join("src/main.rs")).unwrap(),
        "fn main() {}\n"
    );

    // Reads and listings need no approval and run in one batch.
    let batch = fx
        .scheduler
        .schedule(
            vec![
                call("r1", "read_file", json!({"absolute_path": "src/main.rs"})),
                call("l1", "list_directory", json!({})),
            ],
            &[],
            &cancel,
            &host,
        )
        .await;
    assert!(batch.iter().all(|c| c.status == ToolCallStatus::Success));
    assert_eq!(host.asked().len(), 1);
    assert_eq!(response(&batch[0].response_parts[0])["output"], "fn main() {}\n");
    assert_eq!(
        response(&batch[1].response_parts[0])["output"],
        "Directory listing for .:\n[DIR] src"
    );
}

#[tokio::test]
async fn rejected_edit_leaves_the_file_alone() {
    let fx = fixture(false);
    std::fs::write(fx.root.join("notes.txt"), "alpha\n").unwrap();
    let host = Approver::new(ConfirmationOutcome::Cancel);

    let batch = fx
        .scheduler
        .schedule(
            vec![call(
                "e1",
                "replace",
                json!({"file_path": "notes.txt", "old_string": "alpha", "new_string": "beta"}),
            )],
            &[],
            &CancellationToken::new(),
            &host,
        )
        .await;

    assert_eq!(batch[0].status, ToolCallStatus::Cancelled);
    assert_eq!(host.asked(), ["Confirm Edit: notes.txt"]);
    assert_eq!(
        response(&batch[0].response_parts[0])["error"],
        "[Operation Cancelled] Reason: User did not allow tool call"
    );
    assert_eq!(std::fs::read_to_string(fx.root.join("notes.txt")).unwrap(), "alpha\n");
}

#[tokio::test]
async fn path_outside_the_workspace_is_an_error() {
    let fx = fixture(true);
    let batch = fx
        .scheduler
        .schedule(
            vec![call("r1", "read_file", json!({"absolute_path": "../../etc/passwd"}))],
            &[],
            &CancellationToken::new(),
            &Approver::new(ConfirmationOutcome::ProceedOnce),
        )
        .await;

    assert_eq!(batch[0].status, ToolCallStatus::Error);
    assert!(batch[0].error.as_deref().unwrap().contains("outside the workspace"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Shell and memory
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn shell_runs_in_the_workspace_after_approval() {
    let fx = fixture(false);
    let host = Approver::new(ConfirmationOutcome::ProceedOnce);
    let batch = fx
        .scheduler
        .schedule(
            vec![call("s1", "run_shell_command", json!({"command": "pwd"}))],
            &[],
            &CancellationToken::new(),
            &host,
        )
        .await;

    assert_eq!(batch[0].status, ToolCallStatus::Success);
    assert_eq!(host.asked(), ["Confirm Shell Command"]);
    let output = response(&batch[0].response_parts[0])["output"].as_str().unwrap().to_owned();
    assert!(output.contains(&format!("Stdout: {}", fx.root.display())));
    assert!(output.ends_with("Exit Code: 0"));
}

#[tokio::test]
async fn save_memory_writes_the_memory_file() {
    let fx = fixture(false);
    let batch = fx
        .scheduler
        .schedule(
            vec![call("m1", "save_memory", json!({"fact": "prefers short answers"}))],
            &[],
            &CancellationToken::new(),
            &Approver::new(ConfirmationOutcome::Cancel),
        )
        .await;

    assert_eq!(batch[0].status, ToolCallStatus::Success);
    assert_eq!(load_memories(&fx.memory).await, ["prefers short answers"]);

    let plan = fx.scheduler.plan(&batch, false);
    assert!(plan.refresh_memory);
}
