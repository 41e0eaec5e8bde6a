//! Recovery checkpoints taken before file-mutating tools run.
//!
//! A checkpoint pairs a version-control snapshot of the working tree with
//! the conversation and the pending tool call, so an unwanted edit can be
//! rolled back together with the conversation that produced it.
//! Checkpointing never blocks a tool: every failure is logged and the call
//! proceeds without a record.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::llm::types::Content;
use crate::turn::ToolCallRequestInfo;

/// Working-tree snapshots, typically backed by git.
#[async_trait]
pub trait SnapshotService: Send + Sync {
    /// Take a snapshot labelled `label`.  `None` when no snapshot could be
    /// taken.
    async fn create_snapshot(&self, label: &str) -> Option<String>;

    /// Id of the current state, used when a fresh snapshot is unavailable.
    async fn current_snapshot_id(&self) -> Option<String>;
}

/// The tool call stored in a [`RecoveryRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedToolCall {
    pub name: String,
    pub args: Map<String, Value>,
}

/// Contents of one checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryRecord {
    pub history: Vec<Content>,
    pub tool_call: RecordedToolCall,
    pub commit_hash: String,
    pub file_path: String,
}

/// Writes recovery records under `<project temp dir>/checkpoints`.
#[derive(Clone)]
pub struct Checkpointer {
    dir: PathBuf,
    snapshots: Arc<dyn SnapshotService>,
}

impl std::fmt::Debug for Checkpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpointer").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl Checkpointer {
    pub fn new(project_temp_dir: &Path, snapshots: Arc<dyn SnapshotService>) -> Self {
        Self {
            dir: project_temp_dir.join("checkpoints"),
            snapshots,
        }
    }

    /// Directory checkpoint files are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record a checkpoint for `call`.  Returns the file written, if any.
    pub async fn checkpoint(&self, call: &ToolCallRequestInfo, history: &[Content]) -> Option<PathBuf> {
        let Some(file_path) = call.args.get("file_path").and_then(Value::as_str) else {
            tracing::debug!(call_id = %call.call_id, tool = %call.name, "no file_path argument, skipping checkpoint");
            return None;
        };

        let label = format!("Snapshot for {}", call.name);
        let commit_hash = match self.snapshots.create_snapshot(&label).await {
            Some(id) => id,
            None => match self.snapshots.current_snapshot_id().await {
                Some(id) => id,
                None => {
                    tracing::debug!(call_id = %call.call_id, "no snapshot available, skipping checkpoint");
                    return None;
                }
            },
        };

        let record = RecoveryRecord {
            history: history.to_vec(),
            tool_call: RecordedToolCall {
                name: call.name.clone(),
                args: call.args.clone(),
            },
            commit_hash,
            file_path: file_path.to_owned(),
        };

        let body = match serde_json::to_string_pretty(&record) {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(error = %e, "failed to serialize checkpoint");
                return None;
            }
        };

        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            tracing::debug!(dir = %self.dir.display(), error = %e, "failed to create checkpoint directory");
            return None;
        }

        let path = self.dir.join(checkpoint_file_name(file_path, &call.name));
        match tokio::fs::write(&path, body).await {
            Ok(()) => {
                tracing::info!(path = %path.display(), tool = %call.name, "checkpoint written");
                Some(path)
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "failed to write checkpoint");
                None
            }
        }
    }
}

fn checkpoint_file_name(file_path: &str, tool_name: &str) -> String {
    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S_%3f");
    let file_name = Path::new(file_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_owned());
    format!("{timestamp}-{file_name}-{tool_name}.json")
}
