//! Best-effort persistence of backend errors for later diagnosis.
//!
//! Reporters never fail: problems writing a report are logged and
//! swallowed so that reporting cannot turn a recoverable turn error into a
//! fatal one.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::json;

use crate::error::{AgentError, StructuredError};
use crate::llm::types::Content;

/// Sink for backend errors together with the request that caused them.
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    /// Record `error`.  `message` describes what was being attempted,
    /// `context` is the conversation sent with the failing request and
    /// `operation` a short tag such as `turn`.
    async fn report(&self, error: &AgentError, message: &str, context: &[Content], operation: &str);
}

/// Discards every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

#[async_trait]
impl ErrorReporter for NoopReporter {
    async fn report(&self, _: &AgentError, _: &str, _: &[Content], _: &str) {}
}

/// Writes each report as a JSON file in a directory.
#[derive(Debug, Clone)]
pub struct FileErrorReporter {
    dir: PathBuf,
}

impl FileErrorReporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn report_path(&self, operation: &str) -> PathBuf {
        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        self.dir
            .join(format!("grokline-client-error-{operation}-{timestamp}.json"))
    }
}

#[async_trait]
impl ErrorReporter for FileErrorReporter {
    async fn report(&self, error: &AgentError, message: &str, context: &[Content], operation: &str) {
        let report = json!({
            "error": StructuredError::from(error),
            "message": message,
            "context": context,
        });
        let body = match serde_json::to_string_pretty(&report) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize error report");
                return;
            }
        };

        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            tracing::warn!(dir = %self.dir.display(), error = %e, "failed to create error report directory");
            return;
        }

        let path = self.report_path(operation);
        match tokio::fs::write(&path, body).await {
            Ok(()) => tracing::info!(path = %path.display(), "error report written"),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to write error report")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::Part;

    #[tokio::test]
    async fn file_reporter_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = FileErrorReporter::new(dir.path().join("reports"));
        let err = AgentError::Api {
            status: 500,
            message: "server exploded".into(),
        };
        let history = vec![Content::user(vec![Part::text("hello")])];

        reporter
            .report(&err, "Error when talking to the model", &history, "turn")
            .await;

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("reports"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("grokline-client-error-turn-"));
        assert!(name.ends_with(".json"));

        let v: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&entries[0]).unwrap()).unwrap();
        assert_eq!(v["error"]["status"], 500);
        assert_eq!(v["error"]["message"], "server exploded");
        assert_eq!(v["context"][0]["parts"][0]["text"], "hello");
    }

    #[tokio::test]
    async fn unwritable_directory_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "not a directory").unwrap();
        let reporter = FileErrorReporter::new(blocker.join("reports"));
        reporter
            .report(&AgentError::Cancelled, "msg", &[], "turn")
            .await;
    }
}
