//! The tool seam: what the scheduler needs to know about a local capability.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::llm::types::FunctionDeclaration;

/// Output of a tool execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    /// What the model sees.
    pub llm_content: String,
    /// What the user sees.
    pub return_display: String,
}

impl ToolResult {
    /// A result shown identically to the model and the user.
    pub fn text(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            llm_content: content.clone(),
            return_display: content,
        }
    }
}

/// What the user is asked to approve before a tool runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConfirmationDetails {
    /// A file modification, shown as a diff.
    Edit {
        title: String,
        file_path: String,
        diff: String,
    },
    /// A shell command.
    Exec { title: String, command: String },
    /// Anything else.
    Info { title: String, prompt: String },
}

impl ConfirmationDetails {
    pub fn title(&self) -> &str {
        match self {
            Self::Edit { title, .. } | Self::Exec { title, .. } | Self::Info { title, .. } => title,
        }
    }
}

/// A local capability the model can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the model calls the tool by.
    fn name(&self) -> &str;

    /// Description shown to the model.
    fn description(&self) -> &str;

    /// JSON schema of the arguments.
    fn parameters(&self) -> Value;

    /// Whether the tool writes to the filesystem.  Such tools get a recovery
    /// checkpoint before they run when checkpointing is enabled.
    fn modifies_files(&self) -> bool {
        false
    }

    /// Decide whether the call needs explicit user approval.  `None` means
    /// it may run straight away.
    async fn should_confirm_execute(
        &self,
        _args: &Map<String, Value>,
        _cancel: &CancellationToken,
    ) -> Result<Option<ConfirmationDetails>> {
        Ok(None)
    }

    /// Run the tool.  Implementations should return promptly once `cancel`
    /// fires.
    async fn execute(&self, args: &Map<String, Value>, cancel: &CancellationToken) -> Result<ToolResult>;

    /// The declaration sent to the model.
    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: self.name().to_owned(),
            description: self.description().to_owned(),
            parameters: Some(self.parameters()),
        }
    }
}

/// Tools available to a session, keyed by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool of the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_owned();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool registered twice, keeping the latest");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Declarations of every registered tool, sorted by name.
    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.tools.values().map(|t| t.declaration()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(&self, args: &Map<String, Value>, _: &CancellationToken) -> Result<ToolResult> {
            Ok(ToolResult::text(args["text"].as_str().unwrap_or_default()))
        }
    }

    #[test]
    fn registry_lookup_and_declarations() {
        let mut registry = ToolRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(Echo));

        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["echo"]);

        let decls = registry.declarations();
        assert_eq!(decls[0].name, "echo");
        assert_eq!(decls[0].parameters.as_ref().unwrap()["type"], "object");
    }

    #[tokio::test]
    async fn default_confirmation_is_none() {
        let args = json!({"text": "hi"}).as_object().cloned().unwrap();
        let cancel = CancellationToken::new();
        assert!(Echo.should_confirm_execute(&args, &cancel).await.unwrap().is_none());
        assert_eq!(Echo.execute(&args, &cancel).await.unwrap().llm_content, "hi");
        assert!(!Echo.modifies_files());
    }

    #[test]
    fn confirmation_details_title() {
        let details = ConfirmationDetails::Exec {
            title: "Confirm Shell Command".into(),
            command: "ls".into(),
        };
        assert_eq!(details.title(), "Confirm Shell Command");
    }
}
