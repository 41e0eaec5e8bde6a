//! Shared helpers for the CLI.
//!
//! Includes tracing initialization, config resolution and system prompt
//! assembly.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use grokline_agent::SessionConfig;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber.  Logs go to stderr so they never mix
/// with streamed model output.
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// `~/.grokline`, where config and memory live.
pub fn grokline_home() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".grokline"))
}

/// Load the session config and apply command-line overrides.
pub fn resolve_session_config(cli: &Cli) -> Result<SessionConfig> {
    let path = cli
        .config
        .clone()
        .or_else(|| grokline_home().map(|dir| dir.join("config.toml")));

    let mut config = match path {
        Some(ref path) => SessionConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => SessionConfig::default(),
    };
    apply_overrides(&mut config, cli);
    Ok(config)
}

fn apply_overrides(config: &mut SessionConfig, cli: &Cli) {
    if let Some(ref model) = cli.model {
        config.model = model.clone();
    }
    if let Some(turns) = cli.max_session_turns {
        config.max_session_turns = Some(turns);
    }
    if cli.checkpointing {
        config.checkpointing = true;
    }
}

/// Read a non-empty environment variable, returning `None` if unset or empty.
pub fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// System prompt
// ---------------------------------------------------------------------------

/// The system prompt used when the config does not provide one.
const DEFAULT_SYSTEM_PROMPT: &str = "You are GrokLine, an interactive command-line agent \
     specializing in software engineering tasks. Use your tools to inspect the project before \
     changing it, keep edits minimal and consistent with the surrounding code, and explain \
     shell commands that modify the system before running them. Be concise.";

/// Build the system instruction from the configured base prompt, the
/// working directory and saved memories.
pub fn compose_system_instruction(
    base: Option<&str>,
    workspace_root: &Path,
    memories: &[String],
) -> String {
    let mut prompt = String::with_capacity(2048);
    prompt.push_str(base.filter(|s| !s.trim().is_empty()).unwrap_or(DEFAULT_SYSTEM_PROMPT));

    prompt.push_str(&format!(
        "\n\n## Environment\n\nToday's date: {}\nWorking directory: {}\n",
        chrono::Local::now().format("%Y-%m-%d (%A)"),
        workspace_root.display()
    ));

    if !memories.is_empty() {
        prompt.push_str("\n## Memories\n\n");
        for fact in memories {
            prompt.push_str("- ");
            prompt.push_str(fact);
            prompt.push('\n');
        }
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from(["grokline", "-m", "grok-3-mini", "--checkpointing", "--max-session-turns", "5"]);
        let mut config = SessionConfig::default();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.model, "grok-3-mini");
        assert!(config.checkpointing);
        assert_eq!(config.turn_limit(), Some(5));
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let cli = Cli::parse_from(["grokline", "--config", path.to_str().unwrap()]);
        let config = resolve_session_config(&cli).unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn system_instruction_lists_memories() {
        let prompt = compose_system_instruction(
            None,
            Path::new("/work"),
            &["prefers tabs".to_owned(), "uses tokio".to_owned()],
        );
        assert!(prompt.starts_with("You are GrokLine"));
        assert!(prompt.contains("Working directory: /work"));
        assert!(prompt.ends_with("## Memories\n\n- prefers tabs\n- uses tokio\n"));
    }

    #[test]
    fn configured_prompt_replaces_default() {
        let prompt = compose_system_instruction(Some("Be terse."), Path::new("/w"), &[]);
        assert!(prompt.starts_with("Be terse."));
        assert!(!prompt.contains("## Memories"));
    }
}
