//! CLI argument definitions for GrokLine.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! wiring the session together.

use std::path::PathBuf;

use clap::Parser;

/// GrokLine -- a terminal coding agent backed by xAI's Grok models.
#[derive(Debug, Parser)]
#[command(
    name = "grokline",
    version,
    about = "GrokLine -- a terminal coding agent for Grok",
    long_about = "An interactive agent that reads, edits and runs code in the current \
                  directory. File changes and shell commands ask for approval first."
)]
pub struct Cli {
    /// Model id, overriding the config file.
    #[arg(long, short)]
    pub model: Option<String>,

    /// Session config file (TOML).  Defaults to `~/.grokline/config.toml`.
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Record a recovery checkpoint before every approved file change.
    #[arg(long)]
    pub checkpointing: bool,

    /// Stop after this many turns; negative means unlimited.
    #[arg(long, allow_negative_numbers = true)]
    pub max_session_turns: Option<i64>,

    /// Approve every tool call without asking.
    #[arg(long)]
    pub yolo: bool,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, short)]
    pub verbose: bool,

    /// Run one prompt non-interactively and exit.
    #[arg(long, short)]
    pub prompt: Option<String>,

    /// Shell root commands that run without approval (repeatable).
    #[arg(long = "allow-command", value_name = "COMMAND")]
    pub allowed_commands: Vec<String>,

    /// Authentication method.
    #[arg(long, default_value = "grok-api-key")]
    pub auth: String,
}
