//! CLI entry point for GrokLine.
//!
//! Loads `.env`, validates authentication, assembles an [`AgentSession`]
//! over the built-in tools and hands it to the REPL.

mod cli;
mod git;
mod helpers;
mod host;
mod repl;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use grokline_agent::config::validate_auth_method;
use grokline_agent::{
    AgentSession, AuthType, FileErrorReporter, GeneratorConfig, GrokContentGenerator,
    SnapshotService,
};
use grokline_tools::{builtin_registry, default_memory_path};
use tracing::{debug, info, warn};

use crate::cli::Cli;
use crate::git::GitSnapshotService;
use crate::helpers::{env_non_empty, init_tracing, resolve_session_config};
use crate::host::{PromptSource, TerminalHost, stdin_lines};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Environment and logging.
    let dotenv = dotenvy::dotenv();
    init_tracing(cli.verbose);
    match dotenv {
        Ok(path) => debug!(path = %path.display(), "loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => warn!(error = %e, "failed to load .env"),
    }

    // 2. Authentication.
    if let Some(message) = validate_auth_method(&cli.auth, |name| std::env::var(name).ok()) {
        bail!(message);
    }
    let auth_type: AuthType = cli.auth.parse()?;

    // 3. Configuration.
    let mut config = resolve_session_config(&cli)?;
    let mut generator_config = GeneratorConfig::from_env(Some(config.effective_model()), auth_type)?;
    if let Some(base_url) = env_non_empty("GROK_BASE_URL") {
        generator_config = generator_config.with_base_url(base_url);
    }
    let generator = Arc::new(
        GrokContentGenerator::new(generator_config).context("failed to create the Grok client")?,
    );

    // 4. Tools.
    let workspace_root = std::env::current_dir().context("failed to get current directory")?;
    let memory_path = default_memory_path().context("could not determine the home directory")?;
    let (registry, shell) = builtin_registry(&workspace_root, &memory_path);
    for command in &cli.allowed_commands {
        shell.allow_root_command(command.clone());
    }

    // 5. System prompt, including saved memories.
    let prompt = PromptSource {
        base: config.system_instruction.take(),
        workspace_root: workspace_root.clone(),
        memory_path,
    };
    config.system_instruction = Some(prompt.build().await);

    // 6. Snapshots for checkpoints.
    let snapshots: Option<Arc<dyn SnapshotService>> =
        if config.checkpointing && GitSnapshotService::is_repository(&workspace_root).await {
            Some(Arc::new(GitSnapshotService::new(&workspace_root)))
        } else {
            if config.checkpointing {
                eprintln!("  Warning: checkpointing needs a git repository; continuing without it.");
            }
            None
        };

    // 7. Session.
    let host = Arc::new(TerminalHost::new(stdin_lines(), prompt));
    let reporter = Arc::new(FileErrorReporter::new(config.project_temp_dir.clone()));
    let session = Arc::new(AgentSession::from_config(
        &config,
        generator,
        Arc::new(registry),
        host.clone(),
        reporter,
        snapshots,
        cli.yolo,
    ));
    host.attach_chat(session.client().chat().clone());
    info!(session_id = %session.id(), model = %config.effective_model(), "session ready");

    match cli.prompt {
        Some(ref prompt) => repl::run_once(session, host, prompt).await,
        None => repl::run(session, host).await,
    }
}
