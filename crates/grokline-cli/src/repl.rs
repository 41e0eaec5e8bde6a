//! Interactive REPL and one-shot prompts.
//!
//! Ctrl-C cancels the active turn and its tool calls; at the idle prompt it
//! exits.  Lines starting with `!` run a shell command directly, without
//! sending the result to the model.

use std::io::{self, Write as _};
use std::sync::Arc;

use anyhow::Result;
use grokline_agent::{AgentError, AgentSession, Query, config::models::describe_model};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::host::TerminalHost;

/// What a line typed at the prompt asks for.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Empty,
    Quit,
    Compress,
    Shell(&'a str),
    Prompt(&'a str),
}

fn classify(line: &str) -> Input<'_> {
    let trimmed = line.trim();
    match trimmed {
        "" => Input::Empty,
        "quit" | "exit" | "/quit" | "/exit" => Input::Quit,
        "/compress" => Input::Compress,
        _ => match trimmed.strip_prefix('!') {
            Some(command) if !command.trim().is_empty() => Input::Shell(command.trim()),
            Some(_) => Input::Empty,
            None => Input::Prompt(trimmed),
        },
    }
}

/// Cancel the active turn on Ctrl-C, or exit when idle.
fn spawn_interrupt_handler(session: Arc<AgentSession>) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if session.is_responding() {
                session.cancel();
            } else {
                eprintln!("\n  Interrupted. Goodbye!");
                std::process::exit(0);
            }
        }
    });
}

async fn submit(session: &AgentSession, host: &TerminalHost, text: &str) -> Result<()> {
    let result = session.submit_query(Query::text(text)).await;
    host.end_line();
    match result {
        Ok(()) => Ok(()),
        Err(AgentError::Busy) => {
            eprintln!("  A request is already running.");
            Ok(())
        }
        Err(e) if e.is_unauthorized() => Err(e.into()),
        Err(e) => {
            eprintln!("  Error: {e}");
            Ok(())
        }
    }
}

async fn run_shell(session: &AgentSession, command: &str) {
    let mut args = Map::new();
    args.insert("command".into(), Value::String(command.to_owned()));
    if let Err(e) = session.schedule_client_tool("run_shell_command", args).await {
        eprintln!("  Error: {e}");
    }
}

/// Run a single prompt and return.
pub async fn run_once(session: Arc<AgentSession>, host: Arc<TerminalHost>, prompt: &str) -> Result<()> {
    spawn_interrupt_handler(session.clone());
    submit(&session, &host, prompt).await?;
    println!();
    Ok(())
}

/// Run the interactive loop until end of input or `quit`.
pub async fn run(session: Arc<AgentSession>, host: Arc<TerminalHost>) -> Result<()> {
    let model = session.client().chat().model();

    println!();
    println!("  GrokLine v{}", env!("CARGO_PKG_VERSION"));
    match describe_model(&model) {
        Some(description) => println!("  Model: {model} ({description})"),
        None => println!("  Model: {model}"),
    }
    println!("  Type your request, `!command` to run a shell command, or 'quit' to exit.");
    println!();

    spawn_interrupt_handler(session.clone());

    loop {
        print!("> ");
        io::stdout().flush().ok();

        let Some(line) = host.read_line().await else {
            println!();
            info!("EOF received, exiting");
            break;
        };

        match classify(&line) {
            Input::Empty => continue,
            Input::Quit => {
                info!("user requested exit");
                break;
            }
            Input::Compress => match session.client().compress_now().await {
                Ok(Some(info)) => println!(
                    "  Chat history compressed from {} to {} tokens.",
                    info.original_token_count, info.new_token_count
                ),
                Ok(None) => println!("  Nothing to compress."),
                Err(e) => {
                    warn!(error = %e, "manual compression failed");
                    eprintln!("  Compression failed: {e}");
                }
            },
            Input::Shell(command) => run_shell(&session, command).await,
            Input::Prompt(text) => {
                submit(&session, &host, text).await?;
                println!();
            }
        }
    }

    info!(turns = session.client().session_turns(), "shutting down");
    Ok(())
}
