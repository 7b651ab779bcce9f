//! Terminal chat client for a remote agent.

mod render;

use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use agentchat_engine::prelude::*;
use agentchat_engine::vendors::data_stream::{DataStreamConfig, DataStreamTransport};
use agentchat_engine::{HistoryStore, init_observability};
use clap::Parser;
use tokio::io::AsyncBufReadExt as _;
use tokio::sync::mpsc;
use tracing::warn;

use crate::render::{TranscriptPrinter, format_stats};

#[derive(Debug, Parser)]
#[command(name = "agentchat", about = "Chat with a remote agent from the terminal")]
struct Args {
    /// Agent id to talk to.
    #[arg(long)]
    agent: String,
    /// Overrides AGENTCHAT_BASE_URL.
    #[arg(long)]
    base_url: Option<String>,
    /// History file (defaults to AGENTCHAT_HISTORY_PATH or the config dir).
    #[arg(long, conflicts_with = "no_history")]
    history: Option<PathBuf>,
    /// Do not record this conversation.
    #[arg(long)]
    no_history: bool,
    /// Name shown for the agent and stored in history.
    #[arg(long, default_value = "Agent")]
    agent_name: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Send(String),
    Cancel,
    Stats,
    Clear,
    Quit,
    Unknown(String),
    Empty,
}

impl Command {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        match line {
            "" => Self::Empty,
            "/cancel" => Self::Cancel,
            "/stats" => Self::Stats,
            "/clear" => Self::Clear,
            "/quit" | "/exit" => Self::Quit,
            other if other.starts_with('/') => Self::Unknown(other.to_string()),
            other => Self::Send(other.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_observability();
    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut transport_config = DataStreamConfig::from_env()?;
    if let Some(base_url) = args.base_url.as_deref() {
        transport_config = transport_config.base_url(base_url);
    }
    let engine_config = EngineConfig::from_env().agent_name(args.agent_name.clone());
    let transport_config = transport_config.buffer_capacity(engine_config.stream_buffer_capacity);
    let tick_interval = engine_config.tick_interval;
    let controller = Arc::new(SessionController::new(
        Arc::new(DataStreamTransport::new(transport_config)?),
        engine_config,
    )?);
    controller.start(&args.agent)?;
    let history = open_history(&args);

    println!(
        "Chatting with {} ({}). Commands: /cancel /stats /clear /quit",
        args.agent_name, args.agent
    );

    let (line_tx, mut line_rx) = mpsc::channel::<String>(16);
    tokio::spawn(read_stdin(line_tx));
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();

    let mut view = controller.subscribe();
    let mut printer = TranscriptPrinter::default();
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(snapshot) = view.poll() {
                    let out = printer.render(&snapshot.messages);
                    if !out.is_empty() {
                        print!("{out}");
                        let _ = std::io::stdout().flush();
                    }
                }
            }
            Some(outcome) = outcome_rx.recv() => report_outcome(outcome),
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                match Command::parse(&line) {
                    Command::Send(text) => {
                        let controller = Arc::clone(&controller);
                        let outcome_tx = outcome_tx.clone();
                        tokio::spawn(async move {
                            let outcome = match controller.send_message(&text).await {
                                Ok(exchange) => exchange.wait().await,
                                Err(err) => Err(err),
                            };
                            let _ = outcome_tx.send(outcome);
                        });
                    }
                    Command::Cancel => {
                        controller.cancel();
                        println!("[cancelled]");
                    }
                    Command::Stats => print_stats(&controller),
                    Command::Clear => {
                        controller.reset();
                        printer.clear();
                        println!("[conversation cleared]");
                    }
                    Command::Quit => break,
                    Command::Unknown(cmd) => println!("unknown command {cmd}"),
                    Command::Empty => {}
                }
            }
        }
    }

    controller.cancel();
    if let Some(store) = history {
        save_history(&store, &controller, &args.agent_name);
    }
    Ok(())
}

async fn read_stdin(tx: mpsc::Sender<String>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "stdin read failed");
                break;
            }
        }
    }
}

fn report_outcome(outcome: Result<ExchangeOutcome, SessionError>) {
    match outcome {
        Ok(ExchangeOutcome::Completed) | Ok(ExchangeOutcome::Cancelled) => {}
        Ok(ExchangeOutcome::Partial) => println!("[response incomplete]"),
        // Agent errors are already in the transcript.
        Err(SessionError::Agent(_)) => {}
        Err(err) if err.is_cancelled() => {}
        Err(err) => println!("[error] {err}"),
    }
}

fn print_stats(controller: &SessionController) {
    let snapshot = controller.snapshot();
    let last_active = snapshot
        .last_active
        .with_timezone(&chrono::Local)
        .format("%H:%M:%S");
    println!(
        "session {} | {} messages | {} | last active {last_active}",
        snapshot.session_id.as_deref().unwrap_or("<new>"),
        snapshot.messages.len(),
        format_stats(&snapshot.stats),
    );
}

fn open_history(args: &Args) -> Option<HistoryStore> {
    if args.no_history {
        return None;
    }
    if let Some(path) = args.history.clone() {
        return Some(HistoryStore::new(path));
    }
    match HistoryStore::from_env() {
        Ok(store) => Some(store),
        Err(err) => {
            warn!(error = %err, "history disabled");
            None
        }
    }
}

fn save_history(store: &HistoryStore, controller: &SessionController, agent_name: &str) {
    let record = controller.record(agent_name);
    if record.messages.is_empty() {
        return;
    }
    match store.record(record) {
        Ok(_) => println!("[saved to {}]", store.path().display()),
        Err(err) => eprintln!("failed to save history: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_parsed() {
        assert_eq!(Command::parse("  /cancel "), Command::Cancel);
        assert_eq!(Command::parse("/stats"), Command::Stats);
        assert_eq!(Command::parse("/clear"), Command::Clear);
        assert_eq!(Command::parse("/exit"), Command::Quit);
        assert_eq!(Command::parse("   "), Command::Empty);
        assert_eq!(
            Command::parse("/nope"),
            Command::Unknown("/nope".to_string())
        );
        assert_eq!(
            Command::parse(" list pods "),
            Command::Send("list pods".to_string())
        );
    }

    #[test]
    fn args_require_agent_and_reject_conflicting_history_flags() {
        assert!(Args::try_parse_from(["agentchat"]).is_err());
        assert!(
            Args::try_parse_from(["agentchat", "--agent", "a", "--history", "h.json", "--no-history"])
                .is_err()
        );
        let args = Args::try_parse_from(["agentchat", "--agent", "a", "--no-history"])
            .expect("args");
        assert!(open_history(&args).is_none());
        assert_eq!(args.agent_name, "Agent");
    }

    #[test]
    fn explicit_history_path_is_used() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("h.json");
        let args = Args::try_parse_from([
            "agentchat",
            "--agent",
            "a",
            "--history",
            path.to_str().expect("utf8 path"),
        ])
        .expect("args");
        let store = open_history(&args).expect("store");
        assert_eq!(store.path(), path.as_path());
    }
}
