//! `pairchat`: line-oriented two-party chat client.
//!
//! Opens the conversation with the configured counterpart, prints the
//! backfilled history and every live message, and sends each line read from
//! stdin. Configuration via CLI flags, environment variables, or config file
//! (`~/.config/pairchat/config.toml`).
//!
//! ```bash
//! cargo run --bin pairchat -- --endpoint ws://127.0.0.1:9000/ws \
//!     --participant-id therapist-1 --role A --counterpart patient-7 --token dev
//! ```

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing_appender::non_blocking::WorkerGuard;

use pairchat::chat::history::HttpHistory;
use pairchat::chat::store::{Message, SharedStore};
use pairchat::chat::{ChatEvent, ChatSession, SendError};
use pairchat::config::{CliArgs, ClientConfig, SessionSettings};
use pairchat::connection::{ConnectionState, ConnectionStatus};
use pairchat::resolver::ResolutionError;
use pairchat_proto::address::Role;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Logs go to a file; stdout carries the conversation.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("pairchat starting");

    let settings = match config.to_session_settings() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let code = run(settings).await;
    tracing::info!("pairchat exiting");
    code
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("pairchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(settings: SessionSettings) -> ExitCode {
    let history = match HttpHistory::new(
        &settings.history_url,
        settings.credential.clone(),
        settings.participant.id.clone(),
        settings.history_timeout,
    ) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let own_role = settings.participant.role;
    let (mut session, events) = ChatSession::new(
        settings.participant,
        settings.credential,
        history,
        settings.connection,
        &settings.chat,
    );

    match session.open_conversation(&settings.counterpart).await {
        Ok(pair) => eprintln!("-- conversation {pair}"),
        Err(ResolutionError::Unassigned) => {
            eprintln!("-- waiting: no counterpart assigned yet");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    }

    let printer = tokio::spawn(print_events(events, session.store(), own_role));
    let status = tokio::spawn(print_status(session.connection_status()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match session.submit(&line).await {
                Ok(_) | Err(SendError::NotReady(pairchat::chat::NotReady::EmptyContent)) => {}
                Err(e) => eprintln!("-- not sent: {e}"),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(err = %e, "stdin read failed");
                break;
            }
        }
    }

    session.close().await;
    printer.abort();
    status.abort();
    ExitCode::SUCCESS
}

/// Print the conversation as it changes.
async fn print_events(mut events: mpsc::Receiver<ChatEvent>, store: SharedStore, own: Role) {
    while let Some(event) = events.recv().await {
        let lines: Vec<String> = {
            let guard = store.lock();
            let messages = guard.messages();
            match event {
                ChatEvent::Backfilled { .. } | ChatEvent::CaughtUp { .. } => {
                    messages.iter().map(|m| render(m, own)).collect()
                }
                ChatEvent::Appended { server_id } => messages
                    .iter()
                    .filter(|m| m.server_id() == Some(server_id))
                    .map(|m| render(m, own))
                    .collect(),
                ChatEvent::RolledBack { local_id } => vec![format!("-- not delivered ({local_id})")],
                ChatEvent::Reset { .. }
                | ChatEvent::ProvisionalAdded { .. }
                | ChatEvent::Confirmed { .. } => Vec::new(),
            }
        };
        for line in lines {
            println!("{line}");
        }
    }
}

fn render(message: &Message, own: Role) -> String {
    let who = if message.sender() == own {
        "you".to_string()
    } else {
        message.sender().to_string()
    };
    format!(
        "[{}] {who}: {}",
        message.created_at().format("%H:%M:%S"),
        message.content()
    )
}

/// Report connection state transitions on stderr.
async fn print_status(mut status: watch::Receiver<ConnectionStatus>) {
    let mut last = ConnectionState::Disconnected;
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        if current.state == last {
            continue;
        }
        last = current.state;
        match current.fault {
            Some(fault) => eprintln!("-- {} ({fault:?})", current.state),
            None => eprintln!("-- {}", current.state),
        }
    }
}
