// Declare the modules
pub mod api;
pub mod billing;
pub mod commands;
pub mod config;
pub mod decoder;
pub mod entitlement;
pub mod error;
pub mod identity;
pub mod models;
pub mod session;
pub mod state;
pub mod storage;
pub mod transcript;

use crate::api::{BackendApi, HttpBackend};
use crate::commands::{Command, CommandContext};
use crate::config::AppConfig;
use crate::state::{AppEvent, AppState};
use crate::storage::StorageManager;
use anyhow::Context;
use std::io::Write;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

/// Entry point for the terminal client.
pub fn run() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(run_async())
}

async fn run_async() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    log::info!("Using backend {}", config.api_base);

    let storage = StorageManager::open(&config.db_path)
        .await
        .context("Failed to initialize storage manager")?;
    let api: Arc<dyn BackendApi> = Arc::new(HttpBackend::new(config.api_base.clone()));
    let autosave_every = config.autosave_interval;

    let state = AppState::new(config, storage, api).await;
    let ctx = CommandContext::start(state.clone()).await;
    let autosave = transcript::spawn_autosave(Arc::clone(&state.transcripts), autosave_every);
    let printer = tokio::spawn(print_events(state.subscribe()));

    println!("{}", commands::HELP);
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read input")? {
        if line.trim().is_empty() {
            continue;
        }
        let command = commands::parse(&line);
        if command == Command::Quit {
            break;
        }
        match commands::execute(&ctx, command).await {
            Ok(feedback) if feedback.is_empty() => {}
            Ok(feedback) => println!("{}", feedback),
            Err(err) => eprintln!("{}", err),
        }
    }

    ctx.sessions.stop().await;
    autosave.abort();
    printer.abort();
    state.transcripts.lock().await.flush().await;
    log::info!("Shutting down");
    Ok(())
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<AppEvent>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match events.recv().await {
            Ok(AppEvent::ChunkAppended { delta, .. }) => {
                print!("{}", delta);
                let _ = std::io::stdout().flush();
            }
            Ok(AppEvent::SessionStatusChanged(status)) => {
                log::debug!("Session status: {:?}", status);
                if status != models::SessionStatus::Thinking {
                    println!();
                }
            }
            Ok(AppEvent::BillingChanged { state, message, .. }) => {
                if !message.is_empty() {
                    println!("[billing {:?}] {}", state, message);
                }
            }
            Ok(AppEvent::Notice(text)) => println!("{}", text),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("Event printer lagged, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
