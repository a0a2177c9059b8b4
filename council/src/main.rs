//! CLI for the council deliberation engine.
//!
//! `council validate` runs the startup checks and exits with the
//! documented code. `council ask` runs one deliberation end to end,
//! streaming synthesis tokens to stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use council::controller::{DeliberationController, DeliberationRequest};
use council::events::EventKind;
use council::push::PushBroker;
use council::store::{ConversationStore, FileStore};
use council::title::TitleService;
use council::validate::{exit_code_for, remediation_hint, validate_startup, EXIT_CONFIG_INVALID};
use council::{CouncilConfig, HttpModelClient};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration document.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Directory holding conversation records.
    #[arg(long, default_value = "data/conversations")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate configuration and backend, then exit.
    Validate,
    /// Run one deliberation over a new conversation.
    Ask {
        /// The user message.
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "council=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = match CouncilConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("startup failed: {}", e);
            eprintln!("hint: {}", remediation_hint(&e));
            std::process::exit(EXIT_CONFIG_INVALID);
        }
    };

    let backend = Arc::new(HttpModelClient::new());
    let report = match validate_startup(backend.as_ref(), &config).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("startup failed ({}): {}", e.kind(), e);
            eprintln!("hint: {}", remediation_hint(&e));
            std::process::exit(exit_code_for(&e));
        }
    };
    info!(url = %report.base_url, models = report.available.len(), "backend validated");

    match args.command {
        Command::Validate => {
            println!("OK: {} models loaded at {}", report.available.len(), report.base_url);
            Ok(())
        }
        Command::Ask { message } => ask(backend, config, &args.data_dir, &message).await,
    }
}

async fn ask(
    backend: Arc<HttpModelClient>,
    config: CouncilConfig,
    data_dir: &std::path::Path,
    message: &str,
) -> Result<()> {
    let store: Arc<dyn ConversationStore> = Arc::new(FileStore::new(data_dir)?);
    let broker = Arc::new(PushBroker::new());

    let titles = TitleService::new(
        backend.clone(),
        store.clone(),
        config.endpoint_resolver(),
        config.models.chairman.id.clone(),
        config.title_generation.clone(),
        broker.clone(),
    );
    titles.start();
    titles.rescan().await?;

    let controller = Arc::new(DeliberationController::new(
        backend,
        store.clone(),
        config,
        Some(titles.clone()),
    ));

    let conversation = store.create_conversation().await?;
    let mut handle = controller.submit(DeliberationRequest {
        conversation_id: conversation.id,
        content: message.to_string(),
    });

    let mut title_events = broker.subscribe();

    while let Some(event) = handle.events.recv().await {
        match &event.kind {
            EventKind::Stage1Start { models } => {
                eprintln!("stage 1: drafting with {} models", models.len());
            }
            EventKind::Stage2RoundStart { round, max_rounds } => {
                eprintln!("stage 2: ranking round {}/{}", round, max_rounds);
            }
            EventKind::Stage2RefinementStart { round, .. } => {
                eprintln!("stage 2: refinement after round {}", round);
            }
            EventKind::Stage3Start { model } => {
                eprintln!("stage 3: synthesis by {}", model);
            }
            EventKind::Stage3Token { delta } => {
                use std::io::Write;
                print!("{}", delta);
                std::io::stdout().flush().ok();
            }
            EventKind::Error { kind, message } => {
                eprintln!("\nrequest failed ({}): {}", kind, message);
            }
            _ => {}
        }
    }
    println!();

    let record = handle.result.await??;
    info!(
        drafts = record.drafts.len(),
        rounds = record.rounds.len(),
        "deliberation recorded"
    );

    // Give the title worker a moment, then report the outcome.
    loop {
        let next =
            tokio::time::timeout(std::time::Duration::from_secs(30), title_events.recv()).await;
        match next {
            Ok(Ok(Some(push))) => match push.status {
                council::TitleStatus::Complete => {
                    if let Some(title) = push.data {
                        eprintln!("conversation titled: {}", title);
                    }
                    break;
                }
                council::TitleStatus::Error => break,
                _ => {}
            },
            // Timeout, lag, or broker shutdown: stop waiting.
            _ => break,
        }
    }

    Ok(())
}
