use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use profile_sync::api::http::HttpApi;
use profile_sync::api::DraftApi;
use profile_sync::config::Config;
use profile_sync::connectivity::Connectivity;
use profile_sync::console::{self, ConsoleCommand};
use profile_sync::draft::{DraftStore, ProfileValidator};
use profile_sync::models::Document;
use profile_sync::queue::{FileQueueStorage, OfflineQueue};
use profile_sync::realtime::SsePushTransport;
use profile_sync::session::{Services, SyncSession};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting profile-sync v{}", env!("CARGO_PKG_VERSION"));

    let api = Arc::new(
        HttpApi::new(
            config.api_base_url.clone(),
            config.api_token.clone(),
            config.http_timeout(),
        )
        .context("Failed to build HTTP client")?,
    );
    let push = Arc::new(
        SsePushTransport::new(
            config.push_url.clone(),
            config.api_token.clone(),
            config.http_timeout(),
        )
        .context("Failed to build push client")?,
    );
    info!("API client initialized ({})", config.api_base_url);

    // The offline queue outlives the process; anything left from a previous run replays once online
    let storage = Arc::new(FileQueueStorage::new(config.storage_dir.clone()));
    let queue = Arc::new(OfflineQueue::open(storage, config.queue())?);
    info!(
        "Offline queue at {} ({} pending)",
        config.storage_dir.display(),
        queue.len()
    );

    let document = match config.document_id {
        Some(id) => api
            .fetch_draft(id)
            .await
            .with_context(|| format!("Failed to load draft {id}"))?,
        None => Document::blank(),
    };
    let draft = DraftStore::new(document).into_shared();

    let services = Services {
        drafts: api.clone(),
        records: api.clone(),
        replay: api,
        push,
        queue,
        validator: Arc::new(ProfileValidator),
    };
    let session = SyncSession::start(draft, services, Connectivity::new(true), config.session());

    run_console(&session).await?;

    session.shutdown().await;
    Ok(())
}

/// Reads commands from stdin until `quit`, EOF or Ctrl-C.
async fn run_console(session: &SyncSession) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", console::HELP);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match console::parse_command(&line) {
                    Ok(None) => {}
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(command)) => match console::execute(session, command).await {
                        Ok(output) if !output.is_empty() => println!("{output}"),
                        Ok(_) => {}
                        Err(e) => eprintln!("{} [{}]", e.user_message(), e.code()),
                    },
                    Err(e) => eprintln!("{e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; shutting down");
                break;
            }
        }
    }
    Ok(())
}
