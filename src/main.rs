//! gmail-push-digest: Gmail push notifications to summarized chat digests
//!
//! Arms a Gmail watch that publishes mailbox changes to a Pub/Sub topic,
//! receives the push deliveries on an HTTP webhook, reconciles each one
//! against the mailbox history, and posts a model-written summary of every
//! new inbound message as a Discord direct message.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading, wiring, and shutdown
//! - [`config`]: Environment-driven configuration for every collaborator
//! - [`errors`]: Application error model with HTTP status mapping
//! - [`cursor`]: History cursor parsing and reconciliation state
//! - [`gmail`]: Gmail REST transport behind the `MailProvider` seam
//! - [`history`]: Watch lifecycle, renewal task, and history deltas
//! - [`ingest`]: Per-notification orchestration and label filtering
//! - [`mime`]: Part-tree flattening, header extraction, attachments
//! - [`html`]: HTML to text conversion and URL truncation
//! - [`summarizer`]: Summary generation via the OpenAI Responses API
//! - [`notifier`]: Digest formatting and Discord delivery
//! - [`server`]: Pub/Sub push webhook
//! - [`models`]: Wire DTOs and domain value types

mod config;
mod cursor;
mod errors;
mod gmail;
mod history;
mod html;
mod ingest;
mod mime;
mod models;
mod notifier;
mod server;
mod summarizer;
#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use config::{ServerConfig, parse_socket_addr};
use gmail::{GmailClient, GoogleAuth, MailProvider};
use history::{HistorySync, RenewalSettings};
use ingest::{IngestOptions, IngestionController};
use models::WatchRequest;
use notifier::DiscordNotifier;
use server::AppState;
use summarizer::OpenAiSummarizer;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Command-line overrides for the environment configuration
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Listen address, overriding GMAIL_DIGEST_BIND
    #[arg(long, value_parser = parse_socket_addr)]
    bind: Option<SocketAddr>,
}

/// Application entry point
///
/// Initializes tracing from environment, loads config, arms the mailbox
/// watch, and serves the webhook until Ctrl-C or SIGTERM. On shutdown the
/// renewal task is cancelled and the watch stopped.
///
/// # Environment Variables
///
/// See [`ServerConfig::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```text
/// GMAIL_DIGEST_CLIENT_ID=1234.apps.googleusercontent.com \
/// GMAIL_DIGEST_CLIENT_SECRET=secret \
/// GMAIL_DIGEST_REFRESH_TOKEN=1//0g... \
/// GMAIL_DIGEST_TOPIC=projects/my-project/topics/gmail-push \
/// GMAIL_DIGEST_OPENAI_API_KEY=sk-... \
/// GMAIL_DIGEST_DISCORD_BOT_TOKEN=MTA... \
/// GMAIL_DIGEST_DISCORD_USER_ID=526191240962768910 \
/// cargo run -- --bind 127.0.0.1:3000
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut config = ServerConfig::load_from_env()?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()?;
    let auth = Arc::new(GoogleAuth::new(http.clone(), &config.google));
    let provider: Arc<dyn MailProvider> =
        Arc::new(GmailClient::new(http.clone(), auth, &config.google));

    let history = Arc::new(HistorySync::new(
        provider.clone(),
        WatchRequest::include(config.watch.topic.clone(), config.watch.label_ids.clone()),
        RenewalSettings::from_config(&config.watch),
    ));
    let controller = Arc::new(IngestionController::new(
        provider.clone(),
        history.clone(),
        Arc::new(OpenAiSummarizer::new(http.clone(), &config.openai)),
        Arc::new(DiscordNotifier::new(http, &config.discord)),
        IngestOptions::from_config(&config.digest),
    ));

    history.arm().await?;
    let cancel = CancellationToken::new();
    let renewal = history.spawn_renewal(cancel.clone());

    let app = server::router(Arc::new(AppState {
        controller,
        webhook_token: config.webhook_token.clone(),
    }));
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(
        addr = %config.bind_addr,
        path = server::WEBHOOK_PATH,
        "listening for push deliveries"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    if let Err(e) = renewal.await {
        tracing::warn!(error = %e, "renewal task ended abnormally");
    }
    if let Err(e) = history.disarm().await {
        tracing::warn!(code = e.code(), error = %e, "failed to stop mailbox watch");
    }
    tracing::info!("shut down");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
