//! Reflow - scanned-PDF to reflowable EPUB conversion service.
//!
//! Routes each page of an uploaded PDF through a remote vision OCR model and
//! assembles the recognized text into an EPUB, with live per-page progress
//! over SSE.

mod cli;
mod config;
mod events;
mod jobs;
mod models;
mod pipeline;
mod server;
mod utils;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    // Initialize logging based on verbosity
    let default_filter = if cli::is_verbose() {
        "reflow=info"
    } else {
        "reflow=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Run CLI
    cli::run().await
}
