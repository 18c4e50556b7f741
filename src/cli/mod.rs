//! CLI commands implementation.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Settings;
use crate::pipeline::renderer::check_binary;

#[derive(Parser)]
#[command(name = "reflow")]
#[command(about = "Scanned-PDF to reflowable EPUB conversion service")]
#[command(version)]
pub struct Cli {
    /// Data directory
    #[arg(long, global = true, env = "REFLOW_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Start the conversion web server
    Serve {
        /// Host to bind to (overrides REFLOW_HOST)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to (overrides REFLOW_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Verify external dependencies are installed
    Check,
}

/// Parse arguments and dispatch.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if let Some(data_dir) = cli.data_dir {
        settings.data_dir = data_dir;
    }

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| settings.host.clone());
            let port = port.unwrap_or(settings.port);
            crate::server::serve(settings, &host, port).await
        }
        Commands::Check => {
            check_dependencies(&settings);
            Ok(())
        }
    }
}

/// Report whether the poppler binaries and the OCR endpoint are reachable.
fn check_dependencies(settings: &Settings) {
    let mut missing = false;
    for binary in ["pdftoppm", "pdfinfo"] {
        if check_binary(binary) {
            println!("ok: {} found", binary);
        } else {
            println!("missing: {} (install the poppler-utils package)", binary);
            missing = true;
        }
    }

    println!("ocr endpoint: {} (model {})", settings.ocr_base_url, settings.ocr_model);
    println!("data dir: {}", settings.data_dir.display());

    if missing {
        println!("\nSome dependencies are missing; page rendering will fail without them.");
    }
}
