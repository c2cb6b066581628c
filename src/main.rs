//! # EchoMail — Scheduled Email Sequence Dispatcher
//!
//! Sends scheduled email sequences to their recipient lists, reschedules
//! recurring ones, and tracks opens with a pixel endpoint.
//!
//! Usage:
//!   echomail                         # Start the gateway server
//!   echomail --once                  # Run a single dispatch pass and exit
//!   echomail --config custom.toml    # Use a specific config file

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use echomail_core::config::EchomailConfig;
use echomail_engine::SequenceRunner;
use echomail_mailer::{MailTransport, SmtpMailer};
use echomail_store::MailStore;

#[derive(Parser)]
#[command(
    name = "echomail",
    version,
    about = "📬 EchoMail — Scheduled Email Sequence Dispatcher"
)]
struct Cli {
    /// Path to the config file (default: ~/.echomail/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run one dispatch pass and exit instead of serving HTTP
    #[arg(long)]
    once: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "echomail=debug,tower_http=debug"
    } else {
        "echomail=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => EchomailConfig::load_from(path)?,
        None => EchomailConfig::load()?,
    };
    config.validate()?;

    if cli.once {
        let store = Arc::new(MailStore::open(&config.store.resolved_path())?);
        let mailer: Arc<dyn MailTransport> = Arc::new(SmtpMailer::new(&config.smtp)?);
        let runner = SequenceRunner::new(store, mailer, &config);

        let summary = runner.run_pass(chrono::Utc::now()).await?;
        tracing::info!("📬 Pass complete: {} mail(s) sent", summary.sent);
        for (id, reason) in &summary.errors {
            tracing::error!("❌ Sequence {id}: {reason}");
        }
        if !summary.errors.is_empty() {
            std::process::exit(1);
        }
        return Ok(());
    }

    println!("📬 EchoMail v{}", env!("CARGO_PKG_VERSION"));
    println!("   🌐 Gateway:  http://{}:{}", config.server.host, config.server.port);
    println!("   🗄️  Store:    {}", config.store.resolved_path().display());
    println!("   ✉️  SMTP:     {}:{}", config.smtp.host, config.smtp.port);
    println!();

    echomail_gateway::start(&config).await?;
    Ok(())
}
