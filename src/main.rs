use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use whitelist_relay::{config, metrics, server, RelayState};

#[derive(Parser, Debug)]
#[command(
    name = "whitelist_relay",
    version,
    about = "A private Nostr relay for whitelisted members"
)]
struct Args {
    /// Path to config directory
    #[arg(short, long, default_value = "config")]
    config_dir: String,

    /// Override the bind address
    #[arg(short, long)]
    local_addr: Option<String>,

    /// Override the public relay URL used for AUTH and signed HTTP requests
    #[arg(short, long)]
    relay_url: Option<String>,

    /// Override the SQLite database path
    #[arg(short, long)]
    db_path: Option<String>,
}

fn setup_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,whitelist_relay=debug"));

    fmt()
        .with_env_filter(env_filter)
        .with_timer(fmt::time::SystemTime)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_level(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let args = Args::parse();
    let config = config::Config::new(&args.config_dir).context("Failed to load configuration")?;
    let mut settings = config
        .get_settings()
        .context("Failed to get relay settings")?;

    if let Some(local_addr) = args.local_addr {
        settings.local_addr = local_addr;
    }

    if let Some(relay_url) = args.relay_url {
        settings.relay_url = relay_url;
    }

    if let Some(db_path) = args.db_path {
        settings.db_path = db_path;
    }

    if let Some(parent) = std::path::Path::new(&settings.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let metrics_handle = metrics::setup_metrics()?;
    let cancellation_token = CancellationToken::new();
    let state = RelayState::open(settings, Some(metrics_handle), cancellation_token)
        .await
        .context("Failed to open relay state")?;
    info!(
        "Relay pubkey {}, database at {}",
        state.relay_keys.public_key(),
        state.settings.db_path
    );

    server::run_server(Arc::new(state)).await
}
