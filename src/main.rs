use anyhow::Result;
use clap::Parser;
use fakeldap::ldap_handler::LdapHandler;
use fakeldap::{run_metrics_server, Config, Directory, LdapServer, Metrics};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fakeldap")]
#[command(about = "In-memory LDAP v3 server for integration tests - users, groups, bind, search, add, modify, delete")]
struct Args {
    /// Configuration file path (YAML). Defaults apply when omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen URL (overrides config; e.g. ldap://:1389)
    #[arg(short = 'l', long, value_name = "URL")]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("fakeldap={},info", log_level))
        .init();

    info!("Starting fakeldap");

    let config = match &args.config {
        Some(path) => {
            info!("Configuration source: file {:?}", path);
            Config::from_file(path)?
        }
        None => {
            info!("No --config given, using defaults");
            Config::default()
        }
    };
    let listen_url = args.listen.clone().unwrap_or_else(|| config.listen.url.clone());

    let directory = Arc::new(Directory::new());
    directory.seed(&config.directory);

    info!("Configuration loaded:");
    info!("  Listen URL: {}", listen_url);
    info!("  Users: {}", directory.user_count());
    info!("  Groups: {}", directory.group_count());

    let handler = Arc::new(LdapHandler::new(Arc::clone(&directory)));
    let metrics = Arc::new(Metrics::new());

    if let Some(addr) = config.metrics_listen.clone() {
        let metrics_for_http = Arc::clone(&metrics);
        let directory_for_http = Arc::clone(&directory);
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, metrics_for_http, directory_for_http).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let server = LdapServer::bind(&listen_url, handler, metrics).await?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}
