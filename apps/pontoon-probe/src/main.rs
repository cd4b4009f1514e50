use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pontoon_client::{HostCall, RelayClient, RelayConfig, RelayError};
use serde_json::Value;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "pontoon-probe", about = "Diagnostics for the Pontoon relay bridge")]
struct Cli {
    /// Relay endpoint the probe talks to
    #[arg(
        long,
        env = "PONTOON_RELAY_URL",
        default_value = "http://127.0.0.1:8700/bridge"
    )]
    relay: String,

    /// Poll interval in milliseconds, used until the relay suggests one
    #[arg(long, env = "PONTOON_POLL_MS")]
    poll_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Store a session key and run the relay handshake
    Connect {
        /// Session key issued by the relay operator
        key: String,
    },
    /// Drop the stored session key and reset the connection
    Disconnect,
    /// Show the connection state for the stored session
    Status,
    /// Tunnel a single host call through the relay
    Call {
        /// Method descriptor, e.g. crm.record.get
        method: String,
        /// JSON parameters for the call
        #[arg(long, default_value = "{}")]
        params: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "pontoon=info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = RelayConfig::new(&cli.relay)?;
    if let Some(millis) = cli.poll_ms {
        config = config.with_initial_poll_interval(Duration::from_millis(millis));
    }
    info!(endpoint = %config.endpoint(), "using relay endpoint");
    let client = RelayClient::new(config)?;

    match cli.command {
        Command::Connect { key } => {
            client.set_key(Some(&key)).await?;
            let state = client.state();
            println!("connected, poll interval {} ms", state.poll_interval_ms);
        }
        Command::Disconnect => {
            client.set_key(None).await?;
            println!("session cleared");
        }
        Command::Status => {
            match client.resume().await {
                Ok(true) => {}
                Ok(false) => println!("no stored session"),
                Err(RelayError::KeyNotFound) => {
                    println!("stored session is no longer known to the relay")
                }
                Err(err) => return Err(err.into()),
            }
            println!("{}", serde_json::to_string_pretty(&client.state())?);
        }
        Command::Call { method, params } => {
            let params: Value =
                serde_json::from_str(&params).context("params must be valid JSON")?;
            if !client.resume().await? {
                bail!("no stored session; run `pontoon-probe connect <key>` first");
            }
            // The probe has no host platform behind it, so a broken
            // session has nowhere to fall back to.
            let result = client
                .execute_or_fallback(HostCall::new(method, params), || async {
                    Err(RelayError::Rejected(
                        "relay session is broken and the probe has no local fallback".into(),
                    ))
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}
