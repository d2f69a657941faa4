mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tether_bridge::{Bridge, BridgeEvent, BridgeState, Payload, WebRtcConnector};
use tether_protocol::{BridgeConfig, Channel};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DIAGNOSTICS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = BridgeConfig::load(&args.config_path)
        .with_context(|| format!("Failed to load {}", args.config_path.display()))?;
    if let Some(url) = args.signaling_url {
        config.signaling.url = url;
    }
    if args.token.is_some() {
        config.signaling.token = args.token;
    }

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                error!("{}", issue);
            } else {
                warn!("{}", issue);
            }
        }
        if has_errors {
            error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let connector = Arc::new(WebRtcConnector::new(Arc::new(config.clone())));
    let (bridge, mut events) = Bridge::start(config, connector);

    info!(server_id = %args.server_id, "Starting bridge");
    bridge
        .connect(&args.server_id)
        .await
        .with_context(|| format!("Failed to connect to {}", args.server_id))?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut diagnostics = tokio::time::interval(DIAGNOSTICS_INTERVAL);
    diagnostics.tick().await;

    loop {
        tokio::select! {
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    if let Err(e) = bridge.send(Channel::Control, line).await {
                        warn!("Send failed: {e}");
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("stdin read failed: {e}");
                    stdin_open = false;
                }
            },
            event = events.recv() => match event {
                Some(event) => {
                    if handle_event(event) {
                        break;
                    }
                }
                None => break,
            },
            _ = diagnostics.tick() => {
                match bridge.diagnostics().await {
                    Ok(diag) => match serde_json::to_string(&diag) {
                        Ok(json) => info!(diagnostics = %json, "Bridge diagnostics"),
                        Err(e) => warn!("Failed to encode diagnostics: {e}"),
                    },
                    Err(e) => warn!("Diagnostics unavailable: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting");
                break;
            }
        }
    }

    bridge.disconnect().await;
    if bridge.state() != BridgeState::Idle {
        warn!(state = %bridge.state(), "Bridge did not settle to idle");
    }
    Ok(())
}

/// Returns true when the bridge gave up and the process should exit.
fn handle_event(event: BridgeEvent) -> bool {
    match event {
        BridgeEvent::Message { channel, payload } => match payload {
            Payload::Text(text) => println!("[{channel}] {text}"),
            Payload::Binary(data) => println!("[{channel}] <{} bytes>", data.len()),
        },
        BridgeEvent::SessionLost { epoch, cause } => {
            warn!(epoch, ?cause, "Session lost");
        }
        BridgeEvent::AttemptFailed { attempt, reason } => {
            warn!(attempt, %reason, "Reconnection attempt failed");
        }
        BridgeEvent::FlowOverrun(overrun) => warn!("{overrun}"),
        BridgeEvent::ReconnectExhausted { attempts } => {
            error!(attempts, "Remote unavailable, giving up");
            return true;
        }
        other => tracing::debug!(?other, "Bridge event"),
    }
    false
}
