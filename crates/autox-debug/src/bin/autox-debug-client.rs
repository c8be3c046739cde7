use std::path::PathBuf;

use anyhow::Context as _;
use autox_config::{AutoxConfig, WireFormat};
use autox_debug::{ClientEvent, ClientOptions, DebugClient};
use autox_debug_proto::{ClientMessage, DebugOp, DebugPoint, ServerMessage};
use clap::Parser;

/// Attach to an autox debug server, print every server message as a JSON line and optionally
/// answer each pause automatically.
#[derive(Debug, Parser)]
#[command(name = "autox-debug-client", version, about)]
struct Cli {
    /// Path to a TOML config file. Its `[debug]` section supplies defaults for the options
    /// below.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Wire format: `json` or `bincode`.
    #[arg(long)]
    format: Option<WireFormat>,

    /// Debug point to register, as `path:line`. May be repeated.
    #[arg(long = "break", value_name = "PATH:LINE", value_parser = parse_debug_point)]
    breakpoints: Vec<DebugPoint>,

    /// Resume every pause with this operation (`step-into`, `step-over`, `step-return`).
    #[arg(long)]
    auto_op: Option<DebugOp>,
}

fn parse_debug_point(value: &str) -> Result<DebugPoint, String> {
    let (path, line) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("expected PATH:LINE, got {value:?}"))?;
    let line = line
        .parse::<u32>()
        .map_err(|err| format!("invalid line in {value:?}: {err}"))?;
    if path.is_empty() {
        return Err(format!("missing path in {value:?}"));
    }
    Ok(DebugPoint::new(path, line))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config.as_ref() {
        Some(path) => AutoxConfig::load_from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => AutoxConfig::default(),
    };
    config.apply_env_overrides()?;
    autox_debug::hardening::init(&config.logging);

    if let Some(host) = cli.host {
        config.debug.host = host;
    }
    if let Some(port) = cli.port {
        config.debug.port = port;
    }
    if let Some(format) = cli.format {
        config.debug.wire_format = format;
    }

    let addr = config.debug.socket_addr()?;
    let options = ClientOptions::from_config(&config.debug);
    let client = DebugClient::start(addr, &options, cli.breakpoints)
        .with_context(|| format!("failed to attach to debug server at {addr}"))?;
    tracing::info!(target: "autox.debug", addr = %addr, "attached to debug server");

    for event in client.events().iter() {
        match event {
            ClientEvent::Message(message) => {
                println!("{}", serde_json::to_string(&message)?);
                if let (Some(op), ServerMessage::ExecutionPaused { point_id, .. }) =
                    (cli.auto_op, &message)
                {
                    client.send(ClientMessage::DebugOp {
                        point_id: point_id.clone(),
                        correlation_id: client.next_correlation_id(),
                        op,
                    })?;
                }
            }
            ClientEvent::Unserializable(text) => {
                println!("{}", serde_json::json!({ "unserializable": text }));
            }
            ClientEvent::Disconnected => break,
        }
    }

    client.close();
    Ok(())
}
