use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use framecast_client::{ClientBuilder, ReconnectPolicy};
use framecast_core::RelayConfig;
use framecast_telemetry::{init_telemetry, TelemetryConfig};

/// Stream synthetic or pre-extracted frame feeds to WebSocket observers.
#[derive(Parser, Debug)]
#[command(name = "framecast", version)]
struct Cli {
    /// JSON config file, layered over defaults and under FRAMECAST_* env vars.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Connect to a relay, optionally start a session, and print what arrives.
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Relay WebSocket URL. Defaults to `client.url` from config.
    #[arg(long)]
    url: Option<String>,

    /// Start a session once connected: `video`, `frame-test`, or `second-test`.
    #[arg(long)]
    play: Option<String>,

    /// Manifest path for `--play video`.
    #[arg(long)]
    video_path: Option<String>,

    #[arg(long)]
    fps: Option<f64>,

    #[arg(long)]
    total_frames: Option<u64>,
}

const PRINTED_KINDS: &[&str] = &[
    "video_info",
    "video_frame",
    "frame",
    "second",
    "status_change",
    "ack",
    "error",
    "notice",
];

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _telemetry = init_telemetry(
        TelemetryConfig {
            json: cli.json_logs,
            ..TelemetryConfig::default()
        }
        .with_level_str(&cli.log_level),
    );

    let mut config = RelayConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await
        }
        Command::Watch(args) => watch(config, args).await,
    }
}

async fn serve(config: RelayConfig) -> Result<()> {
    let handle = framecast_server::start(&config)
        .await
        .with_context(|| format!("binding {}:{}", config.server.host, config.server.port))?;
    info!(ws = %handle.ws_url(), http = %handle.http_url(), "relay ready");

    tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn watch(config: RelayConfig, args: WatchArgs) -> Result<()> {
    let url = args.url.clone().unwrap_or_else(|| config.client.url.clone());
    let (done_tx, mut done) = mpsc::unbounded_channel::<()>();

    let mut builder = ClientBuilder::new(url).policy(ReconnectPolicy::from(&config.client));
    for kind in PRINTED_KINDS {
        builder = builder.on(*kind, print_message);
    }
    let client = builder
        .on("complete", move |msg| {
            print_message(msg);
            let _ = done_tx.send(());
        })
        .start()
        .context("building relay client")?;

    if let Some(mode) = &args.play {
        client.connected().await.context("connecting to relay")?;
        let request = json!({
            "mode": mode,
            "video_path": args.video_path,
            "fps": args.fps,
            "total_frames": args.total_frames,
        });
        client.send("play_video", request).context("sending play request")?;
    }

    tokio::select! {
        result = client.wait() => result.context("relay link failed")?,
        _ = done.recv() => info!("session complete"),
        result = tokio::signal::ctrl_c() => {
            result.context("listening for ctrl-c")?;
            warn!("interrupted");
        }
    }
    client.stop().await.context("closing relay link")?;
    Ok(())
}

fn print_message(msg: &Value) {
    println!("{msg}");
}
