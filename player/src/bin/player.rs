//! Live Ogg/Opus stream player - CLI binary.
//!
//! Connects to a broadcast stream and its control channel, plays audio
//! through the system output device, and logs playback progress.

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use live_player_common::{init_tracing, ColorWhen, MetricsContext, MetricsServerConfig};
use player::{ControlChannel, ControlEvent, Player, PlayerConfig};

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum ColorArg {
    Auto,
    Always,
    Never,
}

impl From<ColorArg> for ColorWhen {
    fn from(v: ColorArg) -> Self {
        match v {
            ColorArg::Auto => ColorWhen::Auto,
            ColorArg::Always => ColorWhen::Always,
            ColorArg::Never => ColorWhen::Never,
        }
    }
}

/// Live Opus Player - Play a live Ogg/Opus broadcast
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Media stream URL
    #[arg(short, long, default_value = "http://localhost:3000")]
    stream_url: String,

    /// Control channel URL (track metadata)
    #[arg(short, long, default_value = "ws://localhost:3001")]
    control_url: String,

    /// Initial buffering hint in milliseconds
    #[arg(short, long, default_value = "0")]
    buffer_hint_ms: i64,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9100")]
    metrics_bind: String,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorArg,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();
    init_tracing(args.color.into())?;
    info!("Starting live Opus player v{VERSION}");
    info!("Stream URL: {}", args.stream_url);
    info!("Control URL: {}", args.control_url);
    info!("Buffering hint: {}ms", args.buffer_hint_ms);
    info!("Metrics bind: {}", args.metrics_bind);

    let metrics = MetricsContext::new("player")?;
    let metrics_bind = args.metrics_bind.parse().context("invalid metrics bind")?;
    let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(metrics_bind));

    let mut config = PlayerConfig::new(args.stream_url);
    config.buffer_hint_ms = args.buffer_hint_ms;

    let mut player = Player::new(config).with_metrics(metrics.clone());

    let control_stop = CancellationToken::new();
    let mut control =
        ControlChannel::spawn(args.control_url, control_stop.clone(), Some(metrics));

    player.start().await;
    info!("Playing... press ctrl-c to stop");

    let mut progress = tokio::time::interval(std::time::Duration::from_secs(1));
    let mut reported_gave_up = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }

            event = control.next_event() => {
                match event {
                    Some(ControlEvent::Metadata(metadata)) => {
                        info!(
                            "Track: {} by {} ({}ms)",
                            metadata.name.as_deref().unwrap_or("unknown"),
                            metadata.author.as_deref().unwrap_or("unknown"),
                            metadata.active_file_duration_ms
                        );
                        player
                            .resync(metadata.resync_target_ms(), metadata.buffer_size_ms)
                            .await;
                    }
                    Some(ControlEvent::Raw(payload)) => {
                        info!("Control message: {}", payload);
                    }
                    Some(ControlEvent::GaveUp) => {
                        warn!("Control channel gave up reconnecting");
                    }
                    None => {
                        warn!("Control channel task ended");
                    }
                }
            }

            _ = progress.tick() => {
                if player.is_live() {
                    info!("Position: {:.1}s", player.position_ms() as f64 / 1000.0);
                }

                if player.gave_up() && !reported_gave_up {
                    warn!("Playback gave up after exhausting reconnect attempts");
                    reported_gave_up = true;
                }
            }
        }
    }

    control_stop.cancel();
    player.stop().await;

    info!("Stopped at {:.1}s", player.position_ms() as f64 / 1000.0);
    Ok(())
}
