//! LCM WebSocket JPEG proxy server.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use lcm_websocket_proxy::bus::UdpmBus;
use lcm_websocket_proxy::cli::init_logging;
use lcm_websocket_proxy::handlers::JpegHandler;
use lcm_websocket_proxy::pubsub::Republisher;
use lcm_websocket_proxy::server::{shutdown_signal, WsServer};

#[derive(Debug, Parser)]
#[command(name = "jpeg-proxy", about = "LCM WebSocket JPEG proxy server")]
struct Args {
  /// The host to listen on.
  #[arg(long, default_value = "localhost")]
  host: String,

  /// The port to listen on.
  #[arg(long, default_value_t = 8766)]
  port: u16,

  /// The LCM channel pattern to subscribe to. Use '.*' for all channels.
  #[arg(long, default_value = ".*")]
  channel: String,

  /// The scale factor to resize images by.
  #[arg(long, default_value_t = 1.0)]
  scale: f32,

  /// The JPEG quality level, 0-100.
  #[arg(long, default_value_t = 75)]
  quality: i64,

  /// Increase verbosity (0=ERROR, -v=WARNING, -vv=INFO, -vvv=DEBUG).
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,
}

fn main() -> ExitCode {
  let args = Args::parse();
  init_logging(args.verbose);

  log::info!(
    "starting LCM WebSocket JPEG proxy at ws://{}:{}",
    args.host,
    args.port
  );
  match run(args) {
    Ok(()) => {
      log::info!("stopped");
      ExitCode::SUCCESS
    }
    Err(e) => {
      log::error!("{:#}", e);
      ExitCode::FAILURE
    }
  }
}

#[tokio::main(flavor = "current_thread")]
async fn run(args: Args) -> anyhow::Result<()> {
  log::debug!("creating LCM republisher for channel '{}'", args.channel);
  let bus = UdpmBus::from_env().context("failed to open the LCM bus")?;
  let republisher = Republisher::new(Box::new(bus), &args.channel);
  republisher.start()?;

  let handler = Arc::new(JpegHandler::new(args.scale, args.quality));
  let server = WsServer::bind(&args.host, args.port, handler, republisher.clone())
    .await
    .context("failed to bind the WebSocket server")?;

  let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
  tokio::spawn(async move {
    shutdown_signal().await;
    log::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
  });

  let result = server.serve(shutdown_rx).await;
  republisher.stop();
  result.map_err(Into::into)
}
