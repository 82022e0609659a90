//! LCM WebSocket proxy server for the Dial visualization webapp.
//!
//! Serves `image_t` channels as JPEG binary frames and everything else as
//! JSON text frames over a single socket, and runs the spy collector so
//! clients can subscribe to live channel statistics on `LWS_LCM_SPY`.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use lcm_websocket_proxy::bus::UdpmBus;
use lcm_websocket_proxy::cli::{init_logging, split_packages};
use lcm_websocket_proxy::handlers::{DialHandler, JpegHandler, JsonHandler};
use lcm_websocket_proxy::pubsub::Republisher;
use lcm_websocket_proxy::server::{shutdown_signal, WsServer};
use lcm_websocket_proxy::spy::{Spy, SPY_CHANNEL};
use lcm_websocket_proxy::types::{packages, TypeRegistry};

#[derive(Debug, Parser)]
#[command(
  name = "dial-proxy",
  about = "LCM WebSocket proxy server for the Dial visualization webapp"
)]
struct Args {
  /// The host to listen on.
  #[arg(long, default_value = "localhost")]
  host: String,

  /// The port to listen on.
  #[arg(long, default_value_t = 8765)]
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

  /// The LCM packages to discover LCM types from, comma-separated.
  lcm_packages: String,
}

fn main() -> ExitCode {
  let args = Args::parse();
  init_logging(args.verbose);

  log::info!(
    "starting LCM WebSocket Dial proxy at ws://{}:{}",
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

  let mut registry = TypeRegistry::new();
  for package in split_packages(&args.lcm_packages) {
    if registry.discover(&package).is_err() {
      log::error!("failed to discover LCM types in package '{}'", package);
    }
  }

  // The spy's stats types are always available so clients can decode the
  // virtual channel through the ordinary JSON path.
  registry.register(packages::channel_stats().clone());
  registry.register(packages::channel_stats_list().clone());

  if registry.is_empty() {
    republisher.stop();
    anyhow::bail!("no LCM types discovered, exiting");
  }
  let names: Vec<_> = registry.types().iter().map(|t| t.name().to_string()).collect();
  log::info!("discovered LCM types: {}", names.join(", "));
  let registry = Arc::new(registry);

  let spy_bus = UdpmBus::from_env().context("failed to open the spy's LCM bus")?;
  let spy = Spy::start(
    Arc::clone(&registry),
    republisher.clone(),
    Box::new(spy_bus),
    &args.channel,
  )
  .context("failed to start the spy collector")?;
  log::info!("stats available on virtual channel '{}'", SPY_CHANNEL);

  let handler = Arc::new(DialHandler::new(
    JpegHandler::new(args.scale, args.quality),
    JsonHandler::new(Arc::clone(&registry)),
  ));
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
  // Stop the collector threads on every shutdown path, clean or not.
  spy.stop();
  republisher.stop();
  result.map_err(Into::into)
}
