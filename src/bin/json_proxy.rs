//! LCM WebSocket JSON proxy server.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use lcm_websocket_proxy::bus::UdpmBus;
use lcm_websocket_proxy::cli::{init_logging, split_packages};
use lcm_websocket_proxy::handlers::JsonHandler;
use lcm_websocket_proxy::pubsub::Republisher;
use lcm_websocket_proxy::server::{shutdown_signal, WsServer};
use lcm_websocket_proxy::types::TypeRegistry;

#[derive(Debug, Parser)]
#[command(name = "json-proxy", about = "LCM WebSocket JSON proxy server")]
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
    "starting LCM WebSocket JSON proxy at ws://{}:{}",
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
  if registry.is_empty() {
    republisher.stop();
    anyhow::bail!("no LCM types discovered, exiting");
  }
  let names: Vec<_> = registry.types().iter().map(|t| t.name().to_string()).collect();
  log::info!("discovered LCM types: {}", names.join(", "));

  let handler = Arc::new(JsonHandler::new(Arc::new(registry)));
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
  // Stop the consumer thread on every shutdown path, clean or not.
  republisher.stop();
  result.map_err(Into::into)
}
