#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

//! # LCM WebSocket Proxy
//!
//! Bridges an LCM bus to browser-style WebSocket consumers. One process
//! subscribes to an LCM channel pattern, decodes each binary message
//! against a registry of known type definitions, transcodes it (JSON,
//! JPEG, or the hybrid Dial frame), and fans it out to any number of
//! WebSocket clients, each with its own channel filter and optional
//! last-value-wins rate limit. A telemetry collector republishes
//! per-channel rate/bandwidth/jitter stats through the same transport on
//! the virtual channel `LWS_LCM_SPY`.
//!
//! ## Architecture
//!
//! ```text
//! LCM thread -> Republisher -> (regex filter) -> Observer mailboxes
//!                   ^                                  |
//!                   | inject("LWS_LCM_SPY")            v
//!               Spy collector              per-client task -> Handler -> WebSocket
//! ```
//!
//! The LCM consumer runs on a dedicated OS thread and never blocks on a
//! client: observer mailboxes are bounded and drop their **oldest** entry
//! when full, trading freshness for a producer that cannot stall.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lcm_websocket_proxy::{
//!   bus::UdpmBus, handlers::JsonHandler, pubsub::Republisher,
//!   server::WsServer, types::TypeRegistry,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!   let republisher = Republisher::new(Box::new(UdpmBus::from_env()?), ".*");
//!   republisher.start()?;
//!
//!   let mut registry = TypeRegistry::new();
//!   registry.discover("senlcm")?;
//!   let handler = Arc::new(JsonHandler::new(Arc::new(registry)));
//!
//!   let server = WsServer::bind("localhost", 8765, handler, republisher.clone()).await?;
//!   let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!   server.serve(shutdown_rx).await?;
//!   republisher.stop();
//!   Ok(())
//! }
//! ```

pub mod bus;
pub mod cli;
pub mod errors;
pub mod handlers;
pub mod image;
pub mod pubsub;
pub mod server;
pub mod spy;
pub mod types;
pub mod wire;

pub use bus::{LcmBus, LoopbackBus, UdpmBus};
pub use errors::ProxyError;
pub use handlers::{DialHandler, Frame, Handler, JpegHandler, JsonHandler};
pub use pubsub::{Event, Observer, Republisher};
pub use server::WsServer;
pub use spy::{Spy, SPY_CHANNEL};
pub use types::{encode_event_json, TypeDescriptor, TypeRegistry, Value};
