//! The WebSocket side of the proxy.
//!
//! Each client connection names a channel regex in its URL path and may opt
//! into coalesced delivery with `?update_interval_ms=N`. The accept loop
//! and every per-client drain task run on the cooperative runtime; the only
//! contact with the LCM threads is through observer mailboxes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use percent_encoding::percent_decode_str;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use crate::errors::ProxyError;
use crate::handlers::Handler;
use crate::pubsub::{Observer, Republisher};

/// Sleep between mailbox polls when a client has nothing pending.
pub const DEFAULT_EMPTY_WAIT: Duration = Duration::from_millis(100);

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// LCM-WebSocket server: accepts clients, parses their subscription
/// requests, and drains their observers through the configured handler.
pub struct WsServer {
  listener: TcpListener,
  local_addr: SocketAddr,
  handler: Arc<dyn Handler>,
  republisher: Arc<Republisher>,
  empty_wait: Duration,
}

impl std::fmt::Debug for WsServer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WsServer")
      .field("local_addr", &self.local_addr)
      .field("empty_wait", &self.empty_wait)
      .finish()
  }
}

impl WsServer {
  /// Bind the listening socket. Port 0 picks an ephemeral port, readable
  /// back through [`WsServer::local_addr`].
  pub async fn bind(
    host: &str,
    port: u16,
    handler: Arc<dyn Handler>,
    republisher: Arc<Republisher>,
  ) -> Result<Self, ProxyError> {
    let listener = TcpListener::bind((host, port)).await?;
    let local_addr = listener.local_addr()?;
    log::info!("listening on ws://{}", local_addr);
    Ok(Self {
      listener,
      local_addr,
      handler,
      republisher,
      empty_wait: DEFAULT_EMPTY_WAIT,
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn empty_wait(mut self, empty_wait: Duration) -> Self {
    self.empty_wait = empty_wait;
    self
  }

  /// Accept clients until the shutdown watch fires, spawning one drain
  /// task per connection. Returning drops the listening socket; in-flight
  /// client tasks observe the same watch and exit on their own.
  pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ProxyError> {
    loop {
      tokio::select! {
        _ = shutdown.changed() => break,
        accepted = self.listener.accept() => {
          match accepted {
            Ok((stream, peer)) => {
              let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
              let handler = Arc::clone(&self.handler);
              let republisher = Arc::clone(&self.republisher);
              let shutdown = shutdown.clone();
              let empty_wait = self.empty_wait;
              tokio::spawn(async move {
                handle_client(stream, peer, handler, republisher, empty_wait, shutdown, client_id)
                  .await;
              });
            }
            Err(e) => log::warn!("failed to accept connection: {}", e),
          }
        }
      }
    }
    log::info!("server on ws://{} shutting down", self.local_addr);
    Ok(())
  }
}

async fn handle_client(
  stream: TcpStream,
  peer: SocketAddr,
  handler: Arc<dyn Handler>,
  republisher: Arc<Republisher>,
  empty_wait: Duration,
  shutdown: watch::Receiver<bool>,
  client_id: u64,
) {
  let mut request_path = String::new();
  let ws = match tokio_tungstenite::accept_hdr_async(stream, |req: &Request, response: Response| {
    request_path = req
      .uri()
      .path_and_query()
      .map(|pq| pq.to_string())
      .unwrap_or_default();
    Ok(response)
  })
  .await
  {
    Ok(ws) => ws,
    Err(e) => {
      log::debug!("handshake with {} failed: {}", peer, e);
      return;
    }
  };

  let (channel_regex, update_interval) = parse_request(&request_path, client_id);
  log::info!(
    "client {} connected from {} at {}",
    client_id,
    peer,
    request_path
  );

  let observer = Observer::new(&channel_regex);
  republisher.subscribe(observer.clone());

  let (sink, stream) = ws.split();
  let result = match update_interval {
    Some(interval) => {
      coalescing_loop(&observer, sink, stream, &*handler, interval, shutdown, client_id).await
    }
    None => {
      immediate_loop(&observer, sink, stream, &*handler, empty_wait, shutdown, client_id).await
    }
  };
  if let Err(e) = result {
    log::error!("unexpected error in client {}: {}", client_id, e);
  }

  // Unsubscribe on every exit path so the republisher never dispatches
  // into a dead mailbox.
  republisher.unsubscribe(&observer);
  log::info!(
    "client {} disconnected ({} received, {} dropped)",
    client_id,
    observer.dequeued(),
    observer.dropped()
  );
}

/// Split a request path into the URL-decoded channel regex and the
/// optional coalescing interval. An empty path subscribes to everything.
fn parse_request(request_path: &str, client_id: u64) -> (String, Option<Duration>) {
  let (path, query) = match request_path.split_once('?') {
    Some((path, query)) => (path, Some(query)),
    None => (request_path, None),
  };

  let decoded = percent_decode_str(path.trim_start_matches('/'))
    .decode_utf8_lossy()
    .to_string();
  let channel_regex = if decoded.is_empty() {
    ".*".to_string()
  } else {
    decoded
  };

  let mut update_interval = None;
  for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
    if key == "update_interval_ms" {
      match value.parse::<u64>() {
        Ok(ms) if ms > 0 => {
          log::info!("client {} using update interval of {} ms", client_id, ms);
          update_interval = Some(Duration::from_millis(ms));
        }
        _ => log::warn!("invalid update_interval_ms value: {}", value),
      }
    }
  }
  (channel_regex, update_interval)
}

/// Outcome of polling the client socket from a drain loop.
enum SocketState {
  Open,
  Closed,
}

fn observe_socket(message: Option<Result<Message, WsError>>, client_id: u64) -> SocketState {
  match message {
    None | Some(Ok(Message::Close(_))) => SocketState::Closed,
    Some(Err(e)) => {
      log::debug!("client {} socket error: {}", client_id, e);
      SocketState::Closed
    }
    Some(Ok(_)) => SocketState::Open, // inbound frames are ignored
  }
}

/// Forward every event as it arrives, sleeping briefly when idle.
async fn immediate_loop(
  observer: &Observer,
  mut sink: WsSink,
  mut stream: WsStream,
  handler: &dyn Handler,
  empty_wait: Duration,
  mut shutdown: watch::Receiver<bool>,
  client_id: u64,
) -> Result<(), ProxyError> {
  loop {
    let Some(event) = observer.get() else {
      tokio::select! {
        _ = tokio::time::sleep(empty_wait) => {}
        _ = shutdown.changed() => {
          let _ = sink.send(Message::Close(None)).await;
          return Ok(());
        }
        message = stream.next() => {
          if let SocketState::Closed = observe_socket(message, client_id) {
            return Ok(());
          }
        }
      }
      continue;
    };

    let frame = match handler.handle(&event.channel, &event.payload) {
      Ok(frame) => frame,
      Err(e) => {
        // Drop the message; no completion mark for a frame never produced.
        log::error!("error during message handling: {}", e);
        continue;
      }
    };
    if let Some(frame) = frame {
      if let Err(e) = sink.send(frame.into_message()).await {
        log::debug!("error while sending response to client {}: {}", client_id, e);
        if matches!(e, WsError::ConnectionClosed | WsError::AlreadyClosed) {
          return Ok(());
        }
        continue;
      }
    }
    observer.task_done();
  }
}

/// Last-value-wins delivery: drain everything each tick, then send one
/// frame per channel that saw traffic in the window.
async fn coalescing_loop(
  observer: &Observer,
  mut sink: WsSink,
  mut stream: WsStream,
  handler: &dyn Handler,
  interval: Duration,
  mut shutdown: watch::Receiver<bool>,
  client_id: u64,
) -> Result<(), ProxyError> {
  let mut latest: std::collections::HashMap<String, Option<bytes::Bytes>> =
    std::collections::HashMap::new();
  let mut ticker = tokio::time::interval(interval);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  ticker.reset(); // first tick after one full interval

  loop {
    tokio::select! {
      _ = ticker.tick() => {}
      _ = shutdown.changed() => {
        let _ = sink.send(Message::Close(None)).await;
        return Ok(());
      }
      message = stream.next() => {
        if let SocketState::Closed = observe_socket(message, client_id) {
          return Ok(());
        }
        continue;
      }
    }

    // Intra-window order is lost by design: only the last payload per
    // channel survives the drain.
    while let Some(event) = observer.get() {
      latest.insert(event.channel, Some(event.payload));
      observer.task_done();
    }

    for (channel, slot) in latest.iter_mut() {
      // Clear the slot before handling, success or not.
      let Some(payload) = slot.take() else {
        continue;
      };
      let frame = match handler.handle(channel, &payload) {
        Ok(frame) => frame,
        Err(e) => {
          log::error!("error during message handling: {}", e);
          continue;
        }
      };
      if let Some(frame) = frame {
        if let Err(e) = sink.send(frame.into_message()).await {
          log::debug!("error while sending response to client {}: {}", client_id, e);
          if matches!(e, WsError::ConnectionClosed | WsError::AlreadyClosed) {
            return Ok(());
          }
        }
      }
    }
  }
}

/// Resolves when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
  #[cfg(unix)]
  {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
      Ok(mut sigterm) => {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => {}
          _ = sigterm.recv() => {}
        }
      }
      Err(e) => {
        log::warn!("failed to install SIGTERM handler: {}", e);
        let _ = tokio::signal::ctrl_c().await;
      }
    }
  }
  #[cfg(not(unix))]
  {
    let _ = tokio::signal::ctrl_c().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_path_subscribes_to_everything() {
    let (regex, interval) = parse_request("/", 1);
    assert_eq!(regex, ".*");
    assert!(interval.is_none());
  }

  #[test]
  fn path_is_url_decoded() {
    let (regex, _) = parse_request("/NAV_%28STATE%7CGOAL%29", 1);
    assert_eq!(regex, "NAV_(STATE|GOAL)");
  }

  #[test]
  fn update_interval_enables_coalescing() {
    let (regex, interval) = parse_request("/CAMERA.*?update_interval_ms=250", 1);
    assert_eq!(regex, "CAMERA.*");
    assert_eq!(interval, Some(Duration::from_millis(250)));
  }

  #[test]
  fn bad_update_interval_falls_back_to_immediate() {
    let (_, interval) = parse_request("/X?update_interval_ms=fast", 1);
    assert!(interval.is_none());
    let (_, interval) = parse_request("/X?update_interval_ms=0", 1);
    assert!(interval.is_none());
    let (_, interval) = parse_request("/X?update_interval_ms=-5", 1);
    assert!(interval.is_none());
  }
}
