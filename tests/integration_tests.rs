//! End-to-end tests: a bound server, real WebSocket clients, and events
//! injected through the republisher.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use lcm_websocket_proxy::bus::LoopbackBus;
use lcm_websocket_proxy::handlers::{DialHandler, Handler, JpegHandler, JsonHandler};
use lcm_websocket_proxy::image::PixelFormat;
use lcm_websocket_proxy::pubsub::Republisher;
use lcm_websocket_proxy::server::WsServer;
use lcm_websocket_proxy::spy::{Spy, SPY_CHANNEL};
use lcm_websocket_proxy::types::packages::{self, ImageMessage};
use lcm_websocket_proxy::types::{FieldDescriptor, FieldKind, TypeDescriptor, TypeRegistry, Value};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PINNED_FINGERPRINT: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];

fn pose_descriptor() -> Arc<TypeDescriptor> {
  Arc::new(TypeDescriptor::with_fingerprint(
    "pose_t",
    vec![FieldDescriptor::scalar("utime", FieldKind::Int64)],
    PINNED_FINGERPRINT,
  ))
}

fn pose_payload(descriptor: &TypeDescriptor, utime: i64) -> Bytes {
  Bytes::from(
    descriptor
      .encode(&Value::Struct(vec![("utime".into(), Value::Int(utime))]))
      .unwrap(),
  )
}

fn json_registry() -> Arc<TypeRegistry> {
  let mut registry = TypeRegistry::new();
  registry.register(pose_descriptor());
  registry.register(packages::channel_stats().clone());
  registry.register(packages::channel_stats_list().clone());
  Arc::new(registry)
}

/// Bind a server with an unstarted loopback republisher; events enter the
/// fan-out through `Republisher::inject`.
async fn start_server(
  handler: Arc<dyn Handler>,
) -> (Arc<Republisher>, SocketAddr, watch::Sender<bool>) {
  let republisher = Republisher::new(Box::new(LoopbackBus::new()), ".*");
  let server = WsServer::bind("127.0.0.1", 0, handler, republisher.clone())
    .await
    .expect("bind server")
    .empty_wait(Duration::from_millis(10));
  let addr = server.local_addr();
  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  tokio::spawn(server.serve(shutdown_rx));
  (republisher, addr, shutdown_tx)
}

async fn connect(addr: SocketAddr, path: &str) -> WsClient {
  let (client, _) = connect_async(format!("ws://{}{}", addr, path))
    .await
    .expect("connect client");
  client
}

/// Inject repeatedly until the client yields a frame; the first injections
/// can race the server-side subscription that follows the handshake.
async fn inject_until_frame(
  client: &mut WsClient,
  republisher: &Republisher,
  channel: &str,
  payload: &Bytes,
) -> Message {
  for _ in 0..100 {
    republisher.inject(channel, payload.clone());
    if let Ok(Some(Ok(message))) = timeout(Duration::from_millis(50), client.next()).await {
      return message;
    }
  }
  panic!("no frame received for channel {}", channel);
}

fn text_of(message: Message) -> serde_json::Value {
  match message {
    Message::Text(text) => serde_json::from_str(text.as_str()).expect("valid JSON"),
    other => panic!("expected a text frame, got {:?}", other),
  }
}

/// Drain whatever arrives within `window`.
async fn collect_frames(client: &mut WsClient, window: Duration) -> Vec<Message> {
  let mut frames = Vec::new();
  let deadline = tokio::time::Instant::now() + window;
  loop {
    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    if remaining.is_zero() {
      break;
    }
    match timeout(remaining, client.next()).await {
      Ok(Some(Ok(message))) => frames.push(message),
      _ => break,
    }
  }
  frames
}

#[tokio::test]
async fn json_fanout_reaches_every_subscriber() {
  let descriptor = pose_descriptor();
  let handler = Arc::new(JsonHandler::new(json_registry()));
  let (republisher, addr, _shutdown) = start_server(handler).await;

  let mut first = connect(addr, "/").await;
  let mut second = connect(addr, "/").await;

  let payload = pose_payload(&descriptor, 7);
  let envelope = text_of(inject_until_frame(&mut first, &republisher, "A", &payload).await);
  assert_eq!(envelope["channel"], "A");
  assert_eq!(envelope["fingerprint"], "0102030405060708");
  assert_eq!(envelope["event"]["utime"], 7);

  let envelope = text_of(inject_until_frame(&mut second, &republisher, "A", &payload).await);
  assert_eq!(envelope["channel"], "A");
  assert_eq!(envelope["fingerprint"], "0102030405060708");
}

#[tokio::test]
async fn channel_filters_partition_clients() {
  let descriptor = pose_descriptor();
  let handler = Arc::new(JsonHandler::new(json_registry()));
  let (republisher, addr, _shutdown) = start_server(handler).await;

  let mut foo_client = connect(addr, "/FOO").await;
  let mut bar_client = connect(addr, "/BAR").await;

  let payload = pose_payload(&descriptor, 1);
  // Interleave all three channels; BAZ matches no one.
  for _ in 0..20 {
    republisher.inject("FOO", payload.clone());
    republisher.inject("BAR", payload.clone());
    republisher.inject("BAZ", payload.clone());
    tokio::time::sleep(Duration::from_millis(10)).await;
  }

  let foo_frames = collect_frames(&mut foo_client, Duration::from_millis(200)).await;
  let bar_frames = collect_frames(&mut bar_client, Duration::from_millis(200)).await;
  assert!(!foo_frames.is_empty());
  assert!(!bar_frames.is_empty());
  for frame in foo_frames {
    assert_eq!(text_of(frame)["channel"], "FOO");
  }
  for frame in bar_frames {
    assert_eq!(text_of(frame)["channel"], "BAR");
  }
}

#[tokio::test]
async fn coalescing_keeps_only_the_last_payload_per_channel() {
  let descriptor = pose_descriptor();
  let handler = Arc::new(JsonHandler::new(json_registry()));
  let (republisher, addr, _shutdown) = start_server(handler).await;

  let mut client = connect(addr, "/.*?update_interval_ms=100").await;

  // Wait until the subscription is live before the burst.
  let sync = pose_payload(&descriptor, 0);
  let first = text_of(inject_until_frame(&mut client, &republisher, "SYNC", &sync).await);
  assert_eq!(first["channel"], "SYNC");

  // 50 events on X inside one window; only the last may survive.
  for utime in 1..=50 {
    republisher.inject("X", pose_payload(&descriptor, utime));
  }

  let frames = collect_frames(&mut client, Duration::from_millis(350)).await;
  let x_frames: Vec<_> = frames
    .into_iter()
    .map(text_of)
    .filter(|envelope| envelope["channel"] == "X")
    .collect();
  assert_eq!(x_frames.len(), 1, "one coalesced frame per window");
  assert_eq!(x_frames[0]["event"]["utime"], 50);
}

#[tokio::test]
async fn unknown_fingerprints_reach_no_json_client() {
  let descriptor = pose_descriptor();
  let handler = Arc::new(JsonHandler::new(json_registry()));
  let (republisher, addr, _shutdown) = start_server(handler).await;

  let mut client = connect(addr, "/").await;

  // Prove the subscription is live, then inject garbage.
  let known = pose_payload(&descriptor, 1);
  inject_until_frame(&mut client, &republisher, "WARMUP", &known).await;

  republisher.inject("MYSTERY", Bytes::from(vec![0xEE; 24]));
  let frames = collect_frames(&mut client, Duration::from_millis(250)).await;
  assert!(frames.is_empty(), "undecodable payloads must be dropped");
}

#[tokio::test]
async fn dial_clients_get_both_frame_kinds_on_one_socket() {
  let handler = Arc::new(DialHandler::new(
    JpegHandler::new(1.0, 75),
    JsonHandler::new(json_registry()),
  ));
  let (republisher, addr, _shutdown) = start_server(handler).await;

  let mut client = connect(addr, "/").await;

  let image = ImageMessage {
    timestamp: 424_242,
    sequence: 0,
    width: 4,
    height: 4,
    row_stride: 12,
    pixelformat: PixelFormat::Bgr as i32,
    data: Bytes::from(vec![127u8; 48]),
  };
  let image_payload = Bytes::from(image.encode());

  let frame = inject_until_frame(&mut client, &republisher, "CAM", &image_payload).await;
  let Message::Binary(data) = frame else {
    panic!("image_t must arrive as a binary frame, got {:?}", frame);
  };
  // 24-byte log header, then the channel name, then JPEG.
  assert_eq!(u64::from_be_bytes(data[0..8].try_into().unwrap()), 0);
  assert_eq!(i64::from_be_bytes(data[8..16].try_into().unwrap()), 424_242);
  assert_eq!(i32::from_be_bytes(data[16..20].try_into().unwrap()), 3);
  assert_eq!(
    i32::from_be_bytes(data[20..24].try_into().unwrap()) as usize,
    image_payload.len()
  );
  assert_eq!(&data[24..27], b"CAM");
  assert_eq!(&data[27..29], &[0xFF, 0xD8]);

  let pose = pose_payload(&pose_descriptor(), 9);
  let frame = inject_until_frame(&mut client, &republisher, "NAV", &pose).await;
  assert!(matches!(frame, Message::Text(_)), "non-image traffic is text");
}

#[tokio::test]
async fn spy_stats_arrive_through_the_same_transport() {
  let handler = Arc::new(JsonHandler::new(json_registry()));
  let (republisher, addr, _shutdown) = start_server(handler).await;

  let spy_bus = LoopbackBus::new();
  let publisher = spy_bus.publisher();
  let spy = Spy::start(json_registry(), republisher.clone(), Box::new(spy_bus), ".*")
    .expect("start spy");

  let mut client = connect(addr, &format!("/{}", SPY_CHANNEL)).await;

  // Traffic the registry cannot decode: counted and reported as such.
  for _ in 0..5 {
    publisher.publish("Q", &[0xAA; 16][..]).expect("publish");
  }

  // The first window can close mid-burst; keep reading frames until the
  // cumulative count settles.
  let mut q_record = None;
  for _ in 0..6 {
    let frames = collect_frames(&mut client, Duration::from_millis(1200)).await;
    for frame in frames {
      let envelope = text_of(frame);
      assert_eq!(envelope["channel"], SPY_CHANNEL);
      let channels = envelope["event"]["channels"].as_array().unwrap().clone();
      if let Some(record) = channels.iter().find(|r| r["channel"] == "Q") {
        q_record = Some(record.clone());
      }
    }
    if q_record.as_ref().is_some_and(|r| r["num_msgs"] == 5) {
      break;
    }
  }

  let record = q_record.expect("a stats record for Q");
  assert_eq!(record["num_msgs"], 5);
  assert!(record["undecodable"].as_i64().unwrap() >= 1);
  assert_eq!(record["type"], "aaaaaaaaaaaaaaaa");

  spy.stop();
}

#[tokio::test]
async fn shutdown_closes_clients_and_republisher_stops() {
  let descriptor = pose_descriptor();
  let handler = Arc::new(JsonHandler::new(json_registry()));
  let (republisher, addr, shutdown) = start_server(handler).await;

  let mut client = connect(addr, "/").await;
  let payload = pose_payload(&descriptor, 3);
  inject_until_frame(&mut client, &republisher, "A", &payload).await;

  shutdown.send(true).expect("signal shutdown");

  // The client observes a close (or the connection ending) promptly.
  let mut closed = false;
  for _ in 0..20 {
    match timeout(Duration::from_millis(100), client.next()).await {
      Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
        closed = true;
        break;
      }
      Ok(Some(Ok(_))) => continue,
      Ok(Some(Err(_))) => {
        closed = true;
        break;
      }
      Err(_) => continue,
    }
  }
  assert!(closed, "client socket must close on shutdown");

  // Stop is idempotent and bounded.
  republisher.stop();
  republisher.stop();
}
