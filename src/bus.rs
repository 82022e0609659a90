//! Pluggable LCM transport.
//!
//! The republisher and the spy only need a stream of `(channel, payload)`
//! tuples; where those come from is a transport concern behind [`LcmBus`].
//! Two implementations ship: [`UdpmBus`] speaks the LCM UDP-multicast wire
//! protocol, and [`LoopbackBus`] is an in-process bus for tests and
//! embedders.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::mpsc;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::errors::ProxyError;
use crate::pubsub::Event;

/// Default LCM multicast endpoint, overridable via `LCM_DEFAULT_URL`.
pub const DEFAULT_LCM_URL: &str = "udpm://239.255.76.67:7667";

// Wire magics, "LC02"/"LC03" big-endian.
const MAGIC_SHORT: u32 = 0x4c43_3032;
const MAGIC_FRAGMENT: u32 = 0x4c43_3033;

// A short LCM datagram must fit a UDP packet alongside its header.
const MAX_SHORT_PAYLOAD: usize = 65_499;

/// A subscribed LCM endpoint delivering `(channel, payload)` tuples.
///
/// `poll` returns at most one event and must come back within roughly the
/// given timeout whether or not traffic arrived; the consuming threads
/// re-check their stop flags between polls, which bounds shutdown latency.
pub trait LcmBus: Send {
  /// Restrict delivery to channels matching `pattern` (full match).
  fn subscribe(&mut self, pattern: &str) -> Result<(), ProxyError>;

  /// Receive the next matching event, or `None` on timeout.
  fn poll(&mut self, timeout: Duration) -> Result<Option<Event>, ProxyError>;

  /// Publish a payload on a channel.
  fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<(), ProxyError>;
}

fn compile_pattern(pattern: &str) -> Result<Regex, ProxyError> {
  Regex::new(&format!("^(?:{})$", pattern))
    .map_err(|e| ProxyError::Bus(format!("invalid channel pattern '{}': {}", pattern, e)))
}

/// LCM UDP-multicast transport (short-message framing).
///
/// Fragmented traffic (`LC03`, messages above the single-datagram limit) is
/// dropped and counted; the proxy's telemetry streams fit in single
/// datagrams.
#[derive(Debug)]
pub struct UdpmBus {
  socket: UdpSocket,
  group: SocketAddrV4,
  pattern: Option<Regex>,
  sequence: u32,
  fragments_dropped: u64,
  recv_buf: Vec<u8>,
}

impl UdpmBus {
  /// Open the endpoint given a `udpm://group:port[?ttl=N]` URL.
  pub fn new(lcm_url: &str) -> Result<Self, ProxyError> {
    let parsed = url::Url::parse(lcm_url)
      .map_err(|e| ProxyError::Bus(format!("invalid LCM URL '{}': {}", lcm_url, e)))?;
    if parsed.scheme() != "udpm" {
      return Err(ProxyError::Bus(format!(
        "unsupported LCM provider '{}' (only udpm)",
        parsed.scheme()
      )));
    }
    let group: Ipv4Addr = parsed
      .host_str()
      .unwrap_or_default()
      .parse()
      .map_err(|_| ProxyError::Bus(format!("invalid multicast group in '{}'", lcm_url)))?;
    let port = parsed
      .port()
      .ok_or_else(|| ProxyError::Bus(format!("missing port in '{}'", lcm_url)))?;
    let ttl = parsed
      .query_pairs()
      .find(|(k, _)| k == "ttl")
      .and_then(|(_, v)| v.parse::<u32>().ok())
      .unwrap_or(0);

    // Several handles may join the same group in one process (republisher
    // plus spy), so the port must be shareable before binding.
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    let bind_addr = std::net::SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&bind_addr.into())?;
    let socket: UdpSocket = socket.into();
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(ttl)?;

    log::debug!("joined LCM group {}:{} (ttl {})", group, port, ttl);
    Ok(Self {
      socket,
      group: SocketAddrV4::new(group, port),
      pattern: None,
      sequence: 0,
      fragments_dropped: 0,
      recv_buf: vec![0u8; 65_536],
    })
  }

  /// Open the endpoint named by `LCM_DEFAULT_URL`, or the LCM default.
  pub fn from_env() -> Result<Self, ProxyError> {
    let url = std::env::var("LCM_DEFAULT_URL").unwrap_or_else(|_| DEFAULT_LCM_URL.to_string());
    Self::new(&url)
  }

  /// Fragmented datagrams seen and dropped so far.
  pub fn fragments_dropped(&self) -> u64 {
    self.fragments_dropped
  }

  fn parse_datagram(&mut self, datagram: &[u8]) -> Option<Event> {
    parse_short_datagram(datagram, &mut self.fragments_dropped)
  }
}

fn parse_short_datagram(datagram: &[u8], fragments_dropped: &mut u64) -> Option<Event> {
  if datagram.len() < 8 {
    return None;
  }
  let magic = BigEndian::read_u32(&datagram[..4]);
  if magic == MAGIC_FRAGMENT {
    *fragments_dropped += 1;
    log::debug!("dropping fragmented LCM datagram ({} so far)", fragments_dropped);
    return None;
  }
  if magic != MAGIC_SHORT {
    return None;
  }
  // Channel name is NUL-terminated after the 8-byte header.
  let body = &datagram[8..];
  let nul = body.iter().position(|&b| b == 0)?;
  let channel = std::str::from_utf8(&body[..nul]).ok()?;
  let payload = Bytes::copy_from_slice(&body[nul + 1..]);
  Some(Event::new(channel, payload))
}

impl LcmBus for UdpmBus {
  fn subscribe(&mut self, pattern: &str) -> Result<(), ProxyError> {
    self.pattern = Some(compile_pattern(pattern)?);
    Ok(())
  }

  fn poll(&mut self, timeout: Duration) -> Result<Option<Event>, ProxyError> {
    self.socket.set_read_timeout(Some(timeout))?;
    let mut buf = std::mem::take(&mut self.recv_buf);
    let received = self.socket.recv_from(&mut buf);
    let event = match received {
      Ok((len, _src)) => self.parse_datagram(&buf[..len]),
      Err(e)
        if e.kind() == std::io::ErrorKind::WouldBlock
          || e.kind() == std::io::ErrorKind::TimedOut =>
      {
        None
      }
      Err(e) => {
        self.recv_buf = buf;
        return Err(e.into());
      }
    };
    self.recv_buf = buf;
    let matched = event.filter(|e| {
      self
        .pattern
        .as_ref()
        .map(|re| re.is_match(&e.channel))
        .unwrap_or(true)
    });
    Ok(matched)
  }

  fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<(), ProxyError> {
    if payload.len() > MAX_SHORT_PAYLOAD {
      return Err(ProxyError::Bus(format!(
        "payload of {} bytes exceeds the single-datagram limit",
        payload.len()
      )));
    }
    let mut datagram = Vec::with_capacity(8 + channel.len() + 1 + payload.len());
    datagram.extend_from_slice(&MAGIC_SHORT.to_be_bytes());
    datagram.extend_from_slice(&self.sequence.to_be_bytes());
    self.sequence = self.sequence.wrapping_add(1);
    datagram.extend_from_slice(channel.as_bytes());
    datagram.push(0);
    datagram.extend_from_slice(payload);
    self.socket.send_to(&datagram, self.group)?;
    Ok(())
  }
}

/// In-process bus: events published through a [`LoopbackPublisher`] arrive
/// at the paired `LoopbackBus`.
#[derive(Debug)]
pub struct LoopbackBus {
  tx: mpsc::Sender<Event>,
  rx: mpsc::Receiver<Event>,
  pattern: Option<Regex>,
}

impl LoopbackBus {
  #[allow(clippy::new_without_default)]
  pub fn new() -> Self {
    let (tx, rx) = mpsc::channel();
    Self {
      tx,
      rx,
      pattern: None,
    }
  }

  /// A cloneable handle that feeds this bus.
  pub fn publisher(&self) -> LoopbackPublisher {
    LoopbackPublisher {
      tx: self.tx.clone(),
    }
  }
}

impl LcmBus for LoopbackBus {
  fn subscribe(&mut self, pattern: &str) -> Result<(), ProxyError> {
    self.pattern = Some(compile_pattern(pattern)?);
    Ok(())
  }

  fn poll(&mut self, timeout: Duration) -> Result<Option<Event>, ProxyError> {
    match self.rx.recv_timeout(timeout) {
      Ok(event) => {
        let matched = self
          .pattern
          .as_ref()
          .map(|re| re.is_match(&event.channel))
          .unwrap_or(true);
        Ok(matched.then_some(event))
      }
      Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
      Err(mpsc::RecvTimeoutError::Disconnected) => {
        Err(ProxyError::Bus("loopback publisher disconnected".to_string()))
      }
    }
  }

  fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<(), ProxyError> {
    self
      .tx
      .send(Event::new(channel, Bytes::copy_from_slice(payload)))
      .map_err(|_| ProxyError::Bus("loopback receiver dropped".to_string()))
  }
}

#[derive(Debug, Clone)]
pub struct LoopbackPublisher {
  tx: mpsc::Sender<Event>,
}

impl LoopbackPublisher {
  pub fn publish(&self, channel: &str, payload: impl Into<Bytes>) -> Result<(), ProxyError> {
    self
      .tx
      .send(Event::new(channel, payload.into()))
      .map_err(|_| ProxyError::Bus("loopback receiver dropped".to_string()))
  }
}
