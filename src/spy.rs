//! Per-channel telemetry, republished on a virtual channel.
//!
//! The spy owns its own bus subscription so its accounting is independent
//! of any client's filter. A 1 Hz tick thread closes each window, computes
//! rate/bandwidth/jitter, and injects the full stats table through the
//! republisher on [`SPY_CHANNEL`], so observers receive it like any other
//! traffic.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::bus::LcmBus;
use crate::errors::ProxyError;
use crate::pubsub::Republisher;
use crate::types::{packages, TypeRegistry, Value};
use crate::wire::to_hex;

/// Reserved name of the virtual stats channel.
///
/// Traffic arriving on this name from the real bus is not special-cased;
/// the injected stats frames are distinguished only by their fingerprint.
pub const SPY_CHANNEL: &str = "LWS_LCM_SPY";

const TICK_PERIOD: Duration = Duration::from_secs(1);
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Rolling metrics for one channel.
///
/// Cumulative counters (`num_msgs`, `undecodable`) persist for the process
/// lifetime; the interval extremes and byte count reset every window.
#[derive(Debug)]
pub(crate) struct ChannelData {
  last_type: Option<String>,
  num_msgs: i64,
  undecodable: i64,

  hz: f64,
  bandwidth: f64,
  min_interval: Option<f64>,
  max_interval: f64,

  window_start_ns: u64,
  window_min_ns: u64,
  window_max_ns: u64,
  window_bytes: u64,
  window_last_count: i64,
  prev_arrival_ns: Option<u64>,
}

impl ChannelData {
  fn new(now_ns: u64) -> Self {
    Self {
      last_type: None,
      num_msgs: 0,
      undecodable: 0,
      hz: 0.0,
      bandwidth: 0.0,
      min_interval: None,
      max_interval: 0.0,
      window_start_ns: now_ns,
      window_min_ns: u64::MAX,
      window_max_ns: 0,
      window_bytes: 0,
      window_last_count: 0,
      prev_arrival_ns: None,
    }
  }

  pub(crate) fn message_received(
    &mut self,
    type_name: &str,
    len_data: usize,
    decoded: bool,
    now_ns: u64,
  ) {
    self.num_msgs += 1;
    self.last_type = Some(type_name.to_string());
    if !decoded {
      self.undecodable += 1;
    }

    // The first arrival only seeds the timestamp; intervals start with the
    // second message.
    if let Some(prev) = self.prev_arrival_ns {
      let interval = now_ns.saturating_sub(prev);
      self.window_min_ns = self.window_min_ns.min(interval);
      self.window_max_ns = self.window_max_ns.max(interval);
    }
    self.prev_arrival_ns = Some(now_ns);
    self.window_bytes += len_data as u64;
  }

  /// Close the current window: derive rate and bandwidth from the counter
  /// deltas, latch the interval extremes, and reset the rolling state.
  pub(crate) fn update_window(&mut self, now_ns: u64) {
    let new_msgs = self.num_msgs - self.window_last_count;
    self.window_last_count = self.num_msgs;
    let dt_secs = now_ns.saturating_sub(self.window_start_ns) as f64 / 1e9;
    self.window_start_ns = now_ns;

    self.hz = if dt_secs > 0.0 {
      new_msgs as f64 / dt_secs
    } else {
      0.0
    };
    self.bandwidth = if dt_secs > 0.0 {
      self.window_bytes as f64 / dt_secs
    } else {
      0.0
    };
    self.window_bytes = 0;

    self.min_interval = (self.window_min_ns != u64::MAX)
      .then(|| self.window_min_ns as f64 / 1e9);
    self.max_interval = self.window_max_ns as f64 / 1e9;
    self.window_min_ns = u64::MAX;
    self.window_max_ns = 0;
  }

  /// Materialize this channel's `channel_stats` record.
  pub(crate) fn report(&self, channel: &str) -> Value {
    let inv_hz = if self.hz > 0.0 {
      1.0 / self.hz
    } else {
      f64::INFINITY
    };
    let jitter = match self.min_interval {
      Some(min) => self.max_interval - min,
      None => 0.0,
    };
    Value::Struct(vec![
      ("channel".into(), Value::String(channel.to_string())),
      (
        "type".into(),
        Value::String(self.last_type.clone().unwrap_or_default()),
      ),
      ("num_msgs".into(), Value::Int(self.num_msgs)),
      ("hz".into(), Value::Float(self.hz)),
      ("inv_hz".into(), Value::Float(inv_hz)),
      ("jitter".into(), Value::Float(jitter)),
      ("bandwidth".into(), Value::Float(self.bandwidth)),
      ("undecodable".into(), Value::Int(self.undecodable)),
    ])
  }

  #[cfg(test)]
  fn hz(&self) -> f64 {
    self.hz
  }
}

type ChannelTable = Arc<Mutex<BTreeMap<String, ChannelData>>>;

/// The telemetry collector: bus thread plus 1 Hz aggregation thread.
#[derive(Debug)]
pub struct Spy {
  channels: ChannelTable,
  running: Arc<AtomicBool>,
  bus_thread: Mutex<Option<thread::JoinHandle<()>>>,
  tick_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Spy {
  /// Subscribe to `pattern` on the given bus and start collecting.
  pub fn start(
    registry: Arc<TypeRegistry>,
    republisher: Arc<Republisher>,
    mut bus: Box<dyn LcmBus>,
    pattern: &str,
  ) -> Result<Self, ProxyError> {
    bus.subscribe(pattern)?;

    let channels: ChannelTable = Arc::new(Mutex::new(BTreeMap::new()));
    let running = Arc::new(AtomicBool::new(true));
    let epoch = Instant::now();

    let bus_thread = {
      let channels = Arc::clone(&channels);
      let running = Arc::clone(&running);
      let registry = Arc::clone(&registry);
      thread::Builder::new()
        .name("lcm-spy".to_string())
        .spawn(move || {
          while running.load(Ordering::Acquire) {
            match bus.poll(POLL_TIMEOUT) {
              Ok(Some(event)) => {
                record(&channels, &registry, &event.channel, &event.payload, now_ns(epoch));
              }
              Ok(None) => {}
              Err(e) => {
                log::warn!("spy receive error: {}", e);
                thread::sleep(POLL_TIMEOUT);
              }
            }
          }
        })?
    };

    let tick_thread = {
      let channels = Arc::clone(&channels);
      let running = Arc::clone(&running);
      thread::Builder::new()
        .name("lcm-spy-tick".to_string())
        .spawn(move || {
          while running.load(Ordering::Acquire) {
            thread::sleep(TICK_PERIOD);
            if !running.load(Ordering::Acquire) {
              break;
            }
            let now = now_ns(epoch);
            let stats = {
              let mut table = channels.lock().unwrap();
              for data in table.values_mut() {
                data.update_window(now);
              }
              stats_value(&table)
            };
            match packages::channel_stats_list().encode(&stats) {
              Ok(encoded) => republisher.inject(SPY_CHANNEL, Bytes::from(encoded)),
              Err(e) => log::error!("failed to encode channel stats: {}", e),
            }
          }
        })?
    };

    log::info!(
      "spy collecting channel pattern '{}', stats on virtual channel '{}'",
      pattern,
      SPY_CHANNEL
    );
    Ok(Self {
      channels,
      running,
      bus_thread: Mutex::new(Some(bus_thread)),
      tick_thread: Mutex::new(Some(tick_thread)),
    })
  }

  /// Current stats table as a `channel_stats_list` value.
  pub fn stats(&self) -> Value {
    stats_value(&self.channels.lock().unwrap())
  }

  /// Stop both threads. Bounded by one tick period plus one poll timeout.
  pub fn stop(&self) {
    self.running.store(false, Ordering::Release);
    for slot in [&self.bus_thread, &self.tick_thread] {
      if let Some(handle) = slot.lock().unwrap().take() {
        let _ = handle.join();
      }
    }
  }
}

impl Drop for Spy {
  fn drop(&mut self) {
    self.stop();
  }
}

fn now_ns(epoch: Instant) -> u64 {
  epoch.elapsed().as_nanos() as u64
}

fn record(
  channels: &ChannelTable,
  registry: &TypeRegistry,
  channel: &str,
  payload: &[u8],
  now_ns: u64,
) {
  // Decoded type name, or the raw fingerprint when the registry cannot
  // place the payload.
  let decoded = registry.decode(payload);
  let type_name = match &decoded {
    Some((descriptor, _)) => descriptor.name().to_string(),
    None => to_hex(&payload[..payload.len().min(8)]),
  };

  let mut table = channels.lock().unwrap();
  let data = table
    .entry(channel.to_string())
    .or_insert_with(|| ChannelData::new(now_ns));
  data.message_received(&type_name, payload.len(), decoded.is_some(), now_ns);
}

fn stats_value(table: &BTreeMap<String, ChannelData>) -> Value {
  let records: Vec<Value> = table
    .iter()
    .map(|(channel, data)| data.report(channel))
    .collect();
  Value::Struct(vec![
    ("num_channels".into(), Value::Int(records.len() as i64)),
    ("channels".into(), Value::List(records)),
  ])
}

#[cfg(test)]
mod tests {
  use super::*;

  const MS: u64 = 1_000_000;

  #[test]
  fn steady_stream_yields_rate_and_low_jitter() {
    // 10 Hz for 3 simulated seconds, windows closed once per second.
    let mut data = ChannelData::new(0);
    let mut now = 0u64;
    let mut frames = 0;
    for window in 1..=3u64 {
      while now < window * 1000 * MS {
        now += 100 * MS;
        data.message_received("image_t", 512, true, now);
        frames += 1;
      }
      data.update_window(window * 1000 * MS);
      assert!((data.hz() - 10.0).abs() < 1.0, "hz was {}", data.hz());
    }
    assert_eq!(data.num_msgs, frames);

    let report = data.report("Q");
    let jitter = report.get("jitter").unwrap().as_f64().unwrap();
    assert!(jitter >= 0.0);
    assert!(jitter < 0.05, "jitter was {}", jitter);
    assert_eq!(report.get("num_msgs").unwrap().as_i64(), Some(30));
    let bandwidth = report.get("bandwidth").unwrap().as_f64().unwrap();
    assert!((bandwidth - 5120.0).abs() < 1.0);
  }

  #[test]
  fn idle_window_reports_zero_hz_and_infinite_inv_hz() {
    let mut data = ChannelData::new(0);
    data.message_received("x", 10, true, 10 * MS);
    data.update_window(1000 * MS);
    assert!(data.hz() > 0.0);

    // No traffic in the second window.
    data.update_window(2000 * MS);
    let report = data.report("A");
    assert_eq!(report.get("hz").unwrap().as_f64(), Some(0.0));
    assert_eq!(
      report.get("inv_hz").unwrap().as_f64(),
      Some(f64::INFINITY)
    );
    assert_eq!(report.get("jitter").unwrap().as_f64(), Some(0.0));
    assert_eq!(report.get("bandwidth").unwrap().as_f64(), Some(0.0));
  }

  #[test]
  fn first_arrival_seeds_without_an_interval() {
    let mut data = ChannelData::new(0);
    data.message_received("x", 1, true, 500 * MS);
    data.update_window(1000 * MS);
    // One message: no interval sample, so jitter stays zero.
    let report = data.report("A");
    assert_eq!(report.get("jitter").unwrap().as_f64(), Some(0.0));

    // Later arrivals produce real intervals: 600 ms (500 -> 1100) and
    // 300 ms (1100 -> 1400), so the window jitter is 0.3 s.
    data.message_received("x", 1, true, 1100 * MS);
    data.message_received("x", 1, true, 1400 * MS);
    data.update_window(2000 * MS);
    let report = data.report("A");
    let jitter = report.get("jitter").unwrap().as_f64().unwrap();
    assert!((jitter - 0.3).abs() < 1e-9, "jitter was {}", jitter);
  }

  #[test]
  fn undecodable_messages_are_counted() {
    let mut data = ChannelData::new(0);
    data.message_received("0102030405060708", 16, false, MS);
    data.message_received("image_t", 16, true, 2 * MS);
    data.message_received("0102030405060708", 16, false, 3 * MS);
    let report = data.report("A");
    assert_eq!(report.get("undecodable").unwrap().as_i64(), Some(2));
    assert_eq!(report.get("num_msgs").unwrap().as_i64(), Some(3));
    assert_eq!(report.get("type").unwrap().as_str(), Some("0102030405060708"));
  }

  #[test]
  fn stats_table_counts_channels() {
    let mut table = BTreeMap::new();
    table.insert("A".to_string(), ChannelData::new(0));
    table.insert("B".to_string(), ChannelData::new(0));
    let stats = stats_value(&table);
    assert_eq!(stats.get("num_channels").unwrap().as_i64(), Some(2));

    // The table encodes cleanly as a channel_stats_list payload.
    let encoded = packages::channel_stats_list().encode(&stats).unwrap();
    assert_eq!(&encoded[..8], &packages::channel_stats_list().fingerprint());
  }
}
