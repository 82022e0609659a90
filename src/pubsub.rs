//! Fan-out from the single LCM consumer to per-client observers.
//!
//! The republisher owns the only upstream subscription and must never
//! stall, no matter how slow any client is: observer mailboxes are bounded
//! and drop their oldest entry when full, enqueueing never blocks, and
//! payload buffers are shared by reference across every mailbox.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use regex::Regex;
use smallvec::SmallVec;

use crate::bus::LcmBus;
use crate::errors::ProxyError;

/// Default bound for observer mailboxes.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

/// How long the consumer thread blocks in the bus between stop-flag checks.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// One message as it travels through the fan-out: channel name plus the
/// untouched payload bytes.
#[derive(Debug, Clone)]
pub struct Event {
  pub channel: String,
  pub payload: Bytes,
}

impl Event {
  pub fn new(channel: &str, payload: Bytes) -> Self {
    Self {
      channel: channel.to_string(),
      payload,
    }
  }
}

/// Per-client mailbox with a channel-name filter.
///
/// The queue is a bounded FIFO; when a slow consumer lets it fill up, the
/// oldest event is discarded in favor of the new one. Clients trade
/// completeness for freshness; the producer is never blocked.
#[derive(Debug)]
pub struct Observer {
  queue: Mutex<VecDeque<Event>>,
  capacity: usize,
  filter: Option<Regex>,
  enqueued: AtomicU64,
  dequeued: AtomicU64,
  dropped: AtomicU64,
  processed: AtomicU64,
}

impl Observer {
  /// Build an observer with the default mailbox bound.
  ///
  /// A malformed regex is reported once here; such an observer matches
  /// nothing rather than erroring on every dispatch.
  pub fn new(channel_regex: &str) -> Arc<Self> {
    Self::with_capacity(channel_regex, DEFAULT_MAILBOX_CAPACITY)
  }

  pub fn with_capacity(channel_regex: &str, capacity: usize) -> Arc<Self> {
    let filter = match Regex::new(&format!("^(?:{})$", channel_regex)) {
      Ok(re) => Some(re),
      Err(e) => {
        log::warn!("invalid channel regex '{}': {}", channel_regex, e);
        None
      }
    };
    Arc::new(Self {
      queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
      capacity: capacity.max(1),
      filter,
      enqueued: AtomicU64::new(0),
      dequeued: AtomicU64::new(0),
      dropped: AtomicU64::new(0),
      processed: AtomicU64::new(0),
    })
  }

  /// Whether this observer wants events from `channel` (full match).
  pub fn matches(&self, channel: &str) -> bool {
    self
      .filter
      .as_ref()
      .map(|re| re.is_match(channel))
      .unwrap_or(false)
  }

  /// Enqueue without blocking, discarding the oldest entry when full.
  pub fn handle(&self, event: Event) {
    let mut queue = self.queue.lock().unwrap();
    if queue.len() >= self.capacity {
      queue.pop_front();
      self.dropped.fetch_add(1, Ordering::Relaxed);
    }
    queue.push_back(event);
    self.enqueued.fetch_add(1, Ordering::Relaxed);
  }

  /// Non-blocking dequeue; `None` means the mailbox is currently empty.
  pub fn get(&self) -> Option<Event> {
    let event = self.queue.lock().unwrap().pop_front();
    if event.is_some() {
      self.dequeued.fetch_add(1, Ordering::Relaxed);
    }
    event
  }

  /// Advisory completion mark for the last dequeued event.
  pub fn task_done(&self) {
    self.processed.fetch_add(1, Ordering::Relaxed);
  }

  pub fn enqueued(&self) -> u64 {
    self.enqueued.load(Ordering::Relaxed)
  }

  pub fn dequeued(&self) -> u64 {
    self.dequeued.load(Ordering::Relaxed)
  }

  pub fn dropped(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }

  pub fn processed(&self) -> u64 {
    self.processed.load(Ordering::Relaxed)
  }
}

/// Owns the upstream LCM subscription on a dedicated OS thread and fans
/// incoming events out to every matching [`Observer`].
///
/// [`Republisher::inject`] dispatches a synthetic event through the same
/// path, which is how the spy's virtual channel reaches clients.
pub struct Republisher {
  pattern: String,
  bus: Mutex<Option<Box<dyn LcmBus>>>,
  subscribers: Arc<Mutex<Vec<Arc<Observer>>>>,
  running: Arc<AtomicBool>,
  thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Republisher {
  pub fn new(bus: Box<dyn LcmBus>, pattern: &str) -> Arc<Self> {
    Arc::new(Self {
      pattern: pattern.to_string(),
      bus: Mutex::new(Some(bus)),
      subscribers: Arc::new(Mutex::new(Vec::new())),
      running: Arc::new(AtomicBool::new(false)),
      thread: Mutex::new(None),
    })
  }

  /// Spawn the consumer thread. Must be called at most once.
  pub fn start(&self) -> Result<(), ProxyError> {
    let mut bus = self
      .bus
      .lock()
      .unwrap()
      .take()
      .ok_or_else(|| ProxyError::Bus("republisher already started".to_string()))?;
    bus.subscribe(&self.pattern)?;

    self.running.store(true, Ordering::Release);
    let running = Arc::clone(&self.running);
    let subscribers = Arc::clone(&self.subscribers);
    let pattern = self.pattern.clone();
    let handle = thread::Builder::new()
      .name("lcm-republisher".to_string())
      .spawn(move || {
        log::debug!("republisher consuming channel pattern '{}'", pattern);
        while running.load(Ordering::Acquire) {
          match bus.poll(POLL_TIMEOUT) {
            Ok(Some(event)) => dispatch(&subscribers, event),
            Ok(None) => {}
            Err(e) => {
              log::warn!("LCM receive error: {}", e);
              thread::sleep(POLL_TIMEOUT);
            }
          }
        }
        log::debug!("republisher stopped");
      })?;
    *self.thread.lock().unwrap() = Some(handle);
    Ok(())
  }

  /// Request the consumer thread to exit and wait for it.
  ///
  /// The thread re-checks the flag after every bounded poll, so this
  /// returns within roughly one poll timeout. Safe to call more than once.
  pub fn stop(&self) {
    self.running.store(false, Ordering::Release);
    if let Some(handle) = self.thread.lock().unwrap().take() {
      let _ = handle.join();
    }
  }

  /// Add an observer to the fan-out. Callable from any thread, including
  /// concurrently with dispatch.
  pub fn subscribe(&self, observer: Arc<Observer>) {
    self.subscribers.lock().unwrap().push(observer);
  }

  /// Remove an observer. Events already dispatched to its mailbox remain
  /// there; no further events arrive.
  pub fn unsubscribe(&self, observer: &Arc<Observer>) {
    self
      .subscribers
      .lock()
      .unwrap()
      .retain(|s| !Arc::ptr_eq(s, observer));
  }

  /// Number of currently subscribed observers.
  pub fn subscriber_count(&self) -> usize {
    self.subscribers.lock().unwrap().len()
  }

  /// Dispatch a synthetic event as if it had arrived from the bus.
  pub fn inject(&self, channel: &str, payload: Bytes) {
    dispatch(&self.subscribers, Event::new(channel, payload));
  }
}

impl std::fmt::Debug for Republisher {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Republisher")
      .field("pattern", &self.pattern)
      .field("subscribers", &self.subscriber_count())
      .field("running", &self.running.load(Ordering::Relaxed))
      .finish()
  }
}

impl Drop for Republisher {
  fn drop(&mut self) {
    self.stop();
  }
}

/// Deliver one event to every matching observer.
///
/// The subscriber list is snapshotted under the lock and traversed outside
/// it, so subscribe/unsubscribe never wait on mailbox delivery and an
/// observer unsubscribed before dispatch began sees nothing.
fn dispatch(subscribers: &Mutex<Vec<Arc<Observer>>>, event: Event) {
  let snapshot: SmallVec<[Arc<Observer>; 8]> =
    subscribers.lock().unwrap().iter().cloned().collect();
  for observer in snapshot {
    if observer.matches(&event.channel) {
      observer.handle(event.clone());
    }
  }
}
