// In-memory transport of the simulation bus.
//
// A route per topic carries tagged items from writer endpoints to reader
// endpoints. Readers keep their items in a locked queue and learn about new
// arrivals through a mio channel registered in the reception wait-set; the
// wire-level transport of a deployment hides behind exactly this seam.

use std::{
  collections::{HashMap, VecDeque},
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Condvar, Mutex, OnceLock, Weak,
  },
  time::{Duration, Instant},
};

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio_extras::channel as mio_channel;

use super::stream_type::StreamType;
use crate::time::Timestamp;

/// One data sample: opaque payload plus source timestamp and a write counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSample {
  pub payload: Bytes,
  pub source_time: Timestamp,
  pub counter: u32,
}

impl DataSample {
  pub fn new(payload: impl Into<Bytes>, source_time: Timestamp) -> Self {
    DataSample {
      payload: payload.into(),
      source_time,
      counter: 0,
    }
  }
}

/// What a reader receives: either a sample or a stream-type update.
#[derive(Debug, Clone)]
pub enum ReaderItem {
  Sample(DataSample),
  StreamType(StreamType),
}

#[derive(Debug)]
pub(crate) struct QueuedItem {
  pub item: ReaderItem,
  /// Network-layer arrival order across both endpoints of a topic.
  pub arrival: u64,
  pub source_time: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndpointKind {
  Sample,
  StreamType,
}

type ItemQueue = Mutex<VecDeque<QueuedItem>>;

struct PortSlot {
  id: u64,
  kind: EndpointKind,
  queue: Weak<ItemQueue>,
  notify: mio_channel::Sender<()>,
  capacity: usize, // 0 = unbounded
}

/// Reader-side endpoint: a bounded item queue plus the wait-set wake channel.
pub(crate) struct ReaderEndpoint {
  port_id: u64,
  queue: Arc<ItemQueue>,
  notify_receiver: mio_channel::Receiver<()>,
  route: Arc<TopicRoute>,
}

impl ReaderEndpoint {
  /// Process-wide endpoint id, stable for the endpoint's lifetime.
  pub fn port_id(&self) -> u64 {
    self.port_id
  }

  pub fn try_pop(&self) -> Option<QueuedItem> {
    self.queue.lock().unwrap().pop_front()
  }

  /// Arrival order and source time of the front item, without consuming it.
  pub fn peek_front(&self) -> Option<(u64, Timestamp)> {
    self
      .queue
      .lock()
      .unwrap()
      .front()
      .map(|q| (q.arrival, q.source_time))
  }

  pub fn len(&self) -> usize {
    self.queue.lock().unwrap().len()
  }

  pub fn is_empty(&self) -> bool {
    self.queue.lock().unwrap().is_empty()
  }

  /// Consumes pending wake tokens. Call after draining the item queue.
  pub fn drain_notifications(&self) {
    while self.notify_receiver.try_recv().is_ok() {}
  }

  pub fn register(
    &self,
    poll: &mio_06::Poll,
    token: mio_06::Token,
  ) -> std::io::Result<()> {
    poll.register(
      &self.notify_receiver,
      token,
      mio_06::Ready::readable(),
      mio_06::PollOpt::edge(),
    )
  }
}

impl Drop for ReaderEndpoint {
  fn drop(&mut self) {
    self.route.remove_port(self.port_id);
  }
}

/// Writer-side endpoint.
pub(crate) struct WriterEndpoint {
  kind: EndpointKind,
  route: Arc<TopicRoute>,
}

impl WriterEndpoint {
  pub fn write(&self, item: ReaderItem, source_time: Timestamp) {
    self.route.deliver(self.kind, item, source_time);
  }
}

// Endpoint ids are process-wide so the reception wait-set can track
// registrations across topics.
static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Per-topic delivery fabric shared by all participants of a partition.
pub(crate) struct TopicRoute {
  topic_name: String,
  ports: Mutex<Vec<PortSlot>>,
  arrival_counter: AtomicU64,
  sample_write_counter: AtomicU64,
  latest_stream_type: Mutex<Option<StreamType>>,
  writer_count: Mutex<usize>,
  writer_condvar: Condvar,
}

impl TopicRoute {
  fn new(topic_name: &str) -> Self {
    TopicRoute {
      topic_name: topic_name.to_string(),
      ports: Mutex::new(Vec::new()),
      arrival_counter: AtomicU64::new(1),
      sample_write_counter: AtomicU64::new(1),
      latest_stream_type: Mutex::new(None),
      writer_count: Mutex::new(0),
      writer_condvar: Condvar::new(),
    }
  }

  pub fn topic_name(&self) -> &str {
    &self.topic_name
  }

  /// Creates a reader endpoint. A stream-type endpoint immediately receives
  /// the last known stream type, so late joiners see the current shape
  /// before any sample.
  pub fn create_reader_endpoint(
    self: &Arc<Self>,
    kind: EndpointKind,
    capacity: usize,
  ) -> ReaderEndpoint {
    let queue = Arc::new(Mutex::new(VecDeque::new()));
    let (notify_sender, notify_receiver) = mio_channel::channel::<()>();
    let port_id = NEXT_PORT_ID.fetch_add(1, Ordering::SeqCst);

    if kind == EndpointKind::StreamType {
      if let Some(stream_type) = self.latest_stream_type.lock().unwrap().clone() {
        queue.lock().unwrap().push_back(QueuedItem {
          item: ReaderItem::StreamType(stream_type),
          arrival: self.arrival_counter.fetch_add(1, Ordering::SeqCst),
          source_time: Timestamp::ZERO,
        });
        let _ = notify_sender.send(());
      }
    }

    self.ports.lock().unwrap().push(PortSlot {
      id: port_id,
      kind,
      queue: Arc::downgrade(&queue),
      notify: notify_sender,
      capacity,
    });

    ReaderEndpoint {
      port_id,
      queue,
      notify_receiver,
      route: Arc::clone(self),
    }
  }

  pub fn create_writer_endpoint(self: &Arc<Self>, kind: EndpointKind) -> WriterEndpoint {
    WriterEndpoint {
      kind,
      route: Arc::clone(self),
    }
  }

  fn remove_port(&self, port_id: u64) {
    self.ports.lock().unwrap().retain(|p| p.id != port_id);
  }

  /// Delivers one item to every matching reader endpoint. Bounded queues
  /// keep the latest items: the oldest unread one is replaced.
  fn deliver(&self, kind: EndpointKind, item: ReaderItem, source_time: Timestamp) {
    let mut item = item;
    if let ReaderItem::Sample(sample) = &mut item {
      sample.counter = self.sample_write_counter.fetch_add(1, Ordering::SeqCst) as u32;
    }
    if let ReaderItem::StreamType(stream_type) = &item {
      *self.latest_stream_type.lock().unwrap() = Some(stream_type.clone());
    }

    let arrival = self.arrival_counter.fetch_add(1, Ordering::SeqCst);
    let mut ports = self.ports.lock().unwrap();
    ports.retain(|port| {
      if port.kind != kind {
        return true;
      }
      match port.queue.upgrade() {
        Some(queue) => {
          {
            let mut queue = queue.lock().unwrap();
            if port.capacity > 0 && queue.len() >= port.capacity {
              trace!(
                "reader queue of topic '{}' full, replacing oldest item",
                self.topic_name
              );
              queue.pop_front();
            }
            queue.push_back(QueuedItem {
              item: item.clone(),
              arrival,
              source_time,
            });
          }
          let _ = port.notify.send(());
          true
        }
        None => false, // endpoint gone, prune the port
      }
    });
  }

  pub fn attach_writer(&self) {
    let mut count = self.writer_count.lock().unwrap();
    *count += 1;
    self.writer_condvar.notify_all();
  }

  pub fn detach_writer(&self) {
    let mut count = self.writer_count.lock().unwrap();
    *count = count.saturating_sub(1);
  }

  pub fn writer_count(&self) -> usize {
    *self.writer_count.lock().unwrap()
  }

  /// Blocks until at least one writer is attached, or the timeout elapses.
  pub fn wait_for_writer(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut count = self.writer_count.lock().unwrap();
    while *count == 0 {
      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        return false;
      }
      let (guard, _) = self
        .writer_condvar
        .wait_timeout(count, remaining)
        .unwrap();
      count = guard;
    }
    true
  }

  pub fn latest_stream_type(&self) -> Option<StreamType> {
    self.latest_stream_type.lock().unwrap().clone()
  }
}

/// All routes of one `(domain, system)` partition.
pub(crate) struct SimDomain {
  routes: Mutex<HashMap<String, Arc<TopicRoute>>>,
}

static SIM_DOMAINS: OnceLock<Mutex<HashMap<String, Arc<SimDomain>>>> = OnceLock::new();

impl SimDomain {
  /// Process-wide partition lookup. Different systems on the same domain id
  /// stay separated, mirroring the domain-tag behaviour of the deployment
  /// transport.
  pub fn for_partition(domain_id: u32, system_name: &str) -> Arc<SimDomain> {
    let key = format!("{domain_id}/{system_name}");
    let domains = SIM_DOMAINS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut domains = domains.lock().unwrap();
    Arc::clone(
      domains
        .entry(key)
        .or_insert_with(|| Arc::new(SimDomain::new())),
    )
  }

  pub fn new() -> Self {
    SimDomain {
      routes: Mutex::new(HashMap::new()),
    }
  }

  pub fn route(&self, topic_name: &str) -> Arc<TopicRoute> {
    let mut routes = self.routes.lock().unwrap();
    Arc::clone(
      routes
        .entry(topic_name.to_string())
        .or_insert_with(|| Arc::new(TopicRoute::new(topic_name))),
    )
  }
}
