// Logical reader of one topic: a sample endpoint plus a stream-type
// endpoint, popped in network arrival order.
//
// A stream-type arrival that flips the topic's size class first drains the
// samples still pending on the old endpoint, then recreates the sample
// endpoint under the new profile and asks the reception loop to rebuild its
// wait-set.

use std::sync::{
  atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
  Arc, Mutex, Weak,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::{
  topic::StreamItemTopic,
  transport::{DataSample, EndpointKind, ReaderEndpoint, ReaderItem},
};
use crate::{guard::GuardTrigger, sim_bus::stream_type::StreamType, time::Timestamp};

/// Receiver callback of a logical reader.
pub trait DataReceiver: Send {
  fn on_stream_type(&mut self, stream_type: StreamType);
  fn on_sample(&mut self, sample: DataSample);
}

pub struct ReaderItemQueue {
  topic: Arc<StreamItemTopic>,
  queue_capacity: usize,
  // Both endpoints sit behind mutexes: the sample endpoint because it is
  // swapped on rebuild, the stream-type endpoint because its wake channel is
  // single-consumer.
  sample_endpoint: Mutex<ReaderEndpoint>,
  stream_type_endpoint: Mutex<ReaderEndpoint>,
  rebuild_count: AtomicUsize,
  collection: Weak<DataAccessCollection>,
}

enum FrontItem {
  None,
  Sample,
  StreamType,
}

impl ReaderItemQueue {
  pub(crate) fn new(
    topic: Arc<StreamItemTopic>,
    queue_capacity: usize,
    collection: &Weak<DataAccessCollection>,
  ) -> Arc<Self> {
    let sample_endpoint = topic
      .route()
      .create_reader_endpoint(EndpointKind::Sample, queue_capacity);
    let stream_type_endpoint = topic
      .route()
      .create_reader_endpoint(EndpointKind::StreamType, queue_capacity);
    Arc::new(ReaderItemQueue {
      topic,
      queue_capacity,
      sample_endpoint: Mutex::new(sample_endpoint),
      stream_type_endpoint: Mutex::new(stream_type_endpoint),
      rebuild_count: AtomicUsize::new(0),
      collection: collection.clone(),
    })
  }

  pub fn topic(&self) -> &Arc<StreamItemTopic> {
    &self.topic
  }

  /// Which endpoint holds the earlier item, by network arrival order.
  fn front(&self) -> FrontItem {
    let sample_front = self.sample_endpoint.lock().unwrap().peek_front();
    let stream_type_front = self.stream_type_endpoint.lock().unwrap().peek_front();
    match (sample_front, stream_type_front) {
      (None, None) => FrontItem::None,
      (Some(_), None) => FrontItem::Sample,
      (None, Some(_)) => FrontItem::StreamType,
      (Some((sample_arrival, _)), Some((stream_type_arrival, _))) => {
        if sample_arrival < stream_type_arrival {
          FrontItem::Sample
        } else {
          FrontItem::StreamType
        }
      }
    }
  }

  /// Delivers exactly one pending item to `receiver`. Returns true when an
  /// item was delivered.
  pub fn pop(&self, receiver: &mut dyn DataReceiver) -> bool {
    match self.front() {
      FrontItem::None => false,
      FrontItem::Sample => {
        let item = self.sample_endpoint.lock().unwrap().try_pop();
        match item {
          Some(queued) => {
            if let ReaderItem::Sample(sample) = queued.item {
              receiver.on_sample(sample);
            }
            true
          }
          None => false,
        }
      }
      FrontItem::StreamType => {
        let item = self.stream_type_endpoint.lock().unwrap().try_pop();
        match item {
          Some(queued) => {
            if let ReaderItem::StreamType(stream_type) = queued.item {
              receiver.on_stream_type(stream_type.clone());
              if self.topic.update_stream_type(&stream_type) {
                // Drain what the old endpoint still holds, then switch over.
                while self.pop(receiver) {}
                self.recreate_sample_endpoint();
              }
            }
            true
          }
          None => false,
        }
      }
    }
  }

  /// Source timestamp of the next pending item, without consuming it.
  pub fn front_time(&self) -> Option<Timestamp> {
    let sample_front = self.sample_endpoint.lock().unwrap().peek_front();
    let stream_type_front = self.stream_type_endpoint.lock().unwrap().peek_front();
    match (sample_front, stream_type_front) {
      (None, None) => None,
      (Some((_, time)), None) | (None, Some((_, time))) => Some(time),
      (Some((sample_arrival, sample_time)), Some((st_arrival, st_time))) => {
        if sample_arrival < st_arrival {
          Some(sample_time)
        } else {
          Some(st_time)
        }
      }
    }
  }

  pub fn has_data(&self) -> bool {
    !matches!(self.front(), FrontItem::None)
  }

  pub fn size(&self) -> usize {
    self.sample_endpoint.lock().unwrap().len()
  }

  pub fn capacity(&self) -> usize {
    self.queue_capacity
  }

  pub(crate) fn rebuild_count(&self) -> usize {
    self.rebuild_count.load(Ordering::SeqCst)
  }

  fn recreate_sample_endpoint(&self) {
    let new_endpoint = self
      .topic
      .route()
      .create_reader_endpoint(EndpointKind::Sample, self.queue_capacity);
    *self.sample_endpoint.lock().unwrap() = new_endpoint;
    self.rebuild_count.fetch_add(1, Ordering::SeqCst);
    debug!(
      "recreated sample endpoint of reader on topic '{}'",
      self.topic.topic_name()
    );
    if let Some(collection) = self.collection.upgrade() {
      collection.request_rebuild();
    }
  }

  /// Visits the two endpoints with their process-wide ids, e.g. for wait-set
  /// registration bookkeeping.
  pub(crate) fn with_endpoints<F>(&self, mut f: F) -> std::io::Result<()>
  where
    F: FnMut(u64, &ReaderEndpoint) -> std::io::Result<()>,
  {
    {
      let sample_endpoint = self.sample_endpoint.lock().unwrap();
      f(sample_endpoint.port_id(), &sample_endpoint)?;
    }
    let stream_type_endpoint = self.stream_type_endpoint.lock().unwrap();
    f(stream_type_endpoint.port_id(), &stream_type_endpoint)
  }

  pub(crate) fn drain_notifications(&self) {
    self.sample_endpoint.lock().unwrap().drain_notifications();
    self.stream_type_endpoint.lock().unwrap().drain_notifications();
  }
}

// ----------------------------------------------
// Data-triggered access registration
// ----------------------------------------------

pub(crate) struct DataAccessEntry {
  pub queue: Arc<ReaderItemQueue>,
  pub receiver: Arc<Mutex<Box<dyn DataReceiver>>>,
  pub in_flight: Arc<AtomicBool>,
}

impl Clone for DataAccessEntry {
  fn clone(&self) -> Self {
    DataAccessEntry {
      queue: Arc::clone(&self.queue),
      receiver: Arc::clone(&self.receiver),
      in_flight: Arc::clone(&self.in_flight),
    }
  }
}

/// Readers registered for data-triggered reception, owned by the simulation
/// bus independent of reader handle lifetimes.
pub struct DataAccessCollection {
  entries: Mutex<Vec<DataAccessEntry>>,
  generation: AtomicU64,
  guard: GuardTrigger,
}

impl DataAccessCollection {
  pub(crate) fn new(guard: GuardTrigger) -> Arc<Self> {
    Arc::new(DataAccessCollection {
      entries: Mutex::new(Vec::new()),
      generation: AtomicU64::new(1),
      guard,
    })
  }

  /// Registers `receiver` for `queue`, atomically replacing any previous
  /// receiver of the same reader. While this call holds the entry's receiver
  /// lock, reception cannot be mid-call into the replaced receiver; once it
  /// returns, the old receiver will not be invoked again.
  pub(crate) fn set_receiver(&self, queue: &Arc<ReaderItemQueue>, receiver: Box<dyn DataReceiver>) {
    let mut entries = self.entries.lock().unwrap();
    match entries
      .iter()
      .find(|e| Arc::ptr_eq(&e.queue, queue))
    {
      Some(entry) => {
        *entry.receiver.lock().unwrap() = receiver;
      }
      None => {
        entries.push(DataAccessEntry {
          queue: Arc::clone(queue),
          receiver: Arc::new(Mutex::new(receiver)),
          in_flight: Arc::new(AtomicBool::new(false)),
        });
        self.bump();
      }
    }
  }

  pub(crate) fn remove(&self, queue: &Arc<ReaderItemQueue>) {
    let mut entries = self.entries.lock().unwrap();
    let before = entries.len();
    entries.retain(|e| !Arc::ptr_eq(&e.queue, queue));
    if entries.len() != before {
      drop(entries);
      self.bump();
    }
  }

  pub(crate) fn snapshot(&self) -> Vec<DataAccessEntry> {
    self.entries.lock().unwrap().clone()
  }

  pub(crate) fn generation(&self) -> u64 {
    self.generation.load(Ordering::SeqCst)
  }

  /// Wakes the reception loop to rebuild its wait-set.
  pub(crate) fn request_rebuild(&self) {
    self.bump();
  }

  fn bump(&self) {
    self.generation.fetch_add(1, Ordering::SeqCst);
    self.guard.trigger();
  }
}

// ----------------------------------------------
// User-facing reader handle
// ----------------------------------------------

/// Handle to a logical reader. Dropping it deregisters the reader from
/// reception and detaches its endpoints.
pub struct DataReader {
  queue: Arc<ReaderItemQueue>,
  collection: Weak<DataAccessCollection>,
}

impl DataReader {
  pub(crate) fn new(queue: Arc<ReaderItemQueue>, collection: Weak<DataAccessCollection>) -> Self {
    DataReader {
      queue,
      collection,
    }
  }

  /// Manual polling: delivers at most one item. True when one was delivered.
  pub fn pop(&self, receiver: &mut dyn DataReceiver) -> bool {
    self.queue.pop(receiver)
  }

  /// Registers `receiver` for data-triggered reception, replacing any
  /// previous one.
  pub fn reset(&self, receiver: Box<dyn DataReceiver>) {
    if let Some(collection) = self.collection.upgrade() {
      collection.set_receiver(&self.queue, receiver);
    }
  }

  pub fn front_time(&self) -> Option<Timestamp> {
    self.queue.front_time()
  }

  pub fn size(&self) -> usize {
    self.queue.size()
  }

  pub fn capacity(&self) -> usize {
    self.queue.capacity()
  }

  pub(crate) fn queue(&self) -> &Arc<ReaderItemQueue> {
    &self.queue
  }
}

impl Drop for DataReader {
  fn drop(&mut self) {
    if let Some(collection) = self.collection.upgrade() {
      collection.remove(&self.queue);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    guard::GuardCondition,
    sim_bus::{qos::QosProfileStore, transport::SimDomain, writer::StreamItemDataWriter},
    time::Timestamp,
  };

  pub(crate) struct RecordingReceiver {
    pub samples: Vec<Vec<u8>>,
    pub stream_types: Vec<String>,
  }

  impl RecordingReceiver {
    pub fn new() -> Self {
      RecordingReceiver {
        samples: Vec::new(),
        stream_types: Vec::new(),
      }
    }
  }

  impl DataReceiver for RecordingReceiver {
    fn on_stream_type(&mut self, stream_type: StreamType) {
      self.stream_types.push(stream_type.meta_type().to_string());
    }
    fn on_sample(&mut self, sample: DataSample) {
      self.samples.push(sample.payload.to_vec());
    }
  }

  fn topic_with(stream_type: StreamType) -> (Arc<StreamItemTopic>, Arc<DataAccessCollection>) {
    let domain = SimDomain::new();
    let topic = StreamItemTopic::new(
      "t",
      stream_type,
      Arc::new(QosProfileStore::new()),
      domain.route("t"),
    );
    let guard = GuardCondition::new();
    let collection = DataAccessCollection::new(guard.trigger_handle());
    (topic, collection)
  }

  fn write_sample(writer: &StreamItemDataWriter, byte: u8, nanos: i64) {
    writer
      .write_sample(&DataSample::new(vec![byte], Timestamp::from_nanos(nanos)))
      .unwrap();
  }

  #[test]
  fn pop_delivers_in_arrival_order() {
    let (topic, collection) = topic_with(StreamType::raw());
    let reader = topic.create_data_reader(0, &Arc::downgrade(&collection));
    let writer = topic.create_data_writer(0);
    write_sample(&writer, 1, 10);
    write_sample(&writer, 2, 20);

    let mut receiver = RecordingReceiver::new();
    // Writer creation announced the stream type first.
    assert!(reader.pop(&mut receiver));
    assert_eq!(receiver.stream_types, vec!["raw".to_string()]);
    assert!(reader.pop(&mut receiver));
    assert!(reader.pop(&mut receiver));
    assert!(!reader.pop(&mut receiver));
    assert_eq!(receiver.samples, vec![vec![1u8], vec![2u8]]);
  }

  #[test]
  fn front_time_does_not_consume() {
    let (topic, collection) = topic_with(StreamType::raw());
    let reader = topic.create_data_reader(0, &Arc::downgrade(&collection));
    let writer = topic.create_data_writer(0);

    let mut receiver = RecordingReceiver::new();
    while reader.pop(&mut receiver) {} // consume the type announcement
    assert_eq!(reader.front_time(), None);

    write_sample(&writer, 7, 1234);
    assert_eq!(reader.front_time(), Some(Timestamp::from_nanos(1234)));
    assert_eq!(reader.front_time(), Some(Timestamp::from_nanos(1234)));
    assert!(reader.pop(&mut receiver));
    assert_eq!(reader.front_time(), None);
  }

  #[test]
  fn size_class_crossing_rebuilds_sample_endpoint_once() {
    // Reader and writer live in different participants: separate topic
    // objects over the same route, as in a real deployment.
    let domain = SimDomain::new();
    let store = Arc::new(QosProfileStore::new());
    let small = StreamType::plain_array("u8", 60_000);
    let writer_topic = StreamItemTopic::new("t", small.clone(), Arc::clone(&store), domain.route("t"));
    let reader_topic = StreamItemTopic::new("t", small, store, domain.route("t"));

    let guard = GuardCondition::new();
    let collection = DataAccessCollection::new(guard.trigger_handle());
    let reader = reader_topic.create_data_reader(0, &Arc::downgrade(&collection));
    let writer = writer_topic.create_data_writer(0);

    let mut receiver = RecordingReceiver::new();
    while reader.pop(&mut receiver) {}
    assert_eq!(reader.rebuild_count(), 0);

    // Cross the threshold; pending samples first, then the rebuild.
    write_sample(&writer, 1, 1);
    writer
      .write_stream_type(&StreamType::plain_array("u8", 80_000))
      .unwrap();
    write_sample(&writer, 2, 2);

    while reader.pop(&mut receiver) {}
    assert_eq!(reader.rebuild_count(), 1);
    assert_eq!(receiver.samples, vec![vec![1u8], vec![2u8]]);

    // Another declaration in the same class does not rebuild again.
    writer
      .write_stream_type(&StreamType::plain_array("u8", 90_000))
      .unwrap();
    while reader.pop(&mut receiver) {}
    assert_eq!(reader.rebuild_count(), 1);
  }

  #[test]
  fn receiver_reset_replaces_atomically() {
    let (topic, collection) = topic_with(StreamType::raw());
    let queue = topic.create_data_reader(0, &Arc::downgrade(&collection));
    let handle = DataReader::new(Arc::clone(&queue), Arc::downgrade(&collection));

    handle.reset(Box::new(RecordingReceiver::new()));
    assert_eq!(collection.snapshot().len(), 1);
    // Replacing keeps a single entry for the reader.
    handle.reset(Box::new(RecordingReceiver::new()));
    assert_eq!(collection.snapshot().len(), 1);

    drop(handle);
    assert!(collection.snapshot().is_empty());
  }
}
