// A topic of the simulation bus: the pair of sample and stream-type
// endpoints plus the QoS profiles currently selected for them.

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc, Mutex, Weak,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::{
  qos::QosProfileStore,
  reader::{DataAccessCollection, ReaderItemQueue},
  stream_type::StreamType,
  transport::TopicRoute,
  writer::StreamItemDataWriter,
};

pub struct StreamItemTopic {
  topic_name: String,
  route: Arc<TopicRoute>,
  stream_type: Mutex<StreamType>,
  sample_qos_profile: Mutex<String>,
  stream_type_qos_profile: Mutex<String>,
  qos_store: Arc<QosProfileStore>,
  fallback_warned: AtomicBool,
}

impl StreamItemTopic {
  pub fn new(
    topic_name: &str,
    stream_type: StreamType,
    qos_store: Arc<QosProfileStore>,
    route: Arc<TopicRoute>,
  ) -> Arc<Self> {
    let topic = StreamItemTopic {
      topic_name: topic_name.to_string(),
      route,
      stream_type: Mutex::new(stream_type.clone()),
      sample_qos_profile: Mutex::new(String::new()),
      stream_type_qos_profile: Mutex::new(String::new()),
      qos_store,
      fallback_warned: AtomicBool::new(false),
    };
    *topic.sample_qos_profile.lock().unwrap() = topic.select_sample_profile(&stream_type);
    *topic.stream_type_qos_profile.lock().unwrap() = topic
      .qos_store
      .find_stream_type_profile(&stream_type, topic_name);

    debug!(
      "using qos profile '{}' for stream type topic '{topic_name}'",
      topic.stream_type_qos_profile.lock().unwrap()
    );
    debug!(
      "using qos profile '{}' for sample topic '{topic_name}'",
      topic.sample_qos_profile.lock().unwrap()
    );
    Arc::new(topic)
  }

  fn select_sample_profile(&self, stream_type: &StreamType) -> String {
    let selection = self
      .qos_store
      .find_sample_profile(stream_type, &self.topic_name);
    if selection.is_fallback && !self.fallback_warned.swap(true, Ordering::SeqCst) {
      warn!(
        "meta type '{}' has no qos profile, using '{}' for topic '{}'",
        stream_type.meta_type(),
        selection.profile,
        self.topic_name
      );
    }
    selection.profile
  }

  pub fn topic_name(&self) -> &str {
    &self.topic_name
  }

  pub fn route(&self) -> &Arc<TopicRoute> {
    &self.route
  }

  pub fn current_stream_type(&self) -> StreamType {
    self.stream_type.lock().unwrap().clone()
  }

  pub fn sample_qos_profile(&self) -> String {
    self.sample_qos_profile.lock().unwrap().clone()
  }

  pub fn stream_type_qos_profile(&self) -> String {
    self.stream_type_qos_profile.lock().unwrap().clone()
  }

  /// Records a newly declared stream type. Returns true when the sample
  /// profile changed, which obliges readers and writers to rebuild their
  /// sample endpoints. At most one rebuild happens per size-class crossing:
  /// re-declaring a type in the same class changes nothing.
  pub fn update_stream_type(&self, stream_type: &StreamType) -> bool {
    let mut current = self.stream_type.lock().unwrap();
    if stream_type == &*current {
      return false;
    }
    *current = stream_type.clone();
    drop(current);

    let new_profile = self.select_sample_profile(stream_type);
    let mut sample_profile = self.sample_qos_profile.lock().unwrap();
    if new_profile != *sample_profile {
      debug!(
        "update qos profile for topic '{}' from '{}' to '{new_profile}'",
        self.topic_name, *sample_profile
      );
      *sample_profile = new_profile;
      return true;
    }
    false
  }

  /// Blocks until at least one writer is connected, or `timeout` elapses.
  pub fn wait_for_connecting_writers(&self, timeout: std::time::Duration) -> bool {
    self.route.wait_for_writer(timeout)
  }

  pub fn create_data_reader(
    self: &Arc<Self>,
    queue_capacity: usize,
    data_access_collection: &Weak<DataAccessCollection>,
  ) -> Arc<ReaderItemQueue> {
    ReaderItemQueue::new(Arc::clone(self), queue_capacity, data_access_collection)
  }

  pub fn create_data_writer(self: &Arc<Self>, _queue_capacity: usize) -> StreamItemDataWriter {
    let writer = StreamItemDataWriter::new(Arc::clone(self));
    // Announce the current shape so readers know it before the first sample.
    if let Err(e) = writer.write_stream_type(&self.current_stream_type()) {
      warn!(
        "initial stream type announcement on '{}' failed: {e}",
        self.topic_name
      );
    }
    writer
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sim_bus::transport::SimDomain;

  fn topic(stream_type: StreamType) -> Arc<StreamItemTopic> {
    let domain = SimDomain::new();
    StreamItemTopic::new(
      "t",
      stream_type,
      Arc::new(QosProfileStore::new()),
      domain.route("t"),
    )
  }

  #[test]
  fn same_type_redeclaration_is_no_change() {
    let topic = topic(StreamType::plain_array("u8", 1000));
    assert!(!topic.update_stream_type(&StreamType::plain_array("u8", 1000)));
  }

  #[test]
  fn crossing_size_class_changes_profile_once() {
    let topic = topic(StreamType::plain_array("u8", 60_000));
    let small_profile = topic.sample_qos_profile();

    // 60 000 -> 80 000 crosses the 63 000 byte threshold.
    assert!(topic.update_stream_type(&StreamType::plain_array("u8", 80_000)));
    let big_profile = topic.sample_qos_profile();
    assert_ne!(small_profile, big_profile);

    // Growing within the big class is a type change without a profile change.
    assert!(!topic.update_stream_type(&StreamType::plain_array("u8", 90_000)));

    // Explicit re-declaration below the threshold switches back.
    assert!(topic.update_stream_type(&StreamType::plain_array("u8", 100)));
    assert_eq!(topic.sample_qos_profile(), small_profile);
  }
}
