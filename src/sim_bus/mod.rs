// Simulation bus: typed topics carrying data samples plus stream-type
// updates, with a unified reception loop over all readers.

pub mod qos;
pub mod reader;
mod reception;
pub mod stream_type;
pub mod topic;
pub(crate) mod transport;
pub mod writer;

pub use qos::{QosProfileStore, TRANSPORT_LAYER_MAX_MESSAGE_SIZE};
pub use reader::{DataReader, DataReceiver};
pub use stream_type::StreamType;
pub use topic::StreamItemTopic;
pub use transport::{DataSample, ReaderItem};
pub use writer::StreamItemDataWriter;

use std::{
  collections::HashMap,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
  },
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use self::{
  reader::DataAccessCollection,
  transport::SimDomain,
};
use crate::{
  config::SimBusConfig,
  error::{Error, Result},
  guard::{GuardCondition, GuardTrigger},
  time::Timestamp,
};

/// The participant's simulation bus.
///
/// Readers and writers are created per signal name; reception is driven by
/// [`SimulationBus::start_blocking_reception`] on a thread of the caller's
/// choosing.
pub struct SimulationBus {
  participant_name: String,
  system_name: String,
  pub(crate) config: SimBusConfig,

  domain: Mutex<Option<Arc<SimDomain>>>,
  topics: Mutex<HashMap<String, Arc<StreamItemTopic>>>,
  data_access: Mutex<Option<Arc<DataAccessCollection>>>,
  qos_store: Arc<QosProfileStore>,

  guard: Mutex<Option<GuardCondition>>,
  guard_trigger: Mutex<Option<GuardTrigger>>,
  pub(crate) receiving: AtomicBool,
}

impl SimulationBus {
  pub fn new(participant_name: &str, system_name: &str, config: SimBusConfig) -> Self {
    SimulationBus {
      participant_name: participant_name.to_string(),
      system_name: system_name.to_string(),
      config,
      domain: Mutex::new(None),
      topics: Mutex::new(HashMap::new()),
      data_access: Mutex::new(None),
      qos_store: Arc::new(QosProfileStore::new()),
      guard: Mutex::new(None),
      guard_trigger: Mutex::new(None),
      receiving: AtomicBool::new(false),
    }
  }

  pub fn participant_name(&self) -> &str {
    &self.participant_name
  }

  // ---- component lifecycle hooks -------------------------------------

  /// Joins the bus partition and prepares the data-access collection.
  pub fn initialize(&self) -> Result<()> {
    if self.system_name.is_empty() {
      return Err(Error::Unsupported(
        "system name of the participant is empty".to_string(),
      ));
    }
    if self.participant_name.is_empty() {
      return Err(Error::Unsupported(
        "participant name is empty".to_string(),
      ));
    }
    let mut domain = self.domain.lock().unwrap();
    if domain.is_some() {
      return Err(Error::InvalidState(
        "simulation bus is already initialized".to_string(),
      ));
    }
    *domain = Some(SimDomain::for_partition(
      self.config.participant_domain,
      &self.system_name,
    ));
    drop(domain);

    let guard = GuardCondition::new();
    *self.guard_trigger.lock().unwrap() = Some(guard.trigger_handle());
    *self.data_access.lock().unwrap() = Some(DataAccessCollection::new(guard.trigger_handle()));
    *self.guard.lock().unwrap() = Some(guard);
    Ok(())
  }

  /// Leaves the partition. Readers and writers handed out earlier keep their
  /// routes alive but no longer take part in reception.
  pub fn deinitialize(&self) -> Result<()> {
    if self.receiving.load(Ordering::SeqCst) {
      return Err(Error::InvalidState(
        "simulation bus is still receiving".to_string(),
      ));
    }
    *self.data_access.lock().unwrap() = None;
    self.topics.lock().unwrap().clear();
    *self.guard.lock().unwrap() = None;
    *self.guard_trigger.lock().unwrap() = None;
    *self.domain.lock().unwrap() = None;
    Ok(())
  }

  pub fn is_supported(&self, stream_type: &StreamType) -> bool {
    matches!(
      stream_type.meta_type(),
      stream_type::META_TYPE_RAW
        | stream_type::META_TYPE_PLAIN
        | stream_type::META_TYPE_PLAIN_ARRAY
        | stream_type::META_TYPE_STRING
        | stream_type::META_TYPE_STRUCTURED
    )
  }

  // ---- reader / writer factories -------------------------------------

  /// Creates a reader for `name`. When the signal is configured as
  /// must-be-ready, creation blocks up to `datawriter_ready_timeout` for a
  /// matching writer; a signal whose writers never appear yields no handle
  /// and an error log.
  pub fn get_reader(
    &self,
    name: &str,
    stream_type: &StreamType,
    queue_capacity: usize,
  ) -> Option<DataReader> {
    let mut ready_timeout = self.config.datawriter_ready_timeout;
    if ready_timeout < Timestamp::ZERO {
      warn!(
        "negative timeout value ({ready_timeout}), disabling the waiting for connecting writers"
      );
      ready_timeout = Timestamp::ZERO;
    }
    if ready_timeout != Timestamp::ZERO && !self.config.signal_must_be_ready(name) {
      ready_timeout = Timestamp::ZERO;
    }

    let collection = self.data_access_collection().or_else(|| {
      error!("can not create reader for '{name}': simulation bus is not initialized");
      None
    })?;

    let (topic, is_new_topic) = match self.get_or_create_topic(name, stream_type) {
      Ok(pair) => pair,
      Err(e) => {
        error!("can not create reader for '{name}': {e}");
        return None;
      }
    };

    let queue = topic.create_data_reader(queue_capacity, &Arc::downgrade(&collection));
    // Unlock the guard so a running reception session updates its wait-set.
    self.trigger_guard();

    if is_new_topic && ready_timeout > Timestamp::ZERO {
      let connected = topic.wait_for_connecting_writers(ready_timeout.as_std_duration());
      if !connected {
        error!("not enough writers connected to reader {name}");
        return None;
      }
    }
    Some(DataReader::new(queue, Arc::downgrade(&collection)))
  }

  /// Reader with raw stream type and unbounded queue.
  pub fn get_raw_reader(&self, name: &str) -> Option<DataReader> {
    self.get_reader(name, &StreamType::raw(), 0)
  }

  pub fn get_writer(
    &self,
    name: &str,
    stream_type: &StreamType,
    queue_capacity: usize,
  ) -> Option<StreamItemDataWriter> {
    match self.get_or_create_topic(name, stream_type) {
      Ok((topic, _)) => Some(topic.create_data_writer(queue_capacity)),
      Err(e) => {
        error!("can not create writer for '{name}': {e}");
        None
      }
    }
  }

  pub fn get_raw_writer(&self, name: &str) -> Option<StreamItemDataWriter> {
    self.get_writer(name, &StreamType::raw(), 0)
  }

  fn get_or_create_topic(
    &self,
    topic_name: &str,
    stream_type: &StreamType,
  ) -> Result<(Arc<StreamItemTopic>, bool)> {
    let mut topics = self.topics.lock().unwrap();
    if let Some(topic) = topics.get(topic_name) {
      return Ok((Arc::clone(topic), false));
    }
    let domain = self.domain.lock().unwrap();
    let domain = domain.as_ref().ok_or_else(|| {
      Error::InvalidState("simulation bus is not initialized".to_string())
    })?;
    let topic = StreamItemTopic::new(
      topic_name,
      stream_type.clone(),
      Arc::clone(&self.qos_store),
      domain.route(topic_name),
    );
    topics.insert(topic_name.to_string(), Arc::clone(&topic));
    Ok((topic, true))
  }

  // ---- reception plumbing (see reception.rs) -------------------------

  pub(crate) fn data_access_collection(&self) -> Option<Arc<DataAccessCollection>> {
    self.data_access.lock().unwrap().clone()
  }

  pub(crate) fn take_guard(&self) -> Option<GuardCondition> {
    self.guard.lock().unwrap().take()
  }

  pub(crate) fn put_back_guard(&self, guard: GuardCondition) {
    *self.guard.lock().unwrap() = Some(guard);
  }

  pub(crate) fn trigger_guard(&self) {
    if let Some(trigger) = self.guard_trigger.lock().unwrap().as_ref() {
      trigger.trigger();
    }
  }
}
