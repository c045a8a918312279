// Simulation bus end-to-end: late-joining subscribers and stream-type
// upgrades across two participants.

use std::{
  sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
  },
  thread,
  time::{Duration, Instant},
};

use simrt::{
  config::ParticipantConfig,
  participant::{NoopElement, Participant},
  sim_bus::{stream_type::PROP_MAX_ARRAY_SIZE, TRANSPORT_LAYER_MAX_MESSAGE_SIZE},
  DataReceiver, DataSample, StreamType, Timestamp,
};

static NEXT_DOMAIN: AtomicU32 = AtomicU32::new(500);

fn test_config(domain: u32) -> ParticipantConfig {
  let mut config = ParticipantConfig::default();
  config.service_bus.discovery_domain = domain;
  config.service_bus.heartbeat_interval = std::time::Duration::from_millis(200);
  config.sim_bus.participant_domain = domain;
  config
}

fn init_logging() {
  let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
struct Observed {
  samples: Vec<Vec<u8>>,
  stream_types: Vec<StreamType>,
}

struct Collector {
  observed: Arc<Mutex<Observed>>,
}

impl DataReceiver for Collector {
  fn on_stream_type(&mut self, stream_type: StreamType) {
    self.observed.lock().unwrap().stream_types.push(stream_type);
  }
  fn on_sample(&mut self, sample: DataSample) {
    self.observed.lock().unwrap().samples.push(sample.payload.to_vec());
  }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if done() {
      return true;
    }
    thread::sleep(Duration::from_millis(5));
  }
  done()
}

fn started_participant(name: &str, system: &str, domain: u32) -> Participant {
  let participant = Participant::new(
    name,
    system,
    test_config(domain),
    NoopElement::factory("element"),
  )
  .unwrap();
  let machine = participant.state_machine();
  machine.load().unwrap();
  machine.initialize().unwrap();
  machine.start().unwrap();
  participant
}

fn stop_participant(participant: &Participant) {
  let machine = participant.state_machine();
  machine.stop().unwrap();
  machine.deinitialize().unwrap();
  machine.unload().unwrap();
  machine.exit().unwrap();
}

#[test]
fn late_joining_subscriber_sees_type_then_samples() {
  init_logging();
  let domain = NEXT_DOMAIN.fetch_add(1, Ordering::SeqCst);
  let system = "late_join_system";

  let publisher = started_participant("late_pub", system, domain);
  let small_type = StreamType::plain_array("u8", 16);
  let writer = publisher
    .simulation_bus()
    .get_writer("T", &small_type, 0)
    .unwrap();

  // The subscriber joins well after the publisher opened the topic.
  thread::sleep(Duration::from_millis(500));
  let subscriber = started_participant("late_sub", system, domain);
  let observed = Arc::new(Mutex::new(Observed::default()));
  let reader = subscriber
    .simulation_bus()
    .get_reader("T", &small_type, 0)
    .unwrap();
  reader.reset(Box::new(Collector {
    observed: Arc::clone(&observed),
  }));

  let reception_bus = Arc::clone(subscriber.simulation_bus());
  let reception = thread::spawn(move || {
    reception_bus.start_blocking_reception(|| {});
  });

  for i in 1..=3u8 {
    writer
      .write_sample(&DataSample::new(vec![i], Timestamp::from_millis(i as i64)))
      .unwrap();
  }

  assert!(wait_until(Duration::from_secs(5), || {
    observed.lock().unwrap().samples.len() == 3
  }));

  {
    let observed = observed.lock().unwrap();
    // The late joiner observed the (small) stream type before the samples.
    assert_eq!(observed.stream_types[0].meta_type(), "plain_array");
    assert_eq!(
      observed.stream_types[0].property(PROP_MAX_ARRAY_SIZE),
      Some("16")
    );
    assert_eq!(observed.samples, vec![vec![1u8], vec![2u8], vec![3u8]]);
  }

  subscriber.simulation_bus().stop_blocking_reception();
  reception.join().unwrap();
  stop_participant(&subscriber);
  stop_participant(&publisher);
}

#[test]
fn stream_type_upgrade_delivers_big_sample_without_loss() {
  init_logging();
  let domain = NEXT_DOMAIN.fetch_add(1, Ordering::SeqCst);
  let system = "upgrade_system";

  let small = StreamType::plain_array("u8", 60_000);
  let big = StreamType::plain_array("u8", 80_000);
  assert!(60_000 < TRANSPORT_LAYER_MAX_MESSAGE_SIZE);
  assert!(80_000 >= TRANSPORT_LAYER_MAX_MESSAGE_SIZE);

  let publisher = started_participant("upgrade_pub", system, domain);
  let subscriber = started_participant("upgrade_sub", system, domain);

  let observed = Arc::new(Mutex::new(Observed::default()));
  let reader = subscriber
    .simulation_bus()
    .get_reader("U", &small, 0)
    .unwrap();
  reader.reset(Box::new(Collector {
    observed: Arc::clone(&observed),
  }));
  let reception_bus = Arc::clone(subscriber.simulation_bus());
  let reception = thread::spawn(move || {
    reception_bus.start_blocking_reception(|| {});
  });

  let writer = publisher
    .simulation_bus()
    .get_writer("U", &small, 0)
    .unwrap();

  // Declare the small type, then cross the threshold, then send one big
  // sample; the subscriber must receive it intact.
  writer.write_stream_type(&small).unwrap();
  writer.write_stream_type(&big).unwrap();
  let big_payload = vec![0xabu8; 80_000];
  writer
    .write_sample(&DataSample::new(big_payload.clone(), Timestamp::from_millis(1)))
    .unwrap();

  assert!(wait_until(Duration::from_secs(5), || {
    !observed.lock().unwrap().samples.is_empty()
  }));

  {
    let observed = observed.lock().unwrap();
    assert_eq!(observed.samples.len(), 1);
    assert_eq!(observed.samples[0], big_payload);
    // Both declarations arrived, in order of declaration.
    let sizes: Vec<Option<&str>> = observed
      .stream_types
      .iter()
      .map(|st| st.property(PROP_MAX_ARRAY_SIZE))
      .collect();
    assert!(sizes.contains(&Some("80000")));
  }

  subscriber.simulation_bus().stop_blocking_reception();
  reception.join().unwrap();
  stop_participant(&subscriber);
  stop_participant(&publisher);
}

#[test]
fn manual_pop_and_front_time() {
  init_logging();
  let domain = NEXT_DOMAIN.fetch_add(1, Ordering::SeqCst);
  let system = "manual_pop_system";

  let publisher = started_participant("pop_pub", system, domain);
  let subscriber = started_participant("pop_sub", system, domain);

  let writer = publisher.simulation_bus().get_raw_writer("M").unwrap();
  let reader = subscriber.simulation_bus().get_raw_reader("M").unwrap();

  let observed = Arc::new(Mutex::new(Observed::default()));
  let mut collector = Collector {
    observed: Arc::clone(&observed),
  };

  // Only the durable stream type announcement is pending initially.
  assert!(reader.pop(&mut collector));
  assert!(!reader.pop(&mut collector));
  assert_eq!(reader.front_time(), None);

  writer
    .write_sample(&DataSample::new(vec![9u8], Timestamp::from_micros(77)))
    .unwrap();
  assert_eq!(reader.front_time(), Some(Timestamp::from_micros(77)));
  assert!(reader.pop(&mut collector));
  assert!(!reader.pop(&mut collector));

  assert_eq!(observed.lock().unwrap().samples, vec![vec![9u8]]);

  stop_participant(&subscriber);
  stop_participant(&publisher);
}
