// Service bus discovery end-to-end: participants of one system find each
// other, update sinks observe join and leave events, and departed servers
// disappear from the directory.

use std::{
  sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex, Weak,
  },
  thread,
  time::{Duration, Instant},
};

use simrt::{
  config::ParticipantConfig,
  participant::{NoopElement, Participant},
  service_bus::{ServiceUpdateEvent, ServiceUpdateEventType, ServiceUpdateSink},
};

static NEXT_DOMAIN: AtomicU32 = AtomicU32::new(700);

fn test_config(domain: u32) -> ParticipantConfig {
  let mut config = ParticipantConfig::default();
  config.service_bus.discovery_domain = domain;
  config.service_bus.heartbeat_interval = std::time::Duration::from_millis(100);
  config
}

fn init_logging() {
  let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if done() {
      return true;
    }
    thread::sleep(Duration::from_millis(10));
  }
  done()
}

struct EventLog {
  events: Mutex<Vec<ServiceUpdateEvent>>,
}

impl ServiceUpdateSink for EventLog {
  fn update_event(&self, event: &ServiceUpdateEvent) {
    self.events.lock().unwrap().push(event.clone());
  }
}

#[test]
fn participants_discover_each_other() -> anyhow::Result<()> {
  init_logging();
  let domain = NEXT_DOMAIN.fetch_add(1, Ordering::SeqCst);

  let first = Participant::new(
    "first",
    "disco_system",
    test_config(domain),
    NoopElement::factory("element"),
  )?;
  let second = Participant::new(
    "second",
    "disco_system",
    test_config(domain),
    NoopElement::factory("element"),
  )?;

  // Both directions resolve requesters by name.
  assert!(first.get_requester("second").is_some());
  assert!(second.get_requester("first").is_some());

  // A participant of a different system stays invisible.
  let outsider = Participant::new(
    "outsider",
    "other_system",
    test_config(domain),
    NoopElement::factory("element"),
  )?;
  let access = first.service_bus().default_access().unwrap();
  let discovered = access.discover(Duration::from_millis(500));
  assert!(discovered.iter().any(|(name, _)| name == "second"));
  assert!(!discovered.iter().any(|(name, _)| name == "outsider"));
  drop(outsider);
  Ok(())
}

#[test]
fn update_sinks_observe_join_and_leave() {
  init_logging();
  let domain = NEXT_DOMAIN.fetch_add(1, Ordering::SeqCst);

  let watcher = Participant::new(
    "watcher",
    "watch_system",
    test_config(domain),
    NoopElement::factory("element"),
  )
  .unwrap();

  let log = Arc::new(EventLog {
    events: Mutex::new(Vec::new()),
  });
  let weak: Weak<dyn ServiceUpdateSink> = {
    let log_dyn: Arc<dyn ServiceUpdateSink> = log.clone();
    Arc::downgrade(&log_dyn)
  };
  let access = watcher.service_bus().default_access().unwrap();
  access.register_update_event_sink(weak.clone()).unwrap();

  let newcomer = Participant::new(
    "newcomer",
    "watch_system",
    test_config(domain),
    NoopElement::factory("element"),
  )
  .unwrap();

  assert!(wait_until(Duration::from_secs(5), || {
    log
      .events
      .lock()
      .unwrap()
      .iter()
      .any(|e| e.service_name == "newcomer")
  }));
  {
    let events = log.events.lock().unwrap();
    let joined = events.iter().find(|e| e.service_name == "newcomer").unwrap();
    assert_eq!(joined.system_name, "watch_system");
    assert!(matches!(
      joined.event_id,
      ServiceUpdateEventType::NotifyAlive | ServiceUpdateEventType::Response
    ));
    // Host names in published URLs are numeric after resolution.
    assert!(joined.host_url.starts_with("http://"));
  }

  // The departing participant announces itself with a bye event.
  drop(newcomer);
  assert!(wait_until(Duration::from_secs(5), || {
    log
      .events
      .lock()
      .unwrap()
      .iter()
      .any(|e| e.service_name == "newcomer" && e.event_id == ServiceUpdateEventType::NotifyBye)
  }));

  // And it disappears from the directory.
  assert!(wait_until(Duration::from_secs(5), || {
    !access
      .currently_discovered_services()
      .iter()
      .any(|(name, _)| name == "newcomer")
  }));

  access.deregister_update_event_sink(&weak).unwrap();
}
