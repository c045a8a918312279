// Fan-out of discovery events to user update sinks.
//
// Sinks are wrapped in proxies and driven from a small pool, decoupling the
// discovery thread from user callback latency. Deregistration deactivates the
// proxy first: tasks already queued against it become no-ops.

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc, Mutex, Weak,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::discovery::ServiceUpdateEvent;
use crate::{
  error::{Error, Result},
  worker::ThreadPool,
};

/// Receiver of discovery update events.
pub trait ServiceUpdateSink: Send + Sync {
  fn update_event(&self, event: &ServiceUpdateEvent);
}

const UPDATE_SINK_POOL_SIZE: usize = 2;

struct UpdateEventSinkProxy {
  sink: Weak<dyn ServiceUpdateSink>,
  active: AtomicBool,
}

impl UpdateEventSinkProxy {
  fn run(&self, event: &ServiceUpdateEvent) {
    if !self.active.load(Ordering::SeqCst) {
      return;
    }
    if let Some(sink) = self.sink.upgrade() {
      sink.update_event(event);
    }
  }

  fn deactivate(&self) {
    self.active.store(false, Ordering::SeqCst);
  }

  fn is_for(&self, sink: &Weak<dyn ServiceUpdateSink>) -> bool {
    Weak::ptr_eq(&self.sink, sink)
  }
}

pub struct ServiceUpdateSinkRegistry {
  sinks: Mutex<Vec<Arc<UpdateEventSinkProxy>>>,
  pool: ThreadPool,
}

impl ServiceUpdateSinkRegistry {
  pub fn new() -> Result<Self> {
    Ok(ServiceUpdateSinkRegistry {
      sinks: Mutex::new(Vec::new()),
      pool: ThreadPool::new("service-update-sink", UPDATE_SINK_POOL_SIZE)?,
    })
  }

  pub fn register_update_event_sink(&self, sink: Weak<dyn ServiceUpdateSink>) -> Result<()> {
    let mut sinks = self.sinks.lock().unwrap();
    if sinks.iter().any(|p| p.is_for(&sink)) {
      return Err(Error::AlreadyRegistered(
        "service update event sink already registered".to_string(),
      ));
    }
    sinks.push(Arc::new(UpdateEventSinkProxy {
      sink,
      active: AtomicBool::new(true),
    }));
    Ok(())
  }

  pub fn deregister_update_event_sink(&self, sink: &Weak<dyn ServiceUpdateSink>) -> Result<()> {
    let mut sinks = self.sinks.lock().unwrap();
    match sinks.iter().position(|p| p.is_for(sink)) {
      Some(index) => {
        // Deactivate first so in-flight pool tasks holding the proxy no-op.
        sinks[index].deactivate();
        sinks.remove(index);
        Ok(())
      }
      None => Err(Error::NotFound(
        "service update event sink not registered".to_string(),
      )),
    }
  }

  /// Dispatches the event to every registered sink on the pool.
  pub fn update_event(&self, event: &ServiceUpdateEvent) {
    let sinks = self.sinks.lock().unwrap();
    for proxy in sinks.iter() {
      let proxy = Arc::clone(proxy);
      let event = event.clone();
      if let Err(e) = self.pool.post(move || proxy.run(&event)) {
        warn!("dropping service update event, fan-out pool stopped: {e}");
      }
    }
  }

  pub fn sink_count(&self) -> usize {
    self.sinks.lock().unwrap().len()
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::atomic::AtomicUsize,
    time::{Duration, Instant},
  };

  use super::*;
  use crate::service_bus::discovery::ServiceUpdateEventType;

  struct CountingSink {
    seen: AtomicUsize,
  }

  impl ServiceUpdateSink for CountingSink {
    fn update_event(&self, _event: &ServiceUpdateEvent) {
      self.seen.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn event() -> ServiceUpdateEvent {
    ServiceUpdateEvent {
      service_name: "a".to_string(),
      system_name: "s".to_string(),
      host_url: "http://127.0.0.1:9090".to_string(),
      event_id: ServiceUpdateEventType::NotifyAlive,
    }
  }

  fn wait_for(sink: &CountingSink, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while sink.seen.load(Ordering::SeqCst) < expected && Instant::now() < deadline {
      std::thread::sleep(Duration::from_millis(2));
    }
  }

  #[test]
  fn events_reach_registered_sinks() {
    let registry = ServiceUpdateSinkRegistry::new().unwrap();
    let sink = Arc::new(CountingSink {
      seen: AtomicUsize::new(0),
    });
    let weak: Weak<dyn ServiceUpdateSink> = {
      let dyn_sink: Arc<dyn ServiceUpdateSink> = sink.clone();
      Arc::downgrade(&dyn_sink)
    };
    registry.register_update_event_sink(weak).unwrap();

    registry.update_event(&event());
    registry.update_event(&event());
    wait_for(&sink, 2);
    assert_eq!(sink.seen.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn duplicate_registration_rejected() {
    let registry = ServiceUpdateSinkRegistry::new().unwrap();
    let sink = Arc::new(CountingSink {
      seen: AtomicUsize::new(0),
    });
    let weak: Weak<dyn ServiceUpdateSink> = {
      let dyn_sink: Arc<dyn ServiceUpdateSink> = sink.clone();
      Arc::downgrade(&dyn_sink)
    };
    registry.register_update_event_sink(weak.clone()).unwrap();
    assert!(registry.register_update_event_sink(weak).is_err());
  }

  #[test]
  fn deregistered_sink_no_longer_called() {
    let registry = ServiceUpdateSinkRegistry::new().unwrap();
    let sink = Arc::new(CountingSink {
      seen: AtomicUsize::new(0),
    });
    let weak: Weak<dyn ServiceUpdateSink> = {
      let dyn_sink: Arc<dyn ServiceUpdateSink> = sink.clone();
      Arc::downgrade(&dyn_sink)
    };
    registry.register_update_event_sink(weak.clone()).unwrap();
    registry.update_event(&event());
    wait_for(&sink, 1);

    registry.deregister_update_event_sink(&weak).unwrap();
    registry.update_event(&event());
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(sink.seen.load(Ordering::SeqCst), 1);
    assert_eq!(registry.sink_count(), 0);

    assert!(registry.deregister_update_event_sink(&weak).is_err());
  }
}
