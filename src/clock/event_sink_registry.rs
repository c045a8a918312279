// Fan-out of time events to registered sinks.
//
// Each registered sink owns a dedicated single-thread worker, so one slow
// sink cannot head-of-line block another, while events into a single sink
// stay ordered. The dispatching clock blocks on a latch until every worker
// has handled (or skipped) the event.

use std::sync::{Arc, Mutex};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::{variant::EventSinkAdapter, ClockEventSink};
use crate::{
  error::{Error, Result},
  time::Timestamp,
  worker::{CountdownLatch, SingleThreadWorker},
};

struct SinkWorker {
  sink: EventSinkAdapter,
  worker: SingleThreadWorker,
}

struct LatchGuard {
  latch: Arc<CountdownLatch>,
}

impl Drop for LatchGuard {
  fn drop(&mut self) {
    self.latch.count_down();
  }
}

/// Registry of weakly held clock event sinks. Implements [`ClockEventSink`]
/// itself so a clock can drive it directly.
pub struct ClockEventSinkRegistry {
  workers: Mutex<Vec<SinkWorker>>,
  latch: Arc<CountdownLatch>,
}

impl ClockEventSinkRegistry {
  pub fn new() -> Self {
    ClockEventSinkRegistry {
      workers: Mutex::new(Vec::new()),
      latch: Arc::new(CountdownLatch::new()),
    }
  }

  /// Registers a sink. Duplicates (same object identity) and already-expired
  /// references are rejected.
  pub fn register_sink(&self, sink: EventSinkAdapter) -> Result<()> {
    if sink.expired() {
      warn!("registration of an expired event sink rejected");
      return Err(Error::InvalidArg(
        "event sink does not exist anymore".to_string(),
      ));
    }
    let mut workers = self.workers.lock().unwrap();
    if workers.iter().any(|w| w.sink.is_same(&sink)) {
      warn!("registration of event sink failed, sink already registered");
      return Err(Error::AlreadyRegistered("event sink".to_string()));
    }
    let worker = SingleThreadWorker::new("clock-event-sink")?;
    workers.push(SinkWorker {
      sink,
      worker,
    });
    debug!("registered event sink at the clock event sink registry");
    Ok(())
  }

  /// Unregisters a sink by identity. The sink's worker is joined before this
  /// returns, so no callback of the sink is in flight afterwards.
  pub fn unregister_sink(&self, sink: &EventSinkAdapter) -> Result<()> {
    let removed = {
      let mut workers = self.workers.lock().unwrap();
      match workers.iter().position(|w| w.sink.is_same(sink)) {
        Some(index) => Some(workers.remove(index)),
        None => None,
      }
    };
    match removed {
      Some(worker) => {
        // Dropping joins the worker thread outside the registry lock.
        drop(worker);
        debug!("unregistered event sink from the clock event sink registry");
        Ok(())
      }
      None => {
        warn!("deregistration of event sink failed, sink not found in the registry");
        Err(Error::NotFound("event sink".to_string()))
      }
    }
  }

  pub fn sink_count(&self) -> usize {
    self.workers.lock().unwrap().len()
  }

  /// Submits `call` to every worker and waits for all of them.
  ///
  /// Expired sinks count the latch down without being called; they are only
  /// logged, never erased here, because erasure during dispatch would race
  /// with the snapshot being iterated.
  fn trigger_event<F>(&self, event_name: &'static str, call: F)
  where
    F: Fn(&EventSinkAdapter) -> bool + Send + Sync + 'static,
  {
    let call = Arc::new(call);
    let workers = self.workers.lock().unwrap();
    self.latch.reset(workers.len());
    for entry in workers.iter() {
      let sink = entry.sink.clone();
      let call = Arc::clone(&call);
      // The guard counts the latch down when the task finishes, but also when
      // the task is discarded because its worker was unregistered mid-event.
      let guard = LatchGuard {
        latch: Arc::clone(&self.latch),
      };
      let dispatched = entry.worker.dispatch(move || {
        let _guard = guard;
        if !call(&sink) {
          debug!("expired event sink addressed during '{event_name}' event");
        }
      });
      if let Err(e) = dispatched {
        // Worker already stopping; the moved-in guard has counted down.
        debug!("event sink worker rejected '{event_name}' dispatch: {e}");
      }
    }
    drop(workers);
    self.latch.wait();
  }
}

impl Default for ClockEventSinkRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl ClockEventSink for ClockEventSinkRegistry {
  fn time_update_begin(&self, old_time: Timestamp, new_time: Timestamp) {
    debug!("distributing 'timeUpdateBegin' events, old time {old_time}, new time {new_time}");
    self.trigger_event("timeUpdateBegin", move |sink| {
      sink.time_update_begin(old_time, new_time)
    });
  }

  fn time_updating(&self, new_time: Timestamp, next_tick: Option<Timestamp>) {
    debug!("distributing 'timeUpdating' events, new time {new_time}");
    self.trigger_event("timeUpdating", move |sink| {
      sink.time_updating(new_time, next_tick)
    });
  }

  fn time_update_end(&self, new_time: Timestamp) {
    debug!("distributing 'timeUpdateEnd' events, new time {new_time}");
    self.trigger_event("timeUpdateEnd", move |sink| sink.time_update_end(new_time));
  }

  fn time_reset_begin(&self, old_time: Timestamp, new_time: Timestamp) {
    debug!("distributing 'timeResetBegin' events, old time {old_time}, new time {new_time}");
    self.trigger_event("timeResetBegin", move |sink| {
      sink.time_reset_begin(old_time, new_time)
    });
  }

  fn time_reset_end(&self, new_time: Timestamp) {
    debug!("distributing 'timeResetEnd' events, new time {new_time}");
    self.trigger_event("timeResetEnd", move |sink| sink.time_reset_end(new_time));
  }
}
