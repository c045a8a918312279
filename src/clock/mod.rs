// Clock subsystem: pluggable clocks, the event-sink fan-out registry, the
// clock master driving remote time clients over RPC, and the clock service
// tying them together.

mod event_sink_registry;
mod main_event_sink;
mod registry;
pub mod rpc;
mod service;
mod variant;

pub use event_sink_registry::ClockEventSinkRegistry;
pub use main_event_sink::{ClockMainEventSink, SyncEventFlag};
pub use registry::ClockRegistry;
pub use service::ClockService;
pub use variant::{ClockAdapter, EventSinkAdapter};

use std::{
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
  },
  thread,
  time::Instant,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  config::{CLOCK_LOCAL_SYSTEM_REAL_TIME, CLOCK_LOCAL_SYSTEM_SIM_TIME, SIM_TIME_TIME_FACTOR_AFAP},
  time::Timestamp,
};

/// How a clock advances time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive)]
#[repr(i32)]
pub enum ClockKind {
  /// Time flows on its own; queries interpolate.
  Continuous = 0,
  /// Time advances in explicit steps driven by the clock's own thread.
  Discrete = 1,
}

/// Receiver of time events, held weakly by whoever distributes them.
///
/// `time_updating` carries the next planned tick when the clock knows it.
pub trait ClockEventSink: Send + Sync {
  fn time_update_begin(&self, old_time: Timestamp, new_time: Timestamp);
  fn time_updating(&self, new_time: Timestamp, next_tick: Option<Timestamp>);
  fn time_update_end(&self, new_time: Timestamp);
  fn time_reset_begin(&self, old_time: Timestamp, new_time: Timestamp);
  fn time_reset_end(&self, new_time: Timestamp);
}

/// Previous-generation sink interface, kept for user code written against it.
/// It never sees the next-tick hint.
pub trait LegacyClockEventSink: Send + Sync {
  fn time_update_begin(&self, old_time: Timestamp, new_time: Timestamp);
  fn time_updating(&self, new_time: Timestamp);
  fn time_update_end(&self, new_time: Timestamp);
  fn time_reset_begin(&self, old_time: Timestamp, new_time: Timestamp);
  fn time_reset_end(&self, new_time: Timestamp);
}

/// A named source of simulation time.
///
/// `start` hands the clock the sink it must drive from its own thread (for a
/// discrete clock) or at reset points (for a continuous one). The clock holds
/// the sink weakly; an expired sink simply stops receiving events.
pub trait Clock: Send + Sync {
  fn name(&self) -> String;
  fn kind(&self) -> ClockKind;
  fn time(&self) -> Timestamp;
  fn reset(&self, new_time: Timestamp);
  fn start(&self, sink: EventSinkAdapter);
  fn stop(&self);
}

/// Previous-generation clock interface; adapted via [`ClockAdapter`].
pub trait LegacyClock: Send + Sync {
  fn name(&self) -> String;
  fn kind(&self) -> ClockKind;
  fn time(&self) -> Timestamp;
  fn reset(&self, new_time: Timestamp);
  fn start(&self, sink: Weak<dyn LegacyClockEventSink>);
  fn stop(&self);
}

// ----------------------------------------------
// Native clocks
// ----------------------------------------------

/// Continuous clock following the host monotonic clock.
pub struct SystemRealClock {
  // offset + elapsed-since-epoch = current time
  state: Mutex<RealClockState>,
  sink: Mutex<Option<EventSinkAdapter>>,
}

struct RealClockState {
  epoch: Instant,
  offset: Timestamp,
}

impl SystemRealClock {
  pub fn new() -> Self {
    SystemRealClock {
      state: Mutex::new(RealClockState {
        epoch: Instant::now(),
        offset: Timestamp::ZERO,
      }),
      sink: Mutex::new(None),
    }
  }

  fn emit_reset(&self, old_time: Timestamp, new_time: Timestamp) {
    if let Some(sink) = self.sink.lock().unwrap().as_ref() {
      sink.time_reset_begin(old_time, new_time);
      sink.time_reset_end(new_time);
    }
  }
}

impl Default for SystemRealClock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock for SystemRealClock {
  fn name(&self) -> String {
    CLOCK_LOCAL_SYSTEM_REAL_TIME.to_string()
  }

  fn kind(&self) -> ClockKind {
    ClockKind::Continuous
  }

  fn time(&self) -> Timestamp {
    let state = self.state.lock().unwrap();
    state.offset + Timestamp::from(state.epoch.elapsed())
  }

  fn reset(&self, new_time: Timestamp) {
    let old_time = {
      let mut state = self.state.lock().unwrap();
      let old = state.offset + Timestamp::from(state.epoch.elapsed());
      state.epoch = Instant::now();
      state.offset = new_time;
      old
    };
    self.emit_reset(old_time, new_time);
  }

  fn start(&self, sink: EventSinkAdapter) {
    *self.sink.lock().unwrap() = Some(sink);
    // Starting rebases the clock at zero and announces it as a reset.
    self.reset(Timestamp::ZERO);
  }

  fn stop(&self) {
    *self.sink.lock().unwrap() = None;
  }
}

// ----------------------------------------------

/// Discrete clock stepping simulation time on its own thread.
///
/// Each tick runs the `time_update_begin -> time_updating -> time_update_end`
/// sequence against the sink, then paces itself by `step_size / time_factor`
/// wall time. A time factor of 0.0 runs unpaced.
pub struct SimulationClock {
  config: Mutex<SimClockParams>,
  current: Arc<Mutex<Timestamp>>,
  running: Arc<AtomicBool>,
  tick_thread: Mutex<Option<thread::JoinHandle<()>>>,
  sink: Arc<Mutex<Option<EventSinkAdapter>>>,
}

#[derive(Debug, Clone, Copy)]
struct SimClockParams {
  step_size: Timestamp,
  time_factor: f64,
}

impl SimulationClock {
  pub fn new(step_size: Timestamp, time_factor: f64) -> Self {
    SimulationClock {
      config: Mutex::new(SimClockParams {
        step_size,
        time_factor,
      }),
      current: Arc::new(Mutex::new(Timestamp::ZERO)),
      running: Arc::new(AtomicBool::new(false)),
      tick_thread: Mutex::new(None),
      sink: Arc::new(Mutex::new(None)),
    }
  }

  /// Applies validated configuration. Takes effect on the next `start`.
  pub fn update_configuration(&self, step_size: Timestamp, time_factor: f64) {
    let mut config = self.config.lock().unwrap();
    config.step_size = step_size;
    config.time_factor = time_factor;
  }
}

impl Clock for SimulationClock {
  fn name(&self) -> String {
    CLOCK_LOCAL_SYSTEM_SIM_TIME.to_string()
  }

  fn kind(&self) -> ClockKind {
    ClockKind::Discrete
  }

  fn time(&self) -> Timestamp {
    *self.current.lock().unwrap()
  }

  fn reset(&self, new_time: Timestamp) {
    let old_time = {
      let mut current = self.current.lock().unwrap();
      let old = *current;
      *current = new_time;
      old
    };
    if let Some(sink) = self.sink.lock().unwrap().as_ref() {
      sink.time_reset_begin(old_time, new_time);
      sink.time_reset_end(new_time);
    }
  }

  fn start(&self, sink: EventSinkAdapter) {
    if self.running.swap(true, Ordering::SeqCst) {
      warn!("simulation clock started twice, ignoring");
      return;
    }
    *self.sink.lock().unwrap() = Some(sink);
    self.reset(Timestamp::ZERO);

    let params = *self.config.lock().unwrap();
    let running = Arc::clone(&self.running);
    let sink_slot = Arc::clone(&self.sink);
    let current = Arc::clone(&self.current);

    let handle = thread::Builder::new()
      .name("sim-clock-tick".to_string())
      .spawn(move || {
        let mut now = *current.lock().unwrap();
        while running.load(Ordering::SeqCst) {
          let old = now;
          let new = old + params.step_size;
          let sink = sink_slot.lock().unwrap().clone();
          if let Some(sink) = sink {
            sink.time_update_begin(old, new);
            now = new;
            *current.lock().unwrap() = new;
            sink.time_updating(new, Some(new + params.step_size));
            sink.time_update_end(new);
          } else {
            now = new;
            *current.lock().unwrap() = new;
          }
          if params.time_factor != SIM_TIME_TIME_FACTOR_AFAP {
            let wall_nanos = params.step_size.nanos() as f64 / params.time_factor;
            thread::sleep(std::time::Duration::from_nanos(wall_nanos as u64));
          }
        }
      })
      .expect("cannot spawn simulation clock thread");
    *self.tick_thread.lock().unwrap() = Some(handle);
  }

  fn stop(&self) {
    self.running.store(false, Ordering::SeqCst);
    if let Some(handle) = self.tick_thread.lock().unwrap().take() {
      let _ = handle.join();
    }
    *self.sink.lock().unwrap() = None;
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::atomic::AtomicUsize, time::Duration};

  use super::*;

  struct CountingSink {
    updates: AtomicUsize,
    resets: AtomicUsize,
  }

  impl CountingSink {
    fn new() -> Arc<Self> {
      Arc::new(CountingSink {
        updates: AtomicUsize::new(0),
        resets: AtomicUsize::new(0),
      })
    }
  }

  impl ClockEventSink for CountingSink {
    fn time_update_begin(&self, _old: Timestamp, _new: Timestamp) {}
    fn time_updating(&self, _new: Timestamp, next_tick: Option<Timestamp>) {
      assert!(next_tick.is_some());
      self.updates.fetch_add(1, Ordering::SeqCst);
    }
    fn time_update_end(&self, _new: Timestamp) {}
    fn time_reset_begin(&self, _old: Timestamp, _new: Timestamp) {}
    fn time_reset_end(&self, _new: Timestamp) {
      self.resets.fetch_add(1, Ordering::SeqCst);
    }
  }

  #[test]
  fn real_clock_advances() {
    let clock = SystemRealClock::new();
    let t0 = clock.time();
    std::thread::sleep(Duration::from_millis(5));
    assert!(clock.time() > t0);
  }

  #[test]
  fn real_clock_reset_rebases() {
    let clock = SystemRealClock::new();
    clock.reset(Timestamp::from_secs(100));
    let t = clock.time();
    assert!(t >= Timestamp::from_secs(100));
    assert!(t < Timestamp::from_secs(101));
  }

  #[test]
  fn sim_clock_ticks_and_resets_on_start() {
    let clock = SimulationClock::new(Timestamp::from_millis(1), 1.0);
    let sink = CountingSink::new();
    let weak: Weak<dyn ClockEventSink> = {
      let dyn_sink: Arc<dyn ClockEventSink> = sink.clone();
      Arc::downgrade(&dyn_sink)
    };
    clock.start(EventSinkAdapter::current(weak));

    let deadline = Instant::now() + Duration::from_secs(5);
    while sink.updates.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
      std::thread::sleep(Duration::from_millis(1));
    }
    clock.stop();

    assert!(sink.resets.load(Ordering::SeqCst) >= 1);
    assert!(sink.updates.load(Ordering::SeqCst) >= 3);
    assert!(clock.time() >= Timestamp::from_millis(3));
  }
}
