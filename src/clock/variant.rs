// Adapters between the two clock interface generations.
//
// User code may bring clocks and event sinks written against either the
// current traits or the legacy ones. The registries store these tagged
// adapters and forward the superset of operations; where the legacy side has
// no counterpart (the next-tick hint), the adapter drops the extra argument
// explicitly.

use std::sync::{Arc, Weak};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::{Clock, ClockEventSink, ClockKind, LegacyClock, LegacyClockEventSink};
use crate::time::Timestamp;

/// A weakly held event sink of either interface generation.
#[derive(Clone)]
pub enum EventSinkAdapter {
  Current(Weak<dyn ClockEventSink>),
  Legacy(Weak<dyn LegacyClockEventSink>),
}

impl EventSinkAdapter {
  pub fn current(sink: Weak<dyn ClockEventSink>) -> Self {
    EventSinkAdapter::Current(sink)
  }

  pub fn legacy(sink: Weak<dyn LegacyClockEventSink>) -> Self {
    EventSinkAdapter::Legacy(sink)
  }

  pub fn expired(&self) -> bool {
    match self {
      EventSinkAdapter::Current(w) => w.strong_count() == 0,
      EventSinkAdapter::Legacy(w) => w.strong_count() == 0,
    }
  }

  /// Identity comparison of the referenced sink objects. Sinks of different
  /// generations are never the same object.
  pub fn is_same(&self, other: &EventSinkAdapter) -> bool {
    match (self, other) {
      (EventSinkAdapter::Current(a), EventSinkAdapter::Current(b)) => Weak::ptr_eq(a, b),
      (EventSinkAdapter::Legacy(a), EventSinkAdapter::Legacy(b)) => Weak::ptr_eq(a, b),
      _ => false,
    }
  }

  /// Locks the weak reference and runs the event against the sink. Returns
  /// false if the sink is gone; the caller decides whether that is worth a
  /// log line.
  fn with_sink(
    &self,
    current: impl FnOnce(&dyn ClockEventSink),
    legacy: impl FnOnce(&dyn LegacyClockEventSink),
  ) -> bool {
    match self {
      EventSinkAdapter::Current(w) => match w.upgrade() {
        Some(sink) => {
          current(sink.as_ref());
          true
        }
        None => false,
      },
      EventSinkAdapter::Legacy(w) => match w.upgrade() {
        Some(sink) => {
          legacy(sink.as_ref());
          true
        }
        None => false,
      },
    }
  }

  pub fn time_update_begin(&self, old_time: Timestamp, new_time: Timestamp) -> bool {
    self.with_sink(
      |s| s.time_update_begin(old_time, new_time),
      |s| s.time_update_begin(old_time, new_time),
    )
  }

  pub fn time_updating(&self, new_time: Timestamp, next_tick: Option<Timestamp>) -> bool {
    self.with_sink(
      |s| s.time_updating(new_time, next_tick),
      // The legacy interface has no next-tick parameter; it is dropped here.
      |s| s.time_updating(new_time),
    )
  }

  pub fn time_update_end(&self, new_time: Timestamp) -> bool {
    self.with_sink(|s| s.time_update_end(new_time), |s| s.time_update_end(new_time))
  }

  pub fn time_reset_begin(&self, old_time: Timestamp, new_time: Timestamp) -> bool {
    self.with_sink(
      |s| s.time_reset_begin(old_time, new_time),
      |s| s.time_reset_begin(old_time, new_time),
    )
  }

  pub fn time_reset_end(&self, new_time: Timestamp) -> bool {
    self.with_sink(|s| s.time_reset_end(new_time), |s| s.time_reset_end(new_time))
  }
}

// ----------------------------------------------

/// A strongly held clock of either interface generation.
#[derive(Clone)]
pub enum ClockAdapter {
  Current(Arc<dyn Clock>),
  Legacy(Arc<LegacyClockShim>),
}

impl ClockAdapter {
  pub fn current(clock: Arc<dyn Clock>) -> Self {
    ClockAdapter::Current(clock)
  }

  pub fn legacy(clock: Arc<dyn LegacyClock>) -> Self {
    ClockAdapter::Legacy(Arc::new(LegacyClockShim {
      clock,
      bridge: std::sync::Mutex::new(None),
    }))
  }

  pub fn name(&self) -> String {
    match self {
      ClockAdapter::Current(c) => c.name(),
      ClockAdapter::Legacy(c) => c.clock.name(),
    }
  }

  pub fn kind(&self) -> ClockKind {
    match self {
      ClockAdapter::Current(c) => c.kind(),
      ClockAdapter::Legacy(c) => c.clock.kind(),
    }
  }

  pub fn time(&self) -> Timestamp {
    match self {
      ClockAdapter::Current(c) => c.time(),
      ClockAdapter::Legacy(c) => c.clock.time(),
    }
  }

  pub fn reset(&self, new_time: Timestamp) {
    match self {
      ClockAdapter::Current(c) => c.reset(new_time),
      ClockAdapter::Legacy(c) => c.clock.reset(new_time),
    }
  }

  /// Starts the clock against a current-generation sink. A legacy clock gets
  /// a bridge that forwards events and swallows the next-tick hint.
  pub fn start(&self, sink: Weak<dyn ClockEventSink>) {
    match self {
      ClockAdapter::Current(c) => c.start(EventSinkAdapter::current(sink)),
      ClockAdapter::Legacy(c) => c.start(sink),
    }
  }

  pub fn stop(&self) {
    match self {
      ClockAdapter::Current(c) => c.stop(),
      ClockAdapter::Legacy(c) => c.stop(),
    }
  }
}

/// Owns a legacy clock plus the sink bridge that must outlive the clock run.
pub struct LegacyClockShim {
  clock: Arc<dyn LegacyClock>,
  // The legacy clock only holds the bridge weakly; the strong reference
  // lives here from start to stop.
  bridge: std::sync::Mutex<Option<Arc<LegacySinkBridge>>>,
}

impl LegacyClockShim {
  fn start(&self, sink: Weak<dyn ClockEventSink>) {
    let bridge = Arc::new(LegacySinkBridge {
      inner: sink,
    });
    let weak_bridge: Weak<dyn LegacyClockEventSink> = {
      let dyn_bridge: Arc<dyn LegacyClockEventSink> = bridge.clone();
      Arc::downgrade(&dyn_bridge)
    };
    *self.bridge.lock().unwrap() = Some(bridge);
    self.clock.start(weak_bridge);
  }

  fn stop(&self) {
    self.clock.stop();
    *self.bridge.lock().unwrap() = None;
  }
}

/// Presents a current-generation sink to a legacy clock.
struct LegacySinkBridge {
  inner: Weak<dyn ClockEventSink>,
}

impl LegacyClockEventSink for LegacySinkBridge {
  fn time_update_begin(&self, old_time: Timestamp, new_time: Timestamp) {
    if let Some(sink) = self.inner.upgrade() {
      sink.time_update_begin(old_time, new_time);
    }
  }
  fn time_updating(&self, new_time: Timestamp) {
    if let Some(sink) = self.inner.upgrade() {
      sink.time_updating(new_time, None);
    }
  }
  fn time_update_end(&self, new_time: Timestamp) {
    if let Some(sink) = self.inner.upgrade() {
      sink.time_update_end(new_time);
    }
  }
  fn time_reset_begin(&self, old_time: Timestamp, new_time: Timestamp) {
    if let Some(sink) = self.inner.upgrade() {
      sink.time_reset_begin(old_time, new_time);
    }
  }
  fn time_reset_end(&self, new_time: Timestamp) {
    if let Some(sink) = self.inner.upgrade() {
      sink.time_reset_end(new_time);
    }
  }
}
