// Clock service: owns the clock inventory, the event sink registry and the
// clock master, selects the main clock and exposes time to the rest of the
// process.

use std::{
  cell::RefCell,
  sync::{atomic::AtomicBool, atomic::Ordering, Arc, Mutex, Weak},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::ReentrantMutex;

use super::{
  event_sink_registry::ClockEventSinkRegistry,
  main_event_sink::ClockMainEventSink,
  registry::ClockRegistry,
  rpc::{ClockServiceRpc, ClockSyncMasterService, CLOCK_SERVICE, CLOCK_SYNC_MASTER_SERVICE},
  variant::{ClockAdapter, EventSinkAdapter},
  ClockEventSink, ClockKind, SimulationClock, SystemRealClock,
};
use crate::{
  config::{ClockConfig, CLOCK_LOCAL_SYSTEM_REAL_TIME, CLOCK_LOCAL_SYSTEM_SIM_TIME},
  error::{Error, Result},
  rpc::{RpcRequester, ServiceRegistry},
  time::Timestamp,
};

pub struct ClockService {
  started: AtomicBool,
  tensed: AtomicBool,

  realtime_clock: Arc<SystemRealClock>,
  simulation_clock: Arc<SimulationClock>,
  clock_registry: ClockRegistry,
  event_sink_registry: Arc<ClockEventSinkRegistry>,
  main_event_sink: Arc<ClockMainEventSink>,

  config: Mutex<ClockConfig>,

  // The same thread may re-enter through event callbacks that query time, so
  // the current clock sits behind a re-entrant lock. Selection uses a second
  // mutex to avoid deadlocking against those callbacks.
  current_clock: ReentrantMutex<RefCell<ClockAdapter>>,
  select_main_clock_mutex: Mutex<()>,
}

impl ClockService {
  /// Builds the service with its native clocks and the clock master wired to
  /// `requester_lookup` (normally the system access of the service bus).
  pub fn new<F>(config: ClockConfig, requester_lookup: F) -> Result<Arc<Self>>
  where
    F: Fn(&str) -> Option<Arc<dyn RpcRequester>> + Send + Sync + 'static,
  {
    let realtime_clock = Arc::new(SystemRealClock::new());
    let simulation_clock = Arc::new(SimulationClock::new(
      config.clock_sim_time_step_size,
      config.clock_sim_time_time_factor,
    ));

    let clock_registry = ClockRegistry::new();
    clock_registry.register_native_clocks(vec![
      ClockAdapter::current(Arc::clone(&realtime_clock) as Arc<dyn super::Clock>),
      ClockAdapter::current(Arc::clone(&simulation_clock) as Arc<dyn super::Clock>),
    ])?;

    let main_event_sink = Arc::new(ClockMainEventSink::new(
      config.time_update_timeout,
      requester_lookup,
    ));

    let event_sink_registry = Arc::new(ClockEventSinkRegistry::new());
    {
      let as_sink: Arc<dyn ClockEventSink> = Arc::clone(&main_event_sink) as Arc<dyn ClockEventSink>;
      event_sink_registry.register_sink(EventSinkAdapter::current(Arc::downgrade(&as_sink)))?;
      // The weak reference targets the allocation, which stays alive through
      // `main_event_sink`; the coerced Arc itself can go.
    }

    let current = ClockAdapter::current(Arc::clone(&realtime_clock) as Arc<dyn super::Clock>);

    Ok(Arc::new(ClockService {
      started: AtomicBool::new(false),
      tensed: AtomicBool::new(false),
      realtime_clock,
      simulation_clock,
      clock_registry,
      event_sink_registry,
      main_event_sink,
      config: Mutex::new(config),
      current_clock: ReentrantMutex::new(RefCell::new(current)),
      select_main_clock_mutex: Mutex::new(()),
    }))
  }

  /// Registers the clock RPC services on the participant server.
  pub fn register_rpc_services(self: &Arc<Self>, services: &ServiceRegistry) -> Result<()> {
    services.register(
      CLOCK_SYNC_MASTER_SERVICE,
      Arc::new(ClockSyncMasterService::new(
        Arc::clone(&self.main_event_sink),
        self,
      )),
    )?;
    services.register(CLOCK_SERVICE, Arc::new(ClockServiceRpc::new(self)))?;
    Ok(())
  }

  pub fn unregister_rpc_services(&self, services: &ServiceRegistry) {
    let _ = services.unregister(CLOCK_SYNC_MASTER_SERVICE);
    let _ = services.unregister(CLOCK_SERVICE);
  }

  pub fn main_event_sink(&self) -> &Arc<ClockMainEventSink> {
    &self.main_event_sink
  }

  fn with_current_clock<R>(&self, f: impl FnOnce(&ClockAdapter) -> R) -> R {
    let guard = self.current_clock.lock();
    let clock = guard.borrow().clone();
    f(&clock)
  }

  // ---- component lifecycle hooks -------------------------------------

  /// Brings the service into a defined state before configuration.
  pub fn initialize(&self) -> Result<()> {
    self.relax()
  }

  /// Applies the configured main clock and sim-clock parameters.
  pub fn tense(&self) -> Result<()> {
    let config = self.config.lock().unwrap().clone();
    {
      let _select = self.select_main_clock_mutex.lock().unwrap();
      self.select_main_clock_locked(&config.main_clock)?;
    }

    self.main_event_sink.update_timeout(config.time_update_timeout);

    if config.main_clock == CLOCK_LOCAL_SYSTEM_SIM_TIME {
      config.validate_sim_clock()?;
      self
        .simulation_clock
        .update_configuration(config.clock_sim_time_step_size, config.clock_sim_time_time_factor);
    }

    self.tensed.store(true, Ordering::SeqCst);
    Ok(())
  }

  pub fn relax(&self) -> Result<()> {
    self.tensed.store(false, Ordering::SeqCst);
    Ok(())
  }

  pub fn start(&self) -> Result<()> {
    let sink: Arc<dyn ClockEventSink> =
      Arc::clone(&self.event_sink_registry) as Arc<dyn ClockEventSink>;
    let weak: Weak<dyn ClockEventSink> = Arc::downgrade(&sink);
    self.with_current_clock(|clock| {
      debug!("clock '{}' is configured as main clock", clock.name());
      clock.start(weak);
    });
    self.started.store(true, Ordering::SeqCst);
    Ok(())
  }

  pub fn stop(&self) -> Result<()> {
    self.with_current_clock(|clock| clock.stop());
    self.started.store(false, Ordering::SeqCst);
    Ok(())
  }

  // ---- clock selection and inventory ---------------------------------

  /// Selects the main clock. Forbidden once started; an unknown name resets
  /// the selection to the default real-time clock and reports `NotFound`.
  pub fn select_main_clock(&self, clock_name: &str) -> Result<()> {
    if self.started.load(Ordering::SeqCst) {
      let e = Error::InvalidState(format!(
        "setting main clock {clock_name} failed: can not reset main clock after start of clock \
         service"
      ));
      error!("{e}");
      return Err(e);
    }
    let _select = self.select_main_clock_mutex.lock().unwrap();
    self.select_main_clock_locked(clock_name)
  }

  fn select_main_clock_locked(&self, clock_name: &str) -> Result<()> {
    match self.clock_registry.get_clock_adapter(clock_name) {
      Some(clock) => {
        {
          let guard = self.current_clock.lock();
          *guard.borrow_mut() = clock;
        }
        self.config.lock().unwrap().main_clock = clock_name.to_string();
        debug!("clock '{clock_name}' set as main clock of the clock service");
        Ok(())
      }
      None => {
        // Reset the selection to the default so the service stays usable.
        if let Some(fallback) = self
          .clock_registry
          .get_clock_adapter(CLOCK_LOCAL_SYSTEM_REAL_TIME)
        {
          let guard = self.current_clock.lock();
          *guard.borrow_mut() = fallback;
        }
        let e = Error::NotFound(format!(
          "setting main clock failed: a clock with the name {clock_name} is not registered, \
           resetting to default"
        ));
        error!("{e}");
        Err(e)
      }
    }
  }

  pub fn register_clock(&self, clock: ClockAdapter) -> Result<()> {
    if self.started.load(Ordering::SeqCst) {
      return Err(Error::InvalidState(format!(
        "registering clock {} failed: can not register clock after start of clock service",
        clock.name()
      )));
    }
    self.clock_registry.register_clock(clock)
  }

  pub fn unregister_clock(&self, clock_name: &str) -> Result<()> {
    if self.started.load(Ordering::SeqCst) {
      return Err(Error::InvalidState(format!(
        "unregistering clock {clock_name} failed: can not unregister clock after start of clock \
         service"
      )));
    }
    self.clock_registry.unregister_clock(clock_name)?;

    let _select = self.select_main_clock_mutex.lock().unwrap();
    if self.config.lock().unwrap().main_clock == clock_name {
      self.select_main_clock_locked(CLOCK_LOCAL_SYSTEM_REAL_TIME)?;
      warn!(
        "unregistered main clock {clock_name}, reset main clock to default value \
         {CLOCK_LOCAL_SYSTEM_REAL_TIME}"
      );
    }
    Ok(())
  }

  pub fn register_event_sink(&self, sink: EventSinkAdapter) -> Result<()> {
    if sink.expired() {
      return Err(Error::InvalidArg(
        "registering event sink failed: event sink does not exist".to_string(),
      ));
    }
    self.event_sink_registry.register_sink(sink)
  }

  pub fn unregister_event_sink(&self, sink: &EventSinkAdapter) -> Result<()> {
    if sink.expired() {
      return Err(Error::InvalidArg(
        "unregistering event sink failed: event sink does not exist".to_string(),
      ));
    }
    self.event_sink_registry.unregister_sink(sink)
  }

  // ---- queries --------------------------------------------------------

  /// Current time of the main clock; zero while the service is not started.
  pub fn time(&self) -> Timestamp {
    if !self.started.load(Ordering::SeqCst) {
      return Timestamp::ZERO;
    }
    self.with_current_clock(|clock| clock.time())
  }

  pub fn time_of(&self, clock_name: &str) -> Option<Timestamp> {
    match self.clock_registry.get_clock_adapter(clock_name) {
      Some(clock) => Some(clock.time()),
      None => {
        warn!("receiving clock time failed: a clock with the name {clock_name} is not registered");
        None
      }
    }
  }

  pub fn main_clock_name(&self) -> String {
    if !self.tensed.load(Ordering::SeqCst) {
      return self.config.lock().unwrap().main_clock.clone();
    }
    self.with_current_clock(|clock| clock.name())
  }

  pub fn main_clock_kind(&self) -> ClockKind {
    self.with_current_clock(|clock| clock.kind())
  }

  pub fn kind_of(&self, clock_name: &str) -> Option<ClockKind> {
    match self.clock_registry.get_clock_adapter(clock_name) {
      Some(clock) => Some(clock.kind()),
      None => {
        warn!("receiving clock type failed: a clock with the name {clock_name} is not registered");
        None
      }
    }
  }

  pub fn clock_names(&self) -> Vec<String> {
    self.clock_registry.clock_names()
  }

  pub fn is_started(&self) -> bool {
    self.started.load(Ordering::SeqCst)
  }

  /// Updates the stored configuration. Takes effect on the next `tense`.
  pub fn set_config(&self, config: ClockConfig) {
    *self.config.lock().unwrap() = config;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn service() -> Arc<ClockService> {
    ClockService::new(ClockConfig::default(), |_| None).unwrap()
  }

  #[test]
  fn time_is_zero_before_start() {
    let service = service();
    assert_eq!(service.time(), Timestamp::ZERO);
    service.tense().unwrap();
    service.start().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(2));
    assert!(service.time() > Timestamp::ZERO);
    service.stop().unwrap();
    assert_eq!(service.time(), Timestamp::ZERO);
  }

  #[test]
  fn select_main_clock_unknown_resets_to_default() {
    let service = service();
    service.select_main_clock(CLOCK_LOCAL_SYSTEM_SIM_TIME).unwrap();
    assert_eq!(service.main_clock_kind(), ClockKind::Discrete);

    match service.select_main_clock("nope") {
      Err(Error::NotFound(_)) => {}
      other => panic!("unexpected: {other:?}"),
    }
    // The active selection fell back to the default real-time clock.
    assert_eq!(service.main_clock_kind(), ClockKind::Continuous);
  }

  #[test]
  fn select_main_clock_forbidden_after_start() {
    let service = service();
    service.tense().unwrap();
    service.start().unwrap();
    match service.select_main_clock(CLOCK_LOCAL_SYSTEM_SIM_TIME) {
      Err(Error::InvalidState(_)) => {}
      other => panic!("unexpected: {other:?}"),
    }
    service.stop().unwrap();
  }

  #[test]
  fn selecting_twice_is_idempotent() {
    let service = service();
    service.select_main_clock(CLOCK_LOCAL_SYSTEM_SIM_TIME).unwrap();
    service.select_main_clock(CLOCK_LOCAL_SYSTEM_SIM_TIME).unwrap();
    assert_eq!(service.main_clock_name(), CLOCK_LOCAL_SYSTEM_SIM_TIME);
  }

  #[test]
  fn tense_validates_sim_clock_configuration() {
    let service = service();
    let mut config = ClockConfig::default();
    config.main_clock = CLOCK_LOCAL_SYSTEM_SIM_TIME.to_string();
    config.clock_sim_time_step_size = Timestamp::from_nanos(1); // below minimum
    service.set_config(config);
    assert!(service.tense().is_err());
  }

  #[test]
  fn clock_registration_forbidden_after_start() {
    let service = service();
    service.tense().unwrap();
    service.start().unwrap();
    let clock = ClockAdapter::current(Arc::new(SystemRealClock::new()));
    assert!(service.register_clock(clock).is_err());
    assert!(service.unregister_clock("whatever").is_err());
    service.stop().unwrap();
  }

  #[test]
  fn clock_names_include_natives() {
    let service = service();
    let names = service.clock_names();
    assert!(names.iter().any(|n| n == CLOCK_LOCAL_SYSTEM_REAL_TIME));
    assert!(names.iter().any(|n| n == CLOCK_LOCAL_SYSTEM_SIM_TIME));
  }
}
