// Explicit participant configuration.
//
// The runtime core never reads the process environment; the embedding layer
// fills this struct (optionally via `ParticipantConfig::from_env`) and hands
// it to `Participant::new`. Field names follow the configuration node names
// visible to remote tooling.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  error::{Error, Result},
  time::Timestamp,
};

/// Name of the built-in continuous real-time clock.
pub const CLOCK_LOCAL_SYSTEM_REAL_TIME: &str = "local_system_realtime";
/// Name of the built-in discrete simulation clock.
pub const CLOCK_LOCAL_SYSTEM_SIM_TIME: &str = "local_system_simtime";

/// Time factor value meaning "as fast as possible".
pub const SIM_TIME_TIME_FACTOR_AFAP: f64 = 0.0;

/// Lower bound for the clock-master per-event timeout. Configured values
/// below this are clamped up with a warning.
pub const TIME_UPDATE_TIMEOUT_MIN: Timestamp = Timestamp::from_millis(100);
/// Default clock-master per-event timeout.
pub const TIME_UPDATE_TIMEOUT_DEFAULT: Timestamp = Timestamp::from_secs(5);

/// Simulation clock step size bounds and default.
pub const SIM_TIME_STEP_SIZE_MIN: Timestamp = Timestamp::from_micros(1);
pub const SIM_TIME_STEP_SIZE_MAX: Timestamp = Timestamp::from_secs(3600);
pub const SIM_TIME_STEP_SIZE_DEFAULT: Timestamp = Timestamp::from_millis(100);

/// Bounds for the wall-clock step derived from step size and time factor.
pub const WALL_CLOCK_STEP_SIZE_MIN: Timestamp = Timestamp::from_micros(100);
pub const WALL_CLOCK_STEP_SIZE_MAX: Timestamp = Timestamp::from_secs(60);

/// Environment variable names honoured by `from_env`. The core itself never
/// touches them.
pub const ENV_LOG_SEVERITY: &str = "SIMRT_LOG_SEVERITY";
pub const ENV_NETWORK_INTERFACE: &str = "SIMRT_NETWORK_INTERFACE";
pub const ENV_DISCOVERY_DOMAIN: &str = "SIMRT_DISCOVERY_DOMAIN";
pub const ENV_SYSTEM_URL: &str = "SIMRT_SYSTEM_URL";
pub const ENV_SERVER_URL: &str = "SIMRT_SERVER_URL";

/// Clock service configuration nodes.
#[derive(Debug, Clone)]
pub struct ClockConfig {
  /// `main_clock`
  pub main_clock: String,
  /// `time_update_timeout`: how long the clock master waits for its clients
  /// on each distributed event.
  pub time_update_timeout: Timestamp,
  /// `clock_sim_time_time_factor`: sim-time speed; 0.0 = as fast as possible.
  pub clock_sim_time_time_factor: f64,
  /// `clock_sim_time_step_size`
  pub clock_sim_time_step_size: Timestamp,
}

impl Default for ClockConfig {
  fn default() -> Self {
    ClockConfig {
      main_clock: CLOCK_LOCAL_SYSTEM_REAL_TIME.to_string(),
      time_update_timeout: TIME_UPDATE_TIMEOUT_DEFAULT,
      clock_sim_time_time_factor: 1.0,
      clock_sim_time_step_size: SIM_TIME_STEP_SIZE_DEFAULT,
    }
  }
}

impl ClockConfig {
  /// Validates the simulation clock parameters. Called by the clock service
  /// during `tense` when the simulation clock is the main clock.
  pub fn validate_sim_clock(&self) -> Result<()> {
    let step = self.clock_sim_time_step_size;
    if step < SIM_TIME_STEP_SIZE_MIN || step > SIM_TIME_STEP_SIZE_MAX {
      return Err(Error::InvalidArg(format!(
        "invalid clock step size of {step}: step size has to be >= {SIM_TIME_STEP_SIZE_MIN} and \
         <= {SIM_TIME_STEP_SIZE_MAX}"
      )));
    }
    if self.clock_sim_time_time_factor < SIM_TIME_TIME_FACTOR_AFAP {
      return Err(Error::InvalidArg(format!(
        "invalid clock time factor of {}: time factor has to be >= {}",
        self.clock_sim_time_time_factor, SIM_TIME_TIME_FACTOR_AFAP
      )));
    }
    if self.clock_sim_time_time_factor == SIM_TIME_TIME_FACTOR_AFAP {
      // As fast as possible: no wall clock pacing to validate.
      return Ok(());
    }

    let wall_step_nanos = step.nanos() as f64 / self.clock_sim_time_time_factor;
    if wall_step_nanos < WALL_CLOCK_STEP_SIZE_MIN.nanos() as f64
      || wall_step_nanos > WALL_CLOCK_STEP_SIZE_MAX.nanos() as f64
    {
      return Err(Error::InvalidArg(format!(
        "invalid wall clock step size of {wall_step_nanos}ns resulting from step size {step} and \
         time factor {}: wall clock step size has to be >= {WALL_CLOCK_STEP_SIZE_MIN} and <= \
         {WALL_CLOCK_STEP_SIZE_MAX}",
        self.clock_sim_time_time_factor
      )));
    }
    Ok(())
  }
}

/// Simulation bus configuration nodes.
#[derive(Debug, Clone)]
pub struct SimBusConfig {
  /// `participant_domain`
  pub participant_domain: u32,
  /// `datawriter_ready_timeout`: how long reader creation may wait for a
  /// matching writer. Zero disables the wait.
  pub datawriter_ready_timeout: Timestamp,
  /// `must_be_ready_signals`: which signals the timeout applies to.
  /// A single `"*"` entry means all.
  pub must_be_ready_signals: Vec<String>,
  /// `use_async_waitset`: pool-backed reception instead of the
  /// single-threaded loop.
  pub use_async_waitset: bool,
  /// `async_waitset_threads`
  pub async_waitset_threads: usize,
}

impl Default for SimBusConfig {
  fn default() -> Self {
    SimBusConfig {
      participant_domain: 0,
      datawriter_ready_timeout: Timestamp::ZERO,
      must_be_ready_signals: Vec::new(),
      use_async_waitset: false,
      async_waitset_threads: 2,
    }
  }
}

impl SimBusConfig {
  /// Pool size with the documented floor of two threads.
  pub fn effective_waitset_threads(&self) -> usize {
    self.async_waitset_threads.max(2)
  }

  /// True when `signal` is covered by `must_be_ready_signals`.
  pub fn signal_must_be_ready(&self, signal: &str) -> bool {
    if self.must_be_ready_signals.len() == 1 && self.must_be_ready_signals[0] == "*" {
      return true;
    }
    self.must_be_ready_signals.iter().any(|s| s == signal)
  }
}

/// Service bus configuration.
#[derive(Debug, Clone)]
pub struct ServiceBusConfig {
  /// Discovery domain. Accesses in different domains never see each other.
  pub discovery_domain: u32,
  /// Interval between discovery searches and heartbeats.
  pub heartbeat_interval: std::time::Duration,
  /// Network interface selector, opaque to the core.
  pub network_interface: Option<String>,
  /// Optional override for the system URL.
  pub system_url: Option<String>,
  /// Optional override for the server URL.
  pub server_url: Option<String>,
}

impl Default for ServiceBusConfig {
  fn default() -> Self {
    ServiceBusConfig {
      discovery_domain: 0,
      heartbeat_interval: std::time::Duration::from_secs(5),
      network_interface: None,
      system_url: None,
      server_url: None,
    }
  }
}

/// Complete participant configuration.
#[derive(Debug, Clone, Default)]
pub struct ParticipantConfig {
  pub clock: ClockConfig,
  pub sim_bus: SimBusConfig,
  pub service_bus: ServiceBusConfig,
}

/// Logging severity override (integer code) for the embedding layer's logger
/// setup. The runtime itself only talks to the `log` facade.
pub fn log_severity_from_env() -> Option<i32> {
  std::env::var(ENV_LOG_SEVERITY).ok()?.trim().parse().ok()
}

impl ParticipantConfig {
  /// Embedding-layer helper: applies the documented environment variables on
  /// top of the defaults. The returned config can be edited further before
  /// constructing the participant.
  pub fn from_env() -> Self {
    let mut config = ParticipantConfig::default();
    if let Ok(domain) = std::env::var(ENV_DISCOVERY_DOMAIN) {
      match domain.parse::<u32>() {
        Ok(d) => config.service_bus.discovery_domain = d,
        Err(_) => warn!("ignoring non-numeric {ENV_DISCOVERY_DOMAIN}='{domain}'"),
      }
    }
    if let Ok(interface) = std::env::var(ENV_NETWORK_INTERFACE) {
      config.service_bus.network_interface = Some(interface);
    }
    if let Ok(url) = std::env::var(ENV_SYSTEM_URL) {
      config.service_bus.system_url = Some(url);
    }
    if let Ok(url) = std::env::var(ENV_SERVER_URL) {
      config.service_bus.server_url = Some(url);
    }
    config
  }
}
