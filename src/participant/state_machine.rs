// Participant lifecycle state machine.
//
// One mutex serializes every transition. A transition either moves to the
// next state after all of its steps succeeded, or rolls the completed steps
// back and leaves the state untouched, surfacing the first failure. The
// operations must not be re-entered from a thread already inside one.

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc, Mutex,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::{component_registry::ComponentRegistry, element::ElementManager};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
  Unloaded,
  Loaded,
  Initialized,
  Running,
  Paused,
  Finalized,
}

impl ParticipantState {
  pub fn name(&self) -> &'static str {
    match self {
      ParticipantState::Unloaded => "Unloaded",
      ParticipantState::Loaded => "Loaded",
      ParticipantState::Initialized => "Initialized",
      ParticipantState::Running => "Running",
      ParticipantState::Paused => "Paused",
      ParticipantState::Finalized => "Finalized",
    }
  }
}

fn invalid_transition(transition: &str, state: ParticipantState) -> Error {
  Error::InvalidState(format!(
    "transition '{transition}' is not allowed from state '{}'",
    state.name()
  ))
}

fn log_step(result: &Result<()>, success: &str, failure: &str) {
  match result {
    Ok(()) => info!("{success}"),
    Err(e) => error!("{failure}: {e}"),
  }
}

struct Inner {
  state: ParticipantState,
  element_manager: ElementManager,
  component_registry: Arc<ComponentRegistry>,
}

pub struct ParticipantStateMachine {
  inner: Mutex<Inner>,
  finalized: AtomicBool,
}

impl ParticipantStateMachine {
  pub fn new(element_manager: ElementManager, component_registry: Arc<ComponentRegistry>) -> Self {
    ParticipantStateMachine {
      inner: Mutex::new(Inner {
        state: ParticipantState::Unloaded,
        element_manager,
        component_registry,
      }),
      finalized: AtomicBool::new(false),
    }
  }

  pub fn current_state(&self) -> ParticipantState {
    self.inner.lock().unwrap().state
  }

  pub fn current_state_name(&self) -> String {
    self.current_state().name().to_string()
  }

  /// True once `exit` succeeded. Readable from any thread without taking
  /// the transition mutex.
  pub fn is_finalized(&self) -> bool {
    self.finalized.load(Ordering::SeqCst)
  }

  pub fn load(&self) -> Result<()> {
    let mut inner = self.inner.lock().unwrap();
    match inner.state {
      ParticipantState::Unloaded => {
        let result = inner.element_manager.load_element();
        log_step(&result, "successfully loaded element", "failed to load element");
        result?;
        inner.state = ParticipantState::Loaded;
        Ok(())
      }
      state => Err(invalid_transition("load", state)),
    }
  }

  pub fn unload(&self) -> Result<()> {
    let mut inner = self.inner.lock().unwrap();
    match inner.state {
      ParticipantState::Loaded => {
        inner.element_manager.unload_element();
        info!("successfully unloaded element");
        inner.state = ParticipantState::Unloaded;
        Ok(())
      }
      state => Err(invalid_transition("unload", state)),
    }
  }

  pub fn initialize(&self) -> Result<()> {
    let mut inner = self.inner.lock().unwrap();
    match inner.state {
      ParticipantState::Loaded => {
        let result = inner.element_manager.initialize_element();
        log_step(
          &result,
          "successfully initialized element",
          "failed to initialize element",
        );
        result?;

        let result = inner.component_registry.initialize();
        log_step(
          &result,
          "successfully initialized components",
          "failed to initialize components (rolling back initialization of element)",
        );
        if let Err(e) = result {
          inner.element_manager.deinitialize_element();
          info!("successfully deinitialized element");
          return Err(e);
        }

        let result = inner.component_registry.tense();
        log_step(
          &result,
          "successfully tensed components",
          "failed to tense components (rolling back initialization of components and element)",
        );
        if let Err(e) = result {
          let rollback = inner.component_registry.deinitialize();
          log_step(
            &rollback,
            "successfully deinitialized components",
            "deinitialized components with error",
          );
          inner.element_manager.deinitialize_element();
          info!("successfully deinitialized element");
          return Err(e);
        }

        inner.state = ParticipantState::Initialized;
        Ok(())
      }
      state => Err(invalid_transition("initialize", state)),
    }
  }

  /// Teardown variant: the steps run regardless of individual failures, the
  /// first failure is surfaced, and the state moves to `Loaded` either way.
  pub fn deinitialize(&self) -> Result<()> {
    let mut inner = self.inner.lock().unwrap();
    match inner.state {
      ParticipantState::Initialized => {
        let mut first_error = None;

        let result = inner.component_registry.relax();
        log_step(
          &result,
          "successfully relaxed components",
          "failed to relax components",
        );
        first_error = first_error.or(result.err());

        let result = inner.component_registry.deinitialize();
        log_step(
          &result,
          "successfully deinitialized components",
          "failed to deinitialize components",
        );
        first_error = first_error.or(result.err());

        inner.element_manager.deinitialize_element();
        info!("successfully deinitialized element");

        inner.state = ParticipantState::Loaded;
        match first_error {
          Some(e) => Err(e),
          None => Ok(()),
        }
      }
      state => Err(invalid_transition("deinitialize", state)),
    }
  }

  pub fn start(&self) -> Result<()> {
    let mut inner = self.inner.lock().unwrap();
    match inner.state {
      ParticipantState::Initialized => {
        let result = inner.element_manager.run_element();
        log_step(&result, "successfully ran element", "failed to run element");
        result?;

        let result = inner.component_registry.start();
        log_step(
          &result,
          "successfully started components",
          "failed to start components (rolling back start of element)",
        );
        if let Err(e) = result {
          inner.element_manager.stop_element();
          info!("successfully stopped element");
          return Err(e);
        }

        inner.state = ParticipantState::Running;
        Ok(())
      }
      // Resuming from Paused is reserved until pause is fully supported.
      ParticipantState::Paused => Err(Error::InvalidState(
        "pause state is not supported yet".to_string(),
      )),
      state => Err(invalid_transition("start", state)),
    }
  }

  pub fn stop(&self) -> Result<()> {
    let mut inner = self.inner.lock().unwrap();
    match inner.state {
      ParticipantState::Running => {
        let result = inner.component_registry.stop();
        log_step(
          &result,
          "successfully stopped components",
          "failed to stop components",
        );
        // The element stop is attempted regardless of the registry outcome.
        inner.element_manager.stop_element();
        info!("successfully stopped element");

        inner.state = ParticipantState::Initialized;
        result
      }
      ParticipantState::Paused => Err(Error::InvalidState(
        "pause state is not supported yet".to_string(),
      )),
      state => Err(invalid_transition("stop", state)),
    }
  }

  pub fn pause(&self) -> Result<()> {
    let mut inner = self.inner.lock().unwrap();
    match inner.state {
      ParticipantState::Initialized => {
        let result = inner.element_manager.run_element();
        log_step(&result, "successfully ran element", "failed to run element");
        result?;

        let result = inner.component_registry.pause();
        log_step(
          &result,
          "successfully paused components",
          "failed to pause components (rolling back start of element)",
        );
        if let Err(e) = result {
          inner.element_manager.stop_element();
          info!("successfully stopped element");
          return Err(e);
        }

        inner.state = ParticipantState::Paused;
        Ok(())
      }
      ParticipantState::Running => {
        let result = inner.component_registry.pause();
        log_step(
          &result,
          "successfully paused components",
          "failed to pause components",
        );
        result?;
        inner.state = ParticipantState::Paused;
        Ok(())
      }
      state => Err(invalid_transition("pause", state)),
    }
  }

  /// Terminal transition. After success every further operation reports
  /// `InvalidState` and `is_finalized` reads true from any thread.
  pub fn exit(&self) -> Result<()> {
    let mut inner = self.inner.lock().unwrap();
    match inner.state {
      ParticipantState::Unloaded => {
        inner.state = ParticipantState::Finalized;
        self.finalized.store(true, Ordering::SeqCst);
        Ok(())
      }
      state => Err(invalid_transition("exit", state)),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::Ordering as AtomicOrdering;

  use test_case::test_case;

  use super::*;
  use crate::participant::{
    component_registry::test_support::ProbeComponent,
    element::NoopElement,
  };

  fn machine_with_probe() -> (ParticipantStateMachine, Arc<ProbeComponent>) {
    let registry = Arc::new(ComponentRegistry::new());
    let probe = ProbeComponent::new("probe");
    registry.register(probe.clone()).unwrap();
    let machine = ParticipantStateMachine::new(
      ElementManager::new(NoopElement::factory("element")),
      registry,
    );
    (machine, probe)
  }

  #[test]
  fn lifecycle_happy_path() {
    let (machine, probe) = machine_with_probe();
    assert_eq!(machine.current_state_name(), "Unloaded");

    machine.load().unwrap();
    assert_eq!(machine.current_state_name(), "Loaded");
    machine.initialize().unwrap();
    assert_eq!(machine.current_state_name(), "Initialized");
    machine.start().unwrap();
    assert_eq!(machine.current_state_name(), "Running");
    machine.stop().unwrap();
    assert_eq!(machine.current_state_name(), "Initialized");
    machine.deinitialize().unwrap();
    assert_eq!(machine.current_state_name(), "Loaded");
    machine.unload().unwrap();
    assert_eq!(machine.current_state_name(), "Unloaded");
    machine.exit().unwrap();
    assert_eq!(machine.current_state_name(), "Finalized");
    assert!(machine.is_finalized());

    assert_eq!(
      probe.calls(),
      vec![
        "initialize",
        "tense",
        "start",
        "stop",
        "relax",
        "deinitialize"
      ]
    );
  }

  #[test_case("unload"; "unload from unloaded")]
  #[test_case("initialize"; "initialize from unloaded")]
  #[test_case("start"; "start from unloaded")]
  #[test_case("stop"; "stop from unloaded")]
  #[test_case("pause"; "pause from unloaded")]
  fn forbidden_transitions_leave_state_unchanged(transition: &str) {
    let (machine, _) = machine_with_probe();
    let result = match transition {
      "unload" => machine.unload(),
      "initialize" => machine.initialize(),
      "start" => machine.start(),
      "stop" => machine.stop(),
      "pause" => machine.pause(),
      other => panic!("unknown transition {other}"),
    };
    match result {
      Err(Error::InvalidState(message)) => {
        assert!(message.contains(transition));
        assert!(message.contains("Unloaded"));
      }
      other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(machine.current_state_name(), "Unloaded");
  }

  #[test]
  fn initialize_rollback_on_tense_failure() {
    let (machine, probe) = machine_with_probe();
    probe.fail_tense.store(true, AtomicOrdering::SeqCst);

    machine.load().unwrap();
    assert!(machine.initialize().is_err());
    // The failure left the participant in Loaded.
    assert_eq!(machine.current_state_name(), "Loaded");
    // The registry was deinitialized after its failed tense.
    assert_eq!(probe.calls(), vec!["initialize", "tense", "deinitialize"]);

    // The machine stays usable: a fixed configuration initializes fine.
    probe.fail_tense.store(false, AtomicOrdering::SeqCst);
    machine.initialize().unwrap();
    assert_eq!(machine.current_state_name(), "Initialized");
  }

  #[test]
  fn start_rollback_on_component_failure() {
    let (machine, probe) = machine_with_probe();
    probe.fail_start.store(true, AtomicOrdering::SeqCst);

    machine.load().unwrap();
    machine.initialize().unwrap();
    assert!(machine.start().is_err());
    assert_eq!(machine.current_state_name(), "Initialized");
  }

  #[test]
  fn initialize_rollback_on_component_initialize_failure() {
    let (machine, probe) = machine_with_probe();
    probe.fail_initialize.store(true, AtomicOrdering::SeqCst);

    machine.load().unwrap();
    assert!(machine.initialize().is_err());
    assert_eq!(machine.current_state_name(), "Loaded");
  }

  #[test]
  fn pause_from_running_and_reserved_resume() {
    let (machine, _) = machine_with_probe();
    machine.load().unwrap();
    machine.initialize().unwrap();
    machine.start().unwrap();
    machine.pause().unwrap();
    assert_eq!(machine.current_state_name(), "Paused");

    // Leaving Paused is reserved for now.
    assert!(machine.start().is_err());
    assert!(machine.stop().is_err());
    assert_eq!(machine.current_state_name(), "Paused");
  }

  #[test]
  fn exit_is_terminal() {
    let (machine, _) = machine_with_probe();
    machine.exit().unwrap();
    assert!(machine.is_finalized());
    assert!(machine.load().is_err());
    assert!(machine.exit().is_err());
    assert_eq!(machine.current_state_name(), "Finalized");
  }

  #[test]
  fn exit_requires_unloaded() {
    let (machine, _) = machine_with_probe();
    machine.load().unwrap();
    assert!(machine.exit().is_err());
    assert!(!machine.is_finalized());
  }
}
