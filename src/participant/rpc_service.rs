// Lifecycle RPC service: drives the state machine from remote tooling.
//
// Every transition answers with `{result, description}`; result 0 is
// success, negative values carry the error code of the failure.

use std::sync::{Arc, Weak};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde_json::{json, Value};

use super::state_machine::ParticipantStateMachine;
use crate::{
  error::OperationStatus,
  rpc::{status_response, RpcError, RpcResult, RpcService},
};

/// Default name of the lifecycle service on the participant server.
pub const PARTICIPANT_STATE_MACHINE_SERVICE: &str = "participant_statemachine";

pub struct ParticipantStateMachineService {
  machine: Weak<ParticipantStateMachine>,
}

impl ParticipantStateMachineService {
  pub fn new(machine: &Arc<ParticipantStateMachine>) -> Self {
    ParticipantStateMachineService {
      machine: Arc::downgrade(machine),
    }
  }
}

impl RpcService for ParticipantStateMachineService {
  fn handle(&self, method: &str, _params: &Value) -> RpcResult {
    let machine = self
      .machine
      .upgrade()
      .ok_or_else(|| RpcError::Transport("participant is gone".to_string()))?;

    let result = match method {
      "load" => machine.load(),
      "unload" => machine.unload(),
      "initialize" => machine.initialize(),
      "deinitialize" => machine.deinitialize(),
      "start" => machine.start(),
      "stop" => machine.stop(),
      "pause" => machine.pause(),
      "exit" => machine.exit(),
      "getCurrentStateName" => {
        return Ok(json!(machine.current_state_name()));
      }
      other => return Err(RpcError::UnknownMethod(other.to_string())),
    };
    Ok(status_response(&OperationStatus::from_result(&result)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::participant::{
    component_registry::ComponentRegistry, element::ElementManager, element::NoopElement,
    state_machine::ParticipantStateMachine,
  };

  fn service() -> (Arc<ParticipantStateMachine>, ParticipantStateMachineService) {
    let machine = Arc::new(ParticipantStateMachine::new(
      ElementManager::new(NoopElement::factory("e")),
      Arc::new(ComponentRegistry::new()),
    ));
    let service = ParticipantStateMachineService::new(&machine);
    (machine, service)
  }

  #[test]
  fn transitions_answer_with_status_objects() {
    let (_machine, service) = service();

    let ok = service.handle("load", &json!({})).unwrap();
    assert_eq!(ok["result"], 0);

    // load from Loaded is an invalid state; code must be negative.
    let err = service.handle("load", &json!({})).unwrap();
    assert!(err["result"].as_i64().unwrap() < 0);
    assert!(err["description"]
      .as_str()
      .unwrap()
      .contains("not allowed"));

    assert_eq!(
      service.handle("getCurrentStateName", &json!({})).unwrap(),
      json!("Loaded")
    );
  }

  #[test]
  fn unknown_method_rejected() {
    let (_machine, service) = service();
    assert!(service.handle("selfDestruct", &json!({})).is_err());
  }
}
