// Participant: one process-visible simulation member.
//
// Wires the service bus (system access + server + RPC services), the clock
// service, the simulation bus and the user element into a state machine that
// external tooling drives over RPC.

pub mod component_registry;
pub mod element;
pub mod rpc_service;
pub mod state_machine;

pub use component_registry::{Component, ComponentRegistry};
pub use element::{Element, ElementManager, NoopElement};
pub use rpc_service::{ParticipantStateMachineService, PARTICIPANT_STATE_MACHINE_SERVICE};
pub use state_machine::{ParticipantState, ParticipantStateMachine};

use std::sync::Arc;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  clock::ClockService,
  config::ParticipantConfig,
  error::{Error, Result},
  rpc::RpcRequester,
  service_bus::ServiceBus,
  sim_bus::SimulationBus,
};

/// A runtime participant, identified process-wide by its immutable
/// `(participant_name, system_name)` pair.
pub struct Participant {
  participant_name: String,
  system_name: String,
  service_bus: Arc<ServiceBus>,
  clock_service: Arc<ClockService>,
  simulation_bus: Arc<SimulationBus>,
  state_machine: Arc<ParticipantStateMachine>,
}

impl Participant {
  /// Builds a participant hosting the element produced by `element_factory`.
  ///
  /// The participant appears on the service bus as
  /// `<participant_name>@<system_name>` with the lifecycle, clock and clock
  /// sync services registered on its server.
  pub fn new<F>(
    participant_name: &str,
    system_name: &str,
    config: ParticipantConfig,
    element_factory: F,
  ) -> Result<Self>
  where
    F: Fn() -> Result<Box<dyn Element>> + Send + 'static,
  {
    if participant_name.is_empty() || system_name.is_empty() {
      return Err(Error::InvalidArg(
        "participant and system name must not be empty".to_string(),
      ));
    }

    let service_bus = Arc::new(ServiceBus::new(config.service_bus.clone()));
    service_bus.create_system_access(system_name, "", true)?;
    let access = service_bus
      .default_access()
      .ok_or_else(|| Error::Unexpected("default system access missing".to_string()))?;
    let server_url = config.service_bus.server_url.clone().unwrap_or_default();
    access.create_server(participant_name, &server_url, true)?;
    let server = access
      .server()
      .ok_or_else(|| Error::Unexpected("participant server missing".to_string()))?;

    // The clock master resolves its sync clients through the service bus.
    // Weakly held: the bus transitively owns the clock services through its
    // server, so a strong reference here would keep the bus alive forever.
    let lookup_bus = Arc::downgrade(&service_bus);
    let clock_service = ClockService::new(config.clock.clone(), move |name| {
      lookup_bus.upgrade().and_then(|bus| bus.get_requester(name))
    })?;
    clock_service.register_rpc_services(server.services())?;

    let simulation_bus = Arc::new(SimulationBus::new(
      participant_name,
      system_name,
      config.sim_bus.clone(),
    ));

    let component_registry = Arc::new(ComponentRegistry::new());
    component_registry.register(Arc::new(ClockServiceComponent(Arc::clone(&clock_service))))?;
    component_registry.register(Arc::new(SimulationBusComponent(Arc::clone(
      &simulation_bus,
    ))))?;

    let state_machine = Arc::new(ParticipantStateMachine::new(
      ElementManager::new(element_factory),
      component_registry,
    ));
    server.register_service(
      PARTICIPANT_STATE_MACHINE_SERVICE,
      Arc::new(ParticipantStateMachineService::new(&state_machine)),
    )?;

    // The component stack is complete; no further servers may be created.
    service_bus.lock();

    Ok(Participant {
      participant_name: participant_name.to_string(),
      system_name: system_name.to_string(),
      service_bus,
      clock_service,
      simulation_bus,
      state_machine,
    })
  }

  pub fn name(&self) -> &str {
    &self.participant_name
  }

  pub fn system_name(&self) -> &str {
    &self.system_name
  }

  pub fn state_machine(&self) -> &Arc<ParticipantStateMachine> {
    &self.state_machine
  }

  pub fn clock_service(&self) -> &Arc<ClockService> {
    &self.clock_service
  }

  pub fn simulation_bus(&self) -> &Arc<SimulationBus> {
    &self.simulation_bus
  }

  pub fn service_bus(&self) -> &Arc<ServiceBus> {
    &self.service_bus
  }

  /// Requester to another participant of the same system.
  pub fn get_requester(&self, far_participant_name: &str) -> Option<Arc<dyn RpcRequester>> {
    self.service_bus.get_requester(far_participant_name)
  }
}

impl Drop for Participant {
  fn drop(&mut self) {
    self.service_bus.unlock();
  }
}

// ----------------------------------------------
// Component adapters
// ----------------------------------------------

struct ClockServiceComponent(Arc<ClockService>);

impl Component for ClockServiceComponent {
  fn name(&self) -> &str {
    "clock_service"
  }
  fn initialize(&self) -> Result<()> {
    self.0.initialize()
  }
  fn tense(&self) -> Result<()> {
    self.0.tense()
  }
  fn relax(&self) -> Result<()> {
    self.0.relax()
  }
  fn start(&self) -> Result<()> {
    self.0.start()
  }
  fn stop(&self) -> Result<()> {
    self.0.stop()
  }
}

struct SimulationBusComponent(Arc<SimulationBus>);

impl Component for SimulationBusComponent {
  fn name(&self) -> &str {
    "simulation_bus"
  }
  fn initialize(&self) -> Result<()> {
    self.0.initialize()
  }
  fn deinitialize(&self) -> Result<()> {
    self.0.deinitialize()
  }
  fn stop(&self) -> Result<()> {
    // A reception session still running would outlive the Running state.
    self.0.stop_blocking_reception();
    Ok(())
  }
}
