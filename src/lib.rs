//! A runtime for distributed, time-coordinated simulation participants.
//!
//! A [`Participant`](participant::Participant) hosts a user-supplied compute
//! element, exposes it on a service bus under `<participant>@<system>`,
//! synchronises its notion of simulation time with peers, and exchanges typed
//! data samples over a publish/subscribe simulation bus.
//!
//! # Walkthrough
//!
//! ```
//! use simrt::{
//!   config::ParticipantConfig,
//!   participant::{NoopElement, Participant},
//! };
//!
//! let participant = Participant::new(
//!   "demo_participant",
//!   "demo_system",
//!   ParticipantConfig::default(),
//!   NoopElement::factory("demo_element"),
//! )
//! .unwrap();
//!
//! let machine = participant.state_machine();
//! machine.load().unwrap();
//! machine.initialize().unwrap();
//! machine.start().unwrap();
//! assert_eq!(machine.current_state_name(), "Running");
//! machine.stop().unwrap();
//! machine.deinitialize().unwrap();
//! machine.unload().unwrap();
//! machine.exit().unwrap();
//! assert!(machine.is_finalized());
//! ```
//!
//! # Subsystems
//!
//! * [`participant`]: lifecycle state machine, element hosting, component
//!   registry, lifecycle RPC.
//! * [`clock`]: pluggable clocks, event-sink fan-out, the clock master
//!   driving remote time clients over RPC, and the clock service.
//! * [`service_bus`]: named system accesses, participant servers, discovery
//!   and requester resolution.
//! * [`sim_bus`]: typed topics, QoS profile selection by stream-type size,
//!   and the wait-set reception loop.
//!
//! The concrete network transports stay behind seams
//! ([`rpc::RpcRequester`], the simulation-bus endpoint layer); the crate
//! ships in-process implementations of both, so participants within one
//! process interact through the same code paths a networked deployment
//! would use.

pub mod config;
pub mod error;
pub mod guard;
pub mod rpc;
pub mod time;
pub mod worker;

pub mod clock;
pub mod participant;
pub mod service_bus;
pub mod sim_bus;

pub use error::{Error, Result};
pub use time::Timestamp;

pub use clock::{Clock, ClockEventSink, ClockKind, ClockService};
pub use participant::{Element, Participant, ParticipantState, ParticipantStateMachine};
pub use service_bus::ServiceBus;
pub use sim_bus::{DataReader, DataReceiver, DataSample, SimulationBus, StreamType};
