// Service bus: named system accesses hosting RPC servers, discovery and
// requester resolution.

pub mod discovery;
pub mod server;
pub mod system_access;
pub mod update_sink_registry;

pub use discovery::{
  DefaultHostNameResolver, DiscoveryDomain, DiscoverySample, HostNameResolver, ResponseType,
  ServiceDirectory, ServiceUpdateEvent, ServiceUpdateEventType, DISCOVER_ALL_SYSTEMS,
};
pub use server::ParticipantServer;
pub use system_access::{SystemAccess, DEFAULT_SERVER_URL, DEFAULT_SYSTEM_URL};
pub use update_sink_registry::{ServiceUpdateSink, ServiceUpdateSinkRegistry};

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc, Mutex,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  config::ServiceBusConfig,
  error::{Error, Result},
  rpc::RpcRequester,
};

/// The participant's collection of system accesses. One access is the
/// default; most callers go through it.
pub struct ServiceBus {
  system_accesses: Mutex<Vec<Arc<SystemAccess>>>,
  default_access: Mutex<Option<Arc<SystemAccess>>>,
  locked: AtomicBool,
  config: ServiceBusConfig,
  resolver: Arc<dyn HostNameResolver>,
}

impl ServiceBus {
  pub fn new(config: ServiceBusConfig) -> Self {
    Self::with_resolver(config, Arc::new(DefaultHostNameResolver))
  }

  pub fn with_resolver(config: ServiceBusConfig, resolver: Arc<dyn HostNameResolver>) -> Self {
    ServiceBus {
      system_accesses: Mutex::new(Vec::new()),
      default_access: Mutex::new(None),
      locked: AtomicBool::new(false),
      config,
      resolver,
    }
  }

  /// Creates a named system access. Duplicate names are invalid; while the
  /// bus is locked nothing can be created.
  pub fn create_system_access(
    &self,
    system_name: &str,
    system_url: &str,
    set_as_default: bool,
  ) -> Result<()> {
    if self.locked.load(Ordering::SeqCst) {
      return Err(Error::InvalidState(format!(
        "can not create system access '{system_name}': service bus is locked"
      )));
    }
    let mut accesses = self.system_accesses.lock().unwrap();
    if accesses.iter().any(|a| a.name() == system_name) {
      return Err(Error::InvalidArg(format!(
        "can not create system access point '{system_name}': system name already exists"
      )));
    }

    let used_system_url = match system_url {
      "" => self
        .config
        .system_url
        .clone()
        .unwrap_or_else(|| DEFAULT_SYSTEM_URL.to_string()),
      other => other.to_string(),
    };

    let access = Arc::new(SystemAccess::new(
      system_name,
      &used_system_url,
      DiscoveryDomain::for_domain(self.config.discovery_domain),
      Arc::clone(&self.resolver),
      self.config.heartbeat_interval,
    )?);
    debug!("created system access, system name: {system_name}, url {used_system_url}");
    accesses.push(Arc::clone(&access));
    if set_as_default {
      *self.default_access.lock().unwrap() = Some(access);
    }
    Ok(())
  }

  pub fn release_system_access(&self, system_name: &str) -> Result<()> {
    if self.locked.load(Ordering::SeqCst) {
      return Err(Error::InvalidState(format!(
        "can not release system access '{system_name}': service bus locked"
      )));
    }
    let mut accesses = self.system_accesses.lock().unwrap();
    match accesses.iter().position(|a| a.name() == system_name) {
      Some(index) => {
        accesses.remove(index);
        let mut default = self.default_access.lock().unwrap();
        if default.as_ref().map(|d| d.name()) == Some(system_name.to_string()) {
          *default = None;
        }
        Ok(())
      }
      None => Err(Error::InvalidArg(format!(
        "can not find system access '{system_name}' to destroy it"
      ))),
    }
  }

  /// Access by name; an empty name means the default access.
  pub fn system_access(&self, system_name: &str) -> Option<Arc<SystemAccess>> {
    let accesses = self.system_accesses.lock().unwrap();
    if let Some(access) = accesses.iter().find(|a| a.name() == system_name) {
      return Some(Arc::clone(access));
    }
    drop(accesses);
    if system_name.is_empty() {
      return self.default_access();
    }
    None
  }

  pub fn default_access(&self) -> Option<Arc<SystemAccess>> {
    self.default_access.lock().unwrap().clone()
  }

  pub fn server(&self) -> Option<Arc<ParticipantServer>> {
    self.default_access().and_then(|a| a.server())
  }

  /// Requester by participant name through the default access.
  pub fn get_requester(&self, far_server_name: &str) -> Option<Arc<dyn RpcRequester>> {
    match self.default_access() {
      Some(access) => {
        let requester = access.get_requester(far_server_name);
        if requester.is_none() {
          error!("can not find far server: {far_server_name}");
        }
        requester
      }
      None => None,
    }
  }

  /// Requester by known address, bypassing discovery.
  pub fn get_requester_by_address(&self, far_server_address: &str) -> Result<Arc<dyn RpcRequester>> {
    match self.default_access() {
      Some(access) => access.create_requester(far_server_address, far_server_address),
      None => Err(Error::InvalidState("no default system access".to_string())),
    }
  }

  /// Locks the bus and every access: no further server or access creation.
  /// Called when the surrounding component stack has been created.
  pub fn lock(&self) {
    self.locked.store(true, Ordering::SeqCst);
    for access in self.system_accesses.lock().unwrap().iter() {
      access.lock();
    }
  }

  pub fn unlock(&self) {
    for access in self.system_accesses.lock().unwrap().iter() {
      access.unlock();
    }
    self.locked.store(false, Ordering::SeqCst);
  }
}
