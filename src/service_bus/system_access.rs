// Named system scope: the participant's view of one simulation system.
//
// Owns at most one server, performs discovery for the system, and resolves
// requester addresses by name. Server creation is lockable; while the hosting
// service bus is locked (after create), no new servers may appear.

use std::{
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
  },
  time::Duration,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::{
  discovery::{split_url, DiscoveryDomain, DiscoveryService, HostNameResolver},
  server::ParticipantServer,
  update_sink_registry::ServiceUpdateSink,
};
use crate::{
  error::{Error, Result},
  rpc::{LoopbackRequester, RpcRequester},
};

/// Default multicast-style system URL used when none is configured.
pub const DEFAULT_SYSTEM_URL: &str = "http://230.230.230.1:9990";
/// Default server URL; the zero port picks a free one.
pub const DEFAULT_SERVER_URL: &str = "http://0.0.0.0:0";

/// Per-round timeout of the active requester discovery.
pub const GET_REQUESTER_TIMEOUT: Duration = Duration::from_millis(1000);
/// Number of active discovery rounds before `get_requester` gives up.
pub const GET_REQUESTER_MAX_TRIES: usize = 10;

pub struct SystemAccess {
  system_name: String,
  system_url: String,
  server: Mutex<Option<Arc<ParticipantServer>>>,
  locked: AtomicBool,
  domain: Arc<DiscoveryDomain>,
  discovery: Option<DiscoveryService>,
  heartbeat_interval: Duration,
}

impl SystemAccess {
  /// Creates the access and, unless `system_url` is empty, starts its
  /// discovery loop.
  pub fn new(
    system_name: &str,
    system_url: &str,
    domain: Arc<DiscoveryDomain>,
    resolver: Arc<dyn HostNameResolver>,
    heartbeat_interval: Duration,
  ) -> Result<Self> {
    let discovery = if system_url.is_empty() {
      None
    } else {
      Some(DiscoveryService::start(
        system_name,
        Arc::clone(&domain),
        resolver,
        heartbeat_interval,
      )?)
    };
    Ok(SystemAccess {
      system_name: system_name.to_string(),
      system_url: system_url.to_string(),
      server: Mutex::new(None),
      locked: AtomicBool::new(false),
      domain,
      discovery,
      heartbeat_interval,
    })
  }

  pub fn name(&self) -> String {
    self.system_name.clone()
  }

  pub fn url(&self) -> String {
    self.system_url.clone()
  }

  pub fn lock(&self) {
    self.locked.store(true, Ordering::SeqCst);
  }

  pub fn unlock(&self) {
    self.locked.store(false, Ordering::SeqCst);
  }

  /// Creates the server of this access, replacing any previous one. While
  /// the access is locked this is an invalid state.
  pub fn create_server(
    &self,
    server_name: &str,
    server_url: &str,
    discovery_active: bool,
  ) -> Result<()> {
    if self.locked.load(Ordering::SeqCst) {
      return Err(Error::InvalidState(format!(
        "can not create server '{server_name}': system access '{}' is locked",
        self.system_name
      )));
    }
    let used_server_url = if server_url.is_empty() {
      DEFAULT_SERVER_URL
    } else {
      server_url
    };

    // Release the previous server before binding the new one; they may want
    // the same port.
    self.release_server();

    let server = ParticipantServer::new(
      server_name,
      used_server_url,
      &self.system_name,
      &self.system_url,
      Arc::clone(&self.domain),
      discovery_active,
      self.heartbeat_interval,
    )?;
    info!(
      "created participant server {server_name} with url {} which is{}discoverable",
      server.url(),
      if discovery_active { " " } else { " not " }
    );
    *self.server.lock().unwrap() = Some(server);
    Ok(())
  }

  /// Drops the current server. The name is logged before the server goes
  /// away. No-op while locked.
  pub fn release_server(&self) {
    if self.locked.load(Ordering::SeqCst) {
      return;
    }
    let server = self.server.lock().unwrap().take();
    if let Some(server) = server {
      info!(
        "releasing participant server {} with url {}",
        server.name(),
        server.url()
      );
      drop(server);
    }
  }

  pub fn server(&self) -> Option<Arc<ParticipantServer>> {
    self.server.lock().unwrap().clone()
  }

  /// Resolves a requester for `far_participant_name`.
  ///
  /// Resolution order: the local server (loopback), the passive discovery
  /// map, then up to [`GET_REQUESTER_MAX_TRIES`] active discovery rounds.
  /// Returns `None`, with an error log, when the participant stays unknown.
  pub fn get_requester(&self, far_participant_name: &str) -> Option<Arc<dyn RpcRequester>> {
    let mut found_url = String::new();

    if let Some(server) = self.server.lock().unwrap().as_ref() {
      if server.name() == far_participant_name {
        // Stay local; at least this server is in the system.
        found_url = server.url();
      }
    }

    if found_url.is_empty() {
      if let Some(discovery) = &self.discovery {
        for (name, url) in discovery.directory.discovered_services() {
          if name == far_participant_name {
            found_url = url;
            break;
          }
        }
        if found_url.is_empty() {
          for _ in 0..GET_REQUESTER_MAX_TRIES {
            let found = discovery.discovered_services(GET_REQUESTER_TIMEOUT);
            if let Some((_, url)) = found.into_iter().find(|(n, _)| n == far_participant_name) {
              found_url = url;
              break;
            }
          }
        }
      }
    }

    if found_url.is_empty() {
      error!("could not find nor create a requester for participant {far_participant_name}");
      return None;
    }

    match self.create_requester(far_participant_name, &found_url) {
      Ok(requester) => {
        debug!("created requester for participant {far_participant_name} and url {found_url}");
        Some(requester)
      }
      Err(e) => {
        error!("failed to get a requester for participant {far_participant_name}: {e}");
        None
      }
    }
  }

  /// Creates a requester for a known address. The wildcard bind address maps
  /// to loopback.
  pub fn create_requester(
    &self,
    far_server_name: &str,
    far_server_url: &str,
  ) -> Result<Arc<dyn RpcRequester>> {
    let (scheme, host, port) = split_url(far_server_url).ok_or_else(|| {
      Error::InvalidArg(format!(
        "can not create requester for '{far_server_name}': url '{far_server_url}' is not well \
         formed"
      ))
    })?;
    if scheme != "http" {
      return Err(Error::InvalidArg(format!(
        "can not create requester for '{far_server_name}': only http is supported, got \
         '{far_server_url}'"
      )));
    }
    let use_url = if host == "0.0.0.0" {
      format!("http://127.0.0.1:{port}")
    } else {
      far_server_url.to_string()
    };

    match self.domain.connect(&use_url) {
      Some(services) => Ok(Arc::new(LoopbackRequester::new(&services, far_server_name))),
      None => Err(Error::BadDevice(format!(
        "no server reachable at '{use_url}'"
      ))),
    }
  }

  /// Services currently known for this system, waiting up to `timeout` for a
  /// fresh discovery round.
  pub fn discover(&self, timeout: Duration) -> Vec<(String, String)> {
    match &self.discovery {
      Some(discovery) => discovery.discovered_services(timeout),
      None => Vec::new(),
    }
  }

  pub fn currently_discovered_services(&self) -> Vec<(String, String)> {
    match &self.discovery {
      Some(discovery) => discovery.directory.discovered_services(),
      None => Vec::new(),
    }
  }

  pub fn register_update_event_sink(&self, sink: Weak<dyn ServiceUpdateSink>) -> Result<()> {
    match &self.discovery {
      Some(discovery) => discovery.sink_registry.register_update_event_sink(sink),
      None => Err(Error::InvalidState(
        "system access has no discovery".to_string(),
      )),
    }
  }

  pub fn deregister_update_event_sink(&self, sink: &Weak<dyn ServiceUpdateSink>) -> Result<()> {
    match &self.discovery {
      Some(discovery) => discovery.sink_registry.deregister_update_event_sink(sink),
      None => Err(Error::InvalidState(
        "system access has no discovery".to_string(),
      )),
    }
  }
}
