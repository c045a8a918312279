// Participant RPC server.
//
// Hosts the named services of one participant and announces itself on the
// discovery domain: an `alive` heartbeat while running, a `bye` on shutdown.
// The listening socket of a deployment transport is represented by the
// `(url, port)` registration on the in-memory domain.

use std::{
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
  },
  thread,
  time::Duration,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::discovery::{split_url, DiscoveryDomain, DiscoverySample, ResponseType};
use crate::{
  error::{Error, Result},
  rpc::{RpcService, ServiceRegistry},
};

pub struct ParticipantServer {
  name: String,
  system_name: String,
  url: String,
  port: u16,
  services: Arc<ServiceRegistry>,
  domain: Arc<DiscoveryDomain>,
  discovery_active: bool,
  heartbeat_stop: Arc<AtomicBool>,
  heartbeat_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ParticipantServer {
  /// Brings the server online. A port of zero in `server_url` picks a free
  /// port from the well-known range.
  pub fn new(
    server_name: &str,
    server_url: &str,
    system_name: &str,
    system_url: &str,
    domain: Arc<DiscoveryDomain>,
    discovery_active: bool,
    heartbeat_interval: Duration,
  ) -> Result<Arc<Self>> {
    let (scheme, host, requested_port) = split_url(server_url).ok_or_else(|| {
      Error::InvalidArg(format!(
        "can not create server '{server_name}': url '{server_url}' is not well formed"
      ))
    })?;
    if scheme != "http" {
      return Err(Error::InvalidArg(format!(
        "can not create server '{server_name}': only http supported, got '{server_url}'"
      )));
    }

    let port = domain.allocate_port(requested_port)?;
    let url = format!("{scheme}://{host}:{port}");
    debug!("server '{server_name}' listening on {url}");

    let services = Arc::new(ServiceRegistry::new());
    let unique_service_name = format!("{server_name}@{system_name}");
    domain.register_server(&url, &unique_service_name, &services);

    let server = Arc::new(ParticipantServer {
      name: server_name.to_string(),
      system_name: system_name.to_string(),
      url,
      port,
      services,
      domain,
      discovery_active: discovery_active && !system_url.is_empty(),
      heartbeat_stop: Arc::new(AtomicBool::new(false)),
      heartbeat_thread: Mutex::new(None),
    });

    if server.discovery_active {
      server.start_heartbeat(heartbeat_interval)?;
    } else if discovery_active {
      return Err(Error::InvalidArg(format!(
        "can not create discoverable server '{server_name}' without a system url"
      )));
    }
    Ok(server)
  }

  fn announcement(&self, response_type: ResponseType) -> DiscoverySample {
    DiscoverySample {
      id: self.unique_service_name(),
      service_name: self.unique_service_name(),
      host_url: self.url.clone(),
      response_type,
    }
  }

  fn start_heartbeat(&self, interval: Duration) -> Result<()> {
    debug!("server '{}' starting heartbeat thread", self.name);
    // First alive goes out immediately so peers see the server without
    // waiting for a full interval.
    self.domain.publish(self.announcement(ResponseType::Alive));

    let stop = Arc::clone(&self.heartbeat_stop);
    let domain = Arc::clone(&self.domain);
    let sample = self.announcement(ResponseType::Alive);
    let handle = thread::Builder::new()
      .name(format!("heartbeat-{}", self.name))
      .spawn(move || {
        while !stop.load(Ordering::SeqCst) {
          // Sleep in short slices so shutdown does not wait a full interval.
          let mut remaining = interval;
          while !remaining.is_zero() && !stop.load(Ordering::SeqCst) {
            let slice = remaining.min(Duration::from_millis(100));
            thread::sleep(slice);
            remaining -= slice;
          }
          if stop.load(Ordering::SeqCst) {
            break;
          }
          domain.publish(sample.clone());
        }
      })
      .map_err(|e| Error::Unexpected(format!("cannot spawn heartbeat thread: {e}")))?;
    *self.heartbeat_thread.lock().unwrap() = Some(handle);
    Ok(())
  }

  pub fn name(&self) -> String {
    self.name.clone()
  }

  pub fn system_name(&self) -> String {
    self.system_name.clone()
  }

  pub fn url(&self) -> String {
    self.url.clone()
  }

  pub fn unique_service_name(&self) -> String {
    format!("{}@{}", self.name, self.system_name)
  }

  pub fn services(&self) -> &Arc<ServiceRegistry> {
    &self.services
  }

  pub fn register_service(&self, service_name: &str, service: Arc<dyn RpcService>) -> Result<()> {
    self.services.register(service_name, service)
  }

  pub fn unregister_service(&self, service_name: &str) -> Result<()> {
    self.services.unregister(service_name)
  }
}

impl Drop for ParticipantServer {
  fn drop(&mut self) {
    self.heartbeat_stop.store(true, Ordering::SeqCst);
    if let Some(handle) = self.heartbeat_thread.lock().unwrap().take() {
      let _ = handle.join();
    }
    if self.discovery_active {
      self.domain.publish(self.announcement(ResponseType::Bye));
    }
    self.domain.unregister_server(&self.url);
    self.domain.release_port(self.port);
  }
}
