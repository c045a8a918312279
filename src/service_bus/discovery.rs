// Service discovery pipeline.
//
// Inbound discovery samples are classified, their host names resolved, folded
// into the per-access service directory and fanned out to registered update
// sinks. The wire itself stays behind `DiscoveryDomain`: an in-memory broker
// shared by every access of the same domain id, standing in for the
// out-of-scope network transport.

use std::{
  collections::HashMap,
  sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc, Condvar, Mutex, OnceLock, Weak,
  },
  thread,
  time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

use super::update_sink_registry::ServiceUpdateSinkRegistry;
use crate::{
  error::{Error, Result},
  rpc::ServiceRegistry,
};

/// Reserved system name matching every system during discovery.
pub const DISCOVER_ALL_SYSTEMS: &str = "*";

/// Entries not refreshed for this long are swept from the directory.
pub const SERVICE_LEASE: Duration = Duration::from_secs(20);

/// Wire form of a discovery message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySample {
  pub id: String,
  pub service_name: String, // "<server>@<system>"
  pub host_url: String,
  pub response_type: ResponseType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
  Discover,
  Bye,
  Alive,
  Response,
}

/// Classified event as seen by the directory and the update sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUpdateEvent {
  pub service_name: String,
  pub system_name: String,
  pub host_url: String,
  pub event_id: ServiceUpdateEventType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceUpdateEventType {
  NotifyAlive,
  NotifyBye,
  Response,
}

impl ServiceUpdateEventType {
  fn from_response_type(rt: ResponseType) -> Option<Self> {
    match rt {
      ResponseType::Alive => Some(ServiceUpdateEventType::NotifyAlive),
      ResponseType::Bye => Some(ServiceUpdateEventType::NotifyBye),
      ResponseType::Response => Some(ServiceUpdateEventType::Response),
      // Discover messages are requests, not service state.
      ResponseType::Discover => None,
    }
  }
}

// ----------------------------------------------
// Host name resolution seam
// ----------------------------------------------

/// Converts host names in discovered URLs to numeric addresses before events
/// leave the pipeline. Injectable so tests can observe and fake it.
pub trait HostNameResolver: Send + Sync {
  fn resolve(&self, host: &str) -> Result<String>;
}

/// Default resolver: numeric addresses pass through, `localhost` becomes the
/// loopback address, anything else is left as-is with a debug note.
pub struct DefaultHostNameResolver;

impl HostNameResolver for DefaultHostNameResolver {
  fn resolve(&self, host: &str) -> Result<String> {
    if host == "localhost" {
      return Ok("127.0.0.1".to_string());
    }
    if host.chars().all(|c| c.is_ascii_digit() || c == '.') || host.contains(':') {
      return Ok(host.to_string());
    }
    debug!("host name '{host}' not resolved, passing through");
    Ok(host.to_string())
  }
}

/// Rewrites the host part of `http://host:port` through the resolver.
pub fn resolve_url_host(url: &str, resolver: &dyn HostNameResolver) -> Result<String> {
  match split_url(url) {
    Some((scheme, host, port)) => {
      let resolved = resolver.resolve(host)?;
      Ok(format!("{scheme}://{resolved}:{port}"))
    }
    None => Err(Error::InvalidArg(format!("url '{url}' is not well formed"))),
  }
}

/// Splits `scheme://host:port` into its parts.
pub fn split_url(url: &str) -> Option<(&str, &str, u16)> {
  let (scheme, rest) = url.split_once("://")?;
  let (host, port) = rest.rsplit_once(':')?;
  let port = port.parse::<u16>().ok()?;
  if host.is_empty() {
    return None;
  }
  Some((scheme, host, port))
}

// ----------------------------------------------
// Service directory
// ----------------------------------------------

/// Latest `(last_seen, host_url)` per unique service name.
pub struct ServiceDirectory {
  services: Mutex<HashMap<String, (DateTime<Utc>, String)>>,
}

impl ServiceDirectory {
  pub fn new() -> Self {
    ServiceDirectory {
      services: Mutex::new(HashMap::new()),
    }
  }

  /// Folds one classified event into the directory and forwards it to the
  /// update sinks, filtered by system name. Returns true if the event
  /// concerned this system.
  pub fn update(
    &self,
    event: ServiceUpdateEvent,
    system_name: &str,
    sink_registry: &ServiceUpdateSinkRegistry,
  ) -> bool {
    let search_all_systems = system_name == DISCOVER_ALL_SYSTEMS;

    // The unique service name has the form "<server>@<system>".
    let full_name = &event.service_name;
    let (received_service, received_system) = match full_name.split_once('@') {
      Some((s, sys)) => (s.to_string(), sys.to_string()),
      None => (full_name.clone(), String::new()),
    };

    if search_all_systems {
      self.fold(full_name, event.event_id, &event.host_url);
      sink_registry.update_event(&ServiceUpdateEvent {
        service_name: received_service,
        system_name: received_system,
        host_url: event.host_url,
        event_id: event.event_id,
      });
      true
    } else if system_name == received_system {
      self.fold(&received_service, event.event_id, &event.host_url);
      sink_registry.update_event(&ServiceUpdateEvent {
        service_name: received_service,
        system_name: received_system,
        host_url: event.host_url,
        event_id: event.event_id,
      });
      true
    } else {
      // A server belonging to another system.
      false
    }
  }

  fn fold(&self, name: &str, event_id: ServiceUpdateEventType, host_url: &str) {
    match event_id {
      ServiceUpdateEventType::NotifyAlive | ServiceUpdateEventType::Response => {
        let mut services = self.services.lock().unwrap();
        services.insert(name.to_string(), (Utc::now(), host_url.to_string()));
      }
      ServiceUpdateEventType::NotifyBye => {
        let mut services = self.services.lock().unwrap();
        services.remove(name);
      }
    }
  }

  /// Evicts entries whose lease expired.
  pub fn remove_old_devices(&self) {
    let now = Utc::now();
    let lease = chrono::Duration::from_std(SERVICE_LEASE).unwrap_or(chrono::Duration::seconds(20));
    let mut services = self.services.lock().unwrap();
    services.retain(|_, (last_seen, _)| now.signed_duration_since(*last_seen) <= lease);
  }

  pub fn discovered_services(&self) -> Vec<(String, String)> {
    let services = self.services.lock().unwrap();
    let mut list: Vec<(String, String)> = services
      .iter()
      .map(|(name, (_, url))| (name.clone(), url.clone()))
      .collect();
    list.sort();
    list
  }
}

impl Default for ServiceDirectory {
  fn default() -> Self {
    Self::new()
  }
}

// ----------------------------------------------
// In-memory discovery domain (wire stand-in)
// ----------------------------------------------

/// Broker shared by all system accesses of one discovery domain. Carries
/// discovery samples between them, answers searches from the set of online
/// servers, routes requester connections by URL and hands out free ports.
pub struct DiscoveryDomain {
  subscribers: Mutex<Vec<mpsc::Sender<DiscoverySample>>>,
  servers: Mutex<HashMap<String, OnlineServer>>, // keyed by url
  ports_in_use: Mutex<Vec<u16>>,
}

struct OnlineServer {
  unique_service_name: String,
  services: Weak<ServiceRegistry>,
}

/// Port range a server URL with port 0 picks from.
pub const PORT_RANGE_BEGIN: u16 = 9090;
pub const PORT_RANGE_END: u16 = 10090;

static DOMAINS: OnceLock<Mutex<HashMap<u32, Arc<DiscoveryDomain>>>> = OnceLock::new();

impl DiscoveryDomain {
  /// The process-wide broker for `domain_id`.
  pub fn for_domain(domain_id: u32) -> Arc<DiscoveryDomain> {
    let domains = DOMAINS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut domains = domains.lock().unwrap();
    Arc::clone(
      domains
        .entry(domain_id)
        .or_insert_with(|| Arc::new(DiscoveryDomain::new())),
    )
  }

  pub fn new() -> Self {
    DiscoveryDomain {
      subscribers: Mutex::new(Vec::new()),
      servers: Mutex::new(HashMap::new()),
      ports_in_use: Mutex::new(Vec::new()),
    }
  }

  pub fn subscribe(&self) -> mpsc::Receiver<DiscoverySample> {
    let (sender, receiver) = mpsc::channel();
    self.subscribers.lock().unwrap().push(sender);
    receiver
  }

  /// Publishes a sample to every subscriber. Dead subscribers are dropped.
  pub fn publish(&self, sample: DiscoverySample) {
    let mut subscribers = self.subscribers.lock().unwrap();
    subscribers.retain(|s| s.send(sample.clone()).is_ok());
  }

  /// Active search: every online server responds immediately.
  pub fn search(&self) -> Vec<DiscoverySample> {
    let servers = self.servers.lock().unwrap();
    servers
      .iter()
      .map(|(url, server)| DiscoverySample {
        id: server.unique_service_name.clone(),
        service_name: server.unique_service_name.clone(),
        host_url: url.clone(),
        response_type: ResponseType::Response,
      })
      .collect()
  }

  pub fn register_server(
    &self,
    url: &str,
    unique_service_name: &str,
    services: &Arc<ServiceRegistry>,
  ) {
    let mut servers = self.servers.lock().unwrap();
    servers.insert(
      url.to_string(),
      OnlineServer {
        unique_service_name: unique_service_name.to_string(),
        services: Arc::downgrade(services),
      },
    );
  }

  pub fn unregister_server(&self, url: &str) {
    self.servers.lock().unwrap().remove(url);
  }

  /// Connects a requester to the server listening on `url`. A server bound
  /// to the wildcard address is reachable through loopback as well.
  pub fn connect(&self, url: &str) -> Option<Arc<ServiceRegistry>> {
    let servers = self.servers.lock().unwrap();
    if let Some(server) = servers.get(url) {
      return server.services.upgrade();
    }
    if let Some((scheme, "127.0.0.1", port)) = split_url(url) {
      let wildcard = format!("{scheme}://0.0.0.0:{port}");
      return servers.get(&wildcard).and_then(|s| s.services.upgrade());
    }
    None
  }

  /// Picks a free port. Port zero means "any in the well-known range".
  pub fn allocate_port(&self, requested: u16) -> Result<u16> {
    let mut ports = self.ports_in_use.lock().unwrap();
    if requested != 0 {
      if ports.contains(&requested) {
        return Err(Error::IoFailure(format!("port {requested} already in use")));
      }
      ports.push(requested);
      return Ok(requested);
    }
    // Scatter the starting point so parallel participants do not pile onto
    // the same ports.
    let span = (PORT_RANGE_END - PORT_RANGE_BEGIN) as u32;
    let start = PORT_RANGE_BEGIN + (rand::random::<u32>() % span) as u16;
    for offset in 0..span as u16 {
      let candidate = PORT_RANGE_BEGIN + (start - PORT_RANGE_BEGIN + offset) % span as u16;
      if !ports.contains(&candidate) {
        ports.push(candidate);
        return Ok(candidate);
      }
    }
    Err(Error::IoFailure(format!(
      "no free port in [{PORT_RANGE_BEGIN}, {PORT_RANGE_END})"
    )))
  }

  pub fn release_port(&self, port: u16) {
    self.ports_in_use.lock().unwrap().retain(|p| *p != port);
  }
}

impl Default for DiscoveryDomain {
  fn default() -> Self {
    Self::new()
  }
}

// ----------------------------------------------
// Discovery loop
// ----------------------------------------------

/// Condvar-backed "at least one search round happened" notification.
pub struct SearchNotification {
  flagged: Mutex<bool>,
  condvar: Condvar,
}

impl SearchNotification {
  pub fn new() -> Self {
    SearchNotification {
      flagged: Mutex::new(false),
      condvar: Condvar::new(),
    }
  }

  pub fn notify(&self) {
    let mut flagged = self.flagged.lock().unwrap();
    *flagged = true;
    self.condvar.notify_all();
  }

  /// Waits until the next `notify` or the timeout. Consumes the notification
  /// so each caller round waits for a fresh search.
  pub fn wait_with_timeout(&self, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    let mut flagged = self.flagged.lock().unwrap();
    while !*flagged {
      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        return;
      }
      let (guard, _timed_out) = self.condvar.wait_timeout(flagged, remaining).unwrap();
      flagged = guard;
    }
    *flagged = false;
  }
}

impl Default for SearchNotification {
  fn default() -> Self {
    Self::new()
  }
}

/// Owns the discovery thread of one system access.
pub struct DiscoveryService {
  stop: Arc<AtomicBool>,
  thread: Option<thread::JoinHandle<()>>,
  pub directory: Arc<ServiceDirectory>,
  pub sink_registry: Arc<ServiceUpdateSinkRegistry>,
  pub search_notification: Arc<SearchNotification>,
}

impl DiscoveryService {
  /// Starts discovering for `system_name` on `domain`. The loop sends one
  /// search immediately, then periodically: sweeps the directory, searches
  /// again, and in between continuously drains inbound notifications.
  pub fn start(
    system_name: &str,
    domain: Arc<DiscoveryDomain>,
    resolver: Arc<dyn HostNameResolver>,
    interval: Duration,
  ) -> Result<Self> {
    let directory = Arc::new(ServiceDirectory::new());
    let sink_registry = Arc::new(ServiceUpdateSinkRegistry::new()?);
    let search_notification = Arc::new(SearchNotification::new());
    let stop = Arc::new(AtomicBool::new(false));

    let thread_system_name = system_name.to_string();
    let thread_directory = Arc::clone(&directory);
    let thread_sinks = Arc::clone(&sink_registry);
    let thread_notification = Arc::clone(&search_notification);
    let thread_stop = Arc::clone(&stop);

    let thread = thread::Builder::new()
      .name(format!("discovery-{system_name}"))
      .spawn(move || {
        info!(
          "starting discovery loop for system '{thread_system_name}' with search interval {interval:?}"
        );
        let inbox = domain.subscribe();
        let mut last_search = Instant::now() - interval; // search immediately

        while !thread_stop.load(Ordering::SeqCst) {
          if last_search.elapsed() >= interval {
            last_search = Instant::now();
            thread_directory.remove_old_devices();
            for sample in domain.search() {
              handle_sample(
                sample,
                &thread_system_name,
                &thread_directory,
                &thread_sinks,
                resolver.as_ref(),
              );
            }
            thread_notification.notify();
          }

          // Drain inbound notifications, waking up at least every 100ms to
          // honour stop requests and the search interval.
          match inbox.recv_timeout(Duration::from_millis(100)) {
            Ok(sample) => {
              handle_sample(
                sample,
                &thread_system_name,
                &thread_directory,
                &thread_sinks,
                resolver.as_ref(),
              );
              // Take whatever else is already queued.
              while let Ok(sample) = inbox.try_recv() {
                handle_sample(
                  sample,
                  &thread_system_name,
                  &thread_directory,
                  &thread_sinks,
                  resolver.as_ref(),
                );
              }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
          }
        }
        info!("ended discovery loop for system '{thread_system_name}'");
      })
      .map_err(|e| Error::Unexpected(format!("cannot spawn discovery thread: {e}")))?;

    Ok(DiscoveryService {
      stop,
      thread: Some(thread),
      directory,
      sink_registry,
      search_notification,
    })
  }

  /// Snapshot after waiting for at least one search round.
  pub fn discovered_services(&self, timeout: Duration) -> Vec<(String, String)> {
    if !timeout.is_zero() {
      self.search_notification.wait_with_timeout(timeout);
    }
    self.directory.discovered_services()
  }
}

impl Drop for DiscoveryService {
  fn drop(&mut self) {
    self.stop.store(true, Ordering::SeqCst);
    if let Some(handle) = self.thread.take() {
      let _ = handle.join();
      debug!("joined discovery loop thread");
    }
  }
}

fn handle_sample(
  sample: DiscoverySample,
  system_name: &str,
  directory: &ServiceDirectory,
  sink_registry: &ServiceUpdateSinkRegistry,
  resolver: &dyn HostNameResolver,
) {
  let Some(event_id) = ServiceUpdateEventType::from_response_type(sample.response_type) else {
    return;
  };
  let host_url = match resolve_url_host(&sample.host_url, resolver) {
    Ok(url) => url,
    Err(e) => {
      // Logged and retried on the next announcement.
      warn!("discovery sample for '{}' has unusable url: {e}", sample.service_name);
      return;
    }
  };
  directory.update(
    ServiceUpdateEvent {
      service_name: sample.service_name,
      system_name: String::new(), // filled from the unique name during update
      host_url,
      event_id,
    },
    system_name,
    sink_registry,
  );
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn url_splitting() {
    assert_eq!(
      split_url("http://127.0.0.1:9090"),
      Some(("http", "127.0.0.1", 9090))
    );
    assert_eq!(split_url("ftp-no-scheme"), None);
    assert_eq!(split_url("http://:9090"), None);
  }

  #[test]
  fn resolver_rewrites_localhost() {
    let resolved = resolve_url_host("http://localhost:9091", &DefaultHostNameResolver).unwrap();
    assert_eq!(resolved, "http://127.0.0.1:9091");
  }

  struct UppercaseResolver;
  impl HostNameResolver for UppercaseResolver {
    fn resolve(&self, host: &str) -> Result<String> {
      Ok(host.to_uppercase())
    }
  }

  #[test]
  fn resolver_is_injectable() {
    let resolved = resolve_url_host("http://somebox:80", &UppercaseResolver).unwrap();
    assert_eq!(resolved, "http://SOMEBOX:80");
  }

  fn alive(name: &str, url: &str) -> ServiceUpdateEvent {
    ServiceUpdateEvent {
      service_name: name.to_string(),
      system_name: String::new(),
      host_url: url.to_string(),
      event_id: ServiceUpdateEventType::NotifyAlive,
    }
  }

  #[test]
  fn directory_filters_by_system() {
    let directory = ServiceDirectory::new();
    let sinks = ServiceUpdateSinkRegistry::new().unwrap();

    assert!(directory.update(alive("a@sys1", "http://127.0.0.1:9090"), "sys1", &sinks));
    assert!(!directory.update(alive("b@sys2", "http://127.0.0.1:9091"), "sys1", &sinks));

    let services = directory.discovered_services();
    assert_eq!(services, vec![("a".to_string(), "http://127.0.0.1:9090".to_string())]);
  }

  #[test]
  fn wildcard_system_accepts_everything_with_full_names() {
    let directory = ServiceDirectory::new();
    let sinks = ServiceUpdateSinkRegistry::new().unwrap();

    assert!(directory.update(
      alive("a@sys1", "http://127.0.0.1:9090"),
      DISCOVER_ALL_SYSTEMS,
      &sinks
    ));
    assert!(directory.update(
      alive("b@sys2", "http://127.0.0.1:9091"),
      DISCOVER_ALL_SYSTEMS,
      &sinks
    ));
    let names: Vec<String> = directory
      .discovered_services()
      .into_iter()
      .map(|(n, _)| n)
      .collect();
    assert_eq!(names, vec!["a@sys1".to_string(), "b@sys2".to_string()]);
  }

  #[test]
  fn bye_removes_entry() {
    let directory = ServiceDirectory::new();
    let sinks = ServiceUpdateSinkRegistry::new().unwrap();
    directory.update(alive("a@s", "http://127.0.0.1:9090"), "s", &sinks);

    let mut bye = alive("a@s", "http://127.0.0.1:9090");
    bye.event_id = ServiceUpdateEventType::NotifyBye;
    directory.update(bye, "s", &sinks);
    assert!(directory.discovered_services().is_empty());
  }

  #[test]
  fn stale_entries_are_swept() {
    let directory = ServiceDirectory::new();
    {
      // Backdate an entry past the lease.
      let mut services = directory.services.lock().unwrap();
      services.insert(
        "old".to_string(),
        (
          Utc::now() - chrono::Duration::seconds(30),
          "http://127.0.0.1:9090".to_string(),
        ),
      );
      services.insert(
        "fresh".to_string(),
        (Utc::now(), "http://127.0.0.1:9091".to_string()),
      );
    }
    directory.remove_old_devices();
    let names: Vec<String> = directory
      .discovered_services()
      .into_iter()
      .map(|(n, _)| n)
      .collect();
    assert_eq!(names, vec!["fresh".to_string()]);
  }

  #[test]
  fn port_allocation_avoids_collisions() {
    let domain = DiscoveryDomain::new();
    let a = domain.allocate_port(0).unwrap();
    let b = domain.allocate_port(0).unwrap();
    assert_ne!(a, b);
    assert!((PORT_RANGE_BEGIN..PORT_RANGE_END).contains(&a));

    assert!(domain.allocate_port(a).is_err());
    domain.release_port(a);
    assert_eq!(domain.allocate_port(a).unwrap(), a);
  }

  #[test]
  fn domain_publish_reaches_subscribers() {
    let domain = DiscoveryDomain::new();
    let inbox = domain.subscribe();
    domain.publish(DiscoverySample {
      id: "a@s".to_string(),
      service_name: "a@s".to_string(),
      host_url: "http://127.0.0.1:9090".to_string(),
      response_type: ResponseType::Alive,
    });
    let sample = inbox.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(sample.service_name, "a@s");
  }
}
