// RPC seam between the participant and the service bus transport.
//
// The wire transport (HTTP in a deployment) stays behind `RpcRequester`; the
// crate ships an in-process loopback so participants inside one process talk
// to each other through the same code paths a remote deployment would use.
// Parameters and results travel as JSON values, matching the JSON-RPC-style
// contract of the participant services.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex, Weak},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde_json::{json, Value};
use thiserror::Error;

/// Failures crossing the RPC boundary.
///
/// `Protocol` corresponds to a JSON-RPC error response: the peer was reached
/// and answered, but rejected or botched the call. The clock master treats
/// that differently from a transport failure or a timeout.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
  #[error("rpc protocol error: {0}")]
  Protocol(String),
  #[error("rpc transport error: {0}")]
  Transport(String),
  #[error("rpc service '{0}' unknown")]
  UnknownService(String),
  #[error("rpc method '{0}' unknown")]
  UnknownMethod(String),
}

pub type RpcResult = std::result::Result<Value, RpcError>;

/// Client-side handle to one remote server.
pub trait RpcRequester: Send + Sync {
  /// Synchronous request to `service`/`method`. Blocks until the peer
  /// responds or the transport gives up.
  fn request(&self, service: &str, method: &str, params: Value) -> RpcResult;
}

/// One named service hosted on a server.
pub trait RpcService: Send + Sync {
  fn handle(&self, method: &str, params: &Value) -> RpcResult;
}

/// Helpers for the common parameter shapes of the participant services.
pub fn str_param<'a>(params: &'a Value, name: &str) -> Result<&'a str, RpcError> {
  params
    .get(name)
    .and_then(Value::as_str)
    .ok_or_else(|| RpcError::Protocol(format!("missing string parameter '{name}'")))
}

pub fn int_param(params: &Value, name: &str) -> Result<i64, RpcError> {
  params
    .get(name)
    .and_then(Value::as_i64)
    .ok_or_else(|| RpcError::Protocol(format!("missing integer parameter '{name}'")))
}

/// Service table of one participant server. The hosting server (see
/// `service_bus::server`) owns exactly one of these.
pub struct ServiceRegistry {
  services: Mutex<HashMap<String, Arc<dyn RpcService>>>,
}

impl ServiceRegistry {
  pub fn new() -> Self {
    ServiceRegistry {
      services: Mutex::new(HashMap::new()),
    }
  }

  pub fn register(&self, name: &str, service: Arc<dyn RpcService>) -> crate::error::Result<()> {
    let mut services = self.services.lock().unwrap();
    if services.contains_key(name) {
      return Err(crate::error::Error::AlreadyRegistered(format!(
        "rpc service '{name}'"
      )));
    }
    services.insert(name.to_string(), service);
    Ok(())
  }

  pub fn unregister(&self, name: &str) -> crate::error::Result<()> {
    let mut services = self.services.lock().unwrap();
    match services.remove(name) {
      Some(_) => Ok(()),
      None => Err(crate::error::Error::NotFound(format!(
        "rpc service '{name}'"
      ))),
    }
  }

  pub fn service_names(&self) -> Vec<String> {
    self.services.lock().unwrap().keys().cloned().collect()
  }

  pub fn dispatch(&self, service: &str, method: &str, params: &Value) -> RpcResult {
    let service_object = {
      let services = self.services.lock().unwrap();
      services.get(service).cloned()
    };
    match service_object {
      Some(s) => s.handle(method, params),
      None => Err(RpcError::UnknownService(service.to_string())),
    }
  }
}

impl Default for ServiceRegistry {
  fn default() -> Self {
    Self::new()
  }
}

/// In-process requester: dispatches straight into a service registry. The
/// weak reference mirrors a network peer that may have gone away; requests
/// after the server is dropped fail as transport errors.
pub struct LoopbackRequester {
  registry: Weak<ServiceRegistry>,
  server_name: String,
}

impl LoopbackRequester {
  pub fn new(registry: &Arc<ServiceRegistry>, server_name: &str) -> Self {
    LoopbackRequester {
      registry: Arc::downgrade(registry),
      server_name: server_name.to_string(),
    }
  }
}

impl RpcRequester for LoopbackRequester {
  fn request(&self, service: &str, method: &str, params: Value) -> RpcResult {
    match self.registry.upgrade() {
      Some(registry) => registry.dispatch(service, method, &params),
      None => Err(RpcError::Transport(format!(
        "server '{}' is no longer reachable",
        self.server_name
      ))),
    }
  }
}

/// The `{result, description}` JSON object returned by the lifecycle and
/// registration services.
pub fn status_response(status: &crate::error::OperationStatus) -> Value {
  json!({ "result": status.result, "description": status.description })
}

#[cfg(test)]
mod tests {
  use super::*;

  struct EchoService;

  impl RpcService for EchoService {
    fn handle(&self, method: &str, params: &Value) -> RpcResult {
      match method {
        "echo" => Ok(params.clone()),
        other => Err(RpcError::UnknownMethod(other.to_string())),
      }
    }
  }

  #[test]
  fn loopback_round_trip() {
    let registry = Arc::new(ServiceRegistry::new());
    registry.register("echo_service", Arc::new(EchoService)).unwrap();

    let requester = LoopbackRequester::new(&registry, "server");
    let params = json!({"x": 1});
    assert_eq!(
      requester
        .request("echo_service", "echo", params.clone())
        .unwrap(),
      params
    );

    match requester.request("echo_service", "bogus", json!({})) {
      Err(RpcError::UnknownMethod(m)) => assert_eq!(m, "bogus"),
      other => panic!("unexpected: {other:?}"),
    }
    match requester.request("bogus_service", "echo", json!({})) {
      Err(RpcError::UnknownService(_)) => {}
      other => panic!("unexpected: {other:?}"),
    }
  }

  #[test]
  fn duplicate_service_rejected() {
    let registry = Arc::new(ServiceRegistry::new());
    registry.register("s", Arc::new(EchoService)).unwrap();
    assert!(registry.register("s", Arc::new(EchoService)).is_err());
    registry.unregister("s").unwrap();
    assert!(registry.unregister("s").is_err());
  }

  #[test]
  fn requester_outliving_server_fails_as_transport() {
    let registry = Arc::new(ServiceRegistry::new());
    let requester = LoopbackRequester::new(&registry, "server");
    drop(registry);
    match requester.request("echo_service", "echo", json!({})) {
      Err(RpcError::Transport(_)) => {}
      other => panic!("unexpected: {other:?}"),
    }
  }
}
