// RPC surface of the clock subsystem.
//
// Three services take part in time sync:
//  - the master service, hosted next to the clock master, where remote
//    participants register as sync slaves,
//  - the slave service, hosted by each sync client, receiving the
//    `syncTimeEvent` calls the master fans out,
//  - the clock service proper, answering clock inventory and time queries.
//
// All numeric time values travel as decimal strings.

use std::sync::{Arc, Mutex, Weak};

use enumflags2::BitFlags;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use num_traits::FromPrimitive;
use serde_json::{json, Value};

use super::{main_event_sink::SyncEventFlag, ClockMainEventSink, ClockService};
use crate::{
  error::{Error, Result},
  rpc::{int_param, str_param, RpcError, RpcRequester, RpcResult, RpcService},
  time::Timestamp,
};

/// Default service names on the participant servers.
pub const CLOCK_SYNC_MASTER_SERVICE: &str = "clock_sync_master";
pub const CLOCK_SYNC_SLAVE_SERVICE: &str = "clock_sync_slave";
pub const CLOCK_SERVICE: &str = "clock_service";

/// Wire codes of the sync events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive)]
#[repr(i32)]
pub enum SyncEventId {
  TimeUpdateBefore = 0,
  TimeUpdating = 1,
  TimeUpdateAfter = 2,
  TimeReset = 3,
}

// ----------------------------------------------
// Client-side wrapper used by the clock master
// ----------------------------------------------

/// RPC handle to one remote sync slave, carrying the activation flag and the
/// event mask the fan-out filters on.
pub struct ClockSyncClient {
  name: String,
  requester: Arc<dyn RpcRequester>,
  active: std::sync::atomic::AtomicBool,
  event_mask: Mutex<BitFlags<SyncEventFlag>>,
}

impl ClockSyncClient {
  pub fn new(
    name: &str,
    requester: Arc<dyn RpcRequester>,
    event_mask: BitFlags<SyncEventFlag>,
  ) -> Self {
    ClockSyncClient {
      name: name.to_string(),
      requester,
      active: std::sync::atomic::AtomicBool::new(false),
      event_mask: Mutex::new(event_mask),
    }
  }

  pub fn name(&self) -> String {
    self.name.clone()
  }

  pub fn is_active(&self) -> bool {
    self.active.load(std::sync::atomic::Ordering::SeqCst)
  }

  pub fn activate(&self) {
    self.active.store(true, std::sync::atomic::Ordering::SeqCst);
  }

  pub fn deactivate(&self) {
    self
      .active
      .store(false, std::sync::atomic::Ordering::SeqCst);
  }

  pub fn event_mask(&self) -> BitFlags<SyncEventFlag> {
    *self.event_mask.lock().unwrap()
  }

  pub fn set_event_mask(&self, mask: BitFlags<SyncEventFlag>) {
    *self.event_mask.lock().unwrap() = mask;
  }

  fn sync_time_event(&self, event_id: SyncEventId, new_time: &str, arg: &str, reserved: &str) -> Result<()> {
    let params = json!({
      "event_id": event_id as i32,
      "new_time": new_time,
      "arg": arg,
      "reserved": reserved,
    });
    self
      .requester
      .request(CLOCK_SYNC_SLAVE_SERVICE, "syncTimeEvent", params)
      .map(|_| ())
      .map_err(|e| Error::BadDevice(e.to_string()))
  }

  pub fn sync_time_update_begin(&self, old_time: Timestamp, new_time: Timestamp) -> Result<()> {
    self.sync_time_event(
      SyncEventId::TimeUpdateBefore,
      &new_time.to_decimal_string(),
      &old_time.to_decimal_string(),
      "",
    )
  }

  pub fn sync_time_updating(&self, new_time: Timestamp, next_tick: Option<Timestamp>) -> Result<()> {
    let next_tick_string = next_tick
      .map(|t| t.to_decimal_string())
      .unwrap_or_default();
    self.sync_time_event(
      SyncEventId::TimeUpdating,
      &new_time.to_decimal_string(),
      &next_tick_string,
      "0",
    )
  }

  pub fn sync_time_update_end(&self, new_time: Timestamp) -> Result<()> {
    self.sync_time_event(
      SyncEventId::TimeUpdateAfter,
      &new_time.to_decimal_string(),
      "0",
      "",
    )
  }

  pub fn sync_time_reset_begin(&self, old_time: Timestamp, new_time: Timestamp) -> Result<()> {
    self.sync_time_event(
      SyncEventId::TimeReset,
      &new_time.to_decimal_string(),
      &old_time.to_decimal_string(),
      "",
    )
  }
}

// ----------------------------------------------
// Master-side service
// ----------------------------------------------

/// Service where remote participants (un)register as sync slaves. The int
/// results follow the wire contract: 0 on success, -1 on failure.
pub struct ClockSyncMasterService {
  master: Arc<ClockMainEventSink>,
  service: Weak<ClockService>,
}

impl ClockSyncMasterService {
  pub fn new(master: Arc<ClockMainEventSink>, service: &Arc<ClockService>) -> Self {
    ClockSyncMasterService {
      master,
      service: Arc::downgrade(service),
    }
  }

  fn result_code(r: Result<()>, what: &str, who: &str) -> Value {
    match r {
      Ok(()) => {
        debug!("successfully handled {what} of timing slave '{who}'");
        json!(0)
      }
      Err(e) => {
        error!("failure during {what} of timing slave '{who}': {e}");
        json!(-1)
      }
    }
  }
}

impl RpcService for ClockSyncMasterService {
  fn handle(&self, method: &str, params: &Value) -> RpcResult {
    match method {
      "registerSyncSlave" => {
        let mask_bits = int_param(params, "event_id_flag")?;
        let name = str_param(params, "slave_name")?;
        let mask = BitFlags::<SyncEventFlag>::from_bits_truncate(mask_bits as u8);
        Ok(Self::result_code(
          self.master.register_client(name, mask),
          "registration",
          name,
        ))
      }
      "unregisterSyncSlave" => {
        let name = str_param(params, "slave_name")?;
        Ok(Self::result_code(
          self.master.unregister_client(name),
          "deregistration",
          name,
        ))
      }
      "slaveSyncedEvent" => {
        let name = str_param(params, "slave_name")?;
        let new_time = Timestamp::parse_decimal(str_param(params, "new_time")?)
          .ok_or_else(|| RpcError::Protocol("malformed new_time".to_string()))?;
        Ok(Self::result_code(
          self.master.receive_client_synced_event(name, new_time),
          "synced event",
          name,
        ))
      }
      "getMasterTime" => {
        let time = self
          .service
          .upgrade()
          .map(|s| s.time())
          .unwrap_or(Timestamp::ZERO);
        debug!("retrieved master time request, responding '{time}'");
        Ok(json!(time.to_decimal_string()))
      }
      "getMasterType" => {
        let kind = self
          .service
          .upgrade()
          .map(|s| s.main_clock_kind() as i32)
          .unwrap_or(-1);
        Ok(json!(kind))
      }
      other => Err(RpcError::UnknownMethod(other.to_string())),
    }
  }
}

// ----------------------------------------------
// Slave-side service
// ----------------------------------------------

/// What a participant does with incoming master time events.
pub trait SyncEventHandler: Send + Sync {
  fn on_time_update_before(&self, new_time: Timestamp, old_time: Timestamp);
  fn on_time_updating(&self, new_time: Timestamp, next_tick: Option<Timestamp>);
  fn on_time_update_after(&self, new_time: Timestamp);
  fn on_time_reset(&self, new_time: Timestamp, old_time: Timestamp);
}

/// Receives `syncTimeEvent` calls from a remote clock master and forwards
/// them to the handler. Returns `"0"` like the original contract.
pub struct ClockSyncSlaveService {
  handler: Arc<dyn SyncEventHandler>,
}

impl ClockSyncSlaveService {
  pub fn new(handler: Arc<dyn SyncEventHandler>) -> Self {
    ClockSyncSlaveService {
      handler,
    }
  }
}

impl RpcService for ClockSyncSlaveService {
  fn handle(&self, method: &str, params: &Value) -> RpcResult {
    match method {
      "syncTimeEvent" => {
        let event_id = int_param(params, "event_id")?;
        let new_time = Timestamp::parse_decimal(str_param(params, "new_time")?)
          .ok_or_else(|| RpcError::Protocol("malformed new_time".to_string()))?;
        let arg = str_param(params, "arg")?;

        match SyncEventId::from_i64(event_id) {
          Some(SyncEventId::TimeUpdateBefore) => {
            let old_time = Timestamp::parse_decimal(arg).unwrap_or(Timestamp::ZERO);
            self.handler.on_time_update_before(new_time, old_time);
          }
          Some(SyncEventId::TimeUpdating) => {
            self
              .handler
              .on_time_updating(new_time, Timestamp::parse_decimal(arg));
          }
          Some(SyncEventId::TimeUpdateAfter) => {
            self.handler.on_time_update_after(new_time);
          }
          Some(SyncEventId::TimeReset) => {
            let old_time = Timestamp::parse_decimal(arg).unwrap_or(Timestamp::ZERO);
            self.handler.on_time_reset(new_time, old_time);
          }
          None => {
            return Err(RpcError::Protocol(format!(
              "unknown sync event id {event_id}"
            )));
          }
        }
        Ok(json!("0"))
      }
      other => Err(RpcError::UnknownMethod(other.to_string())),
    }
  }
}

// ----------------------------------------------
// Clock service queries
// ----------------------------------------------

/// Read-only clock inventory and time queries.
pub struct ClockServiceRpc {
  service: Weak<ClockService>,
}

impl ClockServiceRpc {
  pub fn new(service: &Arc<ClockService>) -> Self {
    ClockServiceRpc {
      service: Arc::downgrade(service),
    }
  }

  fn service(&self) -> std::result::Result<Arc<ClockService>, RpcError> {
    self
      .service
      .upgrade()
      .ok_or_else(|| RpcError::Transport("clock service is gone".to_string()))
  }
}

impl RpcService for ClockServiceRpc {
  fn handle(&self, method: &str, params: &Value) -> RpcResult {
    let service = self.service()?;
    match method {
      "getClockNames" => Ok(json!(service.clock_names().join(","))),
      "getMainClockName" => Ok(json!(service.main_clock_name())),
      "getTime" => {
        let response = match params.get("clock_name").and_then(Value::as_str) {
          None | Some("") => service.time().to_decimal_string(),
          Some(name) => match service.time_of(name) {
            Some(t) => t.to_decimal_string(),
            None => "-1".to_string(),
          },
        };
        Ok(json!(response))
      }
      "getType" => {
        let response = match params.get("clock_name").and_then(Value::as_str) {
          None | Some("") => service.main_clock_kind() as i32,
          Some(name) => service.kind_of(name).map(|k| k as i32).unwrap_or(-1),
        };
        Ok(json!(response))
      }
      other => Err(RpcError::UnknownMethod(other.to_string())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sync_event_id_codes() {
    assert_eq!(SyncEventId::from_i64(0), Some(SyncEventId::TimeUpdateBefore));
    assert_eq!(SyncEventId::from_i64(1), Some(SyncEventId::TimeUpdating));
    assert_eq!(SyncEventId::from_i64(2), Some(SyncEventId::TimeUpdateAfter));
    assert_eq!(SyncEventId::from_i64(3), Some(SyncEventId::TimeReset));
    assert_eq!(SyncEventId::from_i64(4), None);
  }

  struct Recorder {
    events: Mutex<Vec<(i32, Timestamp, Option<Timestamp>)>>,
  }

  impl SyncEventHandler for Recorder {
    fn on_time_update_before(&self, new_time: Timestamp, _old: Timestamp) {
      self.events.lock().unwrap().push((0, new_time, None));
    }
    fn on_time_updating(&self, new_time: Timestamp, next_tick: Option<Timestamp>) {
      self.events.lock().unwrap().push((1, new_time, next_tick));
    }
    fn on_time_update_after(&self, new_time: Timestamp) {
      self.events.lock().unwrap().push((2, new_time, None));
    }
    fn on_time_reset(&self, new_time: Timestamp, _old: Timestamp) {
      self.events.lock().unwrap().push((3, new_time, None));
    }
  }

  #[test]
  fn slave_service_decodes_events() {
    let recorder = Arc::new(Recorder {
      events: Mutex::new(Vec::new()),
    });
    let service = ClockSyncSlaveService::new(Arc::clone(&recorder) as Arc<dyn SyncEventHandler>);

    let call = |event_id: i32, new_time: &str, arg: &str| {
      service
        .handle(
          "syncTimeEvent",
          &json!({
            "event_id": event_id,
            "new_time": new_time,
            "arg": arg,
            "reserved": "",
          }),
        )
        .unwrap()
    };

    call(0, "1000", "0");
    call(1, "2000", "3000");
    call(1, "2000", "");
    call(2, "2000", "0");
    call(3, "0", "2000");

    let events = recorder.events.lock().unwrap();
    assert_eq!(events.len(), 5);
    assert_eq!(events[1], (1, Timestamp::from_nanos(2000), Some(Timestamp::from_nanos(3000))));
    assert_eq!(events[2].2, None); // empty next tick arg decodes to None
  }

  #[test]
  fn slave_service_rejects_unknown_event() {
    let recorder = Arc::new(Recorder {
      events: Mutex::new(Vec::new()),
    });
    let service = ClockSyncSlaveService::new(recorder);
    let result = service.handle(
      "syncTimeEvent",
      &json!({"event_id": 9, "new_time": "0", "arg": "", "reserved": ""}),
    );
    assert!(result.is_err());
  }
}
