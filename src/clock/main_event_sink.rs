// Clock master: distributes each time event to the registered remote time
// clients over RPC, in parallel, bounded by one absolute deadline per event.
//
// Every client owns a single-thread executor, so enqueueing is cheap for the
// caller and a stalled client never serializes behind another. The event
// callback itself is synchronous: it returns only when every addressed client
// has responded, failed, or run into the deadline.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
  time::Instant,
};

use enumflags2::{bitflags, BitFlags};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::{rpc::ClockSyncClient, ClockEventSink};
use crate::{
  config::TIME_UPDATE_TIMEOUT_MIN,
  error::{Error, Result},
  rpc::RpcRequester,
  time::Timestamp,
  worker::{AsyncExecutor, TaskHandle, TaskWait},
};

/// Which time events a sync client has registered for.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEventFlag {
  TimeUpdateBefore = 0b0001,
  TimeUpdating = 0b0010,
  TimeUpdateAfter = 0b0100,
  TimeReset = 0b1000,
}

struct ClientEntry {
  client: Arc<ClockSyncClient>,
  executor: AsyncExecutor,
}

type RequesterLookup = dyn Fn(&str) -> Option<Arc<dyn RpcRequester>> + Send + Sync;

/// The clock master. Registered as an event sink in the clock event sink
/// registry; fans each event out to the remote clients.
pub struct ClockMainEventSink {
  clients: Mutex<HashMap<String, ClientEntry>>,
  time_update_timeout: Mutex<Timestamp>,
  get_requester_by_name: Box<RequesterLookup>,
}

fn validate_timeout(timeout: Timestamp) -> Timestamp {
  if timeout < TIME_UPDATE_TIMEOUT_MIN {
    warn!(
      "configured time_update_timeout of {timeout} is below minimum of \
       {TIME_UPDATE_TIMEOUT_MIN}, using minimum value instead"
    );
    TIME_UPDATE_TIMEOUT_MIN
  } else {
    timeout
  }
}

impl ClockMainEventSink {
  pub fn new<F>(time_update_timeout: Timestamp, get_requester_by_name: F) -> Self
  where
    F: Fn(&str) -> Option<Arc<dyn RpcRequester>> + Send + Sync + 'static,
  {
    ClockMainEventSink {
      clients: Mutex::new(HashMap::new()),
      time_update_timeout: Mutex::new(validate_timeout(time_update_timeout)),
      get_requester_by_name: Box::new(get_requester_by_name),
    }
  }

  /// Registers (or re-registers) a remote client for the masked events.
  ///
  /// An existing entry keeps its executor; its mask is updated and the client
  /// reactivated. A missing RPC requester is `NotFound`.
  pub fn register_client(&self, client_name: &str, event_mask: BitFlags<SyncEventFlag>) -> Result<()> {
    let mut clients = self.clients.lock().unwrap();

    let requester = (self.get_requester_by_name)(client_name)
      .ok_or_else(|| Error::NotFound(format!("rpc requester for '{client_name}'")))?;

    match clients.get_mut(client_name) {
      Some(entry) => {
        entry.client.set_event_mask(event_mask);
        entry.client.activate();
      }
      None => {
        let client = Arc::new(ClockSyncClient::new(client_name, requester, event_mask));
        client.activate();
        clients.insert(
          client_name.to_string(),
          ClientEntry {
            client,
            executor: AsyncExecutor::new(&format!("clock-sync-{client_name}"))?,
          },
        );
      }
    }
    Ok(())
  }

  /// Deactivates a client. The entry, and with it the executor, stays until
  /// the sink itself is dropped; a later `register_client` reactivates it.
  pub fn unregister_client(&self, client_name: &str) -> Result<()> {
    let clients = self.clients.lock().unwrap();
    match clients.get(client_name) {
      Some(entry) => {
        entry.client.deactivate();
        Ok(())
      }
      None => Err(Error::NotFound(format!(
        "a client with name '{client_name}' was not found"
      ))),
    }
  }

  /// Acknowledgement hook for `slaveSyncedEvent`; currently no bookkeeping.
  pub fn receive_client_synced_event(&self, _client_name: &str, _time: Timestamp) -> Result<()> {
    Ok(())
  }

  pub fn update_timeout(&self, time_update_timeout: Timestamp) {
    *self.time_update_timeout.lock().unwrap() = validate_timeout(time_update_timeout);
  }

  pub fn is_client_active(&self, client_name: &str) -> Option<bool> {
    let clients = self.clients.lock().unwrap();
    clients.get(client_name).map(|e| e.client.is_active())
  }

  /// Enqueues `call` on every active, subscribed client and waits for all of
  /// them against one absolute deadline.
  ///
  /// The client map lock is held only while enqueueing, never while waiting.
  fn synchronize_event<F>(&self, event_flag: SyncEventFlag, call: F, context: &str)
  where
    F: Fn(&ClockSyncClient) -> Result<()> + Send + Sync + Clone + 'static,
  {
    let mut synchronizations: Vec<(Arc<ClockSyncClient>, Result<TaskHandle>)> = Vec::new();
    {
      let clients = self.clients.lock().unwrap();
      for entry in clients.values() {
        let client = Arc::clone(&entry.client);
        if !client.is_active() || !client.event_mask().contains(event_flag) {
          continue;
        }
        let call = call.clone();
        let task_client = Arc::clone(&client);
        let handle = entry.executor.enqueue(move || call(&task_client));
        synchronizations.push((client, handle));
      }
    }

    let timeout = *self.time_update_timeout.lock().unwrap();
    let deadline = Instant::now() + timeout.as_std_duration();

    for (client, handle) in synchronizations {
      let client_name = client.name();
      let handle = match handle {
        Ok(h) => h,
        Err(_) => {
          panic!("synchronization task for client '{client_name}' was deferred");
        }
      };
      match handle.wait_until(deadline) {
        TaskWait::Ready(Ok(())) => {}
        TaskWait::Ready(Err(e)) => {
          error!(
            "{context}: invalid response during synchronization of client '{client_name}', \
             client will be deactivated: {e}"
          );
          client.deactivate();
        }
        TaskWait::TimedOut => {
          error!(
            "{context}: a timeout occurred while synchronizing the client '{client_name}'. The \
             client might take too long to respond or be unreachable."
          );
        }
        TaskWait::Deferred => {
          panic!("synchronization task for client '{client_name}' was deferred");
        }
      }
    }
  }
}

impl ClockEventSink for ClockMainEventSink {
  fn time_update_begin(&self, old_time: Timestamp, new_time: Timestamp) {
    self.synchronize_event(
      SyncEventFlag::TimeUpdateBefore,
      move |client| client.sync_time_update_begin(old_time, new_time),
      &format!("an error occurred during time_update_before at time {new_time}"),
    );
  }

  fn time_updating(&self, new_time: Timestamp, next_tick: Option<Timestamp>) {
    self.synchronize_event(
      SyncEventFlag::TimeUpdating,
      move |client| client.sync_time_updating(new_time, next_tick),
      &format!("an error occurred during time_updating at time {new_time}"),
    );
  }

  fn time_update_end(&self, new_time: Timestamp) {
    self.synchronize_event(
      SyncEventFlag::TimeUpdateAfter,
      move |client| client.sync_time_update_end(new_time),
      &format!("an error occurred during time_update_after at time {new_time}"),
    );
  }

  fn time_reset_begin(&self, old_time: Timestamp, new_time: Timestamp) {
    self.synchronize_event(
      SyncEventFlag::TimeReset,
      move |client| client.sync_time_reset_begin(old_time, new_time),
      &format!("an error occurred during time_reset at old time {old_time}"),
    );
  }

  fn time_reset_end(&self, _new_time: Timestamp) {
    // Deliberately not distributed to clients.
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
  };

  use serde_json::{json, Value};

  use super::*;
  use crate::rpc::{RpcError, RpcResult};

  struct MockRequester {
    calls: AtomicUsize,
    delay: Duration,
    fail_with_protocol_error: bool,
  }

  impl MockRequester {
    fn new(delay: Duration, fail: bool) -> Arc<Self> {
      Arc::new(MockRequester {
        calls: AtomicUsize::new(0),
        delay,
        fail_with_protocol_error: fail,
      })
    }
  }

  impl RpcRequester for MockRequester {
    fn request(&self, _service: &str, _method: &str, _params: Value) -> RpcResult {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if !self.delay.is_zero() {
        thread::sleep(self.delay);
      }
      if self.fail_with_protocol_error {
        Err(RpcError::Protocol("injected failure".to_string()))
      } else {
        Ok(json!("0"))
      }
    }
  }

  fn master_with(
    clients: Vec<(&'static str, Arc<MockRequester>)>,
    timeout: Timestamp,
  ) -> ClockMainEventSink {
    let table: HashMap<String, Arc<MockRequester>> = clients
      .iter()
      .map(|(n, r)| (n.to_string(), Arc::clone(r)))
      .collect();
    let master = ClockMainEventSink::new(timeout, move |name| {
      table
        .get(name)
        .map(|r| Arc::clone(r) as Arc<dyn RpcRequester>)
    });
    for (name, _) in clients {
      master
        .register_client(name, BitFlags::from(SyncEventFlag::TimeUpdating))
        .unwrap();
    }
    master
  }

  #[test]
  fn unknown_requester_is_not_found() {
    let master = master_with(vec![], Timestamp::from_millis(100));
    match master.register_client("ghost", BitFlags::all()) {
      Err(Error::NotFound(_)) => {}
      other => panic!("unexpected: {other:?}"),
    }
  }

  #[test]
  fn slow_client_times_out_but_stays_active() {
    let fast = MockRequester::new(Duration::from_millis(5), false);
    let slow = MockRequester::new(Duration::from_secs(10), false);
    let master = master_with(
      vec![("fast", Arc::clone(&fast)), ("slow", Arc::clone(&slow))],
      Timestamp::from_millis(100),
    );

    let started = Instant::now();
    master.time_updating(Timestamp::from_secs(1), None);
    let elapsed = started.elapsed();

    assert!(
      elapsed < Duration::from_secs(2),
      "event took {elapsed:?}, deadline not honoured"
    );
    assert_eq!(fast.calls.load(Ordering::SeqCst), 1);
    assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
    assert_eq!(master.is_client_active("slow"), Some(true));
  }

  #[test]
  fn protocol_error_deactivates_client() {
    let failing = MockRequester::new(Duration::ZERO, true);
    let master = master_with(vec![("bad", Arc::clone(&failing))], Timestamp::from_millis(200));

    master.time_updating(Timestamp::from_secs(1), None);
    assert_eq!(master.is_client_active("bad"), Some(false));

    // Deactivated clients are skipped by subsequent events.
    master.time_updating(Timestamp::from_secs(2), None);
    assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn reregistration_reactivates() {
    let failing = MockRequester::new(Duration::ZERO, true);
    let master = master_with(vec![("bad", Arc::clone(&failing))], Timestamp::from_millis(200));

    master.time_updating(Timestamp::from_secs(1), None);
    assert_eq!(master.is_client_active("bad"), Some(false));

    master
      .register_client("bad", BitFlags::from(SyncEventFlag::TimeUpdating))
      .unwrap();
    assert_eq!(master.is_client_active("bad"), Some(true));
    master.time_updating(Timestamp::from_secs(2), None);
    assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn mask_filters_events() {
    let requester = MockRequester::new(Duration::ZERO, false);
    let master = master_with(vec![("a", Arc::clone(&requester))], Timestamp::from_millis(200));

    // Registered for TimeUpdating only; begin/end/reset must not call.
    master.time_update_begin(Timestamp::ZERO, Timestamp::from_secs(1));
    master.time_update_end(Timestamp::from_secs(1));
    master.time_reset_begin(Timestamp::ZERO, Timestamp::from_secs(1));
    master.time_reset_end(Timestamp::from_secs(1));
    assert_eq!(requester.calls.load(Ordering::SeqCst), 0);

    master.time_updating(Timestamp::from_secs(1), Some(Timestamp::from_secs(2)));
    assert_eq!(requester.calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn unregister_deactivates_without_removal() {
    let requester = MockRequester::new(Duration::ZERO, false);
    let master = master_with(vec![("a", Arc::clone(&requester))], Timestamp::from_millis(200));

    master.unregister_client("a").unwrap();
    master.time_updating(Timestamp::from_secs(1), None);
    assert_eq!(requester.calls.load(Ordering::SeqCst), 0);

    match master.unregister_client("nobody") {
      Err(Error::NotFound(_)) => {}
      other => panic!("unexpected: {other:?}"),
    }
  }

  #[test]
  fn timeout_clamped_to_minimum() {
    let master = master_with(vec![], Timestamp::from_nanos(1));
    assert_eq!(
      *master.time_update_timeout.lock().unwrap(),
      TIME_UPDATE_TIMEOUT_MIN
    );
  }
}
