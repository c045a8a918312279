// Reception core: one wait-set multiplexing every registered reader.
//
// A session runs from `start_blocking_reception` (which blocks) until
// `stop_blocking_reception`. The wait-set polls with a short timeout; the
// guard condition wakes it early when the reader set changed, a reader
// rebuilt its sample endpoint, or shutdown was requested. Handlers run
// inline on the reception thread, or on a fixed pool when the bus is
// configured for pool-backed reception.

use std::{
  collections::{HashMap, HashSet},
  sync::{atomic::Ordering, Arc},
  time::Duration,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::{
  reader::{DataAccessCollection, DataAccessEntry},
  SimulationBus,
};
use crate::{guard::GuardCondition, worker::ThreadPool};

const GUARD_TOKEN: mio_06::Token = mio_06::Token(0);
const WAITSET_WAIT: Duration = Duration::from_millis(100);

/// The wait-set of one reception session. Endpoints are registered under
/// fresh tokens as they appear; a mio user-space registration stays bound to
/// its poll, so the poll itself lives for the whole session.
struct WaitSet {
  poll: mio_06::Poll,
  guard: GuardCondition,
  token_map: HashMap<mio_06::Token, DataAccessEntry>,
  registered_endpoints: HashSet<u64>,
  next_token: usize,
  built_generation: u64,
}

impl WaitSet {
  /// On failure the guard is handed back so a later session can reuse it.
  fn new(guard: GuardCondition) -> Result<Self, (GuardCondition, std::io::Error)> {
    let poll = match mio_06::Poll::new() {
      Ok(poll) => poll,
      Err(e) => return Err((guard, e)),
    };
    if let Err(e) = guard.register(&poll, GUARD_TOKEN) {
      return Err((guard, e));
    }
    Ok(WaitSet {
      poll,
      guard,
      token_map: HashMap::new(),
      registered_endpoints: HashSet::new(),
      next_token: 1,
      built_generation: 0,
    })
  }

  /// Brings the wait-set up to date with the current reader set. New and
  /// rebuilt endpoints are registered; endpoints of removed readers died
  /// with their registrations.
  fn sync(&mut self, collection: &Arc<DataAccessCollection>) -> std::io::Result<()> {
    let generation = collection.generation();
    for entry in collection.snapshot() {
      let token_map = &mut self.token_map;
      let registered = &mut self.registered_endpoints;
      let next_token = &mut self.next_token;
      let poll = &self.poll;
      let entry_for_map = entry.clone();
      entry.queue.with_endpoints(|endpoint_id, endpoint| {
        if registered.contains(&endpoint_id) {
          return Ok(());
        }
        let token = mio_06::Token(*next_token);
        *next_token += 1;
        endpoint.register(poll, token)?;
        registered.insert(endpoint_id);
        token_map.insert(token, entry_for_map.clone());
        Ok(())
      })?;
    }
    self.built_generation = generation;
    Ok(())
  }

  fn needs_sync(&self, collection: &Arc<DataAccessCollection>) -> bool {
    self.built_generation != collection.generation()
  }
}

/// Delivers everything a reader currently holds to its receiver. Runs with
/// the entry's receiver lock held, so one reader is always handled by at
/// most one reception path at a time.
fn dispatch_entry(entry: &DataAccessEntry) {
  let mut receiver = entry.receiver.lock().unwrap();
  entry.queue.drain_notifications();
  while entry.queue.pop(receiver.as_mut()) {}
}

/// Pool-mode variant with the in-flight gate: re-checks for data that
/// arrived while the flag was being cleared.
fn dispatch_entry_pooled(entry: DataAccessEntry) {
  loop {
    dispatch_entry(&entry);
    entry.in_flight.store(false, Ordering::SeqCst);
    if entry.queue.has_data()
      && entry
        .in_flight
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
      continue;
    }
    break;
  }
}

impl SimulationBus {
  /// Runs reception on the calling thread until `stop_blocking_reception`.
  ///
  /// `reception_preparation_done_callback` fires exactly once, as soon as the
  /// first wait-set has been built (or on return when reception cannot run).
  pub fn start_blocking_reception<F>(&self, reception_preparation_done_callback: F)
  where
    F: FnOnce() + Send,
  {
    let mut prep_callback = Some(reception_preparation_done_callback);

    'reception: {
      let Some(collection) = self.data_access_collection() else {
        warn!("reception started without initialization, nothing to receive");
        break 'reception;
      };
      let Some(guard) = self.take_guard() else {
        warn!("reception is already running");
        break 'reception;
      };

      self.receiving.store(true, Ordering::SeqCst);
      let guard = if self.config.use_async_waitset {
        self.run_pool_backed(&collection, guard, &mut prep_callback)
      } else {
        self.run_single_threaded(&collection, guard, &mut prep_callback)
      };
      self.receiving.store(false, Ordering::SeqCst);
      self.put_back_guard(guard);
    }

    if let Some(callback) = prep_callback.take() {
      callback();
    }
  }

  /// Unblocks and ends the running reception session.
  pub fn stop_blocking_reception(&self) {
    self.receiving.store(false, Ordering::SeqCst);
    self.trigger_guard();
  }

  fn run_single_threaded<F>(
    &self,
    collection: &Arc<DataAccessCollection>,
    guard: GuardCondition,
    prep_callback: &mut Option<F>,
  ) -> GuardCondition
  where
    F: FnOnce() + Send,
  {
    let mut waitset = match WaitSet::new(guard) {
      Ok(waitset) => waitset,
      Err((guard, e)) => {
        error!("cannot create reception wait-set: {e}");
        return guard;
      }
    };
    let mut events = mio_06::Events::with_capacity(64);

    while self.receiving.load(Ordering::SeqCst) {
      if waitset.needs_sync(collection) {
        if let Err(e) = waitset.sync(collection) {
          warn!("error while rebuilding reception wait-set: {e}");
          std::thread::sleep(WAITSET_WAIT);
          continue;
        }
        if let Some(callback) = prep_callback.take() {
          // The bus is now prepared for reception and for a call to
          // stop_blocking_reception.
          callback();
        }
      }

      match waitset.poll.poll(&mut events, Some(WAITSET_WAIT)) {
        Ok(_) => {
          for event in events.iter() {
            if event.token() == GUARD_TOKEN {
              waitset.guard.drain();
              // Rebuild is decided at the top of the loop.
            } else if let Some(entry) = waitset.token_map.get(&event.token()) {
              dispatch_entry(entry);
            }
          }
        }
        Err(e) => {
          warn!("error during reception of data: {e}");
        }
      }
    }
    waitset.guard
  }

  fn run_pool_backed<F>(
    &self,
    collection: &Arc<DataAccessCollection>,
    guard: GuardCondition,
    prep_callback: &mut Option<F>,
  ) -> GuardCondition
  where
    F: FnOnce() + Send,
  {
    let pool = match ThreadPool::new(
      "sim-bus-waitset",
      self.config.effective_waitset_threads(),
    ) {
      Ok(pool) => pool,
      Err(e) => {
        error!("cannot create reception pool: {e}");
        return guard;
      }
    };
    let mut waitset = match WaitSet::new(guard) {
      Ok(waitset) => waitset,
      Err((guard, e)) => {
        error!("cannot create reception wait-set: {e}");
        return guard;
      }
    };
    let mut events = mio_06::Events::with_capacity(64);

    while self.receiving.load(Ordering::SeqCst) {
      if waitset.needs_sync(collection) {
        if let Err(e) = waitset.sync(collection) {
          warn!("error while rebuilding reception wait-set: {e}");
          std::thread::sleep(WAITSET_WAIT);
          continue;
        }
        if let Some(callback) = prep_callback.take() {
          callback();
        }
      }

      match waitset.poll.poll(&mut events, Some(WAITSET_WAIT)) {
        Ok(_) => {
          for event in events.iter() {
            if event.token() == GUARD_TOKEN {
              waitset.guard.drain();
            } else if let Some(entry) = waitset.token_map.get(&event.token()) {
              // One in-flight dispatch per reader; the gate keeps pool
              // workers from running the same queue concurrently.
              if entry
                .in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
              {
                let entry = entry.clone();
                if self.pool_post(&pool, entry).is_err() {
                  break;
                }
              }
            }
          }
        }
        Err(e) => {
          warn!("error during reception of data: {e}");
        }
      }
    }
    // Dropping the pool joins its workers; outstanding dispatches finish
    // before reception reports stopped.
    drop(pool);
    waitset.guard
  }

  fn pool_post(&self, pool: &ThreadPool, entry: DataAccessEntry) -> crate::error::Result<()> {
    pool.post(move || dispatch_entry_pooled(entry)).map_err(|e| {
      warn!("reception pool rejected dispatch: {e}");
      e
    })
  }
}
