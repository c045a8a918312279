// Named clock inventory.
//
// Holds every registered clock behind a version adapter. The two native
// clocks are registered once at service creation and can never be removed.

use std::{
  collections::HashMap,
  sync::Mutex,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::variant::ClockAdapter;
use crate::error::{Error, Result};

pub struct ClockRegistry {
  clocks: Mutex<HashMap<String, ClockAdapter>>,
  native_clocks: Mutex<Vec<String>>,
}

impl ClockRegistry {
  pub fn new() -> Self {
    ClockRegistry {
      clocks: Mutex::new(HashMap::new()),
      native_clocks: Mutex::new(Vec::new()),
    }
  }

  /// Registers the built-in clocks. Allowed exactly once.
  pub fn register_native_clocks(&self, clocks: Vec<ClockAdapter>) -> Result<()> {
    {
      let mut native = self.native_clocks.lock().unwrap();
      if !native.is_empty() {
        return Err(Error::InvalidArg(
          "registering native clocks can only be done once".to_string(),
        ));
      }
      for clock in &clocks {
        native.push(clock.name());
      }
    }
    for clock in clocks {
      self.register_clock(clock)?;
    }
    Ok(())
  }

  pub fn register_clock(&self, clock: ClockAdapter) -> Result<()> {
    let name = clock.name();
    let mut clocks = self.clocks.lock().unwrap();
    if clocks.contains_key(&name) {
      return Err(Error::AlreadyRegistered(format!(
        "a clock with the name '{name}' is already registered"
      )));
    }
    clocks.insert(name.clone(), clock);
    debug!("clock '{name}' registered");
    Ok(())
  }

  pub fn unregister_clock(&self, name: &str) -> Result<()> {
    if self.is_native(name) {
      return Err(Error::InvalidArg(format!(
        "the native clock '{name}' can not be unregistered"
      )));
    }
    let mut clocks = self.clocks.lock().unwrap();
    match clocks.remove(name) {
      Some(_) => {
        debug!("clock '{name}' unregistered");
        Ok(())
      }
      None => Err(Error::NotFound(format!(
        "a clock with the name '{name}' is not registered"
      ))),
    }
  }

  pub fn is_native(&self, name: &str) -> bool {
    self.native_clocks.lock().unwrap().iter().any(|n| n == name)
  }

  pub fn get_clock_adapter(&self, name: &str) -> Option<ClockAdapter> {
    self.clocks.lock().unwrap().get(name).cloned()
  }

  pub fn clock_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.clocks.lock().unwrap().keys().cloned().collect();
    names.sort();
    names
  }
}

impl Default for ClockRegistry {
  fn default() -> Self {
    Self::new()
  }
}
