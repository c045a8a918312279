// Component registry: the ordered set of service components a participant
// hosts (clock service, simulation bus, user components).
//
// Build-up hooks run in registration order and roll the already-touched
// components back on failure; teardown hooks run in reverse order and keep
// going past individual failures.

use std::sync::{Arc, Mutex};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::error::{Error, Result};

/// Lifecycle hooks of one participant component. Defaults are no-ops.
pub trait Component: Send + Sync {
  fn name(&self) -> &str;

  fn initialize(&self) -> Result<()> {
    Ok(())
  }
  /// Final configuration step before running; configuration errors surface
  /// here.
  fn tense(&self) -> Result<()> {
    Ok(())
  }
  fn relax(&self) -> Result<()> {
    Ok(())
  }
  fn start(&self) -> Result<()> {
    Ok(())
  }
  fn stop(&self) -> Result<()> {
    Ok(())
  }
  fn pause(&self) -> Result<()> {
    Ok(())
  }
  fn deinitialize(&self) -> Result<()> {
    Ok(())
  }
}

pub struct ComponentRegistry {
  components: Mutex<Vec<Arc<dyn Component>>>,
}

impl ComponentRegistry {
  pub fn new() -> Self {
    ComponentRegistry {
      components: Mutex::new(Vec::new()),
    }
  }

  pub fn register(&self, component: Arc<dyn Component>) -> Result<()> {
    let mut components = self.components.lock().unwrap();
    if components.iter().any(|c| c.name() == component.name()) {
      return Err(Error::AlreadyRegistered(format!(
        "component '{}'",
        component.name()
      )));
    }
    components.push(component);
    Ok(())
  }

  fn snapshot(&self) -> Vec<Arc<dyn Component>> {
    self.components.lock().unwrap().clone()
  }

  /// Runs `forward` over the components in order. On failure, `backward` is
  /// applied to the already-handled components in reverse, then the first
  /// error is returned.
  fn run_with_rollback(
    &self,
    what: &str,
    forward: impl Fn(&dyn Component) -> Result<()>,
    backward: impl Fn(&dyn Component),
  ) -> Result<()> {
    let components = self.snapshot();
    for (index, component) in components.iter().enumerate() {
      if let Err(e) = forward(component.as_ref()) {
        error!("component '{}' failed to {what}: {e}", component.name());
        for touched in components[..index].iter().rev() {
          backward(touched.as_ref());
        }
        return Err(e);
      }
    }
    Ok(())
  }

  /// Runs `hook` in reverse order, logging failures and continuing. The
  /// first error is returned after every component was visited.
  fn run_reverse_collecting(
    &self,
    what: &str,
    hook: impl Fn(&dyn Component) -> Result<()>,
  ) -> Result<()> {
    let mut first_error = None;
    for component in self.snapshot().iter().rev() {
      if let Err(e) = hook(component.as_ref()) {
        error!("component '{}' failed to {what}: {e}", component.name());
        first_error.get_or_insert(e);
      }
    }
    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  pub fn initialize(&self) -> Result<()> {
    self.run_with_rollback(
      "initialize",
      |c| c.initialize(),
      |c| {
        if let Err(e) = c.deinitialize() {
          error!("rollback deinitialize of component '{}' failed: {e}", c.name());
        }
      },
    )
  }

  pub fn tense(&self) -> Result<()> {
    self.run_with_rollback(
      "tense",
      |c| c.tense(),
      |c| {
        if let Err(e) = c.relax() {
          error!("rollback relax of component '{}' failed: {e}", c.name());
        }
      },
    )
  }

  pub fn relax(&self) -> Result<()> {
    self.run_reverse_collecting("relax", |c| c.relax())
  }

  pub fn start(&self) -> Result<()> {
    self.run_with_rollback(
      "start",
      |c| c.start(),
      |c| {
        if let Err(e) = c.stop() {
          error!("rollback stop of component '{}' failed: {e}", c.name());
        }
      },
    )
  }

  pub fn stop(&self) -> Result<()> {
    self.run_reverse_collecting("stop", |c| c.stop())
  }

  pub fn pause(&self) -> Result<()> {
    self.run_with_rollback("pause", |c| c.pause(), |_| {})
  }

  pub fn deinitialize(&self) -> Result<()> {
    self.run_reverse_collecting("deinitialize", |c| c.deinitialize())
  }
}

impl Default for ComponentRegistry {
  fn default() -> Self {
    Self::new()
  }
}
