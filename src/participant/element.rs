// User element hosting.
//
// The element is the user-supplied compute part of a participant. The
// element manager owns its lifetime: created on `load`, destroyed on
// `unload`, driven through the hooks in between.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::error::{Error, Result};

/// The user-supplied compute element of a participant.
///
/// All hooks default to no-ops, so an element only implements what it needs.
/// The teardown hooks are infallible: a participant must always be able to
/// wind down.
pub trait Element: Send {
  fn name(&self) -> String;

  fn load(&mut self) -> Result<()> {
    Ok(())
  }
  fn initialize(&mut self) -> Result<()> {
    Ok(())
  }
  fn run(&mut self) -> Result<()> {
    Ok(())
  }
  fn stop(&mut self) {}
  fn deinitialize(&mut self) {}
  fn unload(&mut self) {}
}

type ElementFactory = Box<dyn Fn() -> Result<Box<dyn Element>> + Send>;

/// Creates the element on load and drives it through its hooks.
pub struct ElementManager {
  factory: ElementFactory,
  element: Option<Box<dyn Element>>,
}

impl ElementManager {
  pub fn new<F>(factory: F) -> Self
  where
    F: Fn() -> Result<Box<dyn Element>> + Send + 'static,
  {
    ElementManager {
      factory: Box::new(factory),
      element: None,
    }
  }

  pub fn load_element(&mut self) -> Result<()> {
    if self.element.is_some() {
      return Err(Error::InvalidState("an element is already loaded".to_string()));
    }
    let mut element = (self.factory)()?;
    element.load()?;
    debug!("loaded element '{}'", element.name());
    self.element = Some(element);
    Ok(())
  }

  pub fn unload_element(&mut self) {
    if let Some(mut element) = self.element.take() {
      element.unload();
    }
  }

  pub fn initialize_element(&mut self) -> Result<()> {
    self.with_element(|element| element.initialize())
  }

  pub fn deinitialize_element(&mut self) {
    if let Some(element) = self.element.as_mut() {
      element.deinitialize();
    }
  }

  pub fn run_element(&mut self) -> Result<()> {
    self.with_element(|element| element.run())
  }

  pub fn stop_element(&mut self) {
    if let Some(element) = self.element.as_mut() {
      element.stop();
    }
  }

  fn with_element<R>(&mut self, f: impl FnOnce(&mut dyn Element) -> Result<R>) -> Result<R> {
    match self.element.as_mut() {
      Some(element) => f(element.as_mut()),
      None => Err(Error::InvalidState("no element loaded".to_string())),
    }
  }
}

/// An element that does nothing; useful for participants that only forward
/// data or serve as tooling endpoints.
pub struct NoopElement {
  name: String,
}

impl NoopElement {
  pub fn factory(name: &str) -> impl Fn() -> Result<Box<dyn Element>> + Send + Clone {
    let name = name.to_string();
    move || {
      Ok(Box::new(NoopElement {
        name: name.clone(),
      }) as Box<dyn Element>)
    }
  }
}

impl Element for NoopElement {
  fn name(&self) -> String {
    self.name.clone()
  }
}
