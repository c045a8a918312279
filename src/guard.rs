// Guard condition for the reception wait-set.
//
// A mio channel whose receiver is registered in the poll alongside the reader
// notification channels. Triggering sends a unit token; the reception loop
// drains it on wake. Equivalent to a DDS guard condition: level-style
// semantics are emulated by draining exactly when the loop decides to handle
// the guard.

use std::io;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio_extras::channel as mio_channel;

/// Cloneable trigger half of a guard condition.
#[derive(Clone)]
pub struct GuardTrigger {
  sender: mio_channel::Sender<()>,
}

impl GuardTrigger {
  /// Wakes the wait-set. Triggering an already-triggered guard or a guard
  /// whose receiver is gone is harmless.
  pub fn trigger(&self) {
    // Send failure means the receiving loop is gone; nothing left to wake.
    let _ = self.sender.send(());
  }
}

/// Receiver half, registered into a `mio_06::Poll`.
pub struct GuardCondition {
  receiver: mio_channel::Receiver<()>,
  trigger: GuardTrigger,
}

impl GuardCondition {
  pub fn new() -> Self {
    let (sender, receiver) = mio_channel::channel::<()>();
    GuardCondition {
      receiver,
      trigger: GuardTrigger {
        sender,
      },
    }
  }

  pub fn trigger_handle(&self) -> GuardTrigger {
    self.trigger.clone()
  }

  pub fn trigger(&self) {
    self.trigger.trigger();
  }

  /// Consumes all pending trigger tokens. Returns true if any were pending.
  pub fn drain(&self) -> bool {
    let mut any = false;
    while self.receiver.try_recv().is_ok() {
      any = true;
    }
    any
  }

  pub fn register(
    &self,
    poll: &mio_06::Poll,
    token: mio_06::Token,
  ) -> io::Result<()> {
    poll.register(
      &self.receiver,
      token,
      mio_06::Ready::readable(),
      mio_06::PollOpt::edge(),
    )
  }
}

impl Default for GuardCondition {
  fn default() -> Self {
    Self::new()
  }
}
