// Simulation time as a nanosecond count.
//
// All clocks, samples and sync events in this crate speak Timestamp. Wall
// clock bookkeeping (discovery lease times) uses chrono instead and never
// mixes with simulation time.

use std::{fmt, ops, time};

/// A point in simulation time, nanoseconds since the simulation epoch.
///
/// The epoch is whatever the current main clock defines as zero; a reset event
/// moves it. Negative values are representable but only appear transiently
/// while a clock is being reset backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(i64);

impl Timestamp {
  pub const ZERO: Timestamp = Timestamp(0);

  pub const fn from_nanos(nanos: i64) -> Self {
    Timestamp(nanos)
  }

  pub const fn from_micros(micros: i64) -> Self {
    Timestamp(micros * 1_000)
  }

  pub const fn from_millis(millis: i64) -> Self {
    Timestamp(millis * 1_000_000)
  }

  pub const fn from_secs(secs: i64) -> Self {
    Timestamp(secs * 1_000_000_000)
  }

  pub const fn nanos(&self) -> i64 {
    self.0
  }

  /// Decimal-string rendering used on the clock-sync RPC wire.
  pub fn to_decimal_string(&self) -> String {
    self.0.to_string()
  }

  /// Parses the decimal-string wire form. Returns `None` on junk.
  pub fn parse_decimal(s: &str) -> Option<Timestamp> {
    s.trim().parse::<i64>().ok().map(Timestamp)
  }

  /// Saturating conversion to `std::time::Duration`; negative becomes zero.
  pub fn as_std_duration(&self) -> time::Duration {
    if self.0 <= 0 {
      time::Duration::ZERO
    } else {
      time::Duration::from_nanos(self.0 as u64)
    }
  }
}

impl From<time::Duration> for Timestamp {
  fn from(d: time::Duration) -> Self {
    Timestamp(d.as_nanos().min(i64::MAX as u128) as i64)
  }
}

impl ops::Add for Timestamp {
  type Output = Timestamp;
  fn add(self, rhs: Timestamp) -> Timestamp {
    Timestamp(self.0.saturating_add(rhs.0))
  }
}

impl ops::Sub for Timestamp {
  type Output = Timestamp;
  fn sub(self, rhs: Timestamp) -> Timestamp {
    Timestamp(self.0.saturating_sub(rhs.0))
  }
}

impl fmt::Display for Timestamp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}ns", self.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn conversions() {
    assert_eq!(Timestamp::from_millis(1).nanos(), 1_000_000);
    assert_eq!(Timestamp::from_secs(2), Timestamp::from_millis(2000));
    assert_eq!(
      Timestamp::from_secs(1).as_std_duration(),
      time::Duration::from_secs(1)
    );
    assert_eq!(
      Timestamp::from_nanos(-5).as_std_duration(),
      time::Duration::ZERO
    );
  }

  #[test]
  fn decimal_wire_form() {
    let t = Timestamp::from_nanos(1234567890);
    assert_eq!(t.to_decimal_string(), "1234567890");
    assert_eq!(Timestamp::parse_decimal("1234567890"), Some(t));
    assert_eq!(Timestamp::parse_decimal("not a number"), None);
  }

  #[test]
  fn arithmetic_saturates() {
    let max = Timestamp::from_nanos(i64::MAX);
    assert_eq!(max + Timestamp::from_nanos(1), max);
  }
}
