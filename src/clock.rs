//! Wall clock abstraction.
//!
//! The scheduler needs local wall time (day key + hour) and the cache needs
//! an absolute instant for freshness checks. Both go through [`Clock`] so
//! tests can pin or advance time instead of sleeping.

use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use std::sync::Mutex;

pub trait Clock: Send + Sync {
  /// Local wall-clock time, used for day keys and reminder windows
  fn now_local(&self) -> NaiveDateTime;

  /// Absolute time, used for cache fetch timestamps
  fn now_utc(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now_local(&self) -> NaiveDateTime {
    Local::now().naive_local()
  }

  fn now_utc(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Clock that only moves when told to.
///
/// Local and UTC time are the same instant here (the zone offset is zero),
/// which keeps day rollover and freshness arithmetic easy to reason about.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<NaiveDateTime>,
}

impl ManualClock {
  pub fn new(now: NaiveDateTime) -> Self {
    Self {
      now: Mutex::new(now),
    }
  }

  pub fn set(&self, now: NaiveDateTime) {
    *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now += by;
  }
}

impl Clock for ManualClock {
  fn now_local(&self) -> NaiveDateTime {
    *self.now.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn now_utc(&self) -> DateTime<Utc> {
    Utc.from_utc_datetime(&self.now_local())
  }
}
