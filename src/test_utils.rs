//! Test utilities and helpers for unit testing
//!
//! This module provides common test infrastructure including:
//! - Database setup/teardown
//! - Mock data factories
//! - A recording notifier

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::models::{ItemStatus, ProtocolItem, Role, Session, TimeSlot};
use crate::notify::{Notification, Notifier, NotifyError, Permission};
use crate::store::{self, keys, KeyValueStore};
use crate::sync::Cached;

/// ---------------------------------------------------------------------------
/// Database Test Utilities
/// ---------------------------------------------------------------------------

/// Create an in-memory SQLite database with all migrations applied
///
/// Uses max_connections(1) to prevent multiple pool connections from creating
/// isolated in-memory databases, which would cause intermittent test failures
pub async fn setup_test_db() -> SqlitePool {
  let pool = sqlx::sqlite::SqlitePoolOptions::new()
    .max_connections(1)
    .connect("sqlite::memory:")
    .await
    .expect("Failed to create in-memory database");

  sqlx::migrate!("./migrations")
    .run(&pool)
    .await
    .expect("Failed to run migrations");

  pool
}

/// Close a test database pool
pub async fn teardown_test_db(pool: SqlitePool) {
  pool.close().await;
}

/// Persist `items` as the patient's cached protocol, fetched at the epoch
pub async fn seed_protocol_cache(store: &dyn KeyValueStore, patient_id: &str, items: &[ProtocolItem]) {
  let cached = Cached::new(items.to_vec(), Utc.timestamp_opt(0, 0).unwrap());
  store::set_json(store, &keys::cache_key(keys::PROTOCOL_CACHE, patient_id), &cached)
    .await
    .expect("Failed to seed protocol cache");
}

/// ---------------------------------------------------------------------------
/// Mock Data Factories
/// ---------------------------------------------------------------------------

pub fn mock_session(token: &str) -> Session {
  Session {
    id: "patient-1".to_string(),
    token: token.to_string(),
    name: "Ana Pérez".to_string(),
    email: "ana@example.com".to_string(),
    avatar_url: None,
    role: Role::Patient,
    last_login_at: Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap(),
  }
}

pub fn mock_protocol_item(id: &str, slot: TimeSlot, status: ItemStatus) -> ProtocolItem {
  ProtocolItem {
    id: id.to_string(),
    category: "PRIMARY_NUTRACEUTICALS".to_string(),
    item_name: format!("Item {}", id),
    dose: "1 cápsula".to_string(),
    schedule: slot.to_string(),
    observations: None,
    status,
    time_slot: slot,
    prescribed_at: "2024-01-01T00:00:00Z".to_string(),
    updated_at: "2024-01-01T00:00:00Z".to_string(),
  }
}

/// Local wall-clock time on `date` (YYYY-MM-DD)
pub fn local_datetime(date: &str, hour: u32, minute: u32) -> NaiveDateTime {
  NaiveDate::parse_from_str(date, "%Y-%m-%d")
    .expect("Invalid test date")
    .and_hms_opt(hour, minute, 0)
    .expect("Invalid test time")
}

/// ---------------------------------------------------------------------------
/// Recording Notifier
/// ---------------------------------------------------------------------------

/// Notifier fake that records everything it shows
pub struct RecordingNotifier {
  supported: bool,
  grants: bool,
  request_fails: bool,
  permission: Mutex<Permission>,
  fail_next_show: AtomicBool,
  shown: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
  fn build(supported: bool, grants: bool, request_fails: bool) -> Self {
    Self {
      supported,
      grants,
      request_fails,
      permission: Mutex::new(Permission::Default),
      fail_next_show: AtomicBool::new(false),
      shown: Mutex::new(Vec::new()),
    }
  }

  pub fn granting() -> Self {
    Self::build(true, true, false)
  }

  pub fn denying() -> Self {
    Self::build(true, false, false)
  }

  pub fn failing_request() -> Self {
    Self::build(true, true, true)
  }

  pub fn unsupported() -> Self {
    Self::build(false, true, false)
  }

  pub fn fail_next_show(&self) {
    self.fail_next_show.store(true, Ordering::SeqCst);
  }

  pub fn shown(&self) -> Vec<Notification> {
    self.shown.lock().unwrap().clone()
  }

  pub fn clear(&self) {
    self.shown.lock().unwrap().clear();
  }
}

#[async_trait]
impl Notifier for RecordingNotifier {
  fn is_supported(&self) -> bool {
    self.supported
  }

  fn permission(&self) -> Permission {
    *self.permission.lock().unwrap()
  }

  async fn request_permission(&self) -> Result<bool, NotifyError> {
    if self.request_fails {
      return Err(NotifyError::Permission("prompt dismissed".into()));
    }
    let outcome = if self.grants {
      Permission::Granted
    } else {
      Permission::Denied
    };
    *self.permission.lock().unwrap() = outcome;
    Ok(self.grants)
  }

  async fn show(&self, notification: Notification) -> Result<(), NotifyError> {
    if !self.supported {
      return Err(NotifyError::Unsupported);
    }
    if self.fail_next_show.swap(false, Ordering::SeqCst) {
      return Err(NotifyError::Dispatch("simulated failure".into()));
    }
    self.shown.lock().unwrap().push(notification);
    Ok(())
  }
}

/// ---------------------------------------------------------------------------
/// Tests for Test Utilities
/// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryStore;
  use chrono::Timelike;

  #[tokio::test]
  async fn test_setup_db_creates_schema() {
    let pool = setup_test_db().await;

    let tables: Vec<(String,)> =
      sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' AND name='kv_store'")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(tables.len(), 1);

    teardown_test_db(pool).await;
  }

  #[tokio::test]
  async fn test_seed_protocol_cache_round_trips() {
    let kv = MemoryStore::new();
    let items = vec![mock_protocol_item("a", TimeSlot::Morning, ItemStatus::Pending)];
    seed_protocol_cache(&kv, "p1", &items).await;

    let cached: Cached<Vec<ProtocolItem>> =
      store::get_json(&kv, &keys::cache_key(keys::PROTOCOL_CACHE, "p1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.value, items);
  }

  #[test]
  fn test_local_datetime_helper() {
    let dt = local_datetime("2024-01-02", 21, 15);
    assert_eq!(dt.format("%Y-%m-%d").to_string(), "2024-01-02");
    assert_eq!((dt.hour(), dt.minute()), (21, 15));
  }

  #[tokio::test]
  async fn test_recording_notifier_failure_is_one_shot() {
    let notifier = RecordingNotifier::granting();
    notifier.fail_next_show();

    assert!(notifier.show(Notification::new("a", "b")).await.is_err());
    assert!(notifier.show(Notification::new("a", "b")).await.is_ok());
    assert_eq!(notifier.shown().len(), 1);
  }
}
