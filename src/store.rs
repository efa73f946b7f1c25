//! Persistent key-value store
//!
//! Everything the core persists (session, tokens, cached resources, the
//! reminder log) is a string value under a string key. Keys are independent:
//! there is no multi-key transaction, so two related writes can disagree
//! after a crash. The worst case is stale data, never corruption.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::db::DbPool;

/// ---------------------------------------------------------------------------
/// Storage Keys
/// ---------------------------------------------------------------------------

pub mod keys {
  pub const AUTH_TOKEN: &str = "auth_token";
  pub const REFRESH_TOKEN: &str = "refresh_token";
  pub const SESSION: &str = "rejuvenate_session_v1";

  pub const NOTIFICATIONS_ENABLED: &str = "notifications_enabled";
  pub const REMINDER_LOG: &str = "rejuvenate_reminders_log";
  pub const FAVORITE_FOODS: &str = "rejuvenate_favorite_foods";

  pub const PROTOCOL_CACHE: &str = "rejuvenate_protocol_cache";
  pub const NUTRITION_CACHE: &str = "rejuvenate_nutrition_cache";
  pub const PROFILE_CACHE: &str = "rejuvenate_profile_cache";

  /// Every key owned by the auth layer
  pub const SESSION_KEYS: [&str; 3] = [AUTH_TOKEN, REFRESH_TOKEN, SESSION];

  /// Every per-patient cache resource
  pub const CACHE_RESOURCES: [&str; 3] = [PROTOCOL_CACHE, NUTRITION_CACHE, PROFILE_CACHE];

  /// `resource-type_patientId`
  pub fn cache_key(resource: &str, patient_id: &str) -> String {
    format!("{}_{}", resource, patient_id)
  }
}

/// ---------------------------------------------------------------------------
/// Error Handling
/// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("Database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("Migration error: {0}")]
  Migration(#[from] sqlx::migrate::MigrateError),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

/// ---------------------------------------------------------------------------
/// Store Contract
/// ---------------------------------------------------------------------------

#[async_trait]
pub trait KeyValueStore: Send + Sync {
  async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

  async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

  async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Read a JSON value. A missing key is `Ok(None)`; a value that no longer
/// parses is an error so callers can decide whether to discard it.
pub async fn get_json<T: DeserializeOwned>(
  store: &dyn KeyValueStore,
  key: &str,
) -> Result<Option<T>, StoreError> {
  match store.get(key).await? {
    Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
    None => Ok(None),
  }
}

pub async fn set_json<T: Serialize + ?Sized>(
  store: &dyn KeyValueStore,
  key: &str,
  value: &T,
) -> Result<(), StoreError> {
  let raw = serde_json::to_string(value)?;
  store.set(key, &raw).await
}

/// ---------------------------------------------------------------------------
/// SQLite Store
/// ---------------------------------------------------------------------------

pub struct SqliteStore {
  pool: DbPool,
}

impl SqliteStore {
  pub fn new(pool: DbPool) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
  async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM kv_store WHERE key = ?1")
      .bind(key)
      .fetch_optional(&self.pool)
      .await?;

    Ok(value)
  }

  async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      INSERT INTO kv_store (key, value, updated_at)
      VALUES (?1, ?2, CURRENT_TIMESTAMP)
      ON CONFLICT(key) DO UPDATE SET
        value = excluded.value,
        updated_at = excluded.updated_at
      "#,
    )
    .bind(key)
    .bind(value)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM kv_store WHERE key = ?1")
      .bind(key)
      .execute(&self.pool)
      .await?;

    Ok(())
  }
}

/// ---------------------------------------------------------------------------
/// In-Memory Store
/// ---------------------------------------------------------------------------

/// Non-persistent store for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
  async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
    Ok(self.entries().get(key).cloned())
  }

  async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
    self.entries().insert(key.to_string(), value.to_string());
    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<(), StoreError> {
    self.entries().remove(key);
    Ok(())
  }
}

/// ---------------------------------------------------------------------------
/// Tests
/// ---------------------------------------------------------------------------
