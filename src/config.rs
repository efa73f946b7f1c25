//! Environment configuration
//!
//! Everything here is read once at startup (after `dotenvy::dotenv()`).
//! Unset variables fall back to defaults; set-but-invalid variables are an
//! error rather than a silent default.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use crate::coach::CoachConfig;
use crate::reminders::ReminderConfig;

/// ---------------------------------------------------------------------------
/// Defaults
/// ---------------------------------------------------------------------------

const DEFAULT_API_BASE_URL: &str = "https://doctor-antivejez-web.onrender.com/api";
const DEFAULT_AUTH_BASE_URL: &str = "https://doctor-antivejez-web.onrender.com";
const DEFAULT_DB_PATH: &str = "rejuvenate.db";
const DEFAULT_TICK_SECONDS: u64 = 60;
const DEFAULT_FRESHNESS_SECONDS: u64 = 5 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Invalid value for {key}: {message}")]
  Invalid { key: String, message: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
  /// Clinical API origin, including the `/api` prefix
  pub api_base_url: String,
  /// Origin hosting the mobile auth routes (no `/api` prefix)
  pub auth_base_url: String,
  pub db_path: PathBuf,
  pub offline_capable: bool,
  pub cache_freshness: Duration,
  pub reminders: ReminderConfig,
  pub coach: CoachConfig,
}

impl AppConfig {
  pub fn from_env() -> Result<Self, ConfigError> {
    let api_base_url = load_url("API_BASE_URL", DEFAULT_API_BASE_URL)?;
    let auth_base_url = load_url("AUTH_BASE_URL", DEFAULT_AUTH_BASE_URL)?;
    let db_path = PathBuf::from(load_or("REJUVENATE_DB_PATH", DEFAULT_DB_PATH));
    let offline_capable: bool = try_load("OFFLINE_CAPABLE", "true")?;
    let tick_seconds: u64 = try_load("REMINDER_TICK_SECONDS", &DEFAULT_TICK_SECONDS.to_string())?;
    let freshness_seconds: u64 =
      try_load("CACHE_FRESHNESS_SECONDS", &DEFAULT_FRESHNESS_SECONDS.to_string())?;

    let reminders = ReminderConfig {
      tick_interval: Duration::from_secs(tick_seconds.max(1)),
      ..ReminderConfig::default()
    };

    Ok(Self {
      api_base_url,
      auth_base_url,
      db_path,
      offline_capable,
      cache_freshness: Duration::from_secs(freshness_seconds),
      reminders,
      coach: CoachConfig::from_env()?,
    })
  }
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      api_base_url: DEFAULT_API_BASE_URL.to_string(),
      auth_base_url: DEFAULT_AUTH_BASE_URL.to_string(),
      db_path: PathBuf::from(DEFAULT_DB_PATH),
      offline_capable: true,
      cache_freshness: Duration::from_secs(DEFAULT_FRESHNESS_SECONDS),
      reminders: ReminderConfig::default(),
      coach: CoachConfig::default(),
    }
  }
}

/// ---------------------------------------------------------------------------
/// Helpers
/// ---------------------------------------------------------------------------

pub(crate) fn load_or(key: &str, default: &str) -> String {
  env::var(key).unwrap_or_else(|_| {
    info!("{key} not set, using default: {default}");
    default.to_string()
  })
}

pub(crate) fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T, ConfigError>
where
  T::Err: Display,
{
  load_or(key, default).trim().parse().map_err(|e: T::Err| {
    warn!("Invalid {key} value: {e}");
    ConfigError::Invalid {
      key: key.to_string(),
      message: e.to_string(),
    }
  })
}

pub(crate) fn load_url(key: &str, default: &str) -> Result<String, ConfigError> {
  let raw = load_or(key, default);
  Url::parse(&raw).map_err(|e| ConfigError::Invalid {
    key: key.to_string(),
    message: e.to_string(),
  })?;
  Ok(raw.trim_end_matches('/').to_string())
}

/// ---------------------------------------------------------------------------
/// Tests
/// ---------------------------------------------------------------------------
