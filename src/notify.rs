//! Notification emitter contract
//!
//! The core only needs three operations from the platform: query the
//! permission, request it, and show a notification. Platforms without a
//! notification capability report `is_supported() == false`, and callers
//! turn every operation into a no-op.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
  #[default]
  Default,
  Granted,
  Denied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub title: String,
  pub body: String,
  /// Platforms collapse notifications that share a tag
  pub tag: Option<String>,
}

impl Notification {
  pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
    Self {
      title: title.into(),
      body: body.into(),
      tag: None,
    }
  }

  pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
    self.tag = Some(tag.into());
    self
  }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
  #[error("Notifications are not supported on this platform")]
  Unsupported,

  #[error("Permission request failed: {0}")]
  Permission(String),

  #[error("Failed to show notification: {0}")]
  Dispatch(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
  fn is_supported(&self) -> bool;

  fn permission(&self) -> Permission;

  /// Ask the user for permission. `Ok(true)` only when granted.
  async fn request_permission(&self) -> Result<bool, NotifyError>;

  async fn show(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// ---------------------------------------------------------------------------
/// Log Notifier (headless host)
/// ---------------------------------------------------------------------------

/// Writes notifications to the log. Permission is granted on request.
#[derive(Debug, Default)]
pub struct LogNotifier {
  permission: Mutex<Permission>,
}

impl LogNotifier {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Notifier for LogNotifier {
  fn is_supported(&self) -> bool {
    true
  }

  fn permission(&self) -> Permission {
    *self.permission.lock().unwrap_or_else(|e| e.into_inner())
  }

  async fn request_permission(&self) -> Result<bool, NotifyError> {
    *self.permission.lock().unwrap_or_else(|e| e.into_inner()) = Permission::Granted;
    Ok(true)
  }

  async fn show(&self, notification: Notification) -> Result<(), NotifyError> {
    if self.permission() != Permission::Granted {
      return Ok(());
    }

    info!(
      tag = notification.tag.as_deref().unwrap_or("-"),
      "{}: {}", notification.title, notification.body
    );
    Ok(())
  }
}
