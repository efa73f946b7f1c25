//! Reminder scheduler
//!
//! Once per tick (immediately on start, then every `tick_interval`) the
//! scheduler checks whether local time falls inside one of the daily
//! windows and, if so, emits at most one notification for that window per
//! local day. A persisted [`ReminderLog`] records which windows already
//! fired today; a log from another day is discarded.
//!
//! Key behaviours:
//! - a window with nothing pending is not marked sent, so a later tick in
//!   the same window can still fire
//! - disabled or not-granted short-circuits before any window check
//! - no retries: a missed window is not recovered

use chrono::Timelike;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::models::{ProtocolItem, TimeSlot};
use crate::notify::{Notification, Notifier, Permission};
use crate::store::{self, keys, KeyValueStore, StoreError};

/// Protocol items shared between the sync path and the scheduler
pub type SharedItems = Arc<RwLock<Vec<ProtocolItem>>>;

const TEST_TAG: &str = "test-notification";

/// ---------------------------------------------------------------------------
/// Configuration
/// ---------------------------------------------------------------------------

/// A daily window, half-open in local hours: `[start_hour, end_hour)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReminderWindow {
  pub slot: TimeSlot,
  pub start_hour: u32,
  pub end_hour: u32,
}

impl ReminderWindow {
  pub fn contains(&self, hour: u32) -> bool {
    hour >= self.start_hour && hour < self.end_hour
  }
}

#[derive(Debug, Clone)]
pub struct ReminderConfig {
  pub tick_interval: Duration,
  pub windows: Vec<ReminderWindow>,
}

impl Default for ReminderConfig {
  fn default() -> Self {
    Self {
      tick_interval: Duration::from_secs(60),
      windows: vec![
        ReminderWindow {
          slot: TimeSlot::Morning,
          start_hour: 8,
          end_hour: 12,
        },
        ReminderWindow {
          slot: TimeSlot::Afternoon,
          start_hour: 13,
          end_hour: 17,
        },
        ReminderWindow {
          slot: TimeSlot::Evening,
          start_hour: 20,
          end_hour: 23,
        },
      ],
    }
  }
}

impl ReminderConfig {
  pub fn active_window(&self, hour: u32) -> Option<TimeSlot> {
    self.windows.iter().find(|w| w.contains(hour)).map(|w| w.slot)
  }
}

/// ---------------------------------------------------------------------------
/// Reminder Log
/// ---------------------------------------------------------------------------

/// Per-day idempotency record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderLog {
  /// Local day, YYYY-MM-DD
  pub date: String,
  pub slots_sent: Vec<TimeSlot>,
}

impl ReminderLog {
  pub fn for_day(date: &str) -> Self {
    Self {
      date: date.to_string(),
      slots_sent: Vec::new(),
    }
  }

  pub fn has_sent(&self, slot: TimeSlot) -> bool {
    self.slots_sent.contains(&slot)
  }

  pub fn mark_sent(&mut self, slot: TimeSlot) {
    if !self.has_sent(slot) {
      self.slots_sent.push(slot);
    }
  }
}

/// ---------------------------------------------------------------------------
/// States and Outcomes
/// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderState {
  Disabled,
  EnabledNoPermission,
  EnabledGranted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
  /// Platform has no notification capability
  Unsupported,
  /// Notifications disabled or permission not granted
  Inactive,
  OutsideWindows,
  AlreadySent(TimeSlot),
  NothingPending(TimeSlot),
  DispatchFailed(TimeSlot),
  Notified { slot: TimeSlot, pending: usize },
}

/// Items due in `slot` (including ANYTIME items) that are not completed
pub fn pending_count(items: &[ProtocolItem], slot: TimeSlot) -> usize {
  items
    .iter()
    .filter(|i| i.is_due_in(slot) && i.is_pending())
    .count()
}

fn reminder_copy(slot: TimeSlot, pending: usize) -> (String, String) {
  match slot {
    TimeSlot::Morning => (
      "☀️ Rutina de Mañana".to_string(),
      format!("Tienes {} elementos pendientes para empezar el día.", pending),
    ),
    TimeSlot::Afternoon => (
      "🌤️ Refuerzo de Tarde".to_string(),
      format!("Es hora de tus {} suplementos y hábitos de la tarde.", pending),
    ),
    TimeSlot::Evening => (
      "🌙 Preparación para Dormir".to_string(),
      format!("No olvides tus {} pasos de la rutina nocturna.", pending),
    ),
    TimeSlot::Anytime => (
      "🔔 Recordatorio".to_string(),
      format!("Tienes {} elementos pendientes.", pending),
    ),
  }
}

/// ---------------------------------------------------------------------------
/// Scheduler
/// ---------------------------------------------------------------------------

pub struct ReminderScheduler {
  config: ReminderConfig,
  store: Arc<dyn KeyValueStore>,
  notifier: Arc<dyn Notifier>,
  clock: Arc<dyn Clock>,
}

impl ReminderScheduler {
  pub fn new(
    config: ReminderConfig,
    store: Arc<dyn KeyValueStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      config,
      store,
      notifier,
      clock,
    }
  }

  pub fn is_supported(&self) -> bool {
    self.notifier.is_supported()
  }

  pub fn permission(&self) -> Permission {
    if !self.is_supported() {
      return Permission::Denied;
    }
    self.notifier.permission()
  }

  /// Persisted "enabled" flag. Unreadable storage counts as disabled.
  pub async fn is_enabled(&self) -> bool {
    match self.store.get(keys::NOTIFICATIONS_ENABLED).await {
      Ok(value) => value.as_deref() == Some("true"),
      Err(e) => {
        warn!("Could not read notification flag: {}", e);
        false
      }
    }
  }

  pub async fn state(&self) -> ReminderState {
    if !self.is_supported() || !self.is_enabled().await {
      return ReminderState::Disabled;
    }
    match self.notifier.permission() {
      Permission::Granted => ReminderState::EnabledGranted,
      _ => ReminderState::EnabledNoPermission,
    }
  }

  /// Ask for permission. On grant, persist the flag and confirm with a
  /// notification. Returns whether reminders are now enabled.
  pub async fn enable(&self) -> Result<bool, StoreError> {
    if !self.is_supported() {
      return Ok(false);
    }

    let granted = match self.notifier.request_permission().await {
      Ok(granted) => granted,
      Err(e) => {
        warn!("Notification permission request failed: {}", e);
        false
      }
    };

    if !granted {
      info!("Notification permission not granted");
      return Ok(false);
    }

    self.store.set(keys::NOTIFICATIONS_ENABLED, "true").await?;
    self
      .dispatch(Notification::new(
        "Recordatorios Activados",
        "Te avisaremos cuando sea hora de tus suplementos y terapias.",
      ))
      .await;

    info!("Reminders enabled");
    Ok(true)
  }

  pub async fn disable(&self) -> Result<(), StoreError> {
    if !self.is_supported() {
      return Ok(());
    }
    self.store.set(keys::NOTIFICATIONS_ENABLED, "false").await?;
    info!("Reminders disabled");
    Ok(())
  }

  /// Bypasses windows and the log
  pub async fn send_test_notification(&self) {
    if !self.is_supported() {
      return;
    }
    self
      .dispatch(
        Notification::new(
          "🔔 Prueba de Notificación",
          "El sistema de recordatorios funciona correctamente.",
        )
        .with_tag(TEST_TAG),
      )
      .await;
  }

  /// Evaluate the current time against the windows and the log, emitting
  /// at most one notification.
  pub async fn tick(&self, items: &[ProtocolItem]) -> TickOutcome {
    if !self.is_supported() {
      return TickOutcome::Unsupported;
    }
    if !self.is_enabled().await || self.notifier.permission() != Permission::Granted {
      return TickOutcome::Inactive;
    }

    let now = self.clock.now_local();
    let today = now.format("%Y-%m-%d").to_string();
    let mut log = self.load_log(&today).await;

    let Some(slot) = self.config.active_window(now.hour()) else {
      return TickOutcome::OutsideWindows;
    };

    if log.has_sent(slot) {
      return TickOutcome::AlreadySent(slot);
    }

    let pending = pending_count(items, slot);
    if pending == 0 {
      return TickOutcome::NothingPending(slot);
    }

    let (title, body) = reminder_copy(slot, pending);
    let notification = Notification::new(title, body).with_tag(format!("reminder-{}-{}", today, slot));

    if let Err(e) = self.notifier.show(notification).await {
      warn!("Reminder for {} not delivered: {}", slot, e);
      return TickOutcome::DispatchFailed(slot);
    }

    log.mark_sent(slot);
    if let Err(e) = store::set_json(self.store.as_ref(), keys::REMINDER_LOG, &log).await {
      warn!("Failed to persist reminder log: {}", e);
    }

    info!("Sent {} reminder ({} pending)", slot, pending);
    TickOutcome::Notified { slot, pending }
  }

  /// Today's log; anything else (missing, unreadable, another day) becomes
  /// an empty log for today. A discarded log is overwritten right away.
  async fn load_log(&self, today: &str) -> ReminderLog {
    match store::get_json::<ReminderLog>(self.store.as_ref(), keys::REMINDER_LOG).await {
      Ok(Some(log)) if log.date == today => log,
      Ok(Some(log)) => {
        debug!("Reminder log from {} rolled over to {}", log.date, today);
        self.replace_log(today).await
      }
      Ok(None) => ReminderLog::for_day(today),
      Err(e) => {
        warn!("Discarding unreadable reminder log: {}", e);
        self.replace_log(today).await
      }
    }
  }

  async fn replace_log(&self, today: &str) -> ReminderLog {
    let log = ReminderLog::for_day(today);
    if let Err(e) = store::set_json(self.store.as_ref(), keys::REMINDER_LOG, &log).await {
      warn!("Failed to persist reminder log: {}", e);
    }
    log
  }

  async fn dispatch(&self, notification: Notification) {
    if let Err(e) = self.notifier.show(notification).await {
      warn!("Notification not delivered: {}", e);
    }
  }

  /// Run the tick loop on the runtime until the handle is shut down or
  /// dropped. Each tick reads a snapshot of `items`.
  pub fn spawn(self: Arc<Self>, items: SharedItems) -> SchedulerHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
      let mut interval = tokio::time::interval(self.config.tick_interval);
      interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
        tokio::select! {
          _ = interval.tick() => {
            let snapshot = items.read().await.clone();
            let outcome = self.tick(&snapshot).await;
            debug!(?outcome, "Reminder tick");
          }
          _ = shutdown_rx.changed() => break,
        }
      }

      debug!("Reminder scheduler stopped");
    });

    SchedulerHandle { shutdown, task }
  }
}

/// Owns the running tick loop
pub struct SchedulerHandle {
  shutdown: watch::Sender<bool>,
  task: JoinHandle<()>,
}

impl SchedulerHandle {
  pub async fn shutdown(self) {
    self.shutdown.send_replace(true);
    if let Err(e) = self.task.await {
      warn!("Reminder task ended abnormally: {}", e);
    }
  }
}

/// ---------------------------------------------------------------------------
/// Tests
/// ---------------------------------------------------------------------------
