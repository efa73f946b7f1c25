//! Composition root
//!
//! `AppState` wires the store, transport, services and scheduler together
//! and exposes the handful of operations a host shell drives: bootstrap,
//! toggles, logout and the reminder loop.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::auth::AuthService;
use crate::clock::{Clock, SystemClock};
use crate::coach::{CoachSession, PatientContext};
use crate::config::{AppConfig, ConfigError};
use crate::db::{self, DbPool};
use crate::favorites::FavoriteFoods;
use crate::models::{ItemStatus, ProtocolItem};
use crate::notify::{LogNotifier, Notifier};
use crate::reminders::{ReminderScheduler, SchedulerHandle, SharedItems};
use crate::store::{KeyValueStore, SqliteStore, StoreError};
use crate::sync::SyncService;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
  #[error("Configuration error: {0}")]
  Config(#[from] ConfigError),

  #[error("Storage error: {0}")]
  Store(#[from] StoreError),
}

pub struct AppState {
  pub db: DbPool,
  pub config: AppConfig,
  pub api: Arc<ApiClient>,
  pub auth: AuthService,
  pub sync: SyncService,
  pub reminders: Arc<ReminderScheduler>,
  pub favorites: FavoriteFoods,
  /// What the reminder loop counts as pending
  pub items: SharedItems,
}

impl AppState {
  /// Open the configured database and build the state with the headless
  /// notifier and the system clock. A `:memory:` path keeps nothing on disk.
  pub async fn initialize(config: AppConfig) -> Result<Self, AppError> {
    let pool = if config.db_path.as_os_str() == db::MEMORY_PATH {
      db::initialize_memory_db().await?
    } else {
      db::initialize_db(&config.db_path).await?
    };
    Ok(Self::new(
      config,
      pool,
      Arc::new(LogNotifier::new()),
      Arc::new(SystemClock),
    ))
  }

  pub fn new(config: AppConfig, db: DbPool, notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> Self {
    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::new(db.clone()));
    let api = Arc::new(ApiClient::new(
      config.api_base_url.clone(),
      config.auth_base_url.clone(),
      store.clone(),
    ));
    let auth = AuthService::new(api.clone(), store.clone(), clock.clone());
    let sync = SyncService::new(api.clone(), store.clone(), clock.clone(), config.cache_freshness);
    let favorites = FavoriteFoods::new(store.clone());
    let reminders = Arc::new(ReminderScheduler::new(
      config.reminders.clone(),
      store,
      notifier,
      clock,
    ));

    Self {
      db,
      config,
      api,
      auth,
      sync,
      reminders,
      favorites,
      items: Arc::new(RwLock::new(Vec::new())),
    }
  }

  /// Load the patient's protocol into the shared items. Offline-capable
  /// hosts first seed from the cache so reminders work before the network
  /// answers. Returns the number of items loaded.
  pub async fn bootstrap(&self) -> usize {
    let Some(session) = self.auth.current_session().await else {
      info!("No session, skipping bootstrap");
      return 0;
    };

    if self.config.offline_capable {
      if let Some(cached) = self.sync.cached_protocol(&session.id).await {
        info!("Seeded {} items from cache ({})", cached.value.len(), cached.fetched_at);
        *self.items.write().await = cached.value;
      }
    }

    self.refresh_protocol().await.len()
  }

  /// Fetch the protocol (cache fallback inside) and publish it to the
  /// shared items
  pub async fn refresh_protocol(&self) -> Vec<ProtocolItem> {
    let Some(session) = self.auth.current_session().await else {
      return Vec::new();
    };

    let items = self.sync.fetch_active_protocol(&session.id).await;
    *self.items.write().await = items.clone();
    items
  }

  /// Toggle through the sync service; the shared items only change once
  /// the server has confirmed
  pub async fn toggle_item(&self, item_id: &str, status: ItemStatus) -> bool {
    let Some(session) = self.auth.current_session().await else {
      warn!("Toggle for {} without a session", item_id);
      return false;
    };

    if !self.sync.toggle_item_status(&session.id, item_id, status).await {
      return false;
    }

    let mut items = self.items.write().await;
    for item in items.iter_mut().filter(|i| i.id == item_id) {
      item.status = status;
    }
    true
  }

  pub async fn logout(&self) {
    self.auth.logout(&self.sync).await;
    self.items.write().await.clear();
  }

  pub fn start_reminders(&self) -> SchedulerHandle {
    self.reminders.clone().spawn(self.items.clone())
  }

  /// New coach session personalized with the cached or fetched profile
  pub async fn start_coach(&self) -> CoachSession {
    let context = match self.auth.current_session().await {
      Some(session) => self
        .sync
        .fetch_profile(&session.id)
        .await
        .map(|profile| PatientContext::from_profile(&session, &profile)),
      None => None,
    };
    CoachSession::start(self.config.coach.clone(), context)
  }
}

/// ---------------------------------------------------------------------------
/// Tests
/// ---------------------------------------------------------------------------
