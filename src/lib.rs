pub mod api;
pub mod app;
pub mod auth;
pub mod clock;
pub mod coach;
pub mod config;
pub mod db;
pub mod favorites;
pub mod models;
pub mod notify;
pub mod reminders;
pub mod store;
pub mod sync;

#[cfg(test)]
mod test_utils;

use app::{AppError, AppState};
use config::AppConfig;
use tracing::{info, warn};

/// Headless host: load the patient's protocol, run the reminder loop and
/// stop on Ctrl-C or when the session can no longer be recovered.
pub async fn run() -> Result<(), AppError> {
  let config = AppConfig::from_env()?;
  let state = AppState::initialize(config).await?;

  let loaded = state.bootstrap().await;
  info!("Loaded {} protocol items", loaded);

  let scheduler = state.start_reminders();
  info!("Reminders: {:?}", state.reminders.state().await);

  let mut login_required = state.api.subscribe_login_required();
  tokio::select! {
    result = tokio::signal::ctrl_c() => {
      if let Err(e) = result {
        warn!("Could not listen for Ctrl-C: {}", e);
      }
    }
    _ = login_required.wait_for(|required| *required) => {
      warn!("Session expired, login required");
    }
  }

  scheduler.shutdown().await;
  state.db.close().await;
  info!("Shut down");
  Ok(())
}
