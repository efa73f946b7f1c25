//! Patient login, logout and the persisted session
//!
//! Login goes straight to the auth origin rather than through
//! [`ApiClient::send`]: a rejected login is a user error, not an expired
//! session, and must never trigger the refresh path.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::clock::Clock;
use crate::models::{Role, Session};
use crate::store::{self, keys, KeyValueStore, StoreError};
use crate::sync::SyncService;

const LOGIN_PATH: &str = "/mobile-auth-v1";
const DEFAULT_LOGIN_ERROR: &str = "Error al iniciar sesión. Verifique sus credenciales.";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
  /// Message is shown to the patient as-is
  #[error("{0}")]
  Rejected(String),

  #[error("HTTP request failed: {0}")]
  Request(#[from] reqwest::Error),

  #[error("Storage error: {0}")]
  Store(#[from] StoreError),
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
  identification: &'a str,
  #[serde(skip_serializing_if = "Option::is_none")]
  password: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
  token: String,
  #[serde(default)]
  refresh_token: Option<String>,
  patient: LoginPatient,
}

#[derive(Debug, Deserialize)]
struct LoginPatient {
  id: String,
  name: String,
  #[serde(default)]
  email: String,
}

pub struct AuthService {
  api: Arc<ApiClient>,
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
}

impl AuthService {
  pub fn new(api: Arc<ApiClient>, store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
    Self { api, store, clock }
  }

  pub async fn login(&self, identification: &str, password: Option<&str>) -> Result<Session, AuthError> {
    let url = format!("{}{}", self.api.auth_base_url(), LOGIN_PATH);
    let response = self
      .api
      .http()
      .post(&url)
      .json(&LoginRequest {
        identification,
        password,
      })
      .send()
      .await?;

    if !response.status().is_success() {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      warn!("Login rejected with {}", status);
      return Err(AuthError::Rejected(rejection_message(&body)));
    }

    let login: LoginResponse = match response.json().await {
      Ok(login) => login,
      Err(e) => {
        warn!("Malformed login response: {}", e);
        return Err(AuthError::Rejected(DEFAULT_LOGIN_ERROR.to_string()));
      }
    };

    let session = Session {
      id: login.patient.id,
      token: login.token,
      name: login.patient.name,
      email: login.patient.email,
      avatar_url: None,
      role: Role::Patient,
      last_login_at: self.clock.now_utc(),
    };

    self.store.set(keys::AUTH_TOKEN, &session.token).await?;
    match &login.refresh_token {
      Some(refresh) => self.store.set(keys::REFRESH_TOKEN, refresh).await?,
      None => self.store.remove(keys::REFRESH_TOKEN).await?,
    }
    store::set_json(self.store.as_ref(), keys::SESSION, &session).await?;

    self.api.mark_authenticated();
    info!("Patient {} logged in", session.id);
    Ok(session)
  }

  /// Remove the session and tokens, then drop the patient's cached data
  pub async fn logout(&self, sync: &SyncService) {
    let session = self.current_session().await;
    self.api.clear_session().await;

    if let Some(session) = session {
      sync.clear(&session.id).await;
      info!("Patient {} logged out", session.id);
    }
  }

  pub async fn current_session(&self) -> Option<Session> {
    match store::get_json::<Session>(self.store.as_ref(), keys::SESSION).await {
      Ok(session) => session,
      Err(e) => {
        warn!("Error parsing persisted session: {}", e);
        None
      }
    }
  }

  pub async fn is_authenticated(&self) -> bool {
    self.current_session().await.is_some()
  }
}

/// The server's `error` field when it sent one, otherwise the generic text
fn rejection_message(body: &str) -> String {
  serde_json::from_str::<Value>(body)
    .ok()
    .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
    .filter(|m| !m.trim().is_empty())
    .unwrap_or_else(|| DEFAULT_LOGIN_ERROR.to_string())
}

/// ---------------------------------------------------------------------------
/// Tests
/// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::models::{ItemStatus, TimeSlot};
  use crate::store::MemoryStore;
  use crate::test_utils::*;
  use mockito::Matcher;
  use serde_json::json;
  use std::time::Duration;

  struct Harness {
    server: mockito::ServerGuard,
    store: Arc<MemoryStore>,
    api: Arc<ApiClient>,
    auth: AuthService,
    clock: Arc<ManualClock>,
  }

  async fn harness() -> Harness {
    let server = mockito::Server::new_async().await;
    let store = Arc::new(MemoryStore::new());
    let api = Arc::new(ApiClient::new(server.url(), server.url(), store.clone()));
    let clock = Arc::new(ManualClock::new(local_datetime("2024-01-01", 9, 0)));
    let auth = AuthService::new(api.clone(), store.clone(), clock.clone());
    Harness {
      server,
      store,
      api,
      auth,
      clock,
    }
  }

  #[tokio::test]
  async fn test_login_persists_session_and_tokens() {
    let mut h = harness().await;
    let mock = h
      .server
      .mock("POST", "/mobile-auth-v1")
      .match_body(Matcher::Json(json!({"identification": "V-123", "password": "secret"})))
      .with_status(200)
      .with_body(
        json!({
          "token": "tok-1",
          "refreshToken": "ref-1",
          "patient": {"id": "p1", "name": "Ana", "email": "ana@example.com"}
        })
        .to_string(),
      )
      .create_async()
      .await;

    let session = h.auth.login("V-123", Some("secret")).await.unwrap();

    mock.assert_async().await;
    assert_eq!(session.id, "p1");
    assert_eq!(session.role, Role::Patient);
    assert_eq!(session.last_login_at, h.clock.now_utc());
    assert_eq!(h.store.get(keys::AUTH_TOKEN).await.unwrap().as_deref(), Some("tok-1"));
    assert_eq!(h.store.get(keys::REFRESH_TOKEN).await.unwrap().as_deref(), Some("ref-1"));
    assert_eq!(h.auth.current_session().await, Some(session));
    assert!(h.auth.is_authenticated().await);
    assert!(!h.api.login_required());
  }

  #[tokio::test]
  async fn test_login_without_password_or_refresh_token() {
    let mut h = harness().await;
    h.store.set(keys::REFRESH_TOKEN, "stale").await.unwrap();
    h.server
      .mock("POST", "/mobile-auth-v1")
      .match_body(Matcher::Json(json!({"identification": "V-123"})))
      .with_status(200)
      .with_body(json!({"token": "tok-2", "patient": {"id": "p1", "name": "Ana"}}).to_string())
      .create_async()
      .await;

    let session = h.auth.login("V-123", None).await.unwrap();

    assert_eq!(session.email, "");
    assert_eq!(h.store.get(keys::REFRESH_TOKEN).await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_login_rejection_uses_server_message() {
    let mut h = harness().await;
    h.server
      .mock("POST", "/mobile-auth-v1")
      .with_status(401)
      .with_body(json!({"error": "Paciente no encontrado"}).to_string())
      .create_async()
      .await;

    let err = h.auth.login("V-000", None).await.unwrap_err();

    assert!(matches!(&err, AuthError::Rejected(m) if m == "Paciente no encontrado"));
    assert!(!h.auth.is_authenticated().await);
  }

  #[tokio::test]
  async fn test_login_rejection_default_message() {
    let mut h = harness().await;
    h.server
      .mock("POST", "/mobile-auth-v1")
      .with_status(500)
      .with_body("boom")
      .create_async()
      .await;

    let err = h.auth.login("V-000", None).await.unwrap_err();
    assert_eq!(err.to_string(), DEFAULT_LOGIN_ERROR);
  }

  #[tokio::test]
  async fn test_logout_clears_session_and_caches() {
    let h = harness().await;
    store::set_json(h.store.as_ref(), keys::SESSION, &mock_session("tok"))
      .await
      .unwrap();
    h.store.set(keys::AUTH_TOKEN, "tok").await.unwrap();
    h.store.set(keys::REFRESH_TOKEN, "ref").await.unwrap();

    let patient_id = mock_session("tok").id;
    seed_protocol_cache(
      h.store.as_ref(),
      &patient_id,
      &[mock_protocol_item("a", TimeSlot::Morning, ItemStatus::Pending)],
    )
    .await;

    let sync = SyncService::new(h.api.clone(), h.store.clone(), h.clock.clone(), Duration::from_secs(300));
    h.auth.logout(&sync).await;

    assert!(!h.auth.is_authenticated().await);
    for key in keys::SESSION_KEYS {
      assert_eq!(h.store.get(key).await.unwrap(), None);
    }
    assert!(sync.cached_protocol(&patient_id).await.is_none());
  }

  #[tokio::test]
  async fn test_corrupt_session_reads_as_logged_out() {
    let h = harness().await;
    h.store.set(keys::SESSION, "{not json").await.unwrap();

    assert_eq!(h.auth.current_session().await, None);
    assert!(!h.auth.is_authenticated().await);
  }

  #[test]
  fn test_rejection_message_ignores_blank_error() {
    assert_eq!(rejection_message(r#"{"error": "  "}"#), DEFAULT_LOGIN_ERROR);
    assert_eq!(rejection_message(r#"{"error": "Bloqueado"}"#), "Bloqueado");
  }
}
