//! Authenticated transport for the clinical API
//!
//! Every request carries the bearer token currently in the store. A 401 gets
//! exactly one silent refresh-and-replay; if the refresh fails, no refresh
//! token exists, or the replay is rejected again, the session is torn down
//! and `login_required` flips to true so the host can send the patient back
//! to the login entry point.

use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::models::Session;
use crate::store::{self, keys, KeyValueStore, StoreError};

/// ---------------------------------------------------------------------------
/// Configuration Constants
/// ---------------------------------------------------------------------------

const REFRESH_PATH: &str = "/mobile-auth-v1/refresh";

/// ---------------------------------------------------------------------------
/// Error Handling
/// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
  #[error("HTTP request failed: {0}")]
  Request(#[from] reqwest::Error),

  #[error("API error {status}: {body}")]
  Status { status: StatusCode, body: String },

  #[error("Unexpected response: {0}")]
  Unexpected(String),

  #[error("Token refresh failed: {0}")]
  Refresh(String),

  #[error("Session expired, login required")]
  SessionExpired,

  #[error("Storage error: {0}")]
  Store(#[from] StoreError),
}

/// ---------------------------------------------------------------------------
/// Token Refresh Payloads
/// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
  refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
  token: String,
  #[serde(default)]
  refresh_token: Option<String>,
}

/// ---------------------------------------------------------------------------
/// Client
/// ---------------------------------------------------------------------------

pub struct ApiClient {
  http: Client,
  base_url: String,
  auth_base_url: String,
  store: Arc<dyn KeyValueStore>,
  login_required: watch::Sender<bool>,
}

impl ApiClient {
  pub fn new(
    base_url: impl Into<String>,
    auth_base_url: impl Into<String>,
    store: Arc<dyn KeyValueStore>,
  ) -> Self {
    let (login_required, _) = watch::channel(false);
    Self {
      http: Client::new(),
      base_url: base_url.into().trim_end_matches('/').to_string(),
      auth_base_url: auth_base_url.into().trim_end_matches('/').to_string(),
      store,
      login_required,
    }
  }

  pub fn http(&self) -> &Client {
    &self.http
  }

  pub fn auth_base_url(&self) -> &str {
    &self.auth_base_url
  }

  /// Flips to `true` when the session is torn down after a failed refresh
  pub fn subscribe_login_required(&self) -> watch::Receiver<bool> {
    self.login_required.subscribe()
  }

  pub fn login_required(&self) -> bool {
    *self.login_required.borrow()
  }

  /// Called after a successful login
  pub fn mark_authenticated(&self) {
    self.login_required.send_replace(false);
  }

  /// Send a request to `<base_url><path>`, handling 401 with one
  /// refresh-and-replay. Non-2xx responses become [`ApiError::Status`].
  pub async fn send(
    &self,
    method: Method,
    path: &str,
    body: Option<&Value>,
  ) -> Result<Response, ApiError> {
    let url = format!("{}{}", self.base_url, path);

    let response = self.dispatch(method.clone(), &url, body).await?;
    if response.status() != StatusCode::UNAUTHORIZED {
      return check_status(response).await;
    }

    warn!("{} {} returned 401, attempting token refresh", method, path);

    if let Err(e) = self.refresh_tokens().await {
      warn!("Could not recover session: {}", e);
      self.expire_session().await;
      return Err(ApiError::SessionExpired);
    }

    let replay = self.dispatch(method.clone(), &url, body).await?;
    if replay.status() == StatusCode::UNAUTHORIZED {
      warn!("{} {} still unauthorized after refresh", method, path);
      self.expire_session().await;
      return Err(ApiError::SessionExpired);
    }

    check_status(replay).await
  }

  pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
    let response = self.send(Method::GET, path, None).await?;
    Ok(response.json().await?)
  }

  /// PATCH a JSON body, returning the (successful) status code
  pub async fn patch_json(&self, path: &str, body: &Value) -> Result<StatusCode, ApiError> {
    let response = self.send(Method::PATCH, path, Some(body)).await?;
    Ok(response.status())
  }

  async fn dispatch(
    &self,
    method: Method,
    url: &str,
    body: Option<&Value>,
  ) -> Result<Response, ApiError> {
    let mut request = self.http.request(method, url);

    if let Some(token) = self.store.get(keys::AUTH_TOKEN).await? {
      request = request.bearer_auth(token);
    }
    if let Some(body) = body {
      request = request.json(body);
    }

    Ok(request.send().await?)
  }

  /// Exchange the stored refresh token for a new access token and persist it
  pub async fn refresh_tokens(&self) -> Result<(), ApiError> {
    let refresh_token = self
      .store
      .get(keys::REFRESH_TOKEN)
      .await?
      .ok_or_else(|| ApiError::Refresh("no refresh token stored".into()))?;

    let response = self
      .http
      .post(format!("{}{}", self.auth_base_url, REFRESH_PATH))
      .json(&RefreshRequest {
        refresh_token: &refresh_token,
      })
      .send()
      .await?;

    if !response.status().is_success() {
      let status = response.status();
      let error_text = response.text().await.unwrap_or_default();
      return Err(ApiError::Refresh(format!("{}: {}", status, error_text)));
    }

    let refreshed: RefreshResponse = response.json().await?;

    self.store.set(keys::AUTH_TOKEN, &refreshed.token).await?;
    if let Some(new_refresh) = &refreshed.refresh_token {
      self.store.set(keys::REFRESH_TOKEN, new_refresh).await?;
    }

    // Keep the persisted session's copy of the token in step
    match store::get_json::<Session>(self.store.as_ref(), keys::SESSION).await {
      Ok(Some(mut session)) => {
        session.token = refreshed.token;
        store::set_json(self.store.as_ref(), keys::SESSION, &session).await?;
      }
      Ok(None) => {}
      Err(e) => debug!("Stored session unreadable during refresh: {}", e),
    }

    info!("Access token refreshed");
    Ok(())
  }

  /// Remove every session key. Failures are logged; there is nothing
  /// better to do with them here.
  pub async fn clear_session(&self) {
    for key in keys::SESSION_KEYS {
      if let Err(e) = self.store.remove(key).await {
        warn!("Failed to remove {}: {}", key, e);
      }
    }
  }

  async fn expire_session(&self) {
    self.clear_session().await;
    self.login_required.send_replace(true);
    warn!("Session expired, login required");
  }
}

async fn check_status(response: Response) -> Result<Response, ApiError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  let body = response.text().await.unwrap_or_default();
  Err(ApiError::Status { status, body })
}

/// ---------------------------------------------------------------------------
/// Tests
/// ---------------------------------------------------------------------------
