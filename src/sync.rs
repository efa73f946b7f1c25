//! Local-first cache / sync service
//!
//! Read-through access to the patient's active protocol, nutrigenomic plan
//! and aggregate profile:
//! - network first; on success the payload is mapped to the domain model,
//!   persisted under `resource_patientId` with its fetch time, and returned
//! - on any network or parse failure the last persisted value is returned,
//!   or an empty result when there is none. Reads never fail the caller.
//! - the profile additionally short-circuits to the in-memory copy while it
//!   is younger than the freshness window.
//!
//! Status toggles go to the network first and only touch the cache after
//! the server confirms them.

use chrono::{DateTime, Duration, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiError};
use crate::clock::Clock;
use crate::models::nutrition::SmartNutritionResponse;
use crate::models::{ItemStatus, MobileProfile, NutrigenomicPlan, PatientGuideResponse, ProtocolItem};
use crate::store::{self, keys, KeyValueStore};

/// ---------------------------------------------------------------------------
/// Cache Envelope
/// ---------------------------------------------------------------------------

/// A cached value tagged with the time of the fetch that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cached<T> {
  pub value: T,
  pub fetched_at: DateTime<Utc>,
}

impl<T> Cached<T> {
  pub fn new(value: T, fetched_at: DateTime<Utc>) -> Self {
    Self { value, fetched_at }
  }

  pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
    now - self.fetched_at < window
  }
}

/// ---------------------------------------------------------------------------
/// Service
/// ---------------------------------------------------------------------------

pub struct SyncService {
  api: Arc<ApiClient>,
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
  freshness_window: Duration,
  /// In-memory profile for the freshness short-circuit, keyed by patient
  profile: Mutex<Option<(String, Cached<MobileProfile>)>>,
}

impl SyncService {
  pub fn new(
    api: Arc<ApiClient>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    freshness_window: std::time::Duration,
  ) -> Self {
    Self {
      api,
      store,
      clock,
      freshness_window: Duration::from_std(freshness_window).unwrap_or_else(|_| Duration::minutes(5)),
      profile: Mutex::new(None),
    }
  }

  /// ---------------------------------------------------------------------------
  /// Protocol
  /// ---------------------------------------------------------------------------

  /// Active protocol items for the patient. Falls back to the cached list
  /// (or an empty one) when the network is unavailable.
  pub async fn fetch_active_protocol(&self, patient_id: &str) -> Vec<ProtocolItem> {
    let key = keys::cache_key(keys::PROTOCOL_CACHE, patient_id);

    match self.request_protocol(patient_id).await {
      Ok(items) => {
        info!("Fetched {} protocol items for {}", items.len(), patient_id);
        self.persist(&key, &items).await;
        items
      }
      Err(e) => {
        warn!("Protocol fetch failed, serving cached copy: {}", e);
        self
          .load::<Vec<ProtocolItem>>(&key)
          .await
          .map(|c| c.value)
          .unwrap_or_default()
      }
    }
  }

  /// Last persisted protocol with its fetch time, without touching the network
  pub async fn cached_protocol(&self, patient_id: &str) -> Option<Cached<Vec<ProtocolItem>>> {
    self
      .load(&keys::cache_key(keys::PROTOCOL_CACHE, patient_id))
      .await
  }

  async fn request_protocol(&self, patient_id: &str) -> Result<Vec<ProtocolItem>, ApiError> {
    match self.request_profile(patient_id).await {
      Ok(profile) => {
        if let Some(guide) = profile.latest_guide() {
          return Ok(guide.protocol_items());
        }
        debug!("Profile has no guides, using legacy guide endpoint");
      }
      Err(ApiError::SessionExpired) => return Err(ApiError::SessionExpired),
      Err(e) => debug!("Profile unavailable ({}), using legacy guide endpoint", e),
    }

    let guide: PatientGuideResponse = self
      .api
      .get_json(&format!("/patients/{}/guide", patient_id))
      .await?;
    Ok(guide.items)
  }

  /// Set an item's status on the server. Only after the server confirms
  /// (200/204) is the cached list rewritten; any failure returns `false`
  /// and leaves the cache untouched. No retry.
  pub async fn toggle_item_status(
    &self,
    patient_id: &str,
    item_id: &str,
    status: ItemStatus,
  ) -> bool {
    let path = format!("/protocols/{}/status", item_id);

    let code = match self.api.patch_json(&path, &json!({ "status": status })).await {
      Ok(code) => code,
      Err(e) => {
        warn!("Status update for {} failed: {}", item_id, e);
        return false;
      }
    };

    if code != StatusCode::OK && code != StatusCode::NO_CONTENT {
      warn!("Status update for {} returned unexpected {}", item_id, code);
      return false;
    }

    let key = keys::cache_key(keys::PROTOCOL_CACHE, patient_id);
    if let Some(mut cached) = self.load::<Vec<ProtocolItem>>(&key).await {
      for item in cached.value.iter_mut().filter(|i| i.id == item_id) {
        item.status = status;
      }
      if let Err(e) = store::set_json(self.store.as_ref(), &key, &cached).await {
        warn!("Failed to rewrite protocol cache after toggle: {}", e);
      }
    }

    info!("Item {} marked {}", item_id, status);
    true
  }

  /// ---------------------------------------------------------------------------
  /// Nutrition
  /// ---------------------------------------------------------------------------

  /// Plan built from the profile's latest food plan. `None` when the clinic
  /// has not issued one (and nothing is cached on failure).
  pub async fn fetch_nutrigenomic_plan(&self, patient_id: &str) -> Option<NutrigenomicPlan> {
    let key = keys::cache_key(keys::NUTRITION_CACHE, patient_id);

    match self.request_profile(patient_id).await {
      Ok(profile) => {
        let plan = profile.nutrigenomic_plan()?;
        self.persist(&key, &plan).await;
        Some(plan)
      }
      Err(e) => {
        warn!("Nutrition plan fetch failed, serving cached copy: {}", e);
        self.load::<NutrigenomicPlan>(&key).await.map(|c| c.value)
      }
    }
  }

  /// Plan from the blood-type compatibility endpoint. Shares the cache key
  /// with [`Self::fetch_nutrigenomic_plan`].
  pub async fn fetch_smart_nutrition_plan(&self, patient_id: &str) -> Option<NutrigenomicPlan> {
    let key = keys::cache_key(keys::NUTRITION_CACHE, patient_id);

    match self.request_smart_plan().await {
      Ok(plan) => {
        self.persist(&key, &plan).await;
        Some(plan)
      }
      Err(e) => {
        warn!("Smart nutrition fetch failed, serving cached copy: {}", e);
        self.load::<NutrigenomicPlan>(&key).await.map(|c| c.value)
      }
    }
  }

  async fn request_smart_plan(&self) -> Result<NutrigenomicPlan, ApiError> {
    let response: SmartNutritionResponse = self.api.get_json("/mobile-nutrition-v1").await?;

    if !response.success {
      return Err(ApiError::Unexpected("nutrition plan reported success=false".into()));
    }

    Ok(response.into_plan(self.clock.now_utc().to_rfc3339()))
  }

  /// ---------------------------------------------------------------------------
  /// Profile
  /// ---------------------------------------------------------------------------

  /// Aggregate profile. Served from memory while fresh; otherwise fetched,
  /// with the persisted copy as fallback.
  pub async fn fetch_profile(&self, patient_id: &str) -> Option<MobileProfile> {
    if let Some(profile) = self.fresh_profile(patient_id) {
      debug!("Serving fresh in-memory profile for {}", patient_id);
      return Some(profile);
    }

    match self.request_profile(patient_id).await {
      Ok(profile) => Some(profile),
      Err(e) => {
        warn!("Profile fetch failed, serving cached copy: {}", e);
        self
          .load::<MobileProfile>(&keys::cache_key(keys::PROFILE_CACHE, patient_id))
          .await
          .map(|c| c.value)
      }
    }
  }

  /// Fetch time of the in-memory profile, if any
  pub fn profile_fetched_at(&self, patient_id: &str) -> Option<DateTime<Utc>> {
    let slot = self.profile_slot();
    slot
      .as_ref()
      .filter(|(id, _)| id == patient_id)
      .map(|(_, cached)| cached.fetched_at)
  }

  /// Drop the in-memory profile so the next read goes to the network
  pub fn force_refresh(&self) {
    *self.profile_slot() = None;
  }

  /// Remove every cached resource for the patient (logout)
  pub async fn clear(&self, patient_id: &str) {
    self.force_refresh();
    for resource in keys::CACHE_RESOURCES {
      let key = keys::cache_key(resource, patient_id);
      if let Err(e) = self.store.remove(&key).await {
        warn!("Failed to remove {}: {}", key, e);
      }
    }
  }

  /// Network fetch of the profile. Every success refreshes both the
  /// in-memory and the persisted copy.
  async fn request_profile(&self, patient_id: &str) -> Result<MobileProfile, ApiError> {
    let profile: MobileProfile = self.api.get_json("/mobile-profile").await?;
    let cached = Cached::new(profile.clone(), self.clock.now_utc());

    if let Err(e) = store::set_json(
      self.store.as_ref(),
      &keys::cache_key(keys::PROFILE_CACHE, patient_id),
      &cached,
    )
    .await
    {
      warn!("Failed to persist profile: {}", e);
    }
    *self.profile_slot() = Some((patient_id.to_string(), cached));

    Ok(profile)
  }

  fn fresh_profile(&self, patient_id: &str) -> Option<MobileProfile> {
    let now = self.clock.now_utc();
    let slot = self.profile_slot();
    slot
      .as_ref()
      .filter(|(id, cached)| id == patient_id && cached.is_fresh(now, self.freshness_window))
      .map(|(_, cached)| cached.value.clone())
  }

  fn profile_slot(&self) -> std::sync::MutexGuard<'_, Option<(String, Cached<MobileProfile>)>> {
    self.profile.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// ---------------------------------------------------------------------------
  /// Store Helpers
  /// ---------------------------------------------------------------------------

  async fn persist<T: Serialize>(&self, key: &str, value: &T) {
    let cached = Cached::new(value, self.clock.now_utc());
    if let Err(e) = store::set_json(self.store.as_ref(), key, &cached).await {
      warn!("Failed to persist {}: {}", key, e);
    }
  }

  /// Unreadable entries are treated as absent
  async fn load<T: DeserializeOwned>(&self, key: &str) -> Option<Cached<T>> {
    match store::get_json::<Cached<T>>(self.store.as_ref(), key).await {
      Ok(cached) => cached,
      Err(e) => {
        warn!("Discarding unreadable cache entry {}: {}", key, e);
        None
      }
    }
  }
}

/// ---------------------------------------------------------------------------
/// Tests
/// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::models::{BloodType, TimeSlot};
  use crate::store::MemoryStore;
  use crate::test_utils::*;

  const PATIENT: &str = "p-1";

  struct Harness {
    server: mockito::ServerGuard,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    sync: SyncService,
  }

  async fn harness() -> Harness {
    let server = mockito::Server::new_async().await;
    let store = Arc::new(MemoryStore::new());
    store.set(keys::AUTH_TOKEN, "token").await.unwrap();
    let clock = Arc::new(ManualClock::new(local_datetime("2024-01-01", 9, 0)));
    let api = Arc::new(ApiClient::new(
      format!("{}/api", server.url()),
      server.url(),
      store.clone(),
    ));
    let sync = SyncService::new(
      api,
      store.clone(),
      clock.clone(),
      std::time::Duration::from_secs(5 * 60),
    );
    Harness {
      server,
      store,
      clock,
      sync,
    }
  }

  fn profile_body() -> String {
    json!({
      "biologicalAge": 52,
      "chronologicalAge": 58,
      "bloodType": "O",
      "selectedDiets": ["METABOLIC"],
      "guides": [{
        "id": "g1",
        "createdAt": "2024-01-01T00:00:00Z",
        "updatedAt": "2024-01-01T00:00:00Z",
        "selections": {
          "PRIMARY_NUTRACEUTICALS": [
            {"id": "i1", "name": "Omega 3", "timeSlot": "MORNING"},
            {"id": "i2", "name": "Magnesio", "timeSlot": "EVENING"}
          ]
        }
      }],
      "foodPlans": [{
        "updatedAt": "2024-01-01T00:00:00Z",
        "items": [{"id": "f1", "name": "Avena", "mealType": "DESAYUNO"}]
      }]
    })
    .to_string()
  }

  #[tokio::test]
  async fn test_protocol_fetch_persists_cache() {
    let mut h = harness().await;
    h.server
      .mock("GET", "/api/mobile-profile")
      .with_status(200)
      .with_body(profile_body())
      .create_async()
      .await;

    let items = h.sync.fetch_active_protocol(PATIENT).await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].time_slot, TimeSlot::Morning);

    let cached = h.sync.cached_protocol(PATIENT).await.unwrap();
    assert_eq!(cached.value, items);
    assert_eq!(cached.fetched_at, h.clock.now_utc());
  }

  #[tokio::test]
  async fn test_profile_with_null_collections_keeps_guides() {
    let mut h = harness().await;
    let legacy = h
      .server
      .mock("GET", "/api/patients/p-1/guide")
      .expect(0)
      .create_async()
      .await;
    h.server
      .mock("GET", "/api/mobile-profile")
      .with_status(200)
      .with_body(
        json!({
          "bloodType": "A+",
          "selectedDiets": null,
          "foodPlans": null,
          "latestRatios": null,
          "guides": [{
            "id": "g1",
            "selections": {"PRIMARY_NUTRACEUTICALS": [{"id": "i1", "name": "Omega 3"}]}
          }]
        })
        .to_string(),
      )
      .create_async()
      .await;

    let items = h.sync.fetch_active_protocol(PATIENT).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, "i1");
    legacy.assert_async().await;

    h.sync.force_refresh();
    let profile = h.sync.fetch_profile(PATIENT).await.unwrap();
    assert!(profile.selected_diets.is_empty());
    assert!(profile.food_plans.is_empty());
    assert!(h.sync.fetch_nutrigenomic_plan(PATIENT).await.is_none());
  }

  #[tokio::test]
  async fn test_protocol_falls_back_to_cache_on_network_failure() {
    let mut h = harness().await;
    let ok = h
      .server
      .mock("GET", "/api/mobile-profile")
      .with_status(200)
      .with_body(profile_body())
      .expect(1)
      .create_async()
      .await;

    let first = h.sync.fetch_active_protocol(PATIENT).await;
    ok.assert_async().await;
    ok.remove_async().await;

    h.server
      .mock("GET", "/api/mobile-profile")
      .with_status(503)
      .create_async()
      .await;
    h.server
      .mock("GET", "/api/patients/p-1/guide")
      .with_status(503)
      .create_async()
      .await;

    let second = h.sync.fetch_active_protocol(PATIENT).await;
    assert_eq!(second, first);
  }

  #[tokio::test]
  async fn test_protocol_empty_without_cache_or_network() {
    let h = harness().await;
    // No mocks: every request gets mockito's 501
    let items = h.sync.fetch_active_protocol(PATIENT).await;
    assert!(items.is_empty());
  }

  #[tokio::test]
  async fn test_protocol_uses_legacy_endpoint_without_guides() {
    let mut h = harness().await;
    h.server
      .mock("GET", "/api/mobile-profile")
      .with_status(200)
      .with_body(r#"{"guides": []}"#)
      .create_async()
      .await;
    let legacy = h
      .server
      .mock("GET", "/api/patients/p-1/guide")
      .with_status(200)
      .with_body(
        json!({
          "patientId": PATIENT,
          "date": "2024-01-01",
          "items": [mock_protocol_item("legacy-1", TimeSlot::Evening, ItemStatus::Pending)]
        })
        .to_string(),
      )
      .expect(1)
      .create_async()
      .await;

    let items = h.sync.fetch_active_protocol(PATIENT).await;
    legacy.assert_async().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, "legacy-1");
  }

  #[tokio::test]
  async fn test_corrupt_cache_degrades_to_empty() {
    let h = harness().await;
    h.store
      .set(&keys::cache_key(keys::PROTOCOL_CACHE, PATIENT), "[[[")
      .await
      .unwrap();

    assert!(h.sync.fetch_active_protocol(PATIENT).await.is_empty());
  }

  #[tokio::test]
  async fn test_profile_freshness_short_circuit() {
    let mut h = harness().await;
    let profile = h
      .server
      .mock("GET", "/api/mobile-profile")
      .with_status(200)
      .with_body(profile_body())
      .expect(2)
      .create_async()
      .await;

    let first = h.sync.fetch_profile(PATIENT).await.unwrap();
    assert_eq!(first.biological_age, Some(52.0));

    // T+2min: served from memory
    h.clock.advance(Duration::minutes(2));
    let second = h.sync.fetch_profile(PATIENT).await.unwrap();
    assert_eq!(second, first);

    // T+6min: goes back to the network
    h.clock.advance(Duration::minutes(4));
    h.sync.fetch_profile(PATIENT).await.unwrap();

    profile.assert_async().await;
    assert_eq!(h.sync.profile_fetched_at(PATIENT), Some(h.clock.now_utc()));
  }

  #[tokio::test]
  async fn test_force_refresh_bypasses_freshness() {
    let mut h = harness().await;
    let profile = h
      .server
      .mock("GET", "/api/mobile-profile")
      .with_status(200)
      .with_body(profile_body())
      .expect(2)
      .create_async()
      .await;

    h.sync.fetch_profile(PATIENT).await;
    h.sync.force_refresh();
    h.sync.fetch_profile(PATIENT).await;

    profile.assert_async().await;
  }

  #[tokio::test]
  async fn test_stale_profile_served_when_network_fails() {
    let mut h = harness().await;
    let ok = h
      .server
      .mock("GET", "/api/mobile-profile")
      .with_status(200)
      .with_body(profile_body())
      .create_async()
      .await;
    h.sync.fetch_profile(PATIENT).await;
    ok.remove_async().await;

    h.server
      .mock("GET", "/api/mobile-profile")
      .with_status(500)
      .create_async()
      .await;
    h.clock.advance(Duration::minutes(30));

    let stale = h.sync.fetch_profile(PATIENT).await.unwrap();
    assert_eq!(stale.chronological_age, Some(58.0));
  }

  #[tokio::test]
  async fn test_toggle_success_rewrites_only_status() {
    let mut h = harness().await;
    let items = vec![
      mock_protocol_item("i1", TimeSlot::Morning, ItemStatus::Pending),
      mock_protocol_item("i2", TimeSlot::Evening, ItemStatus::Pending),
    ];
    seed_protocol_cache(h.store.as_ref(), PATIENT, &items).await;

    let patch = h
      .server
      .mock("PATCH", "/api/protocols/i1/status")
      .match_body(mockito::Matcher::Json(json!({"status": "completed"})))
      .with_status(204)
      .create_async()
      .await;

    assert!(h.sync.toggle_item_status(PATIENT, "i1", ItemStatus::Completed).await);
    patch.assert_async().await;

    let cached = h.sync.cached_protocol(PATIENT).await.unwrap().value;
    let mut expected = items[0].clone();
    expected.status = ItemStatus::Completed;
    assert_eq!(cached[0], expected);
    assert_eq!(cached[1], items[1]);
  }

  #[tokio::test]
  async fn test_toggle_failure_leaves_cache_untouched() {
    let mut h = harness().await;
    let items = vec![mock_protocol_item("i1", TimeSlot::Morning, ItemStatus::Pending)];
    seed_protocol_cache(h.store.as_ref(), PATIENT, &items).await;

    h.server
      .mock("PATCH", "/api/protocols/i1/status")
      .with_status(500)
      .expect(1)
      .create_async()
      .await;

    assert!(!h.sync.toggle_item_status(PATIENT, "i1", ItemStatus::Completed).await);
    let cached = h.sync.cached_protocol(PATIENT).await.unwrap().value;
    assert_eq!(cached, items);
  }

  #[tokio::test]
  async fn test_nutrigenomic_plan_from_profile_and_fallback() {
    let mut h = harness().await;
    let ok = h
      .server
      .mock("GET", "/api/mobile-profile")
      .with_status(200)
      .with_body(profile_body())
      .create_async()
      .await;

    let plan = h.sync.fetch_nutrigenomic_plan(PATIENT).await.unwrap();
    assert_eq!(plan.blood_type, Some(BloodType::O));
    assert_eq!(plan.foods.len(), 1);
    ok.remove_async().await;

    h.server
      .mock("GET", "/api/mobile-profile")
      .with_status(502)
      .create_async()
      .await;
    assert_eq!(h.sync.fetch_nutrigenomic_plan(PATIENT).await, Some(plan));
  }

  #[tokio::test]
  async fn test_nutrigenomic_plan_none_without_food_plan() {
    let mut h = harness().await;
    h.server
      .mock("GET", "/api/mobile-profile")
      .with_status(200)
      .with_body(r#"{"foodPlans": []}"#)
      .create_async()
      .await;

    assert!(h.sync.fetch_nutrigenomic_plan(PATIENT).await.is_none());
  }

  #[tokio::test]
  async fn test_smart_plan_unsuccessful_uses_cache() {
    let mut h = harness().await;
    let ok = h
      .server
      .mock("GET", "/api/mobile-nutrition-v1")
      .with_status(200)
      .with_body(r#"{"success": true, "bloodType": "B", "items": [{"id": "f1", "name": "Kale", "mealType": "CENA", "category": "BENEFICIAL"}]}"#)
      .create_async()
      .await;
    let plan = h.sync.fetch_smart_nutrition_plan(PATIENT).await.unwrap();
    assert_eq!(plan.blood_type, Some(BloodType::B));
    ok.remove_async().await;

    h.server
      .mock("GET", "/api/mobile-nutrition-v1")
      .with_status(200)
      .with_body(r#"{"success": false, "items": []}"#)
      .create_async()
      .await;
    assert_eq!(h.sync.fetch_smart_nutrition_plan(PATIENT).await, Some(plan));
  }

  #[tokio::test]
  async fn test_clear_removes_patient_caches() {
    let h = harness().await;
    let items = vec![mock_protocol_item("i1", TimeSlot::Morning, ItemStatus::Pending)];
    seed_protocol_cache(h.store.as_ref(), PATIENT, &items).await;
    seed_protocol_cache(h.store.as_ref(), "other", &items).await;

    h.sync.clear(PATIENT).await;

    assert!(h.sync.cached_protocol(PATIENT).await.is_none());
    assert!(h.sync.cached_protocol("other").await.is_some());
  }

  #[test]
  fn test_cached_freshness_boundary() {
    let t0 = Utc::now();
    let cached = Cached::new((), t0);
    let window = Duration::minutes(5);
    assert!(cached.is_fresh(t0 + Duration::minutes(4), window));
    assert!(!cached.is_fresh(t0 + Duration::minutes(5), window));
  }
}
