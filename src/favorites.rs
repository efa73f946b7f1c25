//! Foods the patient starred in the nutrigenomic plan
//!
//! The list is device-local: it is not tied to a patient and survives
//! logout, like the reminder flag.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::{self, keys, KeyValueStore, StoreError};

pub struct FavoriteFoods {
  store: Arc<dyn KeyValueStore>,
}

impl FavoriteFoods {
  pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
    Self { store }
  }

  /// Favorite food ids in the order they were starred. Missing or
  /// unreadable storage reads as no favorites.
  pub async fn list(&self) -> Vec<String> {
    match store::get_json::<Vec<String>>(self.store.as_ref(), keys::FAVORITE_FOODS).await {
      Ok(ids) => ids.unwrap_or_default(),
      Err(e) => {
        warn!("Discarding unreadable favorite foods: {}", e);
        Vec::new()
      }
    }
  }

  pub async fn is_favorite(&self, food_id: &str) -> bool {
    self.list().await.iter().any(|id| id == food_id)
  }

  /// Star or unstar `food_id`. Returns whether it is a favorite afterwards.
  pub async fn toggle(&self, food_id: &str) -> Result<bool, StoreError> {
    let mut ids = self.list().await;
    let starred = match ids.iter().position(|id| id == food_id) {
      Some(index) => {
        ids.remove(index);
        false
      }
      None => {
        ids.push(food_id.to_string());
        true
      }
    };

    store::set_json(self.store.as_ref(), keys::FAVORITE_FOODS, &ids).await?;
    debug!("Food {} favorite: {}", food_id, starred);
    Ok(starred)
  }
}
