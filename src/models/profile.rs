//! Aggregate mobile profile (`GET /mobile-profile`).
//!
//! The backend returns one object holding ages, guides (protocol
//! selections), food plans, blood type and the latest lab ratios. Guides and
//! food plans are kept close to the wire shape and flattened on demand into
//! [`ProtocolItem`]s and a [`NutrigenomicPlan`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use super::null_as_default;
use super::nutrition::{DietType, MealType, NutrigenomicFood, NutrigenomicPlan};
use super::protocol::{ItemStatus, ProtocolItem, TimeSlot};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MobileProfile {
  #[serde(default)]
  pub biological_age: Option<f64>,
  #[serde(default)]
  pub chronological_age: Option<f64>,
  #[serde(default)]
  pub blood_type: Option<String>,
  #[serde(default, deserialize_with = "null_as_default")]
  pub selected_diets: Vec<String>,
  /// Newest first
  #[serde(default, deserialize_with = "null_as_default")]
  pub guides: Vec<Guide>,
  /// Newest first
  #[serde(default, deserialize_with = "null_as_default")]
  pub food_plans: Vec<FoodPlan>,
  /// Latest lab ratios by name (e.g. NLR)
  #[serde(default, deserialize_with = "null_as_default")]
  pub latest_ratios: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Guide {
  #[serde(default)]
  pub id: Option<String>,
  /// category -> list of selection entries (free-form JSON from the clinic)
  #[serde(default)]
  pub selections: Option<BTreeMap<String, Value>>,
  #[serde(default, deserialize_with = "null_as_default")]
  pub created_at: String,
  #[serde(default, deserialize_with = "null_as_default")]
  pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoodPlan {
  #[serde(default)]
  pub id: Option<String>,
  #[serde(default, deserialize_with = "null_as_default")]
  pub items: Vec<FoodPlanItem>,
  #[serde(default, deserialize_with = "null_as_default")]
  pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoodPlanItem {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub meal_type: Option<String>,
}

/// One entry inside `guide.selections[category]`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectionEntry {
  #[serde(default)]
  id: Option<Value>,
  name: String,
  #[serde(default)]
  dose: Option<String>,
  #[serde(default)]
  schedule: Option<String>,
  #[serde(default)]
  observations: Option<String>,
  #[serde(default)]
  status: Option<String>,
  #[serde(default)]
  time_slot: Option<String>,
}

impl MobileProfile {
  pub fn latest_guide(&self) -> Option<&Guide> {
    self.guides.first()
  }

  /// Biological minus chronological age; negative means "younger than
  /// the calendar says"
  pub fn age_delta(&self) -> Option<f64> {
    match (self.biological_age, self.chronological_age) {
      (Some(bio), Some(chrono)) => Some(bio - chrono),
      _ => None,
    }
  }

  /// Plan derived from the latest food plan, if the clinic issued one
  pub fn nutrigenomic_plan(&self) -> Option<NutrigenomicPlan> {
    let food_plan = self.food_plans.first()?;

    let foods = food_plan
      .items
      .iter()
      .map(|item| NutrigenomicFood {
        id: item.id.clone(),
        name: item.name.clone(),
        category: "General".to_string(),
        meal_types: vec![MealType::from_backend(item.meal_type.as_deref().unwrap_or_default())],
        is_clinical_priority: false,
        notes: None,
      })
      .collect();

    Some(NutrigenomicPlan {
      blood_type: self.blood_type.as_deref().and_then(|b| b.parse().ok()),
      diet_types: self
        .selected_diets
        .iter()
        .filter_map(|d| d.parse::<DietType>().ok())
        .collect(),
      forbidden: Vec::new(),
      foods,
      updated_at: food_plan.updated_at.clone(),
    })
  }
}

impl Guide {
  /// Flatten the selections into protocol items.
  ///
  /// Entries without an id get `<guideId>-<category>-<index>` so the id stays
  /// the same on every sync of the same guide. Entries that are not objects
  /// with a name are skipped.
  pub fn protocol_items(&self) -> Vec<ProtocolItem> {
    let Some(selections) = &self.selections else {
      return Vec::new();
    };

    let guide_id = self.id.as_deref().unwrap_or("guide");
    let mut items = Vec::new();

    for (category, entries) in selections {
      let Some(entries) = entries.as_array() else {
        continue;
      };

      for (index, raw) in entries.iter().enumerate() {
        let entry: SelectionEntry = match serde_json::from_value(raw.clone()) {
          Ok(entry) => entry,
          Err(e) => {
            debug!("Skipping malformed selection in {}: {}", category, e);
            continue;
          }
        };

        let id = match entry.id {
          Some(Value::String(s)) if !s.is_empty() => s,
          Some(Value::Number(n)) => n.to_string(),
          _ => format!("{}-{}-{}", guide_id, category, index),
        };

        items.push(ProtocolItem {
          id,
          category: category.clone(),
          item_name: entry.name,
          dose: entry.dose.unwrap_or_default(),
          schedule: entry.schedule.unwrap_or_default(),
          observations: entry.observations,
          status: entry
            .status
            .and_then(|s| s.parse().ok())
            .unwrap_or(ItemStatus::Pending),
          time_slot: entry
            .time_slot
            .and_then(|s| s.parse().ok())
            .unwrap_or(TimeSlot::Anytime),
          prescribed_at: self.created_at.clone(),
          updated_at: self.updated_at.clone(),
        });
      }
    }

    items
  }
}
