//! Nutrigenomic plan types, the food-compatibility rules applied on top of
//! the clinic's plan and the backend-to-domain mapping for the smart
//! nutrition endpoint.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use super::null_as_default;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BloodType {
  A,
  B,
  AB,
  O,
}

impl std::str::FromStr for BloodType {
  type Err = String;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    // Rh factor does not change the diet rules: "A+" and "A-" are both A
    let group = s.trim().trim_end_matches(['+', '-']).trim_end();
    match group.to_ascii_uppercase().as_str() {
      "A" => Ok(Self::A),
      "B" => Ok(Self::B),
      "AB" => Ok(Self::AB),
      "O" => Ok(Self::O),
      _ => Err(format!("Unknown blood type: {}", s)),
    }
  }
}

impl BloodType {
  /// Foods the clinic's rule table excludes for this group
  pub fn restricted_foods(self) -> &'static [&'static str] {
    match self {
      Self::O => &["Trigo", "Maíz", "Lentejas", "Cerdo", "Azúcar refinada", "Lácteos"],
      Self::A => &["Carne Roja", "Embutidos", "Lácteos enteros", "Trigo en exceso", "Pimentón"],
      Self::B => &["Pollo", "Maíz", "Lentejas", "Tomate", "Maní", "Trigo"],
      Self::AB => &["Carne Roja", "Maíz", "Frijoles negros", "Semillas de sésamo", "Pollo"],
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DietType {
  Metabolic,
  Renal,
  AntiInflammatory,
  Standard,
}

impl std::str::FromStr for DietType {
  type Err = String;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "METABOLIC" => Ok(Self::Metabolic),
      "RENAL" => Ok(Self::Renal),
      "ANTI_INFLAMMATORY" => Ok(Self::AntiInflammatory),
      "STANDARD" => Ok(Self::Standard),
      _ => Err(format!("Unknown diet type: {}", s)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MealType {
  Breakfast,
  Lunch,
  Dinner,
  Snack,
}

impl MealType {
  /// Map a backend meal label (Spanish or English) to a meal type.
  /// Anything unrecognised is treated as a snack.
  pub fn from_backend(label: &str) -> Self {
    match label {
      "DESAYUNO" | "BREAKFAST" => Self::Breakfast,
      "ALMUERZO" | "LUNCH" => Self::Lunch,
      "CENA" | "DINNER" => Self::Dinner,
      _ => Self::Snack,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NutrigenomicFood {
  pub id: String,
  pub name: String,
  pub category: String,
  pub meal_types: Vec<MealType>,
  #[serde(default)]
  pub is_clinical_priority: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NutrigenomicPlan {
  pub blood_type: Option<BloodType>,
  pub diet_types: Vec<DietType>,
  pub forbidden: Vec<String>,
  pub foods: Vec<NutrigenomicFood>,
  pub updated_at: String,
}

/// ---------------------------------------------------------------------------
/// Compatibility Rules
/// ---------------------------------------------------------------------------

const DEFAULT_CATEGORY: &str = "General";

impl NutrigenomicPlan {
  /// Blood type the rules run against: the profile's when known, then the
  /// plan's, then O
  pub fn effective_blood_type(&self, profile_blood_type: Option<BloodType>) -> BloodType {
    profile_blood_type.or(self.blood_type).unwrap_or(BloodType::O)
  }

  /// Restriction table for the effective blood type merged with the
  /// backend's `forbidden` list. Table entries come first; duplicates are
  /// dropped keeping the first occurrence.
  pub fn derived_forbidden(&self, profile_blood_type: Option<BloodType>) -> Vec<String> {
    let rules = self.effective_blood_type(profile_blood_type).restricted_foods();
    let mut seen = HashSet::new();
    rules
      .iter()
      .map(|f| f.to_string())
      .chain(self.forbidden.iter().cloned())
      .filter(|f| seen.insert(f.clone()))
      .collect()
  }

  /// The server's flag, or a category the selected diets put first:
  /// protein and healthy fats on a metabolic diet, vegetables on a renal one
  pub fn is_priority(&self, food: &NutrigenomicFood) -> bool {
    let category = food.category.as_str();
    food.is_clinical_priority
      || (self.diet_types.contains(&DietType::Metabolic)
        && matches!(category, "Proteína" | "Grasas Saludables"))
      || (self.diet_types.contains(&DietType::Renal) && category == "Vegetales")
  }

  /// Foods served at `meal`, grouped by category (sorted), with the
  /// priority flag resolved. Foods without a category land in "General".
  pub fn foods_for_meal(&self, meal: MealType) -> BTreeMap<String, Vec<NutrigenomicFood>> {
    let mut groups: BTreeMap<String, Vec<NutrigenomicFood>> = BTreeMap::new();

    for food in self.foods.iter().filter(|f| f.meal_types.contains(&meal)) {
      let category = if food.category.is_empty() {
        DEFAULT_CATEGORY.to_string()
      } else {
        food.category.clone()
      };
      let resolved = NutrigenomicFood {
        is_clinical_priority: self.is_priority(food),
        category: category.clone(),
        ..food.clone()
      };
      groups.entry(category).or_default().push(resolved);
    }

    groups
  }
}

/// ---------------------------------------------------------------------------
/// Smart Nutrition Endpoint (`GET /mobile-nutrition-v1`)
/// ---------------------------------------------------------------------------

const AVOID_NOTE: &str = "No recomendado para tu grupo sanguíneo";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartNutritionResponse {
  pub success: bool,
  #[serde(default)]
  pub blood_type: Option<String>,
  #[serde(default)]
  pub compatibility_group: Option<String>,
  #[serde(default, deserialize_with = "null_as_default")]
  pub items: Vec<BackendFoodItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendFoodItem {
  pub id: String,
  pub name: String,
  #[serde(default, deserialize_with = "null_as_default")]
  pub meal_type: String,
  /// BENEFICIAL | NEUTRAL | AVOID
  #[serde(default, deserialize_with = "null_as_default")]
  pub category: String,
}

impl BackendFoodItem {
  fn into_food(self) -> NutrigenomicFood {
    let category = match self.category.as_str() {
      "BENEFICIAL" => "Beneficios",
      "NEUTRAL" => "Neutros",
      "AVOID" => "Evitar",
      _ => DEFAULT_CATEGORY,
    };

    NutrigenomicFood {
      meal_types: vec![MealType::from_backend(&self.meal_type)],
      is_clinical_priority: self.category == "BENEFICIAL",
      notes: (self.category == "AVOID").then(|| AVOID_NOTE.to_string()),
      category: category.to_string(),
      id: self.id,
      name: self.name,
    }
  }
}

impl SmartNutritionResponse {
  /// Build the domain plan. Blood type defaults to O when the backend omits
  /// or garbles it; the diet defaults to metabolic. Items the backend marks
  /// AVOID also make up the plan's `forbidden` list.
  pub fn into_plan(self, updated_at: String) -> NutrigenomicPlan {
    let blood_type = self
      .blood_type
      .as_deref()
      .and_then(|b| b.parse().ok())
      .unwrap_or(BloodType::O);

    let forbidden = self
      .items
      .iter()
      .filter(|item| item.category == "AVOID")
      .map(|item| item.name.clone())
      .collect();

    NutrigenomicPlan {
      blood_type: Some(blood_type),
      diet_types: vec![DietType::Metabolic],
      forbidden,
      foods: self.items.into_iter().map(BackendFoodItem::into_food).collect(),
      updated_at,
    }
  }
}
