use serde::{Deserialize, Serialize};

/// ---------------------------------------------------------------------------
/// Item Status
/// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
  #[default]
  Pending,
  Completed,
}

impl std::fmt::Display for ItemStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Pending => write!(f, "pending"),
      Self::Completed => write!(f, "completed"),
    }
  }
}

impl std::str::FromStr for ItemStatus {
  type Err = String;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(Self::Pending),
      "completed" => Ok(Self::Completed),
      _ => Err(format!("Unknown item status: {}", s)),
    }
  }
}

/// ---------------------------------------------------------------------------
/// Time Slot: coarse daily bucket used for grouping and reminder windows
/// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeSlot {
  Morning,
  Afternoon,
  Evening,
  #[default]
  Anytime,
}

impl std::fmt::Display for TimeSlot {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Morning => write!(f, "MORNING"),
      Self::Afternoon => write!(f, "AFTERNOON"),
      Self::Evening => write!(f, "EVENING"),
      Self::Anytime => write!(f, "ANYTIME"),
    }
  }
}

impl std::str::FromStr for TimeSlot {
  type Err = String;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "MORNING" => Ok(Self::Morning),
      "AFTERNOON" => Ok(Self::Afternoon),
      "EVENING" => Ok(Self::Evening),
      "ANYTIME" => Ok(Self::Anytime),
      _ => Err(format!("Unknown time slot: {}", s)),
    }
  }
}

/// ---------------------------------------------------------------------------
/// Protocol Item
/// ---------------------------------------------------------------------------

/// One prescribed action (supplement, therapy step).
///
/// `id` is stable across sync cycles; toggles and cache rewrites key on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolItem {
  pub id: String,
  /// Open tag such as REMOVAL_PHASE or PRIMARY_NUTRACEUTICALS
  pub category: String,
  pub item_name: String,
  #[serde(default)]
  pub dose: String,
  #[serde(default)]
  pub schedule: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub observations: Option<String>,
  #[serde(default)]
  pub status: ItemStatus,
  #[serde(default)]
  pub time_slot: TimeSlot,
  #[serde(default)]
  pub prescribed_at: String,
  #[serde(default)]
  pub updated_at: String,
}

impl ProtocolItem {
  pub fn is_pending(&self) -> bool {
    self.status != ItemStatus::Completed
  }

  /// Whether this item is due in `slot` (ANYTIME items are due in every slot)
  pub fn is_due_in(&self, slot: TimeSlot) -> bool {
    self.time_slot == slot || self.time_slot == TimeSlot::Anytime
  }
}

/// Payload of the legacy `GET /patients/{id}/guide` endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientGuideResponse {
  #[serde(default)]
  pub patient_id: String,
  #[serde(default)]
  pub date: String,
  #[serde(default)]
  pub items: Vec<ProtocolItem>,
}
