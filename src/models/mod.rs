pub mod nutrition;
pub mod profile;
pub mod protocol;
pub mod session;

pub use nutrition::{BloodType, DietType, MealType, NutrigenomicFood, NutrigenomicPlan};
pub use profile::MobileProfile;
pub use protocol::{ItemStatus, PatientGuideResponse, ProtocolItem, TimeSlot};
pub use session::{Role, Session};

use serde::{Deserialize, Deserializer};

/// Read an explicit `null` the same as a missing key. Pair with
/// `#[serde(default)]` on collection fields the backend sometimes nulls out.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
  D: Deserializer<'de>,
  T: Default + Deserialize<'de>,
{
  Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
