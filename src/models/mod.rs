use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod observation;
pub mod tracked_item;
pub mod user;

// Re-exports for convenience
pub use observation::*;
pub use tracked_item::*;
pub use user::*;

/// Per-item scheduler state. `Idle` items are picked up when their
/// next-check time elapses; `Failed` items stay tracked but only a manual
/// trigger puts them back into rotation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT")]
pub enum CheckState {
    #[sqlx(rename = "idle")]
    Idle,
    #[sqlx(rename = "failed")]
    Failed,
}

impl CheckState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckState::Idle => "idle",
            CheckState::Failed => "failed",
        }
    }
}

// Helper function to generate ids in the format expected by the database
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}
