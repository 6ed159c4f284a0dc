use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::generate_id;

/// A chat sender identity. `handle` is the stable external id (the Signal
/// phone number); exactly one internal record exists per handle, enforced
/// by a uniqueness constraint in the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    pub handle: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(handle: String, display_name: Option<String>) -> Self {
        Self {
            id: generate_id(),
            handle,
            display_name,
            created_at: Utc::now(),
        }
    }
}
