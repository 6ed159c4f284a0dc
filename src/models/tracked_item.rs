use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{CheckState, generate_id};

/// One user's subscription to price changes on one product URL, together
/// with the durable scheduling state for its recurring check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedItem {
    pub id: String,
    pub user_id: String,
    pub url: String,
    pub title: String,
    pub target_price: Decimal,
    /// True while the last observed price sat at or below the target.
    /// Notifications fire only on the false -> true transition.
    pub previous_below_target: bool,
    pub state: CheckState,
    pub consecutive_failures: u32,
    pub next_check_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTrackedItem {
    pub user_id: String,
    pub url: String,
    pub title: String,
    pub target_price: Decimal,
    pub next_check_at: DateTime<Utc>,
}

impl TrackedItem {
    pub fn new(new: NewTrackedItem) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            user_id: new.user_id,
            url: new.url,
            title: new.title,
            target_price: new.target_price,
            previous_below_target: false,
            state: CheckState::Idle,
            consecutive_failures: 0,
            next_check_at: new.next_check_at,
            created_at: now,
            updated_at: now,
        }
    }
}
