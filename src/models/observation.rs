use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::generate_id;

/// One timestamped price reading for a tracked item. Append-only; a failed
/// or unparseable check produces no observation at all, never a zero price.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceObservation {
    pub id: String,
    pub item_id: String,
    pub price: Decimal,
    pub observed_at: DateTime<Utc>,
}

impl PriceObservation {
    pub fn new(item_id: String, price: Decimal) -> Self {
        Self {
            id: generate_id(),
            item_id,
            price,
            observed_at: Utc::now(),
        }
    }
}
