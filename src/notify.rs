use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::TrackedItem;
use crate::utils::error::Result;

/// Delivery collaborator: actually getting a message to the chat channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn send(&self, destination: &str, message: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    Skipped,
}

/// Decides whether a fresh observation warrants an alert and hands the
/// formatted message to the delivery collaborator. Edge-triggered: fires on
/// the transition into "at or below target", never while already below.
pub struct PriceAlerter {
    delivery: Arc<dyn Delivery>,
    destination: String,
}

impl PriceAlerter {
    pub fn new(delivery: Arc<dyn Delivery>, destination: String) -> Self {
        Self { delivery, destination }
    }

    pub fn should_notify(previous_below_target: bool, new_price: Decimal, target: Decimal) -> bool {
        new_price <= target && !previous_below_target
    }

    pub async fn maybe_notify(
        &self,
        item: &TrackedItem,
        previous_below_target: bool,
        old_price: Option<Decimal>,
        new_price: Decimal,
    ) -> NotifyOutcome {
        if !Self::should_notify(previous_below_target, new_price, item.target_price) {
            return NotifyOutcome::Skipped;
        }

        let message = format_alert(item, old_price, new_price);
        info!(item_id = %item.id, price = %new_price, "price dropped to target, alerting");

        // Delivery failure is non-fatal to the check cycle; the price
        // history and below-target flag are already persisted.
        if let Err(e) = self.delivery.send(&self.destination, &message).await {
            warn!(item_id = %item.id, error = %e, "alert delivery failed");
        }

        NotifyOutcome::Sent
    }
}

fn format_alert(item: &TrackedItem, old_price: Option<Decimal>, new_price: Decimal) -> String {
    let old = old_price
        .map(|p| format!("${}", p))
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "Price drop alert! {} is now ${} (was {}).\nTarget price: ${}.\nURL: {}",
        item.title, new_price, old, item.target_price, item.url
    )
}
