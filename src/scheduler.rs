use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::extract::{ExtractionResult, Extractor};
use crate::fetch::PageFetcher;
use crate::models::TrackedItem;
use crate::notify::PriceAlerter;
use crate::repo::TrackerRepo;
use crate::utils::error::Result;

/// Drives recurring price checks off the persisted schedule. Each tick pulls
/// the items whose next-check time has elapsed and runs them under a global
/// concurrency bound, at most one in-flight check per item.
pub struct CheckScheduler {
    repo: Arc<dyn TrackerRepo>,
    fetcher: Arc<dyn PageFetcher>,
    alerter: Arc<PriceAlerter>,
    extractor: Extractor,
    config: SchedulerConfig,
    in_flight: Mutex<HashSet<String>>,
    permits: Semaphore,
}

impl CheckScheduler {
    pub fn new(
        repo: Arc<dyn TrackerRepo>,
        fetcher: Arc<dyn PageFetcher>,
        alerter: Arc<PriceAlerter>,
        config: SchedulerConfig,
    ) -> Self {
        let permits = Semaphore::new(config.max_concurrent_checks);
        Self {
            repo,
            fetcher,
            alerter,
            extractor: Extractor::new(),
            config,
            in_flight: Mutex::new(HashSet::new()),
            permits,
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!(
            tick_interval = self.config.tick_interval,
            check_interval = self.config.check_interval,
            "scheduler started"
        );

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.tick_interval));
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick().await {
                error!(error = %e, "scheduler tick failed");
            }
        }
    }

    async fn tick(self: &Arc<Self>) -> Result<()> {
        let due = self.repo.due_items(Utc::now()).await?;
        if due.is_empty() {
            return Ok(());
        }

        debug!(count = due.len(), "items due for a check");
        for item in due {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler.check_item_guarded(item).await;
            });
        }
        Ok(())
    }

    /// Manual trigger: put failed items back into rotation, then check every
    /// startable item right away. Returns how many items were checked.
    pub async fn check_all_now(&self) -> Result<usize> {
        let reset = self.repo.reset_failed_items(Utc::now()).await?;
        if reset > 0 {
            info!(reset, "failed items returned to rotation");
        }

        let items = self.repo.startable_items().await?;
        let count = items.len();
        for item in items {
            self.check_item_guarded(item).await;
        }
        Ok(count)
    }

    async fn check_item_guarded(&self, item: TrackedItem) {
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(item.id.clone()) {
                debug!(item_id = %item.id, "check already in flight, skipping");
                return;
            }
        }

        // The semaphore is never closed, so acquisition only fails if the
        // scheduler itself is being torn down.
        if let Ok(_permit) = self.permits.acquire().await {
            self.check_item(&item).await;
        }

        self.in_flight.lock().await.remove(&item.id);
    }

    async fn check_item(&self, item: &TrackedItem) {
        debug!(item_id = %item.id, url = %item.url, "checking price");

        let extraction = match self.fetcher.fetch(&item.url).await {
            Ok(content) => self.extractor.extract(&item.url, &content),
            Err(e) => ExtractionResult::Failure {
                reason: e.to_string(),
            },
        };

        match extraction {
            ExtractionResult::Success { price, .. } => self.handle_success(item, price).await,
            ExtractionResult::Failure { reason } => {
                warn!(item_id = %item.id, url = %item.url, reason = %reason, "check failed");
                self.handle_failure(item).await;
            }
        }
    }

    async fn handle_success(&self, item: &TrackedItem, price: Decimal) {
        // Previous price is for the alert text only; the alert *decision*
        // rides on the flag captured by record_observation.
        let old_price = match self.repo.latest_observation(&item.id).await {
            Ok(observation) => observation.map(|o| o.price),
            Err(e) => {
                error!(item_id = %item.id, error = %e, "failed to read latest observation");
                None
            }
        };

        let next_check_at = self.next_check_time();
        match self.repo.record_observation(&item.id, price, next_check_at).await {
            Ok(Some(outcome)) => {
                debug!(item_id = %item.id, price = %price, "recorded observation");
                self.alerter
                    .maybe_notify(item, outcome.previous_below_target, old_price, price)
                    .await;
            }
            Ok(None) => {
                debug!(item_id = %item.id, "item removed mid-check, result dropped");
            }
            Err(e) => {
                error!(item_id = %item.id, error = %e, "failed to record observation");
            }
        }
    }

    async fn handle_failure(&self, item: &TrackedItem) {
        let failures = match self.repo.record_failure(&item.id).await {
            Ok(Some(failures)) => failures,
            Ok(None) => {
                debug!(item_id = %item.id, "item removed mid-check, failure dropped");
                return;
            }
            Err(e) => {
                error!(item_id = %item.id, error = %e, "failed to record check failure");
                return;
            }
        };

        if failures >= self.config.retry_ceiling {
            error!(
                item_id = %item.id,
                url = %item.url,
                failures,
                "check failing repeatedly, parking item until manual reset"
            );
            if let Err(e) = self.repo.mark_failed(&item.id).await {
                error!(item_id = %item.id, error = %e, "failed to park item");
            }
            return;
        }

        let delay = self.backoff_delay(failures);
        warn!(item_id = %item.id, failures, retry_in = %delay, "retrying after backoff");
        if let Err(e) = self.repo.set_next_check(&item.id, Utc::now() + delay).await {
            error!(item_id = %item.id, error = %e, "failed to reschedule retry");
        }
    }

    /// Exponential in the failure count, bounded by retry_cap.
    fn backoff_delay(&self, failures: u32) -> ChronoDuration {
        let exponent = failures.saturating_sub(1).min(16);
        let seconds = self
            .config
            .retry_base
            .saturating_mul(1u64 << exponent)
            .min(self.config.retry_cap);
        ChronoDuration::seconds(seconds as i64)
    }

    /// Base interval plus uniform jitter, so checks against the same site
    /// drift apart instead of arriving in lockstep.
    fn next_check_time(&self) -> DateTime<Utc> {
        let jitter = self.config.jitter as i64;
        let offset = if jitter > 0 {
            rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            0
        };
        Utc::now() + ChronoDuration::seconds(self.config.check_interval as i64 + offset)
    }
}
