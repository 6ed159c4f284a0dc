use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::models::{NewTrackedItem, PriceObservation, TrackedItem, User};
use crate::utils::error::{AppError, Result};

/// What a successful check wrote, read back atomically with the write.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationOutcome {
    /// The edge-trigger flag as it stood *before* this observation.
    pub previous_below_target: bool,
    /// Whether the new price sits at or below the item's target.
    pub new_below_target: bool,
    pub target_price: Decimal,
}

/// Tracking repository collaborator. Owns TrackedItem, PriceObservation and
/// UserIdentity along with their uniqueness and ordering invariants.
#[async_trait]
pub trait TrackerRepo: Send + Sync {
    /// Resolve a sender handle to an identity, creating one on first
    /// contact. Safe under concurrent first messages from the same sender.
    async fn get_or_create_user(&self, handle: &str, display_name: Option<&str>) -> Result<User>;

    async fn create_item(&self, new: NewTrackedItem) -> Result<TrackedItem>;

    /// A user's items in creation order (the order `list` numbers them in).
    async fn items_for_user(&self, user_id: &str) -> Result<Vec<TrackedItem>>;

    /// Removes the item and its history. Returns false when it was already
    /// gone.
    async fn remove_item(&self, item_id: &str) -> Result<bool>;

    /// Idle items whose next-check time has elapsed.
    async fn due_items(&self, now: DateTime<Utc>) -> Result<Vec<TrackedItem>>;

    /// Every item a manual trigger may check: idle or failed.
    async fn startable_items(&self) -> Result<Vec<TrackedItem>>;

    async fn latest_observation(&self, item_id: &str) -> Result<Option<PriceObservation>>;

    /// Single-transaction read-check-append: confirm the item still exists,
    /// append the observation, update the below-target flag, reset the
    /// failure counter and reschedule. Returns None when the item was
    /// removed mid-check, in which case nothing is written.
    async fn record_observation(
        &self,
        item_id: &str,
        price: Decimal,
        next_check_at: DateTime<Utc>,
    ) -> Result<Option<ObservationOutcome>>;

    /// Bump the consecutive-failure counter, returning the new count, or
    /// None when the item no longer exists.
    async fn record_failure(&self, item_id: &str) -> Result<Option<u32>>;

    /// Stop auto-rescheduling until a manual trigger.
    async fn mark_failed(&self, item_id: &str) -> Result<()>;

    async fn set_next_check(&self, item_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Put every failed item back into rotation with a clean counter.
    /// Returns how many were reset.
    async fn reset_failed_items(&self, next_check_at: DateTime<Utc>) -> Result<u64>;
}

pub struct SqliteTrackerRepo {
    pool: SqlitePool,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY,
    handle       TEXT NOT NULL UNIQUE,
    display_name TEXT,
    created_at   TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS tracked_items (
    id                    TEXT PRIMARY KEY,
    user_id               TEXT NOT NULL REFERENCES users(id),
    url                   TEXT NOT NULL,
    title                 TEXT NOT NULL,
    target_price          TEXT NOT NULL,
    previous_below_target INTEGER NOT NULL DEFAULT 0,
    state                 TEXT NOT NULL DEFAULT 'idle',
    consecutive_failures  INTEGER NOT NULL DEFAULT 0,
    next_check_at         TIMESTAMP NOT NULL,
    created_at            TIMESTAMP NOT NULL,
    updated_at            TIMESTAMP NOT NULL,
    UNIQUE(user_id, url)
);

CREATE TABLE IF NOT EXISTS price_observations (
    id          TEXT PRIMARY KEY,
    item_id     TEXT NOT NULL REFERENCES tracked_items(id),
    price       TEXT NOT NULL,
    observed_at TIMESTAMP NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_items_due ON tracked_items(state, next_check_at);
CREATE INDEX IF NOT EXISTS idx_observations_item ON price_observations(item_id);
"#;

impl SqliteTrackerRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&mut *conn).await?;
        }
        Ok(())
    }

    async fn user_by_handle(&self, handle: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, handle, display_name, created_at FROM users WHERE handle = ?")
            .bind(handle)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_user).transpose()
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}

fn map_user(row: SqliteRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        handle: row.try_get("handle")?,
        display_name: row.try_get("display_name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_price(text: &str) -> Result<Decimal> {
    Decimal::from_str(text)
        .map_err(|e| AppError::Internal(format!("corrupt price in store: {:?}: {}", text, e)))
}

fn map_item(row: SqliteRow) -> Result<TrackedItem> {
    let target_price: String = row.try_get("target_price")?;
    let failures: i64 = row.try_get("consecutive_failures")?;
    Ok(TrackedItem {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        target_price: parse_price(&target_price)?,
        previous_below_target: row.try_get("previous_below_target")?,
        state: row.try_get("state")?,
        consecutive_failures: failures.max(0) as u32,
        next_check_at: row.try_get("next_check_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_observation(row: SqliteRow) -> Result<PriceObservation> {
    let price: String = row.try_get("price")?;
    Ok(PriceObservation {
        id: row.try_get("id")?,
        item_id: row.try_get("item_id")?,
        price: parse_price(&price)?,
        observed_at: row.try_get("observed_at")?,
    })
}

const ITEM_COLUMNS: &str = "id, user_id, url, title, target_price, previous_below_target, state, \
                            consecutive_failures, next_check_at, created_at, updated_at";

#[async_trait]
impl TrackerRepo for SqliteTrackerRepo {
    async fn get_or_create_user(&self, handle: &str, display_name: Option<&str>) -> Result<User> {
        if let Some(user) = self.user_by_handle(handle).await? {
            return Ok(user);
        }

        let user = User::new(handle.to_string(), display_name.map(str::to_owned));
        let inserted = sqlx::query(
            "INSERT INTO users (id, handle, display_name, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&user.id)
        .bind(&user.handle)
        .bind(&user.display_name)
        .bind(user.created_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(user),
            // Lost a race with another first message from the same sender;
            // the row now exists, read it back.
            Err(e) if is_unique_violation(&e) => {
                self.user_by_handle(handle).await?.ok_or_else(|| {
                    AppError::Internal(format!("user vanished after conflict: {}", handle))
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_item(&self, new: NewTrackedItem) -> Result<TrackedItem> {
        let item = TrackedItem::new(new);
        let inserted = sqlx::query(
            "INSERT INTO tracked_items (id, user_id, url, title, target_price, \
             previous_below_target, state, consecutive_failures, next_check_at, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id)
        .bind(&item.user_id)
        .bind(&item.url)
        .bind(&item.title)
        .bind(item.target_price.to_string())
        .bind(item.previous_below_target)
        .bind(item.state)
        .bind(item.consecutive_failures as i64)
        .bind(item.next_check_at)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(item),
            Err(e) if is_unique_violation(&e) => Err(AppError::AlreadyTracked),
            Err(e) => Err(e.into()),
        }
    }

    async fn items_for_user(&self, user_id: &str) -> Result<Vec<TrackedItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tracked_items WHERE user_id = ? ORDER BY created_at, rowid",
            ITEM_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(map_item).collect()
    }

    async fn remove_item(&self, item_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM price_observations WHERE item_id = ?")
            .bind(item_id)
            .execute(&mut *tx)
            .await?;

        let deleted = sqlx::query("DELETE FROM tracked_items WHERE id = ?")
            .bind(item_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn due_items(&self, now: DateTime<Utc>) -> Result<Vec<TrackedItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tracked_items WHERE state = 'idle' AND next_check_at <= ? \
             ORDER BY next_check_at",
            ITEM_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(map_item).collect()
    }

    async fn startable_items(&self) -> Result<Vec<TrackedItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tracked_items WHERE state IN ('idle', 'failed') ORDER BY created_at",
            ITEM_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(map_item).collect()
    }

    async fn latest_observation(&self, item_id: &str) -> Result<Option<PriceObservation>> {
        let row = sqlx::query(
            "SELECT id, item_id, price, observed_at FROM price_observations \
             WHERE item_id = ? ORDER BY rowid DESC LIMIT 1",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(map_observation).transpose()
    }

    async fn record_observation(
        &self,
        item_id: &str,
        price: Decimal,
        next_check_at: DateTime<Utc>,
    ) -> Result<Option<ObservationOutcome>> {
        let mut tx = self.pool.begin().await?;

        // Existence check inside the same transaction as the write: a
        // concurrent `stop` must not gain an observation afterwards.
        let current = sqlx::query(
            "SELECT target_price, previous_below_target FROM tracked_items WHERE id = ?",
        )
        .bind(item_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(current) = current else {
            tx.rollback().await?;
            return Ok(None);
        };

        let target_text: String = current.try_get("target_price")?;
        let target_price = parse_price(&target_text)?;
        let previous_below_target: bool = current.try_get("previous_below_target")?;
        let new_below_target = price <= target_price;

        let observation = PriceObservation::new(item_id.to_string(), price);
        sqlx::query(
            "INSERT INTO price_observations (id, item_id, price, observed_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&observation.id)
        .bind(&observation.item_id)
        .bind(observation.price.to_string())
        .bind(observation.observed_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE tracked_items SET previous_below_target = ?, consecutive_failures = 0, \
             state = 'idle', next_check_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(new_below_target)
        .bind(next_check_at)
        .bind(Utc::now())
        .bind(item_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(ObservationOutcome {
            previous_below_target,
            new_below_target,
            target_price,
        }))
    }

    async fn record_failure(&self, item_id: &str) -> Result<Option<u32>> {
        let row = sqlx::query(
            "UPDATE tracked_items SET consecutive_failures = consecutive_failures + 1, \
             updated_at = ? WHERE id = ? RETURNING consecutive_failures",
        )
        .bind(Utc::now())
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let count: i64 = row.try_get("consecutive_failures")?;
                Ok(Some(count.max(0) as u32))
            }
            None => Ok(None),
        }
    }

    async fn mark_failed(&self, item_id: &str) -> Result<()> {
        sqlx::query("UPDATE tracked_items SET state = 'failed', updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_next_check(&self, item_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE tracked_items SET next_check_at = ?, updated_at = ? WHERE id = ?")
            .bind(at)
            .bind(Utc::now())
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_failed_items(&self, next_check_at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tracked_items SET state = 'idle', consecutive_failures = 0, \
             next_check_at = ?, updated_at = ? WHERE state = 'failed'",
        )
        .bind(next_check_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CheckState;
    use chrono::Duration;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_repo() -> SqliteTrackerRepo {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repo = SqliteTrackerRepo::new(pool);
        repo.init_schema().await.unwrap();
        repo
    }

    fn new_item(user_id: &str, url: &str, target: Decimal) -> NewTrackedItem {
        NewTrackedItem {
            user_id: user_id.to_string(),
            url: url.to_string(),
            title: "Widget".to_string(),
            target_price: target,
            next_check_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_get_or_create_user_idempotent() {
        let repo = test_repo().await;

        let first = repo.get_or_create_user("+61400000000", Some("Alex")).await.unwrap();
        let second = repo.get_or_create_user("+61400000000", None).await.unwrap();

        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_distinct_handles_get_distinct_identities() {
        let repo = test_repo().await;

        let a = repo.get_or_create_user("+61400000001", None).await.unwrap();
        let b = repo.get_or_create_user("+61400000002", None).await.unwrap();

        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_duplicate_item_for_same_user_rejected() {
        let repo = test_repo().await;
        let user = repo.get_or_create_user("+1", None).await.unwrap();

        let url = "https://example.com/widget";
        repo.create_item(new_item(&user.id, url, Decimal::new(50, 0))).await.unwrap();
        let result = repo.create_item(new_item(&user.id, url, Decimal::new(40, 0))).await;

        assert!(matches!(result, Err(AppError::AlreadyTracked)));
    }

    #[tokio::test]
    async fn test_same_url_allowed_across_users() {
        let repo = test_repo().await;
        let a = repo.get_or_create_user("+1", None).await.unwrap();
        let b = repo.get_or_create_user("+2", None).await.unwrap();

        let url = "https://example.com/widget";
        let item_a = repo.create_item(new_item(&a.id, url, Decimal::new(50, 0))).await.unwrap();
        let item_b = repo.create_item(new_item(&b.id, url, Decimal::new(60, 0))).await.unwrap();

        // One sender's stop never affects the other's item.
        assert!(repo.remove_item(&item_a.id).await.unwrap());
        assert_eq!(repo.items_for_user(&a.id).await.unwrap().len(), 0);
        let remaining = repo.items_for_user(&b.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, item_b.id);
    }

    #[tokio::test]
    async fn test_items_listed_in_creation_order() {
        let repo = test_repo().await;
        let user = repo.get_or_create_user("+1", None).await.unwrap();

        for i in 1..=3 {
            repo.create_item(new_item(
                &user.id,
                &format!("https://example.com/{}", i),
                Decimal::new(10 * i, 0),
            ))
            .await
            .unwrap();
        }

        let items = repo.items_for_user(&user.id).await.unwrap();
        let urls: Vec<_> = items.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.com/1",
                "https://example.com/2",
                "https://example.com/3"
            ]
        );
    }

    #[tokio::test]
    async fn test_record_observation_flag_transitions() {
        let repo = test_repo().await;
        let user = repo.get_or_create_user("+1", None).await.unwrap();
        let item = repo
            .create_item(new_item(&user.id, "https://example.com/w", Decimal::new(50, 0)))
            .await
            .unwrap();
        let next = Utc::now() + Duration::hours(1);

        // 60: above target, flag stays down
        let o = repo.record_observation(&item.id, Decimal::new(60, 0), next).await.unwrap().unwrap();
        assert!(!o.previous_below_target);
        assert!(!o.new_below_target);

        // 48: first crossing
        let o = repo.record_observation(&item.id, Decimal::new(48, 0), next).await.unwrap().unwrap();
        assert!(!o.previous_below_target);
        assert!(o.new_below_target);

        // 45: still below, previous flag now set
        let o = repo.record_observation(&item.id, Decimal::new(45, 0), next).await.unwrap().unwrap();
        assert!(o.previous_below_target);
        assert!(o.new_below_target);

        // 52: back above, flag drops
        let o = repo.record_observation(&item.id, Decimal::new(52, 0), next).await.unwrap().unwrap();
        assert!(o.previous_below_target);
        assert!(!o.new_below_target);
    }

    #[tokio::test]
    async fn test_rapid_rechecks_append_independent_observations() {
        let repo = test_repo().await;
        let user = repo.get_or_create_user("+1", None).await.unwrap();
        let item = repo
            .create_item(new_item(&user.id, "https://example.com/w", Decimal::new(50, 0)))
            .await
            .unwrap();
        let next = Utc::now();

        repo.record_observation(&item.id, Decimal::new(42, 0), next).await.unwrap();
        repo.record_observation(&item.id, Decimal::new(42, 0), next).await.unwrap();

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM price_observations WHERE item_id = ?")
            .bind(&item.id)
            .fetch_one(&repo.pool)
            .await
            .unwrap()
            .try_get("n")
            .unwrap();
        assert_eq!(count, 2); // append-only log, no deduplication
    }

    #[tokio::test]
    async fn test_record_observation_after_removal_writes_nothing() {
        let repo = test_repo().await;
        let user = repo.get_or_create_user("+1", None).await.unwrap();
        let item = repo
            .create_item(new_item(&user.id, "https://example.com/w", Decimal::new(50, 0)))
            .await
            .unwrap();

        assert!(repo.remove_item(&item.id).await.unwrap());

        let outcome = repo
            .record_observation(&item.id, Decimal::new(42, 0), Utc::now())
            .await
            .unwrap();
        assert!(outcome.is_none());

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM price_observations")
            .fetch_one(&repo.pool)
            .await
            .unwrap()
            .try_get("n")
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_latest_observation_is_most_recent() {
        let repo = test_repo().await;
        let user = repo.get_or_create_user("+1", None).await.unwrap();
        let item = repo
            .create_item(new_item(&user.id, "https://example.com/w", Decimal::new(50, 0)))
            .await
            .unwrap();
        let next = Utc::now();

        repo.record_observation(&item.id, Decimal::new(60, 0), next).await.unwrap();
        repo.record_observation(&item.id, Decimal::new(55, 0), next).await.unwrap();

        let latest = repo.latest_observation(&item.id).await.unwrap().unwrap();
        assert_eq!(latest.price, Decimal::new(55, 0));
    }

    #[tokio::test]
    async fn test_failure_counting_and_reset() {
        let repo = test_repo().await;
        let user = repo.get_or_create_user("+1", None).await.unwrap();
        let item = repo
            .create_item(new_item(&user.id, "https://example.com/w", Decimal::new(50, 0)))
            .await
            .unwrap();

        assert_eq!(repo.record_failure(&item.id).await.unwrap(), Some(1));
        assert_eq!(repo.record_failure(&item.id).await.unwrap(), Some(2));

        repo.mark_failed(&item.id).await.unwrap();
        assert!(repo.due_items(Utc::now() + Duration::hours(2)).await.unwrap().is_empty());

        let reset = repo.reset_failed_items(Utc::now()).await.unwrap();
        assert_eq!(reset, 1);

        let items = repo.items_for_user(&user.id).await.unwrap();
        assert_eq!(items[0].state, CheckState::Idle);
        assert_eq!(items[0].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_record_failure_for_missing_item() {
        let repo = test_repo().await;
        assert_eq!(repo.record_failure("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_due_items_respects_schedule() {
        let repo = test_repo().await;
        let user = repo.get_or_create_user("+1", None).await.unwrap();
        let item = repo
            .create_item(new_item(&user.id, "https://example.com/w", Decimal::new(50, 0)))
            .await
            .unwrap();

        let due = repo.due_items(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);

        repo.set_next_check(&item.id, Utc::now() + Duration::hours(1)).await.unwrap();
        assert!(repo.due_items(Utc::now()).await.unwrap().is_empty());
    }
}
