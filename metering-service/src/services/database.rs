//! Postgres-backed store for metering-service.

use crate::models::{
    EmailNotification, ListUsageFilter, ListWebhookEventsFilter, MeteringContext, NewLimitEvent,
    NewNotification, NewUsageRecord, Product, Subscription, SubscriptionStateUpdate, Tier,
    UsageLimitEvent, UsageRecord, WebhookEvent, WebhookInsert,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::MeteringStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

/// Flattened subscription + tier + product join.
#[derive(FromRow)]
struct MeteringContextRow {
    subscription_id: Uuid,
    tenant_id: Uuid,
    tier_id: Uuid,
    user_id: String,
    subscriber_email: Option<String>,
    status: String,
    current_period_start: DateTime<Utc>,
    current_period_end: DateTime<Utc>,
    cancel_at_period_end: bool,
    stripe_subscription_id: Option<String>,
    stripe_subscription_item_id: Option<String>,
    last_reported_usage: Option<i64>,
    last_reported_at: Option<DateTime<Utc>>,
    provider_synced_at: Option<DateTime<Utc>>,
    period_synced_at: Option<DateTime<Utc>>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
    product_id: Uuid,
    tier_name: String,
    usage_limit: Option<i64>,
    limit_action: String,
    overage_allowed: bool,
    warning_thresholds: Vec<i32>,
    metering_enabled: bool,
    product_tenant_id: Uuid,
    product_name: String,
    usage_webhook_url: Option<String>,
}

impl From<MeteringContextRow> for MeteringContext {
    fn from(row: MeteringContextRow) -> Self {
        MeteringContext {
            subscription: Subscription {
                subscription_id: row.subscription_id,
                tenant_id: row.tenant_id,
                tier_id: row.tier_id,
                user_id: row.user_id,
                subscriber_email: row.subscriber_email,
                status: row.status,
                current_period_start: row.current_period_start,
                current_period_end: row.current_period_end,
                cancel_at_period_end: row.cancel_at_period_end,
                stripe_subscription_id: row.stripe_subscription_id,
                stripe_subscription_item_id: row.stripe_subscription_item_id,
                last_reported_usage: row.last_reported_usage,
                last_reported_at: row.last_reported_at,
                provider_synced_at: row.provider_synced_at,
                period_synced_at: row.period_synced_at,
                created_utc: row.created_utc,
                updated_utc: row.updated_utc,
            },
            tier: Tier {
                tier_id: row.tier_id,
                product_id: row.product_id,
                name: row.tier_name,
                usage_limit: row.usage_limit,
                limit_action: row.limit_action,
                overage_allowed: row.overage_allowed,
                warning_thresholds: row.warning_thresholds,
                metering_enabled: row.metering_enabled,
            },
            product: Product {
                product_id: row.product_id,
                tenant_id: row.product_tenant_id,
                name: row.product_name,
                usage_webhook_url: row.usage_webhook_url,
            },
        }
    }
}

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "metering-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| db_error("Failed to connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl MeteringStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Reference data
    // =========================================================================

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn get_metering_context(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<MeteringContext>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_metering_context"])
            .start_timer();

        let row = sqlx::query_as::<_, MeteringContextRow>(
            r#"
            SELECT s.subscription_id, s.tenant_id, s.tier_id, s.user_id, s.subscriber_email, s.status,
                   s.current_period_start, s.current_period_end, s.cancel_at_period_end,
                   s.stripe_subscription_id, s.stripe_subscription_item_id, s.last_reported_usage,
                   s.last_reported_at, s.provider_synced_at, s.period_synced_at, s.created_utc, s.updated_utc,
                   t.product_id, t.name AS tier_name, t.usage_limit, t.limit_action, t.overage_allowed,
                   t.warning_thresholds, t.metering_enabled,
                   p.tenant_id AS product_tenant_id, p.name AS product_name, p.usage_webhook_url
            FROM subscriptions s
            JOIN tiers t ON t.tier_id = s.tier_id
            JOIN products p ON p.product_id = t.product_id
            WHERE s.subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load metering context", e))?;

        timer.observe_duration();

        Ok(row.map(MeteringContext::from))
    }

    #[instrument(skip(self))]
    async fn find_subscription_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_subscription_by_stripe_id"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT subscription_id, tenant_id, tier_id, user_id, subscriber_email, status, current_period_start, current_period_end, cancel_at_period_end, stripe_subscription_id, stripe_subscription_item_id, last_reported_usage, last_reported_at, provider_synced_at, period_synced_at, created_utc, updated_utc
            FROM subscriptions
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to find subscription", e))?;

        timer.observe_duration();

        Ok(subscription)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn link_stripe_subscription(
        &self,
        subscription_id: Uuid,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["link_stripe_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET stripe_subscription_id = $2, updated_utc = NOW()
            WHERE subscription_id = $1
              AND (stripe_subscription_id IS NULL OR stripe_subscription_id = $2)
            RETURNING subscription_id, tenant_id, tier_id, user_id, subscriber_email, status, current_period_start, current_period_end, cancel_at_period_end, stripe_subscription_id, stripe_subscription_item_id, last_reported_usage, last_reported_at, provider_synced_at, period_synced_at, created_utc, updated_utc
            "#,
        )
        .bind(subscription_id)
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to link subscription", e))?;

        timer.observe_duration();

        Ok(subscription)
    }

    #[instrument(skip(self, update), fields(subscription_id = %subscription_id))]
    async fn apply_subscription_state(
        &self,
        subscription_id: Uuid,
        update: &SubscriptionStateUpdate,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_subscription_state"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET status = CASE WHEN provider_synced_at IS NULL OR provider_synced_at <= $7
                              THEN COALESCE($2, status) ELSE status END,
                cancel_at_period_end = CASE WHEN provider_synced_at IS NULL OR provider_synced_at <= $7
                              THEN COALESCE($5, cancel_at_period_end) ELSE cancel_at_period_end END,
                stripe_subscription_item_id = CASE WHEN provider_synced_at IS NULL OR provider_synced_at <= $7
                              THEN COALESCE($6, stripe_subscription_item_id) ELSE stripe_subscription_item_id END,
                current_period_start = CASE WHEN period_synced_at IS NULL OR period_synced_at <= $7
                              THEN COALESCE($3, current_period_start) ELSE current_period_start END,
                current_period_end = CASE WHEN period_synced_at IS NULL OR period_synced_at <= $7
                              THEN COALESCE($4, current_period_end) ELSE current_period_end END,
                period_synced_at = CASE WHEN ($3 IS NOT NULL OR $4 IS NOT NULL)
                                         AND (period_synced_at IS NULL OR period_synced_at <= $7)
                              THEN $7 ELSE period_synced_at END,
                provider_synced_at = GREATEST(provider_synced_at, $7),
                updated_utc = NOW()
            WHERE subscription_id = $1
              AND ((provider_synced_at IS NULL OR provider_synced_at <= $7)
                   OR (($3 IS NOT NULL OR $4 IS NOT NULL)
                       AND (period_synced_at IS NULL OR period_synced_at <= $7)))
            RETURNING subscription_id, tenant_id, tier_id, user_id, subscriber_email, status, current_period_start, current_period_end, cancel_at_period_end, stripe_subscription_id, stripe_subscription_item_id, last_reported_usage, last_reported_at, provider_synced_at, period_synced_at, created_utc, updated_utc
            "#,
        )
        .bind(subscription_id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.current_period_start)
        .bind(update.current_period_end)
        .bind(update.cancel_at_period_end)
        .bind(&update.stripe_subscription_item_id)
        .bind(update.synced_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to apply subscription state", e))?;

        timer.observe_duration();

        Ok(subscription)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn record_reported_usage(
        &self,
        subscription_id: Uuid,
        quantity: i64,
        reported_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_reported_usage"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET last_reported_usage = $2, last_reported_at = $3, updated_utc = NOW()
            WHERE subscription_id = $1
              AND (last_reported_at IS NULL OR last_reported_at <= $3)
            "#,
        )
        .bind(subscription_id)
        .bind(quantity)
        .bind(reported_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to record reported usage", e))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Usage ledger
    // =========================================================================

    #[instrument(skip(self, input), fields(subscription_id = %input.subscription_id))]
    async fn insert_usage_record(&self, input: &NewUsageRecord) -> Result<UsageRecord, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_usage_record"])
            .start_timer();

        let record = sqlx::query_as::<_, UsageRecord>(
            r#"
            INSERT INTO usage_records (record_id, subscription_id, tenant_id, user_id, quantity, timestamp, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING record_id, subscription_id, tenant_id, user_id, quantity, timestamp, metadata, reported_at, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.subscription_id)
        .bind(input.tenant_id)
        .bind(&input.user_id)
        .bind(input.quantity)
        .bind(input.timestamp)
        .bind(&input.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to record usage", e))?;

        timer.observe_duration();

        Ok(record)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn sum_usage_since(
        &self,
        subscription_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["sum_usage_since"])
            .start_timer();

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(quantity), 0)::BIGINT
            FROM usage_records
            WHERE subscription_id = $1 AND timestamp >= $2
            "#,
        )
        .bind(subscription_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to sum usage", e))?;

        timer.observe_duration();

        Ok(total)
    }

    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id))]
    async fn list_usage_records(
        &self,
        tenant_id: Uuid,
        filter: &ListUsageFilter,
    ) -> Result<Vec<UsageRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_usage_records"])
            .start_timer();

        let records = sqlx::query_as::<_, UsageRecord>(
            r#"
            SELECT record_id, subscription_id, tenant_id, user_id, quantity, timestamp, metadata, reported_at, created_utc
            FROM usage_records
            WHERE tenant_id = $1
              AND ($2::UUID IS NULL OR subscription_id = $2)
              AND ($3::VARCHAR IS NULL OR user_id = $3)
              AND ($4::TIMESTAMPTZ IS NULL OR timestamp >= $4)
              AND ($5::TIMESTAMPTZ IS NULL OR timestamp <= $5)
            ORDER BY timestamp DESC
            "#,
        )
        .bind(tenant_id)
        .bind(filter.subscription_id)
        .bind(&filter.user_id)
        .bind(filter.start)
        .bind(filter.end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list usage records", e))?;

        timer.observe_duration();

        Ok(records)
    }

    #[instrument(skip(self), fields(record_id = %record_id))]
    async fn mark_usage_reported(
        &self,
        record_id: Uuid,
        reported_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_usage_reported"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE usage_records SET reported_at = $2
            WHERE record_id = $1 AND reported_at IS NULL
            "#,
        )
        .bind(record_id)
        .bind(reported_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to mark usage reported", e))?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn list_unreported_usage(
        &self,
        tenant_id: Uuid,
        limit: i64,
    ) -> Result<Vec<UsageRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_unreported_usage"])
            .start_timer();

        let records = sqlx::query_as::<_, UsageRecord>(
            r#"
            SELECT u.record_id, u.subscription_id, u.tenant_id, u.user_id, u.quantity, u.timestamp, u.metadata, u.reported_at, u.created_utc
            FROM usage_records u
            JOIN subscriptions s ON s.subscription_id = u.subscription_id
            JOIN tiers t ON t.tier_id = s.tier_id
            WHERE u.tenant_id = $1
              AND u.reported_at IS NULL
              AND t.metering_enabled
              AND s.stripe_subscription_id IS NOT NULL
              AND s.stripe_subscription_item_id IS NOT NULL
              AND s.status <> 'canceled'
            ORDER BY u.timestamp ASC
            LIMIT $2
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list unreported usage", e))?;

        timer.observe_duration();

        Ok(records)
    }

    // =========================================================================
    // Threshold events
    // =========================================================================

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn threshold_notified(
        &self,
        subscription_id: Uuid,
        threshold: f64,
        period_start: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["threshold_notified"])
            .start_timer();

        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM usage_limit_events
                WHERE subscription_id = $1 AND threshold = $2 AND period_start = $3
                  AND notification_sent
            )
            "#,
        )
        .bind(subscription_id)
        .bind(threshold)
        .bind(period_start)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to check threshold events", e))?;

        timer.observe_duration();

        Ok(exists)
    }

    #[instrument(skip(self, event, notification), fields(subscription_id = %event.subscription_id, event_type = event.event_type.as_str()))]
    async fn record_limit_event(
        &self,
        event: &NewLimitEvent,
        notification: Option<&NewNotification>,
    ) -> Result<Option<UsageLimitEvent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_limit_event"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        // The partial unique index only covers notified rows, so audit rows
        // never conflict.
        let inserted = sqlx::query_as::<_, UsageLimitEvent>(
            r#"
            INSERT INTO usage_limit_events (event_id, subscription_id, user_id, event_type, threshold, current_usage, usage_limit, percentage, notification_sent, period_start)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (subscription_id, threshold, period_start) WHERE notification_sent DO NOTHING
            RETURNING event_id, subscription_id, user_id, event_type, threshold, current_usage, usage_limit, percentage, notification_sent, period_start, timestamp
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.subscription_id)
        .bind(&event.user_id)
        .bind(event.event_type.as_str())
        .bind(event.threshold)
        .bind(event.current_usage)
        .bind(event.usage_limit)
        .bind(event.percentage)
        .bind(event.notification_sent)
        .bind(event.period_start)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to record limit event", e))?;

        let Some(inserted) = inserted else {
            tx.rollback()
                .await
                .map_err(|e| db_error("Failed to roll back", e))?;
            timer.observe_duration();
            return Ok(None);
        };

        if let Some(notification) = notification {
            sqlx::query(
                r#"
                INSERT INTO email_notifications (notification_id, user_id, notification_type, subject, body, recipient, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&notification.user_id)
            .bind(notification.notification_type.as_str())
            .bind(&notification.subject)
            .bind(&notification.body)
            .bind(&notification.recipient)
            .bind(&notification.metadata)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to enqueue notification", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit limit event", e))?;

        timer.observe_duration();

        Ok(Some(inserted))
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn list_limit_events(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<UsageLimitEvent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_limit_events"])
            .start_timer();

        let events = sqlx::query_as::<_, UsageLimitEvent>(
            r#"
            SELECT event_id, subscription_id, user_id, event_type, threshold, current_usage, usage_limit, percentage, notification_sent, period_start, timestamp
            FROM usage_limit_events
            WHERE subscription_id = $1
            ORDER BY timestamp ASC
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list limit events", e))?;

        timer.observe_duration();

        Ok(events)
    }

    // =========================================================================
    // Webhook events
    // =========================================================================

    #[instrument(skip(self, payload), fields(event_id = %event_id, event_type = %event_type))]
    async fn insert_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<WebhookInsert, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_webhook_event"])
            .start_timer();

        let inserted = sqlx::query_as::<_, WebhookEvent>(
            r#"
            INSERT INTO webhook_events (event_id, event_type, payload, claimed_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id, event_type, payload, status, retry_count, processed_at, error, claimed_at, created_utc, updated_utc
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(payload)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to persist webhook event", e))?;

        let result = match inserted {
            Some(event) => WebhookInsert::Inserted(event),
            None => {
                let existing = sqlx::query_as::<_, WebhookEvent>(
                    r#"
                    SELECT event_id, event_type, payload, status, retry_count, processed_at, error, claimed_at, created_utc, updated_utc
                    FROM webhook_events
                    WHERE event_id = $1
                    "#,
                )
                .bind(event_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| db_error("Failed to load webhook event", e))?;
                WebhookInsert::Existing(existing)
            }
        };

        timer.observe_duration();

        Ok(result)
    }

    #[instrument(skip(self), fields(event_id = %event_id))]
    async fn claim_webhook_event(
        &self,
        event_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_webhook_event"])
            .start_timer();

        let claimed = sqlx::query_as::<_, WebhookEvent>(
            r#"
            UPDATE webhook_events
            SET status = 'pending', claimed_at = NOW(), updated_utc = NOW()
            WHERE event_id = $1
              AND (status = 'failed'
                   OR (status = 'pending' AND (claimed_at IS NULL OR claimed_at < $2)))
            RETURNING event_id, event_type, payload, status, retry_count, processed_at, error, claimed_at, created_utc, updated_utc
            "#,
        )
        .bind(event_id)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to claim webhook event", e))?;

        timer.observe_duration();

        Ok(claimed)
    }

    #[instrument(skip(self), fields(event_id = %event_id))]
    async fn mark_webhook_processed(&self, event_id: &str) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_webhook_processed"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'processed', processed_at = NOW(), error = NULL, updated_utc = NOW()
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to mark webhook processed", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, error), fields(event_id = %event_id))]
    async fn mark_webhook_failed(
        &self,
        event_id: &str,
        error: &str,
    ) -> Result<WebhookEvent, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_webhook_failed"])
            .start_timer();

        let event = sqlx::query_as::<_, WebhookEvent>(
            r#"
            UPDATE webhook_events
            SET status = 'failed', retry_count = retry_count + 1, error = $2, updated_utc = NOW()
            WHERE event_id = $1
            RETURNING event_id, event_type, payload, status, retry_count, processed_at, error, claimed_at, created_utc, updated_utc
            "#,
        )
        .bind(event_id)
        .bind(error)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to mark webhook failed", e))?;

        timer.observe_duration();

        Ok(event)
    }

    #[instrument(skip(self, filter))]
    async fn list_webhook_events(
        &self,
        filter: &ListWebhookEventsFilter,
    ) -> Result<Vec<WebhookEvent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_webhook_events"])
            .start_timer();

        let events = sqlx::query_as::<_, WebhookEvent>(
            r#"
            SELECT event_id, event_type, payload, status, retry_count, processed_at, error, claimed_at, created_utc, updated_utc
            FROM webhook_events
            WHERE ($1::VARCHAR IS NULL OR status = $1)
            ORDER BY created_utc DESC
            LIMIT $2
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list webhook events", e))?;

        timer.observe_duration();

        Ok(events)
    }

    // =========================================================================
    // Outbox
    // =========================================================================

    #[instrument(skip(self, notification), fields(notification_type = notification.notification_type.as_str()))]
    async fn enqueue_notification(
        &self,
        notification: &NewNotification,
    ) -> Result<EmailNotification, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["enqueue_notification"])
            .start_timer();

        let row = sqlx::query_as::<_, EmailNotification>(
            r#"
            INSERT INTO email_notifications (notification_id, user_id, notification_type, subject, body, recipient, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING notification_id, user_id, notification_type, subject, body, recipient, status, metadata, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&notification.user_id)
        .bind(notification.notification_type.as_str())
        .bind(&notification.subject)
        .bind(&notification.body)
        .bind(&notification.recipient)
        .bind(&notification.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to enqueue notification", e))?;

        timer.observe_duration();

        Ok(row)
    }
}
