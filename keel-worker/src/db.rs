//! Database Connection Pool Module
//!
//! PostgreSQL connection pooling using deadpool-postgres, and the durable
//! store implementations the worker runs against:
//!
//! - [`SubscriptionStore`]: correlation lookups plus the atomic subscription
//!   transition (one transaction: upsert the row, update the user's plan)
//! - [`ExpiringRecordStore`]: bounded fetch of expired ids and by-id delete

use crate::config::{parse_or, Vars};
use crate::constants::{DEFAULT_DB_POOL_SIZE, DEFAULT_DB_PORT, DEFAULT_DB_TIMEOUT_SECS};
use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolError, RecyclingMethod, Runtime};
use keel_core::{
    new_entity_id, BillingPlan, EntityId, RecordKind, StorageError, SubscriptionRecord,
    SubscriptionStatus, SubscriptionTransition, Timestamp, TransitionApplied,
};
use keel_storage::{ExpiringRecordStore, StorageResult, SubscriptionStore};
use std::time::Duration;
use tokio_postgres::{NoTls, Row};

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Wait, create and recycle timeout
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_DB_PORT,
            dbname: "keel".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            max_size: DEFAULT_DB_POOL_SIZE,
            timeout: Duration::from_secs(DEFAULT_DB_TIMEOUT_SECS),
        }
    }
}

impl DbConfig {
    /// Create a new database configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_vars(&|key| std::env::var(key).ok())
    }

    /// # Environment Variables
    /// - `KEEL_DB_HOST`, `KEEL_DB_PORT`, `KEEL_DB_NAME`, `KEEL_DB_USER`,
    ///   `KEEL_DB_PASSWORD`
    /// - `KEEL_DB_POOL_SIZE` (default: 16)
    /// - `KEEL_DB_TIMEOUT` in seconds (default: 30)
    pub fn from_vars(vars: Vars<'_>) -> Self {
        let defaults = Self::default();
        Self {
            host: vars("KEEL_DB_HOST").unwrap_or(defaults.host),
            port: parse_or(vars, "KEEL_DB_PORT", defaults.port),
            dbname: vars("KEEL_DB_NAME").unwrap_or(defaults.dbname),
            user: vars("KEEL_DB_USER").unwrap_or(defaults.user),
            password: vars("KEEL_DB_PASSWORD").unwrap_or_default(),
            max_size: parse_or(vars, "KEEL_DB_POOL_SIZE", defaults.max_size),
            timeout: Duration::from_secs(parse_or(
                vars,
                "KEEL_DB_TIMEOUT",
                DEFAULT_DB_TIMEOUT_SECS,
            )),
        }
    }

    /// Create a connection pool from this configuration.
    ///
    /// No connection is opened until the first checkout.
    pub fn create_pool(&self) -> StorageResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.connect_timeout = Some(self.timeout);

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_config = deadpool_postgres::PoolConfig::new(self.max_size);
        pool_config.timeouts.wait = Some(self.timeout);
        pool_config.timeouts.create = Some(self.timeout);
        pool_config.timeouts.recycle = Some(self.timeout);
        cfg.pool = Some(pool_config);

        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StorageError::Backend {
                reason: format!("Failed to create pool: {}", e),
            })
    }
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

fn pool_error(e: PoolError) -> StorageError {
    StorageError::Unavailable {
        reason: e.to_string(),
    }
}

fn query_error(e: tokio_postgres::Error) -> StorageError {
    if e.is_closed() {
        StorageError::Unavailable {
            reason: e.to_string(),
        }
    } else {
        StorageError::Backend {
            reason: e.to_string(),
        }
    }
}

fn transaction_error(e: tokio_postgres::Error) -> StorageError {
    StorageError::TransactionFailed {
        reason: e.to_string(),
    }
}

// ============================================================================
// DATABASE CLIENT
// ============================================================================

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, provider_subscription_id, provider_customer_id, \
     plan, status, current_period_end, cancel_at_period_end, last_event_id, created_at, updated_at";

/// Database client that wraps a connection pool.
#[derive(Clone)]
pub struct DbClient {
    pool: Pool,
}

impl DbClient {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &DbConfig) -> StorageResult<Self> {
        let pool = config.create_pool()?;
        Ok(Self::new(pool))
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    async fn get_conn(&self) -> StorageResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(pool_error)
    }

    /// Round trip to the database.
    pub async fn ping(&self) -> StorageResult<()> {
        let conn = self.get_conn().await?;
        conn.simple_query("SELECT 1").await.map_err(query_error)?;
        Ok(())
    }

    async fn find_subscription(
        &self,
        column: &str,
        value: &str,
    ) -> StorageResult<Option<SubscriptionRecord>> {
        let conn = self.get_conn().await?;
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE {column} = $1 \
             ORDER BY updated_at DESC LIMIT 1"
        );
        let row = conn
            .query_opt(sql.as_str(), &[&value])
            .await
            .map_err(query_error)?;
        row.as_ref().map(subscription_from_row).transpose()
    }
}

fn subscription_from_row(row: &Row) -> StorageResult<SubscriptionRecord> {
    let decode = |e: tokio_postgres::Error| StorageError::Backend {
        reason: format!("Failed to decode subscription row: {}", e),
    };
    let plan: String = row.try_get("plan").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    Ok(SubscriptionRecord {
        id: row.try_get("id").map_err(decode)?,
        user_id: row.try_get("user_id").map_err(decode)?,
        provider_subscription_id: row.try_get("provider_subscription_id").map_err(decode)?,
        provider_customer_id: row.try_get("provider_customer_id").map_err(decode)?,
        plan: plan
            .parse::<BillingPlan>()
            .map_err(|reason| StorageError::Backend { reason })?,
        status: SubscriptionStatus::from_db_str(&status).ok_or_else(|| StorageError::Backend {
            reason: format!("Unknown subscription status in row: {}", status),
        })?,
        current_period_end: row.try_get("current_period_end").map_err(decode)?,
        cancel_at_period_end: row.try_get("cancel_at_period_end").map_err(decode)?,
        last_event_id: row.try_get("last_event_id").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

#[async_trait]
impl SubscriptionStore for DbClient {
    async fn find_by_provider_subscription_id(
        &self,
        provider_subscription_id: &str,
    ) -> StorageResult<Option<SubscriptionRecord>> {
        self.find_subscription("provider_subscription_id", provider_subscription_id)
            .await
    }

    async fn find_by_provider_customer_id(
        &self,
        provider_customer_id: &str,
    ) -> StorageResult<Option<SubscriptionRecord>> {
        self.find_subscription("provider_customer_id", provider_customer_id)
            .await
    }

    async fn apply_transition(
        &self,
        transition: &SubscriptionTransition,
    ) -> StorageResult<TransitionApplied> {
        let mut conn = self.get_conn().await?;
        let tx = conn.transaction().await.map_err(transaction_error)?;
        let now: Timestamp = Utc::now();

        let locked = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE provider_subscription_id = $1 FOR UPDATE"
        );
        let current = tx
            .query_opt(locked.as_str(), &[&transition.provider_subscription_id])
            .await
            .map_err(transaction_error)?
            .map(|row| subscription_from_row(&row))
            .transpose()?;
        let previous_status = current.as_ref().map(|r| r.status);

        if let Some(record) = current {
            if !transition.supersedes(record.status) {
                tx.rollback().await.map_err(transaction_error)?;
                return Ok(TransitionApplied {
                    record,
                    created: false,
                    written: false,
                    previous_status,
                });
            }
        }

        let upsert = format!(
            "INSERT INTO subscriptions ({SUBSCRIPTION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10) \
             ON CONFLICT (provider_subscription_id) DO UPDATE SET \
                 user_id = EXCLUDED.user_id, \
                 provider_customer_id = COALESCE(EXCLUDED.provider_customer_id, \
                     subscriptions.provider_customer_id), \
                 plan = EXCLUDED.plan, \
                 status = EXCLUDED.status, \
                 current_period_end = EXCLUDED.current_period_end, \
                 cancel_at_period_end = EXCLUDED.cancel_at_period_end, \
                 last_event_id = EXCLUDED.last_event_id, \
                 updated_at = EXCLUDED.updated_at \
             RETURNING {SUBSCRIPTION_COLUMNS}, (xmax = 0) AS created"
        );
        let id: EntityId = new_entity_id();
        let row = tx
            .query_one(
                upsert.as_str(),
                &[
                    &id,
                    &transition.user_id,
                    &transition.provider_subscription_id,
                    &transition.provider_customer_id,
                    &transition.plan.as_str(),
                    &transition.status.as_str(),
                    &transition.current_period_end,
                    &transition.cancel_at_period_end,
                    &transition.source_event_id,
                    &now,
                ],
            )
            .await
            .map_err(transaction_error)?;
        let record = subscription_from_row(&row)?;
        let created: bool = row.try_get("created").map_err(transaction_error)?;

        tx.execute(
            "UPDATE users SET plan = $1, updated_at = $2 WHERE id = $3",
            &[&transition.effective_plan().as_str(), &now, &transition.user_id],
        )
        .await
        .map_err(transaction_error)?;

        tx.commit().await.map_err(transaction_error)?;

        Ok(TransitionApplied {
            record,
            created,
            written: true,
            previous_status,
        })
    }
}

#[async_trait]
impl ExpiringRecordStore for DbClient {
    async fn find_expired(
        &self,
        kind: RecordKind,
        now: Timestamp,
        limit: usize,
    ) -> StorageResult<Vec<EntityId>> {
        let conn = self.get_conn().await?;
        let sql = format!(
            "SELECT id FROM {} WHERE expires_at < $1 ORDER BY expires_at LIMIT $2",
            kind.table_name()
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = conn
            .query(sql.as_str(), &[&now, &limit])
            .await
            .map_err(query_error)?;
        rows.iter()
            .map(|row| {
                row.try_get::<_, EntityId>(0)
                    .map_err(|e| StorageError::Backend {
                        reason: e.to_string(),
                    })
            })
            .collect()
    }

    async fn delete_by_ids(&self, kind: RecordKind, ids: &[EntityId]) -> StorageResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.get_conn().await?;
        let sql = format!("DELETE FROM {} WHERE id = ANY($1)", kind.table_name());
        conn.execute(sql.as_str(), &[&ids])
            .await
            .map_err(query_error)
    }
}
