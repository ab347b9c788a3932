//! Constants for the KEEL worker
//!
//! Defaults for every tunable read by the `from_env()` constructors.

// ============================================================================
// DATABASE
// ============================================================================

/// Default PostgreSQL port
pub const DEFAULT_DB_PORT: u16 = 5432;

/// Default connection pool size
pub const DEFAULT_DB_POOL_SIZE: usize = 16;

/// Default connection timeout in seconds
pub const DEFAULT_DB_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// LEASE STORE
// ============================================================================

/// Default lease store backend (`redis`, `local` or `disabled`)
pub const DEFAULT_LEASE_BACKEND: &str = "redis";

/// Connection and response timeout for the lease store in milliseconds
pub const DEFAULT_REDIS_TIMEOUT_MS: u64 = 2000;

/// Key prefix for cache entries written by the worker
pub const DEFAULT_CACHE_KEY_PREFIX: &str = "keel:";

// ============================================================================
// EXPIRING RECORD SWEEP
// ============================================================================

/// How often the cleanup task sweeps (1 hour)
pub const DEFAULT_SWEEP_CHECK_INTERVAL_SECS: u64 = 3600;

/// Ids fetched and deleted per batch
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 1000;

/// Pause between batches in milliseconds
pub const DEFAULT_SWEEP_PAUSE_MS: u64 = 100;

/// Lease TTL for one exclusive sweep (10 minutes)
pub const DEFAULT_SWEEP_LOCK_TTL_SECS: u64 = 600;

/// Lock name prefix for exclusive sweeps
pub const SWEEP_LOCK_PREFIX: &str = "cleanup-";

// ============================================================================
// BILLING
// ============================================================================

/// Cache key prefix for the cached subscription snapshot
pub const SUBSCRIPTION_CACHE_PREFIX: &str = "subscription:";

/// Cache key prefix for the cached effective plan
pub const USER_PLAN_CACHE_PREFIX: &str = "user-plan:";

// ============================================================================
// TELEMETRY
// ============================================================================

/// Default service name reported in logs
pub const DEFAULT_SERVICE_NAME: &str = "keel-worker";

/// Default `EnvFilter` directive when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "keel_worker=debug,keel_coord=debug,info";
