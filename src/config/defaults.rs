//! Default constants for identirust configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Network Defaults
// =============================================================================

/// Default HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3000";

// =============================================================================
// Storage Defaults (RocksDB)
// =============================================================================

/// Number of contacts kept in the persistent store's read cache
pub const DEFAULT_CACHE_CAPACITY: usize = 100_000;

// =============================================================================
// Reconciliation Defaults
// =============================================================================

/// How long a reconciliation waits for its email/phone/cluster locks (milliseconds)
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// How many times a reconciliation re-reads its match set when the clusters
/// it touches change while it waits for their locks
pub const DEFAULT_MAX_LOCK_RETRIES: u32 = 8;
