//! Engine tuning constants.
//!
//! Defaults for the knobs `HouseConfig` exposes, plus hard sanity caps that
//! are not configurable at all.
//!
//! **CRITICAL:** the caps exist to bound worst-case work per request.
//! Raising them is a review-level decision, not a config edit.

// =============================================================================
// RESERVATION LIFECYCLE
// =============================================================================

/// How long a pending stock reservation or slot hold stays valid.
///
/// Long enough to cover a payment round-trip, short enough that abandoned
/// checkouts hand their stock back quickly.
pub const DEFAULT_RESERVATION_TTL_MS: u64 = 30_000;

/// Interval between reaper sweeps for expired reservations.
pub const DEFAULT_REAPER_INTERVAL_MS: u64 = 5_000;

/// How long terminal (committed/released) reservation records are retained
/// before the reaper garbage-collects them. Retention exists so that late
/// release calls stay recognizably idempotent.
pub const RESERVATION_GC_AGE_MS: u64 = 3_600_000;

/// How long an unsubmitted minigame session survives before the reaper
/// drops it. Walking away from a board forfeits the run.
pub const DEFAULT_SESSION_MAX_AGE_MS: u64 = 1_800_000;

// =============================================================================
// RETRY POLICY
// =============================================================================

/// Attempts for an operation that hit a transient conflict.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Base backoff between retry attempts, multiplied by the attempt number.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 10;

/// Longest the buyer path waits on a contended raffle lock. Slot commits
/// hold their raffle's lock across a journal fsync, so waiters cap the
/// wait and report a transient busy instead of queueing behind the disk.
pub const RAFFLE_LOCK_WAIT_MS: u64 = 50;

// =============================================================================
// HARD CAPS
// =============================================================================

/// Maximum units in a single purchase order.
pub const MAX_UNITS_PER_PURCHASE: u32 = 10;

/// Maximum raffle slots in a single order.
pub const MAX_SLOTS_PER_ORDER: u32 = 25;

/// Maximum recorded events per minigame session.
pub const MAX_SESSION_EVENTS: u32 = 256;
