//! # MIDAS Shared
//!
//! Common types used by the loot-economy engine and the storefront layer
//! embedding it.
//!
//! ## CRITICAL RULE
//!
//! This crate must NEVER contain:
//! - locks or any other synchronization
//! - file or network I/O
//! - business logic of any kind
//!
//! If a type needs behaviour beyond plain accessors, it belongs in
//! `midas_economy`.

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod constants;
pub mod events;
pub mod ids;
pub mod tiers;

pub use constants::{
    DEFAULT_REAPER_INTERVAL_MS, DEFAULT_RESERVATION_TTL_MS, DEFAULT_RETRY_ATTEMPTS,
    DEFAULT_RETRY_BACKOFF_MS, DEFAULT_SESSION_MAX_AGE_MS, MAX_SESSION_EVENTS, MAX_SLOTS_PER_ORDER,
    MAX_UNITS_PER_PURCHASE, RAFFLE_LOCK_WAIT_MS, RESERVATION_GC_AGE_MS,
};
pub use events::{EngineEvent, EventKind};
pub use ids::{ItemId, OrderId, RaffleId, ReservationId, SessionId, SkuId, SlotIndex, UserId};
pub use tiers::Tier;
