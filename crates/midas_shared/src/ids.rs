//! Identifier aliases used across the engine.
//!
//! All identifiers are plain integers. The storefront layer above the engine
//! owns the mapping to whatever public-facing ids it exposes; the engine
//! never parses or derives meaning from an id, with one exception: handles
//! minted by the engine itself (reservations, holds) may encode routing
//! bits, and those are documented where they are minted.

/// A user account. Issued by the auth layer; the engine trusts it as-is.
pub type UserId = u64;

/// A sellable catalog entry (one pack product, one box break, ...).
pub type SkuId = u32;

/// A concrete item that can be granted to a user (one card, one sealed pack).
pub type ItemId = u32;

/// A raffle in the catalog.
pub type RaffleId = u32;

/// Index of a slot within one raffle. Assigned sequentially from zero.
pub type SlotIndex = u32;

/// Client-supplied idempotency key for a purchase or slot order.
///
/// Replays of the same order id are answered from the fulfilled-order record
/// instead of being executed again.
pub type OrderId = u64;

/// Handle for a pending stock reservation or raffle slot hold.
///
/// Minted by the engine; opaque to callers.
pub type ReservationId = u64;

/// A minigame session. Minted by the engine, ephemeral.
pub type SessionId = u64;
