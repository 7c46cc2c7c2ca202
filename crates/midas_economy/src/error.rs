//! # Engine Error Types
//!
//! All errors that can cross the engine boundary.
//!
//! Two of these are *expected signals*, not faults: `StockExhausted` and
//! `SlotsExhausted` fire constantly on a popular drop and the storefront
//! renders them as "sold out". `Busy` is transient and retried inside the
//! facade before a caller ever sees it. Everything else is a real refusal.

use midas_shared::{OrderId, RaffleId, ReservationId, SessionId, SkuId, UserId};
use thiserror::Error;

use crate::raffle::RaffleStatus;

/// Errors that can occur in the loot economy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// SKU is not in the catalog or is switched off.
    #[error("sku not found or inactive: {0}")]
    SkuNotFound(SkuId),

    /// Raffle is not in the catalog.
    #[error("raffle not found: {0}")]
    RaffleNotFound(RaffleId),

    /// Minigame session does not exist (or was already submitted).
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// Requested unit count is zero or above the per-order cap.
    #[error("quantity {requested} outside 1..={max}")]
    InvalidQuantity {
        /// Units the caller asked for.
        requested: u64,
        /// Largest count a single order may carry.
        max: u64,
    },

    /// Not enough units left to reserve. Expected under contention.
    #[error("stock exhausted: sku {sku} has {remaining} left, requested {requested}")]
    StockExhausted {
        /// The SKU that ran dry.
        sku: SkuId,
        /// Units requested.
        requested: u32,
        /// Units actually remaining.
        remaining: u32,
    },

    /// Not enough raffle slots left to hold. Expected under contention.
    #[error("slots exhausted: raffle {raffle} has {remaining} open, requested {requested}")]
    SlotsExhausted {
        /// The raffle that filled up.
        raffle: RaffleId,
        /// Slots requested.
        requested: u32,
        /// Slots actually open.
        remaining: u32,
    },

    /// Balance cannot cover the charge. Fail closed, never negative.
    #[error("insufficient funds: user {user} has {balance}, needs {needed}")]
    InsufficientFunds {
        /// The account that came up short.
        user: UserId,
        /// Tokens required.
        needed: u64,
        /// Tokens available.
        balance: u64,
    },

    /// Reservation or hold aged out before commit.
    #[error("reservation expired: {0}")]
    ReservationExpired(ReservationId),

    /// Order id was already used for a different kind of purchase.
    #[error("order {0} already exists with a different shape")]
    OrderConflict(OrderId),

    /// Operation requires an open raffle.
    #[error("raffle {raffle} is {status}, not open")]
    RaffleNotOpen {
        /// The raffle.
        raffle: RaffleId,
        /// Its actual status.
        status: RaffleStatus,
    },

    /// Settlement requires a closed raffle.
    #[error("raffle {raffle} is {status}, not closed")]
    RaffleNotClosed {
        /// The raffle.
        raffle: RaffleId,
        /// Its actual status.
        status: RaffleStatus,
    },

    /// Session event does not fit the session's game (or exceeds its board).
    #[error("invalid event for session {0}")]
    InvalidSessionEvent(SessionId),

    /// Catalog failed validation. Only ever raised at load time.
    #[error("invalid catalog: {0}")]
    InvalidConfig(String),

    /// Transient contention; safe to retry the whole operation.
    #[error("busy: {0}, try again")]
    Busy(&'static str),

    /// Integer overflow in a token calculation.
    #[error("arithmetic overflow in token calculation")]
    ArithmeticOverflow,

    /// Journal I/O or corruption problem.
    #[error("journal: {0}")]
    Journal(String),

    /// Vault collaborator refused a deposit after payment was taken.
    #[error("vault unavailable: {0}")]
    VaultUnavailable(String),
}

impl EngineError {
    /// True for errors the facade retries internally before surfacing.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::Busy("journal").is_transient());
        assert!(!EngineError::SkuNotFound(1).is_transient());
        assert!(!EngineError::InsufficientFunds {
            user: 1,
            needed: 100,
            balance: 50
        }
        .is_transient());
    }

    #[test]
    fn test_error_messages_carry_numbers() {
        let err = EngineError::StockExhausted {
            sku: 9,
            requested: 3,
            remaining: 1,
        };
        let text = err.to_string();
        assert!(text.contains('9'));
        assert!(text.contains('3'));
        assert!(text.contains('1'));
    }
}
