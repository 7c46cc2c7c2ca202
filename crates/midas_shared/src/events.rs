//! Engine event stream.
//!
//! Every state change worth showing a user produces one of these. The engine
//! buffers them; the storefront layer drains the buffer once per frame (or
//! poll) and turns events into toasts, reveal animations and stock banners.
//! Events are informational only. Dropping them loses no money and no stock.

use crate::ids::{OrderId, RaffleId, SessionId, SkuId, SlotIndex, UserId};
use crate::tiers::Tier;
use serde::{Deserialize, Serialize};

/// Event type discriminator
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Tokens credited from a payment-gateway receipt
    TokensDeposited = 0,
    /// A purchase completed and prizes were granted
    PurchaseCompleted = 1,
    /// A SKU's remaining stock reached zero
    StockDepleted = 2,
    /// Raffle slots were assigned
    SlotsPurchased = 3,
    /// A raffle stopped taking entries
    RaffleClosed = 4,
    /// A raffle settled with winners drawn
    RaffleSettled = 5,
    /// A raffle was cancelled and its slots refunded
    RaffleCancelled = 6,
    /// A minigame session was submitted and graded
    SessionRewarded = 7,
}

/// Events emitted by the engine for the storefront layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// Tokens arrived from the payment gateway.
    TokensDeposited {
        /// Credited user
        user: UserId,
        /// Tokens credited
        amount: u64,
    },

    /// A purchase went through end to end.
    PurchaseCompleted {
        /// Buying user
        user: UserId,
        /// Purchased SKU
        sku: SkuId,
        /// Units bought
        quantity: u32,
        /// Client order id
        order: OrderId,
        /// Tokens charged
        cost: u64,
    },

    /// Stock for a SKU just hit zero.
    StockDepleted {
        /// The SKU that sold out
        sku: SkuId,
    },

    /// Raffle slots were bought and assigned.
    SlotsPurchased {
        /// Buying user
        user: UserId,
        /// The raffle
        raffle: RaffleId,
        /// Slots assigned
        count: u32,
        /// First assigned slot index (they are contiguous)
        first_slot: SlotIndex,
    },

    /// A raffle filled up or was closed by the operator.
    RaffleClosed {
        /// The raffle
        raffle: RaffleId,
        /// Slots filled at close time
        filled: u32,
    },

    /// A raffle drew its winners.
    RaffleSettled {
        /// The raffle
        raffle: RaffleId,
        /// Winning slots drawn
        winners: u32,
        /// Consolation credits paid
        consolations: u32,
    },

    /// A raffle was cancelled under its deadline policy.
    RaffleCancelled {
        /// The raffle
        raffle: RaffleId,
        /// Slots refunded
        refunded: u32,
    },

    /// A minigame session was graded.
    SessionRewarded {
        /// Playing user
        user: UserId,
        /// The session
        session: SessionId,
        /// Earned tier, if the score reached the ladder
        tier: Option<Tier>,
        /// Tokens credited for the tier
        tokens: u64,
    },
}

impl EngineEvent {
    /// Returns the event kind
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::TokensDeposited { .. } => EventKind::TokensDeposited,
            Self::PurchaseCompleted { .. } => EventKind::PurchaseCompleted,
            Self::StockDepleted { .. } => EventKind::StockDepleted,
            Self::SlotsPurchased { .. } => EventKind::SlotsPurchased,
            Self::RaffleClosed { .. } => EventKind::RaffleClosed,
            Self::RaffleSettled { .. } => EventKind::RaffleSettled,
            Self::RaffleCancelled { .. } => EventKind::RaffleCancelled,
            Self::SessionRewarded { .. } => EventKind::SessionRewarded,
        }
    }

    /// Returns the user this event concerns (if it concerns one)
    #[must_use]
    pub const fn user(&self) -> Option<UserId> {
        match self {
            Self::TokensDeposited { user, .. }
            | Self::PurchaseCompleted { user, .. }
            | Self::SlotsPurchased { user, .. }
            | Self::SessionRewarded { user, .. } => Some(*user),
            Self::StockDepleted { .. }
            | Self::RaffleClosed { .. }
            | Self::RaffleSettled { .. }
            | Self::RaffleCancelled { .. } => None,
        }
    }
}
