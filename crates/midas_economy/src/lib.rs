//! # MIDAS Economy Engine
//!
//! Server-authoritative loot economy for the MIDAS storefront: tokens,
//! finite stock, weighted gacha draws, raffles and arcade rewards.
//!
//! ## Design Principles
//!
//! 1. **The server is the only source of truth** - Clients send intents;
//!    balances, stock and odds live here and nowhere else
//! 2. **Integer math for money** - Token amounts are `u64`; floats appear
//!    only as catalog weights, compiled once into cumulative tables
//! 3. **Exactly-once by idempotency key** - Orders, deposits, refunds and
//!    rewards replay by key instead of applying twice
//! 4. **Journal before acknowledge** - Every durable mutation is a journal
//!    transaction; recovery replays the file into identical state
//! 5. **External configuration** - Prices, pools, boards and ladders load
//!    from TOML and validate before the engine takes traffic
//!
//! ## Thread Safety
//!
//! Every operation takes `&self`; one [`TheHouse`] instance serves all
//! request threads. Client-side calculations are untrusted and ignored.
//!
//! ## Example
//!
//! ```rust,ignore
//! use midas_economy::{Catalog, HouseConfig, MemoryVault, TheHouse};
//! use std::sync::Arc;
//!
//! let catalog = Catalog::load("data/catalog.toml".as_ref())?;
//! let house = TheHouse::open(
//!     catalog,
//!     HouseConfig::new("data/midas.journal"),
//!     Arc::new(MemoryVault::new()),
//! )?;
//!
//! house.deposit_tokens(user, 1_000, gateway_receipt)?;
//! let receipt = house.purchase(user, sku, 2, order)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod arcade;
pub mod catalog;
pub mod error;
pub mod journal;
pub mod ledger;
pub mod prize;
pub mod raffle;
pub mod stock;
pub mod vault;

pub use arcade::{ArcadeDesk, GameRules, GameType, SessionEvent, SessionOutcome};
pub use catalog::{Catalog, PoolEntry, RaffleDef, RafflePrizeDef, SkuDef};
pub use error::{EngineError, EngineResult};
pub use journal::{Journal, JournalOp, JournalStats, Recovery};
pub use ledger::{Applied, EntryKind, LedgerEntry, LedgerReason, LedgerRef, TokenLedger};
pub use prize::{DrawStatistics, GrantedItem, PrizePool, PrizeResolver};
pub use raffle::{
    DeadlinePolicy, RaffleBook, RaffleStatus, SettlementOutcome, SettlementResult, SlotWin,
};
pub use stock::{Committed, Reservation, ReservationStatus, StockBook};
pub use vault::{GrantRef, MemoryVault, Vault};
pub mod house;

pub use house::{
    HouseConfig, HouseStats, PurchaseReceipt, RaffleSnapshot, RetryPolicy, SlotsReceipt, TheHouse,
};
