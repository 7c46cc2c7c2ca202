//! # The House - Engine Facade
//!
//! **The Only Door Into the Economy**
//!
//! [`TheHouse`] owns every table in the building: the token ledger, the
//! stock book, the raffle book, the arcade desk, the prize resolver, the
//! vault handle and the journal. The storefront layer calls the operations
//! here and nothing else; no component is reachable around the facade.
//!
//! ## The golden path
//!
//! ```text
//! purchase(user, sku, quantity, order)
//!        |
//!        v
//! +------------+   +------------+   +------------+   +------------+
//! |   stock    |-->|   ledger   |-->|  resolver  |-->|   stock    |
//! |  reserve   |   |   debit    |   | draw batch |   |   commit   |
//! +------------+   +------------+   +------------+   +------------+
//!                                                          |
//!                                                          v
//! +------------+   +------------+   +------------+
//! |  receipt   |<--|  journal   |<--|   vault    |
//! |  + events  |   |   commit   |   |   grant    |
//! +------------+   +------------+   +------------+
//! ```
//!
//! ## Durability rules
//!
//! - Pack purchases mutate memory first and journal last. The journal
//!   transaction is the durability point; if the append fails, the facade
//!   unwinds stock and tokens before the error escapes. Nothing was
//!   journaled, so recovery never sees the aborted order.
//! - Slot purchases journal inside the raffle lock, before the slots are
//!   assigned in memory. A crash can lose an acknowledgement, never a sold
//!   slot.
//! - Credits (deposits, refunds, consolations, minigame rewards) journal
//!   first and apply second. Replay skips any that also landed.
//!
//! ## Recovery
//!
//! [`TheHouse::open`] replays every committed journal transaction before
//! taking traffic, rebuilding balances, sold stock, raffle boards, order
//! receipts and vault grants. A transaction that cannot be applied refuses
//! the open; a journal that cannot be believed is worse than downtime.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use midas_shared::{
    EngineEvent, OrderId, RaffleId, SessionId, SkuId, SlotIndex, UserId,
    DEFAULT_REAPER_INTERVAL_MS, DEFAULT_RESERVATION_TTL_MS, DEFAULT_RETRY_ATTEMPTS,
    DEFAULT_RETRY_BACKOFF_MS, DEFAULT_SESSION_MAX_AGE_MS, MAX_SLOTS_PER_ORDER,
    MAX_UNITS_PER_PURCHASE,
};

use crate::arcade::{ArcadeDesk, GameType, SessionEvent, SessionOutcome};
use crate::catalog::{Catalog, RaffleDef, SkuDef};
use crate::error::{EngineError, EngineResult};
use crate::journal::{Journal, JournalOp, JournalStats};
use crate::ledger::{now_ms, EntryKind, LedgerReason, LedgerRef, TokenLedger};
use crate::prize::{GrantedItem, PrizePool, PrizeResolver};
use crate::raffle::{RaffleBook, RaffleStatus, SettlementOutcome, SettlementResult};
use crate::stock::StockBook;
use crate::vault::{GrantRef, Vault};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Retry policy for operations that hit a transient conflict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first try included.
    pub max_attempts: u32,
    /// Base backoff between attempts, multiplied by the attempt number.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

/// Startup knobs for [`TheHouse`]. Built with the `with_` methods; every
/// default comes from [`midas_shared::constants`].
#[derive(Clone, Debug)]
pub struct HouseConfig {
    journal_path: PathBuf,
    reservation_ttl_ms: u64,
    reaper_interval_ms: u64,
    session_max_age_ms: u64,
    retry: RetryPolicy,
    rng_seed: Option<[u8; 32]>,
}

impl HouseConfig {
    /// Configuration with defaults, journaling at `journal_path`.
    pub fn new(journal_path: impl Into<PathBuf>) -> Self {
        Self {
            journal_path: journal_path.into(),
            reservation_ttl_ms: DEFAULT_RESERVATION_TTL_MS,
            reaper_interval_ms: DEFAULT_REAPER_INTERVAL_MS,
            session_max_age_ms: DEFAULT_SESSION_MAX_AGE_MS,
            retry: RetryPolicy::default(),
            rng_seed: None,
        }
    }

    /// Overrides how long stock reservations and slot holds stay valid.
    #[must_use]
    pub fn with_reservation_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.reservation_ttl_ms = ttl_ms;
        self
    }

    /// Overrides the reaper sweep interval.
    #[must_use]
    pub fn with_reaper_interval_ms(mut self, interval_ms: u64) -> Self {
        self.reaper_interval_ms = interval_ms;
        self
    }

    /// Overrides how long an unsubmitted minigame session survives.
    #[must_use]
    pub fn with_session_max_age_ms(mut self, max_age_ms: u64) -> Self {
        self.session_max_age_ms = max_age_ms;
        self
    }

    /// Overrides the transient-conflict retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fixes the draw RNG seed. Test builds only; production draws seed
    /// from OS entropy.
    #[must_use]
    pub fn with_rng_seed(mut self, seed: [u8; 32]) -> Self {
        self.rng_seed = Some(seed);
        self
    }
}

// =============================================================================
// RECEIPTS
// =============================================================================

/// Receipt for a completed pack purchase. Stored per order id; re-sending
/// the order returns the same receipt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurchaseReceipt {
    /// Client order id.
    pub order: OrderId,
    /// The buyer.
    pub user: UserId,
    /// The SKU purchased.
    pub sku: SkuId,
    /// Units purchased.
    pub quantity: u32,
    /// Tokens charged.
    pub cost: u64,
    /// Items granted, one batch across all units.
    pub items: Vec<GrantedItem>,
}

/// Receipt for a completed raffle slot purchase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotsReceipt {
    /// Client order id.
    pub order: OrderId,
    /// The buyer.
    pub user: UserId,
    /// The raffle.
    pub raffle: RaffleId,
    /// First assigned slot index; the assignment is contiguous.
    pub first_slot: SlotIndex,
    /// Slots assigned.
    pub count: u32,
    /// Tokens charged.
    pub cost: u64,
}

/// A completed order. Pack and slot purchases share one order-id namespace;
/// re-sending an id with the other shape is a conflict, not a replay.
enum OrderRecord {
    Pack(PurchaseReceipt),
    Slots(SlotsReceipt),
}

// =============================================================================
// SNAPSHOTS AND STATS
// =============================================================================

/// Point-in-time view of one raffle, for display.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RaffleSnapshot {
    /// Lifecycle status.
    pub status: RaffleStatus,
    /// Slots sold.
    pub filled: u32,
    /// Slots still on sale.
    pub remaining: u32,
}

/// Counters for an operations dashboard.
#[derive(Clone, Copy, Debug)]
pub struct HouseStats {
    /// Journal writer counters.
    pub journal: JournalStats,
    /// Journal file size in bytes.
    pub journal_bytes: u64,
    /// Draws resolved since open.
    pub total_draws: u64,
    /// Accounts with ledger history.
    pub accounts: usize,
    /// Events waiting to be drained.
    pub pending_events: usize,
}

// =============================================================================
// THE HOUSE
// =============================================================================

/// The engine facade. One instance per catalog; thread-safe throughout,
/// every operation takes `&self`.
pub struct TheHouse {
    /// SKU definitions, indexed by id.
    skus: HashMap<SkuId, SkuDef>,
    /// Compiled prize pools, one per SKU.
    pools: HashMap<SkuId, PrizePool>,
    /// Raffle definitions, indexed by id.
    raffle_defs: HashMap<RaffleId, RaffleDef>,
    /// Token accounts.
    ledger: TokenLedger,
    /// Finite stock with reservations.
    stock: Arc<StockBook>,
    /// Raffle boards with slot holds.
    raffles: Arc<RaffleBook>,
    /// Minigame sessions.
    arcade: Arc<ArcadeDesk>,
    /// Draw RNG.
    resolver: PrizeResolver,
    /// Item delivery.
    vault: Arc<dyn Vault>,
    /// Crash-safe operation log.
    journal: Journal,
    /// Completed orders, both purchase shapes in one namespace.
    orders: Mutex<HashMap<OrderId, OrderRecord>>,
    /// Buffered events for the storefront to drain.
    events: Mutex<Vec<EngineEvent>>,
    /// Retry policy for transient buyer-path conflicts.
    retry: RetryPolicy,
    /// TTL applied to stock reservations and slot holds.
    reservation_ttl_ms: u64,
    /// Sessions older than this are swept.
    session_max_age_ms: u64,
    /// Tells the reaper thread to stop.
    reaper_stop: Sender<()>,
    /// Reaper thread handle, joined on drop.
    reaper_handle: Option<JoinHandle<()>>,
}

impl TheHouse {
    /// Opens the house: validates the catalog, replays the journal and
    /// starts the reaper.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidConfig`] for a bad catalog,
    /// [`EngineError::Journal`] when the journal cannot be opened or a
    /// committed transaction cannot be replayed. A refused open leaves the
    /// journal file untouched.
    pub fn open(
        catalog: Catalog,
        config: HouseConfig,
        vault: Arc<dyn Vault>,
    ) -> EngineResult<Self> {
        catalog.validate()?;

        let stock = Arc::new(StockBook::new(&catalog.skus));
        let raffles = Arc::new(RaffleBook::new(&catalog.raffles));
        let arcade = Arc::new(ArcadeDesk::new(catalog.minigames));

        let mut skus = HashMap::with_capacity(catalog.skus.len());
        let mut pools = HashMap::with_capacity(catalog.skus.len());
        for sku in catalog.skus {
            pools.insert(sku.id, PrizePool::compile(&sku.pool, sku.guaranteed_all)?);
            skus.insert(sku.id, sku);
        }
        let mut raffle_defs = HashMap::with_capacity(catalog.raffles.len());
        for def in catalog.raffles {
            raffle_defs.insert(def.id, def);
        }

        let resolver = match config.rng_seed {
            Some(seed) => PrizeResolver::with_seed(seed),
            None => PrizeResolver::new(),
        };

        let ledger = TokenLedger::new();
        let (journal, recovery) = Journal::open(&config.journal_path)?;

        let mut orders = HashMap::new();
        let replayed = recovery.transactions.len();

        // Session ids are memory-only, but their reward references are not;
        // the counter must resume past any id already burned into the ledger
        // or a new session's payout would be swallowed as a replay.
        let last_rewarded_session = recovery
            .transactions
            .iter()
            .flatten()
            .filter_map(|op| match op {
                JournalOp::TokenMutation {
                    reference: LedgerRef::Session(session),
                    ..
                } => Some(*session),
                _ => None,
            })
            .max();

        Self::replay(
            &ledger,
            &stock,
            &raffles,
            vault.as_ref(),
            &mut orders,
            recovery.transactions,
        )?;

        if let Some(session) = last_rewarded_session {
            arcade.resume_after(session);
        }

        if recovery.discarded > 0 || recovery.truncated_bytes > 0 {
            tracing::warn!(
                "journal tail damage: {} uncommitted transactions dropped, {} bytes truncated",
                recovery.discarded,
                recovery.truncated_bytes
            );
        }
        if replayed > 0 {
            tracing::info!(
                "journal replay: {} transactions restored, {} orders rebuilt",
                replayed,
                orders.len()
            );
        }

        let (reaper_stop, stop_rx) = bounded::<()>(1);
        let reaper_handle = {
            let stock = Arc::clone(&stock);
            let raffles = Arc::clone(&raffles);
            let arcade = Arc::clone(&arcade);
            let interval_ms = config.reaper_interval_ms;
            let session_max_age_ms = config.session_max_age_ms;
            std::thread::spawn(move || {
                Self::reaper_loop(
                    &stock,
                    &raffles,
                    &arcade,
                    interval_ms,
                    session_max_age_ms,
                    &stop_rx,
                );
            })
        };

        Ok(Self {
            skus,
            pools,
            raffle_defs,
            ledger,
            stock,
            raffles,
            arcade,
            resolver,
            vault,
            journal,
            orders: Mutex::new(orders),
            events: Mutex::new(Vec::with_capacity(256)),
            retry: config.retry,
            reservation_ttl_ms: config.reservation_ttl_ms,
            session_max_age_ms: config.session_max_age_ms,
            reaper_stop,
            reaper_handle: Some(reaper_handle),
        })
    }

    /// Applies committed journal transactions to empty components.
    fn replay(
        ledger: &TokenLedger,
        stock: &StockBook,
        raffles: &RaffleBook,
        vault: &dyn Vault,
        orders: &mut HashMap<OrderId, OrderRecord>,
        transactions: Vec<Vec<JournalOp>>,
    ) -> EngineResult<()> {
        for txn in transactions {
            // Settlement records carry no stamp of their own; the credits
            // committed alongside them do.
            let stamp = txn
                .iter()
                .find_map(|op| match op {
                    JournalOp::TokenMutation { at_ms, .. } => Some(*at_ms),
                    _ => None,
                })
                .unwrap_or_default();

            // A slot debit precedes its SlotsCommit within a transaction;
            // carry the order id and cost forward to rebuild the receipt.
            let mut slot_charge: Option<(OrderId, u64)> = None;

            for op in txn {
                match op {
                    JournalOp::TokenMutation {
                        user,
                        delta,
                        reason,
                        reference,
                        at_ms,
                    } => {
                        if reason == LedgerReason::SlotPurchase {
                            if let LedgerRef::Order(order) = reference {
                                slot_charge = Some((order, delta.unsigned_abs()));
                            }
                        }
                        ledger.replay_mutation(user, delta, reason, reference, at_ms)?;
                    }
                    JournalOp::StockCommit { sku, quantity } => {
                        stock.replay_commit(sku, quantity)?;
                    }
                    JournalOp::SlotsCommit {
                        raffle,
                        user,
                        first_slot,
                        count,
                    } => {
                        raffles.replay_slots(raffle, user, first_slot, count)?;
                        if let Some((order, cost)) = slot_charge.take() {
                            orders.insert(
                                order,
                                OrderRecord::Slots(SlotsReceipt {
                                    order,
                                    user,
                                    raffle,
                                    first_slot,
                                    count,
                                    cost,
                                }),
                            );
                        }
                    }
                    JournalOp::RaffleClosed { raffle } => raffles.replay_close(raffle)?,
                    JournalOp::RaffleSettled {
                        raffle,
                        winning_slots,
                    } => {
                        let wins = raffles.replay_settle(raffle, &winning_slots, stamp)?;
                        for win in wins {
                            let prize = GrantedItem {
                                item: win.item,
                                tier: win.tier,
                            };
                            vault.grant(
                                win.user,
                                GrantRef::RafflePrize {
                                    raffle,
                                    position: win.position,
                                },
                                &[prize],
                            )?;
                        }
                    }
                    JournalOp::RaffleCancelled { raffle } => {
                        raffles.replay_cancel(raffle, stamp)?;
                    }
                    JournalOp::OrderFulfilled {
                        order,
                        user,
                        sku,
                        quantity,
                        cost,
                        items,
                    } => {
                        vault.grant(user, GrantRef::Order(order), &items)?;
                        orders.insert(
                            order,
                            OrderRecord::Pack(PurchaseReceipt {
                                order,
                                user,
                                sku,
                                quantity,
                                cost,
                                items,
                            }),
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Reaper thread body: sweep expired holds and stale sessions until
    /// told to stop.
    fn reaper_loop(
        stock: &StockBook,
        raffles: &RaffleBook,
        arcade: &ArcadeDesk,
        interval_ms: u64,
        session_max_age_ms: u64,
        stop: &Receiver<()>,
    ) {
        let interval = Duration::from_millis(interval_ms);
        loop {
            match stop.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            let now = now_ms();
            let stock_swept = stock.sweep_expired(now).len();
            let slots_swept = raffles.sweep_expired(now).len();
            let sessions_swept = arcade.sweep_stale(now, session_max_age_ms);
            if stock_swept + slots_swept + sessions_swept > 0 {
                tracing::debug!(
                    "reaper: {} stock holds, {} slot holds, {} sessions expired",
                    stock_swept,
                    slots_swept,
                    sessions_swept
                );
            }
        }
    }

    // ==== Liquidity ====

    /// Credits tokens reported by the payment gateway. Idempotent by
    /// `receipt`: re-delivering the same receipt credits nothing and
    /// returns the current balance.
    ///
    /// The credit is journaled before it lands, so a crash between the two
    /// replays it rather than losing it.
    ///
    /// # Errors
    ///
    /// [`EngineError::ArithmeticOverflow`] when the amount cannot be
    /// represented, [`EngineError::Journal`] when the append fails (the
    /// balance is left untouched).
    pub fn deposit_tokens(&self, user: UserId, amount: u64, receipt: u64) -> EngineResult<u64> {
        let reference = LedgerRef::Deposit(receipt);
        if self.ledger.is_applied(user, EntryKind::Credit, reference) {
            return Ok(self.ledger.balance_of(user));
        }
        let delta = i64::try_from(amount).map_err(|_| EngineError::ArithmeticOverflow)?;

        self.journal.commit(&[JournalOp::TokenMutation {
            user,
            delta,
            reason: LedgerReason::Deposit,
            reference,
            at_ms: now_ms(),
        }])?;

        let applied = self
            .ledger
            .credit(user, amount, LedgerReason::Deposit, reference)?;
        if applied.is_fresh() {
            self.events
                .lock()
                .push(EngineEvent::TokensDeposited { user, amount });
        }
        Ok(applied.balance())
    }

    // ==== Pack purchases ====

    /// Buys `quantity` units of a SKU, drawing one prize per unit (or the
    /// whole pool per unit for guaranteed-all SKUs). Exactly-once by
    /// `order`: a re-sent order returns the stored receipt without charging
    /// again.
    ///
    /// Transient conflicts retry under the configured [`RetryPolicy`]
    /// before surfacing.
    ///
    /// # Errors
    ///
    /// [`EngineError::SkuNotFound`] for unknown or inactive SKUs,
    /// [`EngineError::InvalidQuantity`] outside `1..=MAX_UNITS_PER_PURCHASE`,
    /// [`EngineError::StockExhausted`] when remaining stock cannot cover the
    /// order, [`EngineError::InsufficientFunds`] when the balance cannot,
    /// [`EngineError::OrderConflict`] when the order id was used for a slot
    /// purchase, [`EngineError::Busy`] when the same order is mid-flight on
    /// another thread and retries ran out. Every failure leaves balances and
    /// stock as they were.
    pub fn purchase(
        &self,
        user: UserId,
        sku: SkuId,
        quantity: u32,
        order: OrderId,
    ) -> EngineResult<PurchaseReceipt> {
        self.with_retry(|| self.purchase_once(user, sku, quantity, order))
    }

    fn purchase_once(
        &self,
        user: UserId,
        sku: SkuId,
        quantity: u32,
        order: OrderId,
    ) -> EngineResult<PurchaseReceipt> {
        if let Some(receipt) = self.stored_pack_receipt(order)? {
            return Ok(receipt);
        }

        let def = self.skus.get(&sku).ok_or(EngineError::SkuNotFound(sku))?;
        if !def.active {
            return Err(EngineError::SkuNotFound(sku));
        }
        if quantity == 0 || quantity > MAX_UNITS_PER_PURCHASE {
            return Err(EngineError::InvalidQuantity {
                requested: u64::from(quantity),
                max: u64::from(MAX_UNITS_PER_PURCHASE),
            });
        }
        let cost = def
            .price_tokens
            .checked_mul(u64::from(quantity))
            .ok_or(EngineError::ArithmeticOverflow)?;
        let delta = i64::try_from(cost).map_err(|_| EngineError::ArithmeticOverflow)?;

        let now = now_ms();
        let hold = self
            .stock
            .try_reserve(sku, user, quantity, now, self.reservation_ttl_ms)?;

        // Charge against the hold. A failed debit frees the units at once
        // instead of waiting out the TTL.
        let applied = match self
            .ledger
            .debit(user, cost, LedgerReason::Purchase, LedgerRef::Order(order))
        {
            Ok(applied) => applied,
            Err(e) => {
                self.stock.release(hold, now);
                return Err(e);
            }
        };
        if !applied.is_fresh() {
            // Same order racing on another thread; that thread owns the
            // charge and will store the receipt.
            self.stock.release(hold, now);
            return Err(EngineError::Busy("order in flight"));
        }

        // Draws run outside every lock.
        let pool = self.pools.get(&sku).ok_or(EngineError::SkuNotFound(sku))?;
        let items = self.resolver.draw_batch(pool, quantity);

        let sale = match self.stock.commit(hold, now_ms()) {
            Ok(sale) => sale,
            Err(e) => {
                self.refund_order(user, cost, order);
                return Err(e);
            }
        };

        // Vault before journal: an order is journaled only once its items
        // are deliverable, so recovery never sees a half-done order.
        if let Err(e) = self.vault.grant(user, GrantRef::Order(order), &items) {
            self.stock.restore_units(sku, quantity);
            self.refund_order(user, cost, order);
            return Err(e);
        }

        let committed_at = now_ms();
        if let Err(e) = self.journal.commit(&[
            JournalOp::TokenMutation {
                user,
                delta: -delta,
                reason: LedgerReason::Purchase,
                reference: LedgerRef::Order(order),
                at_ms: committed_at,
            },
            JournalOp::StockCommit { sku, quantity },
            JournalOp::OrderFulfilled {
                order,
                user,
                sku,
                quantity,
                cost,
                items: items.clone(),
            },
        ]) {
            // The grant cannot be taken back; flag it for reconciliation
            // and unwind the rest.
            self.stock.restore_units(sku, quantity);
            self.refund_order(user, cost, order);
            tracing::error!(
                "journal append failed, order {} refunded but its vault grant stands: {}",
                order,
                e
            );
            return Err(e);
        }

        let receipt = PurchaseReceipt {
            order,
            user,
            sku,
            quantity,
            cost,
            items,
        };
        self.orders
            .lock()
            .insert(order, OrderRecord::Pack(receipt.clone()));

        let mut events = self.events.lock();
        events.push(EngineEvent::PurchaseCompleted {
            user,
            sku,
            quantity,
            order,
            cost,
        });
        // Depletion is flagged by the commit that sells the last unit; a
        // level check here would fire once per racing buyer.
        if sale.depleted {
            events.push(EngineEvent::StockDepleted { sku });
        }
        drop(events);

        Ok(receipt)
    }

    // ==== Raffles ====

    /// Buys `count` consecutive slots in a raffle. Exactly-once by `order`,
    /// same contract as [`TheHouse::purchase`]. Filling the last slot
    /// closes the raffle in the same step.
    ///
    /// # Errors
    ///
    /// [`EngineError::RaffleNotFound`], [`EngineError::InvalidQuantity`]
    /// outside `1..=MAX_SLOTS_PER_ORDER`, [`EngineError::RaffleNotOpen`]
    /// once closed, [`EngineError::SlotsExhausted`] when fewer slots remain,
    /// [`EngineError::InsufficientFunds`], [`EngineError::OrderConflict`]
    /// when the order id was used for a pack purchase, and
    /// [`EngineError::Busy`] when the raffle lock stayed contended through
    /// every retry.
    pub fn buy_slots(
        &self,
        user: UserId,
        raffle: RaffleId,
        count: u32,
        order: OrderId,
    ) -> EngineResult<SlotsReceipt> {
        self.with_retry(|| self.buy_slots_once(user, raffle, count, order))
    }

    fn buy_slots_once(
        &self,
        user: UserId,
        raffle: RaffleId,
        count: u32,
        order: OrderId,
    ) -> EngineResult<SlotsReceipt> {
        if let Some(receipt) = self.stored_slots_receipt(order)? {
            return Ok(receipt);
        }

        let def = self
            .raffle_defs
            .get(&raffle)
            .ok_or(EngineError::RaffleNotFound(raffle))?;
        if count == 0 || count > MAX_SLOTS_PER_ORDER {
            return Err(EngineError::InvalidQuantity {
                requested: u64::from(count),
                max: u64::from(MAX_SLOTS_PER_ORDER),
            });
        }
        let cost = def
            .tokens_per_slot
            .checked_mul(u64::from(count))
            .ok_or(EngineError::ArithmeticOverflow)?;
        let delta = i64::try_from(cost).map_err(|_| EngineError::ArithmeticOverflow)?;

        let now = now_ms();
        let hold = self
            .raffles
            .hold_slots(raffle, user, count, now, self.reservation_ttl_ms)?;

        let applied = match self.ledger.debit(
            user,
            cost,
            LedgerReason::SlotPurchase,
            LedgerRef::Order(order),
        ) {
            Ok(applied) => applied,
            Err(e) => {
                self.raffles.release_slots(hold, now);
                return Err(e);
            }
        };
        if !applied.is_fresh() {
            self.raffles.release_slots(hold, now);
            return Err(EngineError::Busy("order in flight"));
        }

        // The journal write runs under the raffle lock, before the slots
        // are assigned in memory. Sold slots are always on disk.
        let committed = match self.raffles.commit_slots_with(hold, now_ms(), |c| {
            self.journal
                .commit(&[
                    JournalOp::TokenMutation {
                        user,
                        delta: -delta,
                        reason: LedgerReason::SlotPurchase,
                        reference: LedgerRef::Order(order),
                        at_ms: now,
                    },
                    JournalOp::SlotsCommit {
                        raffle: c.raffle,
                        user: c.user,
                        first_slot: c.first_slot,
                        count: c.count,
                    },
                ])
                .map(|_| ())
        }) {
            Ok(committed) => committed,
            Err(e) => {
                self.raffles.release_slots(hold, now_ms());
                self.refund_order(user, cost, order);
                return Err(e);
            }
        };

        let receipt = SlotsReceipt {
            order,
            user,
            raffle,
            first_slot: committed.first_slot,
            count: committed.count,
            cost,
        };
        self.orders.lock().insert(order, OrderRecord::Slots(receipt));

        let mut events = self.events.lock();
        events.push(EngineEvent::SlotsPurchased {
            user,
            raffle,
            count: committed.count,
            first_slot: committed.first_slot,
        });
        if committed.auto_closed {
            events.push(EngineEvent::RaffleClosed {
                raffle,
                filled: def.total_slots,
            });
        }
        drop(events);

        Ok(receipt)
    }

    /// Closes a raffle to further slot sales, ahead of its natural fill.
    /// Idempotent; closing a closed raffle reports the same fill count.
    ///
    /// Returns the number of slots sold at close time.
    ///
    /// # Errors
    ///
    /// [`EngineError::RaffleNotFound`], [`EngineError::RaffleNotOpen`] once
    /// settled or cancelled, [`EngineError::Journal`] when the close record
    /// cannot be appended (the raffle keeps selling).
    pub fn close_raffle(&self, raffle: RaffleId) -> EngineResult<u32> {
        let report = self.raffles.close_with(raffle, |_| {
            self.journal
                .commit(&[JournalOp::RaffleClosed { raffle }])
                .map(|_| ())
        })?;
        if report.fresh {
            self.events.lock().push(EngineEvent::RaffleClosed {
                raffle,
                filled: report.filled,
            });
        }
        Ok(report.filled)
    }

    /// Settles a closed raffle: draws distinct winning slots, pays
    /// consolations to the losers and delivers prizes, or refunds every
    /// slot under a cancel-refund deadline policy. Idempotent; settling a
    /// settled raffle returns the stored result and moves nothing.
    ///
    /// The settlement record and every credit it implies are journaled in
    /// one transaction before any balance moves.
    ///
    /// # Errors
    ///
    /// [`EngineError::RaffleNotFound`], [`EngineError::RaffleNotClosed`]
    /// while the raffle is still selling, [`EngineError::Journal`] when the
    /// append fails (the raffle stays closed and settleable).
    pub fn settle_raffle(&self, raffle: RaffleId) -> EngineResult<SettlementResult> {
        let (result, plan) = self.raffles.settle(
            raffle,
            now_ms(),
            |filled, prizes| self.resolver.pick_distinct(filled, prizes),
            |result, plan| {
                let mut ops = Vec::with_capacity(1 + plan.credits.len());
                ops.push(match result.outcome {
                    SettlementOutcome::Drawn => JournalOp::RaffleSettled {
                        raffle,
                        winning_slots: plan.winning_slots.clone(),
                    },
                    SettlementOutcome::Cancelled => JournalOp::RaffleCancelled { raffle },
                });
                for credit in &plan.credits {
                    ops.push(JournalOp::TokenMutation {
                        user: credit.user,
                        delta: i64::try_from(credit.amount)
                            .map_err(|_| EngineError::ArithmeticOverflow)?,
                        reason: credit.reason,
                        reference: credit.reference,
                        at_ms: result.settled_at_ms,
                    });
                }
                self.journal.commit(&ops).map(|_| ())
            },
        )?;

        // A stored result means an earlier settlement already paid out.
        let Some(plan) = plan else {
            return Ok(result);
        };

        // Credits and grants land after the journal record. Both are
        // idempotent, so a crash in between replays to the same end state.
        // On the fresh path a credit can never have landed already; one that
        // has means the ledger and journal disagree.
        for credit in &plan.credits {
            let applied = self
                .ledger
                .credit(credit.user, credit.amount, credit.reason, credit.reference)?;
            if !applied.is_fresh() {
                tracing::warn!(
                    "settlement credit {} for user {} was already on the books",
                    credit.reference,
                    credit.user
                );
            }
        }
        for win in &result.winners {
            let prize = GrantedItem {
                item: win.item,
                tier: win.tier,
            };
            if let Err(e) = self.vault.grant(
                win.user,
                GrantRef::RafflePrize {
                    raffle,
                    position: win.position,
                },
                &[prize],
            ) {
                tracing::error!(
                    "prize delivery failed for raffle {} position {}: {}",
                    raffle,
                    win.position,
                    e
                );
            }
        }

        self.events.lock().push(match result.outcome {
            SettlementOutcome::Drawn => EngineEvent::RaffleSettled {
                raffle,
                winners: result.winners.len() as u32,
                consolations: result.consolations,
            },
            SettlementOutcome::Cancelled => EngineEvent::RaffleCancelled {
                raffle,
                refunded: result.filled,
            },
        });

        Ok(result)
    }

    // ==== Arcade ====

    /// Opens a minigame session for a user.
    pub fn start_session(&self, user: UserId, game: GameType) -> SessionId {
        self.arcade.start_session(user, game, now_ms())
    }

    /// Records one gameplay event. Returns the running score.
    ///
    /// # Errors
    ///
    /// [`EngineError::SessionNotFound`] for unknown or submitted sessions,
    /// [`EngineError::InvalidSessionEvent`] when the event does not belong
    /// to the session's game or the event cap is hit.
    pub fn record_event(&self, session: SessionId, event: SessionEvent) -> EngineResult<u32> {
        self.arcade.record_event(session, event)
    }

    /// Submits a session for grading. The session is consumed; the reward
    /// for its tier, if any reached, is journaled and credited.
    ///
    /// # Errors
    ///
    /// [`EngineError::SessionNotFound`] when the session does not exist or
    /// was already submitted, [`EngineError::Journal`] when the reward
    /// cannot be journaled (the session is still consumed; the reward is
    /// lost with it, by policy).
    pub fn submit_session(&self, session: SessionId) -> EngineResult<SessionOutcome> {
        let outcome = self.arcade.submit_session(session)?;

        if outcome.tokens > 0 {
            let reference = LedgerRef::Session(outcome.session);
            let delta =
                i64::try_from(outcome.tokens).map_err(|_| EngineError::ArithmeticOverflow)?;
            self.journal.commit(&[JournalOp::TokenMutation {
                user: outcome.user,
                delta,
                reason: LedgerReason::MinigameReward,
                reference,
                at_ms: now_ms(),
            }])?;
            let applied = self.ledger.credit(
                outcome.user,
                outcome.tokens,
                LedgerReason::MinigameReward,
                reference,
            )?;
            if !applied.is_fresh() {
                tracing::warn!(
                    "session {} reward was already on the books",
                    outcome.session
                );
            }
        }

        self.events.lock().push(EngineEvent::SessionRewarded {
            user: outcome.user,
            session: outcome.session,
            tier: outcome.tier,
            tokens: outcome.tokens,
        });

        Ok(outcome)
    }

    // ==== Queries and maintenance ====

    /// Current token balance. Unknown users read as zero.
    #[must_use]
    pub fn balance_of(&self, user: UserId) -> u64 {
        self.ledger.balance_of(user)
    }

    /// Units of a SKU still available for sale, `None` for unknown SKUs.
    #[must_use]
    pub fn remaining_units(&self, sku: SkuId) -> Option<u32> {
        self.stock.remaining_units(sku)
    }

    /// Status, fill and remaining slots of a raffle.
    #[must_use]
    pub fn raffle_snapshot(&self, raffle: RaffleId) -> Option<RaffleSnapshot> {
        Some(RaffleSnapshot {
            status: self.raffles.status(raffle)?,
            filled: self.raffles.filled(raffle)?,
            remaining: self.raffles.remaining_slots(raffle)?,
        })
    }

    /// Stored settlement result, once a raffle has one.
    #[must_use]
    pub fn settlement_of(&self, raffle: RaffleId) -> Option<SettlementResult> {
        self.raffles.settlement(raffle)
    }

    /// Everything the vault holds for a user.
    #[must_use]
    pub fn holdings(&self, user: UserId) -> Vec<GrantedItem> {
        self.vault.holdings(user)
    }

    /// Drains the buffered events. Each event is delivered exactly once,
    /// to whoever drains first.
    pub fn drain_events(&self) -> Vec<EngineEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Events waiting to be drained.
    #[must_use]
    pub fn pending_event_count(&self) -> usize {
        self.events.lock().len()
    }

    /// Runs one reaper sweep immediately. Returns expired stock holds,
    /// slot holds and sessions, in that order.
    pub fn sweep_now(&self) -> (usize, usize, usize) {
        let now = now_ms();
        let stock_swept = self.stock.sweep_expired(now).len();
        let slots_swept = self.raffles.sweep_expired(now).len();
        let sessions_swept = self.arcade.sweep_stale(now, self.session_max_age_ms);
        (stock_swept, slots_swept, sessions_swept)
    }

    /// Re-adds every account's entries and compares against its balance.
    /// Returns the users whose accounts disagree; an empty list is the
    /// healthy answer.
    #[must_use]
    pub fn reconcile_all(&self) -> Vec<UserId> {
        self.ledger.reconcile_all()
    }

    /// Counters for an operations dashboard.
    ///
    /// # Errors
    ///
    /// [`EngineError::Journal`] when the journal file size cannot be read.
    pub fn stats(&self) -> EngineResult<HouseStats> {
        Ok(HouseStats {
            journal: self.journal.stats(),
            journal_bytes: self.journal.file_bytes()?,
            total_draws: self.resolver.total_draws(),
            accounts: self.ledger.account_count(),
            pending_events: self.events.lock().len(),
        })
    }

    // ==== Internals ====

    /// Runs an operation, retrying transient failures under the configured
    /// policy with linear backoff.
    fn with_retry<T>(&self, mut op: impl FnMut() -> EngineResult<T>) -> EngineResult<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    tracing::debug!("transient conflict on attempt {}: {}", attempt, e);
                    std::thread::sleep(Duration::from_millis(
                        self.retry.backoff_ms.saturating_mul(u64::from(attempt)),
                    ));
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Looks up a completed pack order.
    fn stored_pack_receipt(&self, order: OrderId) -> EngineResult<Option<PurchaseReceipt>> {
        match self.orders.lock().get(&order) {
            Some(OrderRecord::Pack(receipt)) => Ok(Some(receipt.clone())),
            Some(OrderRecord::Slots(_)) => Err(EngineError::OrderConflict(order)),
            None => Ok(None),
        }
    }

    /// Looks up a completed slot order.
    fn stored_slots_receipt(&self, order: OrderId) -> EngineResult<Option<SlotsReceipt>> {
        match self.orders.lock().get(&order) {
            Some(OrderRecord::Slots(receipt)) => Ok(Some(*receipt)),
            Some(OrderRecord::Pack(_)) => Err(EngineError::OrderConflict(order)),
            None => Ok(None),
        }
    }

    /// Returns a charge and retires its debit key so the order may retry.
    fn refund_order(&self, user: UserId, amount: u64, order: OrderId) {
        if let Err(e) = self
            .ledger
            .compensate(user, amount, LedgerRef::Order(order))
        {
            tracing::error!("compensation failed for order {}: {}", order, e);
        }
    }
}

// The vault is a trait object with no Debug bound; summarize the books
// instead of walking the components.
impl core::fmt::Debug for TheHouse {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TheHouse")
            .field("skus", &self.skus.len())
            .field("raffles", &self.raffle_defs.len())
            .field("accounts", &self.ledger.account_count())
            .field("live_sessions", &self.arcade.session_count())
            .finish_non_exhaustive()
    }
}

impl Drop for TheHouse {
    fn drop(&mut self) {
        let _ = self.reaper_stop.send(());
        if let Some(handle) = self.reaper_handle.take() {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
