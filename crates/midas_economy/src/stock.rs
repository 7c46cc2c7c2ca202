//! # Stock Book
//!
//! Finite stock with reserve/commit/release semantics. One lock per SKU;
//! there is no global stock lock and no cross-SKU index.
//!
//! ## Reservation lifecycle
//!
//! ```text
//!                try_reserve                 commit
//!   remaining ---------------> Pending ---------------> Committed
//!        ^                       |                    (units gone for good)
//!        |      release / TTL    |
//!        +-----------------------+
//!              (units restored)
//! ```
//!
//! `try_reserve` is the only gate: it atomically checks and decrements
//! `remaining` under the SKU's lock, so overselling cannot happen no matter
//! how many threads race. Running dry is an expected signal
//! ([`crate::error::EngineError::StockExhausted`]), not a fault.
//!
//! Reservation ids encode their SKU in the high 32 bits, which is how
//! commit and release route straight to the owning lock.
//!
//! ## Invariant
//!
//! Per SKU, at all times:
//! `remaining + committed + sum(pending quantities) == total`.

use std::collections::HashMap;

use midas_shared::{ReservationId, SkuId, UserId, RESERVATION_GC_AGE_MS};
use parking_lot::Mutex;

use crate::catalog::SkuDef;
use crate::error::{EngineError, EngineResult};

/// Reservation state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReservationStatus {
    /// Holding units, waiting for commit or death.
    Pending,
    /// Units permanently sold. Terminal.
    Committed,
    /// Units handed back. Terminal.
    Released,
}

/// One reservation record.
#[derive(Clone, Copy, Debug)]
pub struct Reservation {
    /// The reservation handle.
    pub id: ReservationId,
    /// The SKU it holds units of.
    pub sku: SkuId,
    /// The reserving user.
    pub user: UserId,
    /// Units held.
    pub quantity: u32,
    /// Current state.
    pub status: ReservationStatus,
    /// When a Pending reservation stops being honored.
    pub expires_at_ms: u64,
    /// When the reservation went terminal (0 while Pending); drives GC.
    pub done_at_ms: u64,
}

/// Outcome of a commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Committed {
    /// The SKU the units came from.
    pub sku: SkuId,
    /// Units sold.
    pub quantity: u32,
    /// False when the reservation was already committed (idempotent replay).
    pub fresh: bool,
    /// True when this commit sold the SKU's last unit. Only a fresh commit
    /// can set it, so it fires once per sell-out even under racing buyers.
    pub depleted: bool,
}

/// Per-SKU state, all mutated under one lock.
struct SkuStock {
    total: u32,
    remaining: u32,
    committed: u32,
    next_seq: u32,
    reservations: HashMap<ReservationId, Reservation>,
}

/// The stock book: fixed SKU set, one lock per SKU.
pub struct StockBook {
    skus: HashMap<SkuId, Mutex<SkuStock>>,
}

impl StockBook {
    /// Builds the book from catalog definitions. The SKU set is fixed for
    /// the life of the book; there is no runtime catalog mutation.
    #[must_use]
    pub fn new(skus: &[SkuDef]) -> Self {
        let skus = skus
            .iter()
            .map(|def| {
                (
                    def.id,
                    Mutex::new(SkuStock {
                        total: def.total_units,
                        remaining: def.total_units,
                        committed: 0,
                        next_seq: 1,
                        reservations: HashMap::new(),
                    }),
                )
            })
            .collect();
        Self { skus }
    }

    /// Atomically checks and decrements remaining units, recording a
    /// Pending reservation that expires at `now_ms + ttl_ms`.
    ///
    /// # Errors
    ///
    /// [`EngineError::SkuNotFound`] for an unknown SKU,
    /// [`EngineError::StockExhausted`] when fewer than `quantity` units
    /// remain.
    pub fn try_reserve(
        &self,
        sku: SkuId,
        user: UserId,
        quantity: u32,
        now_ms: u64,
        ttl_ms: u64,
    ) -> EngineResult<ReservationId> {
        let mut stock = self
            .skus
            .get(&sku)
            .ok_or(EngineError::SkuNotFound(sku))?
            .lock();

        if stock.remaining < quantity {
            return Err(EngineError::StockExhausted {
                sku,
                requested: quantity,
                remaining: stock.remaining,
            });
        }

        stock.remaining -= quantity;
        let id = encode_id(sku, stock.next_seq);
        stock.next_seq = stock.next_seq.wrapping_add(1);
        stock.reservations.insert(
            id,
            Reservation {
                id,
                sku,
                user,
                quantity,
                status: ReservationStatus::Pending,
                expires_at_ms: now_ms.saturating_add(ttl_ms),
                done_at_ms: 0,
            },
        );
        Ok(id)
    }

    /// Makes a reservation's decrement permanent.
    ///
    /// Committing an already-committed reservation reports `fresh: false`
    /// and changes nothing. The commit that sells a SKU's last unit, and
    /// only that one, comes back `depleted: true`.
    ///
    /// # Errors
    ///
    /// [`EngineError::ReservationExpired`] when the reservation aged out
    /// (its units go back on the shelf right here, even if the reaper has
    /// not swept yet), was already released, or is gone entirely.
    /// [`EngineError::SkuNotFound`] when the id does not route to any SKU.
    pub fn commit(&self, id: ReservationId, now_ms: u64) -> EngineResult<Committed> {
        let sku = decode_sku(id);
        let mut stock = self
            .skus
            .get(&sku)
            .ok_or(EngineError::SkuNotFound(sku))?
            .lock();

        let Some(resv) = stock.reservations.get(&id).copied() else {
            return Err(EngineError::ReservationExpired(id));
        };

        match resv.status {
            ReservationStatus::Committed => Ok(Committed {
                sku,
                quantity: resv.quantity,
                fresh: false,
                depleted: false,
            }),
            ReservationStatus::Released => Err(EngineError::ReservationExpired(id)),
            ReservationStatus::Pending => {
                if now_ms > resv.expires_at_ms {
                    stock.remaining += resv.quantity;
                    if let Some(stored) = stock.reservations.get_mut(&id) {
                        stored.status = ReservationStatus::Released;
                        stored.done_at_ms = now_ms;
                    }
                    return Err(EngineError::ReservationExpired(id));
                }
                stock.committed += resv.quantity;
                // Edge-detected under the lock: committed reaches total at
                // most once per sell-out (a journal unwind re-arms it).
                let depleted = stock.committed == stock.total;
                if let Some(stored) = stock.reservations.get_mut(&id) {
                    stored.status = ReservationStatus::Committed;
                    stored.done_at_ms = now_ms;
                }
                Ok(Committed {
                    sku,
                    quantity: resv.quantity,
                    fresh: true,
                    depleted,
                })
            }
        }
    }

    /// Hands a Pending reservation's units back. Idempotent: releasing a
    /// terminal or unknown reservation is a no-op, and releasing never
    /// restores units twice.
    pub fn release(&self, id: ReservationId, now_ms: u64) {
        let sku = decode_sku(id);
        let Some(stock) = self.skus.get(&sku) else {
            return;
        };
        let mut stock = stock.lock();
        if let Some(resv) = stock.reservations.get(&id).copied() {
            if resv.status == ReservationStatus::Pending {
                stock.remaining += resv.quantity;
                if let Some(stored) = stock.reservations.get_mut(&id) {
                    stored.status = ReservationStatus::Released;
                    stored.done_at_ms = now_ms;
                }
            }
        }
    }

    /// Releases every expired Pending reservation and garbage-collects
    /// terminal records older than [`RESERVATION_GC_AGE_MS`]. Returns the
    /// ids released by this sweep. Called by the reaper; takes `now_ms` so
    /// tests can drive time.
    pub fn sweep_expired(&self, now_ms: u64) -> Vec<ReservationId> {
        let mut swept = Vec::new();
        for stock in self.skus.values() {
            let mut stock = stock.lock();

            let expired: Vec<Reservation> = stock
                .reservations
                .values()
                .filter(|r| r.status == ReservationStatus::Pending && now_ms > r.expires_at_ms)
                .copied()
                .collect();
            for resv in expired {
                stock.remaining += resv.quantity;
                if let Some(stored) = stock.reservations.get_mut(&resv.id) {
                    stored.status = ReservationStatus::Released;
                    stored.done_at_ms = now_ms;
                }
                swept.push(resv.id);
            }

            stock.reservations.retain(|_, r| {
                r.status == ReservationStatus::Pending
                    || now_ms.saturating_sub(r.done_at_ms) < RESERVATION_GC_AGE_MS
            });
        }
        swept
    }

    /// Units still on the shelf.
    #[must_use]
    pub fn remaining_units(&self, sku: SkuId) -> Option<u32> {
        self.skus.get(&sku).map(|s| s.lock().remaining)
    }

    /// Units permanently sold.
    #[must_use]
    pub fn committed_units(&self, sku: SkuId) -> Option<u32> {
        self.skus.get(&sku).map(|s| s.lock().committed)
    }

    /// Total units this SKU launched with.
    #[must_use]
    pub fn total_units(&self, sku: SkuId) -> Option<u32> {
        self.skus.get(&sku).map(|s| s.lock().total)
    }

    /// Snapshot of one reservation, if it is still tracked.
    #[must_use]
    pub fn reservation(&self, id: ReservationId) -> Option<Reservation> {
        let sku = decode_sku(id);
        self.skus
            .get(&sku)
            .and_then(|s| s.lock().reservations.get(&id).copied())
    }

    /// Checks the stock invariant on every SKU. Returns the SKUs where
    /// `remaining + committed + pending != total`; empty means the book is
    /// internally consistent.
    #[must_use]
    pub fn audit(&self) -> Vec<SkuId> {
        let mut broken = Vec::new();
        for (sku, stock) in &self.skus {
            let stock = stock.lock();
            let pending: u64 = stock
                .reservations
                .values()
                .filter(|r| r.status == ReservationStatus::Pending)
                .map(|r| u64::from(r.quantity))
                .sum();
            let accounted = u64::from(stock.remaining) + u64::from(stock.committed) + pending;
            if accounted != u64::from(stock.total) {
                broken.push(*sku);
            }
        }
        broken
    }

    /// Journal recovery path: re-applies a committed sale without a
    /// reservation ever existing.
    pub(crate) fn replay_commit(&self, sku: SkuId, quantity: u32) -> EngineResult<()> {
        let mut stock = self
            .skus
            .get(&sku)
            .ok_or_else(|| EngineError::Journal(format!("replay names unknown sku {sku}")))?
            .lock();
        if stock.remaining < quantity {
            return Err(EngineError::Journal(format!(
                "replay oversells sku {sku}: {} remaining, {quantity} committed",
                stock.remaining
            )));
        }
        stock.remaining -= quantity;
        stock.committed += quantity;
        Ok(())
    }

    /// Unwind path for a journal append that failed after a commit: puts
    /// the units back on the shelf.
    pub(crate) fn restore_units(&self, sku: SkuId, quantity: u32) {
        if let Some(stock) = self.skus.get(&sku) {
            let mut stock = stock.lock();
            stock.remaining = stock.remaining.saturating_add(quantity).min(stock.total);
            stock.committed = stock.committed.saturating_sub(quantity);
        }
    }
}

const fn encode_id(sku: SkuId, seq: u32) -> ReservationId {
    ((sku as u64) << 32) | seq as u64
}

const fn decode_sku(id: ReservationId) -> SkuId {
    (id >> 32) as SkuId
}
