//! # Raffle Book
//!
//! Slot-based raffles with the same reserve/commit shape as stock. One lock
//! per raffle; slot holds encode their raffle in the high id bits the same
//! way stock reservations encode their SKU.
//!
//! ## Lifecycle
//!
//! ```text
//!   Open --(last slot sells, or manual close)--> Closed --settle--> Settled
//!                                                   |
//!                                                   +--settle, short fill,
//!                                                      cancel_refund policy--> Cancelled
//! ```
//!
//! Slots are assigned sequentially in commit order, so a raffle's sold
//! slots are always exactly `0..filled` with no gaps. Holds reserve
//! capacity, not indices; an abandoned hold releases capacity without
//! leaving a hole.
//!
//! Settlement is idempotent by raffle id: the first settle draws and
//! records the outcome, every later settle returns the recorded outcome
//! untouched. The draw itself is injected by the caller so the RNG stays
//! in one place ([`crate::prize::PrizeResolver`]).
//!
//! ## Persistence hooks
//!
//! Slot sales, closes, and settlements are irreversible the moment their
//! raffle lock drops (the next buyer builds on top of them), so the
//! mutating calls take a `persist` closure and run it *under the lock*,
//! before the change lands in memory. A failed hook leaves the raffle
//! exactly as it was.

use std::collections::HashMap;
use std::time::Duration;

use midas_shared::{
    ItemId, RaffleId, ReservationId, SlotIndex, Tier, UserId, RAFFLE_LOCK_WAIT_MS,
    RESERVATION_GC_AGE_MS,
};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::catalog::RaffleDef;
use crate::error::{EngineError, EngineResult};
use crate::ledger::{LedgerReason, LedgerRef};
use crate::stock::ReservationStatus;

/// Where a raffle is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RaffleStatus {
    /// Selling slots.
    Open = 0,
    /// No longer selling, not yet settled.
    Closed = 1,
    /// Winners drawn and recorded. Terminal.
    Settled = 2,
    /// Ended without a draw, stakes refunded. Terminal.
    Cancelled = 3,
}

impl std::fmt::Display for RaffleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Settled => "settled",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

/// What settlement does with a raffle that closed short of full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlinePolicy {
    /// Void the raffle and refund every sold slot. The safe default.
    #[default]
    CancelRefund,
    /// Draw among the sold slots only; fewer entrants, same prizes.
    SettlePartial,
}

/// One prize landing on one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotWin {
    /// Prize position, `1` is the headline prize.
    pub position: u32,
    /// The winning slot.
    pub slot: SlotIndex,
    /// The slot's owner.
    pub user: UserId,
    /// Item delivered.
    pub item: ItemId,
    /// Tier label of the prize.
    pub tier: Tier,
}

/// How a settlement ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// Winners were drawn.
    Drawn,
    /// The raffle was voided and refunded.
    Cancelled,
}

/// The permanent record of one settlement.
#[derive(Clone, Debug, PartialEq)]
pub struct SettlementResult {
    /// The raffle.
    pub raffle: RaffleId,
    /// How it ended.
    pub outcome: SettlementOutcome,
    /// Slots that were sold when it closed.
    pub filled: u32,
    /// The winners, in prize-position order. Empty when cancelled.
    pub winners: Vec<SlotWin>,
    /// Consolation credits issued.
    pub consolations: u32,
    /// Total tokens refunded. Zero unless cancelled.
    pub refunded_total: u64,
    /// When settlement happened.
    pub settled_at_ms: u64,
}

/// One token credit a fresh settlement owes. The book computes these; the
/// facade journals and applies them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingCredit {
    /// Account to credit.
    pub user: UserId,
    /// Tokens owed.
    pub amount: u64,
    /// Ledger reason code.
    pub reason: LedgerReason,
    /// Idempotency reference for the ledger entry.
    pub reference: LedgerRef,
}

/// Side plan of a fresh settlement: what to journal and what to pay.
#[derive(Clone, Debug, PartialEq)]
pub struct SettlementPlan {
    /// Credits to apply, one per refunded or consoled slot.
    pub credits: Vec<PendingCredit>,
    /// The drawn slots in prize-position order. Empty when cancelled.
    pub winning_slots: Vec<SlotIndex>,
}

/// Outcome of a slot-hold commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotsCommitted {
    /// The raffle.
    pub raffle: RaffleId,
    /// The buyer.
    pub user: UserId,
    /// First slot assigned.
    pub first_slot: SlotIndex,
    /// Number of consecutive slots.
    pub count: u32,
    /// False when the hold was already committed (idempotent replay).
    pub fresh: bool,
    /// True when this commit sold the last slot and closed the raffle.
    pub auto_closed: bool,
}

/// Outcome of a close call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseReport {
    /// Slots sold at close.
    pub filled: u32,
    /// False when the raffle was already closed.
    pub fresh: bool,
}

/// A pending capacity hold.
#[derive(Clone, Copy, Debug)]
struct SlotHold {
    user: UserId,
    count: u32,
    status: ReservationStatus,
    first_slot: SlotIndex,
    expires_at_ms: u64,
    done_at_ms: u64,
}

/// Per-raffle state, mutated under one lock.
struct RaffleState {
    def: RaffleDef,
    status: RaffleStatus,
    /// Owner of each sold slot; index is the slot.
    slots: Vec<UserId>,
    /// Capacity held by pending holds.
    held: u32,
    next_hold_seq: u32,
    holds: HashMap<ReservationId, SlotHold>,
    settlement: Option<SettlementResult>,
}

/// The raffle book: fixed raffle set, one lock per raffle.
pub struct RaffleBook {
    raffles: HashMap<RaffleId, Mutex<RaffleState>>,
}

impl RaffleBook {
    /// Builds the book from catalog definitions. Prize lists are held
    /// sorted by position so draw order maps straight onto them.
    #[must_use]
    pub fn new(defs: &[RaffleDef]) -> Self {
        let raffles = defs
            .iter()
            .map(|def| {
                let mut def = def.clone();
                def.prizes.sort_by_key(|p| p.position);
                (
                    def.id,
                    Mutex::new(RaffleState {
                        def,
                        status: RaffleStatus::Open,
                        slots: Vec::new(),
                        held: 0,
                        next_hold_seq: 1,
                        holds: HashMap::new(),
                        settlement: None,
                    }),
                )
            })
            .collect();
        Self { raffles }
    }

    /// Atomically checks and holds capacity for `count` slots. Indices are
    /// not assigned until commit, so an abandoned hold leaves no gap.
    ///
    /// # Errors
    ///
    /// [`EngineError::RaffleNotFound`], [`EngineError::RaffleNotOpen`],
    /// [`EngineError::SlotsExhausted`] when fewer than `count` slots are
    /// free, or [`EngineError::Busy`] when the lock stayed contended past
    /// the bounded wait.
    pub fn hold_slots(
        &self,
        raffle: RaffleId,
        user: UserId,
        count: u32,
        now_ms: u64,
        ttl_ms: u64,
    ) -> EngineResult<ReservationId> {
        let mut state = self.lock_for_buyer(raffle)?;

        if state.status != RaffleStatus::Open {
            return Err(EngineError::RaffleNotOpen {
                raffle,
                status: state.status,
            });
        }

        let sold = state.slots.len() as u32;
        let remaining = state.def.total_slots - sold - state.held;
        if remaining < count {
            return Err(EngineError::SlotsExhausted {
                raffle,
                requested: count,
                remaining,
            });
        }

        state.held += count;
        let id = encode_hold(raffle, state.next_hold_seq);
        state.next_hold_seq = state.next_hold_seq.wrapping_add(1);
        state.holds.insert(
            id,
            SlotHold {
                user,
                count,
                status: ReservationStatus::Pending,
                first_slot: 0,
                expires_at_ms: now_ms.saturating_add(ttl_ms),
                done_at_ms: 0,
            },
        );
        Ok(id)
    }

    /// Turns held capacity into owned slots, assigned sequentially from
    /// the current fill point. Selling the last slot closes the raffle.
    ///
    /// `persist` runs under the raffle lock with the outcome this commit
    /// will produce; the slots only land in memory once it returns `Ok`.
    /// On a persist error the hold stays pending and the raffle is
    /// untouched, so the caller can release the hold and refund.
    ///
    /// # Errors
    ///
    /// [`EngineError::RaffleNotOpen`] when the raffle closed while the
    /// hold was pending (the hold stays pending; the caller releases it),
    /// [`EngineError::ReservationExpired`] when the hold aged out or is
    /// gone, [`EngineError::Busy`] when the lock stayed contended past
    /// the bounded wait, or whatever `persist` returned.
    pub fn commit_slots_with<P>(
        &self,
        id: ReservationId,
        now_ms: u64,
        persist: P,
    ) -> EngineResult<SlotsCommitted>
    where
        P: FnOnce(&SlotsCommitted) -> EngineResult<()>,
    {
        let raffle = decode_raffle(id);
        let mut state = self.lock_for_buyer(raffle)?;

        let Some(hold) = state.holds.get(&id).copied() else {
            return Err(EngineError::ReservationExpired(id));
        };

        match hold.status {
            ReservationStatus::Committed => Ok(SlotsCommitted {
                raffle,
                user: hold.user,
                first_slot: hold.first_slot,
                count: hold.count,
                fresh: false,
                auto_closed: false,
            }),
            ReservationStatus::Released => Err(EngineError::ReservationExpired(id)),
            ReservationStatus::Pending => {
                if state.status != RaffleStatus::Open {
                    return Err(EngineError::RaffleNotOpen {
                        raffle,
                        status: state.status,
                    });
                }
                if now_ms > hold.expires_at_ms {
                    state.held -= hold.count;
                    if let Some(stored) = state.holds.get_mut(&id) {
                        stored.status = ReservationStatus::Released;
                        stored.done_at_ms = now_ms;
                    }
                    return Err(EngineError::ReservationExpired(id));
                }

                let first_slot = state.slots.len() as u32;
                let committed = SlotsCommitted {
                    raffle,
                    user: hold.user,
                    first_slot,
                    count: hold.count,
                    fresh: true,
                    auto_closed: first_slot + hold.count == state.def.total_slots,
                };
                persist(&committed)?;

                state.held -= hold.count;
                for _ in 0..hold.count {
                    state.slots.push(hold.user);
                }
                if committed.auto_closed {
                    state.status = RaffleStatus::Closed;
                }
                if let Some(stored) = state.holds.get_mut(&id) {
                    stored.status = ReservationStatus::Committed;
                    stored.first_slot = first_slot;
                    stored.done_at_ms = now_ms;
                }
                Ok(committed)
            }
        }
    }

    /// [`commit_slots_with`](Self::commit_slots_with) without a
    /// persistence hook.
    ///
    /// # Errors
    ///
    /// Same as [`commit_slots_with`](Self::commit_slots_with).
    pub fn commit_slots(&self, id: ReservationId, now_ms: u64) -> EngineResult<SlotsCommitted> {
        self.commit_slots_with(id, now_ms, |_| Ok(()))
    }

    /// Releases a pending hold's capacity. Idempotent: terminal and
    /// unknown holds are no-ops.
    pub fn release_slots(&self, id: ReservationId, now_ms: u64) {
        let raffle = decode_raffle(id);
        let Some(state) = self.raffles.get(&raffle) else {
            return;
        };
        let mut state = state.lock();
        if let Some(hold) = state.holds.get(&id).copied() {
            if hold.status == ReservationStatus::Pending {
                state.held -= hold.count;
                if let Some(stored) = state.holds.get_mut(&id) {
                    stored.status = ReservationStatus::Released;
                    stored.done_at_ms = now_ms;
                }
            }
        }
    }

    /// Releases every expired pending hold and garbage-collects terminal
    /// hold records older than [`RESERVATION_GC_AGE_MS`]. Returns the ids
    /// released by this sweep.
    pub fn sweep_expired(&self, now_ms: u64) -> Vec<ReservationId> {
        let mut swept = Vec::new();
        for state in self.raffles.values() {
            let mut state = state.lock();

            let expired: Vec<(ReservationId, u32)> = state
                .holds
                .iter()
                .filter(|(_, h)| {
                    h.status == ReservationStatus::Pending && now_ms > h.expires_at_ms
                })
                .map(|(id, h)| (*id, h.count))
                .collect();
            for (id, count) in expired {
                state.held -= count;
                if let Some(stored) = state.holds.get_mut(&id) {
                    stored.status = ReservationStatus::Released;
                    stored.done_at_ms = now_ms;
                }
                swept.push(id);
            }

            state.holds.retain(|_, h| {
                h.status == ReservationStatus::Pending
                    || now_ms.saturating_sub(h.done_at_ms) < RESERVATION_GC_AGE_MS
            });
        }
        swept
    }

    /// Stops slot sales. Closing an already-closed raffle is a no-op and
    /// skips `persist`.
    ///
    /// `persist` runs under the raffle lock before the status flips, so a
    /// failed append leaves the raffle open and selling.
    ///
    /// Pending holds survive a close, but their commits will fail and be
    /// unwound by the purchase path; the capacity drains as they release
    /// or expire.
    ///
    /// # Errors
    ///
    /// [`EngineError::RaffleNotFound`], [`EngineError::RaffleNotOpen`]
    /// when the raffle already went terminal, or whatever `persist`
    /// returned.
    pub fn close_with<P>(&self, raffle: RaffleId, persist: P) -> EngineResult<CloseReport>
    where
        P: FnOnce(&CloseReport) -> EngineResult<()>,
    {
        let mut state = self.state(raffle)?.lock();
        match state.status {
            RaffleStatus::Open => {
                let report = CloseReport {
                    filled: state.slots.len() as u32,
                    fresh: true,
                };
                persist(&report)?;
                state.status = RaffleStatus::Closed;
                Ok(report)
            }
            RaffleStatus::Closed => Ok(CloseReport {
                filled: state.slots.len() as u32,
                fresh: false,
            }),
            status @ (RaffleStatus::Settled | RaffleStatus::Cancelled) => {
                Err(EngineError::RaffleNotOpen { raffle, status })
            }
        }
    }

    /// [`close_with`](Self::close_with) without a persistence hook.
    ///
    /// # Errors
    ///
    /// Same as [`close_with`](Self::close_with).
    pub fn close(&self, raffle: RaffleId) -> EngineResult<CloseReport> {
        self.close_with(raffle, |_| Ok(()))
    }

    /// Settles a closed raffle, holding its lock for the whole draw.
    ///
    /// The first call decides the outcome, runs `persist` with it, and
    /// returns it with a [`SettlementPlan`]; every later call returns the
    /// recorded result with no plan and no persist. `draw(n, k)` must
    /// return `k` distinct indices in `0..n`, in prize-position order.
    /// A persist error leaves the raffle closed with nothing recorded,
    /// so the next settle draws fresh.
    ///
    /// A raffle that closed short of full follows its
    /// [`DeadlinePolicy`]; a raffle with zero sold slots is cancelled
    /// outright under either policy.
    ///
    /// # Errors
    ///
    /// [`EngineError::RaffleNotFound`], [`EngineError::RaffleNotClosed`]
    /// while the raffle is still open, or whatever `persist` returned.
    pub fn settle<F, P>(
        &self,
        raffle: RaffleId,
        now_ms: u64,
        draw: F,
        persist: P,
    ) -> EngineResult<(SettlementResult, Option<SettlementPlan>)>
    where
        F: FnOnce(u32, u32) -> Vec<SlotIndex>,
        P: FnOnce(&SettlementResult, &SettlementPlan) -> EngineResult<()>,
    {
        let mut state = self.state(raffle)?.lock();

        match state.status {
            RaffleStatus::Open => {
                return Err(EngineError::RaffleNotClosed {
                    raffle,
                    status: state.status,
                });
            }
            RaffleStatus::Settled | RaffleStatus::Cancelled => {
                if let Some(result) = state.settlement.clone() {
                    return Ok((result, None));
                }
                // Terminal without a record cannot happen outside replay
                // bugs; treat it as corruption.
                return Err(EngineError::Journal(format!(
                    "raffle {raffle} is {} with no settlement record",
                    state.status
                )));
            }
            RaffleStatus::Closed => {}
        }

        let filled = state.slots.len() as u32;
        let partial = filled < state.def.total_slots;

        let (result, plan, settled_status) = if filled == 0
            || (partial && state.def.on_deadline == DeadlinePolicy::CancelRefund)
        {
            let credits: Vec<PendingCredit> = state
                .slots
                .iter()
                .enumerate()
                .map(|(slot, user)| PendingCredit {
                    user: *user,
                    amount: state.def.tokens_per_slot,
                    reason: LedgerReason::SlotRefund,
                    reference: LedgerRef::SlotRefund {
                        raffle,
                        slot: slot as u32,
                    },
                })
                .collect();
            let result = SettlementResult {
                raffle,
                outcome: SettlementOutcome::Cancelled,
                filled,
                winners: Vec::new(),
                consolations: 0,
                refunded_total: u64::from(filled).saturating_mul(state.def.tokens_per_slot),
                settled_at_ms: now_ms,
            };
            (
                result,
                SettlementPlan {
                    credits,
                    winning_slots: Vec::new(),
                },
                RaffleStatus::Cancelled,
            )
        } else {
            let k = (state.def.prizes.len() as u32).min(filled);
            let winning_slots = draw(filled, k);
            let winners = Self::map_winners(&state, &winning_slots);
            let credits = Self::consolation_credits(&state, raffle, &winning_slots);
            let result = SettlementResult {
                raffle,
                outcome: SettlementOutcome::Drawn,
                filled,
                winners,
                consolations: credits.len() as u32,
                refunded_total: 0,
                settled_at_ms: now_ms,
            };
            (
                result,
                SettlementPlan {
                    credits,
                    winning_slots,
                },
                RaffleStatus::Settled,
            )
        };

        persist(&result, &plan)?;

        state.status = settled_status;
        state.settlement = Some(result.clone());
        Ok((result, Some(plan)))
    }

    /// Current status.
    #[must_use]
    pub fn status(&self, raffle: RaffleId) -> Option<RaffleStatus> {
        self.raffles.get(&raffle).map(|s| s.lock().status)
    }

    /// Slots sold so far.
    #[must_use]
    pub fn filled(&self, raffle: RaffleId) -> Option<u32> {
        self.raffles.get(&raffle).map(|s| s.lock().slots.len() as u32)
    }

    /// Slots still purchasable (not sold, not held).
    #[must_use]
    pub fn remaining_slots(&self, raffle: RaffleId) -> Option<u32> {
        self.raffles.get(&raffle).map(|s| {
            let s = s.lock();
            s.def.total_slots - s.slots.len() as u32 - s.held
        })
    }

    /// Owner of a sold slot.
    #[must_use]
    pub fn slot_owner(&self, raffle: RaffleId, slot: SlotIndex) -> Option<UserId> {
        self.raffles
            .get(&raffle)
            .and_then(|s| s.lock().slots.get(slot as usize).copied())
    }

    /// The recorded settlement, if the raffle has gone terminal.
    #[must_use]
    pub fn settlement(&self, raffle: RaffleId) -> Option<SettlementResult> {
        self.raffles
            .get(&raffle)
            .and_then(|s| s.lock().settlement.clone())
    }

    /// Checks hold accounting on every raffle. Returns the raffles where
    /// `held` disagrees with the pending holds; empty means consistent.
    #[must_use]
    pub fn audit(&self) -> Vec<RaffleId> {
        let mut broken = Vec::new();
        for (raffle, state) in &self.raffles {
            let state = state.lock();
            let pending: u64 = state
                .holds
                .values()
                .filter(|h| h.status == ReservationStatus::Pending)
                .map(|h| u64::from(h.count))
                .sum();
            let overfilled = state.slots.len() as u32 > state.def.total_slots;
            if pending != u64::from(state.held) || overfilled {
                broken.push(*raffle);
            }
        }
        broken
    }

    /// Journal recovery: re-applies a slot sale. Slots must land exactly
    /// at the fill point, in journal order. Selling out closes the raffle
    /// here too; a full raffle never journals a separate close record.
    pub(crate) fn replay_slots(
        &self,
        raffle: RaffleId,
        user: UserId,
        first_slot: SlotIndex,
        count: u32,
    ) -> EngineResult<()> {
        let mut state = self
            .raffles
            .get(&raffle)
            .ok_or_else(|| EngineError::Journal(format!("replay names unknown raffle {raffle}")))?
            .lock();
        if state.status != RaffleStatus::Open {
            return Err(EngineError::Journal(format!(
                "replay sells slots on {} raffle {raffle}",
                state.status
            )));
        }
        if state.slots.len() as u32 != first_slot
            || first_slot + count > state.def.total_slots
        {
            return Err(EngineError::Journal(format!(
                "replay slot mismatch on raffle {raffle}: {} sold, journal says {first_slot}+{count}",
                state.slots.len()
            )));
        }
        for _ in 0..count {
            state.slots.push(user);
        }
        if state.slots.len() as u32 == state.def.total_slots {
            state.status = RaffleStatus::Closed;
        }
        Ok(())
    }

    /// Journal recovery: re-applies a close.
    pub(crate) fn replay_close(&self, raffle: RaffleId) -> EngineResult<()> {
        let mut state = self
            .raffles
            .get(&raffle)
            .ok_or_else(|| EngineError::Journal(format!("replay names unknown raffle {raffle}")))?
            .lock();
        if state.status != RaffleStatus::Open {
            return Err(EngineError::Journal(format!(
                "replay closes {} raffle {raffle}",
                state.status
            )));
        }
        state.status = RaffleStatus::Closed;
        Ok(())
    }

    /// Journal recovery: re-applies a settlement draw. Returns the winners
    /// so the caller can re-grant vault items idempotently.
    pub(crate) fn replay_settle(
        &self,
        raffle: RaffleId,
        winning_slots: &[SlotIndex],
        settled_at_ms: u64,
    ) -> EngineResult<Vec<SlotWin>> {
        let mut state = self
            .raffles
            .get(&raffle)
            .ok_or_else(|| EngineError::Journal(format!("replay names unknown raffle {raffle}")))?
            .lock();
        if state.status != RaffleStatus::Closed {
            return Err(EngineError::Journal(format!(
                "replay settles {} raffle {raffle}",
                state.status
            )));
        }
        let filled = state.slots.len() as u32;
        let k = (state.def.prizes.len() as u32).min(filled);
        if winning_slots.len() as u32 != k
            || winning_slots.iter().any(|&s| s >= filled)
        {
            return Err(EngineError::Journal(format!(
                "replay draw does not fit raffle {raffle}: {winning_slots:?} over {filled} slots"
            )));
        }

        let winners = Self::map_winners(&state, winning_slots);
        let consolations = if state.def.consolation_tokens > 0 {
            filled - k
        } else {
            0
        };
        state.status = RaffleStatus::Settled;
        state.settlement = Some(SettlementResult {
            raffle,
            outcome: SettlementOutcome::Drawn,
            filled,
            winners: winners.clone(),
            consolations,
            refunded_total: 0,
            settled_at_ms,
        });
        Ok(winners)
    }

    /// Journal recovery: re-applies a cancellation.
    pub(crate) fn replay_cancel(&self, raffle: RaffleId, settled_at_ms: u64) -> EngineResult<()> {
        let mut state = self
            .raffles
            .get(&raffle)
            .ok_or_else(|| EngineError::Journal(format!("replay names unknown raffle {raffle}")))?
            .lock();
        if state.status != RaffleStatus::Closed {
            return Err(EngineError::Journal(format!(
                "replay cancels {} raffle {raffle}",
                state.status
            )));
        }
        let filled = state.slots.len() as u32;
        state.status = RaffleStatus::Cancelled;
        state.settlement = Some(SettlementResult {
            raffle,
            outcome: SettlementOutcome::Cancelled,
            filled,
            winners: Vec::new(),
            consolations: 0,
            refunded_total: u64::from(filled).saturating_mul(state.def.tokens_per_slot),
            settled_at_ms,
        });
        Ok(())
    }

    fn state(&self, raffle: RaffleId) -> EngineResult<&Mutex<RaffleState>> {
        self.raffles
            .get(&raffle)
            .ok_or(EngineError::RaffleNotFound(raffle))
    }

    /// Timed lock for the buyer path. Commits hold the lock across a
    /// journal fsync, so waiters give up after [`RAFFLE_LOCK_WAIT_MS`]
    /// and surface a retryable busy instead of queueing behind the disk.
    fn lock_for_buyer(&self, raffle: RaffleId) -> EngineResult<MutexGuard<'_, RaffleState>> {
        self.state(raffle)?
            .try_lock_for(Duration::from_millis(RAFFLE_LOCK_WAIT_MS))
            .ok_or(EngineError::Busy("raffle contended"))
    }

    /// Maps drawn slots onto the position-sorted prize list.
    fn map_winners(state: &RaffleState, winning_slots: &[SlotIndex]) -> Vec<SlotWin> {
        winning_slots
            .iter()
            .zip(&state.def.prizes)
            .map(|(&slot, prize)| SlotWin {
                position: prize.position,
                slot,
                user: state.slots[slot as usize],
                item: prize.item,
                tier: prize.tier,
            })
            .collect()
    }

    /// Consolation credits for every sold slot that did not win.
    fn consolation_credits(
        state: &RaffleState,
        raffle: RaffleId,
        winning_slots: &[SlotIndex],
    ) -> Vec<PendingCredit> {
        if state.def.consolation_tokens == 0 {
            return Vec::new();
        }
        state
            .slots
            .iter()
            .enumerate()
            .filter(|(slot, _)| !winning_slots.contains(&(*slot as u32)))
            .map(|(slot, user)| PendingCredit {
                user: *user,
                amount: state.def.consolation_tokens,
                reason: LedgerReason::Consolation,
                reference: LedgerRef::Consolation {
                    raffle,
                    slot: slot as u32,
                },
            })
            .collect()
    }
}

const fn encode_hold(raffle: RaffleId, seq: u32) -> ReservationId {
    ((raffle as u64) << 32) | seq as u64
}

const fn decode_raffle(id: ReservationId) -> RaffleId {
    (id >> 32) as RaffleId
}
