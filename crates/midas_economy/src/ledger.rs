//! # Token Ledger
//!
//! Every token in the product lives here as an integer balance plus an
//! append-only entry trail. The trail is the truth: at any quiescent point,
//! summing an account's entry deltas reproduces its balance exactly, and
//! [`TokenLedger::reconcile_all`] checks that without stopping the world.
//!
//! ## Guarantees
//!
//! - A balance never goes negative. Debits fail closed.
//! - Balance update, entry append and idempotency-key insert happen under
//!   one per-account lock. There is no window where an observer can see one
//!   without the others.
//! - `(direction, reference)` is an idempotency key: replaying a mutation
//!   with a key that already applied is a no-op, reported as such.
//! - A compensating credit ([`TokenLedger::compensate`]) retires the
//!   matching debit key, so a clean retry of the same order can charge
//!   again. At most one effective debit per reference at any moment.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use midas_shared::{OrderId, RaffleId, SessionId, SlotIndex, UserId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Why a ledger entry exists.
///
/// The discriminant is stable and used in journal records; never reorder.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerReason {
    /// Pack purchase charge.
    Purchase = 0,
    /// Compensating refund after a failed operation.
    Refund = 1,
    /// Raffle slot charge.
    SlotPurchase = 2,
    /// Cancelled raffle; slot stake returned.
    SlotRefund = 3,
    /// Consolation payout to a losing slot.
    Consolation = 4,
    /// Minigame tier reward.
    MinigameReward = 5,
    /// Payment gateway reported funds received.
    Deposit = 6,
}

impl LedgerReason {
    /// Converts a raw discriminant back to a reason.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Purchase),
            1 => Some(Self::Refund),
            2 => Some(Self::SlotPurchase),
            3 => Some(Self::SlotRefund),
            4 => Some(Self::Consolation),
            5 => Some(Self::MinigameReward),
            6 => Some(Self::Deposit),
            _ => None,
        }
    }
}

/// What a ledger entry refers back to.
///
/// Together with the mutation direction this forms the idempotency key, so
/// every reference must be globally unique for its kind: order ids come from
/// the client contract, receipt ids from the payment gateway, and
/// raffle/slot pairs and session ids from the engine itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerRef {
    /// A client purchase or slot order.
    Order(OrderId),
    /// A payment-gateway receipt.
    Deposit(u64),
    /// Consolation for one losing slot.
    Consolation {
        /// The settled raffle.
        raffle: RaffleId,
        /// The losing slot.
        slot: SlotIndex,
    },
    /// Stake returned for one slot of a cancelled raffle.
    SlotRefund {
        /// The cancelled raffle.
        raffle: RaffleId,
        /// The refunded slot.
        slot: SlotIndex,
    },
    /// A graded minigame session.
    Session(SessionId),
}

impl core::fmt::Display for LedgerRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Order(id) => write!(f, "order:{id}"),
            Self::Deposit(id) => write!(f, "deposit:{id}"),
            Self::Consolation { raffle, slot } => write!(f, "consolation:{raffle}/{slot}"),
            Self::SlotRefund { raffle, slot } => write!(f, "slot-refund:{raffle}/{slot}"),
            Self::Session(id) => write!(f, "session:{id}"),
        }
    }
}

/// Mutation direction.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Tokens in.
    Credit = 0,
    /// Tokens out.
    Debit = 1,
}

/// One append-only audit record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// The account.
    pub user: UserId,
    /// Signed token delta; positive is a credit.
    pub delta: i64,
    /// Why.
    pub reason: LedgerReason,
    /// Traceability and idempotency reference.
    pub reference: LedgerRef,
    /// Wall-clock milliseconds when appended.
    pub at_ms: u64,
}

/// Outcome of a credit or debit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum Applied {
    /// The mutation was applied by this call.
    Fresh {
        /// Balance after the mutation.
        new_balance: u64,
    },
    /// The idempotency key had already applied; nothing changed.
    Duplicate {
        /// Unchanged balance.
        balance: u64,
    },
}

impl Applied {
    /// The account balance after the call, applied or not.
    #[must_use]
    pub const fn balance(&self) -> u64 {
        match self {
            Self::Fresh { new_balance } => *new_balance,
            Self::Duplicate { balance } => *balance,
        }
    }

    /// True when this call actually moved tokens.
    #[must_use]
    pub const fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh { .. })
    }
}

/// Per-account state. Everything in here mutates under one lock.
struct Account {
    balance: u64,
    entries: Vec<LedgerEntry>,
    applied: HashSet<(EntryKind, LedgerRef)>,
}

impl Account {
    fn new() -> Self {
        Self {
            balance: 0,
            entries: Vec::new(),
            applied: HashSet::new(),
        }
    }
}

/// The token ledger: balances, audit trail and idempotency keys for every
/// account, with per-account locking.
pub struct TokenLedger {
    accounts: RwLock<HashMap<UserId, Arc<Mutex<Account>>>>,
}

impl TokenLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// Fetches an account handle, creating the account on first touch.
    fn account(&self, user: UserId) -> Arc<Mutex<Account>> {
        if let Some(account) = self.accounts.read().get(&user) {
            return Arc::clone(account);
        }
        let mut accounts = self.accounts.write();
        Arc::clone(
            accounts
                .entry(user)
                .or_insert_with(|| Arc::new(Mutex::new(Account::new()))),
        )
    }

    /// Credits tokens.
    ///
    /// # Errors
    ///
    /// [`EngineError::ArithmeticOverflow`] when the amount does not fit the
    /// signed delta or the balance would overflow.
    pub fn credit(
        &self,
        user: UserId,
        amount: u64,
        reason: LedgerReason,
        reference: LedgerRef,
    ) -> EngineResult<Applied> {
        let delta = i64::try_from(amount).map_err(|_| EngineError::ArithmeticOverflow)?;
        let account = self.account(user);
        let mut account = account.lock();

        let key = (EntryKind::Credit, reference);
        if account.applied.contains(&key) {
            return Ok(Applied::Duplicate {
                balance: account.balance,
            });
        }

        let new_balance = account
            .balance
            .checked_add(amount)
            .ok_or(EngineError::ArithmeticOverflow)?;
        account.balance = new_balance;
        account.entries.push(LedgerEntry {
            user,
            delta,
            reason,
            reference,
            at_ms: now_ms(),
        });
        account.applied.insert(key);
        Ok(Applied::Fresh { new_balance })
    }

    /// Debits tokens. Fails closed; the balance never goes negative.
    ///
    /// # Errors
    ///
    /// [`EngineError::InsufficientFunds`] when the balance cannot cover the
    /// amount, [`EngineError::ArithmeticOverflow`] when the amount does not
    /// fit the signed delta.
    pub fn debit(
        &self,
        user: UserId,
        amount: u64,
        reason: LedgerReason,
        reference: LedgerRef,
    ) -> EngineResult<Applied> {
        let delta = i64::try_from(amount).map_err(|_| EngineError::ArithmeticOverflow)?;
        let account = self.account(user);
        let mut account = account.lock();

        let key = (EntryKind::Debit, reference);
        if account.applied.contains(&key) {
            return Ok(Applied::Duplicate {
                balance: account.balance,
            });
        }

        if account.balance < amount {
            return Err(EngineError::InsufficientFunds {
                user,
                needed: amount,
                balance: account.balance,
            });
        }

        account.balance -= amount;
        let new_balance = account.balance;
        account.entries.push(LedgerEntry {
            user,
            delta: -delta,
            reason,
            reference,
            at_ms: now_ms(),
        });
        account.applied.insert(key);
        Ok(Applied::Fresh { new_balance })
    }

    /// Compensating credit: restores a debited amount AND retires the debit
    /// key for `reference`, so a clean retry of the same order may charge
    /// again. The audit trail keeps both entries.
    ///
    /// # Errors
    ///
    /// [`EngineError::ArithmeticOverflow`] on balance overflow.
    pub fn compensate(
        &self,
        user: UserId,
        amount: u64,
        reference: LedgerRef,
    ) -> EngineResult<u64> {
        let delta = i64::try_from(amount).map_err(|_| EngineError::ArithmeticOverflow)?;
        let account = self.account(user);
        let mut account = account.lock();

        let new_balance = account
            .balance
            .checked_add(amount)
            .ok_or(EngineError::ArithmeticOverflow)?;
        account.balance = new_balance;
        account.entries.push(LedgerEntry {
            user,
            delta,
            reason: LedgerReason::Refund,
            reference,
            at_ms: now_ms(),
        });
        account.applied.remove(&(EntryKind::Debit, reference));
        Ok(new_balance)
    }

    /// True when an idempotency key has already landed. Read-only peek
    /// for callers that must decide whether to journal before touching
    /// the balance.
    #[must_use]
    pub fn is_applied(&self, user: UserId, kind: EntryKind, reference: LedgerRef) -> bool {
        self.accounts
            .read()
            .get(&user)
            .is_some_and(|account| account.lock().applied.contains(&(kind, reference)))
    }

    /// Current balance; unknown users read as zero without being created.
    #[must_use]
    pub fn balance_of(&self, user: UserId) -> u64 {
        self.accounts
            .read()
            .get(&user)
            .map_or(0, |account| account.lock().balance)
    }

    /// Snapshot of an account's audit trail, oldest first.
    #[must_use]
    pub fn entries_of(&self, user: UserId) -> Vec<LedgerEntry> {
        self.accounts
            .read()
            .get(&user)
            .map_or_else(Vec::new, |account| account.lock().entries.clone())
    }

    /// Number of accounts that have ever been touched.
    #[must_use]
    pub fn account_count(&self) -> usize {
        self.accounts.read().len()
    }

    /// Rebuilds one account's balance from its entries and compares.
    #[must_use]
    pub fn reconcile(&self, user: UserId) -> bool {
        self.accounts.read().get(&user).map_or(true, |account| {
            let account = account.lock();
            let sum: i128 = account.entries.iter().map(|e| i128::from(e.delta)).sum();
            sum == i128::from(account.balance)
        })
    }

    /// Reconciles every account. Returns the users whose entry sums do not
    /// match their balances; empty means the ledger is internally consistent.
    #[must_use]
    pub fn reconcile_all(&self) -> Vec<UserId> {
        let handles: Vec<(UserId, Arc<Mutex<Account>>)> = self
            .accounts
            .read()
            .iter()
            .map(|(user, account)| (*user, Arc::clone(account)))
            .collect();

        let mut mismatched = Vec::new();
        for (user, account) in handles {
            let account = account.lock();
            let sum: i128 = account.entries.iter().map(|e| i128::from(e.delta)).sum();
            if sum != i128::from(account.balance) {
                mismatched.push(user);
            }
        }
        mismatched
    }

    /// Journal recovery path: applies a recorded mutation, restoring the
    /// entry and its idempotency-key effect exactly as the live operation
    /// left them. A mutation whose key already landed is skipped, so a
    /// journal that recorded the same logical movement twice (two racing
    /// deposits of one gateway receipt) still replays to the right state.
    pub(crate) fn replay_mutation(
        &self,
        user: UserId,
        delta: i64,
        reason: LedgerReason,
        reference: LedgerRef,
        at_ms: u64,
    ) -> EngineResult<()> {
        let account = self.account(user);
        let mut account = account.lock();

        let key_registering = !(delta >= 0 && reason == LedgerReason::Refund);
        if key_registering {
            let kind = if delta >= 0 {
                EntryKind::Credit
            } else {
                EntryKind::Debit
            };
            if account.applied.contains(&(kind, reference)) {
                return Ok(());
            }
        }

        let magnitude = delta.unsigned_abs();
        if delta >= 0 {
            account.balance = account
                .balance
                .checked_add(magnitude)
                .ok_or_else(|| EngineError::Journal("replay overflowed a balance".to_string()))?;
        } else {
            account.balance = account.balance.checked_sub(magnitude).ok_or_else(|| {
                EngineError::Journal(format!("replay drove user {user} below zero"))
            })?;
        }

        account.entries.push(LedgerEntry {
            user,
            delta,
            reason,
            reference,
            at_ms,
        });

        // Mirror the live key discipline: a compensation retires its debit
        // key instead of registering a credit key.
        if delta >= 0 && reason == LedgerReason::Refund {
            account.applied.remove(&(EntryKind::Debit, reference));
        } else {
            let kind = if delta >= 0 {
                EntryKind::Credit
            } else {
                EntryKind::Debit
            };
            account.applied.insert((kind, reference));
        }
        Ok(())
    }
}

impl Default for TokenLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock milliseconds. Shared by every module that stamps state.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
