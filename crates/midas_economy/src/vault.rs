//! # Vault
//!
//! Where granted items land. The engine treats delivery as a seam: the
//! trait is the contract, and anything from the in-memory vault here to a
//! real persistence layer can sit behind it. Purchase and settlement code
//! only relies on two things: a grant either fully happens or returns an
//! error, and regranting the same reference is a no-op.

use std::collections::{HashMap, HashSet};

use midas_shared::UserId;
use parking_lot::Mutex;

use crate::error::EngineResult;
use crate::prize::GrantedItem;

/// Idempotency reference of a grant: what earned the items.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GrantRef {
    /// A fulfilled purchase order.
    Order(midas_shared::OrderId),
    /// A raffle prize position.
    RafflePrize {
        /// The raffle.
        raffle: midas_shared::RaffleId,
        /// Prize position within it.
        position: u32,
    },
}

/// Item delivery contract.
pub trait Vault: Send + Sync {
    /// Delivers items to a user. Idempotent by `reference`: a reference
    /// that was already granted is acknowledged without granting again,
    /// which is what makes journal replay safe.
    ///
    /// # Errors
    ///
    /// Implementations surface delivery failure as
    /// [`crate::error::EngineError::VaultUnavailable`]; the caller unwinds
    /// the purchase around it.
    fn grant(&self, user: UserId, reference: GrantRef, items: &[GrantedItem]) -> EngineResult<()>;

    /// Everything a user owns, in grant order.
    fn holdings(&self, user: UserId) -> Vec<GrantedItem>;

    /// Number of items a user owns.
    fn item_count(&self, user: UserId) -> usize {
        self.holdings(user).len()
    }
}

#[derive(Debug, Default)]
struct VaultInner {
    granted: HashSet<GrantRef>,
    holdings: HashMap<UserId, Vec<GrantedItem>>,
}

/// In-memory vault. State is rebuilt from the journal on restart, so
/// losing it with the process is fine.
#[derive(Debug, Default)]
pub struct MemoryVault {
    inner: Mutex<VaultInner>,
}

impl MemoryVault {
    /// An empty vault.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Vault for MemoryVault {
    fn grant(&self, user: UserId, reference: GrantRef, items: &[GrantedItem]) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        if !inner.granted.insert(reference) {
            return Ok(());
        }
        inner.holdings.entry(user).or_default().extend_from_slice(items);
        Ok(())
    }

    fn holdings(&self, user: UserId) -> Vec<GrantedItem> {
        self.inner
            .lock()
            .holdings
            .get(&user)
            .cloned()
            .unwrap_or_default()
    }
}
