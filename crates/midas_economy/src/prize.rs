//! # Prize Resolver
//!
//! Weighted draws over pre-compiled cumulative tables.
//!
//! ## Design
//!
//! - Pools are compiled once at catalog load: weights validated, cumulative
//!   sums built. Draws never re-validate and never fail.
//! - A draw is one uniform roll in `[0, total_weight)` and one binary search
//!   over the cumulative table. O(log n) per draw.
//! - Guaranteed-all pools skip the roll entirely: every listed entry is
//!   granted once per unit.
//!
//! ## Security Model
//!
//! All draws flow through a single ChaCha20 stream. Production resolvers
//! seed from OS entropy and are not reproducible; test resolvers take a
//! fixed 32-byte seed and replay the exact draw sequence. There is no third
//! mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use midas_shared::{ItemId, Tier};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::catalog::PoolEntry;
use crate::error::{EngineError, EngineResult};

/// One item granted to a user, with its tier for the receipt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantedItem {
    /// The granted item.
    pub item: ItemId,
    /// Its tier.
    pub tier: Tier,
}

/// A prize pool compiled for drawing.
///
/// Construction is the only place pool rules are enforced; see
/// [`PrizePool::compile`].
#[derive(Clone, Debug)]
pub struct PrizePool {
    entries: Vec<PoolEntry>,
    /// `cumulative[i]` is the sum of weights `0..=i`.
    cumulative: Vec<f64>,
    total_weight: f64,
    guaranteed_all: bool,
}

impl PrizePool {
    /// Compiles catalog entries into a drawable pool.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] when the pool is empty, an
    /// entry has item id 0, a weight is negative or non-finite, or a
    /// weighted (non-guaranteed) pool sums to zero weight. The
    /// single-entry-zero-weight pool is the canonical example of that last
    /// rule.
    pub fn compile(entries: &[PoolEntry], guaranteed_all: bool) -> EngineResult<Self> {
        if entries.is_empty() {
            return Err(EngineError::InvalidConfig("prize pool is empty".to_string()));
        }

        let mut cumulative = Vec::with_capacity(entries.len());
        let mut running = 0.0_f64;
        for entry in entries {
            if entry.item == 0 {
                return Err(EngineError::InvalidConfig(
                    "prize pool entry has item 0 (item ids start at 1)".to_string(),
                ));
            }
            if !entry.weight.is_finite() || entry.weight < 0.0 {
                return Err(EngineError::InvalidConfig(format!(
                    "item {}: weight {} is not a valid weight",
                    entry.item, entry.weight
                )));
            }
            running += entry.weight;
            cumulative.push(running);
        }

        if !guaranteed_all && running <= 0.0 {
            return Err(EngineError::InvalidConfig(
                "prize pool total weight is zero".to_string(),
            ));
        }

        Ok(Self {
            entries: entries.to_vec(),
            cumulative,
            total_weight: running,
            guaranteed_all,
        })
    }

    /// The compiled entries, in catalog order.
    #[must_use]
    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Compiled pools are never empty; this exists for the `len`/`is_empty`
    /// pairing convention.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether one unit grants the whole pool.
    #[must_use]
    pub const fn is_guaranteed_all(&self) -> bool {
        self.guaranteed_all
    }

    /// Sum of all entry weights.
    #[must_use]
    pub const fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Maps a roll in `[0, total_weight)` to its entry.
    ///
    /// Zero-weight entries produce equal adjacent cumulative values and can
    /// never be selected: the search passes over them.
    fn pick(&self, roll: f64) -> &PoolEntry {
        let idx = self.cumulative.partition_point(|&c| c <= roll);
        let idx = idx.min(self.entries.len() - 1);
        &self.entries[idx]
    }
}

/// The draw engine. Owns the RNG every draw in the process flows through.
pub struct PrizeResolver {
    rng: Mutex<ChaCha20Rng>,
    draws: AtomicU64,
}

impl PrizeResolver {
    /// Production resolver, seeded from OS entropy. Not reproducible.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
            draws: AtomicU64::new(0),
        }
    }

    /// Deterministic resolver for tests: the same seed replays the same
    /// draw sequence exactly.
    #[must_use]
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::from_seed(seed)),
            draws: AtomicU64::new(0),
        }
    }

    /// One weighted draw. For guaranteed-all pools use
    /// [`PrizeResolver::draw_batch`], which bypasses weighting.
    pub fn draw<'a>(&self, pool: &'a PrizePool) -> &'a PoolEntry {
        self.draws.fetch_add(1, Ordering::Relaxed);
        if pool.total_weight() <= 0.0 {
            return &pool.entries[0];
        }
        let roll = self.rng.lock().gen_range(0.0..pool.total_weight());
        pool.pick(roll)
    }

    /// Draws prizes for `units` purchased units.
    ///
    /// Guaranteed-all pools grant every entry once per unit, in catalog
    /// order; weighted pools grant one draw per unit.
    #[must_use]
    pub fn draw_batch(&self, pool: &PrizePool, units: u32) -> Vec<GrantedItem> {
        if pool.is_guaranteed_all() {
            let mut granted = Vec::with_capacity(pool.len() * units as usize);
            for _ in 0..units {
                for entry in pool.entries() {
                    granted.push(GrantedItem {
                        item: entry.item,
                        tier: entry.tier,
                    });
                }
            }
            return granted;
        }

        let mut granted = Vec::with_capacity(units as usize);
        for _ in 0..units {
            let entry = self.draw(pool);
            granted.push(GrantedItem {
                item: entry.item,
                tier: entry.tier,
            });
        }
        granted
    }

    /// Picks `k` distinct values from `0..n` by partial Fisher-Yates.
    ///
    /// Returns them in drawn order; `k > n` is clamped to `n`.
    #[must_use]
    pub fn pick_distinct(&self, n: u32, k: u32) -> Vec<u32> {
        let k = k.min(n);
        let mut indices: Vec<u32> = (0..n).collect();
        {
            let mut rng = self.rng.lock();
            for i in 0..k as usize {
                let j = rng.gen_range(i..indices.len());
                indices.swap(i, j);
            }
        }
        self.draws.fetch_add(u64::from(k), Ordering::Relaxed);
        indices.truncate(k as usize);
        indices
    }

    /// Total draws performed since construction.
    #[must_use]
    pub fn total_draws(&self) -> u64 {
        self.draws.load(Ordering::Relaxed)
    }

    /// Runs `draws` weighted draws against a pool and tallies the results.
    ///
    /// Verification and benchmarking helper; the engine itself never calls
    /// this.
    #[must_use]
    pub fn run_statistics(&self, pool: &PrizePool, draws: u32) -> DrawStatistics {
        let mut stats = DrawStatistics {
            draws: u64::from(draws),
            tier_counts: [0; 7],
            item_counts: HashMap::new(),
        };
        for _ in 0..draws {
            let entry = self.draw(pool);
            stats.tier_counts[entry.tier as usize] += 1;
            *stats.item_counts.entry(entry.item).or_insert(0) += 1;
        }
        stats
    }
}

impl Default for PrizeResolver {
    fn default() -> Self {
        Self::new()
    }
}

// The RNG state is the one thing this crate must never leak into logs.
impl core::fmt::Debug for PrizeResolver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PrizeResolver")
            .field("draws", &self.total_draws())
            .field("rng", &"<sealed>")
            .finish()
    }
}

/// Tally produced by [`PrizeResolver::run_statistics`].
#[derive(Clone, Debug)]
pub struct DrawStatistics {
    /// Draws performed.
    pub draws: u64,
    /// Draw count per tier, indexed by `Tier as usize`.
    pub tier_counts: [u64; 7],
    /// Draw count per item.
    pub item_counts: HashMap<ItemId, u64>,
}

impl DrawStatistics {
    /// Draws that landed on the given tier.
    #[must_use]
    pub const fn tier_count(&self, tier: Tier) -> u64 {
        self.tier_counts[tier as usize]
    }

    /// Share of draws that landed on the given tier, in percent.
    #[must_use]
    pub fn tier_share_percent(&self, tier: Tier) -> f64 {
        if self.draws == 0 {
            return 0.0;
        }
        self.tier_count(tier) as f64 * 100.0 / self.draws as f64
    }
}
