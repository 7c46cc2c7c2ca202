//! # Catalog
//!
//! Everything sellable, loaded from a TOML file once at startup and fully
//! validated before the engine serves a single request. A catalog that
//! passes validation can never produce a config error mid-purchase; a
//! catalog that fails validation never becomes an engine.
//!
//! ## File format
//!
//! ```toml
//! [[sku]]
//! id = 1
//! name = "Founders Pack"
//! price_tokens = 1000
//! total_units = 100
//!
//! [[sku.prize]]
//! tier = "SSS"
//! item = 9001
//! weight = 5.0
//!
//! [[sku.prize]]
//! tier = "S"
//! item = 9003
//! weight = 80.0
//!
//! [[raffle]]
//! id = 7
//! name = "Grail Watch"
//! total_slots = 10
//! tokens_per_slot = 100
//! consolation_tokens = 1
//! on_deadline = "cancel_refund"
//!
//! [[raffle.prize]]
//! position = 1
//! item = 7001
//! tier = "SSS"
//! ```
//!
//! The `[minigames]` section is optional; omitted games fall back to the
//! built-in ladders in [`crate::arcade`].

use std::path::Path;

use midas_shared::{ItemId, RaffleId, SkuId, Tier};
use serde::{Deserialize, Serialize};

use crate::arcade::GameRules;
use crate::error::{EngineError, EngineResult};
use crate::prize::PrizePool;
use crate::raffle::DeadlinePolicy;

/// One weighted entry in a SKU's prize pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    /// Reward tier, for display and tally purposes.
    pub tier: Tier,
    /// Item granted when this entry is drawn.
    pub item: ItemId,
    /// Relative weight. Only ratios matter; `5.0` out of a total of `100.0`
    /// is a 5% entry.
    pub weight: f64,
}

/// A sellable SKU: fixed stock, fixed price, one prize pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SkuDef {
    /// Catalog-unique id.
    pub id: SkuId,
    /// Display name.
    pub name: String,
    /// Price per unit, in tokens.
    pub price_tokens: u64,
    /// Total units that will ever be sold.
    pub total_units: u32,
    /// Inactive SKUs stay in the catalog but refuse purchases.
    #[serde(default = "default_active")]
    pub active: bool,
    /// When set, one unit grants every pool entry once instead of drawing.
    #[serde(default)]
    pub guaranteed_all: bool,
    /// The prize pool.
    #[serde(rename = "prize", default)]
    pub pool: Vec<PoolEntry>,
}

/// One prize position in a raffle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RafflePrizeDef {
    /// Prize position, `1` is the headline prize. Positions must be
    /// exactly `1..=prize_count`.
    pub position: u32,
    /// Item delivered to the winning slot's owner.
    pub item: ItemId,
    /// Tier label for the delivery receipt.
    pub tier: Tier,
}

/// A raffle: fixed slot count, fixed slot price, fixed prize list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RaffleDef {
    /// Catalog-unique id.
    pub id: RaffleId,
    /// Display name.
    pub name: String,
    /// Slots available. The raffle closes itself when the last one sells.
    pub total_slots: u32,
    /// Price per slot, in tokens.
    pub tokens_per_slot: u64,
    /// Tokens credited to every non-winning slot at settlement.
    pub consolation_tokens: u64,
    /// What settlement does when the raffle was closed short of full.
    #[serde(default)]
    pub on_deadline: DeadlinePolicy,
    /// Prize list, one winner drawn per prize.
    #[serde(rename = "prize", default)]
    pub prizes: Vec<RafflePrizeDef>,
}

/// The full catalog document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Catalog {
    /// Sellable SKUs.
    #[serde(rename = "sku", default)]
    pub skus: Vec<SkuDef>,
    /// Raffles.
    #[serde(rename = "raffle", default)]
    pub raffles: Vec<RaffleDef>,
    /// Minigame boards, ladders and rewards.
    #[serde(default)]
    pub minigames: GameRules,
}

const fn default_active() -> bool {
    true
}

impl Catalog {
    /// Parses and validates a catalog from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] for syntax errors and for
    /// every semantic rule in [`Catalog::validate`].
    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        let catalog: Self = toml::from_str(text)
            .map_err(|e| EngineError::InvalidConfig(format!("catalog parse: {e}")))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Reads, parses and validates a catalog file.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] if the file cannot be read or
    /// fails any validation rule.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::InvalidConfig(format!("catalog read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Looks up a SKU definition. Load-time helper; the running engine keeps
    /// its own indexed copies.
    #[must_use]
    pub fn sku(&self, id: SkuId) -> Option<&SkuDef> {
        self.skus.iter().find(|s| s.id == id)
    }

    /// Looks up a raffle definition.
    #[must_use]
    pub fn raffle(&self, id: RaffleId) -> Option<&RaffleDef> {
        self.raffles.iter().find(|r| r.id == id)
    }

    /// Checks every semantic rule. All failures happen here, at load time;
    /// a validated catalog cannot produce `InvalidConfig` at request time.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] naming the offending entry.
    pub fn validate(&self) -> EngineResult<()> {
        let mut sku_ids = std::collections::HashSet::new();
        for sku in &self.skus {
            if !sku_ids.insert(sku.id) {
                return invalid(format!("duplicate sku id {}", sku.id));
            }
            if sku.price_tokens == 0 {
                return invalid(format!("sku {}: price must be positive", sku.id));
            }
            if sku.total_units == 0 {
                return invalid(format!("sku {}: total_units must be positive", sku.id));
            }
            // Surfaces empty pools, bad weights and zero-total weighted pools.
            PrizePool::compile(&sku.pool, sku.guaranteed_all)
                .map_err(|e| prefix_sku(sku.id, &e))?;
        }

        let mut raffle_ids = std::collections::HashSet::new();
        for raffle in &self.raffles {
            if !raffle_ids.insert(raffle.id) {
                return invalid(format!("duplicate raffle id {}", raffle.id));
            }
            if raffle.total_slots == 0 {
                return invalid(format!("raffle {}: total_slots must be positive", raffle.id));
            }
            if raffle.tokens_per_slot == 0 {
                return invalid(format!("raffle {}: tokens_per_slot must be positive", raffle.id));
            }
            if raffle.prizes.is_empty() {
                return invalid(format!("raffle {}: no prizes", raffle.id));
            }
            let prize_count = u32::try_from(raffle.prizes.len())
                .map_err(|_| EngineError::InvalidConfig(format!("raffle {}: prize list too large", raffle.id)))?;
            if prize_count > raffle.total_slots {
                return invalid(format!(
                    "raffle {}: {} prizes for {} slots",
                    raffle.id, prize_count, raffle.total_slots
                ));
            }
            let mut positions: Vec<u32> = raffle.prizes.iter().map(|p| p.position).collect();
            positions.sort_unstable();
            let expected: Vec<u32> = (1..=prize_count).collect();
            if positions != expected {
                return invalid(format!(
                    "raffle {}: prize positions must be exactly 1..={prize_count}",
                    raffle.id
                ));
            }
            for prize in &raffle.prizes {
                if prize.item == 0 {
                    return invalid(format!(
                        "raffle {}: prize position {} has item 0",
                        raffle.id, prize.position
                    ));
                }
            }
        }

        self.minigames.validate()?;
        Ok(())
    }
}

fn invalid(message: String) -> EngineResult<()> {
    Err(EngineError::InvalidConfig(message))
}

fn prefix_sku(id: SkuId, inner: &EngineError) -> EngineError {
    match inner {
        EngineError::InvalidConfig(msg) => EngineError::InvalidConfig(format!("sku {id}: {msg}")),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_catalog() -> String {
        r#"
            [[sku]]
            id = 1
            name = "Starter Pack"
            price_tokens = 1000
            total_units = 50

            [[sku.prize]]
            tier = "SSS"
            item = 9001
            weight = 5.0

            [[sku.prize]]
            tier = "SS"
            item = 9002
            weight = 15.0

            [[sku.prize]]
            tier = "S"
            item = 9003
            weight = 80.0

            [[raffle]]
            id = 7
            name = "Grail Watch"
            total_slots = 10
            tokens_per_slot = 100
            consolation_tokens = 1

            [[raffle.prize]]
            position = 1
            item = 7001
            tier = "SSS"

            [[raffle.prize]]
            position = 2
            item = 7002
            tier = "SS"

            [[raffle.prize]]
            position = 3
            item = 7003
            tier = "S"
        "#
        .to_string()
    }

    #[test]
    fn test_minimal_catalog_parses() {
        let catalog = Catalog::from_toml_str(&minimal_catalog()).unwrap();
        assert_eq!(catalog.skus.len(), 1);
        assert_eq!(catalog.raffles.len(), 1);
        assert_eq!(catalog.sku(1).unwrap().pool.len(), 3);
        assert_eq!(catalog.raffle(7).unwrap().prizes.len(), 3);
        assert!(catalog.sku(1).unwrap().active);
        assert_eq!(catalog.raffle(7).unwrap().on_deadline, DeadlinePolicy::CancelRefund);
    }

    #[test]
    fn test_duplicate_sku_id_rejected() {
        let mut text = minimal_catalog();
        text.push_str(
            r#"
            [[sku]]
            id = 1
            name = "Clone"
            price_tokens = 10
            total_units = 1

            [[sku.prize]]
            tier = "D"
            item = 1
            weight = 1.0
        "#,
        );
        let err = Catalog::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
        assert!(err.to_string().contains("duplicate sku id 1"));
    }

    #[test]
    fn test_zero_weight_pool_rejected_at_load() {
        let text = r#"
            [[sku]]
            id = 2
            name = "Broken"
            price_tokens = 100
            total_units = 5

            [[sku.prize]]
            tier = "D"
            item = 1
            weight = 0.0
        "#;
        let err = Catalog::from_toml_str(text).unwrap_err();
        assert!(err.to_string().contains("sku 2"));
    }

    #[test]
    fn test_guaranteed_all_ignores_zero_weight() {
        let text = r#"
            [[sku]]
            id = 3
            name = "Full Set Box"
            price_tokens = 100
            total_units = 5
            guaranteed_all = true

            [[sku.prize]]
            tier = "A"
            item = 10
            weight = 0.0

            [[sku.prize]]
            tier = "B"
            item = 11
            weight = 0.0
        "#;
        let catalog = Catalog::from_toml_str(text).unwrap();
        assert!(catalog.sku(3).unwrap().guaranteed_all);
    }

    #[test]
    fn test_prize_positions_must_be_dense() {
        let text = r#"
            [[raffle]]
            id = 1
            name = "Bad Positions"
            total_slots = 5
            tokens_per_slot = 10
            consolation_tokens = 0

            [[raffle.prize]]
            position = 1
            item = 1
            tier = "S"

            [[raffle.prize]]
            position = 3
            item = 2
            tier = "A"
        "#;
        let err = Catalog::from_toml_str(text).unwrap_err();
        assert!(err.to_string().contains("positions"));
    }

    #[test]
    fn test_more_prizes_than_slots_rejected() {
        let text = r#"
            [[raffle]]
            id = 2
            name = "Overstuffed"
            total_slots = 1
            tokens_per_slot = 10
            consolation_tokens = 0

            [[raffle.prize]]
            position = 1
            item = 1
            tier = "S"

            [[raffle.prize]]
            position = 2
            item = 2
            tier = "A"
        "#;
        let err = Catalog::from_toml_str(text).unwrap_err();
        assert!(err.to_string().contains("2 prizes for 1 slots"));
    }

    #[test]
    fn test_inactive_sku_parses() {
        let text = r#"
            [[sku]]
            id = 4
            name = "Retired"
            price_tokens = 100
            total_units = 5
            active = false

            [[sku.prize]]
            tier = "C"
            item = 20
            weight = 1.0
        "#;
        let catalog = Catalog::from_toml_str(text).unwrap();
        assert!(!catalog.sku(4).unwrap().active);
    }

    #[test]
    fn test_empty_catalog_is_valid() {
        let catalog = Catalog::from_toml_str("").unwrap();
        assert!(catalog.skus.is_empty());
        assert!(catalog.raffles.is_empty());
    }
}
