//! Reward tiers.
//!
//! One ladder for everything that grades a reward: prize pool entries,
//! raffle prizes and minigame outcomes all speak `Tier`. Ordering is by
//! desirability, `D` lowest, `SSS` highest, so `>` reads the way a collector
//! would say it.

use serde::{Deserialize, Serialize};

/// Reward tier, lowest to highest.
///
/// The discriminant is stable and used in journal records; never reorder.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Bulk filler.
    D = 0,
    /// Below-average pull.
    C = 1,
    /// Average pull.
    B = 2,
    /// Above-average pull.
    A = 3,
    /// Strong pull.
    S = 4,
    /// Near the top of a pool.
    SS = 5,
    /// The chase card.
    SSS = 6,
}

impl Tier {
    /// Every tier, lowest to highest. Handy for tally tables.
    pub const ALL: [Self; 7] = [
        Self::D,
        Self::C,
        Self::B,
        Self::A,
        Self::S,
        Self::SS,
        Self::SSS,
    ];

    /// Display label, matching the catalog file spelling.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::D => "D",
            Self::C => "C",
            Self::B => "B",
            Self::A => "A",
            Self::S => "S",
            Self::SS => "SS",
            Self::SSS => "SSS",
        }
    }

    /// Converts a raw discriminant back to a tier.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::D),
            1 => Some(Self::C),
            2 => Some(Self::B),
            3 => Some(Self::A),
            4 => Some(Self::S),
            5 => Some(Self::SS),
            6 => Some(Self::SSS),
            _ => None,
        }
    }

    /// True for the tiers collectors chase (`SS` and above).
    #[must_use]
    pub const fn is_chase(&self) -> bool {
        matches!(self, Self::SS | Self::SSS)
    }
}

impl core::fmt::Display for Tier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}
