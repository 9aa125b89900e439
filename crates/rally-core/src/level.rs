//! # Levels
//!
//! Deterministic XP → level mapping.
//!
//! | Level | Name     | XP band      | Daily reward |
//! |-------|----------|--------------|--------------|
//! | 1     | Bronze   | 0 – 250      | 10           |
//! | 2     | Silver   | 251 – 500    | 20           |
//! | 3     | Gold     | 501 – 1000   | 35           |
//! | 4     | Platinum | 1001 – 2000  | 60           |
//! | 5     | Diamond  | 2001+        | 100          |

use crate::error::RallyError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Engagement level
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Level {
    Bronze,
    Silver,
    Gold,
    Platinum,
    Diamond,
}

impl Level {
    /// All levels in ascending order
    pub const ALL: [Level; 5] = [
        Level::Bronze,
        Level::Silver,
        Level::Gold,
        Level::Platinum,
        Level::Diamond,
    ];

    /// Level number (1..=5)
    pub fn number(&self) -> u8 {
        match self {
            Self::Bronze => 1,
            Self::Silver => 2,
            Self::Gold => 3,
            Self::Platinum => 4,
            Self::Diamond => 5,
        }
    }

    /// Fixed daily token reward for holders of this level
    pub fn daily_reward(&self) -> u64 {
        match self {
            Self::Bronze => 10,
            Self::Silver => 20,
            Self::Gold => 35,
            Self::Platinum => 60,
            Self::Diamond => 100,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Bronze => "Bronze",
            Self::Silver => "Silver",
            Self::Gold => "Gold",
            Self::Platinum => "Platinum",
            Self::Diamond => "Diamond",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (level {})", self.name(), self.number())
    }
}

/// A level transition detected at flush time
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelUp {
    pub old: Level,
    pub new: Level,
}

/// Minimum XP at which each level above Bronze starts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelThresholds {
    #[serde(default = "default_silver")]
    pub silver: u64,

    #[serde(default = "default_gold")]
    pub gold: u64,

    #[serde(default = "default_platinum")]
    pub platinum: u64,

    #[serde(default = "default_diamond")]
    pub diamond: u64,
}

fn default_silver() -> u64 {
    251
}

fn default_gold() -> u64 {
    501
}

fn default_platinum() -> u64 {
    1001
}

fn default_diamond() -> u64 {
    2001
}

impl Default for LevelThresholds {
    fn default() -> Self {
        Self {
            silver: default_silver(),
            gold: default_gold(),
            platinum: default_platinum(),
            diamond: default_diamond(),
        }
    }
}

impl LevelThresholds {
    /// Thresholds must be strictly ascending and above zero so bands never overlap
    pub fn validate(&self) -> Result<(), RallyError> {
        let bounds = [self.silver, self.gold, self.platinum, self.diamond];
        if bounds[0] == 0 {
            return Err(RallyError::Configuration(
                "silver threshold must be above 0".to_string(),
            ));
        }
        if bounds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(RallyError::Configuration(format!(
                "level thresholds must be strictly ascending, got {:?}",
                bounds
            )));
        }
        Ok(())
    }

    /// Level for a total XP value
    pub fn level_for(&self, total_xp: u64) -> Level {
        if total_xp >= self.diamond {
            Level::Diamond
        } else if total_xp >= self.platinum {
            Level::Platinum
        } else if total_xp >= self.gold {
            Level::Gold
        } else if total_xp >= self.silver {
            Level::Silver
        } else {
            Level::Bronze
        }
    }

    /// Compare the level before and after a delta is applied
    pub fn transition(&self, old_xp: u64, new_xp: u64) -> Option<LevelUp> {
        let old = self.level_for(old_xp);
        let new = self.level_for(new_xp);
        (old != new).then_some(LevelUp { old, new })
    }

    /// XP still needed to reach the next level, `None` at Diamond
    pub fn xp_to_next(&self, total_xp: u64) -> Option<u64> {
        let next = match self.level_for(total_xp) {
            Level::Bronze => self.silver,
            Level::Silver => self.gold,
            Level::Gold => self.platinum,
            Level::Platinum => self.diamond,
            Level::Diamond => return None,
        };
        Some(next - total_xp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_level_boundaries() {
        let t = LevelThresholds::default();
        assert_eq!(t.level_for(0), Level::Bronze);
        assert_eq!(t.level_for(250), Level::Bronze);
        assert_eq!(t.level_for(251), Level::Silver);
        assert_eq!(t.level_for(500), Level::Silver);
        assert_eq!(t.level_for(501), Level::Gold);
        assert_eq!(t.level_for(1000), Level::Gold);
        assert_eq!(t.level_for(1001), Level::Platinum);
        assert_eq!(t.level_for(2000), Level::Platinum);
        assert_eq!(t.level_for(2001), Level::Diamond);
        assert_eq!(t.level_for(u64::MAX), Level::Diamond);
    }

    #[test]
    fn test_transition() {
        let t = LevelThresholds::default();
        assert_eq!(t.transition(240, 249), None);
        assert_eq!(
            t.transition(249, 252),
            Some(LevelUp {
                old: Level::Bronze,
                new: Level::Silver
            })
        );
        // Skipping a level reports the final level once
        assert_eq!(
            t.transition(0, 600),
            Some(LevelUp {
                old: Level::Bronze,
                new: Level::Gold
            })
        );
    }

    #[test]
    fn test_xp_to_next() {
        let t = LevelThresholds::default();
        assert_eq!(t.xp_to_next(0), Some(251));
        assert_eq!(t.xp_to_next(500), Some(1));
        assert_eq!(t.xp_to_next(5000), None);
    }

    #[test]
    fn test_validate() {
        assert!(LevelThresholds::default().validate().is_ok());

        let overlapping = LevelThresholds {
            gold: 251,
            ..Default::default()
        };
        assert!(overlapping.validate().is_err());
    }

    #[test]
    fn test_daily_rewards_ascend() {
        let rewards: Vec<u64> = Level::ALL.iter().map(|l| l.daily_reward()).collect();
        assert!(rewards.windows(2).all(|w| w[0] < w[1]));
    }

    proptest! {
        #[test]
        fn level_is_monotonic(a in 0u64..10_000, b in 0u64..10_000) {
            let t = LevelThresholds::default();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(t.level_for(lo) <= t.level_for(hi));
        }
    }
}
