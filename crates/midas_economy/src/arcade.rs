//! # Arcade Desk
//!
//! Server-side scoring for the two lobby minigames. The client reports what
//! happened; this module derives the score, so a client claiming a perfect
//! run without the events to back it earns nothing.
//!
//! ## Games
//!
//! - **Icon hunt**: reveal cells on a board. An icon adds a point, a trap
//!   resets the running score to zero (the session continues), an empty
//!   cell does nothing.
//! - **Energy match**: a fixed number of draws. A correct match adds a
//!   point; a miss simply does not.
//!
//! Scores map to reward tiers through a [`ThresholdLadder`]: descending
//! steps, first match wins. Every geometry and ladder rule is checked at
//! catalog load, so a session can never hit a config error.
//!
//! Sessions live in memory only. A restart forgets them; the token rewards
//! they already paid out are in the ledger and journal like any credit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use midas_shared::{SessionId, Tier, UserId, MAX_SESSION_EVENTS};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Which minigame a session plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameType {
    /// Reveal cells, dodge traps.
    IconHunt,
    /// Match categories over a fixed number of draws.
    EnergyMatch,
}

/// One client-reported game event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Icon hunt: revealed a cell holding an icon. One point.
    IconFound,
    /// Icon hunt: revealed a trap. The running score resets to zero.
    TrapHit,
    /// Icon hunt: revealed an empty cell.
    EmptyCell,
    /// Energy match: a correct category match. One point.
    MatchCorrect,
    /// Energy match: a miss.
    MatchMiss,
}

impl SessionEvent {
    /// The game this event belongs to.
    #[must_use]
    pub fn game(self) -> GameType {
        match self {
            Self::IconFound | Self::TrapHit | Self::EmptyCell => GameType::IconHunt,
            Self::MatchCorrect | Self::MatchMiss => GameType::EnergyMatch,
        }
    }
}

/// One step of a reward ladder.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LadderStep {
    /// Minimum raw score to land on this step.
    pub min_score: u32,
    /// Tier awarded.
    pub tier: Tier,
    /// Tokens credited.
    pub tokens: u64,
}

/// Descending score thresholds. The first step the score reaches wins; a
/// score below every step earns nothing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThresholdLadder {
    /// Steps, best first.
    pub steps: Vec<LadderStep>,
}

impl ThresholdLadder {
    /// Maps a raw score to its step, if it reaches one.
    #[must_use]
    pub fn tier_for(&self, raw_score: u32) -> Option<LadderStep> {
        self.steps
            .iter()
            .find(|step| raw_score >= step.min_score)
            .copied()
    }

    /// `max_score` is the best score the game can physically produce.
    fn validate(&self, label: &str, max_score: u32) -> EngineResult<()> {
        let mut previous: Option<u32> = None;
        for step in &self.steps {
            if step.min_score == 0 {
                return Err(EngineError::InvalidConfig(format!(
                    "{label}: ladder step with min_score 0 would reward doing nothing"
                )));
            }
            if step.min_score > max_score {
                return Err(EngineError::InvalidConfig(format!(
                    "{label}: ladder step at {} is unreachable (max score {max_score})",
                    step.min_score
                )));
            }
            if let Some(prev) = previous {
                if step.min_score >= prev {
                    return Err(EngineError::InvalidConfig(format!(
                        "{label}: ladder steps must descend strictly ({} after {prev})",
                        step.min_score
                    )));
                }
            }
            previous = Some(step.min_score);
        }
        Ok(())
    }
}

/// Board geometry and rewards for the icon hunt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IconHuntRules {
    /// Cells on the board.
    pub cells: u32,
    /// Cells holding an icon.
    pub icons: u32,
    /// Cells holding a trap.
    pub traps: u32,
    /// Score-to-reward mapping.
    #[serde(default)]
    pub ladder: ThresholdLadder,
}

impl Default for IconHuntRules {
    fn default() -> Self {
        Self {
            cells: 25,
            icons: 6,
            traps: 3,
            ladder: ThresholdLadder {
                steps: vec![
                    LadderStep {
                        min_score: 6,
                        tier: Tier::SS,
                        tokens: 120,
                    },
                    LadderStep {
                        min_score: 5,
                        tier: Tier::S,
                        tokens: 60,
                    },
                    LadderStep {
                        min_score: 3,
                        tier: Tier::A,
                        tokens: 25,
                    },
                    LadderStep {
                        min_score: 1,
                        tier: Tier::C,
                        tokens: 5,
                    },
                ],
            },
        }
    }
}

/// Draw count and rewards for the energy match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnergyMatchRules {
    /// Draws in one session.
    pub draws: u32,
    /// Score-to-reward mapping.
    #[serde(default)]
    pub ladder: ThresholdLadder,
}

impl Default for EnergyMatchRules {
    fn default() -> Self {
        Self {
            draws: 10,
            ladder: ThresholdLadder {
                steps: vec![
                    LadderStep {
                        min_score: 10,
                        tier: Tier::SS,
                        tokens: 100,
                    },
                    LadderStep {
                        min_score: 8,
                        tier: Tier::S,
                        tokens: 50,
                    },
                    LadderStep {
                        min_score: 6,
                        tier: Tier::A,
                        tokens: 20,
                    },
                    LadderStep {
                        min_score: 3,
                        tier: Tier::B,
                        tokens: 8,
                    },
                    LadderStep {
                        min_score: 1,
                        tier: Tier::D,
                        tokens: 2,
                    },
                ],
            },
        }
    }
}

/// Rules for every minigame, one section of the catalog file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GameRules {
    /// Icon hunt board and rewards.
    #[serde(default)]
    pub icon_hunt: IconHuntRules,
    /// Energy match draws and rewards.
    #[serde(default)]
    pub energy_match: EnergyMatchRules,
}

impl GameRules {
    /// Checks geometry and ladders. Called from catalog validation.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidConfig`] naming the offending rule.
    pub fn validate(&self) -> EngineResult<()> {
        let hunt = &self.icon_hunt;
        if hunt.cells == 0 {
            return Err(EngineError::InvalidConfig(
                "icon_hunt: board needs at least one cell".to_string(),
            ));
        }
        if hunt.icons == 0 {
            return Err(EngineError::InvalidConfig(
                "icon_hunt: board needs at least one icon".to_string(),
            ));
        }
        // Widened before adding; these counts arrive straight from TOML.
        if u64::from(hunt.icons) + u64::from(hunt.traps) > u64::from(hunt.cells) {
            return Err(EngineError::InvalidConfig(format!(
                "icon_hunt: {} icons + {} traps exceed {} cells",
                hunt.icons, hunt.traps, hunt.cells
            )));
        }
        if hunt.cells > MAX_SESSION_EVENTS {
            return Err(EngineError::InvalidConfig(format!(
                "icon_hunt: {} cells over the {MAX_SESSION_EVENTS} event cap",
                hunt.cells
            )));
        }
        hunt.ladder.validate("icon_hunt", hunt.icons)?;

        let energy = &self.energy_match;
        if energy.draws == 0 {
            return Err(EngineError::InvalidConfig(
                "energy_match: needs at least one draw".to_string(),
            ));
        }
        if energy.draws > MAX_SESSION_EVENTS {
            return Err(EngineError::InvalidConfig(format!(
                "energy_match: {} draws over the {MAX_SESSION_EVENTS} event cap",
                energy.draws
            )));
        }
        energy.ladder.validate("energy_match", energy.draws)?;

        Ok(())
    }
}

/// Result of a submitted session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionOutcome {
    /// The submitted session.
    pub session: SessionId,
    /// The player.
    pub user: UserId,
    /// The game played.
    pub game: GameType,
    /// Derived final score.
    pub raw_score: u32,
    /// Tier reached, if the score reached any ladder step.
    pub tier: Option<Tier>,
    /// Tokens the tier pays. Zero when no tier was reached.
    pub tokens: u64,
}

/// One live session.
struct Session {
    user: UserId,
    game: GameType,
    score: u32,
    events: u32,
    icons_seen: u32,
    traps_seen: u32,
    started_at_ms: u64,
}

/// In-memory session store plus the scoring rules.
pub struct ArcadeDesk {
    rules: GameRules,
    sessions: Mutex<HashMap<SessionId, Session>>,
    next_session: AtomicU64,
}

impl ArcadeDesk {
    /// Builds a desk over validated rules.
    #[must_use]
    pub fn new(rules: GameRules) -> Self {
        Self {
            rules,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    /// Opens a session. Playing is free; only the reward side touches the
    /// ledger, and that happens at submit.
    pub fn start_session(&self, user: UserId, game: GameType, now_ms: u64) -> SessionId {
        let session = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().insert(
            session,
            Session {
                user,
                game,
                score: 0,
                events: 0,
                icons_seen: 0,
                traps_seen: 0,
                started_at_ms: now_ms,
            },
        );
        session
    }

    /// Moves the id counter past a session whose reward reference already
    /// exists in the ledger, so ids handed out after a restart stay fresh.
    pub(crate) fn resume_after(&self, session: SessionId) {
        self.next_session
            .fetch_max(session.saturating_add(1), Ordering::SeqCst);
    }

    /// Applies one game event and returns the running score.
    ///
    /// # Errors
    ///
    /// [`EngineError::SessionNotFound`] for an unknown session,
    /// [`EngineError::InvalidSessionEvent`] when the event belongs to the
    /// other game or the board cannot physically produce it (more reveals
    /// than cells, more icons than the board holds, and so on).
    pub fn record_event(&self, session: SessionId, event: SessionEvent) -> EngineResult<u32> {
        let mut sessions = self.sessions.lock();
        let state = sessions
            .get_mut(&session)
            .ok_or(EngineError::SessionNotFound(session))?;

        if event.game() != state.game {
            return Err(EngineError::InvalidSessionEvent(session));
        }

        let within_board = match state.game {
            GameType::IconHunt => {
                let hunt = &self.rules.icon_hunt;
                state.events < hunt.cells
                    && match event {
                        SessionEvent::IconFound => state.icons_seen < hunt.icons,
                        SessionEvent::TrapHit => state.traps_seen < hunt.traps,
                        _ => true,
                    }
            }
            GameType::EnergyMatch => state.events < self.rules.energy_match.draws,
        };
        if !within_board {
            return Err(EngineError::InvalidSessionEvent(session));
        }

        state.events += 1;
        match event {
            SessionEvent::IconFound => {
                state.icons_seen += 1;
                state.score += 1;
            }
            SessionEvent::TrapHit => {
                state.traps_seen += 1;
                state.score = 0;
            }
            SessionEvent::MatchCorrect => state.score += 1,
            SessionEvent::EmptyCell | SessionEvent::MatchMiss => {}
        }
        Ok(state.score)
    }

    /// Closes a session and evaluates its ladder. The session is gone
    /// afterwards; a second submit is [`EngineError::SessionNotFound`].
    ///
    /// The desk only scores. Crediting the reward (and journaling it under
    /// the session's idempotency reference) is the facade's job.
    ///
    /// # Errors
    ///
    /// [`EngineError::SessionNotFound`].
    pub fn submit_session(&self, session: SessionId) -> EngineResult<SessionOutcome> {
        let state = self
            .sessions
            .lock()
            .remove(&session)
            .ok_or(EngineError::SessionNotFound(session))?;

        let ladder = match state.game {
            GameType::IconHunt => &self.rules.icon_hunt.ladder,
            GameType::EnergyMatch => &self.rules.energy_match.ladder,
        };
        let step = ladder.tier_for(state.score);

        Ok(SessionOutcome {
            session,
            user: state.user,
            game: state.game,
            raw_score: state.score,
            tier: step.map(|s| s.tier),
            tokens: step.map_or(0, |s| s.tokens),
        })
    }

    /// Running score of a live session.
    #[must_use]
    pub fn score_of(&self, session: SessionId) -> Option<u32> {
        self.sessions.lock().get(&session).map(|s| s.score)
    }

    /// Live session count.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Drops sessions older than `max_age_ms`. Abandoned boards pay
    /// nothing; the reaper calls this so they do not pile up.
    pub fn sweep_stale(&self, now_ms: u64, max_age_ms: u64) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| now_ms.saturating_sub(s.started_at_ms) < max_age_ms);
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desk() -> ArcadeDesk {
        ArcadeDesk::new(GameRules::default())
    }

    #[test]
    fn test_ladder_first_match_wins() {
        let ladder = GameRules::default().icon_hunt.ladder;
        assert_eq!(ladder.tier_for(6).unwrap().tier, Tier::SS);
        assert_eq!(ladder.tier_for(5).unwrap().tier, Tier::S);
        assert_eq!(ladder.tier_for(4).unwrap().tier, Tier::A);
        assert_eq!(ladder.tier_for(1).unwrap().tier, Tier::C);
        assert!(ladder.tier_for(0).is_none());
    }

    #[test]
    fn test_default_rules_validate() {
        GameRules::default().validate().unwrap();
    }

    #[test]
    fn test_zero_threshold_step_rejected() {
        let mut rules = GameRules::default();
        rules.icon_hunt.ladder.steps.push(LadderStep {
            min_score: 0,
            tier: Tier::D,
            tokens: 1,
        });
        let err = rules.validate().unwrap_err();
        assert!(err.to_string().contains("min_score 0"));
    }

    #[test]
    fn test_non_descending_ladder_rejected() {
        let mut rules = GameRules::default();
        rules.energy_match.ladder.steps = vec![
            LadderStep {
                min_score: 3,
                tier: Tier::B,
                tokens: 5,
            },
            LadderStep {
                min_score: 7,
                tier: Tier::S,
                tokens: 50,
            },
        ];
        let err = rules.validate().unwrap_err();
        assert!(err.to_string().contains("descend"));
    }

    #[test]
    fn test_unreachable_step_rejected() {
        let mut rules = GameRules::default();
        // Max icon hunt score is the icon count.
        rules.icon_hunt.ladder.steps.insert(
            0,
            LadderStep {
                min_score: rules.icon_hunt.icons + 1,
                tier: Tier::SSS,
                tokens: 999,
            },
        );
        let err = rules.validate().unwrap_err();
        assert!(err.to_string().contains("unreachable"));
    }

    #[test]
    fn test_overstuffed_board_rejected() {
        let mut rules = GameRules::default();
        rules.icon_hunt.cells = 5;
        rules.icon_hunt.icons = 4;
        rules.icon_hunt.traps = 2;
        // Unreachable ladder steps would also trip; clear them to isolate
        // the geometry rule.
        rules.icon_hunt.ladder.steps.clear();
        let err = rules.validate().unwrap_err();
        assert!(err.to_string().contains("exceed"));
    }

    #[test]
    fn test_extreme_board_counts_rejected() {
        // Counts near u32::MAX must fail the geometry check, not wrap
        // through the addition.
        let mut rules = GameRules::default();
        rules.icon_hunt.icons = u32::MAX;
        rules.icon_hunt.traps = 2;
        let err = rules.validate().unwrap_err();
        assert!(err.to_string().contains("exceed"));
    }

    #[test]
    fn test_trap_resets_score_but_session_continues() {
        let desk = desk();
        let session = desk.start_session(7, GameType::IconHunt, 1_000);

        assert_eq!(desk.record_event(session, SessionEvent::IconFound).unwrap(), 1);
        assert_eq!(desk.record_event(session, SessionEvent::IconFound).unwrap(), 2);
        assert_eq!(desk.record_event(session, SessionEvent::IconFound).unwrap(), 3);
        assert_eq!(desk.record_event(session, SessionEvent::TrapHit).unwrap(), 0);
        assert_eq!(desk.record_event(session, SessionEvent::IconFound).unwrap(), 1);

        let outcome = desk.submit_session(session).unwrap();
        assert_eq!(outcome.raw_score, 1);
        assert_eq!(outcome.tier, Some(Tier::C));
        assert_eq!(outcome.tokens, 5);
    }

    #[test]
    fn test_energy_misses_do_not_reset() {
        let desk = desk();
        let session = desk.start_session(7, GameType::EnergyMatch, 1_000);
        for _ in 0..3 {
            desk.record_event(session, SessionEvent::MatchCorrect).unwrap();
        }
        desk.record_event(session, SessionEvent::MatchMiss).unwrap();
        assert_eq!(desk.score_of(session), Some(3));

        let outcome = desk.submit_session(session).unwrap();
        assert_eq!(outcome.raw_score, 3);
        assert_eq!(outcome.tier, Some(Tier::B));
    }

    #[test]
    fn test_fruitless_session_earns_nothing() {
        let desk = desk();
        let session = desk.start_session(7, GameType::IconHunt, 1_000);
        desk.record_event(session, SessionEvent::EmptyCell).unwrap();
        let outcome = desk.submit_session(session).unwrap();
        assert_eq!(outcome.raw_score, 0);
        assert_eq!(outcome.tier, None);
        assert_eq!(outcome.tokens, 0);
    }

    #[test]
    fn test_event_from_the_wrong_game_rejected() {
        let desk = desk();
        let session = desk.start_session(7, GameType::IconHunt, 1_000);
        let err = desk
            .record_event(session, SessionEvent::MatchCorrect)
            .unwrap_err();
        assert_eq!(err, EngineError::InvalidSessionEvent(session));
        // The session is still live and scoreable.
        assert!(desk.record_event(session, SessionEvent::IconFound).is_ok());
    }

    #[test]
    fn test_board_bounds_cap_the_event_stream() {
        let desk = desk();
        let icons = GameRules::default().icon_hunt.icons;

        let session = desk.start_session(7, GameType::IconHunt, 1_000);
        for _ in 0..icons {
            desk.record_event(session, SessionEvent::IconFound).unwrap();
        }
        // The board has no seventh icon to find.
        let err = desk
            .record_event(session, SessionEvent::IconFound)
            .unwrap_err();
        assert_eq!(err, EngineError::InvalidSessionEvent(session));

        let draws = GameRules::default().energy_match.draws;
        let session = desk.start_session(8, GameType::EnergyMatch, 1_000);
        for _ in 0..draws {
            desk.record_event(session, SessionEvent::MatchMiss).unwrap();
        }
        let err = desk
            .record_event(session, SessionEvent::MatchMiss)
            .unwrap_err();
        assert_eq!(err, EngineError::InvalidSessionEvent(session));
    }

    #[test]
    fn test_submit_is_terminal() {
        let desk = desk();
        let session = desk.start_session(7, GameType::EnergyMatch, 1_000);
        desk.submit_session(session).unwrap();
        let err = desk.submit_session(session).unwrap_err();
        assert_eq!(err, EngineError::SessionNotFound(session));
    }

    #[test]
    fn test_unknown_session() {
        let desk = desk();
        assert_eq!(
            desk.record_event(999, SessionEvent::IconFound).unwrap_err(),
            EngineError::SessionNotFound(999)
        );
    }

    #[test]
    fn test_sweep_drops_abandoned_sessions() {
        let desk = desk();
        let old = desk.start_session(1, GameType::IconHunt, 1_000);
        let young = desk.start_session(2, GameType::IconHunt, 50_000);

        let dropped = desk.sweep_stale(61_000, 30_000);
        assert_eq!(dropped, 1);
        assert!(desk.score_of(old).is_none());
        assert!(desk.score_of(young).is_some());
    }
}
