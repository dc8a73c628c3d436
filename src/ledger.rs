// Rating ledger: pure stats-delta computation for one participant of one match.
//
// Flat point scoring (win +25, draw +5, loss -25 down to a floor of 800)
// plus rolling counters. Nothing in here touches storage.

use serde::{Deserialize, Serialize};

pub const STARTING_SCORE: i64 = 1000;
pub const SCORE_FLOOR: i64 = 800;

const WIN_POINTS: i64 = 25;
const LOSS_POINTS: i64 = 25;
const DRAW_POINTS: i64 = 5;

/// Match outcome from the perspective of one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Win,
    Loss,
    Draw,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Win => "win",
            Outcome::Loss => "loss",
            Outcome::Draw => "draw",
        }
    }

    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "win" => Some(Outcome::Win),
            "loss" => Some(Outcome::Loss),
            "draw" => Some(Outcome::Draw),
            _ => None,
        }
    }
}

/// Cumulative competitive statistics shared by bots and users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Stats {
    pub matches: i64,
    pub wins: i64,
    pub losses: i64,
    pub draws: i64,
    pub score: i64,
    pub win_rate: i64,
    /// Milliseconds.
    pub avg_response_time: i64,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            matches: 0,
            wins: 0,
            losses: 0,
            draws: 0,
            score: STARTING_SCORE,
            win_rate: 0,
            avg_response_time: 0,
        }
    }
}

/// Change produced by settling one match for one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsDelta {
    pub matches_delta: i64,
    pub wins_delta: i64,
    pub losses_delta: i64,
    pub draws_delta: i64,
    pub score_delta: i64,
    pub new_avg_response_time: i64,
}

/// Compute the delta for one participant given its prior stats.
pub fn compute_delta(prior: &Stats, outcome: Outcome, response_time_ms: i64) -> StatsDelta {
    let (wins_delta, losses_delta, draws_delta, new_score) = match outcome {
        Outcome::Win => (1, 0, 0, prior.score + WIN_POINTS),
        Outcome::Loss => (0, 1, 0, (prior.score - LOSS_POINTS).max(SCORE_FLOOR)),
        Outcome::Draw => (0, 0, 1, prior.score + DRAW_POINTS),
    };

    StatsDelta {
        matches_delta: 1,
        wins_delta,
        losses_delta,
        draws_delta,
        score_delta: new_score - prior.score,
        new_avg_response_time: if response_time_ms > 0 {
            rolling_average(prior.avg_response_time, prior.matches, response_time_ms)
        } else {
            prior.avg_response_time
        },
    }
}

/// Fold one sample into a mean maintained over `old_count` earlier samples.
pub fn rolling_average(old_avg: i64, old_count: i64, sample: i64) -> i64 {
    let total = old_avg as f64 * old_count as f64 + sample as f64;
    (total / (old_count + 1) as f64).round() as i64
}

/// Whole-percent win rate, 0 when no matches were played.
pub fn win_rate(wins: i64, matches: i64) -> i64 {
    if matches == 0 {
        return 0;
    }
    (100.0 * wins as f64 / matches as f64).round() as i64
}

impl Stats {
    /// Apply a delta, recomputing the derived win rate.
    pub fn apply(&self, delta: &StatsDelta) -> Stats {
        let matches = self.matches + delta.matches_delta;
        let wins = self.wins + delta.wins_delta;
        Stats {
            matches,
            wins,
            losses: self.losses + delta.losses_delta,
            draws: self.draws + delta.draws_delta,
            score: self.score + delta.score_delta,
            win_rate: win_rate(wins, matches),
            avg_response_time: delta.new_avg_response_time,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.wins + self.losses + self.draws == self.matches
    }
}

/// Display tier derived from score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RankTier {
    Iron,
    Bronze,
    Silver,
    Gold,
    Diamond,
    Master,
}

impl RankTier {
    pub fn from_score(score: i64) -> Self {
        match score {
            s if s >= 2000 => RankTier::Master,
            s if s >= 1800 => RankTier::Diamond,
            s if s >= 1600 => RankTier::Gold,
            s if s >= 1400 => RankTier::Silver,
            s if s >= 1200 => RankTier::Bronze,
            _ => RankTier::Iron,
        }
    }
}
