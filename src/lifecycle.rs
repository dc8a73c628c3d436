// Match state machine: the in-memory aggregate for one contest.
//
// Transitions validate against the current state and only mutate `self` when
// they succeed. Persistence is the caller's job (see `arena` and `db::matches`);
// every persisted write is guarded by the status the transition started from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ArenaError, Result};
use crate::ledger::Outcome;

pub const MIN_PARTICIPANTS: usize = 2;

/// Per-match settings supplied at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSettings {
    /// Per-move budget in milliseconds, enforced by the game runner.
    #[serde(default)]
    pub time_per_move: Option<i64>,
    #[serde(default)]
    pub max_moves: Option<i64>,
    #[serde(default = "default_ranked")]
    pub ranked: bool,
}

fn default_ranked() -> bool {
    true
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            time_per_move: None,
            max_moves: None,
            ranked: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    pub stack: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// How a finished match ended. Replaces the loose status/result string pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminalOutcome {
    Decisive { winner_bot_id: i64 },
    Draw,
    Timeout { winner_bot_id: Option<i64> },
    Error(ErrorDetail),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchState {
    Pending,
    InProgress,
    Finished(TerminalOutcome),
}

impl MatchState {
    /// Persisted `status` column value.
    pub fn status(&self) -> &'static str {
        match self {
            MatchState::Pending => "pending",
            MatchState::InProgress => "in_progress",
            MatchState::Finished(TerminalOutcome::Error(_)) => "error",
            MatchState::Finished(TerminalOutcome::Cancelled) => "cancelled",
            MatchState::Finished(_) => "completed",
        }
    }

    /// Persisted `result` column value, set once the match is finished.
    pub fn result(&self) -> Option<&'static str> {
        match self {
            MatchState::Finished(outcome) => Some(match outcome {
                TerminalOutcome::Decisive { .. } => "completed",
                TerminalOutcome::Draw => "draw",
                TerminalOutcome::Timeout { .. } => "timeout",
                TerminalOutcome::Error(_) => "error",
                TerminalOutcome::Cancelled => "cancelled",
            }),
            _ => None,
        }
    }

    pub fn winner_bot_id(&self) -> Option<i64> {
        match self {
            MatchState::Finished(TerminalOutcome::Decisive { winner_bot_id }) => {
                Some(*winner_bot_id)
            }
            MatchState::Finished(TerminalOutcome::Timeout { winner_bot_id }) => *winner_bot_id,
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MatchState::Finished(_))
    }

    /// Rebuild the state from its persisted columns.
    pub fn from_columns(
        status: &str,
        result: Option<&str>,
        winner_bot_id: Option<i64>,
        error: Option<ErrorDetail>,
    ) -> Result<Self> {
        let state = match (status, result) {
            ("pending", _) => MatchState::Pending,
            ("in_progress", _) => MatchState::InProgress,
            ("completed", Some("completed")) => match winner_bot_id {
                Some(winner_bot_id) => {
                    MatchState::Finished(TerminalOutcome::Decisive { winner_bot_id })
                }
                None => MatchState::Finished(TerminalOutcome::Draw),
            },
            ("completed", Some("draw")) => MatchState::Finished(TerminalOutcome::Draw),
            ("completed", Some("timeout")) => {
                MatchState::Finished(TerminalOutcome::Timeout { winner_bot_id })
            }
            ("error", _) => {
                let detail = error.ok_or_else(|| {
                    ArenaError::Validation("errored match without error detail".into())
                })?;
                MatchState::Finished(TerminalOutcome::Error(detail))
            }
            ("cancelled", _) => MatchState::Finished(TerminalOutcome::Cancelled),
            (status, result) => {
                return Err(ArenaError::Validation(format!(
                    "unknown match status/result pair {status}/{result:?}"
                )))
            }
        };
        Ok(state)
    }
}

/// Settlement progress of a match's rating updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementState {
    /// Not finished yet.
    None,
    /// Marker rows exist that have not all been applied.
    Pending,
    Settled,
    /// Finished without moving any ratings.
    Unrated,
}

impl SettlementState {
    pub fn as_str(self) -> &'static str {
        match self {
            SettlementState::None => "none",
            SettlementState::Pending => "pending",
            SettlementState::Settled => "settled",
            SettlementState::Unrated => "unrated",
        }
    }

    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "none" => Some(SettlementState::None),
            "pending" => Some(SettlementState::Pending),
            "settled" => Some(SettlementState::Settled),
            "unrated" => Some(SettlementState::Unrated),
            _ => None,
        }
    }
}

/// How the game runner reports a successful finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionKind {
    Completed,
    Draw,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Participant {
    pub bot_id: i64,
    pub user_id: i64,
    pub position: Option<i64>,
    pub score: i64,
    pub moves: i64,
    pub avg_response_time: i64,
    pub errors: i64,
}

impl Participant {
    pub fn new(bot_id: i64, user_id: i64) -> Self {
        Self {
            bot_id,
            user_id,
            position: None,
            score: 0,
            moves: 0,
            avg_response_time: 0,
            errors: 0,
        }
    }
}

/// Final per-participant figures reported alongside a completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantReport {
    pub bot_id: i64,
    #[serde(default)]
    pub position: Option<i64>,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub avg_response_time: i64,
    #[serde(default)]
    pub errors: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveEntry {
    /// 1-based position in the log.
    pub seq: i64,
    pub bot_id: i64,
    #[serde(rename = "move")]
    pub payload: Value,
    pub state: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub id: i64,
    pub match_id: String,
    pub game_id: i64,
    pub participants: Vec<Participant>,
    pub state: MatchState,
    pub settings: MatchSettings,
    pub total_moves: i64,
    pub initial_state: Option<Value>,
    pub final_state: Option<Value>,
    /// Loaded on demand; empty when the caller did not ask for the log.
    pub moves: Vec<MoveEntry>,
    pub duration: i64,
    pub settlement: SettlementState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub fn new_match_id() -> String {
    format!("match_{}", uuid::Uuid::new_v4().simple())
}

/// Whole seconds between two instants, rounded to nearest.
pub fn duration_seconds(started: DateTime<Utc>, completed: DateTime<Utc>) -> i64 {
    ((completed - started).num_milliseconds() as f64 / 1000.0).round() as i64
}

impl Match {
    pub fn new(game_id: i64, settings: MatchSettings, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            match_id: new_match_id(),
            game_id,
            participants: Vec::new(),
            state: MatchState::Pending,
            settings,
            total_moves: 0,
            initial_state: None,
            final_state: None,
            moves: Vec::new(),
            duration: 0,
            settlement: SettlementState::None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn status(&self) -> &'static str {
        self.state.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn participant(&self, bot_id: i64) -> Option<&Participant> {
        self.participants.iter().find(|p| p.bot_id == bot_id)
    }

    fn reject(&self, action: &'static str) -> ArenaError {
        ArenaError::InvalidTransition {
            action,
            status: self.status(),
        }
    }

    pub fn add_participant(&mut self, bot_id: i64, user_id: i64) -> Result<()> {
        if self.state != MatchState::Pending {
            return Err(self.reject("add a participant to"));
        }
        if self.participant(bot_id).is_some() {
            return Err(ArenaError::DuplicateParticipant(bot_id));
        }
        self.participants.push(Participant::new(bot_id, user_id));
        Ok(())
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.state {
            MatchState::Pending => {}
            MatchState::InProgress => return Err(ArenaError::AlreadyStarted),
            MatchState::Finished(_) => return Err(self.reject("start")),
        }
        if self.participants.len() < MIN_PARTICIPANTS {
            return Err(ArenaError::InvalidParticipantCount {
                min: MIN_PARTICIPANTS,
                found: self.participants.len(),
            });
        }
        self.state = MatchState::InProgress;
        self.started_at = Some(now);
        Ok(())
    }

    /// Append a move to the log and return the new entry.
    pub fn record_move(
        &mut self,
        bot_id: i64,
        payload: Value,
        resulting_state: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<MoveEntry> {
        if self.state != MatchState::InProgress {
            return Err(self.reject("record a move for"));
        }
        let idx = self
            .participants
            .iter()
            .position(|p| p.bot_id == bot_id)
            .ok_or(ArenaError::UnknownParticipant(bot_id))?;
        if let Some(max) = self.settings.max_moves {
            if self.total_moves >= max {
                return Err(ArenaError::MoveLimitReached(max));
            }
        }

        self.total_moves += 1;
        self.participants[idx].moves += 1;
        if resulting_state.is_some() {
            self.final_state = resulting_state.clone();
        }
        let entry = MoveEntry {
            seq: self.total_moves,
            bot_id,
            payload,
            state: resulting_state,
            timestamp: now,
        };
        self.moves.push(entry.clone());
        Ok(entry)
    }

    pub fn complete(
        &mut self,
        winner_bot_id: Option<i64>,
        kind: CompletionKind,
        reports: &[ParticipantReport],
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.state != MatchState::InProgress {
            return Err(self.reject("complete"));
        }
        if let Some(winner) = winner_bot_id {
            if self.participant(winner).is_none() {
                return Err(ArenaError::UnknownWinner(winner));
            }
        }
        if let Some(report) = reports.iter().find(|r| self.participant(r.bot_id).is_none()) {
            return Err(ArenaError::UnknownParticipant(report.bot_id));
        }

        let outcome = match (kind, winner_bot_id) {
            (CompletionKind::Completed, Some(winner_bot_id)) => {
                TerminalOutcome::Decisive { winner_bot_id }
            }
            (CompletionKind::Completed, None) | (CompletionKind::Draw, None) => {
                TerminalOutcome::Draw
            }
            (CompletionKind::Draw, Some(_)) => return Err(ArenaError::DrawWithWinner),
            (CompletionKind::Timeout, winner_bot_id) => TerminalOutcome::Timeout { winner_bot_id },
        };

        for p in self.participants.iter_mut() {
            if let Some(r) = reports.iter().find(|r| r.bot_id == p.bot_id) {
                p.position = r.position;
                p.score = r.score;
                p.avg_response_time = r.avg_response_time;
                p.errors = r.errors;
            }
            if p.position.is_none() {
                p.position = Some(match winner_bot_id {
                    Some(w) if w != p.bot_id => 2,
                    _ => 1,
                });
            }
        }

        self.finish(outcome, now);
        Ok(())
    }

    pub fn set_error(
        &mut self,
        message: impl Into<String>,
        stack: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.is_terminal() {
            return Err(self.reject("fail"));
        }
        let detail = ErrorDetail {
            message: message.into(),
            stack,
            timestamp: now,
        };
        self.finish(TerminalOutcome::Error(detail), now);
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.is_terminal() {
            return Err(self.reject("cancel"));
        }
        self.finish(TerminalOutcome::Cancelled, now);
        Ok(())
    }

    fn finish(&mut self, outcome: TerminalOutcome, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        self.duration = self
            .started_at
            .map(|started| duration_seconds(started, now))
            .unwrap_or(0);
        self.state = MatchState::Finished(outcome);
    }

    /// Ledger outcome for one participant, if this finish counts as a result.
    pub fn outcome_for(&self, bot_id: i64) -> Option<Outcome> {
        let winner = match &self.state {
            MatchState::Finished(TerminalOutcome::Decisive { winner_bot_id }) => {
                Some(*winner_bot_id)
            }
            MatchState::Finished(TerminalOutcome::Draw) => None,
            MatchState::Finished(TerminalOutcome::Timeout { winner_bot_id }) => *winner_bot_id,
            _ => return None,
        };
        self.participant(bot_id)?;
        Some(match winner {
            Some(w) if w == bot_id => Outcome::Win,
            Some(_) => Outcome::Loss,
            None => Outcome::Draw,
        })
    }

    pub fn public_view(&self) -> PublicMatch {
        let error = match &self.state {
            MatchState::Finished(TerminalOutcome::Error(detail)) => Some(PublicError {
                message: detail.message.clone(),
                timestamp: detail.timestamp,
            }),
            _ => None,
        };
        PublicMatch {
            match_id: self.match_id.clone(),
            game_id: self.game_id,
            status: self.status().to_string(),
            result: self.state.result().map(str::to_string),
            winner_bot_id: self.state.winner_bot_id(),
            participants: self.participants.clone(),
            total_moves: self.total_moves,
            duration: self.duration,
            settings: self.settings.clone(),
            settlement: self.settlement,
            error,
            moves: self
                .moves
                .iter()
                .map(|m| PublicMove {
                    bot_id: m.bot_id,
                    timestamp: m.timestamp,
                    payload: m.payload.clone(),
                })
                .collect(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicError {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicMove {
    pub bot_id: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "move")]
    pub payload: Value,
}

/// Externally visible projection of a match: no error stack, no state snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicMatch {
    pub match_id: String,
    pub game_id: i64,
    pub status: String,
    pub result: Option<String>,
    pub winner_bot_id: Option<i64>,
    pub participants: Vec<Participant>,
    pub total_moves: i64,
    pub duration: i64,
    pub settings: MatchSettings,
    pub settlement: SettlementState,
    pub error: Option<PublicError>,
    pub moves: Vec<PublicMove>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}
