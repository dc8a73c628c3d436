// Match persistence: records, participants, the move log and terminal writes.
//
// Every mutation is guarded by the status it expects to find, so a stale
// in-memory `Match` can never overwrite a newer persisted one.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;

use super::Database;
use crate::error::{ArenaError, EntityRef, Result};
use crate::ledger::Outcome;
use crate::lifecycle::{
    ErrorDetail, Match, MatchSettings, MatchState, MoveEntry, Participant, SettlementState,
    TerminalOutcome,
};

/// Settlement marker row written in the same transaction as a completion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSettlement {
    pub entity: EntityRef,
    /// `None` for game counter rows.
    pub outcome: Option<Outcome>,
    pub response_time: i64,
    pub duration: i64,
}

const MATCH_COLUMNS: &str = "id, match_id, game_id, status, result, winner_bot_id, total_moves, duration, initial_state, final_state, error_message, error_stack, error_at, time_per_move, max_moves, ranked, settlement_state, created_at, started_at, completed_at";

#[derive(Debug, sqlx::FromRow)]
struct MatchRow {
    id: i64,
    match_id: String,
    game_id: i64,
    status: String,
    result: Option<String>,
    winner_bot_id: Option<i64>,
    total_moves: i64,
    duration: i64,
    initial_state: Option<Json<Value>>,
    final_state: Option<Json<Value>>,
    error_message: Option<String>,
    error_stack: Option<String>,
    error_at: Option<DateTime<Utc>>,
    time_per_move: Option<i64>,
    max_moves: Option<i64>,
    ranked: bool,
    settlement_state: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct MoveRow {
    seq: i64,
    bot_id: i64,
    payload: Json<Value>,
    state: Option<Json<Value>>,
    recorded_at: DateTime<Utc>,
}

impl MatchRow {
    fn into_match(self, participants: Vec<Participant>, moves: Vec<MoveEntry>) -> Result<Match> {
        let error = match (self.error_message, self.error_at) {
            (Some(message), Some(timestamp)) => Some(ErrorDetail {
                message,
                stack: self.error_stack,
                timestamp,
            }),
            _ => None,
        };
        let state = MatchState::from_columns(
            &self.status,
            self.result.as_deref(),
            self.winner_bot_id,
            error,
        )?;
        let settlement = SettlementState::from_str_name(&self.settlement_state).ok_or_else(|| {
            ArenaError::Validation(format!(
                "unknown settlement state {}",
                self.settlement_state
            ))
        })?;

        Ok(Match {
            id: self.id,
            match_id: self.match_id,
            game_id: self.game_id,
            participants,
            state,
            settings: MatchSettings {
                time_per_move: self.time_per_move,
                max_moves: self.max_moves,
                ranked: self.ranked,
            },
            total_moves: self.total_moves,
            initial_state: self.initial_state.map(|j| j.0),
            final_state: self.final_state.map(|j| j.0),
            moves,
            duration: self.duration,
            settlement,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

fn error_columns(m: &Match) -> (Option<&str>, Option<&str>, Option<DateTime<Utc>>) {
    match &m.state {
        MatchState::Finished(TerminalOutcome::Error(detail)) => (
            Some(detail.message.as_str()),
            detail.stack.as_deref(),
            Some(detail.timestamp),
        ),
        _ => (None, None, None),
    }
}

impl Database {
    /// Insert a freshly created match with any participants it already has.
    /// Returns the row id.
    pub async fn insert_match(&self, m: &Match) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO matches (match_id, game_id, status, initial_state, time_per_move, max_moves, ranked, settlement_state, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&m.match_id)
        .bind(m.game_id)
        .bind(m.status())
        .bind(m.initial_state.as_ref().map(Json))
        .bind(m.settings.time_per_move)
        .bind(m.settings.max_moves)
        .bind(m.settings.ranked)
        .bind(m.settlement.as_str())
        .bind(m.created_at)
        .fetch_one(&mut *tx)
        .await?;

        for (slot, p) in m.participants.iter().enumerate() {
            sqlx::query(
                "INSERT INTO match_participants (match_id, slot, bot_id, user_id) VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(slot as i64 + 1)
            .bind(p.bot_id)
            .bind(p.user_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    /// Append a participant while the match is still pending.
    /// Returns false if the match has moved on.
    pub async fn insert_participant(&self, match_pk: i64, p: &Participant) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO match_participants (match_id, slot, bot_id, user_id) \
             SELECT ?, COALESCE((SELECT MAX(slot) FROM match_participants WHERE match_id = ?), 0) + 1, ?, ? \
             WHERE EXISTS (SELECT 1 FROM matches WHERE id = ? AND status = 'pending')",
        )
        .bind(match_pk)
        .bind(match_pk)
        .bind(p.bot_id)
        .bind(p.user_id)
        .bind(match_pk)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn load_match(&self, match_id: &str, with_moves: bool) -> Result<Option<Match>> {
        let row = sqlx::query_as::<_, MatchRow>(&format!(
            "SELECT {MATCH_COLUMNS} FROM matches WHERE match_id = ?"
        ))
        .bind(match_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate(row, with_moves).await?)),
            None => Ok(None),
        }
    }

    async fn hydrate(&self, row: MatchRow, with_moves: bool) -> Result<Match> {
        let participants = sqlx::query_as::<_, Participant>(
            "SELECT bot_id, user_id, position, score, moves, avg_response_time, errors \
             FROM match_participants WHERE match_id = ? ORDER BY slot",
        )
        .bind(row.id)
        .fetch_all(&self.pool)
        .await?;

        let moves = if with_moves {
            sqlx::query_as::<_, MoveRow>(
                "SELECT seq, bot_id, payload, state, recorded_at FROM match_moves WHERE match_id = ? ORDER BY seq",
            )
            .bind(row.id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|m| MoveEntry {
                seq: m.seq,
                bot_id: m.bot_id,
                payload: m.payload.0,
                state: m.state.map(|s| s.0),
                timestamp: m.recorded_at,
            })
            .collect()
        } else {
            Vec::new()
        };

        row.into_match(participants, moves)
    }

    async fn hydrate_all(&self, rows: Vec<MatchRow>) -> Result<Vec<Match>> {
        let mut matches = Vec::with_capacity(rows.len());
        for row in rows {
            matches.push(self.hydrate(row, false).await?);
        }
        Ok(matches)
    }

    /// Persist `pending -> in_progress`. Returns false if the match was not pending.
    pub async fn save_start(&self, m: &Match) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE matches SET status = ?, started_at = ?, initial_state = COALESCE(?, initial_state), \
             final_state = COALESCE(?, final_state) WHERE id = ? AND status = 'pending'",
        )
        .bind(m.status())
        .bind(m.started_at)
        .bind(m.initial_state.as_ref().map(Json))
        .bind(m.final_state.as_ref().map(Json))
        .bind(m.id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Append one move. The write only lands if the match is still running and
    /// no other move took this sequence number.
    pub async fn append_move(&self, m: &Match, entry: &MoveEntry) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            "UPDATE matches SET total_moves = ?, final_state = COALESCE(?, final_state) \
             WHERE id = ? AND status = 'in_progress' AND total_moves = ?",
        )
        .bind(entry.seq)
        .bind(entry.state.as_ref().map(Json))
        .bind(m.id)
        .bind(entry.seq - 1)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO match_moves (match_id, seq, bot_id, payload, state, recorded_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(m.id)
        .bind(entry.seq)
        .bind(entry.bot_id)
        .bind(Json(&entry.payload))
        .bind(entry.state.as_ref().map(Json))
        .bind(entry.timestamp)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE match_participants SET moves = moves + 1 WHERE match_id = ? AND bot_id = ?")
            .bind(m.id)
            .bind(entry.bot_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Persist a terminal transition together with its settlement marker rows.
    /// Returns false if the stored status no longer equals `from_status`.
    pub async fn save_terminal(
        &self,
        m: &Match,
        from_status: &str,
        settlements: &[NewSettlement],
    ) -> Result<bool> {
        let (error_message, error_stack, error_at) = error_columns(m);
        let mut tx = self.pool.begin().await?;

        let finished = sqlx::query(
            "UPDATE matches SET status = ?, result = ?, winner_bot_id = ?, duration = ?, final_state = ?, \
             error_message = ?, error_stack = ?, error_at = ?, settlement_state = ?, completed_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(m.status())
        .bind(m.state.result())
        .bind(m.state.winner_bot_id())
        .bind(m.duration)
        .bind(m.final_state.as_ref().map(Json))
        .bind(error_message)
        .bind(error_stack)
        .bind(error_at)
        .bind(m.settlement.as_str())
        .bind(m.completed_at)
        .bind(m.id)
        .bind(from_status)
        .execute(&mut *tx)
        .await?;
        if finished.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for p in &m.participants {
            sqlx::query(
                "UPDATE match_participants SET position = ?, score = ?, avg_response_time = ?, errors = ? \
                 WHERE match_id = ? AND bot_id = ?",
            )
            .bind(p.position)
            .bind(p.score)
            .bind(p.avg_response_time)
            .bind(p.errors)
            .bind(m.id)
            .bind(p.bot_id)
            .execute(&mut *tx)
            .await?;
        }

        let now = Utc::now();
        for s in settlements {
            sqlx::query(
                "INSERT INTO match_settlements (match_id, entity_kind, entity_id, outcome, response_time, duration, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(m.id)
            .bind(s.entity.kind.as_str())
            .bind(s.entity.id)
            .bind(s.outcome.map(Outcome::as_str))
            .bind(s.response_time)
            .bind(s.duration)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Completed matches a user took part in, newest first.
    pub async fn match_history_for_user(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Match>> {
        let rows = sqlx::query_as::<_, MatchRow>(&format!(
            "SELECT {MATCH_COLUMNS} FROM matches WHERE status = 'completed' \
             AND id IN (SELECT match_id FROM match_participants WHERE user_id = ?) \
             ORDER BY completed_at DESC, id DESC LIMIT ? OFFSET ?"
        ))
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate_all(rows).await
    }

    /// Completed matches a bot took part in, newest first.
    pub async fn match_history_for_bot(
        &self,
        bot_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Match>> {
        let rows = sqlx::query_as::<_, MatchRow>(&format!(
            "SELECT {MATCH_COLUMNS} FROM matches WHERE status = 'completed' \
             AND id IN (SELECT match_id FROM match_participants WHERE bot_id = ?) \
             ORDER BY completed_at DESC, id DESC LIMIT ? OFFSET ?"
        ))
        .bind(bot_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate_all(rows).await
    }

    pub async fn recent_matches(&self, game_id: Option<i64>, limit: i64) -> Result<Vec<Match>> {
        let rows = sqlx::query_as::<_, MatchRow>(&format!(
            "SELECT {MATCH_COLUMNS} FROM matches WHERE status = 'completed' \
             AND (? IS NULL OR game_id = ?) ORDER BY completed_at DESC, id DESC LIMIT ?"
        ))
        .bind(game_id)
        .bind(game_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate_all(rows).await
    }
}
