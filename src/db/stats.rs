// Versioned stats writes and settlement bookkeeping.
//
// A commit performs the compare-and-set on the entity row as the first
// statement of its transaction, then claims the settlement row. Either both
// land or neither does.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::Database;
use crate::error::{ArenaError, EntityKind, EntityRef, Result};
use crate::ledger::{Outcome, Stats};

/// Stats block plus the version token it was read at.
#[derive(Debug, Clone, Copy, PartialEq, sqlx::FromRow)]
pub struct VersionedStats {
    #[sqlx(flatten)]
    pub stats: Stats,
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, sqlx::FromRow)]
pub struct GameCounters {
    pub total_matches: i64,
    pub avg_match_duration: i64,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct SettlementRow {
    pub id: i64,
    pub match_id: i64,
    pub entity_kind: String,
    pub entity_id: i64,
    pub outcome: Option<String>,
    pub response_time: i64,
    pub duration: i64,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl SettlementRow {
    pub fn entity(&self) -> Result<EntityRef> {
        let kind = EntityKind::from_str_name(&self.entity_kind).ok_or_else(|| {
            ArenaError::Validation(format!("unknown entity kind {}", self.entity_kind))
        })?;
        Ok(EntityRef {
            kind,
            id: self.entity_id,
        })
    }

    pub fn outcome(&self) -> Result<Outcome> {
        self.outcome
            .as_deref()
            .and_then(Outcome::from_str_name)
            .ok_or_else(|| {
                ArenaError::Validation(format!("settlement row {} has no outcome", self.id))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    /// The entity changed since it was read; re-read and try again.
    VersionConflict,
    /// Someone else already applied this settlement row.
    AlreadySettled,
}

/// Column stamped with the settlement time on each entity kind.
fn activity_column(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Bot => "last_run",
        EntityKind::User => "last_active",
        EntityKind::Game => "updated_at",
    }
}

const SETTLEMENT_COLUMNS: &str = "id, match_id, entity_kind, entity_id, outcome, response_time, duration, attempts, last_error, settled_at";

impl Database {
    pub async fn get_entity_stats(&self, entity: EntityRef) -> Result<Option<VersionedStats>> {
        if entity.kind == EntityKind::Game {
            return Err(ArenaError::Validation(
                "games carry counters, not a stats block".into(),
            ));
        }
        let stats = sqlx::query_as::<_, VersionedStats>(&format!(
            "SELECT matches, wins, losses, draws, score, win_rate, avg_response_time, version FROM {} WHERE id = ?",
            entity.kind.table()
        ))
        .bind(entity.id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(stats)
    }

    pub async fn get_game_counters(&self, game_id: i64) -> Result<Option<GameCounters>> {
        let counters = sqlx::query_as::<_, GameCounters>(
            "SELECT total_matches, avg_match_duration, version FROM games WHERE id = ?",
        )
        .bind(game_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(counters)
    }

    /// Write `next` over a bot or user read at `expected_version` and mark the
    /// settlement row applied, atomically.
    pub async fn commit_entity_settlement(
        &self,
        settlement_id: i64,
        entity: EntityRef,
        expected_version: i64,
        next: &Stats,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(&format!(
            "UPDATE {} SET matches = ?, wins = ?, losses = ?, draws = ?, score = ?, win_rate = ?, \
             avg_response_time = ?, {} = ?, updated_at = ?, version = version + 1 \
             WHERE id = ? AND version = ?",
            entity.kind.table(),
            activity_column(entity.kind)
        ))
        .bind(next.matches)
        .bind(next.wins)
        .bind(next.losses)
        .bind(next.draws)
        .bind(next.score)
        .bind(next.win_rate)
        .bind(next.avg_response_time)
        .bind(now)
        .bind(now)
        .bind(entity.id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(CommitOutcome::VersionConflict);
        }

        let outcome = claim_settlement(&mut tx, settlement_id, now).await?;
        if outcome == CommitOutcome::Applied {
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }
        Ok(outcome)
    }

    /// Game counterpart of `commit_entity_settlement`.
    pub async fn commit_game_settlement(
        &self,
        settlement_id: i64,
        game_id: i64,
        expected_version: i64,
        next: &GameCounters,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE games SET total_matches = ?, avg_match_duration = ?, updated_at = ?, version = version + 1 \
             WHERE id = ? AND version = ?",
        )
        .bind(next.total_matches)
        .bind(next.avg_match_duration)
        .bind(now)
        .bind(game_id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(CommitOutcome::VersionConflict);
        }

        let outcome = claim_settlement(&mut tx, settlement_id, now).await?;
        if outcome == CommitOutcome::Applied {
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }
        Ok(outcome)
    }

    /// Note a failed attempt on a settlement row without settling it.
    pub async fn record_settlement_failure(&self, settlement_id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE match_settlements SET attempts = attempts + 1, last_error = ? WHERE id = ? AND settled_at IS NULL",
        )
        .bind(error)
        .bind(settlement_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn outstanding_settlements(&self, match_pk: i64) -> Result<Vec<SettlementRow>> {
        let rows = sqlx::query_as::<_, SettlementRow>(&format!(
            "SELECT {SETTLEMENT_COLUMNS} FROM match_settlements WHERE match_id = ? AND settled_at IS NULL ORDER BY id"
        ))
        .bind(match_pk)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn settlement_rows(&self, match_pk: i64) -> Result<Vec<SettlementRow>> {
        let rows = sqlx::query_as::<_, SettlementRow>(&format!(
            "SELECT {SETTLEMENT_COLUMNS} FROM match_settlements WHERE match_id = ? ORDER BY id"
        ))
        .bind(match_pk)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Flip a match to `settled` once no marker row is outstanding.
    pub async fn mark_settled_if_complete(&self, match_pk: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE matches SET settlement_state = 'settled' WHERE id = ? AND settlement_state = 'pending' \
             AND NOT EXISTS (SELECT 1 FROM match_settlements WHERE match_id = ? AND settled_at IS NULL)",
        )
        .bind(match_pk)
        .bind(match_pk)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Public ids of matches whose settlement has not finished, oldest first.
    pub async fn pending_settlement_matches(&self, limit: i64) -> Result<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT match_id FROM matches WHERE settlement_state = 'pending' ORDER BY completed_at, id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    pub async fn count_pending_settlements(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM matches WHERE settlement_state = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

async fn claim_settlement(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    settlement_id: i64,
    now: DateTime<Utc>,
) -> Result<CommitOutcome> {
    let claimed = sqlx::query(
        "UPDATE match_settlements SET settled_at = ?, attempts = attempts + 1, last_error = NULL \
         WHERE id = ? AND settled_at IS NULL",
    )
    .bind(now)
    .bind(settlement_id)
    .execute(&mut **tx)
    .await?;
    Ok(if claimed.rows_affected() == 0 {
        CommitOutcome::AlreadySettled
    } else {
        CommitOutcome::Applied
    })
}
