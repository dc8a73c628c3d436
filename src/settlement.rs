// Rating settlement: turns a finished match into stats writes.
//
// `plan` decides which marker rows a completion writes; `Settler` applies the
// outstanding rows of one match, each under its own optimistic version check.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::Serialize;

use crate::db::{CommitOutcome, Database, GameCounters, NewSettlement, SettlementRow};
use crate::error::{ArenaError, EntityKind, EntityRef, Result};
use crate::ledger::{compute_delta, rolling_average};
use crate::lifecycle::{Match, MatchState, TerminalOutcome};
use crate::metrics;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Which finished matches move ratings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SettlementPolicy {
    pub settle_timeouts: bool,
    pub settle_unranked: bool,
}

impl SettlementPolicy {
    pub fn is_rated(&self, m: &Match) -> bool {
        let counts = match &m.state {
            MatchState::Finished(TerminalOutcome::Decisive { .. })
            | MatchState::Finished(TerminalOutcome::Draw) => true,
            MatchState::Finished(TerminalOutcome::Timeout { .. }) => self.settle_timeouts,
            _ => false,
        };
        counts && (m.settings.ranked || self.settle_unranked)
    }

    /// Marker rows for a finished match. Every completed match feeds its
    /// game's counters; participants only move when the match is rated.
    pub fn plan(&self, m: &Match) -> Vec<NewSettlement> {
        if m.status() != "completed" {
            return Vec::new();
        }
        let mut rows = vec![NewSettlement {
            entity: EntityRef {
                kind: EntityKind::Game,
                id: m.game_id,
            },
            outcome: None,
            response_time: 0,
            duration: m.duration,
        }];
        if !self.is_rated(m) {
            return rows;
        }
        for p in &m.participants {
            let outcome = m.outcome_for(p.bot_id);
            for entity in [
                EntityRef {
                    kind: EntityKind::Bot,
                    id: p.bot_id,
                },
                EntityRef {
                    kind: EntityKind::User,
                    id: p.user_id,
                },
            ] {
                rows.push(NewSettlement {
                    entity,
                    outcome,
                    response_time: p.avg_response_time,
                    duration: m.duration,
                });
            }
        }
        rows
    }
}

/// Run one read-compute-write attempt until it lands.
///
/// `attempt` returns `Ok(None)` when it lost a version race; that is retried
/// after a short jittered pause, up to `max_attempts` tries in total.
pub async fn with_version_retry<T, F, Fut>(
    entity: EntityRef,
    max_attempts: u32,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let max_attempts = max_attempts.max(1);
    for n in 1..=max_attempts {
        if let Some(value) = attempt(n).await? {
            return Ok(value);
        }
        metrics::VERSION_CONFLICTS_TOTAL.inc();
        tracing::debug!(%entity, attempt = n, "version conflict");
        if n < max_attempts {
            let jitter_ms = rand::thread_rng().gen_range(1..=5 * n as u64);
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
        }
    }
    Err(ArenaError::ConcurrentUpdateExhausted {
        entity,
        attempts: max_attempts,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettlementReport {
    pub match_id: String,
    /// Rows applied by this pass.
    pub applied: usize,
    /// Rows someone else applied first.
    pub skipped: usize,
}

#[derive(Clone)]
pub struct Settler {
    db: Arc<Database>,
    max_attempts: u32,
}

impl Settler {
    pub fn new(db: Arc<Database>, max_attempts: u32) -> Self {
        Self { db, max_attempts }
    }

    /// Apply every outstanding settlement row of a finished match.
    ///
    /// Safe to call any number of times, concurrently or not: each row is
    /// claimed inside the same transaction as its stats write.
    pub async fn settle_match(&self, match_id: &str) -> Result<SettlementReport> {
        let m = self
            .db
            .load_match(match_id, false)
            .await?
            .ok_or_else(|| ArenaError::NotFound(format!("match {match_id}")))?;
        if !m.is_terminal() {
            return Err(ArenaError::InvalidTransition {
                action: "settle",
                status: m.status(),
            });
        }

        let mut report = SettlementReport {
            match_id: m.match_id.clone(),
            applied: 0,
            skipped: 0,
        };
        let rows = self.db.outstanding_settlements(m.id).await?;
        let mut outstanding = Vec::new();
        let mut first_error = None;

        for row in &rows {
            match self.settle_row(row).await {
                Ok(CommitOutcome::Applied) => {
                    report.applied += 1;
                    metrics::SETTLEMENTS_APPLIED_TOTAL
                        .with_label_values(&[row.entity_kind.as_str()])
                        .inc();
                }
                Ok(_) => report.skipped += 1,
                Err(e) => {
                    metrics::SETTLEMENT_FAILURES_TOTAL.inc();
                    tracing::warn!(
                        match_id = %m.match_id,
                        settlement = row.id,
                        entity = %format!("{}:{}", row.entity_kind, row.entity_id),
                        "settlement row failed: {e}"
                    );
                    if let Err(record_err) =
                        self.db.record_settlement_failure(row.id, &e.to_string()).await
                    {
                        tracing::error!(settlement = row.id, "could not record failure: {record_err}");
                    }
                    if let Ok(entity) = row.entity() {
                        outstanding.push(entity);
                    }
                    first_error.get_or_insert(e);
                }
            }
        }

        self.db.mark_settled_if_complete(m.id).await?;

        match first_error {
            None => {
                tracing::info!(
                    match_id = %m.match_id,
                    applied = report.applied,
                    skipped = report.skipped,
                    "match settled"
                );
                Ok(report)
            }
            Some(e) if report.applied == 0 => Err(e),
            Some(_) => Err(ArenaError::SettlementPartiallyApplied {
                match_id: m.match_id,
                outstanding,
            }),
        }
    }

    async fn settle_row(&self, row: &SettlementRow) -> Result<CommitOutcome> {
        let entity = row.entity()?;
        let db = self.db.as_ref();

        if entity.kind == EntityKind::Game {
            return with_version_retry(entity, self.max_attempts, |_| async move {
                let current = db
                    .get_game_counters(entity.id)
                    .await?
                    .ok_or_else(|| ArenaError::NotFound(entity.to_string()))?;
                let next = GameCounters {
                    total_matches: current.total_matches + 1,
                    avg_match_duration: rolling_average(
                        current.avg_match_duration,
                        current.total_matches,
                        row.duration,
                    ),
                    version: current.version,
                };
                let outcome = db
                    .commit_game_settlement(row.id, entity.id, current.version, &next, Utc::now())
                    .await?;
                Ok(committed(outcome))
            })
            .await;
        }

        let outcome = row.outcome()?;
        with_version_retry(entity, self.max_attempts, |_| async move {
            let prior = db
                .get_entity_stats(entity)
                .await?
                .ok_or_else(|| ArenaError::NotFound(entity.to_string()))?;
            let next = prior
                .stats
                .apply(&compute_delta(&prior.stats, outcome, row.response_time));
            let result = db
                .commit_entity_settlement(row.id, entity, prior.version, &next, Utc::now())
                .await?;
            Ok(committed(result))
        })
        .await
    }
}

/// Map a commit result onto the retry protocol: conflicts retry.
fn committed(outcome: CommitOutcome) -> Option<CommitOutcome> {
    match outcome {
        CommitOutcome::VersionConflict => None,
        other => Some(other),
    }
}
