// Read-only views: leaderboards, match statistics, counter reconciliation.

use serde::Serialize;

use super::{Database, Game};
use crate::error::Result;
use crate::ledger::{RankTier, Stats};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: i64,
    pub entity_id: i64,
    pub name: String,
    pub owner_id: Option<i64>,
    pub game_id: Option<i64>,
    #[serde(flatten)]
    pub stats: Stats,
    pub tier: RankTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct MatchStatistics {
    /// Matches in any status.
    pub total_matches: i64,
    pub completed_matches: i64,
    /// Seconds, over completed matches.
    pub avg_duration: i64,
    pub total_moves: i64,
}

#[derive(sqlx::FromRow)]
struct BotStanding {
    id: i64,
    name: String,
    owner_id: i64,
    game_id: i64,
    #[sqlx(flatten)]
    stats: Stats,
}

#[derive(sqlx::FromRow)]
struct UserStanding {
    id: i64,
    display_name: String,
    #[sqlx(flatten)]
    stats: Stats,
}

const STATS_COLUMNS: &str = "matches, wins, losses, draws, score, win_rate, avg_response_time";

impl Database {
    /// Eligible bots ranked by score, then wins, then age.
    pub async fn bot_leaderboard(
        &self,
        game_id: Option<i64>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LeaderboardEntry>> {
        let rows = sqlx::query_as::<_, BotStanding>(&format!(
            "SELECT id, name, owner_id, game_id, {STATS_COLUMNS} FROM bots \
             WHERE status = 'active' AND is_active = 1 AND (? IS NULL OR game_id = ?) \
             ORDER BY score DESC, wins DESC, id ASC LIMIT ? OFFSET ?"
        ))
        .bind(game_id)
        .bind(game_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| LeaderboardEntry {
                rank: offset + i as i64 + 1,
                entity_id: row.id,
                name: row.name,
                owner_id: Some(row.owner_id),
                game_id: Some(row.game_id),
                tier: RankTier::from_score(row.stats.score),
                stats: row.stats,
            })
            .collect())
    }

    pub async fn user_leaderboard(&self, limit: i64, offset: i64) -> Result<Vec<LeaderboardEntry>> {
        let rows = sqlx::query_as::<_, UserStanding>(&format!(
            "SELECT id, display_name, {STATS_COLUMNS} FROM users WHERE is_active = 1 \
             ORDER BY score DESC, wins DESC, id ASC LIMIT ? OFFSET ?"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| LeaderboardEntry {
                rank: offset + i as i64 + 1,
                entity_id: row.id,
                name: row.display_name,
                owner_id: None,
                game_id: None,
                tier: RankTier::from_score(row.stats.score),
                stats: row.stats,
            })
            .collect())
    }

    pub async fn match_statistics(&self, game_id: Option<i64>) -> Result<MatchStatistics> {
        let stats = sqlx::query_as::<_, MatchStatistics>(
            "SELECT COUNT(*) AS total_matches, \
             COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed_matches, \
             CAST(COALESCE(ROUND(AVG(CASE WHEN status = 'completed' THEN duration END)), 0) AS INTEGER) AS avg_duration, \
             COALESCE(SUM(CASE WHEN status = 'completed' THEN total_moves ELSE 0 END), 0) AS total_moves \
             FROM matches WHERE (? IS NULL OR game_id = ?)",
        )
        .bind(game_id)
        .bind(game_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    /// Rebuild a game's denormalized counters from the authoritative rows.
    /// Only matches whose game settlement has landed are counted, so a later
    /// settlement pass cannot count a match twice.
    pub async fn reconcile_game_counters(&self, game_id: i64) -> Result<Option<Game>> {
        let result = sqlx::query(
            "UPDATE games SET \
             total_matches = (SELECT COUNT(*) FROM match_settlements s JOIN matches m ON m.id = s.match_id \
                 WHERE m.game_id = ?1 AND s.entity_kind = 'game' AND s.settled_at IS NOT NULL), \
             avg_match_duration = COALESCE((SELECT CAST(ROUND(AVG(m.duration)) AS INTEGER) FROM match_settlements s \
                 JOIN matches m ON m.id = s.match_id \
                 WHERE m.game_id = ?1 AND s.entity_kind = 'game' AND s.settled_at IS NOT NULL), 0), \
             active_bots = (SELECT COUNT(*) FROM bots WHERE game_id = ?1 AND status = 'active' AND is_active = 1), \
             version = version + 1 \
             WHERE id = ?1",
        )
        .bind(game_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(self.get_game(game_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{new_bot, new_game, passed, test_db};

    async fn set_score(db: &Database, table: &str, id: i64, score: i64, wins: i64) {
        sqlx::query(&format!(
            "UPDATE {table} SET score = ?, wins = ?, matches = ? WHERE id = ?"
        ))
        .bind(score)
        .bind(wins)
        .bind(wins)
        .bind(id)
        .execute(db.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_ties_break_by_creation_order() {
        let db = test_db().await;
        let admin = db.create_user("admin", "Admin").await.unwrap();
        let game = db.create_game(&new_game("Chess", admin.id)).await.unwrap();

        let mut bots = Vec::new();
        for (name, score) in [("first", 1200), ("second", 1150), ("third", 1200)] {
            let owner = db.create_user(name, name).await.unwrap();
            let bot = db.create_bot(&new_bot(owner.id, game.id)).await.unwrap();
            db.record_bot_validation(bot.id, &passed()).await.unwrap();
            set_score(&db, "bots", bot.id, score, 2).await;
            bots.push(bot.id);
        }

        let board = db.bot_leaderboard(Some(game.id), 50, 0).await.unwrap();
        let order: Vec<_> = board.iter().map(|e| e.entity_id).collect();
        assert_eq!(order, vec![bots[0], bots[2], bots[1]]);
        assert_eq!(board.iter().map(|e| e.rank).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(board[0].tier, RankTier::Bronze);

        let page = db.bot_leaderboard(None, 2, 1).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].rank, 2);
        assert_eq!(page[0].entity_id, bots[2]);
    }

    #[tokio::test]
    async fn test_more_wins_breaks_score_ties() {
        let db = test_db().await;
        let a = db.create_user("aaa", "A").await.unwrap();
        let b = db.create_user("bbb", "B").await.unwrap();
        set_score(&db, "users", a.id, 1100, 1).await;
        set_score(&db, "users", b.id, 1100, 4).await;

        let board = db.user_leaderboard(10, 0).await.unwrap();
        assert_eq!(board[0].entity_id, b.id);
        assert_eq!(board[0].name, "B");
        assert_eq!(board[1].entity_id, a.id);
    }

    #[tokio::test]
    async fn test_ineligible_entities_hidden() {
        let db = test_db().await;
        let owner = db.create_user("gil", "Gil").await.unwrap();
        let game = db.create_game(&new_game("Go", owner.id)).await.unwrap();
        let bot = db.create_bot(&new_bot(owner.id, game.id)).await.unwrap();

        // Still pending validation.
        assert!(db.bot_leaderboard(None, 10, 0).await.unwrap().is_empty());
        db.record_bot_validation(bot.id, &passed()).await.unwrap();
        assert_eq!(db.bot_leaderboard(None, 10, 0).await.unwrap().len(), 1);
        db.deactivate_bot(bot.id).await.unwrap();
        assert!(db.bot_leaderboard(None, 10, 0).await.unwrap().is_empty());

        db.set_user_active(owner.id, false).await.unwrap();
        assert!(db.user_leaderboard(10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_statistics_on_empty_set() {
        let db = test_db().await;
        let stats = db.match_statistics(None).await.unwrap();
        assert_eq!(
            stats,
            MatchStatistics {
                total_matches: 0,
                completed_matches: 0,
                avg_duration: 0,
                total_moves: 0,
            }
        );
        assert_eq!(db.match_statistics(Some(42)).await.unwrap(), stats);
    }

    #[tokio::test]
    async fn test_reconcile_counts_active_bots() {
        let db = test_db().await;
        let owner = db.create_user("hal", "Hal").await.unwrap();
        let game = db.create_game(&new_game("Go", owner.id)).await.unwrap();
        let bot = db.create_bot(&new_bot(owner.id, game.id)).await.unwrap();
        db.record_bot_validation(bot.id, &passed()).await.unwrap();

        sqlx::query("UPDATE games SET active_bots = 9, total_matches = 4 WHERE id = ?")
            .bind(game.id)
            .execute(db.pool())
            .await
            .unwrap();

        let fixed = db.reconcile_game_counters(game.id).await.unwrap().unwrap();
        assert_eq!(fixed.active_bots, 1);
        assert_eq!(fixed.total_matches, 0);
        assert_eq!(fixed.avg_match_duration, 0);
        assert!(db.reconcile_game_counters(999).await.unwrap().is_none());
    }
}
