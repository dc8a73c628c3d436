// Database access layer (SQLite via sqlx).
//
// Entity records (users, games, bots) live here; match persistence, the
// versioned stats protocol and the read-only views are in the submodules.

pub mod leaderboard;
pub mod matches;
pub mod stats;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;

use crate::ledger::Stats;

pub use leaderboard::{LeaderboardEntry, MatchStatistics};
pub use matches::NewSettlement;
pub use stats::{CommitOutcome, GameCounters, SettlementRow, VersionedStats};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    pub is_active: bool,
    pub last_active: Option<DateTime<Utc>>,
    #[sqlx(flatten)]
    pub stats: Stats,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Game {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub difficulty: String,
    pub min_players: i64,
    pub max_players: i64,
    /// Minutes.
    pub time_limit: i64,
    pub rules: String,
    pub created_by: i64,
    pub tags: Json<Vec<String>>,
    pub is_active: bool,
    pub total_matches: i64,
    pub active_bots: i64,
    /// Seconds.
    pub avg_match_duration: i64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationReport {
    pub timestamp: DateTime<Utc>,
    pub passed: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Bot {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub language: String,
    pub owner_id: i64,
    pub game_id: i64,
    pub status: String,
    pub is_active: bool,
    #[sqlx(flatten)]
    pub stats: Stats,
    pub last_validation: Option<Json<ValidationReport>>,
    pub last_run: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl Bot {
    /// Whether the bot may be entered into matches.
    pub fn is_eligible(&self) -> bool {
        self.status == "active" && self.is_active
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewGame {
    pub name: String,
    pub description: String,
    pub difficulty: String,
    pub min_players: i64,
    pub max_players: i64,
    pub time_limit: i64,
    pub rules: String,
    pub created_by: i64,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewBot {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub language: String,
    pub owner_id: i64,
    pub game_id: i64,
}

const USER_COLUMNS: &str = "id, username, display_name, is_active, last_active, matches, wins, losses, draws, score, win_rate, avg_response_time, version, created_at";

const GAME_COLUMNS: &str = "id, name, description, difficulty, min_players, max_players, time_limit, rules, created_by, tags, is_active, total_matches, active_bots, avg_match_duration, version, created_at";

const BOT_COLUMNS: &str = "id, name, description, language, owner_id, game_id, status, is_active, matches, wins, losses, draws, score, win_rate, avg_response_time, last_validation, last_run, version, created_at";

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        display_name TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        last_active TEXT,
        matches INTEGER NOT NULL DEFAULT 0,
        wins INTEGER NOT NULL DEFAULT 0,
        losses INTEGER NOT NULL DEFAULT 0,
        draws INTEGER NOT NULL DEFAULT 0,
        score INTEGER NOT NULL DEFAULT 1000,
        win_rate INTEGER NOT NULL DEFAULT 0,
        avg_response_time INTEGER NOT NULL DEFAULT 0,
        version INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS games (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        description TEXT NOT NULL,
        difficulty TEXT NOT NULL,
        min_players INTEGER NOT NULL DEFAULT 2,
        max_players INTEGER NOT NULL DEFAULT 2,
        time_limit INTEGER NOT NULL DEFAULT 10,
        rules TEXT NOT NULL,
        created_by INTEGER NOT NULL REFERENCES users(id),
        tags TEXT NOT NULL DEFAULT '[]',
        is_active INTEGER NOT NULL DEFAULT 1,
        total_matches INTEGER NOT NULL DEFAULT 0,
        active_bots INTEGER NOT NULL DEFAULT 0,
        avg_match_duration INTEGER NOT NULL DEFAULT 0,
        version INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        language TEXT NOT NULL,
        owner_id INTEGER NOT NULL REFERENCES users(id),
        game_id INTEGER NOT NULL REFERENCES games(id),
        status TEXT NOT NULL DEFAULT 'pending',
        is_active INTEGER NOT NULL DEFAULT 1,
        matches INTEGER NOT NULL DEFAULT 0,
        wins INTEGER NOT NULL DEFAULT 0,
        losses INTEGER NOT NULL DEFAULT 0,
        draws INTEGER NOT NULL DEFAULT 0,
        score INTEGER NOT NULL DEFAULT 1000,
        win_rate INTEGER NOT NULL DEFAULT 0,
        avg_response_time INTEGER NOT NULL DEFAULT 0,
        last_validation TEXT,
        last_run TEXT,
        version INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(owner_id, game_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_bots_game_score ON bots(game_id, score DESC)",
    "CREATE INDEX IF NOT EXISTS idx_users_score ON users(score DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS matches (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        match_id TEXT NOT NULL UNIQUE,
        game_id INTEGER NOT NULL REFERENCES games(id),
        status TEXT NOT NULL DEFAULT 'pending',
        result TEXT,
        winner_bot_id INTEGER REFERENCES bots(id),
        total_moves INTEGER NOT NULL DEFAULT 0,
        duration INTEGER NOT NULL DEFAULT 0,
        initial_state TEXT,
        final_state TEXT,
        error_message TEXT,
        error_stack TEXT,
        error_at TEXT,
        time_per_move INTEGER,
        max_moves INTEGER,
        ranked INTEGER NOT NULL DEFAULT 1,
        settlement_state TEXT NOT NULL DEFAULT 'none',
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_matches_game ON matches(game_id)",
    "CREATE INDEX IF NOT EXISTS idx_matches_status ON matches(status, completed_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_matches_settlement ON matches(settlement_state)",
    r#"
    CREATE TABLE IF NOT EXISTS match_participants (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        match_id INTEGER NOT NULL REFERENCES matches(id) ON DELETE CASCADE,
        slot INTEGER NOT NULL,
        bot_id INTEGER NOT NULL REFERENCES bots(id),
        user_id INTEGER NOT NULL REFERENCES users(id),
        position INTEGER,
        score INTEGER NOT NULL DEFAULT 0,
        moves INTEGER NOT NULL DEFAULT 0,
        avg_response_time INTEGER NOT NULL DEFAULT 0,
        errors INTEGER NOT NULL DEFAULT 0,
        UNIQUE(match_id, bot_id),
        UNIQUE(match_id, slot)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_participants_bot ON match_participants(bot_id)",
    "CREATE INDEX IF NOT EXISTS idx_participants_user ON match_participants(user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS match_moves (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        match_id INTEGER NOT NULL REFERENCES matches(id) ON DELETE CASCADE,
        seq INTEGER NOT NULL,
        bot_id INTEGER NOT NULL,
        payload TEXT NOT NULL,
        state TEXT,
        recorded_at TEXT NOT NULL,
        UNIQUE(match_id, seq)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS match_settlements (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        match_id INTEGER NOT NULL REFERENCES matches(id) ON DELETE CASCADE,
        entity_kind TEXT NOT NULL,
        entity_id INTEGER NOT NULL,
        outcome TEXT,
        response_time INTEGER NOT NULL DEFAULT 0,
        duration INTEGER NOT NULL DEFAULT 0,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at TEXT NOT NULL,
        settled_at TEXT,
        UNIQUE(match_id, entity_kind, entity_id)
    )
    "#,
];

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Raw pool access for maintenance tasks and tests.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub async fn create_user(
        &self,
        username: &str,
        display_name: &str,
    ) -> Result<User, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (username, display_name, created_at, updated_at) VALUES (?, ?, ?, ?) RETURNING {USER_COLUMNS}"
        ))
        .bind(username)
        .bind(display_name)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn set_user_active(&self, id: i64, active: bool) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE users SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Games ─────────────────────────────────────────────────────────

    pub async fn create_game(&self, game: &NewGame) -> Result<Game, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, Game>(&format!(
            "INSERT INTO games (name, description, difficulty, min_players, max_players, time_limit, rules, created_by, tags, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {GAME_COLUMNS}"
        ))
        .bind(&game.name)
        .bind(&game.description)
        .bind(&game.difficulty)
        .bind(game.min_players)
        .bind(game.max_players)
        .bind(game.time_limit)
        .bind(&game.rules)
        .bind(game.created_by)
        .bind(Json(&game.tags))
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_game(&self, id: i64) -> Result<Option<Game>, sqlx::Error> {
        sqlx::query_as::<_, Game>(&format!("SELECT {GAME_COLUMNS} FROM games WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_active_games(&self) -> Result<Vec<Game>, sqlx::Error> {
        sqlx::query_as::<_, Game>(&format!(
            "SELECT {GAME_COLUMNS} FROM games WHERE is_active = 1 ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await
    }

    /// Active games ordered by how many bots and matches they attract.
    pub async fn popular_games(&self, limit: i64) -> Result<Vec<Game>, sqlx::Error> {
        sqlx::query_as::<_, Game>(&format!(
            "SELECT {GAME_COLUMNS} FROM games WHERE is_active = 1 \
             ORDER BY active_bots DESC, total_matches DESC, id ASC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn games_by_difficulty(&self, difficulty: &str) -> Result<Vec<Game>, sqlx::Error> {
        sqlx::query_as::<_, Game>(&format!(
            "SELECT {GAME_COLUMNS} FROM games WHERE is_active = 1 AND difficulty = ? \
             ORDER BY active_bots DESC, id ASC"
        ))
        .bind(difficulty)
        .fetch_all(&self.pool)
        .await
    }

    // ── Bots ──────────────────────────────────────────────────────────

    pub async fn create_bot(&self, bot: &NewBot) -> Result<Bot, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, Bot>(&format!(
            "INSERT INTO bots (name, description, language, owner_id, game_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING {BOT_COLUMNS}"
        ))
        .bind(&bot.name)
        .bind(&bot.description)
        .bind(&bot.language)
        .bind(bot.owner_id)
        .bind(bot.game_id)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_bot(&self, id: i64) -> Result<Option<Bot>, sqlx::Error> {
        sqlx::query_as::<_, Bot>(&format!("SELECT {BOT_COLUMNS} FROM bots WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_bots_by_owner(&self, owner_id: i64) -> Result<Vec<Bot>, sqlx::Error> {
        sqlx::query_as::<_, Bot>(&format!(
            "SELECT {BOT_COLUMNS} FROM bots WHERE owner_id = ? ORDER BY id"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Store a validation result and move the bot to `active` or `error`.
    /// The owning game's `active_bots` counter follows the bot in or out of
    /// the eligible set.
    pub async fn record_bot_validation(
        &self,
        bot_id: i64,
        report: &ValidationReport,
    ) -> Result<Option<Bot>, sqlx::Error> {
        let status = if report.passed { "active" } else { "error" };
        self.change_bot_eligibility(bot_id, |_, is_active| (status, is_active), Some(report))
            .await
    }

    /// Take a bot out of play. Bots are never deleted.
    pub async fn deactivate_bot(&self, bot_id: i64) -> Result<Option<Bot>, sqlx::Error> {
        self.change_bot_eligibility(bot_id, |_, _| ("inactive", false), None)
            .await
    }

    async fn change_bot_eligibility<F>(
        &self,
        bot_id: i64,
        next: F,
        report: Option<&ValidationReport>,
    ) -> Result<Option<Bot>, sqlx::Error>
    where
        F: FnOnce(&str, bool) -> (&'static str, bool),
    {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Touch first so the transaction holds the write lock before reading.
        let prior: Option<(String, bool, i64)> = sqlx::query_as(
            "UPDATE bots SET updated_at = ? WHERE id = ? RETURNING status, is_active, game_id",
        )
        .bind(now)
        .bind(bot_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((prior_status, prior_active, game_id)) = prior else {
            return Ok(None);
        };

        let (status, is_active) = next(&prior_status, prior_active);
        let mut update = sqlx::query(
            "UPDATE bots SET status = ?, is_active = ?, last_validation = COALESCE(?, last_validation), version = version + 1 WHERE id = ?",
        )
        .bind(status)
        .bind(is_active);
        update = update.bind(report.map(Json));
        update.bind(bot_id).execute(&mut *tx).await?;

        let was_counted = prior_status == "active" && prior_active;
        let is_counted = status == "active" && is_active;
        let adjustment: i64 = match (was_counted, is_counted) {
            (false, true) => 1,
            (true, false) => -1,
            _ => 0,
        };
        if adjustment != 0 {
            sqlx::query(
                "UPDATE games SET active_bots = MAX(0, active_bots + ?), version = version + 1, updated_at = ? WHERE id = ?",
            )
            .bind(adjustment)
            .bind(now)
            .bind(game_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.get_bot(bot_id).await
    }
}
