// Arena service: drives the match state machine against storage and
// triggers settlement. This is the surface the HTTP layer and the game
// runner talk to.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::db::{
    Bot, Database, Game, LeaderboardEntry, MatchStatistics, NewBot, NewGame, User,
    ValidationReport,
};
use crate::error::{ArenaError, Result};
use crate::lifecycle::{
    CompletionKind, Match, MatchSettings, MoveEntry, Participant, ParticipantReport,
    SettlementState, MIN_PARTICIPANTS,
};
use crate::metrics;
use crate::queue::SettlementQueue;
use crate::settlement::{SettlementPolicy, SettlementReport, Settler};

pub const DIFFICULTIES: [&str; 4] = ["Easy", "Medium", "Hard", "Expert"];
pub const MAX_PLAYERS: i64 = 8;

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 100;
const MOVE_APPEND_ATTEMPTS: usize = 3;

/// Clamp paging parameters: limit to 1..=100 (default 50), offset to >= 0.
pub fn clamp_page(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    let limit = limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let offset = offset.unwrap_or(0).max(0);
    (limit, offset)
}

fn validate_username(username: &str) -> Result<()> {
    let len = username.chars().count();
    if !(3..=30).contains(&len) {
        return Err(ArenaError::Validation(
            "username must be 3 to 30 characters".into(),
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ArenaError::Validation(
            "username may only contain letters, digits, '_' and '-'".into(),
        ));
    }
    Ok(())
}

fn validate_game(game: &NewGame) -> Result<()> {
    if game.name.trim().is_empty() || game.name.len() > 50 {
        return Err(ArenaError::Validation("game name must be 1 to 50 characters".into()));
    }
    if !DIFFICULTIES.contains(&game.difficulty.as_str()) {
        return Err(ArenaError::Validation(format!(
            "difficulty must be one of {}",
            DIFFICULTIES.join(", ")
        )));
    }
    if game.min_players < 1 || game.max_players > MAX_PLAYERS || game.min_players > game.max_players
    {
        return Err(ArenaError::Validation(format!(
            "players must satisfy 1 <= min <= max <= {MAX_PLAYERS}"
        )));
    }
    if !(1..=60).contains(&game.time_limit) {
        return Err(ArenaError::Validation(
            "time limit must be 1 to 60 minutes".into(),
        ));
    }
    Ok(())
}

fn validate_settings(settings: &MatchSettings) -> Result<()> {
    if settings.time_per_move.is_some_and(|t| t <= 0) {
        return Err(ArenaError::Validation("time_per_move must be positive".into()));
    }
    if settings.max_moves.is_some_and(|m| m <= 0) {
        return Err(ArenaError::Validation("max_moves must be positive".into()));
    }
    Ok(())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|d| d.is_unique_violation())
        .unwrap_or(false)
}

#[derive(Clone)]
pub struct Arena {
    db: Arc<Database>,
    settler: Settler,
    policy: SettlementPolicy,
    queue: SettlementQueue,
}

impl Arena {
    pub fn new(
        db: Arc<Database>,
        policy: SettlementPolicy,
        max_attempts: u32,
        queue: SettlementQueue,
    ) -> Self {
        let settler = Settler::new(db.clone(), max_attempts);
        Self {
            db,
            settler,
            policy,
            queue,
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn settler(&self) -> &Settler {
        &self.settler
    }

    pub fn queue(&self) -> &SettlementQueue {
        &self.queue
    }

    pub fn policy(&self) -> SettlementPolicy {
        self.policy
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub async fn register_user(&self, username: &str, display_name: &str) -> Result<User> {
        validate_username(username)?;
        let display_name = match display_name.trim() {
            "" => username,
            name => name,
        };
        match self.db.create_user(username, display_name).await {
            Ok(user) => Ok(user),
            Err(e) if is_unique_violation(&e) => Err(ArenaError::Validation(format!(
                "username {username} is taken"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_user(&self, user_id: i64) -> Result<User> {
        self.db
            .get_user(user_id)
            .await?
            .ok_or_else(|| ArenaError::NotFound(format!("user {user_id}")))
    }

    pub async fn set_user_active(&self, user_id: i64, active: bool) -> Result<User> {
        if !self.db.set_user_active(user_id, active).await? {
            return Err(ArenaError::NotFound(format!("user {user_id}")));
        }
        self.get_user(user_id).await
    }

    // ── Games ─────────────────────────────────────────────────────────

    pub async fn create_game(&self, game: &NewGame) -> Result<Game> {
        validate_game(game)?;
        self.get_user(game.created_by).await?;
        match self.db.create_game(game).await {
            Ok(created) => {
                tracing::info!(game_id = created.id, name = %created.name, "game registered");
                Ok(created)
            }
            Err(e) if is_unique_violation(&e) => Err(ArenaError::Validation(format!(
                "a game named {} already exists",
                game.name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_game(&self, game_id: i64) -> Result<Game> {
        self.db
            .get_game(game_id)
            .await?
            .ok_or_else(|| ArenaError::NotFound(format!("game {game_id}")))
    }

    pub async fn list_games(&self) -> Result<Vec<Game>> {
        Ok(self.db.list_active_games().await?)
    }

    pub async fn popular_games(&self, limit: Option<i64>) -> Result<Vec<Game>> {
        let (limit, _) = clamp_page(limit.or(Some(10)), None);
        Ok(self.db.popular_games(limit).await?)
    }

    pub async fn games_by_difficulty(&self, difficulty: &str) -> Result<Vec<Game>> {
        if !DIFFICULTIES.contains(&difficulty) {
            return Err(ArenaError::Validation(format!("unknown difficulty {difficulty}")));
        }
        Ok(self.db.games_by_difficulty(difficulty).await?)
    }

    pub async fn reconcile_game_counters(&self, game_id: i64) -> Result<Game> {
        let game = self
            .db
            .reconcile_game_counters(game_id)
            .await?
            .ok_or_else(|| ArenaError::NotFound(format!("game {game_id}")))?;
        tracing::info!(
            game_id,
            total_matches = game.total_matches,
            active_bots = game.active_bots,
            "game counters reconciled"
        );
        Ok(game)
    }

    // ── Bots ──────────────────────────────────────────────────────────

    pub async fn register_bot(&self, bot: &NewBot) -> Result<Bot> {
        if bot.name.trim().is_empty() || bot.language.trim().is_empty() {
            return Err(ArenaError::Validation("bot name and language are required".into()));
        }
        let owner = self.get_user(bot.owner_id).await?;
        if !owner.is_active {
            return Err(ArenaError::Validation(format!("user {} is inactive", owner.id)));
        }
        let game = self.get_game(bot.game_id).await?;
        if !game.is_active {
            return Err(ArenaError::Validation(format!("game {} is inactive", game.id)));
        }
        match self.db.create_bot(bot).await {
            Ok(created) => Ok(created),
            Err(e) if is_unique_violation(&e) => Err(ArenaError::Validation(format!(
                "user {} already has a bot for game {}",
                bot.owner_id, bot.game_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_bot(&self, bot_id: i64) -> Result<Bot> {
        self.db
            .get_bot(bot_id)
            .await?
            .ok_or_else(|| ArenaError::NotFound(format!("bot {bot_id}")))
    }

    pub async fn list_bots_by_owner(&self, owner_id: i64) -> Result<Vec<Bot>> {
        Ok(self.db.list_bots_by_owner(owner_id).await?)
    }

    /// Record the outcome of validating a bot's code: no errors makes it
    /// `active`, any error makes it `error`.
    pub async fn record_bot_validation(
        &self,
        bot_id: i64,
        errors: Vec<String>,
        warnings: Vec<String>,
    ) -> Result<Bot> {
        let report = ValidationReport {
            timestamp: Utc::now(),
            passed: errors.is_empty(),
            errors,
            warnings,
        };
        let bot = self
            .db
            .record_bot_validation(bot_id, &report)
            .await?
            .ok_or_else(|| ArenaError::NotFound(format!("bot {bot_id}")))?;
        tracing::info!(bot_id, status = %bot.status, "bot validation recorded");
        Ok(bot)
    }

    pub async fn deactivate_bot(&self, bot_id: i64) -> Result<Bot> {
        self.db
            .deactivate_bot(bot_id)
            .await?
            .ok_or_else(|| ArenaError::NotFound(format!("bot {bot_id}")))
    }

    // ── Match lifecycle ───────────────────────────────────────────────

    async fn load(&self, match_id: &str, with_moves: bool) -> Result<Match> {
        self.db
            .load_match(match_id, with_moves)
            .await?
            .ok_or_else(|| ArenaError::NotFound(format!("match {match_id}")))
    }

    /// Explain a lost compare-and-set by replaying the transition against
    /// the current record.
    async fn stale<F>(&self, match_id: &str, action: &'static str, replay: F) -> ArenaError
    where
        F: FnOnce(&mut Match) -> Result<()>,
    {
        match self.load(match_id, false).await {
            Ok(mut current) => match replay(&mut current) {
                Err(e) => e,
                Ok(()) => ArenaError::InvalidTransition {
                    action,
                    status: current.status(),
                },
            },
            Err(e) => e,
        }
    }

    async fn check_participant(&self, game: &Game, bot_id: i64, user_id: i64) -> Result<()> {
        let bot = self.get_bot(bot_id).await?;
        if bot.owner_id != user_id {
            return Err(ArenaError::ParticipantMismatch(format!(
                "bot {bot_id} does not belong to user {user_id}"
            )));
        }
        if bot.game_id != game.id {
            return Err(ArenaError::ParticipantMismatch(format!(
                "bot {bot_id} plays game {}, not {}",
                bot.game_id, game.id
            )));
        }
        if !bot.is_eligible() {
            return Err(ArenaError::ParticipantMismatch(format!(
                "bot {bot_id} is {} and cannot play",
                if bot.is_active { bot.status.as_str() } else { "inactive" }
            )));
        }
        let user = self.get_user(user_id).await?;
        if !user.is_active {
            return Err(ArenaError::ParticipantMismatch(format!(
                "user {user_id} is inactive"
            )));
        }
        Ok(())
    }

    fn check_capacity(game: &Game, count: usize) -> Result<()> {
        if count as i64 > game.max_players {
            return Err(ArenaError::Validation(format!(
                "game {} allows at most {} players",
                game.id, game.max_players
            )));
        }
        Ok(())
    }

    /// Create a pending match with an initial set of participants.
    pub async fn create_match(
        &self,
        game_id: i64,
        settings: MatchSettings,
        participants: &[(i64, i64)],
        initial_state: Option<Value>,
    ) -> Result<Match> {
        validate_settings(&settings)?;
        let game = self.get_game(game_id).await?;
        if !game.is_active {
            return Err(ArenaError::Validation(format!("game {game_id} is inactive")));
        }

        let mut m = Match::new(game_id, settings, Utc::now());
        for &(bot_id, user_id) in participants {
            m.add_participant(bot_id, user_id)?;
        }
        Self::check_capacity(&game, m.participants.len())?;
        for &(bot_id, user_id) in participants {
            self.check_participant(&game, bot_id, user_id).await?;
        }
        m.initial_state = initial_state;

        m.id = self.db.insert_match(&m).await?;
        metrics::MATCH_TRANSITIONS_TOTAL
            .with_label_values(&["created"])
            .inc();
        tracing::info!(match_id = %m.match_id, game_id, participants = m.participants.len(), "match created");
        Ok(m)
    }

    pub async fn add_participant(&self, match_id: &str, bot_id: i64, user_id: i64) -> Result<Match> {
        let mut m = self.load(match_id, false).await?;
        m.add_participant(bot_id, user_id)?;
        let game = self.get_game(m.game_id).await?;
        Self::check_capacity(&game, m.participants.len())?;
        self.check_participant(&game, bot_id, user_id).await?;

        let inserted = match self
            .db
            .insert_participant(m.id, &Participant::new(bot_id, user_id))
            .await
        {
            Ok(inserted) => inserted,
            Err(ArenaError::Database(e)) if is_unique_violation(&e) => {
                return Err(ArenaError::DuplicateParticipant(bot_id))
            }
            Err(e) => return Err(e),
        };
        if !inserted {
            return Err(self
                .stale(match_id, "add a participant to", |cur| {
                    cur.add_participant(bot_id, user_id)
                })
                .await);
        }
        Ok(m)
    }

    pub async fn start_match(&self, match_id: &str, initial_state: Option<Value>) -> Result<Match> {
        let mut m = self.load(match_id, false).await?;
        let game = self.get_game(m.game_id).await?;
        let now = Utc::now();
        m.start(now)?;
        let required = (game.min_players as usize).max(MIN_PARTICIPANTS);
        if m.participants.len() < required {
            return Err(ArenaError::InvalidParticipantCount {
                min: required,
                found: m.participants.len(),
            });
        }
        if let Some(state) = initial_state {
            m.initial_state = Some(state.clone());
            m.final_state = Some(state);
        }

        if !self.db.save_start(&m).await? {
            return Err(self.stale(match_id, "start", |cur| cur.start(now)).await);
        }
        metrics::MATCH_TRANSITIONS_TOTAL
            .with_label_values(&["started"])
            .inc();
        tracing::info!(match_id = %m.match_id, "match started");
        Ok(m)
    }

    /// Append a move from a participant of a running match.
    pub async fn record_move(
        &self,
        match_id: &str,
        bot_id: i64,
        payload: Value,
        resulting_state: Option<Value>,
    ) -> Result<MoveEntry> {
        for _ in 0..MOVE_APPEND_ATTEMPTS {
            let mut m = self.load(match_id, false).await?;
            let entry = m.record_move(bot_id, payload.clone(), resulting_state.clone(), Utc::now())?;
            if self.db.append_move(&m, &entry).await? {
                metrics::MOVES_RECORDED_TOTAL.inc();
                tracing::debug!(match_id, seq = entry.seq, bot_id, "move recorded");
                return Ok(entry);
            }
        }
        Err(ArenaError::Validation(format!(
            "move log of {match_id} is being written concurrently"
        )))
    }

    /// Finish a running match with a result and settle its ratings.
    ///
    /// The match is final once this returns past the state check, even if
    /// settlement then fails: failed rows stay queued for repair and the
    /// settlement error is returned.
    pub async fn complete_match(
        &self,
        match_id: &str,
        winner_bot_id: Option<i64>,
        kind: CompletionKind,
        reports: &[ParticipantReport],
    ) -> Result<Match> {
        let mut m = self.load(match_id, false).await?;
        let now = Utc::now();
        m.complete(winner_bot_id, kind, reports, now)?;
        let rows = self.policy.plan(&m);
        m.settlement = if rows.is_empty() {
            SettlementState::Unrated
        } else {
            SettlementState::Pending
        };

        if !self.db.save_terminal(&m, "in_progress", &rows).await? {
            return Err(self
                .stale(match_id, "complete", |cur| {
                    cur.complete(winner_bot_id, kind, reports, now)
                })
                .await);
        }
        metrics::MATCH_TRANSITIONS_TOTAL
            .with_label_values(&["completed"])
            .inc();
        metrics::MATCH_DURATION_SECONDS.observe(m.duration as f64);
        tracing::info!(
            match_id = %m.match_id,
            result = m.state.result().unwrap_or_default(),
            winner = ?m.state.winner_bot_id(),
            duration = m.duration,
            "match completed"
        );

        if m.settlement == SettlementState::Pending {
            if let Err(e) = self.settler.settle_match(&m.match_id).await {
                tracing::warn!(match_id = %m.match_id, "inline settlement incomplete: {e}");
                self.queue.enqueue(&m.match_id);
                return Err(e);
            }
            m.settlement = SettlementState::Settled;
        }
        Ok(m)
    }

    /// Record that a match failed. Never moves ratings.
    pub async fn fail_match(
        &self,
        match_id: &str,
        message: &str,
        stack: Option<String>,
    ) -> Result<Match> {
        let mut m = self.load(match_id, false).await?;
        let from = m.status();
        let now = Utc::now();
        m.set_error(message, stack.clone(), now)?;
        m.settlement = SettlementState::Unrated;

        if !self.db.save_terminal(&m, from, &[]).await? {
            return Err(self
                .stale(match_id, "fail", |cur| cur.set_error(message, stack, now))
                .await);
        }
        metrics::MATCH_TRANSITIONS_TOTAL
            .with_label_values(&["errored"])
            .inc();
        tracing::warn!(match_id = %m.match_id, "match errored: {message}");
        Ok(m)
    }

    pub async fn cancel_match(&self, match_id: &str) -> Result<Match> {
        let mut m = self.load(match_id, false).await?;
        let from = m.status();
        let now = Utc::now();
        m.cancel(now)?;
        m.settlement = SettlementState::Unrated;

        if !self.db.save_terminal(&m, from, &[]).await? {
            return Err(self.stale(match_id, "cancel", |cur| cur.cancel(now)).await);
        }
        metrics::MATCH_TRANSITIONS_TOTAL
            .with_label_values(&["cancelled"])
            .inc();
        tracing::info!(match_id = %m.match_id, "match cancelled");
        Ok(m)
    }

    /// Re-run settlement for a finished match. Idempotent.
    pub async fn settle_match(&self, match_id: &str) -> Result<SettlementReport> {
        self.settler.settle_match(match_id).await
    }

    pub async fn get_match(&self, match_id: &str, with_moves: bool) -> Result<Match> {
        self.load(match_id, with_moves).await
    }

    // ── Read paths ────────────────────────────────────────────────────

    pub async fn bot_leaderboard(
        &self,
        game_id: Option<i64>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<LeaderboardEntry>> {
        let (limit, offset) = clamp_page(limit, offset);
        self.db.bot_leaderboard(game_id, limit, offset).await
    }

    pub async fn user_leaderboard(
        &self,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<LeaderboardEntry>> {
        let (limit, offset) = clamp_page(limit, offset);
        self.db.user_leaderboard(limit, offset).await
    }

    pub async fn user_history(
        &self,
        user_id: i64,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Match>> {
        let (limit, offset) = clamp_page(limit, offset);
        self.db.match_history_for_user(user_id, limit, offset).await
    }

    pub async fn bot_history(
        &self,
        bot_id: i64,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Match>> {
        let (limit, offset) = clamp_page(limit, offset);
        self.db.match_history_for_bot(bot_id, limit, offset).await
    }

    pub async fn recent_matches(&self, game_id: Option<i64>, limit: Option<i64>) -> Result<Vec<Match>> {
        let (limit, _) = clamp_page(limit.or(Some(20)), None);
        self.db.recent_matches(game_id, limit).await
    }

    pub async fn match_statistics(&self, game_id: Option<i64>) -> Result<MatchStatistics> {
        self.db.match_statistics(game_id).await
    }
}
