// Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use arena_backend::arena::Arena;
use arena_backend::db::{Database, Game, NewBot, NewGame};
use arena_backend::lifecycle::MatchSettings;
use arena_backend::queue::SettlementQueue;
use arena_backend::settlement::SettlementPolicy;

pub struct Player {
    pub bot_id: i64,
    pub user_id: i64,
}

pub struct World {
    pub arena: Arena,
    pub db: Arc<Database>,
    pub game: Game,
    pub players: Vec<Player>,
}

pub fn tic_tac_toe(created_by: i64) -> NewGame {
    NewGame {
        name: "Tic Tac Toe".into(),
        description: "Three in a row wins".into(),
        difficulty: "Easy".into(),
        min_players: 2,
        max_players: 2,
        time_limit: 5,
        rules: "Players alternate marking cells.".into(),
        created_by,
        tags: vec!["classic".into(), "grid".into()],
    }
}

/// A fresh arena with one two-player game and `n` validated bots, one per user.
pub async fn world(n: usize, policy: SettlementPolicy, max_attempts: u32) -> World {
    world_at("sqlite::memory:", n, policy, max_attempts).await
}

/// A file-backed database under the temp dir, unique per call.
pub fn temp_database_url() -> String {
    let path = std::env::temp_dir().join(format!("arena-test-{}.db", uuid::Uuid::new_v4()));
    format!("sqlite:{}?mode=rwc", path.display())
}

pub async fn world_at(
    database_url: &str,
    n: usize,
    policy: SettlementPolicy,
    max_attempts: u32,
) -> World {
    let db = Arc::new(Database::new(database_url).await.unwrap());
    let arena = Arena::new(db.clone(), policy, max_attempts, SettlementQueue::new());

    let admin = arena.register_user("admin", "Admin").await.unwrap();
    let game = arena.create_game(&tic_tac_toe(admin.id)).await.unwrap();

    let mut players = Vec::with_capacity(n);
    for i in 0..n {
        let user = arena
            .register_user(&format!("player{i}"), &format!("Player {i}"))
            .await
            .unwrap();
        let bot = arena
            .register_bot(&NewBot {
                name: format!("bot{i}"),
                description: String::new(),
                language: "rust".into(),
                owner_id: user.id,
                game_id: game.id,
            })
            .await
            .unwrap();
        arena
            .record_bot_validation(bot.id, vec![], vec![])
            .await
            .unwrap();
        players.push(Player {
            bot_id: bot.id,
            user_id: user.id,
        });
    }

    World {
        arena,
        db,
        game,
        players,
    }
}

pub async fn default_world(n: usize) -> World {
    world(n, SettlementPolicy::default(), 5).await
}

impl World {
    pub fn pair(&self, a: usize, b: usize) -> Vec<(i64, i64)> {
        vec![
            (self.players[a].bot_id, self.players[a].user_id),
            (self.players[b].bot_id, self.players[b].user_id),
        ]
    }

    /// Create and start a ranked match between two players.
    pub async fn running_match(&self, a: usize, b: usize) -> String {
        self.running_match_with(a, b, MatchSettings::default()).await
    }

    pub async fn running_match_with(&self, a: usize, b: usize, settings: MatchSettings) -> String {
        let m = self
            .arena
            .create_match(self.game.id, settings, &self.pair(a, b), None)
            .await
            .unwrap();
        self.arena.start_match(&m.match_id, None).await.unwrap();
        m.match_id
    }
}
