// End-to-end match lifecycle against an in-memory database.

mod common;

use std::time::Duration;

use arena_backend::error::{ArenaError, EntityKind};
use arena_backend::lifecycle::{
    CompletionKind, MatchSettings, ParticipantReport, SettlementState,
};
use arena_backend::ledger::RankTier;
use arena_backend::queue::spawn_settlement_worker;
use arena_backend::settlement::SettlementPolicy;
use arena_backend::worker_pool::WorkerPool;
use serde_json::json;

use common::{default_world, world};

#[tokio::test]
async fn test_decisive_match_settles_both_sides() {
    let w = default_world(2).await;
    let match_id = w.running_match(0, 1).await;
    let (a, b) = (&w.players[0], &w.players[1]);

    w.arena
        .record_move(&match_id, a.bot_id, json!({"cell": 4}), Some(json!({"board": "....X...."})))
        .await
        .unwrap();
    w.arena
        .record_move(&match_id, b.bot_id, json!({"cell": 0}), Some(json!({"board": "O...X...."})))
        .await
        .unwrap();

    let reports = vec![ParticipantReport {
        bot_id: a.bot_id,
        position: Some(1),
        score: 3,
        avg_response_time: 120,
        errors: 0,
    }];
    let done = w
        .arena
        .complete_match(&match_id, Some(a.bot_id), CompletionKind::Completed, &reports)
        .await
        .unwrap();
    assert_eq!(done.status(), "completed");
    assert_eq!(done.settlement, SettlementState::Settled);

    let bot_a = w.arena.get_bot(a.bot_id).await.unwrap();
    assert_eq!(
        (bot_a.stats.matches, bot_a.stats.wins, bot_a.stats.score),
        (1, 1, 1025)
    );
    assert_eq!(bot_a.stats.win_rate, 100);
    assert_eq!(bot_a.stats.avg_response_time, 120);
    assert!(bot_a.last_run.is_some());

    let bot_b = w.arena.get_bot(b.bot_id).await.unwrap();
    assert_eq!(
        (bot_b.stats.matches, bot_b.stats.losses, bot_b.stats.score),
        (1, 1, 975)
    );
    assert_eq!(bot_b.stats.avg_response_time, 0);

    let user_a = w.arena.get_user(a.user_id).await.unwrap();
    let user_b = w.arena.get_user(b.user_id).await.unwrap();
    assert_eq!(user_a.stats.score, 1025);
    assert_eq!(user_b.stats.score, 975);
    assert!(user_a.last_active.is_some());

    let game = w.arena.get_game(w.game.id).await.unwrap();
    assert_eq!(game.total_matches, 1);
    assert_eq!(game.active_bots, 2);

    let stored = w.arena.get_match(&match_id, true).await.unwrap();
    assert_eq!(stored.total_moves, 2);
    assert_eq!(stored.moves.len(), 2);
    assert_eq!(stored.final_state, Some(json!({"board": "O...X...."})));
    assert_eq!(stored.initial_state, None);
    assert_eq!(stored.participant(a.bot_id).unwrap().position, Some(1));
    assert_eq!(stored.participant(b.bot_id).unwrap().position, Some(2));
}

#[tokio::test]
async fn test_draw_moves_both_to_1005() {
    let w = default_world(2).await;
    let match_id = w.running_match(0, 1).await;
    w.arena
        .complete_match(&match_id, None, CompletionKind::Draw, &[])
        .await
        .unwrap();

    for p in &w.players {
        let bot = w.arena.get_bot(p.bot_id).await.unwrap();
        assert_eq!((bot.stats.matches, bot.stats.draws, bot.stats.score), (1, 1, 1005));
        assert_eq!(bot.stats.win_rate, 0);
        let user = w.arena.get_user(p.user_id).await.unwrap();
        assert_eq!(user.stats.score, 1005);
    }
}

#[tokio::test]
async fn test_settlement_is_idempotent() {
    let w = default_world(2).await;
    let match_id = w.running_match(0, 1).await;
    let winner = w.players[1].bot_id;
    w.arena
        .complete_match(&match_id, Some(winner), CompletionKind::Completed, &[])
        .await
        .unwrap();
    let before = w.arena.get_bot(winner).await.unwrap();

    for _ in 0..3 {
        let report = w.arena.settle_match(&match_id).await.unwrap();
        assert_eq!(report.applied, 0);
    }

    let after = w.arena.get_bot(winner).await.unwrap();
    assert_eq!(after.stats, before.stats);
    assert_eq!(after.version, before.version);
    assert_eq!(w.arena.get_game(w.game.id).await.unwrap().total_matches, 1);
}

#[tokio::test]
async fn test_terminal_matches_reject_transitions() {
    let w = default_world(2).await;
    let match_id = w.running_match(0, 1).await;
    let winner = w.players[0].bot_id;
    w.arena
        .complete_match(&match_id, Some(winner), CompletionKind::Completed, &[])
        .await
        .unwrap();
    let snapshot = w.arena.get_match(&match_id, false).await.unwrap();

    assert!(matches!(
        w.arena
            .complete_match(&match_id, Some(winner), CompletionKind::Completed, &[])
            .await,
        Err(ArenaError::InvalidTransition { .. })
    ));
    assert!(matches!(
        w.arena.cancel_match(&match_id).await,
        Err(ArenaError::InvalidTransition { .. })
    ));
    assert!(matches!(
        w.arena.fail_match(&match_id, "late failure", None).await,
        Err(ArenaError::InvalidTransition { .. })
    ));
    assert!(matches!(
        w.arena.start_match(&match_id, None).await,
        Err(ArenaError::InvalidTransition { .. })
    ));
    assert!(matches!(
        w.arena.record_move(&match_id, winner, json!(1), None).await,
        Err(ArenaError::InvalidTransition { .. })
    ));

    assert_eq!(w.arena.get_match(&match_id, false).await.unwrap(), snapshot);
    assert_eq!(w.arena.get_bot(winner).await.unwrap().stats.matches, 1);
}

#[tokio::test]
async fn test_start_needs_two_participants() {
    let w = default_world(2).await;
    let p = &w.players[0];
    let m = w
        .arena
        .create_match(w.game.id, MatchSettings::default(), &[], None)
        .await
        .unwrap();
    assert!(matches!(
        w.arena.start_match(&m.match_id, None).await,
        Err(ArenaError::InvalidParticipantCount { min: 2, found: 0 })
    ));

    w.arena
        .add_participant(&m.match_id, p.bot_id, p.user_id)
        .await
        .unwrap();
    assert!(matches!(
        w.arena.start_match(&m.match_id, None).await,
        Err(ArenaError::InvalidParticipantCount { min: 2, found: 1 })
    ));

    let q = &w.players[1];
    w.arena
        .add_participant(&m.match_id, q.bot_id, q.user_id)
        .await
        .unwrap();
    let started = w
        .arena
        .start_match(&m.match_id, Some(json!({"board": "........."})))
        .await
        .unwrap();
    assert_eq!(started.status(), "in_progress");
    assert!(matches!(
        w.arena.start_match(&m.match_id, None).await,
        Err(ArenaError::AlreadyStarted)
    ));

    let stored = w.arena.get_match(&m.match_id, false).await.unwrap();
    assert_eq!(stored.initial_state, Some(json!({"board": "........."})));
}

#[tokio::test]
async fn test_participant_rules() {
    let w = default_world(3).await;
    let (a, b, c) = (&w.players[0], &w.players[1], &w.players[2]);
    let m = w
        .arena
        .create_match(w.game.id, MatchSettings::default(), &[], None)
        .await
        .unwrap();

    // Bot owned by someone else.
    assert!(matches!(
        w.arena.add_participant(&m.match_id, a.bot_id, b.user_id).await,
        Err(ArenaError::ParticipantMismatch(_))
    ));

    w.arena
        .add_participant(&m.match_id, a.bot_id, a.user_id)
        .await
        .unwrap();
    assert!(matches!(
        w.arena.add_participant(&m.match_id, a.bot_id, a.user_id).await,
        Err(ArenaError::DuplicateParticipant(_))
    ));

    // Deactivated bots cannot be entered.
    w.arena.deactivate_bot(c.bot_id).await.unwrap();
    assert!(matches!(
        w.arena.add_participant(&m.match_id, c.bot_id, c.user_id).await,
        Err(ArenaError::ParticipantMismatch(_))
    ));

    w.arena
        .add_participant(&m.match_id, b.bot_id, b.user_id)
        .await
        .unwrap();

    // Game is two-player only.
    let third = w.arena.register_user("latecomer", "").await.unwrap();
    let bot = w
        .arena
        .register_bot(&arena_backend::db::NewBot {
            name: "late".into(),
            description: String::new(),
            language: "rust".into(),
            owner_id: third.id,
            game_id: w.game.id,
        })
        .await
        .unwrap();
    w.arena.record_bot_validation(bot.id, vec![], vec![]).await.unwrap();
    assert!(matches!(
        w.arena.add_participant(&m.match_id, bot.id, third.id).await,
        Err(ArenaError::Validation(_))
    ));

    // Unvalidated bots are refused at creation.
    let fresh = w.arena.register_user("fresh", "").await.unwrap();
    let pending_bot = w
        .arena
        .register_bot(&arena_backend::db::NewBot {
            name: "unvalidated".into(),
            description: String::new(),
            language: "rust".into(),
            owner_id: fresh.id,
            game_id: w.game.id,
        })
        .await
        .unwrap();
    assert!(matches!(
        w.arena
            .create_match(
                w.game.id,
                MatchSettings::default(),
                &[(pending_bot.id, fresh.id), (a.bot_id, a.user_id)],
                None
            )
            .await,
        Err(ArenaError::ParticipantMismatch(_))
    ));

    // Participants are frozen once the match runs.
    w.arena.start_match(&m.match_id, None).await.unwrap();
    assert!(matches!(
        w.arena.add_participant(&m.match_id, c.bot_id, c.user_id).await,
        Err(ArenaError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_completion_validation() {
    let w = default_world(3).await;
    let match_id = w.running_match(0, 1).await;
    let outsider = w.players[2].bot_id;

    assert!(matches!(
        w.arena
            .complete_match(&match_id, Some(outsider), CompletionKind::Completed, &[])
            .await,
        Err(ArenaError::UnknownWinner(id)) if id == outsider
    ));
    assert!(matches!(
        w.arena
            .complete_match(&match_id, Some(w.players[0].bot_id), CompletionKind::Draw, &[])
            .await,
        Err(ArenaError::DrawWithWinner)
    ));
    assert!(matches!(
        w.arena.record_move(&match_id, outsider, json!(1), None).await,
        Err(ArenaError::UnknownParticipant(id)) if id == outsider
    ));

    let still = w.arena.get_match(&match_id, false).await.unwrap();
    assert_eq!(still.status(), "in_progress");
    assert_eq!(still.settlement, SettlementState::None);
}

#[tokio::test]
async fn test_completed_without_winner_is_draw() {
    let w = default_world(2).await;
    let match_id = w.running_match(0, 1).await;
    let m = w
        .arena
        .complete_match(&match_id, None, CompletionKind::Completed, &[])
        .await
        .unwrap();
    assert_eq!(m.state.result(), Some("draw"));
    assert_eq!(w.arena.get_bot(w.players[0].bot_id).await.unwrap().stats.draws, 1);
}

#[tokio::test]
async fn test_move_limit() {
    let w = default_world(2).await;
    let match_id = w
        .running_match_with(
            0,
            1,
            MatchSettings {
                max_moves: Some(1),
                ..MatchSettings::default()
            },
        )
        .await;
    let (a, b) = (w.players[0].bot_id, w.players[1].bot_id);
    let entry = w.arena.record_move(&match_id, a, json!("e4"), None).await.unwrap();
    assert_eq!(entry.seq, 1);
    assert!(matches!(
        w.arena.record_move(&match_id, b, json!("e5"), None).await,
        Err(ArenaError::MoveLimitReached(1))
    ));
    assert_eq!(w.arena.get_match(&match_id, true).await.unwrap().moves.len(), 1);
}

#[tokio::test]
async fn test_error_and_cancel_never_settle() {
    let w = default_world(2).await;

    let pending = w
        .arena
        .create_match(w.game.id, MatchSettings::default(), &w.pair(0, 1), None)
        .await
        .unwrap();
    let errored = w
        .arena
        .fail_match(&pending.match_id, "runner unavailable", Some("at runner.rs:88".into()))
        .await
        .unwrap();
    assert_eq!(errored.status(), "error");
    assert_eq!(errored.duration, 0);
    assert_eq!(errored.settlement, SettlementState::Unrated);

    let public = w
        .arena
        .get_match(&pending.match_id, false)
        .await
        .unwrap()
        .public_view();
    // Stack traces stay internal.
    assert!(!serde_json::to_string(&public).unwrap().contains("runner.rs"));
    assert_eq!(public.result.as_deref(), Some("error"));
    assert_eq!(public.error.unwrap().message, "runner unavailable");

    let running = w.running_match(0, 1).await;
    let cancelled = w.arena.cancel_match(&running).await.unwrap();
    assert_eq!(cancelled.state.result(), Some("cancelled"));
    assert!(cancelled.completed_at.is_some());

    for p in &w.players {
        assert_eq!(w.arena.get_bot(p.bot_id).await.unwrap().stats.matches, 0);
    }
    assert_eq!(w.arena.get_game(w.game.id).await.unwrap().total_matches, 0);
    assert_eq!(w.arena.settle_match(&running).await.unwrap().applied, 0);
}

#[tokio::test]
async fn test_timeouts_and_unranked_only_touch_game_counters() {
    let w = default_world(2).await;
    let timed_out = w.running_match(0, 1).await;
    let m = w
        .arena
        .complete_match(&timed_out, Some(w.players[0].bot_id), CompletionKind::Timeout, &[])
        .await
        .unwrap();
    assert_eq!(m.state.result(), Some("timeout"));
    assert_eq!(m.settlement, SettlementState::Settled);

    let unranked = w
        .running_match_with(
            0,
            1,
            MatchSettings {
                ranked: false,
                ..MatchSettings::default()
            },
        )
        .await;
    w.arena
        .complete_match(&unranked, Some(w.players[1].bot_id), CompletionKind::Completed, &[])
        .await
        .unwrap();

    for p in &w.players {
        let bot = w.arena.get_bot(p.bot_id).await.unwrap();
        assert_eq!(bot.stats.matches, 0);
        assert_eq!(bot.stats.score, 1000);
    }
    assert_eq!(w.arena.get_game(w.game.id).await.unwrap().total_matches, 2);
}

#[tokio::test]
async fn test_policy_can_rate_timeouts() {
    let w = world(
        2,
        SettlementPolicy {
            settle_timeouts: true,
            settle_unranked: false,
        },
        5,
    )
    .await;
    let match_id = w.running_match(0, 1).await;
    w.arena
        .complete_match(&match_id, Some(w.players[1].bot_id), CompletionKind::Timeout, &[])
        .await
        .unwrap();
    let winner = w.arena.get_bot(w.players[1].bot_id).await.unwrap();
    assert_eq!(winner.stats.score, 1025);
}

#[tokio::test]
async fn test_partial_settlement_is_repaired() {
    let w = default_world(2).await;
    let match_id = w.running_match(0, 1).await;
    let (a, b) = (&w.players[0], &w.players[1]);

    sqlx::query(
        "CREATE TRIGGER users_offline BEFORE UPDATE OF score ON users \
         BEGIN SELECT RAISE(ABORT, 'users table offline'); END",
    )
    .execute(w.db.pool())
    .await
    .unwrap();

    let err = w
        .arena
        .complete_match(&match_id, Some(a.bot_id), CompletionKind::Completed, &[])
        .await
        .unwrap_err();
    match &err {
        ArenaError::SettlementPartiallyApplied { outstanding, .. } => {
            assert_eq!(outstanding.len(), 2);
            assert!(outstanding.iter().all(|e| e.kind == EntityKind::User));
        }
        other => panic!("expected partial settlement, got {other:?}"),
    }
    assert!(err.is_transient());

    // The match is final; bots and game moved, users did not.
    let m = w.arena.get_match(&match_id, false).await.unwrap();
    assert_eq!(m.status(), "completed");
    assert_eq!(m.settlement, SettlementState::Pending);
    assert_eq!(w.arena.get_bot(a.bot_id).await.unwrap().stats.score, 1025);
    assert_eq!(w.arena.get_user(a.user_id).await.unwrap().stats.matches, 0);
    assert_eq!(w.arena.queue().depth(), 1);

    let rows = w.db.outstanding_settlements(m.id).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.attempts == 1 && r.last_error.is_some()));

    // Still failing: nothing applies, so the underlying error comes back.
    assert!(matches!(
        w.arena.settle_match(&match_id).await,
        Err(ArenaError::Database(_))
    ));

    sqlx::query("DROP TRIGGER users_offline")
        .execute(w.db.pool())
        .await
        .unwrap();

    let report = w.arena.settle_match(&match_id).await.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(w.arena.get_user(a.user_id).await.unwrap().stats.score, 1025);
    assert_eq!(w.arena.get_user(b.user_id).await.unwrap().stats.score, 975);
    // Bots were not touched a second time.
    assert_eq!(w.arena.get_bot(a.bot_id).await.unwrap().stats.matches, 1);
    assert_eq!(
        w.arena.get_match(&match_id, false).await.unwrap().settlement,
        SettlementState::Settled
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_background_worker_repairs_pending_matches() {
    let w = default_world(2).await;
    let match_id = w.running_match(0, 1).await;

    sqlx::query(
        "CREATE TRIGGER bots_offline BEFORE UPDATE OF score ON bots \
         BEGIN SELECT RAISE(ABORT, 'bots table offline'); END",
    )
    .execute(w.db.pool())
    .await
    .unwrap();
    assert!(w
        .arena
        .complete_match(&match_id, Some(w.players[0].bot_id), CompletionKind::Completed, &[])
        .await
        .is_err());
    sqlx::query("DROP TRIGGER bots_offline")
        .execute(w.db.pool())
        .await
        .unwrap();

    let worker = spawn_settlement_worker(
        w.db.clone(),
        w.arena.settler().clone(),
        w.arena.queue().clone(),
        WorkerPool::new(2),
        Duration::from_millis(50),
    );

    let mut settled = false;
    for _ in 0..100 {
        let m = w.arena.get_match(&match_id, false).await.unwrap();
        if m.settlement == SettlementState::Settled {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    worker.abort();

    assert!(settled, "worker never settled the match");
    let bot = w.arena.get_bot(w.players[0].bot_id).await.unwrap();
    assert_eq!((bot.stats.matches, bot.stats.score), (1, 1025));
    assert_eq!(w.db.count_pending_settlements().await.unwrap(), 0);
}

#[tokio::test]
async fn test_read_paths_after_play() {
    let w = default_world(3).await;
    let (a, b, c) = (&w.players[0], &w.players[1], &w.players[2]);

    let first = w.running_match(0, 1).await;
    w.arena.record_move(&first, a.bot_id, json!(1), None).await.unwrap();
    w.arena.record_move(&first, b.bot_id, json!(2), None).await.unwrap();
    w.arena.record_move(&first, a.bot_id, json!(3), None).await.unwrap();
    w.arena
        .complete_match(&first, Some(a.bot_id), CompletionKind::Completed, &[])
        .await
        .unwrap();

    let second = w.running_match(0, 2).await;
    w.arena.record_move(&second, c.bot_id, json!(1), None).await.unwrap();
    w.arena
        .complete_match(&second, Some(a.bot_id), CompletionKind::Completed, &[])
        .await
        .unwrap();

    let _pending = w
        .arena
        .create_match(w.game.id, MatchSettings::default(), &w.pair(1, 2), None)
        .await
        .unwrap();

    let board = w.arena.bot_leaderboard(Some(w.game.id), None, None).await.unwrap();
    assert_eq!(board.len(), 3);
    assert_eq!(board[0].entity_id, a.bot_id);
    assert_eq!(board[0].stats.score, 1050);
    assert_eq!(board[0].tier, RankTier::Iron);
    assert_eq!(board[0].rank, 1);
    // b and c both at 975 with no wins: creation order.
    assert_eq!(board[1].entity_id, b.bot_id);
    assert_eq!(board[2].entity_id, c.bot_id);

    let users = w.arena.user_leaderboard(Some(2), Some(0)).await.unwrap();
    assert_eq!(users.len(), 2);
    assert_eq!(users[0].entity_id, a.user_id);

    let history = w.arena.bot_history(a.bot_id, None, None).await.unwrap();
    assert_eq!(
        history.iter().map(|m| m.match_id.as_str()).collect::<Vec<_>>(),
        vec![second.as_str(), first.as_str()]
    );
    assert_eq!(w.arena.user_history(b.user_id, None, None).await.unwrap().len(), 1);
    assert_eq!(w.arena.recent_matches(None, None).await.unwrap().len(), 2);

    let stats = w.arena.match_statistics(Some(w.game.id)).await.unwrap();
    assert_eq!(stats.total_matches, 3);
    assert_eq!(stats.completed_matches, 2);
    assert_eq!(stats.total_moves, 4);

    let game = w.arena.reconcile_game_counters(w.game.id).await.unwrap();
    assert_eq!(game.total_matches, 2);
    assert_eq!(game.active_bots, 3);

    let popular = w.arena.popular_games(None).await.unwrap();
    assert_eq!(popular[0].id, w.game.id);
    assert_eq!(w.arena.games_by_difficulty("Easy").await.unwrap().len(), 1);
    assert!(matches!(
        w.arena.games_by_difficulty("Trivial").await,
        Err(ArenaError::Validation(_))
    ));
}

#[tokio::test]
async fn test_registration_rules() {
    let w = default_world(1).await;
    assert!(matches!(
        w.arena.register_user("player0", "Dup").await,
        Err(ArenaError::Validation(_))
    ));
    assert!(matches!(
        w.arena.register_user("x", "").await,
        Err(ArenaError::Validation(_))
    ));
    let user = w.arena.register_user("nodisplay", "  ").await.unwrap();
    assert_eq!(user.display_name, "nodisplay");

    let again = w
        .arena
        .register_bot(&arena_backend::db::NewBot {
            name: "second".into(),
            description: String::new(),
            language: "rust".into(),
            owner_id: w.players[0].user_id,
            game_id: w.game.id,
        })
        .await;
    assert!(matches!(again, Err(ArenaError::Validation(_))));

    assert!(matches!(
        w.arena.create_game(&common::tic_tac_toe(user.id)).await,
        Err(ArenaError::Validation(_))
    ));
    assert!(matches!(
        w.arena.get_match("match_nope", false).await,
        Err(ArenaError::NotFound(_))
    ));
}
