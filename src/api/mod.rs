// HTTP API routes (registration, match lifecycle, leaderboards, stats)

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Json, Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::arena::Arena;
use crate::db::{NewBot, NewGame};
use crate::error::ArenaError;
use crate::lifecycle::{CompletionKind, Match, MatchSettings, ParticipantReport, PublicMatch};
use crate::metrics;

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub display_name: Option<String>,
}

#[derive(Deserialize)]
pub struct ValidationRequest {
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Deserialize)]
pub struct ParticipantRequest {
    pub bot_id: i64,
    pub user_id: i64,
}

#[derive(Deserialize)]
pub struct CreateMatchRequest {
    pub game_id: i64,
    #[serde(default)]
    pub settings: MatchSettings,
    #[serde(default)]
    pub participants: Vec<ParticipantRequest>,
    pub initial_state: Option<Value>,
}

#[derive(Deserialize, Default)]
pub struct StartMatchRequest {
    pub initial_state: Option<Value>,
}

#[derive(Deserialize)]
pub struct MoveRequest {
    pub bot_id: i64,
    #[serde(rename = "move")]
    pub payload: Value,
    pub state: Option<Value>,
}

#[derive(Deserialize)]
pub struct CompleteMatchRequest {
    pub winner_bot_id: Option<i64>,
    #[serde(default = "default_completion")]
    pub result: CompletionKind,
    #[serde(default)]
    pub participants: Vec<ParticipantReport>,
}

fn default_completion() -> CompletionKind {
    CompletionKind::Completed
}

#[derive(Deserialize)]
pub struct FailMatchRequest {
    pub message: String,
    pub stack: Option<String>,
}

#[derive(Deserialize)]
pub struct PaginationParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize)]
pub struct GameFilterParams {
    pub game_id: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize)]
pub struct ListGamesParams {
    pub difficulty: Option<String>,
}

#[derive(Deserialize)]
pub struct GetMatchParams {
    #[serde(default)]
    pub moves: bool,
}

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub arena: Arc<Arena>,
}

// ── Error helper ──────────────────────────────────────────────────────

fn json_error(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(json!({ "error": msg })))
}

fn internal_error(e: ArenaError) -> impl IntoResponse {
    tracing::error!("Internal error: {e}");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

fn error_status(e: &ArenaError) -> StatusCode {
    match e {
        ArenaError::InvalidTransition { .. }
        | ArenaError::AlreadyStarted
        | ArenaError::DuplicateParticipant(_) => StatusCode::CONFLICT,
        ArenaError::InvalidParticipantCount { .. }
        | ArenaError::UnknownWinner(_)
        | ArenaError::UnknownParticipant(_)
        | ArenaError::DrawWithWinner
        | ArenaError::MoveLimitReached(_)
        | ArenaError::ParticipantMismatch(_)
        | ArenaError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ArenaError::NotFound(_) => StatusCode::NOT_FOUND,
        ArenaError::ConcurrentUpdateExhausted { .. }
        | ArenaError::SettlementPartiallyApplied { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ArenaError::Database(_) | ArenaError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn arena_error(e: ArenaError) -> Response {
    match error_status(&e) {
        StatusCode::INTERNAL_SERVER_ERROR => internal_error(e).into_response(),
        status => json_error(status, &e.to_string()).into_response(),
    }
}

fn respond<T: serde::Serialize>(status: StatusCode, result: crate::error::Result<T>) -> Response {
    match result {
        Ok(body) => (status, Json(json!(body))).into_response(),
        Err(e) => arena_error(e),
    }
}

fn public(result: crate::error::Result<Match>) -> crate::error::Result<PublicMatch> {
    result.map(|m| m.public_view())
}

fn public_list(result: crate::error::Result<Vec<Match>>) -> crate::error::Result<Vec<PublicMatch>> {
    result.map(|ms| ms.iter().map(Match::public_view).collect())
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(arena: Arc<Arena>) -> Router {
    let state = AppState { arena };

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        // Users
        .route("/api/users", post(create_user))
        .route("/api/users/{id}", get(get_user))
        .route("/api/users/{id}/bots", get(list_user_bots))
        .route("/api/users/{id}/matches", get(user_history))
        // Games
        .route("/api/games", get(list_games).post(create_game))
        .route("/api/games/popular", get(popular_games))
        .route("/api/games/{id}", get(get_game))
        .route("/api/games/{id}/stats", get(game_stats))
        .route("/api/games/{id}/reconcile", post(reconcile_game))
        // Bots
        .route("/api/bots", post(create_bot))
        .route("/api/bots/{id}", get(get_bot))
        .route("/api/bots/{id}/validation", post(record_validation))
        .route("/api/bots/{id}/deactivate", post(deactivate_bot))
        .route("/api/bots/{id}/matches", get(bot_history))
        // Matches
        .route("/api/matches", get(recent_matches).post(create_match))
        .route("/api/matches/{match_id}", get(get_match))
        .route("/api/matches/{match_id}/participants", post(add_participant))
        .route("/api/matches/{match_id}/start", post(start_match))
        .route("/api/matches/{match_id}/moves", post(record_move))
        .route("/api/matches/{match_id}/complete", post(complete_match))
        .route("/api/matches/{match_id}/error", post(fail_match))
        .route("/api/matches/{match_id}/cancel", post(cancel_match))
        .route("/api/matches/{match_id}/settle", post(settle_match))
        // Read paths
        .route("/api/leaderboard/bots", get(bot_leaderboard))
        .route("/api/leaderboard/users", get(user_leaderboard))
        .route("/api/stats", get(global_stats))
        .route("/api/queue/status", get(queue_status))
        .layer(middleware::from_fn(track_requests))
        .with_state(state)
}

/// Count and time every request, labelled by normalized path.
async fn track_requests(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let endpoint = metrics::normalize_path(req.uri().path());
    let started = Instant::now();
    let response = next.run(req).await;
    metrics::API_REQUEST_DURATION_SECONDS
        .with_label_values(&[endpoint.as_str()])
        .observe(started.elapsed().as_secs_f64());
    metrics::API_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), endpoint.as_str(), response.status().as_str()])
        .inc();
    response
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "arena-backend" }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

// ── User handlers ─────────────────────────────────────────────────────

async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> impl IntoResponse {
    let display_name = req.display_name.unwrap_or_default();
    respond(
        StatusCode::CREATED,
        state.arena.register_user(&req.username, &display_name).await,
    )
}

async fn get_user(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    respond(StatusCode::OK, state.arena.get_user(id).await)
}

async fn list_user_bots(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    respond(StatusCode::OK, state.arena.list_bots_by_owner(id).await)
}

async fn user_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<PaginationParams>,
) -> impl IntoResponse {
    let result = state.arena.user_history(id, params.limit, params.offset).await;
    respond(StatusCode::OK, public_list(result))
}

// ── Game handlers ─────────────────────────────────────────────────────

async fn create_game(State(state): State<AppState>, Json(req): Json<NewGame>) -> impl IntoResponse {
    respond(StatusCode::CREATED, state.arena.create_game(&req).await)
}

async fn list_games(
    State(state): State<AppState>,
    Query(params): Query<ListGamesParams>,
) -> impl IntoResponse {
    let result = match params.difficulty {
        Some(difficulty) => state.arena.games_by_difficulty(&difficulty).await,
        None => state.arena.list_games().await,
    };
    respond(StatusCode::OK, result)
}

async fn popular_games(
    State(state): State<AppState>,
    Query(params): Query<PaginationParams>,
) -> impl IntoResponse {
    respond(StatusCode::OK, state.arena.popular_games(params.limit).await)
}

async fn get_game(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    respond(StatusCode::OK, state.arena.get_game(id).await)
}

async fn game_stats(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    if let Err(e) = state.arena.get_game(id).await {
        return arena_error(e);
    }
    respond(StatusCode::OK, state.arena.match_statistics(Some(id)).await)
}

async fn reconcile_game(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    respond(StatusCode::OK, state.arena.reconcile_game_counters(id).await)
}

// ── Bot handlers ──────────────────────────────────────────────────────

async fn create_bot(State(state): State<AppState>, Json(req): Json<NewBot>) -> impl IntoResponse {
    respond(StatusCode::CREATED, state.arena.register_bot(&req).await)
}

async fn get_bot(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    respond(StatusCode::OK, state.arena.get_bot(id).await)
}

async fn record_validation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ValidationRequest>,
) -> impl IntoResponse {
    respond(
        StatusCode::OK,
        state
            .arena
            .record_bot_validation(id, req.errors, req.warnings)
            .await,
    )
}

async fn deactivate_bot(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    respond(StatusCode::OK, state.arena.deactivate_bot(id).await)
}

async fn bot_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<PaginationParams>,
) -> impl IntoResponse {
    let result = state.arena.bot_history(id, params.limit, params.offset).await;
    respond(StatusCode::OK, public_list(result))
}

// ── Match handlers ────────────────────────────────────────────────────

async fn create_match(
    State(state): State<AppState>,
    Json(req): Json<CreateMatchRequest>,
) -> impl IntoResponse {
    let participants: Vec<(i64, i64)> = req
        .participants
        .iter()
        .map(|p| (p.bot_id, p.user_id))
        .collect();
    let result = state
        .arena
        .create_match(req.game_id, req.settings, &participants, req.initial_state)
        .await;
    respond(StatusCode::CREATED, public(result))
}

async fn recent_matches(
    State(state): State<AppState>,
    Query(params): Query<GameFilterParams>,
) -> impl IntoResponse {
    let result = state.arena.recent_matches(params.game_id, params.limit).await;
    respond(StatusCode::OK, public_list(result))
}

async fn get_match(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    Query(params): Query<GetMatchParams>,
) -> impl IntoResponse {
    let result = state.arena.get_match(&match_id, params.moves).await;
    respond(StatusCode::OK, public(result))
}

async fn add_participant(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    Json(req): Json<ParticipantRequest>,
) -> impl IntoResponse {
    let result = state
        .arena
        .add_participant(&match_id, req.bot_id, req.user_id)
        .await;
    respond(StatusCode::OK, public(result))
}

async fn start_match(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    Json(req): Json<StartMatchRequest>,
) -> impl IntoResponse {
    let result = state.arena.start_match(&match_id, req.initial_state).await;
    respond(StatusCode::OK, public(result))
}

async fn record_move(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    Json(req): Json<MoveRequest>,
) -> impl IntoResponse {
    let result = state
        .arena
        .record_move(&match_id, req.bot_id, req.payload, req.state)
        .await
        .map(|entry| json!({ "seq": entry.seq, "bot_id": entry.bot_id, "timestamp": entry.timestamp }));
    respond(StatusCode::CREATED, result)
}

async fn complete_match(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    Json(req): Json<CompleteMatchRequest>,
) -> impl IntoResponse {
    let result = state
        .arena
        .complete_match(&match_id, req.winner_bot_id, req.result, &req.participants)
        .await;
    respond(StatusCode::OK, public(result))
}

async fn fail_match(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    Json(req): Json<FailMatchRequest>,
) -> impl IntoResponse {
    let result = state
        .arena
        .fail_match(&match_id, &req.message, req.stack)
        .await;
    respond(StatusCode::OK, public(result))
}

async fn cancel_match(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
) -> impl IntoResponse {
    respond(StatusCode::OK, public(state.arena.cancel_match(&match_id).await))
}

async fn settle_match(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
) -> impl IntoResponse {
    respond(StatusCode::OK, state.arena.settle_match(&match_id).await)
}

// ── Leaderboard and stats handlers ───────────────────────────────────

async fn bot_leaderboard(
    State(state): State<AppState>,
    Query(params): Query<GameFilterParams>,
) -> impl IntoResponse {
    respond(
        StatusCode::OK,
        state
            .arena
            .bot_leaderboard(params.game_id, params.limit, params.offset)
            .await,
    )
}

async fn user_leaderboard(
    State(state): State<AppState>,
    Query(params): Query<PaginationParams>,
) -> impl IntoResponse {
    respond(
        StatusCode::OK,
        state
            .arena
            .user_leaderboard(params.limit, params.offset)
            .await,
    )
}

async fn global_stats(
    State(state): State<AppState>,
    Query(params): Query<GameFilterParams>,
) -> impl IntoResponse {
    respond(StatusCode::OK, state.arena.match_statistics(params.game_id).await)
}

async fn queue_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(json!(state.arena.queue().status())))
}
