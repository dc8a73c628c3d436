// Error taxonomy for the match lifecycle and settlement engine.

use std::fmt;

use thiserror::Error;

/// Which kind of record a stats update or settlement row targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Bot,
    User,
    Game,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Bot => "bot",
            EntityKind::User => "user",
            EntityKind::Game => "game",
        }
    }

    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "bot" => Some(EntityKind::Bot),
            "user" => Some(EntityKind::User),
            "game" => Some(EntityKind::Game),
            _ => None,
        }
    }

    /// Table holding records of this kind.
    pub(crate) fn table(self) -> &'static str {
        match self {
            EntityKind::Bot => "bots",
            EntityKind::User => "users",
            EntityKind::Game => "games",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (kind, id) pair naming one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: i64,
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("cannot {action} a match that is {status}")]
    InvalidTransition {
        action: &'static str,
        status: &'static str,
    },

    #[error("match has already been started")]
    AlreadyStarted,

    #[error("a match needs at least {min} participants, found {found}")]
    InvalidParticipantCount { min: usize, found: usize },

    #[error("winner bot {0} is not a participant of this match")]
    UnknownWinner(i64),

    #[error("bot {0} is not a participant of this match")]
    UnknownParticipant(i64),

    #[error("bot {0} is already a participant of this match")]
    DuplicateParticipant(i64),

    #[error("a drawn match cannot name a winner")]
    DrawWithWinner,

    #[error("match reached its move limit of {0}")]
    MoveLimitReached(i64),

    #[error("participant rejected: {0}")]
    ParticipantMismatch(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("update of {entity} could not be applied after {attempts} attempts")]
    ConcurrentUpdateExhausted { entity: EntityRef, attempts: u32 },

    #[error("settlement of match {match_id} is incomplete, {} entities outstanding", outstanding.len())]
    SettlementPartiallyApplied {
        match_id: String,
        outstanding: Vec<EntityRef>,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ArenaError {
    /// Transient failures may succeed when the caller retries later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ArenaError::ConcurrentUpdateExhausted { .. }
                | ArenaError::SettlementPartiallyApplied { .. }
                | ArenaError::Database(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ArenaError>;
