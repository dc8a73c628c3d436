pub mod api;
pub mod arena;
pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod metrics;
pub mod queue;
pub mod settlement;
pub mod worker_pool;

pub use arena::Arena;
pub use error::{ArenaError, Result};
