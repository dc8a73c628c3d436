// Application configuration, loaded from environment variables and CLI flags.

use std::time::Duration;

use crate::settlement::{SettlementPolicy, DEFAULT_MAX_ATTEMPTS};

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (SQLite connection string).
    pub database_url: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Settlement tasks allowed to run at once.
    pub settlement_workers: usize,
    /// Tries per entity before a version conflict is reported.
    pub settlement_max_attempts: u32,
    /// How often the repair sweep looks for unsettled matches.
    pub sweep_interval: Duration,
    pub policy: SettlementPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:arena.db?mode=rwc".to_string(),
            port: 3000,
            settlement_workers: 4,
            settlement_max_attempts: DEFAULT_MAX_ATTEMPTS,
            sweep_interval: Duration::from_secs(30),
            policy: SettlementPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `DATABASE_URL` - SQLite connection string (default: `sqlite:arena.db?mode=rwc`)
    /// - `PORT` - HTTP server port (default: 3000)
    /// - `SETTLEMENT_WORKERS` - concurrent settlement tasks (default: 4)
    /// - `SETTLEMENT_MAX_ATTEMPTS` - version-conflict retries per entity (default: 5)
    /// - `SETTLEMENT_SWEEP_SECS` - repair sweep interval (default: 30)
    /// - `ARENA_SETTLE_TIMEOUTS` - `true` to rate timed-out matches
    /// - `ARENA_SETTLE_UNRANKED` - `true` to rate unranked matches
    ///
    /// CLI flags:
    /// - `--port <PORT>` - Override the port
    /// - `--workers <N>` - Override the settlement worker count
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_sources(&args, |key| std::env::var(key).ok())
    }

    /// Build a config from explicit argument and variable sources.
    pub fn from_sources<F>(args: &[String], var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let database_url = var("DATABASE_URL").unwrap_or(defaults.database_url);

        // CLI flag takes precedence, then env var, then default
        let port = Self::parse_cli_value(args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| var("PORT").and_then(|v| v.parse().ok()))
            .unwrap_or(defaults.port);

        let settlement_workers = Self::parse_cli_value(args, "--workers")
            .and_then(|v| v.parse().ok())
            .or_else(|| var("SETTLEMENT_WORKERS").and_then(|v| v.parse().ok()))
            .filter(|n: &usize| *n > 0)
            .unwrap_or(defaults.settlement_workers);

        let settlement_max_attempts = var("SETTLEMENT_MAX_ATTEMPTS")
            .and_then(|v| v.parse().ok())
            .filter(|n: &u32| *n > 0)
            .unwrap_or(defaults.settlement_max_attempts);

        let sweep_interval = var("SETTLEMENT_SWEEP_SECS")
            .and_then(|v| v.parse().ok())
            .filter(|n: &u64| *n > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval);

        let flag = |key: &str| {
            var(key)
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false)
        };
        let policy = SettlementPolicy {
            settle_timeouts: flag("ARENA_SETTLE_TIMEOUTS"),
            settle_unranked: flag("ARENA_SETTLE_UNRANKED"),
        };

        Config {
            database_url,
            port,
            settlement_workers,
            settlement_max_attempts,
            sweep_interval,
            policy,
        }
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}
