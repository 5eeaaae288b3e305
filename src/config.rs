//! Runtime configuration from environment variables
//!
//! Every value has a default except the hydration credentials; without
//! `HANDLE` and `PASSWORD` the hydration job is simply not registered.

use crate::feed::composer::{DEFAULT_MIN_INTERACTIONS, DEFAULT_RANKED_WINDOW_HOURS};
use crate::firehose::ingestion::DEFAULT_CHECKPOINT_INTERVAL;
use crate::hydrator::{RateLimitPolicy, DEFAULT_BATCH_SIZE, DEFAULT_RECENCY_DAYS};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// One week
const MAX_INTERVAL_MINS: i64 = 7 * 24 * 60;
/// Ten years
const MAX_WINDOW_DAYS: i64 = 3650;
/// `app.bsky.feed.getPosts` accepts at most 25 uris per call
const MAX_BATCH_SIZE: i64 = 25;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    MissingVariable(&'static str),

    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Credentials for the engagement API
#[derive(Clone)]
pub struct Credentials {
    pub handle: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("handle", &self.handle)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct FeedgenConfig {
    /// SQLite database file
    pub db_path: PathBuf,

    /// WebSocket endpoint of the commit stream
    pub firehose_url: String,

    /// Checkpoint row name for the subscription
    pub subscription_service: String,

    pub checkpoint_interval: i64,

    /// JSON rule file; the bundled rules are used when unset
    pub filter_rules: Option<PathBuf>,

    pub allow_dids: Vec<String>,
    pub deny_dids: Vec<String>,

    /// App view host; XRPC method paths are appended
    pub api_url: String,
    pub credentials: Option<Credentials>,

    pub hydration_interval_mins: u64,
    pub hydration_batch_size: usize,
    pub hydration_window_days: i64,
    pub rate_limit_policy: RateLimitPolicy,

    pub cleanup_days: i64,
    pub cleanup_interval_hours: u64,

    pub trending_window_hours: i64,
    pub trending_min_interactions: i64,

    /// Fire hydration and cleanup once at startup instead of waiting a
    /// full interval
    pub run_jobs_on_start: bool,

    pub rust_log: Option<String>,
}

impl FeedgenConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `FEEDGEN_DB_PATH` (default: feed.db)
    /// - `FEEDGEN_FIREHOSE_URL` (default: ws://127.0.0.1:6008/xrpc/com.atproto.sync.subscribeRepos)
    /// - `FEEDGEN_SUBSCRIPTION_SERVICE` (default: firehose)
    /// - `FEEDGEN_CHECKPOINT_INTERVAL` (default: 10000)
    /// - `FEEDGEN_FILTER_RULES` (default: bundled rules)
    /// - `FEEDGEN_ALLOW_DIDS`, `FEEDGEN_DENY_DIDS` (comma-separated)
    /// - `FEEDGEN_API_URL` (default: https://bsky.social)
    /// - `HANDLE`, `PASSWORD`
    /// - `HYDRATION_INTERVAL_MINS` (default: 30)
    /// - `HYDRATION_BATCH_SIZE` (default: 25)
    /// - `HYDRATION_WINDOW_DAYS` (default: 3)
    /// - `HYDRATION_RATE_LIMIT_POLICY` (default: defer)
    /// - `CLEANUP_DAYS` (default: 30)
    /// - `CLEANUP_INTERVAL_HOURS` (default: 24)
    /// - `TRENDING_WINDOW_HOURS` (default: 24)
    /// - `TRENDING_MIN_INTERACTIONS` (default: 30)
    /// - `RUN_JOBS_ON_START` (default: false)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let credentials = match (get("HANDLE"), get("PASSWORD")) {
            (Some(handle), Some(password)) => Some(Credentials { handle, password }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::MissingVariable("PASSWORD")),
            (None, Some(_)) => return Err(ConfigError::MissingVariable("HANDLE")),
        };

        let config = Self {
            db_path: get("FEEDGEN_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("feed.db")),

            firehose_url: get("FEEDGEN_FIREHOSE_URL").unwrap_or_else(|| {
                "ws://127.0.0.1:6008/xrpc/com.atproto.sync.subscribeRepos".to_string()
            }),

            subscription_service: get("FEEDGEN_SUBSCRIPTION_SERVICE")
                .unwrap_or_else(|| "firehose".to_string()),

            checkpoint_interval: parse_or(
                "FEEDGEN_CHECKPOINT_INTERVAL",
                get("FEEDGEN_CHECKPOINT_INTERVAL"),
                DEFAULT_CHECKPOINT_INTERVAL,
            )?,

            filter_rules: get("FEEDGEN_FILTER_RULES").map(PathBuf::from),

            allow_dids: split_list(get("FEEDGEN_ALLOW_DIDS")),
            deny_dids: split_list(get("FEEDGEN_DENY_DIDS")),

            api_url: get("FEEDGEN_API_URL")
                .unwrap_or_else(|| "https://bsky.social".to_string()),
            credentials,

            hydration_interval_mins: parse_or(
                "HYDRATION_INTERVAL_MINS",
                get("HYDRATION_INTERVAL_MINS"),
                30,
            )?,
            hydration_batch_size: parse_or(
                "HYDRATION_BATCH_SIZE",
                get("HYDRATION_BATCH_SIZE"),
                DEFAULT_BATCH_SIZE,
            )?,
            hydration_window_days: parse_or(
                "HYDRATION_WINDOW_DAYS",
                get("HYDRATION_WINDOW_DAYS"),
                DEFAULT_RECENCY_DAYS,
            )?,
            rate_limit_policy: parse_or(
                "HYDRATION_RATE_LIMIT_POLICY",
                get("HYDRATION_RATE_LIMIT_POLICY"),
                RateLimitPolicy::default(),
            )?,

            cleanup_days: parse_or("CLEANUP_DAYS", get("CLEANUP_DAYS"), 30)?,
            cleanup_interval_hours: parse_or(
                "CLEANUP_INTERVAL_HOURS",
                get("CLEANUP_INTERVAL_HOURS"),
                24,
            )?,

            trending_window_hours: parse_or(
                "TRENDING_WINDOW_HOURS",
                get("TRENDING_WINDOW_HOURS"),
                DEFAULT_RANKED_WINDOW_HOURS,
            )?,
            trending_min_interactions: parse_or(
                "TRENDING_MIN_INTERACTIONS",
                get("TRENDING_MIN_INTERACTIONS"),
                DEFAULT_MIN_INTERACTIONS,
            )?,

            run_jobs_on_start: parse_or(
                "RUN_JOBS_ON_START",
                get("RUN_JOBS_ON_START"),
                false,
            )?,

            rust_log: get("RUST_LOG"),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        // (name, value, largest accepted value)
        let bounded = [
            ("FEEDGEN_CHECKPOINT_INTERVAL", self.checkpoint_interval, i64::MAX),
            ("HYDRATION_INTERVAL_MINS", as_i64(self.hydration_interval_mins), MAX_INTERVAL_MINS),
            ("HYDRATION_BATCH_SIZE", as_i64(self.hydration_batch_size as u64), MAX_BATCH_SIZE),
            ("HYDRATION_WINDOW_DAYS", self.hydration_window_days, MAX_WINDOW_DAYS),
            ("CLEANUP_DAYS", self.cleanup_days, MAX_WINDOW_DAYS),
            ("CLEANUP_INTERVAL_HOURS", as_i64(self.cleanup_interval_hours), MAX_INTERVAL_MINS / 60),
            ("TRENDING_WINDOW_HOURS", self.trending_window_hours, MAX_WINDOW_DAYS * 24),
        ];

        for (name, value, max) in bounded {
            let reason = if value <= 0 {
                "must be positive".to_string()
            } else if value > max {
                format!("must be at most {}", max)
            } else {
                continue;
            };
            return Err(ConfigError::InvalidValue {
                name,
                value: value.to_string(),
                reason,
            });
        }
        Ok(())
    }
}

fn as_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn parse_or<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|did| did.trim().to_string())
            .filter(|did| !did.is_empty())
            .collect()
    })
    .unwrap_or_default()
}
