//! Configuration module for the IMAP account and engine settings
//!
//! All configuration is loaded from environment variables. Account settings
//! use the `MAIL_IMAP_*` prefix, engine tuning uses `MAIL_SYNC_*`.

use std::env;
use std::env::VarError;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// IMAP account configuration
///
/// Holds connection details and credentials for the synchronized account.
/// Passwords are stored using `SecretString` to prevent accidental logging.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// IMAP server hostname
    pub host: String,
    /// IMAP server port (typically 993 for TLS)
    pub port: u16,
    /// Whether to use TLS (currently enforced to `true`)
    pub secure: bool,
    /// Username for authentication
    pub user: String,
    /// Password stored in a type that prevents accidental logging
    pub pass: SecretString,
}

/// IMAP transport timeouts
#[derive(Debug, Clone, Copy)]
pub struct ImapTimeouts {
    /// TCP connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// IMAP greeting/TLS handshake timeout in milliseconds
    pub greeting_timeout_ms: u64,
    /// Socket I/O timeout in milliseconds
    pub socket_timeout_ms: u64,
}

impl Default for ImapTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            greeting_timeout_ms: 15_000,
            socket_timeout_ms: 300_000,
        }
    }
}

/// Engine-wide configuration
///
/// Cloned into the engine components at startup. Durations are kept as raw
/// numbers here and converted by the accessor methods.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The single synchronized account
    pub account: AccountConfig,
    /// Transport timeouts
    pub timeouts: ImapTimeouts,
    /// Whether mutation batches (flag, move) are allowed
    pub write_enabled: bool,
    /// SQLite database file holding jobs and the local cache
    pub db_path: PathBuf,
    /// Folders reconciled by scheduled sync jobs
    pub folders: Vec<String>,
    /// Folders that get a dedicated watch connection
    pub watch_folders: Vec<String>,
    /// Number of executor workers
    pub workers: usize,
    /// Capacity of the pooled connection set
    pub pool_size: usize,
    /// How long a task waits for a pooled connection
    pub pool_acquire_timeout_ms: u64,
    /// Per-account connection ceiling enforced by the server
    pub server_connection_limit: usize,
    /// Identifiers per sync micro-batch
    pub batch_size: usize,
    /// Messages per body-fetch sub-batch
    pub body_batch_size: usize,
    /// Bodies larger than this are not fetched for previews
    pub max_body_bytes: u32,
    /// Idle worker polling interval
    pub poll_interval_ms: u64,
    /// Interval between catch-up sync rounds
    pub catchup_interval_seconds: u64,
    /// Debounce window for watch notifications
    pub debounce_ms: u64,
    /// IDLE refresh timeout
    pub idle_timeout_seconds: u64,
    /// Polling interval for servers without IDLE
    pub watch_poll_interval_seconds: u64,
    /// Upper bound for watch reconnect backoff
    pub watch_max_backoff_seconds: u64,
    /// Heartbeat interval for job event feeds
    pub feed_heartbeat_seconds: u64,
    /// Age after which finished jobs are pruned
    pub job_retention_days: u64,
}

impl EngineConfig {
    /// Load all configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if required environment variables are missing
    /// or malformed, or if the connection budget exceeds the server limit.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_IMAP_HOST=imap.gmail.com
    /// MAIL_IMAP_USER=user@gmail.com
    /// MAIL_IMAP_PASS=app-password
    /// MAIL_SYNC_FOLDERS=INBOX,[Gmail]/Sent Mail
    /// MAIL_SYNC_POOL_SIZE=3
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let account = AccountConfig {
            host: required_env("MAIL_IMAP_HOST")?,
            port: parse_u16_env("MAIL_IMAP_PORT", 993)?,
            secure: parse_bool_env("MAIL_IMAP_SECURE", true)?,
            user: required_env("MAIL_IMAP_USER")?,
            pass: SecretString::new(required_env("MAIL_IMAP_PASS")?.into()),
        };

        let config = Self {
            account,
            timeouts: ImapTimeouts {
                connect_timeout_ms: parse_u64_env("MAIL_IMAP_CONNECT_TIMEOUT_MS", 30_000)?,
                greeting_timeout_ms: parse_u64_env("MAIL_IMAP_GREETING_TIMEOUT_MS", 15_000)?,
                socket_timeout_ms: parse_u64_env("MAIL_IMAP_SOCKET_TIMEOUT_MS", 300_000)?,
            },
            write_enabled: parse_bool_env("MAIL_IMAP_WRITE_ENABLED", false)?,
            db_path: PathBuf::from(
                optional_env("MAIL_SYNC_DB_PATH")?.unwrap_or_else(|| "mail-sync.db".to_owned()),
            ),
            folders: parse_list_env("MAIL_SYNC_FOLDERS", &["INBOX"])?,
            watch_folders: parse_list_env("MAIL_SYNC_WATCH_FOLDERS", &["INBOX"])?,
            workers: parse_usize_env("MAIL_SYNC_WORKERS", 3)?,
            pool_size: parse_usize_env("MAIL_SYNC_POOL_SIZE", 3)?,
            pool_acquire_timeout_ms: parse_u64_env("MAIL_SYNC_POOL_ACQUIRE_TIMEOUT_MS", 60_000)?,
            server_connection_limit: parse_usize_env("MAIL_SYNC_SERVER_CONNECTION_LIMIT", 15)?,
            batch_size: parse_usize_env("MAIL_SYNC_BATCH_SIZE", 100)?,
            body_batch_size: parse_usize_env("MAIL_SYNC_BODY_BATCH_SIZE", 10)?,
            max_body_bytes: parse_u32_env("MAIL_SYNC_MAX_BODY_BYTES", 262_144)?,
            poll_interval_ms: parse_u64_env("MAIL_SYNC_POLL_INTERVAL_MS", 1_000)?,
            catchup_interval_seconds: parse_u64_env("MAIL_SYNC_CATCHUP_INTERVAL_SECONDS", 300)?,
            debounce_ms: parse_u64_env("MAIL_SYNC_DEBOUNCE_MS", 2_000)?,
            idle_timeout_seconds: parse_u64_env("MAIL_SYNC_IDLE_TIMEOUT_SECONDS", 1_200)?,
            watch_poll_interval_seconds: parse_u64_env(
                "MAIL_SYNC_WATCH_POLL_INTERVAL_SECONDS",
                60,
            )?,
            watch_max_backoff_seconds: parse_u64_env("MAIL_SYNC_WATCH_MAX_BACKOFF_SECONDS", 300)?,
            feed_heartbeat_seconds: parse_u64_env("MAIL_SYNC_FEED_HEARTBEAT_SECONDS", 15)?,
            job_retention_days: parse_u64_env("MAIL_SYNC_JOB_RETENTION_DAYS", 7)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    ///
    /// The pool plus one dedicated watch connection per watched folder must
    /// stay within the server's per-account connection ceiling.
    pub fn validate(&self) -> AppResult<()> {
        if self.folders.is_empty() {
            return Err(AppError::invalid("MAIL_SYNC_FOLDERS must list at least one folder"));
        }
        for (value, key) in [
            (self.workers, "MAIL_SYNC_WORKERS"),
            (self.pool_size, "MAIL_SYNC_POOL_SIZE"),
            (self.batch_size, "MAIL_SYNC_BATCH_SIZE"),
            (self.body_batch_size, "MAIL_SYNC_BODY_BATCH_SIZE"),
        ] {
            if value == 0 {
                return Err(AppError::InvalidInput(format!("{key} must be at least 1")));
            }
        }
        for (value, key) in [
            (self.poll_interval_ms, "MAIL_SYNC_POLL_INTERVAL_MS"),
            (self.catchup_interval_seconds, "MAIL_SYNC_CATCHUP_INTERVAL_SECONDS"),
            (self.idle_timeout_seconds, "MAIL_SYNC_IDLE_TIMEOUT_SECONDS"),
            (self.watch_poll_interval_seconds, "MAIL_SYNC_WATCH_POLL_INTERVAL_SECONDS"),
            (self.feed_heartbeat_seconds, "MAIL_SYNC_FEED_HEARTBEAT_SECONDS"),
        ] {
            if value == 0 {
                return Err(AppError::InvalidInput(format!("{key} must be at least 1")));
            }
        }
        let budget = self.pool_size + self.watch_folders.len();
        if budget > self.server_connection_limit {
            return Err(AppError::InvalidInput(format!(
                "pool size {} plus {} watch connection(s) exceeds the server limit of {}",
                self.pool_size,
                self.watch_folders.len(),
                self.server_connection_limit
            )));
        }
        Ok(())
    }

    pub fn pool_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_acquire_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn catchup_interval(&self) -> Duration {
        Duration::from_secs(self.catchup_interval_seconds)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_secs(self.watch_poll_interval_seconds)
    }

    pub fn watch_max_backoff(&self) -> Duration {
        Duration::from_secs(self.watch_max_backoff_seconds)
    }

    pub fn feed_heartbeat(&self) -> Duration {
        Duration::from_secs(self.feed_heartbeat_seconds)
    }

    pub fn job_retention(&self) -> chrono::Duration {
        // chrono panics past ~292 million years; cap at a century
        chrono::Duration::days(i64::try_from(self.job_retention_days.min(36_500)).unwrap_or(36_500))
    }
}

/// Read a required environment variable, returning error if missing or empty
fn required_env(key: &str) -> AppResult<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::InvalidInput(format!(
            "missing required environment variable {key}"
        ))),
    }
}

/// Read an optional environment variable; empty values count as unset
fn optional_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a comma-separated folder list
///
/// An explicitly empty value yields an empty list (used to disable watching).
fn parse_list_env(key: &str, default: &[&str]) -> AppResult<Vec<String>> {
    match env::var(key) {
        Ok(v) => Ok(parse_list_value(&v)),
        Err(VarError::NotPresent) => Ok(default.iter().map(|s| (*s).to_owned()).collect()),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_list_value(value: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !out.iter().any(|existing| existing == item) {
            out.push(item.to_owned());
        }
    }
    out
}

/// Parse a boolean environment variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set to an unrecognized value.
fn parse_bool_env(key: &str, default: bool) -> AppResult<bool> {
    match env::var(key) {
        Ok(v) => parse_bool_value(&v).ok_or_else(|| {
            AppError::InvalidInput(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a numeric environment variable with default fallback
///
/// Returns `default` if unset.
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but does not parse.
fn parse_num_env<T: std::str::FromStr>(key: &str, default: T, kind: &str) -> AppResult<T> {
    match env::var(key) {
        Ok(v) => v.trim().parse::<T>().map_err(|_| {
            AppError::InvalidInput(format!("invalid {kind} environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_u16_env(key: &str, default: u16) -> AppResult<u16> {
    parse_num_env(key, default, "u16")
}

fn parse_u32_env(key: &str, default: u32) -> AppResult<u32> {
    parse_num_env(key, default, "u32")
}

fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    parse_num_env(key, default, "u64")
}

fn parse_usize_env(key: &str, default: usize) -> AppResult<usize> {
    parse_num_env(key, default, "usize")
}

#[cfg(test)]
pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        account: AccountConfig {
            host: "imap.example.com".to_owned(),
            port: 993,
            secure: true,
            user: "user@example.com".to_owned(),
            pass: SecretString::new("secret".to_owned().into()),
        },
        timeouts: ImapTimeouts::default(),
        write_enabled: true,
        db_path: PathBuf::from(":memory:"),
        folders: vec!["INBOX".to_owned()],
        watch_folders: vec!["INBOX".to_owned()],
        workers: 3,
        pool_size: 3,
        pool_acquire_timeout_ms: 2_000,
        server_connection_limit: 15,
        batch_size: 100,
        body_batch_size: 10,
        max_body_bytes: 262_144,
        poll_interval_ms: 20,
        catchup_interval_seconds: 300,
        debounce_ms: 2_000,
        idle_timeout_seconds: 1_200,
        watch_poll_interval_seconds: 60,
        watch_max_backoff_seconds: 300,
        feed_heartbeat_seconds: 15,
        job_retention_days: 7,
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineConfig, parse_bool_value, parse_list_value, test_config};

    #[test]
    fn parse_bool_value_accepts_common_truthy_and_falsy_values() {
        for truthy in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert_eq!(parse_bool_value(truthy), Some(true));
        }

        for falsy in ["0", "false", "FALSE", " no ", "N", "off"] {
            assert_eq!(parse_bool_value(falsy), Some(false));
        }
    }

    #[test]
    fn parse_bool_value_rejects_unrecognized_values() {
        for invalid in ["", "2", "maybe", "enabled", "disabled"] {
            assert_eq!(parse_bool_value(invalid), None);
        }
    }

    #[test]
    fn folder_lists_are_trimmed_and_deduplicated() {
        assert_eq!(
            parse_list_value(" INBOX, Archive ,,INBOX,[Gmail]/Sent Mail"),
            vec!["INBOX", "Archive", "[Gmail]/Sent Mail"]
        );
        assert!(parse_list_value("").is_empty());
    }

    #[test]
    fn rejects_pool_that_exceeds_server_limit_with_watch_connection() {
        let mut config = test_config();
        config.server_connection_limit = 3;
        config.pool_size = 3;
        let err = config.validate().expect_err("3 pooled + 1 watch must exceed 3");
        assert!(err.to_string().contains("exceeds the server limit"));

        config.watch_folders.clear();
        config.validate().expect("pool alone fits");
    }

    #[test]
    fn rejects_zero_workers() {
        let mut config = test_config();
        config.workers = 0;
        let err = config.validate().expect_err("must fail");
        assert!(err.to_string().contains("MAIL_SYNC_WORKERS"));
    }

    #[test]
    fn rejects_zero_intervals() {
        let cases: [(fn(&mut EngineConfig), &str); 5] = [
            (|c| c.poll_interval_ms = 0, "MAIL_SYNC_POLL_INTERVAL_MS"),
            (|c| c.catchup_interval_seconds = 0, "MAIL_SYNC_CATCHUP_INTERVAL_SECONDS"),
            (|c| c.idle_timeout_seconds = 0, "MAIL_SYNC_IDLE_TIMEOUT_SECONDS"),
            (|c| c.watch_poll_interval_seconds = 0, "MAIL_SYNC_WATCH_POLL_INTERVAL_SECONDS"),
            (|c| c.feed_heartbeat_seconds = 0, "MAIL_SYNC_FEED_HEARTBEAT_SECONDS"),
        ];
        for (zero, key) in cases {
            let mut config = test_config();
            zero(&mut config);
            let err = config.validate().expect_err(key);
            assert!(err.to_string().contains(key), "{err}");
        }
        test_config().validate().expect("defaults are valid");
    }
}
