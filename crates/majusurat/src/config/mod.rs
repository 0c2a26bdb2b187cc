use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::workflows::submissions::RetryPolicy;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub ledger_retry: LedgerRetryConfig,
    pub reconciliation: ReconciliationConfig,
    pub uploads: UploadConfig,
    /// Seeded as the first admin so the user directory can be populated over HTTP.
    pub bootstrap_admin: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "5000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_format =
            LogFormat::from_str(&env::var("APP_LOG_FORMAT").unwrap_or_else(|_| "compact".into()))?;

        let ledger_retry = LedgerRetryConfig {
            capacity: number("LEDGER_RETRY_CAPACITY", 1024)?,
            max_attempts: number("LEDGER_RETRY_MAX_ATTEMPTS", 8)?,
            base_delay: Duration::from_millis(number("LEDGER_RETRY_BASE_DELAY_MS", 200)?),
            max_delay: Duration::from_millis(number("LEDGER_RETRY_MAX_DELAY_MS", 30_000)?),
            tick: Duration::from_millis(number("LEDGER_RETRY_TICK_MS", 250)?),
        };
        if ledger_retry.capacity == 0 {
            return Err(ConfigError::InvalidNumber {
                key: "LEDGER_RETRY_CAPACITY",
            });
        }
        if ledger_retry.tick.is_zero() {
            return Err(ConfigError::InvalidNumber {
                key: "LEDGER_RETRY_TICK_MS",
            });
        }

        let reconcile_secs: u64 = number("RECONCILE_INTERVAL_SECS", 300)?;
        let reconciliation = ReconciliationConfig {
            interval: (reconcile_secs > 0).then(|| Duration::from_secs(reconcile_secs)),
        };

        let uploads = UploadConfig {
            directory: PathBuf::from(env::var("UPLOAD_DIR").unwrap_or_else(|_| "uploads".into())),
        };
        let bootstrap_admin = env::var("BOOTSTRAP_ADMIN_ID")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "admin".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig {
                log_level,
                format: log_format,
            },
            ledger_retry,
            reconciliation,
            uploads,
            bootstrap_admin,
        })
    }
}

fn number<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidNumber { key }),
        Err(_) => Ok(default),
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" | "" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            _ => Err(ConfigError::InvalidLogFormat {
                value: value.to_string(),
            }),
        }
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub format: LogFormat,
}

/// Sizing and pacing of the ledger retry queue.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRetryConfig {
    pub capacity: usize,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// How often the background worker drains due writes.
    pub tick: Duration,
}

impl From<&LedgerRetryConfig> for RetryPolicy {
    fn from(config: &LedgerRetryConfig) -> Self {
        RetryPolicy {
            capacity: config.capacity,
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            ..RetryPolicy::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationConfig {
    /// `None` disables the periodic pass; it can still be triggered on demand.
    pub interval: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    pub directory: PathBuf,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidNumber { key: &'static str },
    InvalidLogFormat { value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidNumber { key } => {
                write!(f, "{key} must be a positive whole number")
            }
            ConfigError::InvalidLogFormat { value } => {
                write!(f, "APP_LOG_FORMAT must be 'compact' or 'pretty', got '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort
            | ConfigError::InvalidNumber { .. }
            | ConfigError::InvalidLogFormat { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        for key in [
            "APP_ENV",
            "APP_HOST",
            "APP_PORT",
            "APP_LOG_LEVEL",
            "APP_LOG_FORMAT",
            "LEDGER_RETRY_CAPACITY",
            "LEDGER_RETRY_MAX_ATTEMPTS",
            "LEDGER_RETRY_BASE_DELAY_MS",
            "LEDGER_RETRY_MAX_DELAY_MS",
            "LEDGER_RETRY_TICK_MS",
            "RECONCILE_INTERVAL_SECS",
            "UPLOAD_DIR",
            "BOOTSTRAP_ADMIN_ID",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.telemetry.format, LogFormat::Compact);
        assert_eq!(config.ledger_retry.capacity, 1024);
        assert_eq!(config.ledger_retry.max_attempts, 8);
        assert_eq!(config.ledger_retry.base_delay, Duration::from_millis(200));
        assert_eq!(
            config.reconciliation.interval,
            Some(Duration::from_secs(300))
        );
        assert_eq!(config.uploads.directory, PathBuf::from("uploads"));
        assert_eq!(config.bootstrap_admin, "admin");
    }

    #[test]
    fn accepts_localhost_host() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_HOST", "localhost");
        let config = AppConfig::load().expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 5000));
        reset_env();
    }

    #[test]
    fn zero_interval_disables_periodic_reconciliation() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("RECONCILE_INTERVAL_SECS", "0");
        env::set_var("APP_LOG_FORMAT", "Pretty");
        let config = AppConfig::load().expect("config loads");
        assert_eq!(config.reconciliation.interval, None);
        assert_eq!(config.telemetry.format, LogFormat::Pretty);
        reset_env();
    }

    #[test]
    fn malformed_retry_settings_name_the_variable() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("LEDGER_RETRY_MAX_ATTEMPTS", "lots");
        let err = AppConfig::load().expect_err("non-numeric attempts rejected");
        assert!(err.to_string().contains("LEDGER_RETRY_MAX_ATTEMPTS"));

        env::remove_var("LEDGER_RETRY_MAX_ATTEMPTS");
        env::set_var("LEDGER_RETRY_CAPACITY", "0");
        assert!(matches!(
            AppConfig::load(),
            Err(ConfigError::InvalidNumber {
                key: "LEDGER_RETRY_CAPACITY"
            })
        ));
        reset_env();
    }

    #[test]
    fn retry_policy_follows_config() {
        let config = LedgerRetryConfig {
            capacity: 4,
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            tick: Duration::from_millis(10),
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.capacity, 4);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for(0), Duration::from_millis(50));
        assert_eq!(policy.delay_for(10), Duration::from_secs(1));
    }
}
