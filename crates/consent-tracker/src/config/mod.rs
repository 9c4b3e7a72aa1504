use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

use crate::workflows::consent::SweepSettings;

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

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub sweeps: SweepConfig,
    /// Directory submitted consent documents are resolved against.
    pub upload_root: PathBuf,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            sweeps: SweepConfig::from_env()?,
            upload_root: env::var("CONSENT_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("uploads")),
        })
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

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Deadline handling: reference timezone plus the cadence of both sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    /// Timezone deadlines and "today" are evaluated in.
    pub reference_offset: FixedOffset,
    pub expiry_interval: Duration,
    pub reminder_interval: Duration,
    pub reminder_lookahead_days: u32,
    pub run_timeout: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            reference_offset: Utc.fix(),
            expiry_interval: Duration::from_secs(3600),
            reminder_interval: Duration::from_secs(86_400),
            reminder_lookahead_days: 3,
            run_timeout: Duration::from_secs(300),
        }
    }
}

impl SweepConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let reference_offset = match env::var("CONSENT_REFERENCE_TZ") {
            Ok(raw) => parse_offset(&raw).ok_or(ConfigError::InvalidTimezone(raw))?,
            Err(_) => defaults.reference_offset,
        };

        Ok(Self {
            reference_offset,
            expiry_interval: seconds_var("CONSENT_EXPIRY_INTERVAL_SECS", defaults.expiry_interval)?,
            reminder_interval: seconds_var(
                "CONSENT_REMINDER_INTERVAL_SECS",
                defaults.reminder_interval,
            )?,
            reminder_lookahead_days: match env::var("CONSENT_REMINDER_LOOKAHEAD_DAYS") {
                Ok(raw) => raw
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| ConfigError::InvalidNumber("CONSENT_REMINDER_LOOKAHEAD_DAYS"))?,
                Err(_) => defaults.reminder_lookahead_days,
            },
            run_timeout: seconds_var("CONSENT_SWEEP_TIMEOUT_SECS", defaults.run_timeout)?,
        })
    }

    pub fn sweep_settings(&self) -> SweepSettings {
        SweepSettings {
            reminder_lookahead_days: self.reminder_lookahead_days,
            run_budget: self.run_timeout,
        }
    }
}

fn seconds_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
            _ => Err(ConfigError::InvalidNumber(name)),
        },
        Err(_) => Ok(default),
    }
}

/// Parse `+03:00`, `-0530`, `+3`, or `UTC`.
pub fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("utc") || raw.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0);
    }

    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };

    let (hours, minutes) = match rest.split_once(':') {
        Some((hours, minutes)) => (hours, minutes),
        None if rest.len() == 4 => (rest.get(..2)?, rest.get(2..)?),
        None => (rest, "0"),
    };
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes >= 60 {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidTimezone(String),
    InvalidNumber(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidTimezone(value) => write!(
                f,
                "CONSENT_REFERENCE_TZ must be a UTC offset such as +03:00, got '{value}'"
            ),
            ConfigError::InvalidNumber(name) => write!(f, "{name} must be a positive integer"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort
            | ConfigError::InvalidTimezone(_)
            | ConfigError::InvalidNumber(_) => None,
        }
    }
}
