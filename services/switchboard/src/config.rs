//! Server configuration loading.
//!
//! Sources, in precedence order: TOML file > `SWITCHBOARD_*` environment
//! variables > built-in defaults.  Invalid configuration is fatal at startup.
//!
//! # TOML layout
//! ```toml
//! [database]
//! path = "switchboard.db"
//! pool_max = 10
//! max_lifetime_secs = 1800
//! idle_timeout_secs = 600
//! migrations_path = "migrations"
//!
//! [http]
//! host = "0.0.0.0"
//! port = 8080
//! read_timeout_secs = 15
//! write_timeout_secs = 15
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing config file: {0}")]
    Parse(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

// ---------------------------------------------------------------------------
// Resolved config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub pool_max: u32,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
    pub migrations_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl HttpConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    database: Option<RawDatabaseConfig>,
    http: Option<RawHttpConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDatabaseConfig {
    path: Option<String>,
    pool_max: Option<u32>,
    max_lifetime_secs: Option<u64>,
    idle_timeout_secs: Option<u64>,
    migrations_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHttpConfig {
    host: Option<String>,
    port: Option<u32>,
    read_timeout_secs: Option<u64>,
    write_timeout_secs: Option<u64>,
}

/// Environment variable overrides, read once so precedence stays testable
/// without mutating process state.
#[derive(Debug, Default)]
pub struct EnvOverrides {
    pub db_path: Option<String>,
    pub db_pool_max: Option<String>,
    pub db_max_lifetime_secs: Option<String>,
    pub db_idle_timeout_secs: Option<String>,
    pub migrations_path: Option<String>,
    pub http_host: Option<String>,
    pub http_port: Option<String>,
    pub http_read_timeout_secs: Option<String>,
    pub http_write_timeout_secs: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        EnvOverrides {
            db_path: var("SWITCHBOARD_DB_PATH"),
            db_pool_max: var("SWITCHBOARD_DB_POOL_MAX"),
            db_max_lifetime_secs: var("SWITCHBOARD_DB_MAX_LIFETIME_SECS"),
            db_idle_timeout_secs: var("SWITCHBOARD_DB_IDLE_TIMEOUT_SECS"),
            migrations_path: var("SWITCHBOARD_MIGRATIONS_PATH"),
            http_host: var("SWITCHBOARD_HTTP_HOST"),
            http_port: var("SWITCHBOARD_HTTP_PORT"),
            http_read_timeout_secs: var("SWITCHBOARD_HTTP_READ_TIMEOUT_SECS"),
            http_write_timeout_secs: var("SWITCHBOARD_HTTP_WRITE_TIMEOUT_SECS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from an optional TOML file plus process environment.
pub fn load(config_path: Option<&Path>) -> Result<Config, ConfigError> {
    let raw = match config_path {
        Some(path) => {
            let toml_str = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            toml::from_str(&toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?
        }
        None => RawConfig::default(),
    };
    resolve(raw, &EnvOverrides::from_env())
}

/// Load config from a TOML string plus explicit overrides; test seam.
pub fn load_from_str(toml_str: &str, env: &EnvOverrides) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    resolve(raw, env)
}

fn resolve(raw: RawConfig, env: &EnvOverrides) -> Result<Config, ConfigError> {
    let db = raw.database.unwrap_or_default();
    let http = raw.http.unwrap_or_default();

    let path = db
        .path
        .or_else(|| env.db_path.clone())
        .unwrap_or_else(|| "switchboard.db".to_owned());
    let pool_max = pick_u32("database.pool_max", db.pool_max, &env.db_pool_max, 10)?;
    let max_lifetime_secs = pick_u64(
        "database.max_lifetime_secs",
        db.max_lifetime_secs,
        &env.db_max_lifetime_secs,
        1800,
    )?;
    let idle_timeout_secs = pick_u64(
        "database.idle_timeout_secs",
        db.idle_timeout_secs,
        &env.db_idle_timeout_secs,
        600,
    )?;
    let migrations_path = db
        .migrations_path
        .or_else(|| env.migrations_path.clone())
        .unwrap_or_else(|| "migrations".to_owned());

    let host = http
        .host
        .or_else(|| env.http_host.clone())
        .unwrap_or_else(|| "0.0.0.0".to_owned());
    let port = pick_u32("http.port", http.port, &env.http_port, 8080)?;
    let read_timeout_secs = pick_u64(
        "http.read_timeout_secs",
        http.read_timeout_secs,
        &env.http_read_timeout_secs,
        15,
    )?;
    let write_timeout_secs = pick_u64(
        "http.write_timeout_secs",
        http.write_timeout_secs,
        &env.http_write_timeout_secs,
        15,
    )?;

    if pool_max == 0 {
        return Err(invalid("database.pool_max", "must be at least 1"));
    }
    if path.is_empty() {
        return Err(invalid("database.path", "must not be empty"));
    }
    if host.is_empty() {
        return Err(invalid("http.host", "must not be empty"));
    }
    let port = u16::try_from(port)
        .ok()
        .filter(|p| *p >= 1)
        .ok_or_else(|| invalid("http.port", "must be in 1-65535"))?;
    if read_timeout_secs == 0 || write_timeout_secs == 0 {
        return Err(invalid("http timeouts", "must be at least 1 second"));
    }

    Ok(Config {
        database: DatabaseConfig {
            path: PathBuf::from(path),
            pool_max,
            max_lifetime: Duration::from_secs(max_lifetime_secs),
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            migrations_path: PathBuf::from(migrations_path),
        },
        http: HttpConfig {
            host,
            port,
            read_timeout: Duration::from_secs(read_timeout_secs),
            write_timeout: Duration::from_secs(write_timeout_secs),
        },
    })
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_owned(),
        reason: reason.to_owned(),
    }
}

fn pick_u32(
    key: &str,
    file: Option<u32>,
    env: &Option<String>,
    default: u32,
) -> Result<u32, ConfigError> {
    if let Some(v) = file {
        return Ok(v);
    }
    match env {
        Some(raw) => raw
            .parse()
            .map_err(|_| invalid(key, &format!("'{raw}' is not an integer"))),
        None => Ok(default),
    }
}

fn pick_u64(
    key: &str,
    file: Option<u64>,
    env: &Option<String>,
    default: u64,
) -> Result<u64, ConfigError> {
    if let Some(v) = file {
        return Ok(v);
    }
    match env {
        Some(raw) => raw
            .parse()
            .map_err(|_| invalid(key, &format!("'{raw}' is not an integer"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = load_from_str("", &EnvOverrides::default()).unwrap();
        assert_eq!(cfg.database.path, PathBuf::from("switchboard.db"));
        assert_eq!(cfg.database.pool_max, 10);
        assert_eq!(cfg.database.migrations_path, PathBuf::from("migrations"));
        assert_eq!(cfg.http.port, 8080);
        assert_eq!(cfg.http.read_timeout, Duration::from_secs(15));
    }

    #[test]
    fn file_wins_over_env() {
        let env = EnvOverrides {
            http_port: Some("9001".to_owned()),
            db_pool_max: Some("3".to_owned()),
            ..EnvOverrides::default()
        };
        let cfg = load_from_str(
            "[http]\nport = 9100\n[database]\npool_max = 4\n",
            &env,
        )
        .unwrap();
        assert_eq!(cfg.http.port, 9100);
        assert_eq!(cfg.database.pool_max, 4);
    }

    #[test]
    fn env_wins_over_defaults() {
        let env = EnvOverrides {
            http_port: Some("9001".to_owned()),
            db_path: Some("/var/lib/sb.db".to_owned()),
            ..EnvOverrides::default()
        };
        let cfg = load_from_str("", &env).unwrap();
        assert_eq!(cfg.http.port, 9001);
        assert_eq!(cfg.database.path, PathBuf::from("/var/lib/sb.db"));
    }

    #[test]
    fn port_out_of_range_is_fatal() {
        let err = load_from_str("[http]\nport = 0\n", &EnvOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        let err = load_from_str("[http]\nport = 70000\n", &EnvOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn zero_pool_is_fatal() {
        let err =
            load_from_str("[database]\npool_max = 0\n", &EnvOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn unparseable_env_value_is_fatal() {
        let env = EnvOverrides {
            http_port: Some("eighty".to_owned()),
            ..EnvOverrides::default()
        };
        let err = load_from_str("", &env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn malformed_toml_is_fatal() {
        let err = load_from_str("[http\nport = 1", &EnvOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
