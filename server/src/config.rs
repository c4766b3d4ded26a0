//! Typed configuration (C13), assembled once at process start from (in
//! increasing precedence): a `.env` file loaded through an allow-list, the
//! process environment, and a handful of `argh`-parsed CLI flags.
//!
//! There is no global configuration singleton anywhere in this tree; `Config`
//! is constructed once in `main` and threaded by reference into every
//! constructor that needs it.

use std::{net::SocketAddr, path::Path, time::Duration};

use llm_orchestrator::RunnerConfig;
use payments::ProviderConfig;
use telemetry::LogFormat;

use crate::cli::RunArgs;

/// Keys this service will load out of a `.env` file. Any other key present in
/// the file is ignored, so an `.env` shared with unrelated tooling can't leak
/// surprising values into this process's environment.
const ALLOWED_ENV_KEYS: &[&str] = &[
    "DATABASE_URL",
    "DATABASE_MAX_CONNECTIONS",
    "BIND_ADDR",
    "JWT_HMAC_SECRET",
    "SSE_HEARTBEAT_INTERVAL_MS",
    "CORS_ALLOWED_ORIGINS",
    "SHUTDOWN_GRACE_PERIOD_MS",
    "SHUTDOWN_TIMEOUT_MS",
    "STRIPE_BASE_URL",
    "STRIPE_SECRET_KEY",
    "STRIPE_WEBHOOK_SECRET",
    "TOSS_BASE_URL",
    "TOSS_SECRET_KEY",
    "TOSS_WEBHOOK_SECRET",
    "LLM_RUNNER_PROGRAM",
    "LLM_RUNNER_ARGS",
    "LLM_RUNNER_MODEL",
    "LLM_RUNNER_TEMPERATURE",
    "LLM_RUNNER_TIMEOUT_MS",
    "LOG_FORMAT",
    "REDIS_URL",
    // Accepted for interface completeness (§6); unused by this core.
    "SMTP_URL",
    "OBJECT_STORE_URL",
    "SESSION_SECRET",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config key {0}")]
    Missing(&'static str),
    #[error("config key {key} had an invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("failed to read .env file: {0}")]
    Dotenv(#[from] dotenvy::Error),
}

/// The service's fully-resolved configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub bind_addr: SocketAddr,
    pub jwt_hmac_secret: String,
    pub sse_heartbeat_interval: Duration,
    pub cors_allowed_origins: Vec<String>,
    pub shutdown_grace_period: Duration,
    pub shutdown_timeout: Duration,
    pub stripe: ProviderConfig,
    pub toss: ProviderConfig,
    pub llm_runner: RunnerConfig,
    pub log_format: LogFormat,
    pub redis_url: Option<String>,
    /// Accepted but unused by this core (§6 interface completeness).
    pub smtp_url: Option<String>,
    pub object_store_url: Option<String>,
    pub session_secret: Option<String>,
}

impl Config {
    /// Loads the `.env` file (if any) at `path`, filtered to
    /// [`ALLOWED_ENV_KEYS`], without overriding keys already set in the
    /// process environment, then reads every field from the environment.
    ///
    /// # Safety
    ///
    /// Calls `std::env::set_var` under the hood via [`dotenv_filtered`],
    /// which is not thread-safe on some platforms. Must be called before any
    /// other thread (including the tokio runtime) has started.
    pub unsafe fn load(dotenv_path: Option<&Path>, run_args: &RunArgs) -> Result<Self, ConfigError> {
        unsafe {
            dotenv_filtered(dotenv_path, ALLOWED_ENV_KEYS)?;
        }
        Self::from_env(run_args)
    }

    fn from_env(run_args: &RunArgs) -> Result<Self, ConfigError> {
        let database_url = require_env("DATABASE_URL")?;
        let database_max_connections = opt_env("DATABASE_MAX_CONNECTIONS")
            .map(|v| parse_env("DATABASE_MAX_CONNECTIONS", &v))
            .transpose()?
            .unwrap_or(10);

        let bind_addr = run_args
            .bind_addr
            .clone()
            .or_else(|| opt_env("BIND_ADDR"))
            .unwrap_or_else(|| "0.0.0.0:8080".to_owned());
        let bind_addr = bind_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                key: "BIND_ADDR",
                value: bind_addr.clone(),
                reason: e.to_string(),
            })?;

        let jwt_hmac_secret = require_env("JWT_HMAC_SECRET")?;

        let sse_heartbeat_interval = opt_env("SSE_HEARTBEAT_INTERVAL_MS")
            .map(|v| parse_env::<u64>("SSE_HEARTBEAT_INTERVAL_MS", &v))
            .transpose()?
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(15));

        let cors_allowed_origins = opt_env("CORS_ALLOWED_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let shutdown_grace_period = opt_env("SHUTDOWN_GRACE_PERIOD_MS")
            .map(|v| parse_env::<u64>("SHUTDOWN_GRACE_PERIOD_MS", &v))
            .transpose()?
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(3));

        let shutdown_timeout = opt_env("SHUTDOWN_TIMEOUT_MS")
            .map(|v| parse_env::<u64>("SHUTDOWN_TIMEOUT_MS", &v))
            .transpose()?
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(5));

        let stripe = ProviderConfig {
            base_url: require_env("STRIPE_BASE_URL")?,
            secret_key: require_env("STRIPE_SECRET_KEY")?,
            webhook_secret: require_env("STRIPE_WEBHOOK_SECRET")?,
        };
        let toss = ProviderConfig {
            base_url: require_env("TOSS_BASE_URL")?,
            secret_key: require_env("TOSS_SECRET_KEY")?,
            webhook_secret: require_env("TOSS_WEBHOOK_SECRET")?,
        };

        let llm_runner = RunnerConfig {
            program: require_env("LLM_RUNNER_PROGRAM")?,
            args: opt_env("LLM_RUNNER_ARGS")
                .map(|v| v.split_whitespace().map(str::to_owned).collect())
                .unwrap_or_default(),
            model: opt_env("LLM_RUNNER_MODEL").unwrap_or_else(|| "default".to_owned()),
            temperature: opt_env("LLM_RUNNER_TEMPERATURE")
                .map(|v| parse_env::<f64>("LLM_RUNNER_TEMPERATURE", &v))
                .transpose()?
                .unwrap_or(0.2),
            timeout: opt_env("LLM_RUNNER_TIMEOUT_MS")
                .map(|v| parse_env::<u64>("LLM_RUNNER_TIMEOUT_MS", &v))
                .transpose()?
                .map(Duration::from_millis)
                .unwrap_or(llm_exec::DEFAULT_TIMEOUT),
        };

        let log_format = match opt_env("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ if run_args.json_logs => LogFormat::Json,
            _ => LogFormat::Compact,
        };

        Ok(Self {
            database_url,
            database_max_connections,
            bind_addr,
            jwt_hmac_secret,
            sse_heartbeat_interval,
            cors_allowed_origins,
            shutdown_grace_period,
            shutdown_timeout,
            stripe,
            toss,
            llm_runner,
            log_format,
            redis_url: opt_env("REDIS_URL"),
            smtp_url: opt_env("SMTP_URL"),
            object_store_url: opt_env("OBJECT_STORE_URL"),
            session_secret: opt_env("SESSION_SECRET"),
        })
    }
}

fn opt_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn require_env(key: &'static str) -> Result<String, ConfigError> {
    opt_env(key).ok_or(ConfigError::Missing(key))
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_owned(),
        reason: e.to_string(),
    })
}

/// Loads a `.env` file, keeping only keys in `filter_keys` and never
/// overriding a key already set in the process environment. Takes an
/// explicit path (the `--config` CLI flag) instead of always discovering
/// `.env` from the current directory.
///
/// # Safety
///
/// See [`Config::load`].
unsafe fn dotenv_filtered(path: Option<&Path>, filter_keys: &[&str]) -> Result<(), dotenvy::Error> {
    let entries = match path {
        Some(path) => dotenvy::from_path_iter(path)?,
        None => match dotenvy::dotenv_iter() {
            Ok(iter) => iter,
            // No `.env` file is fine; config may come entirely from the
            // process environment.
            Err(dotenvy::Error::Io(_)) => return Ok(()),
            Err(e) => return Err(e),
        },
    };

    for item in entries {
        let (key, value) = item?;
        if filter_keys.contains(&key.as_str()) && std::env::var(&key).is_err() {
            // SAFETY: see `Config::load`'s doc comment.
            unsafe {
                std::env::set_var(&key, value);
            }
        }
    }

    Ok(())
}
