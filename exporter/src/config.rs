//! Environment-driven configuration, validated before any listener starts.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context};
use utils::auth::MIN_SECRET_LEN;
use utils::logging::LogFormat;

use crate::defaults::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Environment {
    Development,
    #[default]
    Production,
    Test,
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Environment::Development),
            "production" => Ok(Environment::Production),
            "test" => Ok(Environment::Test),
            _ => bail!("unknown APP_ENV '{s}', expected development, production or test"),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Environment::Development => "development",
            Environment::Production => "production",
            Environment::Test => "test",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct DbConf {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub max_connections: usize,
    /// Warm-connection floor carried from the deployment config; recorded
    /// and logged, the pool itself fills lazily.
    pub min_connections: usize,
}

#[derive(Debug, Clone)]
pub struct ExporterConf {
    pub listen_http_addr: String,
    pub environment: Environment,
    pub log_format: LogFormat,
    pub db: DbConf,
    /// `None` only in dev mode.
    pub jwt_secret: Option<Vec<u8>>,
}

impl ExporterConf {
    /// Reads the recognized environment variables. With `dev` set, a missing
    /// `JWT_SECRET` is tolerated and the environment defaults to development.
    pub fn from_env(dev: bool) -> anyhow::Result<Self> {
        let environment = match env_var("APP_ENV") {
            Some(v) => v.parse()?,
            None if dev => Environment::Development,
            None => Environment::Production,
        };
        let dev_mode = dev || environment == Environment::Development;

        let jwt_secret = match env_var("JWT_SECRET") {
            Some(secret) => {
                if secret.len() < MIN_SECRET_LEN {
                    bail!("JWT_SECRET must be at least {MIN_SECRET_LEN} bytes");
                }
                Some(secret.into_bytes())
            }
            None if dev_mode => None,
            None => bail!("JWT_SECRET is not set (required outside dev mode)"),
        };

        let api_port: u16 = env_parse("API_PORT")?.unwrap_or(DEFAULT_API_PORT);

        let db = DbConf {
            host: env_var("DB_HOST").unwrap_or_else(|| DEFAULT_DB_HOST.to_string()),
            port: env_parse("DB_PORT")?.unwrap_or(DEFAULT_DB_PORT),
            user: env_var("DB_USER").context("DB_USER is not set")?,
            password: env_var("DB_PASSWORD").context("DB_PASSWORD is not set")?,
            dbname: env_var("DB_NAME").context("DB_NAME is not set")?,
            max_connections: DEFAULT_MAX_DB_CONNECTIONS,
            min_connections: DEFAULT_MIN_DB_CONNECTIONS,
        };

        let log_format = match env_var("LOG_FORMAT") {
            Some(v) => LogFormat::from_config(&v)?,
            None => LogFormat::Plain,
        };

        Ok(ExporterConf {
            listen_http_addr: format!("{DEFAULT_LISTEN_HOST}:{api_port}"),
            environment,
            log_format,
            db,
            jwt_secret,
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
    T::Err: fmt::Display,
{
    env_var(name)
        .map(|v| v.parse().map_err(|e| anyhow!("invalid {name}: {e}")))
        .transpose()
}
