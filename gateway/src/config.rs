//! Environment-driven gateway configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail};
use utils::auth::{DEFAULT_TOKEN_LIFETIME, MIN_SECRET_LEN};
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
pub struct GatewayConf {
    pub listen_http_addr: String,
    /// Scheme and authority of the export service, like `http://localhost:3001`.
    pub upstream_base: String,
    /// The single origin allowed by CORS, if any.
    pub cors_origin: Option<String>,
    /// `None` only in dev mode: requests are then forwarded without a bearer.
    pub jwt_secret: Option<Vec<u8>>,
    pub token_lifetime: Duration,
    pub environment: Environment,
    pub log_format: LogFormat,
}

impl GatewayConf {
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

        let token_lifetime = match env_var("JWT_EXPIRES_IN") {
            Some(v) => humantime::parse_duration(&v)
                .map_err(|e| anyhow!("invalid JWT_EXPIRES_IN: {e}"))?,
            None => DEFAULT_TOKEN_LIFETIME,
        };

        let app_port: u16 = env_parse("APP_PORT")?.unwrap_or(DEFAULT_APP_PORT);
        let api_host = env_var("API_HOST").unwrap_or_else(|| DEFAULT_API_HOST.to_string());
        let api_port: u16 = env_parse("API_PORT")?.unwrap_or(DEFAULT_API_PORT);

        let log_format = match env_var("LOG_FORMAT") {
            Some(v) => LogFormat::from_config(&v)?,
            None => LogFormat::Plain,
        };

        Ok(GatewayConf {
            listen_http_addr: format!("{DEFAULT_LISTEN_HOST}:{app_port}"),
            upstream_base: format!("http://{api_host}:{api_port}"),
            cors_origin: env_var("CORS_ORIGIN"),
            jwt_secret,
            token_lifetime,
            environment,
            log_format,
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
