use std::path::PathBuf;

use anyhow::Context;
use tracing::warn;

const DEV_SECRET: &str = "dev-secret-change-me";

/// Runtime settings, read from `PARLEY_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub token_ttl_days: i64,
    pub subscriber_buffer: usize,
    pub seed_users: Vec<String>,
    pub seed_password: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt_secret = match std::env::var("PARLEY_JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                warn!("PARLEY_JWT_SECRET is not set, using the development secret");
                DEV_SECRET.to_string()
            }
        };

        let seed_users = std::env::var("PARLEY_SEED_USERS")
            .map(|raw| parse_list(&raw))
            .unwrap_or_default();

        Ok(Self {
            host: var_or("PARLEY_HOST", "0.0.0.0"),
            port: parse_var("PARLEY_PORT", 4000)?,
            db_path: PathBuf::from(var_or("PARLEY_DB_PATH", "parley.db")),
            jwt_secret,
            token_ttl_days: parse_var("PARLEY_TOKEN_TTL_DAYS", 7)?,
            subscriber_buffer: parse_var("PARLEY_SUBSCRIBER_BUFFER", parley_core::fanout::DEFAULT_SUBSCRIBER_BUFFER)?,
            seed_users,
            seed_password: var_or("PARLEY_SEED_PASSWORD", "password123"),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn parse_var<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().with_context(|| format!("{} has an invalid value '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_list_skips_blanks() {
        assert_eq!(parse_list(" alice, bob,,  "), vec!["alice", "bob"]);
        assert!(parse_list("").is_empty());
    }
}
