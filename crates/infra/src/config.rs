//! Configuration loading and representation.

use std::time::Duration;

use thiserror::Error;

const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Knobs for a single unit of work.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UnitOfWorkConfig {
    /// Upper bound on how long `commit` waits for the outbox sequence lock.
    pub commit_timeout: Duration,
}

impl Default for UnitOfWorkConfig {
    fn default() -> Self {
        Self {
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
        }
    }
}

/// Which storage engine backs the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    InMemory,
    Postgres { database_url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub backend: Backend,
    pub unit_of_work: UnitOfWorkConfig,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

impl StorageConfig {
    /// Read the process environment.
    ///
    /// - `USE_PERSISTENT_STORES`: `true`/`1` selects Postgres (default: in-memory)
    /// - `DATABASE_URL`: required with Postgres
    /// - `COMMITBOX_COMMIT_TIMEOUT_MS`: commit lock wait (default 5000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let persistent = match lookup("USE_PERSISTENT_STORES") {
            None => false,
            Some(raw) => parse_flag(&raw).ok_or(ConfigError::Invalid {
                key: "USE_PERSISTENT_STORES",
                value: raw,
            })?,
        };

        let backend = if persistent {
            let database_url = lookup("DATABASE_URL")
                .filter(|url| !url.trim().is_empty())
                .ok_or(ConfigError::Missing("DATABASE_URL"))?;
            Backend::Postgres { database_url }
        } else {
            Backend::InMemory
        };

        let commit_timeout = match lookup("COMMITBOX_COMMIT_TIMEOUT_MS") {
            None => DEFAULT_COMMIT_TIMEOUT,
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => Duration::from_millis(ms),
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "COMMITBOX_COMMIT_TIMEOUT_MS",
                        value: raw,
                    });
                }
            },
        };

        Ok(Self {
            backend,
            unit_of_work: UnitOfWorkConfig { commit_timeout },
        })
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<StorageConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        StorageConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_to_in_memory() {
        let config = load(&[]).unwrap();
        assert_eq!(config.backend, Backend::InMemory);
        assert_eq!(config.unit_of_work, UnitOfWorkConfig::default());
        assert_eq!(config.unit_of_work.commit_timeout, Duration::from_secs(5));
    }

    #[test]
    fn persistent_requires_database_url() {
        assert_eq!(
            load(&[("USE_PERSISTENT_STORES", "true")]).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );

        let config = load(&[
            ("USE_PERSISTENT_STORES", "1"),
            ("DATABASE_URL", "postgres://localhost/commitbox"),
        ])
        .unwrap();
        assert_eq!(
            config.backend,
            Backend::Postgres {
                database_url: "postgres://localhost/commitbox".to_string()
            }
        );
    }

    #[test]
    fn database_url_is_ignored_without_the_flag() {
        let config = load(&[("DATABASE_URL", "postgres://localhost/commitbox")]).unwrap();
        assert_eq!(config.backend, Backend::InMemory);
    }

    #[test]
    fn commit_timeout_override() {
        let config = load(&[("COMMITBOX_COMMIT_TIMEOUT_MS", "250")]).unwrap();
        assert_eq!(config.unit_of_work.commit_timeout, Duration::from_millis(250));
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(matches!(
            load(&[("USE_PERSISTENT_STORES", "maybe")]),
            Err(ConfigError::Invalid { key: "USE_PERSISTENT_STORES", .. })
        ));
        assert!(matches!(
            load(&[("COMMITBOX_COMMIT_TIMEOUT_MS", "0")]),
            Err(ConfigError::Invalid { key: "COMMITBOX_COMMIT_TIMEOUT_MS", .. })
        ));
        assert!(matches!(
            load(&[("COMMITBOX_COMMIT_TIMEOUT_MS", "soon")]),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
