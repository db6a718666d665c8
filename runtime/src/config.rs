//! The runtime's typed environment boundary. No TOML config store lives
//! here; `RuntimeConfig` is populated directly from the two environment
//! variables spec.md §6 fixes, plus the policy file path passed on the
//! command line.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Public assets directory (CA cert). Defaults to `/leash`.
    pub leash_dir: PathBuf,
    /// Private assets directory (CA key). Required, no default: the spec
    /// treats an unset `LEASH_PRIVATE_DIR` as a fatal misconfiguration
    /// rather than silently writing key material somewhere guessable.
    pub leash_private_dir: PathBuf,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let leash_dir = env::var_os("LEASH_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/leash"));
        let leash_private_dir =
            env::var_os("LEASH_PRIVATE_DIR").map(PathBuf::from).ok_or(ConfigError::MissingEnv("LEASH_PRIVATE_DIR"))?;
        Ok(Self { leash_dir, leash_private_dir })
    }

    /// Optional path to append structured `logfmt` events to, beyond the
    /// in-process broadcast. Unset by default: `SharedLogger` fans out to
    /// subscribers even with no file sink.
    pub fn log_path(&self) -> Option<PathBuf> {
        env::var_os("LEASH_LOG_PATH").map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn missing_private_dir_is_an_error() {
        // SAFETY: test-only env mutation, not run concurrently with anything
        // that reads LEASH_PRIVATE_DIR in this process.
        unsafe {
            env::remove_var("LEASH_PRIVATE_DIR");
        }
        assert!(matches!(RuntimeConfig::from_env(), Err(ConfigError::MissingEnv("LEASH_PRIVATE_DIR"))));
    }

    #[test]
    fn leash_dir_defaults_when_unset() {
        unsafe {
            env::remove_var("LEASH_DIR");
            env::set_var("LEASH_PRIVATE_DIR", "/tmp/leash-private-test");
        }
        let config = RuntimeConfig::from_env().unwrap();
        assert_eq!(config.leash_dir, PathBuf::from("/leash"));
        unsafe {
            env::remove_var("LEASH_PRIVATE_DIR");
        }
    }
}
