/// Configuration management
use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::backfill::DEFAULT_BATCH_LIMIT;
use crate::crypto::cipher::FALLBACK_SCHEME_VERSIONS;
use crate::interaction_cache::{DEFAULT_INTERACTION_TTL, DEFAULT_PREVIEW_TTL};

const DEFAULT_BACKFILL_INTERVAL: Duration = Duration::from_secs(60);

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Scheme versions attempted when decrypting, in order
    pub candidate_scheme_versions: Vec<u32>,

    /// Idle lifetime of a pending multi-step interaction
    pub interaction_ttl: Duration,

    /// Idle lifetime of an out-of-band attachment preview
    pub preview_ttl: Duration,

    /// Delay between backfill reconciliation passes
    pub backfill_interval: Duration,

    /// Max unresolved references examined per backfill pass
    pub backfill_batch: usize,

    /// Data directory for persistent stores
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            candidate_scheme_versions: FALLBACK_SCHEME_VERSIONS.to_vec(),
            interaction_ttl: DEFAULT_INTERACTION_TTL,
            preview_ttl: DEFAULT_PREVIEW_TTL,
            backfill_interval: DEFAULT_BACKFILL_INTERVAL,
            backfill_batch: DEFAULT_BATCH_LIMIT,
            data_dir: PathBuf::from(".kakaobridge"),
        }
    }
}

impl Config {
    /// Create config from the environment, falling back to defaults.
    /// Recognized variables: KAKAOBRIDGE_DATA_DIR, KAKAOBRIDGE_INTERACTION_TTL_SECS,
    /// KAKAOBRIDGE_PREVIEW_TTL_SECS, KAKAOBRIDGE_BACKFILL_INTERVAL_SECS,
    /// KAKAOBRIDGE_BACKFILL_BATCH.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("KAKAOBRIDGE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_u64("KAKAOBRIDGE_INTERACTION_TTL_SECS")? {
            config.interaction_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("KAKAOBRIDGE_PREVIEW_TTL_SECS")? {
            config.preview_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("KAKAOBRIDGE_BACKFILL_INTERVAL_SECS")? {
            config.backfill_interval = Duration::from_secs(secs);
        }
        if let Some(batch) = env_u64("KAKAOBRIDGE_BACKFILL_BATCH")? {
            if batch == 0 {
                return Err(BridgeError::Config(
                    "KAKAOBRIDGE_BACKFILL_BATCH must be at least 1".to_string(),
                ));
            }
            config.backfill_batch = batch as usize;
        }

        Ok(config)
    }
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| BridgeError::Config(format!("{} must be a non-negative integer", name))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.candidate_scheme_versions, vec![31, 32, 30]);
        assert_eq!(config.interaction_ttl, Duration::from_secs(180));
        assert_eq!(config.preview_ttl, Duration::from_secs(90));
        assert_eq!(config.backfill_batch, 100);
    }
}
