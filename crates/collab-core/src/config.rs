use std::time::Duration;

use crate::editor_id::EditorId;
use crate::key::{KeyGenerator, PrefixedKeys, RandomKeys};

/// How a session mints keys for new nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyStrategy {
    /// `<editor>-<n>`; deterministic, used by tests and replays.
    #[default]
    Prefixed,
    /// Random hex keys.
    Random,
}

impl KeyStrategy {
    pub fn generator(self, editor: &EditorId) -> Box<dyn KeyGenerator> {
        match self {
            KeyStrategy::Prefixed => Box::new(PrefixedKeys::new(editor)),
            KeyStrategy::Random => Box::new(RandomKeys),
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long initial value resolution may take before a notice is shown.
    pub slow_notice: Duration,
    /// Capacity of the command queue feeding a running session.
    pub queue_capacity: usize,
    pub key_strategy: KeyStrategy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            slow_notice: Duration::from_millis(300),
            queue_capacity: 64,
            key_strategy: KeyStrategy::Prefixed,
        }
    }
}

impl SessionConfig {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `PTE_SLOW_NOTICE_MS`: resolution notice threshold in milliseconds
    /// - `PTE_QUEUE_CAPACITY`: command queue capacity (at least 1)
    /// - `PTE_KEY_STRATEGY`: `prefixed` or `random`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`SessionConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup("PTE_SLOW_NOTICE_MS") {
            let ms: u64 = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid("PTE_SLOW_NOTICE_MS", raw.clone()))?;
            config.slow_notice = Duration::from_millis(ms);
        }

        if let Some(raw) = lookup("PTE_QUEUE_CAPACITY") {
            config.queue_capacity = raw
                .trim()
                .parse()
                .ok()
                .filter(|capacity| *capacity > 0)
                .ok_or_else(|| ConfigError::Invalid("PTE_QUEUE_CAPACITY", raw.clone()))?;
        }

        if let Some(raw) = lookup("PTE_KEY_STRATEGY") {
            config.key_strategy = match raw.trim().to_ascii_lowercase().as_str() {
                "prefixed" => KeyStrategy::Prefixed,
                "random" => KeyStrategy::Random,
                _ => return Err(ConfigError::Invalid("PTE_KEY_STRATEGY", raw)),
            };
        }

        Ok(config)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} has an invalid value: {1:?}")]
    Invalid(&'static str, String),
}
