//! Engine-level configuration.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::listener::ListenerConfig;
use crate::store::{create_adapter, StoreAdapter, StoreBackendConfig, StoreFlavor, StoreOptions};
use crate::Result;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeoConfig {
    /// Storage backend configuration (Memory, Filesystem, S3, Azure, GCS)
    pub store: StoreBackendConfig,

    /// Adapter flavor layered over the backend
    #[serde(default)]
    pub flavor: StoreFlavor,

    /// Adapter tuning knobs
    #[serde(default)]
    pub tuning: StoreOptions,

    /// Index listener settings
    #[serde(default)]
    pub listener: ListenerSettings,
}

impl LeoConfig {
    /// Create the configured store adapter.
    pub fn create_adapter(&self) -> Result<Arc<dyn StoreAdapter>> {
        create_adapter(&self.store, self.flavor, self.tuning.clone())
    }

    /// Resolve the listener scheduler configuration.
    pub fn listener_config(&self) -> ListenerConfig {
        let defaults = ListenerConfig::default();
        ListenerConfig {
            parallelism: self.listener.parallelism.unwrap_or(defaults.parallelism),
            empty_poll_delay: Duration::from_millis(self.listener.empty_poll_delay_ms),
        }
    }
}

/// Index listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSettings {
    /// Maximum distinct logical keys in flight; defaults to the host's
    /// effective parallelism.
    #[serde(default)]
    pub parallelism: Option<usize>,

    /// Sleep after an empty queue fetch, in milliseconds (default: 2000)
    #[serde(default = "default_empty_poll_delay_ms")]
    pub empty_poll_delay_ms: u64,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            parallelism: None,
            empty_poll_delay_ms: default_empty_poll_delay_ms(),
        }
    }
}

fn default_empty_poll_delay_ms() -> u64 {
    2000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: LeoConfig =
            serde_json::from_str(r#"{"store":{"type":"memory"}}"#).unwrap();
        assert_eq!(config.flavor, StoreFlavor::Versioned);
        assert_eq!(config.listener.empty_poll_delay_ms, 2000);

        let listener = config.listener_config();
        assert!(listener.parallelism >= 1);
        assert_eq!(listener.empty_poll_delay, Duration::from_secs(2));
    }

    #[test]
    fn listener_parallelism_can_be_pinned() {
        let config: LeoConfig = serde_json::from_str(
            r#"{"store":{"type":"memory"},"flavor":"listing","listener":{"parallelism":2}}"#,
        )
        .unwrap();
        assert_eq!(config.flavor, StoreFlavor::Listing);
        assert_eq!(config.listener_config().parallelism, 2);
    }
}
