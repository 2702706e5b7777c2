//! Delivery plugins
//!
//! A plugin carries rendered messages over one mode. It reports exactly
//! one of success, transient failure, permanent failure or an ambiguous
//! outcome; retries, fallback and timeouts belong to the worker pool.

mod log;
mod webhook;

pub use self::log::LogPlugin;
pub use self::webhook::WebhookPlugin;

use async_trait::async_trait;
use iris_core::{ChannelError, ConfigError, Message, Mode, PluginConfig};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Mode-specific delivery backend
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Mode this plugin carries
    fn mode(&self) -> &Mode;

    /// Deliver the message to its current contact
    ///
    /// # Errors
    /// - `ChannelError::Transient` when the provider may accept a retry
    /// - `ChannelError::Permanent` when the destination or payload is rejected
    /// - `ChannelError::Ambiguous` when delivery may or may not have happened
    async fn send(&self, message: &Message) -> Result<(), ChannelError>;
}

/// Plugins indexed by mode
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<Mode, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration
    ///
    /// # Errors
    /// `ConfigError::Invalid` when a plugin cannot be constructed
    pub fn from_config(
        plugins: &BTreeMap<Mode, PluginConfig>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for (mode, config) in plugins {
            let plugin: Arc<dyn Plugin> = match config {
                PluginConfig::Log => Arc::new(LogPlugin::new(mode.clone())),
                PluginConfig::Webhook { url, token } => Arc::new(
                    WebhookPlugin::new(mode.clone(), url.clone(), timeout)
                        .map_err(|e| ConfigError::Invalid(format!("plugin {mode}: {e}")))?
                        .with_token(token.clone()),
                ),
            };
            registry.register(plugin);
        }
        Ok(registry)
    }

    /// Register a plugin, replacing any for the same mode
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> &mut Self {
        self.plugins.insert(plugin.mode().clone(), plugin);
        self
    }

    /// Plugin for a mode
    #[must_use]
    pub fn get(&self, mode: &Mode) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(mode)
    }

    /// Registered modes, sorted
    #[must_use]
    pub fn modes(&self) -> Vec<Mode> {
        let mut modes: Vec<Mode> = self.plugins.keys().cloned().collect();
        modes.sort();
        modes
    }

    /// Number of plugins
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether no plugin is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("modes", &self.modes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_from_config() {
        let mut config = BTreeMap::new();
        config.insert(Mode::email(), PluginConfig::Log);
        config.insert(
            Mode::im(),
            PluginConfig::Webhook {
                url: "http://127.0.0.1:9/hook".into(),
                token: None,
            },
        );
        let registry = PluginRegistry::from_config(&config, Duration::from_secs(5)).unwrap();
        assert_eq!(registry.modes(), vec![Mode::email(), Mode::im()]);
        assert!(registry.get(&Mode::sms()).is_none());
    }
}
