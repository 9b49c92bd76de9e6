//! Client facade.
//!
//! Bundles one [`ChannelRegistry`], the configured endpoints and reconnect
//! policy, and the REST client, so UI code opens feeds by name without
//! threading those through every call. Feeds opened from the same client
//! share connections.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::channel::{ErrorHook, ReconnectPolicy};
use crate::config::Config;
use crate::feeds::{Endpoints, GlobalFeed, PollingFeed, PresenceFeed, RoomFeed};
use crate::registry::ChannelRegistry;
use crate::rest::{MessageSource, RestClient};

/// Entry point for opening feeds.
#[derive(Debug, Clone)]
pub struct RealtimeClient {
    registry: ChannelRegistry,
    endpoints: Endpoints,
    policy: ReconnectPolicy,
    rest: RestClient,
    poll_interval: std::time::Duration,
}

impl RealtimeClient {
    /// Build a client from loaded configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::build(config, ChannelRegistry::new())
    }

    /// Like [`Self::from_config`], reporting every channel fault to `hook`.
    pub fn with_hook(config: &Config, hook: ErrorHook) -> Result<Self> {
        Self::build(config, ChannelRegistry::with_hook(hook))
    }

    fn build(config: &Config, registry: ChannelRegistry) -> Result<Self> {
        let rest = RestClient::new(&config.api_url, config.token.clone())
            .context("Failed to create REST client")?;
        Ok(Self {
            registry,
            endpoints: config.endpoints()?,
            policy: config.reconnect_policy(),
            rest,
            poll_interval: config.poll_interval(),
        })
    }

    /// Shared connection registry.
    #[must_use]
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// REST collaborator (history, support threads).
    #[must_use]
    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    /// Subscribed feed for chat `room`.
    pub fn room(&self, room: &str) -> Result<RoomFeed> {
        RoomFeed::open(self.registry.clone(), &self.endpoints, room, self.policy.clone())
            .with_context(|| format!("Failed to open room '{room}'"))
    }

    /// Subscribed payment event log.
    pub fn payments(&self) -> Result<GlobalFeed> {
        GlobalFeed::payments(self.registry.clone(), &self.endpoints, self.policy.clone())
            .context("Failed to open payments feed")
    }

    /// Subscribed fleet tracking feed.
    pub fn fleet_live(&self) -> Result<GlobalFeed> {
        GlobalFeed::fleet_live(self.registry.clone(), &self.endpoints, self.policy.clone())
            .context("Failed to open fleet feed")
    }

    /// Subscribed presence feed.
    pub fn presence(&self) -> Result<PresenceFeed> {
        PresenceFeed::open(self.registry.clone(), &self.endpoints, self.policy.clone())
            .context("Failed to open presence feed")
    }

    /// Started polling feed for support thread `thread_id`.
    pub fn support_thread(&self, thread_id: &str) -> Result<PollingFeed> {
        let source: Arc<dyn MessageSource> = Arc::new(self.rest.support_thread(thread_id));
        let feed = PollingFeed::new(source, self.poll_interval);
        feed.start()
            .with_context(|| format!("Failed to start polling support thread '{thread_id}'"))?;
        Ok(feed)
    }

    /// Close every shared connection. Feeds still alive report `Offline`.
    pub fn shutdown(&self) {
        log::info!("[Client] Shutting down {} connection(s)", self.registry.len());
        self.registry.close_all();
    }
}
