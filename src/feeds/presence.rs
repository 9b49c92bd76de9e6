//! Presence feed ("who is online").
//!
//! Each `online_users` envelope carries the complete user list and replaces
//! the view; updates are never merged.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

use super::{
    Endpoints, Feed, FeedError, FeedKind, FeedStatus, Lifecycle, Subscription, ViewCell,
    ONLINE_USERS,
};
use crate::channel::{ChannelAddress, Envelope, ReconnectPolicy};
use crate::registry::ChannelRegistry;

/// Field of an `online_users` envelope holding the user list.
const USERS_FIELD: &str = "users";

/// Live set of online users.
#[derive(Debug)]
pub struct PresenceFeed {
    subscription: Subscription,
    view: Arc<ViewCell<Vec<Value>>>,
}

impl PresenceFeed {
    /// Create an idle presence feed.
    pub fn new(
        registry: ChannelRegistry,
        endpoints: &Endpoints,
        policy: ReconnectPolicy,
    ) -> Result<Self, FeedError> {
        let address = endpoints.address(&FeedKind::Presence)?;
        Ok(Self::at(registry, address, policy))
    }

    /// Create an idle presence feed on an explicit channel address.
    #[must_use]
    pub fn at(registry: ChannelRegistry, address: ChannelAddress, policy: ReconnectPolicy) -> Self {
        Self {
            subscription: Subscription::new(registry, address, policy),
            view: Arc::new(ViewCell::default()),
        }
    }

    /// Create and immediately subscribe.
    pub fn open(
        registry: ChannelRegistry,
        endpoints: &Endpoints,
        policy: ReconnectPolicy,
    ) -> Result<Self, FeedError> {
        let feed = Self::new(registry, endpoints, policy)?;
        feed.subscribe()?;
        Ok(feed)
    }

    /// Start receiving presence updates.
    pub fn subscribe(&self) -> Result<(), FeedError> {
        let view = Arc::clone(&self.view);
        let status_view = Arc::clone(&self.view);
        self.subscription.subscribe(
            move |envelope| {
                if let Some(users) = users_of(envelope) {
                    view.update(|current| {
                        if *current == users {
                            return false;
                        }
                        *current = users;
                        true
                    });
                }
            },
            move || status_view.touch(),
        )
    }

    /// Stop receiving and clear the view. Terminal.
    pub fn unsubscribe(&self) {
        if self.subscription.unsubscribe() {
            self.view.update(|users| {
                users.clear();
                true
            });
        }
    }

    /// Lifecycle position.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.subscription.lifecycle()
    }

    /// Users in the latest update, in the server's order.
    #[must_use]
    pub fn users(&self) -> Vec<Value> {
        self.view.read(Clone::clone)
    }

    /// Whether `user` is in the latest update.
    #[must_use]
    pub fn is_online(&self, user: &Value) -> bool {
        self.view.read(|users| users.contains(user))
    }

    /// Number of users online.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.view.read(Vec::len)
    }
}

/// Extract the user list from an `online_users` envelope.
fn users_of(envelope: &Envelope) -> Option<Vec<Value>> {
    if !envelope.is(ONLINE_USERS) {
        log::debug!("[Feed] Presence ignoring '{}'", envelope.kind);
        return None;
    }
    match envelope.field(USERS_FIELD) {
        Some(Value::Array(users)) => Some(users.clone()),
        other => {
            log::warn!(
                "[Feed] Presence update without a '{}' list: {:?}",
                USERS_FIELD,
                other
            );
            None
        }
    }
}

impl Feed for PresenceFeed {
    type Item = Value;

    fn items(&self) -> Vec<Value> {
        self.users()
    }

    fn status(&self) -> FeedStatus {
        self.subscription.status()
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.view.subscribe()
    }

    fn len(&self) -> usize {
        self.online_count()
    }
}

impl Drop for PresenceFeed {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
