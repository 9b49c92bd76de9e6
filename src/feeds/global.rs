//! Global event feeds (payments, fleet tracking).
//!
//! No room scoping: every envelope of an accepted type enters the view.
//! Event logs read newest-first; tracking reads chronologically.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::watch;

use super::{
    Endpoints, Feed, FeedError, FeedKind, FeedStatus, Lifecycle, Subscription, ViewCell,
    FLEET_UPDATE, PAYMENT_EVENT,
};
use crate::channel::{ChannelAddress, Envelope, ReconnectPolicy, SendStatus};
use crate::registry::ChannelRegistry;

/// Where new envelopes go in the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOrder {
    /// Prepend; the first item is the latest event.
    NewestFirst,
    /// Append; the last item is the latest event.
    Chronological,
}

/// What a [`GlobalFeed`] keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalFeedOptions {
    /// Accepted discriminants; other envelopes are discarded.
    pub kinds: Vec<String>,
    /// Insertion order.
    pub order: FeedOrder,
    /// Evict the oldest entries beyond this many. `None` keeps everything.
    pub max_entries: Option<usize>,
}

impl GlobalFeedOptions {
    /// Payment event log: newest first.
    #[must_use]
    pub fn payments() -> Self {
        Self {
            kinds: vec![PAYMENT_EVENT.to_string()],
            order: FeedOrder::NewestFirst,
            max_entries: Some(500),
        }
    }

    /// Fleet tracking: chronological.
    #[must_use]
    pub fn fleet_live() -> Self {
        Self {
            kinds: vec![FLEET_UPDATE.to_string()],
            order: FeedOrder::Chronological,
            max_entries: Some(1000),
        }
    }

    fn accepts(&self, envelope: &Envelope) -> bool {
        self.kinds.iter().any(|kind| envelope.is(kind))
    }
}

/// Live view of a global event stream.
#[derive(Debug)]
pub struct GlobalFeed {
    options: Arc<GlobalFeedOptions>,
    subscription: Subscription,
    view: Arc<ViewCell<VecDeque<Envelope>>>,
}

impl GlobalFeed {
    /// Create an idle feed for `kind` with `options`.
    pub fn new(
        registry: ChannelRegistry,
        endpoints: &Endpoints,
        kind: &FeedKind,
        options: GlobalFeedOptions,
        policy: ReconnectPolicy,
    ) -> Result<Self, FeedError> {
        let address = endpoints.address(kind)?;
        Ok(Self::at(registry, address, options, policy))
    }

    /// Create an idle feed on an explicit channel address.
    #[must_use]
    pub fn at(
        registry: ChannelRegistry,
        address: ChannelAddress,
        options: GlobalFeedOptions,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            options: Arc::new(options),
            subscription: Subscription::new(registry, address, policy),
            view: Arc::new(ViewCell::default()),
        }
    }

    /// Subscribed payment event log.
    pub fn payments(
        registry: ChannelRegistry,
        endpoints: &Endpoints,
        policy: ReconnectPolicy,
    ) -> Result<Self, FeedError> {
        let feed = Self::new(
            registry,
            endpoints,
            &FeedKind::Payments,
            GlobalFeedOptions::payments(),
            policy,
        )?;
        feed.subscribe()?;
        Ok(feed)
    }

    /// Subscribed fleet tracking feed.
    pub fn fleet_live(
        registry: ChannelRegistry,
        endpoints: &Endpoints,
        policy: ReconnectPolicy,
    ) -> Result<Self, FeedError> {
        let feed = Self::new(
            registry,
            endpoints,
            &FeedKind::FleetLive,
            GlobalFeedOptions::fleet_live(),
            policy,
        )?;
        feed.subscribe()?;
        Ok(feed)
    }

    /// Start receiving events.
    pub fn subscribe(&self) -> Result<(), FeedError> {
        let options = Arc::clone(&self.options);
        let view = Arc::clone(&self.view);
        let status_view = Arc::clone(&self.view);
        self.subscription.subscribe(
            move |envelope| {
                if !options.accepts(envelope) {
                    log::debug!("[Feed] Global feed ignoring '{}'", envelope.kind);
                    return;
                }
                view.update(|entries| {
                    insert(entries, envelope.clone(), &options);
                    true
                });
            },
            move || status_view.touch(),
        )
    }

    /// Stop receiving and clear the view. Terminal.
    pub fn unsubscribe(&self) {
        if self.subscription.unsubscribe() {
            self.view.update(|entries| {
                entries.clear();
                true
            });
        }
    }

    /// Lifecycle position.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.subscription.lifecycle()
    }

    /// Options this feed was built with.
    #[must_use]
    pub fn options(&self) -> &GlobalFeedOptions {
        &self.options
    }

    /// The most recent event, if any.
    #[must_use]
    pub fn latest(&self) -> Option<Envelope> {
        self.view.read(|entries| match self.options.order {
            FeedOrder::NewestFirst => entries.front().cloned(),
            FeedOrder::Chronological => entries.back().cloned(),
        })
    }

    /// Send an envelope on the feed's channel (e.g. a filter request).
    pub fn send(&self, envelope: &Envelope) -> SendStatus {
        self.subscription.send(envelope)
    }
}

fn insert(entries: &mut VecDeque<Envelope>, envelope: Envelope, options: &GlobalFeedOptions) {
    match options.order {
        FeedOrder::NewestFirst => {
            entries.push_front(envelope);
            if let Some(max) = options.max_entries {
                entries.truncate(max);
            }
        }
        FeedOrder::Chronological => {
            entries.push_back(envelope);
            if let Some(max) = options.max_entries {
                while entries.len() > max {
                    entries.pop_front();
                }
            }
        }
    }
}

impl Feed for GlobalFeed {
    type Item = Envelope;

    fn items(&self) -> Vec<Envelope> {
        self.view.read(|entries| entries.iter().cloned().collect())
    }

    fn status(&self) -> FeedStatus {
        self.subscription.status()
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.view.subscribe()
    }

    fn len(&self) -> usize {
        self.view.read(VecDeque::len)
    }
}

impl Drop for GlobalFeed {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: i64) -> Envelope {
        Envelope::new(PAYMENT_EVENT).with_field("n", n)
    }

    fn numbers(entries: &VecDeque<Envelope>) -> Vec<i64> {
        entries
            .iter()
            .map(|e| e.field("n").and_then(serde_json::Value::as_i64).unwrap())
            .collect()
    }

    #[test]
    fn test_newest_first_prepends() {
        let options = GlobalFeedOptions {
            max_entries: None,
            ..GlobalFeedOptions::payments()
        };
        let mut entries = VecDeque::new();
        for n in 1..=3 {
            insert(&mut entries, event(n), &options);
        }
        assert_eq!(numbers(&entries), vec![3, 2, 1]);
    }

    #[test]
    fn test_chronological_appends() {
        let options = GlobalFeedOptions {
            kinds: vec![PAYMENT_EVENT.into()],
            ..GlobalFeedOptions::fleet_live()
        };
        let mut entries = VecDeque::new();
        for n in 1..=3 {
            insert(&mut entries, event(n), &options);
        }
        assert_eq!(numbers(&entries), vec![1, 2, 3]);
    }

    #[test]
    fn test_cap_evicts_oldest_in_both_orders() {
        let mut newest = GlobalFeedOptions::payments();
        newest.max_entries = Some(2);
        let mut chrono = GlobalFeedOptions::fleet_live();
        chrono.max_entries = Some(2);

        let mut a = VecDeque::new();
        let mut b = VecDeque::new();
        for n in 1..=4 {
            insert(&mut a, event(n), &newest);
            insert(&mut b, event(n), &chrono);
        }
        assert_eq!(numbers(&a), vec![4, 3]);
        assert_eq!(numbers(&b), vec![3, 4]);
    }

    #[test]
    fn test_accepts_only_configured_kinds() {
        let options = GlobalFeedOptions::payments();
        assert!(options.accepts(&event(1)));
        assert!(!options.accepts(&Envelope::new("heartbeat")));
    }

    #[test]
    fn test_latest_respects_order() {
        let endpoints = Endpoints::new("ws://127.0.0.1:1").unwrap();
        let feed = GlobalFeed::new(
            ChannelRegistry::new(),
            &endpoints,
            &FeedKind::Payments,
            GlobalFeedOptions::payments(),
            ReconnectPolicy::default(),
        )
        .unwrap();
        assert_eq!(feed.latest(), None);
        feed.view.update(|entries| {
            insert(entries, event(1), &feed.options);
            insert(entries, event(2), &feed.options);
            true
        });
        assert_eq!(feed.latest(), Some(event(2)));
    }
}
