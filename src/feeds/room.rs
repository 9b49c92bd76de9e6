//! Chat room feed.
//!
//! Keeps the messages of one room in arrival order. Arrival order is used
//! instead of message timestamps because sender clocks may be skewed.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use super::{
    check_room_id, ChatFeed, Endpoints, Feed, FeedError, FeedKind, FeedStatus, Lifecycle,
    Subscription, ViewCell, CHAT_MESSAGE,
};
use crate::channel::{ChannelAddress, Envelope, ReconnectPolicy, SendStatus};
use crate::registry::ChannelRegistry;
use crate::rest::HistorySource;

#[derive(Debug, Default)]
struct RoomView {
    /// History first, then live messages in arrival order.
    messages: Vec<Envelope>,
    /// How many leading entries came from the history load.
    history_len: usize,
    /// Entries before this index have been seen by the user.
    read_upto: usize,
}

/// Live view of one chat room.
#[derive(Debug)]
pub struct RoomFeed {
    room: String,
    subscription: Subscription,
    view: Arc<ViewCell<RoomView>>,
}

impl RoomFeed {
    /// Create an idle feed for `room`.
    pub fn new(
        registry: ChannelRegistry,
        endpoints: &Endpoints,
        room: &str,
        policy: ReconnectPolicy,
    ) -> Result<Self, FeedError> {
        let room = check_room_id(room)?;
        let address = endpoints.address(&FeedKind::Room(room.to_string()))?;
        Ok(Self::at(registry, address, room, policy))
    }

    /// Create an idle feed for `room` on an explicit channel address.
    ///
    /// Lets several rooms share one multiplexed connection when the server
    /// pushes every room over a single socket.
    #[must_use]
    pub fn at(
        registry: ChannelRegistry,
        address: ChannelAddress,
        room: &str,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            room: room.to_string(),
            subscription: Subscription::new(registry, address, policy),
            view: Arc::new(ViewCell::default()),
        }
    }

    /// Create and immediately subscribe.
    pub fn open(
        registry: ChannelRegistry,
        endpoints: &Endpoints,
        room: &str,
        policy: ReconnectPolicy,
    ) -> Result<Self, FeedError> {
        let feed = Self::new(registry, endpoints, room, policy)?;
        feed.subscribe()?;
        Ok(feed)
    }

    /// Start receiving messages for this room.
    pub fn subscribe(&self) -> Result<(), FeedError> {
        let room = self.room.clone();
        let view = Arc::clone(&self.view);
        let status_view = Arc::clone(&self.view);
        self.subscription.subscribe(
            move |envelope| {
                if !envelope.is(CHAT_MESSAGE) {
                    log::debug!("[Feed] Room {} ignoring '{}'", room, envelope.kind);
                    return;
                }
                if envelope.room.as_deref().is_some_and(|r| r != room) {
                    log::trace!("[Feed] Room {} skipping message for another room", room);
                    return;
                }
                view.update(|v| {
                    v.messages.push(envelope.clone());
                    true
                });
            },
            move || status_view.touch(),
        )
    }

    /// Stop receiving and clear the view. Terminal.
    pub fn unsubscribe(&self) {
        if self.subscription.unsubscribe() {
            self.view.update(|v| {
                *v = RoomView::default();
                true
            });
        }
    }

    /// Lifecycle position.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.subscription.lifecycle()
    }

    /// Room id.
    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Channel address this feed listens on.
    #[must_use]
    pub fn address(&self) -> &ChannelAddress {
        self.subscription.address()
    }

    /// History followed by live messages, in arrival order.
    #[must_use]
    pub fn messages(&self) -> Vec<Envelope> {
        self.view.read(|v| v.messages.clone())
    }

    /// Messages that arrived after the last [`Self::mark_read`].
    #[must_use]
    pub fn unread(&self) -> usize {
        self.view.read(|v| v.messages.len().saturating_sub(v.read_upto))
    }

    /// Mark everything currently in the view as read.
    pub fn mark_read(&self) {
        self.view.update(|v| {
            let changed = v.read_upto != v.messages.len();
            v.read_upto = v.messages.len();
            changed
        });
    }

    /// Install previously loaded history ahead of any live messages.
    ///
    /// Replaces history from an earlier call. History counts as read.
    pub fn seed_history(&self, history: Vec<Envelope>) {
        let room = self.room.clone();
        self.view.update(move |v| {
            let live = v.messages.split_off(v.history_len);
            let unread_live = live.len().saturating_sub(v.read_upto.saturating_sub(v.history_len));
            let history: Vec<Envelope> = history
                .into_iter()
                .filter(|m| m.room.as_deref().map_or(true, |r| r == room))
                .collect();
            v.history_len = history.len();
            v.messages = history;
            v.messages.extend(live);
            v.read_upto = v.messages.len() - unread_live;
            true
        });
    }

    /// Fetch the last `limit` messages from `source` and seed them.
    pub async fn load_history(
        &self,
        source: &dyn HistorySource,
        limit: usize,
    ) -> anyhow::Result<usize> {
        let history = source.recent_messages(&self.room, limit).await?;
        let count = history.len();
        self.seed_history(history);
        log::info!("[Feed] Room {} loaded {} history message(s)", self.room, count);
        Ok(count)
    }

    /// Send `text` to the room as a `chat_message`.
    ///
    /// The server echoes the enriched message back; the view only changes
    /// when that echo arrives.
    pub fn send(&self, text: &str) -> SendStatus {
        let envelope = Envelope::new(CHAT_MESSAGE)
            .with_room(self.room.clone())
            .with_field("message", text);
        self.subscription.send(&envelope)
    }
}

impl Feed for RoomFeed {
    type Item = Envelope;

    fn items(&self) -> Vec<Envelope> {
        self.messages()
    }

    fn status(&self) -> FeedStatus {
        self.subscription.status()
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.view.subscribe()
    }

    fn len(&self) -> usize {
        self.view.read(|v| v.messages.len())
    }
}

#[async_trait]
impl ChatFeed for RoomFeed {
    async fn send_text(&self, text: &str) -> anyhow::Result<SendStatus> {
        Ok(self.send(text))
    }
}

impl Drop for RoomFeed {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
