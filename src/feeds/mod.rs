//! Typed consumer adapters ("feeds").
//!
//! Each feed turns the generic envelope stream of one channel into a
//! domain-scoped local view and exposes a small read/write surface to UI
//! code. All socket-backed feeds share the same lifecycle:
//!
//! ```text
//!   Idle ──subscribe()──► Subscribed ──unsubscribe()/drop──► Unsubscribed
//!                          │                                  (terminal)
//!                          ├─ registry.acquire(address)
//!                          └─ connection.add_listener(view updater)
//! ```
//!
//! Unsubscribing removes the listener before releasing the registry
//! reference, and clears the view. A feed cannot be re-subscribed; create a
//! new one instead.
//!
//! | Feed | Path | Accepts | View |
//! |------|------|---------|------|
//! | [`RoomFeed`] | `/ws/chat/{room}/` | `chat_message` for its room | append, arrival order |
//! | [`GlobalFeed`] | `/ws/payments/`, `/ws/fleet/live/` | configured types | newest-first or chronological |
//! | [`PresenceFeed`] | `/ws/users/` | `online_users` | replaced by each update |
//! | [`PollingFeed`] | REST | fetched list | replaced by each poll |

// Rust guideline compliant 2026-02

pub mod global;
pub mod polling;
pub mod presence;
pub mod room;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::{
    AddressError, ChannelAddress, ChannelConnection, CloseReason, ConnectionState, Envelope,
    ListenerId, ReconnectPolicy, SendStatus,
};
use crate::registry::ChannelRegistry;

pub use global::{FeedOrder, GlobalFeed, GlobalFeedOptions};
pub use polling::PollingFeed;
pub use presence::PresenceFeed;
pub use room::RoomFeed;

/// Discriminant of chat messages, inbound and outbound.
pub const CHAT_MESSAGE: &str = "chat_message";
/// Discriminant of presence snapshots.
pub const ONLINE_USERS: &str = "online_users";
/// Discriminant of payment stream events.
pub const PAYMENT_EVENT: &str = "payment_event";
/// Discriminant of fleet position updates.
pub const FLEET_UPDATE: &str = "fleet_update";

/// Errors from feed construction and lifecycle misuse.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// The feed's channel address could not be built.
    #[error(transparent)]
    Address(#[from] AddressError),
    /// `subscribe` was called on a feed that is already subscribed.
    #[error("feed is already subscribed")]
    AlreadySubscribed,
    /// The feed was unsubscribed; create a new one instead.
    #[error("feed was unsubscribed and cannot be reused")]
    Unsubscribed,
    /// A room feed needs a non-empty room id.
    #[error("room id must not be empty")]
    EmptyRoom,
    /// The room id cannot be carried as a single URL path segment.
    #[error("room id {0:?} is not a valid path segment")]
    InvalidRoom(String),
}

/// Trimmed `room`, or an error when it would not map to exactly one URL
/// path segment of its own.
///
/// # Errors
///
/// [`FeedError::EmptyRoom`] for blank ids, [`FeedError::InvalidRoom`] for
/// `.`/`..` and ids containing `/`, `\`, `?`, `#`, `%` or control characters.
pub fn check_room_id(room: &str) -> Result<&str, FeedError> {
    let room = room.trim();
    if room.is_empty() {
        return Err(FeedError::EmptyRoom);
    }
    let reserved = |c: char| matches!(c, '/' | '\\' | '?' | '#' | '%') || c.is_control();
    if room == "." || room == ".." || room.contains(reserved) {
        return Err(FeedError::InvalidRoom(room.to_string()));
    }
    Ok(room)
}

/// Which real-time feed a channel carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FeedKind {
    /// Chat room.
    Room(String),
    /// Global payment event stream.
    Payments,
    /// Who is online.
    Presence,
    /// Live fleet tracking.
    FleetLive,
}

impl FeedKind {
    /// Fixed path of this feed relative to the real-time endpoint.
    #[must_use]
    pub fn path(&self) -> String {
        match self {
            Self::Room(room) => format!("/ws/chat/{room}/"),
            Self::Payments => "/ws/payments/".to_string(),
            Self::Presence => "/ws/users/".to_string(),
            Self::FleetLive => "/ws/fleet/live/".to_string(),
        }
    }
}

/// Supplies the bearer token appended to channel URLs.
///
/// The client only reads the token; refresh and expiry belong to the owner.
pub trait TokenSource: Send + Sync {
    /// Current token, if the user is authenticated.
    fn bearer_token(&self) -> Option<String>;
}

/// A token fixed at construction time.
#[derive(Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    /// Wrap an optional token; empty strings count as absent.
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.is_empty()))
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StaticToken")
            .field(&self.0.as_ref().map(|_| "***"))
            .finish()
    }
}

impl TokenSource for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Builds channel addresses from the configured real-time endpoint.
#[derive(Clone)]
pub struct Endpoints {
    base: String,
    tokens: Arc<dyn TokenSource>,
}

impl fmt::Debug for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoints")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl Endpoints {
    /// Endpoints rooted at `base_url` (`ws(s)://` or `http(s)://`).
    pub fn new(base_url: &str) -> Result<Self, AddressError> {
        Self::with_tokens(base_url, Arc::new(StaticToken::default()))
    }

    /// Endpoints that append the token from `tokens` to every address.
    pub fn with_tokens(base_url: &str, tokens: Arc<dyn TokenSource>) -> Result<Self, AddressError> {
        let base = ChannelAddress::parse(base_url)?;
        Ok(Self {
            base: base.as_str().trim_end_matches('/').to_string(),
            tokens,
        })
    }

    /// Resolved base endpoint.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Address of `kind`, carrying the current token when there is one.
    ///
    /// # Errors
    ///
    /// Room ids rejected by [`check_room_id`], or an unparsable result.
    pub fn address(&self, kind: &FeedKind) -> Result<ChannelAddress, FeedError> {
        if let FeedKind::Room(room) = kind {
            check_room_id(room)?;
        }
        let address = ChannelAddress::parse(&format!("{}{}", self.base, kind.path()))?;
        Ok(match self.tokens.bearer_token() {
            Some(token) => address.with_token(&token),
            None => address,
        })
    }
}

/// User-visible health of a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    /// Created but not yet subscribed.
    Idle,
    /// Receiving updates.
    Live,
    /// Transport is down; updates resume after reconnect.
    Offline,
    /// Polling fallback could not reach the REST collaborator.
    Failed(String),
    /// Unsubscribed; terminal.
    Unsubscribed,
}

impl FeedStatus {
    /// Status shown while subscribed to a connection in `state`.
    #[must_use]
    pub fn from_connection(state: &ConnectionState) -> Self {
        match state {
            ConnectionState::Open => Self::Live,
            ConnectionState::Closed(CloseReason::RetriesExhausted) => {
                Self::Failed(CloseReason::RetriesExhausted.to_string())
            }
            _ => Self::Offline,
        }
    }
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Live => f.write_str("live"),
            Self::Offline => f.write_str("offline"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Unsubscribed => f.write_str("unsubscribed"),
        }
    }
}

/// Read surface shared by every feed.
pub trait Feed {
    /// One element of the view.
    type Item: Clone;

    /// Copy of the current view, in display order.
    fn items(&self) -> Vec<Self::Item>;

    /// Current health.
    fn status(&self) -> FeedStatus;

    /// Revision counter bumped on every view or status change.
    fn changes(&self) -> watch::Receiver<u64>;

    /// Number of items in the view.
    fn len(&self) -> usize {
        self.items().len()
    }

    /// Whether the view is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Chat surface that is agnostic to the transport behind it.
#[async_trait]
pub trait ChatFeed: Feed<Item = Envelope> + Send + Sync {
    /// Send a user-authored message.
    ///
    /// Socket-backed feeds return [`SendStatus::NotConnected`] instead of
    /// queueing when offline; the polling fallback returns an error when the
    /// REST call fails.
    async fn send_text(&self, text: &str) -> anyhow::Result<SendStatus>;
}

/// A view plus a revision counter the UI can await.
pub(crate) struct ViewCell<V> {
    view: Mutex<V>,
    revision: watch::Sender<u64>,
}

impl<V: Default> Default for ViewCell<V> {
    fn default() -> Self {
        Self {
            view: Mutex::new(V::default()),
            revision: watch::channel(0).0,
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for ViewCell<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewCell")
            .field("view", &*self.lock())
            .field("revision", &*self.revision.borrow())
            .finish()
    }
}

impl<V> ViewCell<V> {
    fn lock(&self) -> MutexGuard<'_, V> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f`; bump the revision when it reports a change.
    pub(crate) fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut V) -> bool,
    {
        let changed = f(&mut self.lock());
        if changed {
            self.touch();
        }
        changed
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&V) -> R) -> R {
        f(&self.lock())
    }

    pub(crate) fn touch(&self) {
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

/// Where a socket-backed feed is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Not yet subscribed.
    Idle,
    /// Listening on a shared connection.
    Subscribed,
    /// Done; terminal.
    Unsubscribed,
}

enum Phase {
    Idle,
    Subscribed {
        connection: ChannelConnection,
        listener: ListenerId,
        state_watcher: JoinHandle<()>,
    },
    Unsubscribed,
}

/// Registry membership of one feed: one address, one listener.
pub(crate) struct Subscription {
    registry: ChannelRegistry,
    address: ChannelAddress,
    policy: ReconnectPolicy,
    phase: Mutex<Phase>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("address", &self.address)
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub(crate) fn new(
        registry: ChannelRegistry,
        address: ChannelAddress,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            registry,
            address,
            policy,
            phase: Mutex::new(Phase::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn address(&self) -> &ChannelAddress {
        &self.address
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        match &*self.lock() {
            Phase::Idle => Lifecycle::Idle,
            Phase::Subscribed { .. } => Lifecycle::Subscribed,
            Phase::Unsubscribed => Lifecycle::Unsubscribed,
        }
    }

    /// Acquire the shared connection and register `listener` on it.
    ///
    /// `on_state` runs on every connection state change until unsubscribe.
    /// Must be called from within a tokio runtime.
    pub(crate) fn subscribe<L, S>(&self, listener: L, on_state: S) -> Result<(), FeedError>
    where
        L: Fn(&Envelope) + Send + Sync + 'static,
        S: Fn() + Send + 'static,
    {
        let mut phase = self.lock();
        match &*phase {
            Phase::Subscribed { .. } => return Err(FeedError::AlreadySubscribed),
            Phase::Unsubscribed => return Err(FeedError::Unsubscribed),
            Phase::Idle => {}
        }

        let connection = self.registry.acquire(&self.address, &self.policy);
        let listener = connection.add_listener(listener);

        let mut states = connection.watch_state();
        let state_watcher = tokio::spawn(async move {
            while states.changed().await.is_ok() {
                on_state();
            }
        });

        log::debug!("[Feed] Subscribed to {} as {}", self.address, listener);
        *phase = Phase::Subscribed {
            connection,
            listener,
            state_watcher,
        };
        Ok(())
    }

    /// Remove the listener, then release the registry reference.
    ///
    /// Returns `true` if this call performed the transition.
    pub(crate) fn unsubscribe(&self) -> bool {
        let previous = std::mem::replace(&mut *self.lock(), Phase::Unsubscribed);
        match previous {
            Phase::Subscribed {
                connection,
                listener,
                state_watcher,
            } => {
                connection.remove_listener(listener);
                state_watcher.abort();
                self.registry.release(&self.address);
                log::debug!("[Feed] Unsubscribed from {}", self.address);
                true
            }
            Phase::Idle => true,
            Phase::Unsubscribed => false,
        }
    }

    pub(crate) fn connection(&self) -> Option<ChannelConnection> {
        match &*self.lock() {
            Phase::Subscribed { connection, .. } => Some(connection.clone()),
            _ => None,
        }
    }

    pub(crate) fn status(&self) -> FeedStatus {
        match &*self.lock() {
            Phase::Idle => FeedStatus::Idle,
            Phase::Subscribed { connection, .. } => FeedStatus::from_connection(&connection.state()),
            Phase::Unsubscribed => FeedStatus::Unsubscribed,
        }
    }

    /// Send through the shared connection, if subscribed.
    pub(crate) fn send(&self, envelope: &Envelope) -> SendStatus {
        match self.connection() {
            Some(connection) => connection.send(envelope),
            None => {
                log::warn!(
                    "[Feed] Dropping '{}' for {}: not subscribed",
                    envelope.kind,
                    self.address
                );
                SendStatus::NotConnected
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
