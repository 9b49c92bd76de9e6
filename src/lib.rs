//! Channelmux - resilient multiplexed real-time channel client.
//!
//! Keeps long-lived WebSocket connections to a backend's real-time feeds
//! (chat rooms, payment events, presence, fleet tracking) and hands typed,
//! locally maintained views to UI code.
//!
//! # Architecture
//!
//! Three layers, each usable on its own:
//!
//! - **Channel** - one resilient connection per address: reconnects with
//!   backoff, parses envelopes, fans them out to listeners
//! - **Registry** - at most one connection per address, shared and
//!   reference-counted across consumers
//! - **Feeds** - typed adapters that filter the envelope stream into a
//!   domain view (room messages, event log, online users), plus a REST
//!   polling fallback with the same read surface
//!
//! # Modules
//!
//! - [`channel`] - Connection, envelope, backoff, listener set
//! - [`registry`] - Shared connection map
//! - [`feeds`] - Room, global, presence and polling feeds
//! - [`rest`] - History and support thread REST collaborators
//! - [`client`] - Facade that opens feeds from [`Config`]
//! - [`config`] - Configuration loading/saving
//! - [`ws`] - Thin async WebSocket transport

pub mod channel;
pub mod client;
pub mod config;
pub mod feeds;
pub mod registry;
pub mod rest;
pub mod ws;

// Re-export commonly used types
pub use channel::{
    ChannelAddress, ChannelConnection, ChannelFault, CloseReason, ConnectionState, Envelope,
    ReconnectPolicy, SendStatus,
};
pub use client::RealtimeClient;
pub use config::Config;
pub use feeds::{
    ChatFeed, Endpoints, Feed, FeedKind, FeedStatus, GlobalFeed, PollingFeed, PresenceFeed,
    RoomFeed,
};
pub use registry::{ChannelRegistry, ReleaseOutcome};
