//! Resilient channel connections.
//!
//! A [`ChannelConnection`] owns one WebSocket to one logical feed address and
//! hides reconnection from its callers. Inbound frames are parsed into
//! [`Envelope`]s and fanned out to every registered listener.
//!
//! # Architecture
//!
//! ```text
//!   ChannelConnection (handle, Clone)        background task
//!         │                                        │
//!         │  add_listener(fn) ──► ListenerSet ◄─── │ dispatch(snapshot)
//!         │  send(envelope)  ──► outbound queue ──►│ writer.send_text
//!         │  close()         ──► shutdown watch ──►│ exit loop
//!         │                                        │
//!         │  watch_state() ◄──── ConnectionState ◄─│ Connecting/Open/Closed/Reconnecting
//! ```
//!
//! # Failure semantics
//!
//! - Transport errors close the socket and follow the reconnect path.
//! - Malformed frames are dropped and reported as [`ChannelFault::Protocol`].
//! - Sends while not open are dropped and reported, never queued.
//! - A panicking listener is isolated from the others.
//!
//! Every fault is logged and, when an [`ErrorHook`] is installed, passed to it.

// Rust guideline compliant 2026-02

pub mod backoff;
pub mod connection;
pub mod envelope;
pub mod listeners;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;

pub use backoff::Backoff;
pub use connection::ChannelConnection;
pub use envelope::{Envelope, EnvelopeError};
pub use listeners::ListenerId;

/// Lower bound applied to every reconnect delay so a failing server can
/// never put the client into a tight reconnect loop.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(50);

/// Default base reconnect delay.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// Default cap on the reconnect delay.
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Longest accepted heartbeat interval.
pub const MAX_HEARTBEAT: Duration = Duration::from_secs(3600);

/// Query parameter carrying the bearer token on channel URLs.
const TOKEN_QUERY_PARAM: &str = "token";

/// Errors raised while parsing a [`ChannelAddress`].
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    /// The address string was empty.
    #[error("channel address is empty")]
    Empty,
    /// The address could not be parsed as a URL.
    #[error("invalid channel address {input:?}: {message}")]
    Invalid {
        /// The rejected input.
        input: String,
        /// URL parser message.
        message: String,
    },
    /// The URL scheme cannot carry a WebSocket.
    #[error("unsupported scheme {scheme:?} in channel address (expected ws, wss, http or https)")]
    UnsupportedScheme {
        /// The rejected scheme.
        scheme: String,
    },
    /// The URL has no host to connect to.
    #[error("channel address {0:?} has no host")]
    MissingHost(String),
}

/// Identifier of one logical real-time feed.
///
/// Stores the resolved `ws://`/`wss://` URL. Two addresses are equal iff
/// their resolved URLs are equal, so `http://host/ws/users/` and
/// `ws://host/ws/users/` name the same channel.
#[derive(Clone)]
pub struct ChannelAddress {
    url: Url,
}

impl ChannelAddress {
    /// Parse and resolve an address.
    ///
    /// `http(s)://` inputs are rewritten to `ws(s)://`.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }

        let resolved = crate::ws::http_to_ws_scheme(trimmed);
        let url = Url::parse(&resolved).map_err(|e| AddressError::Invalid {
            input: trimmed.to_string(),
            message: e.to_string(),
        })?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(AddressError::UnsupportedScheme {
                scheme: url.scheme().to_string(),
            });
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(AddressError::MissingHost(trimmed.to_string()));
        }

        Ok(Self { url })
    }

    /// Return a copy of this address carrying `token` as a query parameter.
    ///
    /// Any existing token parameter is replaced.
    #[must_use]
    pub fn with_token(&self, token: &str) -> Self {
        let mut url = self.url.clone();
        let retained: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != TOKEN_QUERY_PARAM)
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            for (key, value) in &retained {
                pairs.append_pair(key, value);
            }
            pairs.append_pair(TOKEN_QUERY_PARAM, token);
        }
        Self { url }
    }

    /// The resolved URL used for the WebSocket handshake.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// The path component, e.g. `/ws/chat/42/`.
    #[must_use]
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Resolved URL with the token value masked, for logs.
    #[must_use]
    pub fn redacted(&self) -> String {
        if !self.url.query_pairs().any(|(key, _)| key == TOKEN_QUERY_PARAM) {
            return self.url.to_string();
        }
        let mut url = self.url.clone();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(key, value)| {
                let value = if key == TOKEN_QUERY_PARAM {
                    "***".to_string()
                } else {
                    value.into_owned()
                };
                (key.into_owned(), value)
            })
            .collect();
        url.query_pairs_mut().clear().extend_pairs(pairs);
        url.to_string()
    }
}

impl PartialEq for ChannelAddress {
    fn eq(&self, other: &Self) -> bool {
        self.url.as_str() == other.url.as_str()
    }
}

impl Eq for ChannelAddress {}

impl Hash for ChannelAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.as_str().hash(state);
    }
}

impl fmt::Debug for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChannelAddress").field(&self.redacted()).finish()
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl std::str::FromStr for ChannelAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Why a socket stopped being open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The owner called [`ChannelConnection::close`]. Terminal.
    Requested,
    /// The server sent a close frame or ended the stream.
    ServerClosed {
        /// WebSocket close code (1006 when the stream ended without a frame).
        code: u16,
        /// Close reason supplied by the server.
        reason: String,
    },
    /// A read or write on the open socket failed.
    TransportError(String),
    /// The handshake did not complete.
    ConnectFailed(String),
    /// The liveness heartbeat saw no inbound traffic for two intervals.
    Stalled,
    /// `max_attempts` reconnects failed. Terminal.
    RetriesExhausted,
}

impl CloseReason {
    /// Whether this reason ends the connection for good regardless of policy.
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Requested | Self::RetriesExhausted)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "closed by owner"),
            Self::ServerClosed { code, reason } if reason.is_empty() => {
                write!(f, "closed by server (code {code})")
            }
            Self::ServerClosed { code, reason } => {
                write!(f, "closed by server (code {code}: {reason})")
            }
            Self::TransportError(msg) => write!(f, "transport error: {msg}"),
            Self::ConnectFailed(msg) => write!(f, "connect failed: {msg}"),
            Self::Stalled => write!(f, "no inbound traffic, connection stalled"),
            Self::RetriesExhausted => write!(f, "reconnect attempts exhausted"),
        }
    }
}

/// Lifecycle state of a [`ChannelConnection`].
///
/// `Connecting → Open → Closed(reason) → Reconnecting → Connecting …` until
/// the owner closes the connection or reconnection is disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Socket is open; sends are transmitted.
    Open,
    /// Socket is closed.
    Closed(CloseReason),
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting {
        /// 1-based reconnect attempt number.
        attempt: u32,
        /// Delay before this attempt starts.
        delay: Duration,
    },
}

impl ConnectionState {
    /// Whether the socket is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Short lowercase label for logs and status lines.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed(_) => "closed",
            Self::Reconnecting { .. } => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(reason) => write!(f, "closed ({reason})"),
            Self::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt} in {}ms)", delay.as_millis())
            }
            other => f.write_str(other.label()),
        }
    }
}

/// Reconnect and liveness behaviour of a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt, and after every successful open.
    pub base_delay: Duration,
    /// Upper bound for the growing delay.
    pub max_delay: Duration,
    /// Growth factor applied after each failed attempt (1.0 = linear/constant).
    pub multiplier: f64,
    /// Give up after this many consecutive failed reconnects. `None` = forever.
    pub max_attempts: Option<u32>,
    /// Whether unexpected closes trigger reconnection at all.
    pub reconnect: bool,
    /// Optional liveness heartbeat interval.
    pub heartbeat: Option<Duration>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_RECONNECT_DELAY,
            max_delay: DEFAULT_MAX_RECONNECT_DELAY,
            multiplier: 2.0,
            max_attempts: None,
            reconnect: true,
            heartbeat: None,
        }
    }
}

impl ReconnectPolicy {
    /// Policy with the given base delay and defaults otherwise.
    #[must_use]
    pub fn with_base_delay(base_delay: Duration) -> Self {
        Self {
            base_delay,
            ..Self::default()
        }
    }

    /// Policy that never reconnects.
    #[must_use]
    pub fn no_reconnect() -> Self {
        Self {
            reconnect: false,
            ..Self::default()
        }
    }

    /// Set the delay cap.
    #[must_use]
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Limit consecutive failed reconnects.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Enable the liveness heartbeat, clamped to
    /// [`MIN_RECONNECT_DELAY`]..=[`MAX_HEARTBEAT`].
    #[must_use]
    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = Some(interval.clamp(MIN_RECONNECT_DELAY, MAX_HEARTBEAT));
        self
    }

    /// Heartbeat interval with the bounds applied, also to values set
    /// directly on the field.
    #[must_use]
    pub fn effective_heartbeat(&self) -> Option<Duration> {
        self.heartbeat
            .map(|interval| interval.clamp(MIN_RECONNECT_DELAY, MAX_HEARTBEAT))
    }

    /// Base delay with the floor applied.
    #[must_use]
    pub fn effective_base_delay(&self) -> Duration {
        self.base_delay.max(MIN_RECONNECT_DELAY)
    }

    /// Delay cap, never below the effective base delay.
    #[must_use]
    pub fn effective_max_delay(&self) -> Duration {
        self.max_delay.max(self.effective_base_delay())
    }
}

/// Result of [`ChannelConnection::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Handed to the open socket.
    Sent,
    /// Dropped because the socket is not open. Not queued or retried.
    NotConnected,
    /// Dropped because the connection was closed by its owner.
    Closed,
}

impl SendStatus {
    /// Whether the envelope reached the socket.
    #[must_use]
    pub fn is_sent(self) -> bool {
        matches!(self, Self::Sent)
    }
}

/// Non-fatal faults observed by a connection.
///
/// None of these propagate to callers; they are logged and handed to the
/// [`ErrorHook`] so operators can diagnose repeated failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelFault {
    /// Socket-level failure; recovered by reconnecting.
    #[error("transport error on {address}: {message}")]
    Transport {
        /// Redacted channel address.
        address: String,
        /// Error description.
        message: String,
    },
    /// Inbound frame could not be parsed; the frame was discarded.
    #[error("protocol error on {address}: {message}")]
    Protocol {
        /// Redacted channel address.
        address: String,
        /// Parse error description.
        message: String,
        /// Leading bytes of the offending frame.
        frame_preview: String,
    },
    /// `send` was called while the socket was not open.
    #[error("send dropped on {address}: connection is {state}")]
    SendWhileDisconnected {
        /// Redacted channel address.
        address: String,
        /// State label at the time of the send.
        state: String,
        /// Discriminant of the dropped envelope.
        kind: String,
    },
    /// A listener panicked during dispatch; other listeners still ran.
    #[error("listener {listener} panicked on {address}: {message}")]
    ListenerPanicked {
        /// Redacted channel address.
        address: String,
        /// The faulty listener.
        listener: ListenerId,
        /// Panic payload, when it was a string.
        message: String,
    },
}

/// Observer for [`ChannelFault`]s.
pub type ErrorHook = Arc<dyn Fn(&ChannelFault) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_http_and_ws_forms_are_equal() {
        let a = ChannelAddress::parse("http://localhost:8000/ws/users/").unwrap();
        let b = ChannelAddress::parse("ws://localhost:8000/ws/users/").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "ws://localhost:8000/ws/users/");
    }

    #[test]
    fn test_address_https_resolves_to_wss() {
        let a = ChannelAddress::parse("https://api.example.com/ws/payments/").unwrap();
        assert_eq!(a.as_str(), "wss://api.example.com/ws/payments/");
    }

    #[test]
    fn test_address_different_paths_differ() {
        let a = ChannelAddress::parse("ws://h/ws/chat/1/").unwrap();
        let b = ChannelAddress::parse("ws://h/ws/chat/2/").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_address_rejects_empty() {
        assert!(matches!(ChannelAddress::parse("  "), Err(AddressError::Empty)));
    }

    #[test]
    fn test_address_rejects_relative_path() {
        assert!(matches!(
            ChannelAddress::parse("/ws/chat/1/"),
            Err(AddressError::Invalid { .. })
        ));
    }

    #[test]
    fn test_address_rejects_other_schemes() {
        assert!(matches!(
            ChannelAddress::parse("ftp://example.com/ws/"),
            Err(AddressError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn test_with_token_appends_query_param() {
        let a = ChannelAddress::parse("ws://h/ws/users/").unwrap().with_token("abc def");
        assert_eq!(a.as_str(), "ws://h/ws/users/?token=abc+def");
    }

    #[test]
    fn test_with_token_replaces_existing_token() {
        let a = ChannelAddress::parse("ws://h/ws/users/?v=2&token=old")
            .unwrap()
            .with_token("new");
        assert_eq!(a.as_str(), "ws://h/ws/users/?v=2&token=new");
    }

    #[test]
    fn test_token_changes_identity() {
        let plain = ChannelAddress::parse("ws://h/ws/users/").unwrap();
        assert_ne!(plain, plain.with_token("t"));
    }

    #[test]
    fn test_redacted_hides_token() {
        let a = ChannelAddress::parse("ws://h/ws/users/").unwrap().with_token("secret");
        assert_eq!(a.redacted(), "ws://h/ws/users/?token=***");
        assert!(!format!("{a}").contains("secret"));
        assert!(!format!("{a:?}").contains("secret"));
    }

    #[test]
    fn test_policy_floors_zero_delay() {
        let policy = ReconnectPolicy::with_base_delay(Duration::ZERO);
        assert_eq!(policy.effective_base_delay(), MIN_RECONNECT_DELAY);
    }

    #[test]
    fn test_policy_cap_never_below_base() {
        let policy = ReconnectPolicy::with_base_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(1));
        assert_eq!(policy.effective_max_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_heartbeat_is_clamped() {
        let huge = ReconnectPolicy::default().heartbeat(Duration::from_secs(u64::MAX));
        assert_eq!(huge.heartbeat, Some(MAX_HEARTBEAT));

        let tiny = ReconnectPolicy::default().heartbeat(Duration::ZERO);
        assert_eq!(tiny.heartbeat, Some(MIN_RECONNECT_DELAY));

        let direct = ReconnectPolicy {
            heartbeat: Some(Duration::MAX),
            ..ReconnectPolicy::default()
        };
        assert_eq!(direct.effective_heartbeat(), Some(MAX_HEARTBEAT));
        assert_eq!(ReconnectPolicy::default().effective_heartbeat(), None);
    }

    #[test]
    fn test_close_reason_finality() {
        assert!(CloseReason::Requested.is_final());
        assert!(CloseReason::RetriesExhausted.is_final());
        assert!(!CloseReason::Stalled.is_final());
        assert!(!CloseReason::ConnectFailed("refused".into()).is_final());
    }

    #[test]
    fn test_state_display() {
        let state = ConnectionState::Reconnecting {
            attempt: 2,
            delay: Duration::from_millis(4000),
        };
        assert_eq!(state.to_string(), "reconnecting (attempt 2 in 4000ms)");
        assert_eq!(ConnectionState::Open.to_string(), "open");
    }
}
