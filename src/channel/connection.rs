//! One socket, one logical channel, transparent reconnection.
//!
//! [`ChannelConnection::open`] spawns a background task that owns the
//! WebSocket. The handle is cheap to clone; every clone talks to the same
//! task. The task holds only a weak reference to the shared state, so
//! dropping every handle without calling [`ChannelConnection::close`] also
//! tears the socket down.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::envelope::frame_preview;
use super::listeners::{self, ListenerSet};
use super::{
    Backoff, ChannelAddress, ChannelFault, CloseReason, ConnectionState, Envelope, ErrorHook,
    ListenerId, ReconnectPolicy, SendStatus,
};
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Handle to a resilient channel connection.
#[derive(Clone)]
pub struct ChannelConnection {
    shared: Arc<Shared>,
}

/// State shared between handles and the background task.
struct Shared {
    address: ChannelAddress,
    listeners: Mutex<ListenerSet>,
    state_tx: watch::Sender<ConnectionState>,
    outbound_tx: mpsc::UnboundedSender<String>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
    hook: Option<ErrorHook>,
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConnection")
            .field("address", &self.shared.address)
            .field("state", &*self.shared.state_tx.borrow())
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

impl ChannelConnection {
    /// Begin connecting to `address`.
    ///
    /// Returns immediately in [`ConnectionState::Connecting`]; observe
    /// progress with [`Self::watch_state`]. Must be called from within a
    /// tokio runtime.
    #[must_use]
    pub fn open(address: ChannelAddress, policy: ReconnectPolicy) -> Self {
        Self::open_with_hook(address, policy, None)
    }

    /// Like [`Self::open`], reporting faults to `hook` as well as the log.
    #[must_use]
    pub fn open_with_hook(
        address: ChannelAddress,
        policy: ReconnectPolicy,
        hook: Option<ErrorHook>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            address,
            listeners: Mutex::new(ListenerSet::default()),
            state_tx,
            outbound_tx,
            shutdown_tx,
            closed: AtomicBool::new(false),
            hook,
        });

        log::info!("[Channel] Opening {}", shared.address);

        tokio::spawn(run_connection_loop(
            Arc::downgrade(&shared),
            shared.address.as_str().to_string(),
            policy,
            outbound_rx,
            shutdown_rx,
        ));

        Self { shared }
    }

    /// The address this connection serves.
    #[must_use]
    pub fn address(&self) -> &ChannelAddress {
        &self.shared.address
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Whether the socket is open right now.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.state_tx.borrow().is_open()
    }

    /// Whether the connection is terminally closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same connection.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Register a listener for every inbound envelope.
    ///
    /// Listeners survive reconnects; they belong to the connection, not to
    /// any particular socket.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.shared.lock_listeners().insert(listener)
    }

    /// Unregister a listener. Returns `false` if it was not registered.
    ///
    /// Takes effect before the next delivery, including a delivery already
    /// in progress for the current envelope.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.lock_listeners().remove(id)
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.shared.lock_listeners().len()
    }

    /// Transmit `envelope` if the socket is open.
    ///
    /// Otherwise the envelope is dropped, a warning is logged and the fault
    /// is reported; nothing is queued for later.
    pub fn send(&self, envelope: &Envelope) -> SendStatus {
        if self.is_closed() {
            log::warn!(
                "[Channel] Dropping '{}' on {}: connection closed",
                envelope.kind,
                self.shared.address
            );
            return SendStatus::Closed;
        }

        let state = self.state();
        if !state.is_open() {
            self.shared.report(&ChannelFault::SendWhileDisconnected {
                address: self.shared.address.redacted(),
                state: state.label().to_string(),
                kind: envelope.kind.clone(),
            });
            return SendStatus::NotConnected;
        }

        if self.shared.outbound_tx.send(envelope.to_frame()).is_err() {
            self.shared.report(&ChannelFault::SendWhileDisconnected {
                address: self.shared.address.redacted(),
                state: "stopped".to_string(),
                kind: envelope.kind.clone(),
            });
            return SendStatus::NotConnected;
        }

        log::trace!("[Channel] Queued '{}' on {}", envelope.kind, self.shared.address);
        SendStatus::Sent
    }

    /// Close the socket and disable reconnection. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared
            .state_tx
            .send_replace(ConnectionState::Closed(CloseReason::Requested));
        self.shared.shutdown_tx.send_replace(true);
        log::info!("[Channel] Closed {}", self.shared.address);
    }
}

impl Shared {
    fn lock_listeners(&self) -> MutexGuard<'_, ListenerSet> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a non-terminal state, unless the owner already closed us.
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if self.closed.load(Ordering::Acquire) || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Enter a terminal state chosen by the loop (reconnect disabled or
    /// retries exhausted).
    fn finish(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("[Channel] {} closed for good: {}", self.address, reason);
        self.state_tx.send_replace(ConnectionState::Closed(reason));
        self.lock_listeners().clear();
    }

    fn report(&self, fault: &ChannelFault) {
        match fault {
            ChannelFault::ListenerPanicked { .. } => log::error!("[Channel] {fault}"),
            _ => log::warn!("[Channel] {fault}"),
        }
        if let Some(hook) = &self.hook {
            let hook_result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(fault)));
            if hook_result.is_err() {
                log::error!("[Channel] Error hook panicked on {}", self.address);
            }
        }
    }

    /// Parse one text frame and fan it out.
    fn handle_text(&self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.report(&ChannelFault::Protocol {
                    address: self.address.redacted(),
                    message: e.to_string(),
                    frame_preview: frame_preview(text),
                });
                return;
            }
        };

        log::trace!("[Channel] Received '{}' on {}", envelope.kind, self.address);

        // Lock released before any callback runs so listeners may add or
        // remove listeners on this connection.
        let snapshot = self.lock_listeners().snapshot();
        listeners::dispatch(&snapshot, &envelope, |listener, message| {
            self.report(&ChannelFault::ListenerPanicked {
                address: self.address.redacted(),
                listener,
                message,
            });
        });
    }

    fn handle_binary(&self, data: Vec<u8>) {
        match String::from_utf8(data) {
            Ok(text) => self.handle_text(&text),
            Err(_) => self.report(&ChannelFault::Protocol {
                address: self.address.redacted(),
                message: super::EnvelopeError::NotUtf8.to_string(),
                frame_preview: String::new(),
            }),
        }
    }

    fn report_transport(&self, message: String) {
        self.report(&ChannelFault::Transport {
            address: self.address.redacted(),
            message,
        });
    }
}

/// Result of the inner message loop.
enum LoopExit {
    /// The owner called `close()`.
    Shutdown,
    /// Every handle was dropped.
    Abandoned,
    /// The socket went away; reconnect if the policy allows.
    Disconnected(CloseReason),
}

/// Main connection loop: connect, serve, back off, repeat.
async fn run_connection_loop(
    shared: Weak<Shared>,
    url: String,
    policy: ReconnectPolicy,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(&policy);

    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        let Some(conn) = shared.upgrade() else {
            return;
        };
        conn.set_state(ConnectionState::Connecting);
        log::debug!("[Channel] Connecting to {}", conn.address);
        drop(conn);

        let connected = tokio::select! {
            result = ws::connect(&url, &[]) => result,
            _ = shutdown_rx.changed() => return,
        };

        let reason = match connected {
            Ok((mut writer, mut reader)) => {
                let Some(conn) = shared.upgrade() else {
                    return;
                };
                backoff.reset();
                conn.set_state(ConnectionState::Open);
                log::info!("[Channel] Connected to {}", conn.address);
                drop(conn);

                match run_message_loop(
                    &shared,
                    &policy,
                    &mut writer,
                    &mut reader,
                    &mut outbound_rx,
                    &mut shutdown_rx,
                )
                .await
                {
                    LoopExit::Shutdown => {
                        let _ = writer.send_close().await;
                        return;
                    }
                    LoopExit::Abandoned => return,
                    LoopExit::Disconnected(reason) => reason,
                }
            }
            Err(e) => {
                let message = format!("{e:#}");
                if let Some(conn) = shared.upgrade() {
                    conn.report_transport(message.clone());
                }
                CloseReason::ConnectFailed(message)
            }
        };

        let Some(conn) = shared.upgrade() else {
            return;
        };

        // Sends accepted while the socket was open but never written are
        // lost with it.
        let mut dropped = 0_usize;
        while outbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            log::warn!(
                "[Channel] Discarded {} unsent frame(s) for {}",
                dropped,
                conn.address
            );
        }

        if !policy.reconnect {
            conn.finish(reason);
            return;
        }

        conn.set_state(ConnectionState::Closed(reason.clone()));

        let Some(delay) = backoff.next_delay() else {
            log::warn!(
                "[Channel] Giving up on {} after {} attempt(s): {}",
                conn.address,
                backoff.attempts(),
                reason
            );
            conn.finish(CloseReason::RetriesExhausted);
            return;
        };

        log::info!(
            "[Channel] {} {}, reconnecting in {}ms (attempt {})",
            conn.address,
            reason,
            delay.as_millis(),
            backoff.attempts()
        );
        conn.set_state(ConnectionState::Reconnecting {
            attempt: backoff.attempts(),
            delay,
        });
        drop(conn);

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => return,
        }
    }
}

/// Serve one open socket until it drops or the owner closes the connection.
async fn run_message_loop(
    shared: &Weak<Shared>,
    policy: &ReconnectPolicy,
    writer: &mut WsWriter,
    reader: &mut WsReader,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> LoopExit {
    // Without a heartbeat the ticker branch is disabled; the period only
    // needs to be non-zero.
    let heartbeat = policy.effective_heartbeat();
    let period = heartbeat.unwrap_or(super::MAX_HEARTBEAT);
    let now = Instant::now();
    let mut ticker = tokio::time::interval_at(now.checked_add(period).unwrap_or(now), period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            frame = reader.recv() => {
                let Some(conn) = shared.upgrade() else {
                    return LoopExit::Abandoned;
                };
                last_inbound = Instant::now();
                match frame {
                    Some(Ok(WsMessage::Text(text))) => conn.handle_text(&text),
                    Some(Ok(WsMessage::Binary(data))) => conn.handle_binary(data),
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                        // Pings are auto-replied by tungstenite
                    }
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        log::info!("[Channel] {} closed by server ({})", conn.address, code);
                        return LoopExit::Disconnected(CloseReason::ServerClosed { code, reason });
                    }
                    Some(Err(e)) => {
                        let message = format!("{e:#}");
                        conn.report_transport(message.clone());
                        return LoopExit::Disconnected(CloseReason::TransportError(message));
                    }
                    None => {
                        log::info!("[Channel] {} stream ended", conn.address);
                        return LoopExit::Disconnected(CloseReason::ServerClosed {
                            code: 1006,
                            reason: "stream ended".to_string(),
                        });
                    }
                }
            }

            Some(frame) = outbound_rx.recv() => {
                if let Err(e) = writer.send_text(&frame).await {
                    let message = format!("{e:#}");
                    if let Some(conn) = shared.upgrade() {
                        conn.report_transport(message.clone());
                    }
                    return LoopExit::Disconnected(CloseReason::TransportError(message));
                }
            }

            _ = ticker.tick(), if heartbeat.is_some() => {
                if last_inbound.elapsed() >= period.saturating_mul(2) {
                    if let Some(conn) = shared.upgrade() {
                        log::warn!(
                            "[Channel] No traffic on {} for {}ms, treating as stalled",
                            conn.address,
                            last_inbound.elapsed().as_millis()
                        );
                    }
                    return LoopExit::Disconnected(CloseReason::Stalled);
                }
                if let Err(e) = writer.send_ping(Vec::new()).await {
                    let message = format!("{e:#}");
                    if let Some(conn) = shared.upgrade() {
                        conn.report_transport(message.clone());
                    }
                    return LoopExit::Disconnected(CloseReason::TransportError(message));
                }
            }

            changed = shutdown_rx.changed() => {
                return if changed.is_ok() {
                    LoopExit::Shutdown
                } else {
                    LoopExit::Abandoned
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> ChannelAddress {
        // Port 1 is never listening; connects fail fast.
        ChannelAddress::parse("ws://127.0.0.1:1/ws/test/").unwrap()
    }

    #[tokio::test]
    async fn test_open_starts_connecting() {
        let conn = ChannelConnection::open(address(), ReconnectPolicy::default());
        assert!(matches!(
            conn.state(),
            ConnectionState::Connecting | ConnectionState::Closed(_) | ConnectionState::Reconnecting { .. }
        ));
        assert!(!conn.is_closed());
        conn.close();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminal() {
        let conn = ChannelConnection::open(address(), ReconnectPolicy::default());
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(conn.state(), ConnectionState::Closed(CloseReason::Requested));
    }

    #[tokio::test]
    async fn test_send_while_not_open_is_dropped() {
        let conn = ChannelConnection::open(address(), ReconnectPolicy::default());
        let status = conn.send(&Envelope::new("chat_message"));
        assert_eq!(status, SendStatus::NotConnected);
        conn.close();
        assert_eq!(conn.send(&Envelope::new("chat_message")), SendStatus::Closed);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_reaches_hook() {
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&faults);
        let hook: ErrorHook = Arc::new(move |fault: &ChannelFault| {
            sink.lock().unwrap().push(fault.clone());
        });
        let conn = ChannelConnection::open_with_hook(
            address(),
            ReconnectPolicy::no_reconnect(),
            Some(hook),
        );
        conn.send(&Envelope::new("chat_message"));
        conn.close();

        let faults = faults.lock().unwrap();
        assert!(faults.iter().any(|f| matches!(
            f,
            ChannelFault::SendWhileDisconnected { kind, .. } if kind == "chat_message"
        )));
    }

    #[tokio::test]
    async fn test_listener_add_remove() {
        let conn = ChannelConnection::open(address(), ReconnectPolicy::default());
        let a = conn.add_listener(|_| {});
        let b = conn.add_listener(|_| {});
        assert_eq!(conn.listener_count(), 2);
        assert!(conn.remove_listener(a));
        assert!(!conn.remove_listener(a));
        assert_eq!(conn.listener_count(), 1);
        assert!(conn.remove_listener(b));
        conn.close();
    }

    #[tokio::test]
    async fn test_clones_share_identity() {
        let conn = ChannelConnection::open(address(), ReconnectPolicy::default());
        let other = ChannelConnection::open(address(), ReconnectPolicy::default());
        assert!(conn.ptr_eq(&conn.clone()));
        assert!(!conn.ptr_eq(&other));
        conn.close();
        other.close();
    }

    #[tokio::test]
    async fn test_connect_failure_without_reconnect_is_terminal() {
        let conn = ChannelConnection::open(address(), ReconnectPolicy::no_reconnect());
        let mut states = conn.watch_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| matches!(s, ConnectionState::Closed(CloseReason::ConnectFailed(_)))),
        )
        .await
        .expect("connect should fail")
        .unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_terminal() {
        let policy = ReconnectPolicy::with_base_delay(Duration::from_millis(50)).max_attempts(2);
        let conn = ChannelConnection::open(address(), policy);
        let mut states = conn.watch_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == ConnectionState::Closed(CloseReason::RetriesExhausted)),
        )
        .await
        .expect("should give up")
        .unwrap();
        assert!(conn.is_closed());
    }

    #[test]
    fn test_protocol_fault_for_garbage_frame() {
        let (state_tx, _) = watch::channel(ConnectionState::Open);
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&faults);
        let shared = Shared {
            address: address(),
            listeners: Mutex::new(ListenerSet::default()),
            state_tx,
            outbound_tx,
            shutdown_tx,
            closed: AtomicBool::new(false),
            hook: Some(Arc::new(move |f: &ChannelFault| sink.lock().unwrap().push(f.clone()))),
        };
        let received = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&received);
        shared
            .lock_listeners()
            .insert(move |env: &Envelope| seen.lock().unwrap().push(env.kind.clone()));

        shared.handle_text("not json");
        shared.handle_text(r#"{"type":"ok"}"#);
        shared.handle_binary(vec![0xff, 0xfe]);

        assert_eq!(*received.lock().unwrap(), vec!["ok"]);
        let faults = faults.lock().unwrap();
        assert_eq!(faults.len(), 2);
        assert!(faults
            .iter()
            .all(|f| matches!(f, ChannelFault::Protocol { .. })));
    }
}
