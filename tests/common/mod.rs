//! Shared helpers for integration tests: an in-process WebSocket server
//! and small waiting utilities.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use channelmux::{ChannelAddress, ConnectionState};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
enum Command {
    Text(String),
    Close,
}

/// Local WebSocket server on `127.0.0.1:0`.
///
/// Every accepted socket receives the frames pushed with [`Self::push`]
/// and reports its inbound text frames to [`Self::next_inbound`].
pub struct TestServer {
    addr: SocketAddr,
    commands: broadcast::Sender<Command>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    accepted: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    paths: Arc<Mutex<Vec<String>>>,
    accepted_at: Arc<Mutex<Vec<Instant>>>,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (commands, _) = broadcast::channel(256);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let paths = Arc::new(Mutex::new(Vec::new()));
        let accepted_at = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn({
            let commands = commands.clone();
            let accepted = Arc::clone(&accepted);
            let active = Arc::clone(&active);
            let paths = Arc::clone(&paths);
            let accepted_at = Arc::clone(&accepted_at);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    // Subscribe before the handshake so nothing pushed after
                    // the client sees `Open` is missed.
                    let mut rx = commands.subscribe();
                    let inbound_tx = inbound_tx.clone();
                    let accepted = Arc::clone(&accepted);
                    let active = Arc::clone(&active);
                    let paths = Arc::clone(&paths);
                    let accepted_at = Arc::clone(&accepted_at);

                    tokio::spawn(async move {
                        let path_sink = Arc::clone(&paths);
                        let callback = move |req: &Request, resp: Response| {
                            path_sink.lock().unwrap().push(req.uri().to_string());
                            Ok::<_, ErrorResponse>(resp)
                        };
                        let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                        else {
                            return;
                        };
                        accepted_at.lock().unwrap().push(Instant::now());
                        accepted.fetch_add(1, Ordering::SeqCst);
                        active.fetch_add(1, Ordering::SeqCst);

                        let (mut sink, mut stream) = ws.split();
                        loop {
                            tokio::select! {
                                frame = stream.next() => match frame {
                                    Some(Ok(Message::Text(text))) => {
                                        let _ = inbound_tx.send(text.to_string());
                                    }
                                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                    Some(Ok(_)) => {}
                                },
                                command = rx.recv() => match command {
                                    Ok(Command::Text(text)) => {
                                        if sink.send(Message::Text(text)).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(Command::Close) => {
                                        let _ = sink
                                            .send(Message::Close(Some(CloseFrame {
                                                code: CloseCode::Away,
                                                reason: "going away".into(),
                                            })))
                                            .await;
                                        break;
                                    }
                                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                                    Err(broadcast::error::RecvError::Closed) => break,
                                },
                            }
                        }
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        });

        Self {
            addr,
            commands,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            accepted,
            active,
            paths,
            accepted_at,
            task,
        }
    }

    /// `ws://127.0.0.1:port` without a path.
    pub fn base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Address of `path` on this server.
    pub fn address(&self, path: &str) -> ChannelAddress {
        ChannelAddress::parse(&format!("{}{}", self.base_url(), path)).unwrap()
    }

    /// Push a text frame to every connected client.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.commands.send(Command::Text(text.into()));
    }

    /// Push a JSON value to every connected client.
    pub fn push_json(&self, value: &Value) {
        self.push(value.to_string());
    }

    /// Close every connected client with code 1001.
    pub fn close_clients(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Next text frame any client sent, parsed as JSON.
    pub async fn next_inbound(&self) -> Value {
        let mut inbound = self.inbound.lock().await;
        let text = tokio::time::timeout(WAIT, inbound.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("server stopped");
        serde_json::from_str(&text).unwrap()
    }

    /// Total handshakes completed.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Sockets currently open.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Request paths in accept order.
    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }

    /// Handshake completion times in accept order.
    pub fn accepted_at(&self) -> Vec<Instant> {
        self.accepted_at.lock().unwrap().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Poll `condition` every 10ms until it holds or [`WAIT`] passes.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the watched state satisfies `pred`.
pub async fn wait_for_state(
    states: &mut watch::Receiver<ConnectionState>,
    pred: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    tokio::time::timeout(WAIT, async {
        loop {
            {
                let current = states.borrow_and_update();
                if pred(&current) {
                    return current.clone();
                }
            }
            states.changed().await.expect("connection dropped");
        }
    })
    .await
    .expect("timed out waiting for connection state")
}

/// Initialize logging once per test binary.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
