//! Client connection manager
//!
//! Owns one TCP connection to the chat server. Writes are serialized
//! through a single write half; a background receive loop decodes each
//! inbound line and reports it, along with status changes and errors, as
//! [`ConnectionEvent`]s on a channel the caller drains.
//!
//! # State machine
//! `Disconnected -> Connecting -> Connected -> Disconnected`. Leaving
//! `Connected` (explicit disconnect, remote close, read failure) always
//! emits exactly one `StatusChanged(false)`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::message::{read_line, Message, MessageKind};

/// Client connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Observable connection events
///
/// Raised from whichever task detects them; marshaling to a UI thread is
/// the consumer's job.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A line from the server, decoded
    MessageReceived(Message),
    /// `true` once established, `false` when the connection ends
    StatusChanged(bool),
    /// Human-readable failure description
    ErrorOccurred(String),
}

#[derive(Debug)]
struct Status {
    state: ConnectionState,
    /// Bumped on every connect attempt and disconnect so a stale receive
    /// loop cannot tear down a newer connection
    epoch: u64,
    cancel: Option<oneshot::Sender<()>>,
}

#[derive(Debug)]
struct Inner {
    status: Mutex<Status>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Inner {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ConnectionEvent) {
        // Nobody listening is not an error
        let _ = self.events.send(event);
    }

    /// `Connected -> Disconnected` for the connection started at `epoch`
    fn mark_disconnected(&self, epoch: u64) -> bool {
        let mut status = self.status();
        if status.epoch != epoch || status.state != ConnectionState::Connected {
            return false;
        }
        status.state = ConnectionState::Disconnected;
        status.cancel = None;
        true
    }
}

/// Connection to a chat server
///
/// Cloning shares the same connection.
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a disconnected connection and the receiver for its events
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            status: Mutex::new(Status {
                state: ConnectionState::Disconnected,
                epoch: 0,
                cancel: None,
            }),
            writer: tokio::sync::Mutex::new(None),
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.inner.status().state
    }

    /// Check if the connection is established
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect to `host:port` and start the receive loop
    ///
    /// # Errors
    /// `Connect` if the transport cannot be established (an
    /// `ErrorOccurred` event is raised too), `AlreadyConnected` unless the
    /// state is `Disconnected`, `Cancelled` if `disconnect` ran meanwhile.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), ClientError> {
        let epoch = {
            let mut status = self.inner.status();
            if status.state != ConnectionState::Disconnected {
                return Err(ClientError::AlreadyConnected);
            }
            status.state = ConnectionState::Connecting;
            status.epoch += 1;
            status.epoch
        };

        let addr = format!("{}:{}", host, port);
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(source) => {
                {
                    let mut status = self.inner.status();
                    if status.epoch == epoch {
                        status.state = ConnectionState::Disconnected;
                    }
                }
                warn!("Failed to connect to {}: {}", addr, source);
                self.inner
                    .emit(ConnectionEvent::ErrorOccurred(format!("Failed to connect: {}", source)));
                return Err(ClientError::Connect { addr, source });
            }
        };

        let (reader, writer) = stream.into_split();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        // Holding the writer slot while flipping the state keeps a racing
        // disconnect from observing Connected without a writer to release.
        let mut slot = self.inner.writer.lock().await;
        {
            let mut status = self.inner.status();
            if status.epoch != epoch {
                debug!("Connect to {} cancelled", addr);
                return Err(ClientError::Cancelled);
            }
            status.state = ConnectionState::Connected;
            status.cancel = Some(cancel_tx);
        }
        *slot = Some(writer);
        drop(slot);

        info!("Connected to {}", addr);
        self.inner.emit(ConnectionEvent::StatusChanged(true));

        tokio::spawn(receive_loop(self.inner.clone(), reader, epoch, cancel_rx));
        Ok(())
    }

    /// Send one message
    ///
    /// # Errors
    /// `NotConnected` unless the state is `Connected`. A transport failure
    /// raises `ErrorOccurred` and is returned as `Io`.
    pub async fn send(&self, message: &Message) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let mut line = message.encode()?;
        line.push('\n');

        let mut slot = self.inner.writer.lock().await;
        let writer = slot.as_mut().ok_or(ClientError::NotConnected)?;

        if let Err(e) = writer.write_all(line.as_bytes()).await {
            self.inner
                .emit(ConnectionEvent::ErrorOccurred(format!("Failed to send message: {}", e)));
            return Err(ClientError::Io(e));
        }
        Ok(())
    }

    /// Send a chat message to everyone
    pub async fn send_broadcast(&self, from: &str, body: &str) -> Result<(), ClientError> {
        self.send(&Message::chat(from, body)).await
    }

    /// Send a private message to `to`
    pub async fn send_private(&self, from: &str, to: &str, body: &str) -> Result<(), ClientError> {
        self.send(&Message::private(from, to, body)).await
    }

    /// Announce `username` to the server
    pub async fn join(&self, username: &str) -> Result<(), ClientError> {
        self.send(&Message::join(username)).await
    }

    /// Announce departure; call before [`disconnect`](Self::disconnect)
    pub async fn leave(&self, username: &str) -> Result<(), ClientError> {
        self.send(&Message::leave(username)).await
    }

    /// Ask the server for the current user list
    pub async fn request_user_list(&self, username: &str) -> Result<(), ClientError> {
        self.send(&Message::new(MessageKind::UserList, username, "", ""))
            .await
    }

    /// Close the connection
    ///
    /// Idempotent. Stops the receive loop, releases the socket and emits
    /// `StatusChanged(false)` unless already disconnected.
    pub async fn disconnect(&self) {
        let (previous, cancel) = {
            let mut status = self.inner.status();
            let previous = status.state;
            status.state = ConnectionState::Disconnected;
            status.epoch += 1;
            (previous, status.cancel.take())
        };

        if let Some(cancel) = cancel {
            let _ = cancel.send(());
        }

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Error shutting down writer: {}", e);
            }
        }

        if previous != ConnectionState::Disconnected {
            info!("Disconnected");
            self.inner.emit(ConnectionEvent::StatusChanged(false));
        }
    }
}

/// Read lines until cancelled, closed, or failed
async fn receive_loop(
    inner: Arc<Inner>,
    reader: OwnedReadHalf,
    epoch: u64,
    mut cancel: oneshot::Receiver<()>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    let failure = loop {
        tokio::select! {
            biased;
            _ = &mut cancel => {
                debug!("Receive loop cancelled");
                return;
            }
            line = read_line(&mut reader, &mut buf) => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    inner.emit(ConnectionEvent::MessageReceived(Message::decode(&line)));
                }
                Ok(None) => break None,
                Err(e) => break Some(e),
            },
        }
    };

    let mut slot = inner.writer.lock().await;
    if !inner.mark_disconnected(epoch) {
        return;
    }
    slot.take();
    drop(slot);

    match failure {
        Some(e) => {
            warn!("Connection error: {}", e);
            inner.emit(ConnectionEvent::ErrorOccurred(format!("Connection error: {}", e)));
        }
        None => info!("Server closed the connection"),
    }
    inner.emit(ConnectionEvent::StatusChanged(false));
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncReadExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_send_while_disconnected() {
        let (conn, _events) = Connection::new();
        let result = conn.send_broadcast("alice", "hi").await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error() {
        let (listener, port) = listener().await;
        drop(listener);

        let (conn, mut events) = Connection::new();
        let result = conn.connect("127.0.0.1", port).await;

        assert!(matches!(result, Err(ClientError::Connect { .. })));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        match next_event(&mut events).await {
            ConnectionEvent::ErrorOccurred(e) => assert!(e.starts_with("Failed to connect")),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_receive_and_remote_close() {
        let (listener, port) = listener().await;
        let (conn, mut events) = Connection::new();

        conn.connect("127.0.0.1", port).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::StatusChanged(true));
        assert!(conn.is_connected());

        server
            .write_all(b"{\"type\":\"system\",\"body\":\"hello\"}\n\n not json\n")
            .await
            .unwrap();

        match next_event(&mut events).await {
            ConnectionEvent::MessageReceived(m) => assert_eq!(m.body, "hello"),
            other => panic!("unexpected event: {:?}", other),
        }
        match next_event(&mut events).await {
            ConnectionEvent::MessageReceived(m) => {
                assert_eq!(m.kind, MessageKind::System);
                assert_eq!(m.body, "Raw message:  not json");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        drop(server);
        assert_eq!(next_event(&mut events).await, ConnectionEvent::StatusChanged(false));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(matches!(
            conn.send_broadcast("alice", "late").await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_keeps_connection() {
        let (listener, port) = listener().await;
        let (conn, mut events) = Connection::new();

        conn.connect("127.0.0.1", port).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::StatusChanged(true));

        server.write_all(b"\xff\xfe\n").await.unwrap();
        server
            .write_all(b"{\"type\":\"chat\",\"from\":\"bob\",\"body\":\"still here\"}\n")
            .await
            .unwrap();

        match next_event(&mut events).await {
            ConnectionEvent::MessageReceived(m) => {
                assert_eq!(m.kind, MessageKind::System);
                assert!(m.body.starts_with("Raw message:"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match next_event(&mut events).await {
            ConnectionEvent::MessageReceived(m) => assert_eq!(m.body, "still here"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(conn.is_connected());

        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_send_writes_one_line() {
        let (listener, port) = listener().await;
        let (conn, _events) = Connection::new();

        conn.connect("127.0.0.1", port).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(server).lines();

        conn.send_private("alice", "bob", "psst").await.unwrap();

        let line = timeout(WAIT, lines.next_line()).await.unwrap().unwrap().unwrap();
        let msg = Message::decode(&line);
        assert_eq!(msg.kind, MessageKind::Private);
        assert_eq!(msg.from, "alice");
        assert_eq!(msg.to, "bob");
        assert_eq!(msg.body, "psst");

        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (listener, port) = listener().await;
        let (conn, mut events) = Connection::new();

        conn.connect("127.0.0.1", port).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::StatusChanged(true));

        conn.disconnect().await;
        conn.disconnect().await;

        assert_eq!(next_event(&mut events).await, ConnectionEvent::StatusChanged(false));
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        // Server side sees the stream end
        let mut buf = Vec::new();
        let n = timeout(WAIT, server.read_to_end(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);

        // No second status change from either disconnect or the receive loop
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_twice_rejected() {
        let (listener, port) = listener().await;
        let (conn, _events) = Connection::new();

        conn.connect("127.0.0.1", port).await.unwrap();
        let _server = listener.accept().await.unwrap();

        assert!(matches!(
            conn.connect("127.0.0.1", port).await,
            Err(ClientError::AlreadyConnected)
        ));
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let (listener, port) = listener().await;
        let (conn, mut events) = Connection::new();

        conn.connect("127.0.0.1", port).await.unwrap();
        let _first = listener.accept().await.unwrap();
        conn.disconnect().await;

        conn.connect("127.0.0.1", port).await.unwrap();
        let (mut second, _) = listener.accept().await.unwrap();
        second.write_all(b"{\"type\":\"chat\",\"from\":\"bob\",\"body\":\"again\"}\n").await.unwrap();

        assert_eq!(next_event(&mut events).await, ConnectionEvent::StatusChanged(true));
        assert_eq!(next_event(&mut events).await, ConnectionEvent::StatusChanged(false));
        assert_eq!(next_event(&mut events).await, ConnectionEvent::StatusChanged(true));
        match next_event(&mut events).await {
            ConnectionEvent::MessageReceived(m) => assert_eq!(m.body, "again"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(conn.is_connected());
        conn.disconnect().await;
    }
}
