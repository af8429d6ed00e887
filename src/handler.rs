//! TCP connection handler
//!
//! Handles one accepted connection: greets it, reads newline-delimited
//! messages and hands each one to the router, and runs a writer task that
//! owns the socket's write half so a slow peer only ever stalls itself.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::ServerError;
use crate::message::{read_line, Message};
use crate::router::Router;
use crate::server::wait_for_stop;
use crate::session::{Peer, SessionId};

/// Greeting sent on every accepted connection
pub const WELCOME: &str = "Welcome to the chat server!";

/// Handle a new TCP connection
///
/// Fails only if the socket is already unusable (no peer address); the
/// session itself is run by [`serve`].
pub async fn handle_connection(
    stream: TcpStream,
    router: Router,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let peer_addr = stream.peer_addr()?;
    let (reader, writer) = stream.into_split();

    serve(reader, writer, peer_addr.to_string(), router, shutdown).await;
    Ok(())
}

/// Run one session over an already split stream
///
/// Runs until the peer closes the stream, a read or write fails, or
/// `shutdown` flips to `true`. On exit the connection's registry entry is
/// removed and, if there was one, the user list is re-broadcast.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    origin: String,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let session_id = SessionId::new();
    info!("Session {} connected from {}", session_id, origin);

    // Channel for router -> client messages
    let (msg_tx, msg_rx) = mpsc::unbounded_channel::<Message>();
    let peer = Peer::new(session_id, msg_tx);
    let mut write_task = tokio::spawn(write_loop(writer, msg_rx, session_id));

    // Not joined yet, so these go to this connection only
    let _ = peer.send(Message::system(WELCOME));
    let _ = peer.send(Message::user_list(&router.registry().usernames()));

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut writer_done = false;

    loop {
        tokio::select! {
            line = read_line(&mut reader, &mut buf) => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let message = Message::decode(&line);
                    debug!("Session {} sent {}", session_id, message.kind);
                    router.dispatch(&peer, message);
                }
                Ok(None) => {
                    debug!("Session {} closed the stream", session_id);
                    break;
                }
                Err(e) => {
                    warn!("Read error for session {}: {}", session_id, e);
                    break;
                }
            },
            _ = &mut write_task, if !writer_done => {
                debug!("Writer ended for session {}", session_id);
                writer_done = true;
                break;
            }
            _ = wait_for_stop(&mut shutdown) => {
                debug!("Shutdown closing session {}", session_id);
                break;
            }
        }
    }

    if let Some(session) = router.registry().remove(session_id) {
        info!("Session {} ('{}') removed", session_id, session.username);
        router.broadcast_user_list();
    }

    // Dropping the write half along with the read half closes the socket
    drop(peer);
    if !writer_done {
        write_task.abort();
    }

    info!("Session {} disconnected", session_id);
}

/// Write queued messages to the socket, one line each
async fn write_loop<W>(
    mut writer: W,
    mut msg_rx: mpsc::UnboundedReceiver<Message>,
    session_id: SessionId,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = msg_rx.recv().await {
        match msg.encode() {
            Ok(mut line) => {
                line.push('\n');
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    debug!("Write failed for session {}: {}", session_id, e);
                    break;
                }
            }
            Err(e) => {
                error!("Failed to serialize message: {}", e);
                // Continue - don't break on serialization errors
            }
        }
    }
    debug!("Write task ended for session {}", session_id);

    let _ = writer.shutdown().await;
}
