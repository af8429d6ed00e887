//! Line-oriented TCP Chat Library
//!
//! A small real-time chat platform: a server that tracks joined clients
//! and routes broadcast and private messages among them, plus a client
//! connection manager speaking the same protocol.
//!
//! # Protocol
//! Plain UTF-8 text over TCP, one JSON-encoded [`Message`] per line:
//! `{"type":"chat","from":"alice","to":"","body":"hi","timestamp":"..."}`.
//! Malformed lines decode to a `system` message carrying the raw text.
//!
//! # Architecture
//! - `ChatServer` accepts connections and spawns a `handler` task per socket
//! - Each handler owns its socket; a writer task drains an outbound channel
//! - `Router` decides the fan-out for each inbound message
//! - `Registry` is the only shared state, behind one lock that is never
//!   held across network I/O
//! - `Connection` is the client side: connect, send, receive loop, disconnect
//!
//! # Example
//! ```ignore
//! use tcp_chat::{ChatServer, Connection, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = ChatServer::bind(&ServerConfig::default()).await?;
//!     tokio::spawn(server.run());
//!
//!     let (conn, mut events) = Connection::new();
//!     conn.connect("127.0.0.1", 8888).await?;
//!     conn.join("alice").await?;
//!     conn.send_broadcast("alice", "hello").await?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod message;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;

// Re-export main types for convenience
pub use config::{ServerConfig, DEFAULT_PORT};
pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use error::{ClientError, SendError, ServerError};
pub use handler::handle_connection;
pub use message::{Message, MessageKind};
pub use registry::Registry;
pub use router::Router;
pub use server::{ChatServer, ShutdownHandle};
pub use session::{Peer, Session, SessionId};
