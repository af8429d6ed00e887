//! Server-side connection handles
//!
//! A [`Peer`] exists from socket accept onward and can only be replied to.
//! Processing a join turns it into a [`Session`], the registry entry that
//! binds a username to the connection's outbound channel.

use std::fmt;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::SendError;
use crate::message::Message;

/// Identity of one accepted connection
///
/// Minted at accept time, before any username is known. Registry removal
/// goes through this id, so a stale session sharing a username with a
/// live one can never take the live one down with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Random (v4) id for a freshly accepted connection
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    /// Short `#1a2b3c4d` form, enough to tell sessions apart in logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        write!(f, "#{}", &simple[..8])
    }
}

/// Outbound path of one accepted connection
///
/// Messages pushed here are written to the socket, in order, by that
/// connection's writer task.
pub type Outbound = mpsc::UnboundedSender<Message>;

/// Accepted connection, joined or not
#[derive(Debug, Clone)]
pub struct Peer {
    /// Connection identity
    pub id: SessionId,
    sender: Outbound,
}

impl Peer {
    /// Create a peer handle around the connection's outbound channel
    pub fn new(id: SessionId, sender: Outbound) -> Self {
        Self { id, sender }
    }

    /// Queue a message for this connection
    pub fn send(&self, msg: Message) -> Result<(), SendError> {
        self.sender.send(msg).map_err(|_| SendError::ChannelClosed)
    }

    /// Registry entry for this connection under `username`
    pub fn join(&self, username: impl Into<String>) -> Session {
        Session::new(self.id, username, self.sender.clone())
    }
}

/// Joined client: identity plus outbound channel
#[derive(Debug, Clone)]
pub struct Session {
    /// Connection identity, used for removal
    pub id: SessionId,
    /// Claimed username (not verified)
    pub username: String,
    sender: Outbound,
}

impl Session {
    /// Create a new session entry
    pub fn new(id: SessionId, username: impl Into<String>, sender: Outbound) -> Self {
        Self {
            id,
            username: username.into(),
            sender,
        }
    }

    /// Queue a message for this session
    ///
    /// Returns an error if the channel is closed (writer gone).
    pub fn send(&self, msg: Message) -> Result<(), SendError> {
        self.sender.send(msg).map_err(|_| SendError::ChannelClosed)
    }
}
