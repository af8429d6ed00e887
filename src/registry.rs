//! Session registry
//!
//! The only state shared between connection tasks. Every operation takes
//! the single lock for its own duration and releases it before returning,
//! so no caller ever holds it across network I/O. Broadcasts iterate a
//! [`Registry::snapshot`] taken under the lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::session::{Session, SessionId};

/// Joined sessions in join order
///
/// Cloning shares the same underlying set.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    sessions: Arc<Mutex<Vec<Session>>>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Session>> {
        // No operation can leave the list half-updated, so a poisoned lock is still usable.
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a session
    ///
    /// Usernames are not checked for uniqueness. A second join on the same
    /// connection replaces that connection's entry in place.
    pub fn add(&self, session: Session) {
        let mut sessions = self.lock();
        match sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session,
            None => sessions.push(session),
        }
        debug!("Registry size: {}", sessions.len());
    }

    /// Remove the entry for this connection, if any
    ///
    /// Removal is by connection id, so another live session with the same
    /// username is left alone.
    pub fn remove(&self, id: SessionId) -> Option<Session> {
        let mut sessions = self.lock();
        let index = sessions.iter().position(|s| s.id == id)?;
        Some(sessions.remove(index))
    }

    /// Point-in-time copy of all entries
    pub fn snapshot(&self) -> Vec<Session> {
        self.lock().clone()
    }

    /// Usernames in join order
    pub fn usernames(&self) -> Vec<String> {
        self.lock().iter().map(|s| s.username.clone()).collect()
    }

    /// Most recently joined session with this username
    pub fn find(&self, username: &str) -> Option<Session> {
        self.lock().iter().rev().find(|s| s.username == username).cloned()
    }

    /// Check if this connection has joined
    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().iter().any(|s| s.id == id)
    }

    /// Remove every entry, returning what was registered
    pub fn clear(&self) -> Vec<Session> {
        std::mem::take(&mut *self.lock())
    }

    /// Number of joined sessions
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if no session has joined
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
