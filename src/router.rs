//! Message router
//!
//! Decides the fan-out for each decoded inbound message and owns the
//! user-list change notification. Delivery walks a registry snapshot, so a
//! failed recipient is logged and skipped without holding the registry
//! lock or stopping delivery to anyone else.

use tracing::{debug, info, warn};

use crate::message::{Message, MessageKind};
use crate::registry::Registry;
use crate::session::{Peer, Session};

/// Routes messages between registered sessions
#[derive(Debug, Clone, Default)]
pub struct Router {
    registry: Registry,
}

impl Router {
    /// Create a router over the given registry
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// The registry this router delivers to
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Process one message received on `origin`'s connection
    pub fn dispatch(&self, origin: &Peer, message: Message) {
        match &message.kind {
            kind if kind.is_join() => self.handle_join(origin, &message.from),
            kind if kind.is_leave() => self.handle_leave(origin, &message.from),
            kind if kind.is_broadcast() => {
                self.broadcast(&message);
            }
            MessageKind::Private => {
                self.send_private(&message);
            }
            MessageKind::UserList => self.reply_user_list(origin),
            _ => self.reply_ack(origin, &message.body),
        }
    }

    /// Register the connection under `username` and announce it
    fn handle_join(&self, origin: &Peer, username: &str) {
        info!("Session {} joined as '{}'", origin.id, username);
        if let Some(holder) = self.registry.find(username) {
            if holder.id != origin.id {
                warn!(
                    "Username '{}' is already held by session {}, keeping both",
                    username, holder.id
                );
            }
        }
        self.registry.add(origin.join(username));
        self.broadcast(&Message::system(format!("{} joined the chat", username)));
        self.broadcast_user_list();
    }

    /// Deregister the connection and announce the departure
    fn handle_leave(&self, origin: &Peer, username: &str) {
        info!("Session {} ('{}') left", origin.id, username);
        self.registry.remove(origin.id);
        self.broadcast(&Message::system(format!("{} left the chat", username)));
        self.broadcast_user_list();
    }

    /// Answer a user-list request to the requester only
    fn reply_user_list(&self, origin: &Peer) {
        let list = Message::user_list(&self.registry.usernames());
        if origin.send(list).is_err() {
            debug!("Session {} closed before user list reply", origin.id);
        }
    }

    /// Acknowledge an unrecognized message to its sender only
    fn reply_ack(&self, origin: &Peer, body: &str) {
        let ack = Message::system(format!("Received: {}", body));
        if origin.send(ack).is_err() {
            debug!("Session {} closed before acknowledgment", origin.id);
        }
    }

    /// Deliver to every registered session, including the sender
    ///
    /// Returns the number of sessions the message was queued for.
    pub fn broadcast(&self, message: &Message) -> usize {
        self.deliver(message, |_| true)
    }

    /// Deliver to sessions named `to` or `from`
    ///
    /// The sender gets a copy for its own transcript.
    pub fn send_private(&self, message: &Message) -> usize {
        self.deliver(message, |s| s.username == message.to || s.username == message.from)
    }

    /// Broadcast the current usernames
    pub fn broadcast_user_list(&self) -> usize {
        self.broadcast(&Message::user_list(&self.registry.usernames()))
    }

    fn deliver(&self, message: &Message, mut wanted: impl FnMut(&Session) -> bool) -> usize {
        let mut delivered = 0;
        for session in self.registry.snapshot() {
            if !wanted(&session) {
                continue;
            }
            match session.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    "Failed to deliver {} to '{}' ({}): {}",
                    message.kind, session.username, session.id, e
                ),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::session::SessionId;

    struct TestPeer {
        peer: Peer,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    impl TestPeer {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                peer: Peer::new(SessionId::new(), tx),
                rx,
            }
        }

        fn drain(&mut self) -> Vec<Message> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    fn joined(router: &Router, name: &str) -> TestPeer {
        let mut p = TestPeer::new();
        router.dispatch(&p.peer, Message::join(name));
        p.drain();
        p
    }

    #[test]
    fn test_join_announces_then_lists() {
        let router = Router::default();
        let mut alice = TestPeer::new();

        router.dispatch(
            &alice.peer,
            Message::decode(r#"{"type":"join","from":"alice"}"#),
        );

        let got = alice.drain();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].kind, MessageKind::System);
        assert_eq!(got[0].body, "alice joined the chat");
        assert_eq!(got[1].kind, MessageKind::UserList);
        assert_eq!(got[1].body, r#"["alice"]"#);
        assert!(router.registry().contains(alice.peer.id));
    }

    #[test]
    fn test_chat_reaches_everyone_including_sender() {
        let router = Router::default();
        let mut peers: Vec<TestPeer> = ["a", "b", "c"].iter().map(|n| joined(&router, n)).collect();
        for p in peers.iter_mut() {
            p.drain();
        }

        router.dispatch(&peers[0].peer, Message::chat("a", "hello"));

        for p in peers.iter_mut() {
            let got = p.drain();
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].kind, MessageKind::Chat);
            assert_eq!(got[0].from, "a");
            assert_eq!(got[0].body, "hello");
        }
    }

    #[test]
    fn test_private_reaches_only_sender_and_recipient() {
        let router = Router::default();
        let mut a = joined(&router, "a");
        let mut b = joined(&router, "b");
        let mut c = joined(&router, "c");
        a.drain();
        b.drain();

        router.dispatch(&a.peer, Message::private("a", "b", "psst"));

        assert_eq!(a.drain().len(), 1);
        let to_b = b.drain();
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0].body, "psst");
        assert!(c.drain().is_empty());
    }

    #[test]
    fn test_leave_removes_and_updates_list() {
        let router = Router::default();
        let mut a = joined(&router, "a");
        let b = joined(&router, "b");
        a.drain();

        router.dispatch(&b.peer, Message::decode(r#"{"type":"leave","from":"b"}"#));

        assert!(!router.registry().contains(b.peer.id));
        let got = a.drain();
        assert_eq!(got[0].body, "b left the chat");
        assert_eq!(got[1].kind, MessageKind::UserList);
        assert_eq!(got[1].user_names().unwrap(), vec!["a"]);
    }

    #[test]
    fn test_unknown_type_acknowledged_to_sender_only() {
        let router = Router::default();
        let mut alice = joined(&router, "alice");
        let mut bob = joined(&router, "bob");
        alice.drain();

        router.dispatch(
            &alice.peer,
            Message::decode(r#"{"type":"ping","from":"alice","body":"x"}"#),
        );

        let got = alice.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, MessageKind::System);
        assert_eq!(got[0].body, "Received: x");
        assert!(bob.drain().is_empty());
    }

    #[test]
    fn test_unjoined_peer_gets_ack() {
        let router = Router::default();
        let mut stranger = TestPeer::new();

        router.dispatch(&stranger.peer, Message::system("hello?"));

        let got = stranger.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].body, "Received: hello?");
        assert!(router.registry().is_empty());
    }

    #[test]
    fn test_user_list_request_replies_to_requester() {
        let router = Router::default();
        let mut alice = joined(&router, "alice");
        let mut bob = joined(&router, "bob");
        alice.drain();

        router.dispatch(&bob.peer, Message::new(MessageKind::UserList, "bob", "", ""));

        let got = bob.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].user_names().unwrap(), vec!["alice", "bob"]);
        assert!(alice.drain().is_empty());
    }

    #[test]
    fn test_failed_recipient_does_not_stop_delivery() {
        let router = Router::default();
        let mut a = joined(&router, "a");
        let b = joined(&router, "b");
        let mut c = joined(&router, "c");
        a.drain();
        c.drain();

        drop(b.rx);
        let delivered = router.broadcast(&Message::chat("a", "still here"));

        assert_eq!(delivered, 2);
        assert_eq!(a.drain().len(), 1);
        assert_eq!(c.drain().len(), 1);
    }

    #[test]
    fn test_duplicate_usernames_both_receive_private() {
        let router = Router::default();
        let mut first = joined(&router, "bob");
        let mut second = joined(&router, "bob");
        let _alice = joined(&router, "alice");
        first.drain();
        second.drain();

        let delivered = router.send_private(&Message::private("alice", "bob", "hi"));

        assert_eq!(delivered, 3);
        assert_eq!(first.drain().len(), 1);
        assert_eq!(second.drain().len(), 1);
    }

    #[test]
    fn test_duplicate_join_keeps_both_and_newest_wins_lookup() {
        let router = Router::default();
        let first = joined(&router, "bob");
        let second = joined(&router, "bob");

        assert_eq!(router.registry().usernames(), vec!["bob", "bob"]);
        assert_eq!(router.registry().find("bob").unwrap().id, second.peer.id);

        // Rejoining on the same connection is not a duplicate
        router.dispatch(&first.peer, Message::join("bob"));
        assert_eq!(router.registry().len(), 2);
    }
}
