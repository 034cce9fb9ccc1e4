//! Client sessions.
//!
//! A session is the TX-side identity of a connection: created by the
//! synthetic connect message, destroyed by the disconnect message. It owns
//! the per-session authentication salt sent in the greeting.

use marlin_protocol::SALT_SIZE;
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::time::Instant;
use uuid::Uuid;

pub struct Session {
    id: Uuid,
    peer: SocketAddr,
    salt: [u8; SALT_SIZE],
    /// Sync of the request currently being processed.
    sync: Cell<u64>,
    user: RefCell<Option<String>>,
    created_at: Instant,
}

impl Session {
    pub(crate) fn new(peer: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            salt: rand::random(),
            sync: Cell::new(0),
            user: RefCell::new(None),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The authentication challenge sent in the greeting.
    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }

    pub fn sync(&self) -> u64 {
        self.sync.get()
    }

    pub(crate) fn set_sync(&self, sync: u64) {
        self.sync.set(sync);
    }

    /// The authenticated user, if AUTH succeeded.
    pub fn user(&self) -> Option<String> {
        self.user.borrow().clone()
    }

    pub fn set_user(&self, user: impl Into<String>) {
        *self.user.borrow_mut() = Some(user.into());
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[test]
    fn test_sessions_have_distinct_identity() {
        let a = Session::new(peer());
        let b = Session::new(peer());
        assert_ne!(a.id(), b.id());
        assert_ne!(a.salt(), b.salt());
    }

    #[test]
    fn test_session_user() {
        let session = Session::new(peer());
        assert!(session.user().is_none());
        session.set_user("admin");
        assert_eq!(session.user().as_deref(), Some("admin"));
    }

    #[test]
    fn test_session_sync_tracking() {
        let session = Session::new(peer());
        session.set_sync(0x42);
        assert_eq!(session.sync(), 0x42);
    }
}
