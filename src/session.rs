//! Per-connection session state.
//!
//! A [`Session`] owns the sending side of its bounded outbound queue; a
//! writer task owns the receiving side and is the only code that writes to
//! the socket. Responses wait for queue space, events never do.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock as AsyncRwLock;
use tokio::task::JoinHandle;

use crate::gid::Gid;
use crate::network::{CodecError, Frame, TcpSyncStream};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session closed: id={0}")]
    Closed(u64),

    #[error("Outbound queue full: id={0}")]
    QueueFull(u64),

    #[error("Session not accepting events: id={0}")]
    Detached(u64),

    #[error("Maximum sessions exceeded (limit: {0})")]
    MaxSessionsExceeded(usize),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// The authenticated user bound to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Gid,
    /// Token that authenticated this session, if any.
    pub token_id: Option<Gid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Anonymous,
    User(Identity),
}

/// Snapshot of who is talking on a connection, handed to every handler.
#[derive(Debug, Clone, Copy)]
pub struct SessionContext {
    pub session_id: u64,
    pub peer: Option<SocketAddr>,
    pub role: Role,
}

impl SessionContext {
    pub fn identity(&self) -> Option<Identity> {
        match self.role {
            Role::User(identity) => Some(identity),
            Role::Anonymous => None,
        }
    }
}

struct Outbound {
    tx: Option<mpsc::Sender<Bytes>>,
    accepting_events: bool,
}

pub struct Session {
    pub id: u64,
    pub peer: Option<SocketAddr>,
    outbound: Mutex<Outbound>,
    identity: RwLock<Option<Identity>>,
    alive: AtomicBool,
    dropped_events: AtomicU64,
}

impl Session {
    /// Creates a session and the receiver its writer task drains.
    pub fn new(id: u64, peer: Option<SocketAddr>, queue_len: usize) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(queue_len.max(1));
        let session = Arc::new(Self {
            id,
            peer,
            outbound: Mutex::new(Outbound { tx: Some(tx), accepting_events: false }),
            identity: RwLock::new(None),
            alive: AtomicBool::new(true),
            dropped_events: AtomicU64::new(0),
        });
        (session, rx)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn identity(&self) -> Option<Identity> {
        *self.identity.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bind(&self, identity: Identity) {
        *self.identity.write().unwrap_or_else(PoisonError::into_inner) = Some(identity);
    }

    /// Back to anonymous; returns the identity that was bound.
    pub fn unbind(&self) -> Option<Identity> {
        self.identity.write().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn context(&self) -> SessionContext {
        SessionContext {
            session_id: self.id,
            peer: self.peer,
            role: match self.identity() {
                Some(identity) => Role::User(identity),
                None => Role::Anonymous,
            },
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    fn outbound(&self) -> std::sync::MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_accepting_events(&self, accepting: bool) {
        self.outbound().accepting_events = accepting;
    }

    /// Queues a response frame, waiting for space on this session's queue.
    pub async fn send(&self, frame: &Frame) -> Result<(), SessionError> {
        let bytes = frame.encode()?;
        let tx = self.outbound().tx.clone().ok_or(SessionError::Closed(self.id))?;
        tx.send(bytes).await.map_err(|_| SessionError::Closed(self.id))
    }

    /// Queues an already encoded event without waiting. Fails once the
    /// session has been unregistered from the event hub or closed.
    pub fn push_event(&self, bytes: Bytes) -> Result<(), SessionError> {
        let outbound = self.outbound();
        if !outbound.accepting_events {
            return Err(SessionError::Detached(self.id));
        }
        let tx = outbound.tx.as_ref().ok_or(SessionError::Closed(self.id))?;
        match tx.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                Err(SessionError::QueueFull(self.id))
            }
            Err(TrySendError::Closed(_)) => Err(SessionError::Closed(self.id)),
        }
    }

    /// Marks the session dead and closes its outbound queue. Frames already
    /// queued are still written by the writer task. Returns false if the
    /// session was already closed.
    pub fn close(&self) -> bool {
        let was_alive = self.alive.swap(false, Ordering::AcqRel);
        let mut outbound = self.outbound();
        outbound.accepting_events = false;
        outbound.tx = None;
        was_alive
    }
}

/// Drains a session's outbound queue onto the socket until the queue is
/// closed or a write fails.
pub fn spawn_writer(session: Arc<Session>, stream: Arc<TcpSyncStream>, mut rx: mpsc::Receiver<Bytes>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = stream.write_encoded(&bytes).await {
                tracing::debug!("[session] [write_failed] id={} error={}", session.id, e);
                session.close();
                break;
            }
        }
        stream.shutdown().await;
    })
}

/// Registry of every live session, used for limits and shutdown.
pub struct SessionManager {
    sessions: AsyncRwLock<HashMap<u64, Arc<Session>>>,
    next_id: AtomicU64,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: AsyncRwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_sessions,
        }
    }

    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn insert(&self, session: Arc<Session>) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(SessionError::MaxSessionsExceeded(self.max_sessions));
        }
        sessions.insert(session.id, session);
        Ok(())
    }

    pub async fn get(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(&id)
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user() -> Identity {
        Identity { user_id: Gid::from_parts(1, 0, [0; 8]), token_id: None }
    }

    #[test]
    fn test_new_session_is_anonymous() {
        let (s, _rx) = Session::new(1, None, 4);
        assert!(s.is_alive());
        assert_eq!(s.context().role, Role::Anonymous);
        assert!(s.context().identity().is_none());
    }

    #[test]
    fn test_bind_sets_role() {
        let (s, _rx) = Session::new(1, None, 4);
        s.bind(user());
        assert_eq!(s.context().role, Role::User(user()));
    }

    #[test]
    fn test_unbind_returns_to_anonymous() {
        let (s, _rx) = Session::new(1, None, 4);
        s.bind(user());
        assert_eq!(s.unbind(), Some(user()));
        assert_eq!(s.context().role, Role::Anonymous);
        assert_eq!(s.unbind(), None);
    }

    #[test]
    fn test_push_event_requires_registration() {
        let (s, _rx) = Session::new(1, None, 4);
        assert!(matches!(s.push_event(Bytes::from_static(b"x")), Err(SessionError::Detached(1))));
        s.set_accepting_events(true);
        assert!(s.push_event(Bytes::from_static(b"x")).is_ok());
    }

    #[test]
    fn test_push_event_full_queue_counts_drop() {
        let (s, _rx) = Session::new(7, None, 2);
        s.set_accepting_events(true);
        s.push_event(Bytes::from_static(b"1")).unwrap();
        s.push_event(Bytes::from_static(b"2")).unwrap();
        assert!(matches!(s.push_event(Bytes::from_static(b"3")), Err(SessionError::QueueFull(7))));
        assert_eq!(s.dropped_events(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_sends() {
        let (s, mut rx) = Session::new(3, None, 4);
        s.set_accepting_events(true);
        s.send(&Frame::response("r", &json!(1)).unwrap()).await.unwrap();

        assert!(s.close());
        assert!(!s.close());
        assert!(!s.is_alive());
        assert!(s.send(&Frame::response("r", &json!(2)).unwrap()).await.is_err());
        assert!(s.push_event(Bytes::from_static(b"e")).is_err());

        // the frame queued before close is still delivered, then the queue ends
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_manager_allocate_insert_remove() {
        let manager = SessionManager::new(8);
        let a = manager.allocate_id();
        let b = manager.allocate_id();
        assert_ne!(a, b);

        let (s, _rx) = Session::new(a, None, 1);
        manager.insert(s).await.unwrap();
        assert!(manager.get(a).await.is_some());
        assert_eq!(manager.count().await, 1);

        manager.remove(a).await;
        assert!(manager.get(a).await.is_none());
    }

    #[tokio::test]
    async fn test_manager_max_sessions() {
        let manager = SessionManager::new(2);
        for _ in 0..2 {
            let (s, _rx) = Session::new(manager.allocate_id(), None, 1);
            manager.insert(s).await.unwrap();
        }
        let (s, _rx) = Session::new(manager.allocate_id(), None, 1);
        assert!(matches!(manager.insert(s).await, Err(SessionError::MaxSessionsExceeded(2))));
    }
}
