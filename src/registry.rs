//! Registry of connected masters
//!
//! A session id is present in the registry exactly while its connection
//! handler is running. The listener inserts the entry before the handler
//! task is spawned; the handler's [`Registration`] guard removes it when the
//! task ends, whichever way it ends.
//!
//! Membership goes through one `parking_lot::RwLock`. The lock is only held
//! for map operations, never across I/O or store calls. Per-session state
//! lives in an atomic owned by the session, so handlers update it without
//! touching the map lock.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

/// Opaque session handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Position of a session in the connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connected = 0,
    ReadingHeader = 1,
    ReadingBody = 2,
    Dispatching = 3,
    WritingResponse = 4,
    Closing = 5,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connected,
            1 => Self::ReadingHeader,
            2 => Self::ReadingBody,
            3 => Self::Dispatching,
            4 => Self::WritingResponse,
            _ => Self::Closing,
        }
    }
}

/// Metadata for one connected master
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterSession {
    pub id: SessionId,
    pub remote_endpoint: SocketAddr,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
}

impl MasterSession {
    pub fn new(id: SessionId, remote_endpoint: SocketAddr) -> Self {
        Self {
            id,
            remote_endpoint,
            created_at: Utc::now(),
            state: SessionState::Connected,
        }
    }
}

/// Registry entry: fixed metadata plus the live state
#[derive(Debug)]
struct SessionSlot {
    id: SessionId,
    remote_endpoint: SocketAddr,
    created_at: DateTime<Utc>,
    state: AtomicU8,
}

impl SessionSlot {
    fn new(session: MasterSession) -> Self {
        Self {
            id: session.id,
            remote_endpoint: session.remote_endpoint,
            created_at: session.created_at,
            state: AtomicU8::new(session.state as u8),
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    fn to_session(&self) -> MasterSession {
        MasterSession {
            id: self.id,
            remote_endpoint: self.remote_endpoint,
            created_at: self.created_at,
            state: SessionState::from_u8(self.state.load(Ordering::Relaxed)),
        }
    }
}

/// Concurrency-safe registry of connected masters.
///
/// Cloning gives another handle to the same registry.
#[derive(Debug, Clone, Default)]
pub struct MasterRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<SessionSlot>>>>,
    next_id: Arc<AtomicU64>,
}

impl MasterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh, never reused session id
    pub fn next_session_id(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Insert a session. Returns false if the id was already present.
    pub fn add(&self, session: MasterSession) -> bool {
        self.insert(session).is_some()
    }

    fn insert(&self, session: MasterSession) -> Option<Arc<SessionSlot>> {
        let id = session.id;
        let slot = {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&id) {
                return None;
            }
            let slot = Arc::new(SessionSlot::new(session));
            sessions.insert(id, slot.clone());
            slot
        };
        debug!("Master {} registered", id);
        Some(slot)
    }

    /// Remove a session. Absent ids are a no-op.
    pub fn remove(&self, id: SessionId) -> Option<MasterSession> {
        let removed = self.sessions.write().remove(&id);
        removed.map(|slot| {
            debug!("Master {} deregistered", id);
            slot.to_session()
        })
    }

    /// Insert `session` and return a guard that removes it on drop.
    ///
    /// Returns `None` if the id is already registered; the existing entry
    /// keeps its single owner.
    pub fn register(&self, session: MasterSession) -> Option<Registration> {
        let id = session.id;
        let slot = self.insert(session)?;
        Some(Registration {
            registry: self.clone(),
            id,
            slot,
        })
    }

    /// Update the recorded state of a live session
    pub fn set_state(&self, id: SessionId, state: SessionState) {
        if let Some(slot) = self.sessions.read().get(&id) {
            slot.set_state(state);
        }
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.read().contains_key(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<MasterSession> {
        self.sessions.read().get(&id).map(|slot| slot.to_session())
    }

    /// Number of connected masters
    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Point-in-time copy of all sessions, ordered by id
    pub fn snapshot(&self) -> Vec<MasterSession> {
        let mut sessions: Vec<MasterSession> = self
            .sessions
            .read()
            .values()
            .map(|slot| slot.to_session())
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }
}

/// Removes its session from the registry when dropped.
///
/// Held by the connection task for its whole lifetime, so the entry goes away
/// exactly once on every exit path, including a panic while dispatching.
#[derive(Debug)]
pub struct Registration {
    registry: MasterRegistry,
    id: SessionId,
    slot: Arc<SessionSlot>,
}

impl Registration {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Lock-free state update
    pub fn set_state(&self, state: SessionState) {
        self.slot.set_state(state);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_add_remove_count() {
        let registry = MasterRegistry::new();
        let a = registry.next_session_id();
        let b = registry.next_session_id();
        assert_ne!(a, b);

        assert!(registry.add(MasterSession::new(a, addr(1000))));
        assert!(registry.add(MasterSession::new(b, addr(1001))));
        assert!(!registry.add(MasterSession::new(a, addr(1002))));
        assert_eq!(registry.count(), 2);

        assert!(registry.remove(a).is_some());
        assert!(registry.remove(a).is_none());
        assert_eq!(registry.count(), 1);
        assert!(!registry.contains(a));
        assert!(registry.contains(b));
    }

    #[test]
    fn test_snapshot_is_ordered_copy() {
        let registry = MasterRegistry::new();
        let ids: Vec<_> = (0..5).map(|_| registry.next_session_id()).collect();
        for (i, id) in ids.iter().rev().enumerate() {
            registry.add(MasterSession::new(*id, addr(2000 + i as u16)));
        }

        let snapshot = registry.snapshot();
        registry.remove(ids[0]);

        assert_eq!(snapshot.len(), 5);
        assert_eq!(snapshot.iter().map(|s| s.id).collect::<Vec<_>>(), ids);
        assert_eq!(registry.count(), 4);
    }

    #[test]
    fn test_registration_removes_on_drop() {
        let registry = MasterRegistry::new();
        let id = registry.next_session_id();

        let registration = registry
            .register(MasterSession::new(id, addr(3000)))
            .unwrap();
        registration.set_state(SessionState::ReadingHeader);
        assert_eq!(registry.get(id).map(|s| s.state), Some(SessionState::ReadingHeader));

        // An explicit removal racing the guard is harmless
        registry.remove(id);
        drop(registration);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registration_removed_on_panic() {
        let registry = MasterRegistry::new();
        let id = registry.next_session_id();
        let registration = registry
            .register(MasterSession::new(id, addr(3001)))
            .unwrap();

        let result = thread::spawn(move || {
            let _registration = registration;
            panic!("dispatch blew up");
        })
        .join();

        assert!(result.is_err());
        assert!(!registry.contains(id));
    }

    #[test]
    fn test_duplicate_registration_is_refused() {
        let registry = MasterRegistry::new();
        let id = registry.next_session_id();

        let first = registry
            .register(MasterSession::new(id, addr(3002)))
            .unwrap();
        assert!(registry
            .register(MasterSession::new(id, addr(3003)))
            .is_none());

        // The refused attempt left the original entry and its owner intact
        assert_eq!(registry.get(id).map(|s| s.remote_endpoint), Some(addr(3002)));
        drop(first);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_state_updates_visible_through_registry() {
        let registry = MasterRegistry::new();
        let id = registry.next_session_id();
        let registration = registry
            .register(MasterSession::new(id, addr(3004)))
            .unwrap();
        assert_eq!(registry.get(id).map(|s| s.state), Some(SessionState::Connected));

        registration.set_state(SessionState::WritingResponse);
        assert_eq!(
            registry.snapshot()[0].state,
            SessionState::WritingResponse
        );

        registry.set_state(id, SessionState::Closing);
        assert_eq!(registry.get(id).map(|s| s.state), Some(SessionState::Closing));
    }

    #[test]
    fn test_concurrent_add_remove() {
        let registry = MasterRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for i in 0..200u16 {
                        let id = registry.next_session_id();
                        registry.add(MasterSession::new(id, addr(t * 1000 + i)));
                        assert!(registry.count() >= 1);
                        let _ = registry.snapshot();
                        assert!(registry.remove(id).is_some());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.count(), 0);
    }
}
