//! Connected-session registry: the single source of truth for who is online.
//!
//! At most one live session per device_id. A later successful authentication
//! for the same device_id replaces the incumbent atomically; the caller closes
//! the displaced session with code 4409. Only authenticated sessions enter
//! this table: sockets still waiting on a pairing verdict live in the
//! separate [`PairingWaiters`] table, so an unauthenticated socket can never
//! occupy or evict an authenticated slot.

use phb_core::Role;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// Commands accepted by a session's socket loop. Every outbound frame for a
/// socket flows through its channel, which keeps delivery FIFO per receiver.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A JSON text frame.
    Frame(String),
    /// Close the socket with the given code and reason.
    Close(u16, &'static str),
}

/// Handle to a live authenticated session: identity plus the outbound channel
/// drained by its socket loop.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub device_id: String,
    pub role: Role,
    pub tx: mpsc::Sender<Outbound>,
}

impl SessionHandle {
    /// Fire-and-forget send; a full or closed channel drops the frame.
    pub fn send(&self, out: Outbound) -> bool {
        self.tx.try_send(out).is_ok()
    }
}

/// Registry of authenticated sessions keyed by device_id.
#[derive(Default)]
pub struct DeviceRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, atomically replacing any incumbent with the same
    /// device_id. Returns the displaced session, if any; the caller sends it
    /// the 4409 close.
    pub async fn register(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write().await;
        let displaced = sessions.insert(handle.device_id.clone(), handle.clone());
        info!(
            device_id = %handle.device_id,
            role = ?handle.role,
            total = sessions.len(),
            displaced = displaced.is_some(),
            "session registered"
        );
        displaced
    }

    pub async fn lookup(&self, device_id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(device_id).cloned()
    }

    /// Remove the session only if the slot still holds this session_id; a
    /// displaced session unregistering late must not evict its successor.
    pub async fn unregister(&self, device_id: &str, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        match sessions.get(device_id) {
            Some(current) if current.session_id == session_id => {
                sessions.remove(device_id);
                info!(device_id = %device_id, total = sessions.len(), "session unregistered");
            }
            _ => {
                debug!(device_id = %device_id, "unregister skipped, slot holds a different session");
            }
        }
    }

    /// Authenticated sessions other than the excluded one.
    pub async fn broadcast_targets(&self, exclude_session_id: &str) -> Vec<SessionHandle> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.session_id != exclude_session_id)
            .cloned()
            .collect()
    }

    /// The connected desktop session, if any.
    pub async fn desktop(&self) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.role == Role::Desktop)
            .cloned()
    }

    pub async fn device_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// A socket parked mid-pairing, waiting for the desktop's verdict.
#[derive(Debug, Clone)]
pub struct PairingWaiter {
    pub session_id: String,
    pub device_id: String,
    pub tx: mpsc::Sender<Outbound>,
}

impl PairingWaiter {
    /// Fire-and-forget send; a full or closed channel drops the frame.
    pub fn send(&self, out: Outbound) -> bool {
        self.tx.try_send(out).is_ok()
    }
}

/// Unauthenticated sockets waiting for a pairing verdict, keyed by their
/// transient device_id. A table of its own: waiters share no keyspace with
/// the authenticated registry, and only the desktop's verdict path reads it.
#[derive(Default)]
pub struct PairingWaiters {
    waiters: RwLock<HashMap<String, PairingWaiter>>,
}

impl PairingWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a waiter, replacing any earlier waiter with the same transient
    /// id. Returns the replaced waiter, if any; the caller closes it.
    pub async fn register(&self, waiter: PairingWaiter) -> Option<PairingWaiter> {
        let mut waiters = self.waiters.write().await;
        let displaced = waiters.insert(waiter.device_id.clone(), waiter.clone());
        debug!(device_id = %waiter.device_id, total = waiters.len(), "pairing waiter parked");
        displaced
    }

    /// Remove and return the waiter to deliver the desktop's verdict.
    pub async fn take(&self, device_id: &str) -> Option<PairingWaiter> {
        self.waiters.write().await.remove(device_id)
    }

    /// Remove the waiter only if the slot still holds this session_id.
    pub async fn unregister(&self, device_id: &str, session_id: &str) {
        let mut waiters = self.waiters.write().await;
        if waiters.get(device_id).is_some_and(|w| w.session_id == session_id) {
            waiters.remove(device_id);
        }
    }
}
