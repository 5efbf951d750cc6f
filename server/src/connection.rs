//! Client Connection: per-connection identity/role and a bounded outbound
//! queue. `ConnectionRegistry` is the process-wide set used for workspace-wide
//! broadcasts (tab/pane mutations go to every connected client).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use termhub_core::permission::Role;
use termhub_core::session::Telemetry;
use tokio::sync::{mpsc, watch};

use crate::protocol::ServerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

struct Entry {
    tx: mpsc::Sender<ServerEvent>,
    close_tx: watch::Sender<bool>,
}

pub struct ConnectionRegistry {
    entries: DashMap<ConnectionId, Entry>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
        })
    }

    pub fn register(
        &self,
        id: ConnectionId,
        tx: mpsc::Sender<ServerEvent>,
        close_tx: watch::Sender<bool>,
    ) {
        self.entries.insert(id, Entry { tx, close_tx });
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.entries.remove(&id);
    }

    /// Send to every connected client. A connection whose outbound queue is already
    /// full is signaled to close rather than blocked on or silently skipped forever
    /// (the connection is dropped, the rest of the system is not).
    pub fn broadcast_all(&self, event: ServerEvent, telemetry: &Telemetry) {
        let mut overflowed = Vec::new();
        for entry in self.entries.iter() {
            if entry.value().tx.try_send(event.clone()).is_err() {
                overflowed.push(*entry.key());
            }
        }
        for id in overflowed {
            telemetry.clients_dropped_overflow.fetch_add(1, Ordering::Relaxed);
            if let Some(entry) = self.entries.get(&id) {
                let _ = entry.close_tx.send(true);
            }
        }
    }
}

/// One connected client's resolved identity and (initially Anonymous, possibly
/// later declared via `workspace_connect`) role.
pub struct ConnectionState {
    pub identity: String,
    pub role: std::sync::Mutex<Role>,
}

impl ConnectionState {
    pub fn new(identity: String) -> Self {
        Self {
            identity,
            role: std::sync::Mutex::new(Role::Anonymous),
        }
    }

    pub fn set_role(&self, role: Role) {
        *self.role.lock().expect("role mutex") = role;
    }

    pub fn requester(&self) -> termhub_core::permission::Requester {
        termhub_core::permission::Requester {
            identity: self.identity.clone(),
            role: *self.role.lock().expect("role mutex"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_event() -> ServerEvent {
        ServerEvent::TerminalReady {
            session: "s".to_string(),
            tab_id: None,
            status: "created",
        }
    }

    /// Once a connection's outbound queue is full, broadcast_all
    /// signals that connection to close instead of blocking the whole broadcast or
    /// silently skipping it forever.
    #[tokio::test]
    async fn broadcast_all_signals_close_on_overflow() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel::<ServerEvent>(1);
        let (close_tx, mut close_rx) = watch::channel(false);
        let id = ConnectionId::new();
        registry.register(id, tx.clone(), close_tx);

        // Fill the one-slot queue so the next broadcast overflows it.
        tx.try_send(ready_event()).expect("first send fits");

        let telemetry = Telemetry::default();
        registry.broadcast_all(ready_event(), &telemetry);

        assert!(*close_rx.borrow_and_update());
        assert_eq!(
            telemetry.clients_dropped_overflow.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn broadcast_all_reaches_every_registered_connection() {
        let registry = ConnectionRegistry::new();
        let telemetry = Telemetry::default();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = mpsc::channel::<ServerEvent>(8);
            let (close_tx, _close_rx) = watch::channel(false);
            registry.register(ConnectionId::new(), tx, close_tx);
            receivers.push(rx);
        }
        registry.broadcast_all(ready_event(), &telemetry);
        for mut rx in receivers {
            assert!(rx.try_recv().is_ok());
        }
    }

    #[test]
    fn unregister_removes_connection() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel::<ServerEvent>(8);
        let (close_tx, _close_rx) = watch::channel(false);
        let id = ConnectionId::new();
        registry.register(id, tx, close_tx);
        registry.unregister(id);
        assert!(registry.entries.get(&id).is_none());
    }
}
