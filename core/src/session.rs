//! Terminal Session and Session Registry.
//!
//! The key correctness property this module provides is atomic replay+subscribe:
//! `OutputHub` holds the Session Buffer and the live broadcast sender behind one
//! lock, so a client that attaches mid-stream gets the buffer snapshot and the
//! first live byte with no gap and no duplication. A naive implementation that
//! dumps the buffer and subscribes as two separate steps leaves a window where a
//! producer can interleave a publish in between.

use crate::buffer::SessionBuffer;
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::permission::{can_write, Identity, Requester, SessionAcl};
use crate::pty::{self, PtyEvent, PtyHandle};
use bytes::Bytes;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, instrument, warn};

/// Live output broadcast capacity: how many not-yet-consumed messages a slow
/// subscriber may lag behind before it starts missing sends (it is dropped for
/// `Overflow` well before that, at the dispatcher layer).
pub const LIVE_BROADCAST_CAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

pub fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Terminal Session state machine. Each Closed* state is terminal and is
/// broadcast to subscribers exactly once, regardless of whether the transition came
/// from a PTY EOF/error race or an explicit `close()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SessionState {
    Spawning,
    Running,
    ClosedGraceful,
    ClosedError,
}

impl SessionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::ClosedGraceful | SessionState::ClosedError)
    }
}

struct HubInner {
    buffer: SessionBuffer,
    tx: broadcast::Sender<Bytes>,
}

/// Owns the Session Buffer and the live broadcast sender behind a single lock so
/// append+send (producer) and dump+subscribe (new attacher) are each atomic and
/// mutually exclusive: a subscriber can never observe a gap or a duplicate.
pub struct OutputHub {
    inner: Mutex<HubInner>,
}

impl OutputHub {
    pub fn new(byte_cap: usize, line_cap: usize) -> Self {
        let (tx, _rx) = broadcast::channel(LIVE_BROADCAST_CAP);
        Self {
            inner: Mutex::new(HubInner {
                buffer: SessionBuffer::new(byte_cap, line_cap),
                tx,
            }),
        }
    }

    /// Append to the buffer and fan out to current subscribers, atomically.
    pub fn publish(&self, data: Bytes) -> usize {
        let mut inner = self.inner.lock().expect("hub mutex");
        let len = data.len();
        inner.buffer.append(data.clone());
        let _ = inner.tx.send(data);
        len
    }

    /// Snapshot the buffer and subscribe to live output, atomically: no byte
    /// published after this call returns can be missing from either the snapshot or
    /// the subscription, and no byte is delivered twice.
    pub fn attach(&self) -> (Vec<u8>, broadcast::Receiver<Bytes>) {
        let inner = self.inner.lock().expect("hub mutex");
        (inner.buffer.replay(), inner.tx.subscribe())
    }

    /// Snapshot only, for a session that is Closed*: no live subscription is handed
    /// out since no further bytes will ever be produced.
    pub fn replay_only(&self) -> Vec<u8> {
        let inner = self.inner.lock().expect("hub mutex");
        inner.buffer.replay()
    }

    pub fn line_count(&self) -> usize {
        let inner = self.inner.lock().expect("hub mutex");
        inner.buffer.line_count()
    }
}

/// Process-wide counters. Plain atomics, not a metrics-framework dependency —
/// a component this size doesn't warrant one.
#[derive(Default)]
pub struct Telemetry {
    pub sessions_created: AtomicU64,
    pub sessions_closed_graceful: AtomicU64,
    pub sessions_closed_error: AtomicU64,
    pub bytes_broadcast: AtomicU64,
    pub clients_dropped_overflow: AtomicU64,
    pub permission_denials: AtomicU64,
}

/// One PTY session: handle, output hub, ownership/ACL, dimensions, and state.
pub struct TerminalSession {
    pub id: SessionId,
    pty: PtyHandle,
    pub hub: OutputHub,
    pub owner: Identity,
    acl: Mutex<SessionAcl>,
    dimensions: Mutex<(u16, u16)>,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    closed_emitted: AtomicBool,
    pub created_at: u64,
    last_activity: AtomicU64,
    telemetry: Arc<Telemetry>,
}

impl TerminalSession {
    /// Spawn a PTY and bring up a Terminal Session in state Spawning, transitioning
    /// to Running as soon as the reader loop is servicing it.
    #[instrument(skip(cfg, telemetry, cwd))]
    pub fn start(
        owner: Identity,
        cols: u16,
        rows: u16,
        cwd: Option<PathBuf>,
        cfg: &BrokerConfig,
        telemetry: Arc<Telemetry>,
    ) -> Result<Arc<TerminalSession>, BrokerError> {
        let id = SessionId::new();
        let (pty, mut events) =
            pty::spawn_pty(cwd, cols, rows).map_err(|e| BrokerError::SpawnFailed(e.to_string()))?;

        let (state_tx, state_rx) = watch::channel(SessionState::Spawning);
        let session = Arc::new(TerminalSession {
            id,
            pty,
            hub: OutputHub::new(cfg.scrollback_byte_cap, cfg.scrollback_line_cap),
            owner: owner.clone(),
            acl: Mutex::new(SessionAcl::new(owner)),
            dimensions: Mutex::new((cols, rows)),
            state_tx,
            state_rx,
            closed_emitted: AtomicBool::new(false),
            created_at: unix_now_secs(),
            last_activity: AtomicU64::new(unix_now_secs()),
            telemetry: Arc::clone(&telemetry),
        });
        telemetry.sessions_created.fetch_add(1, Ordering::Relaxed);

        let reader_session = Arc::clone(&session);
        let reader_telemetry = Arc::clone(&telemetry);
        tokio::spawn(async move {
            // The settle delay is immediate here: by the time spawn_pty returned, the
            // child process is alive and the reader thread is already running.
            let _ = reader_session.state_tx.send_if_modified(|s| {
                if *s == SessionState::Spawning {
                    *s = SessionState::Running;
                    true
                } else {
                    false
                }
            });
            while let Some(event) = events.recv().await {
                match event {
                    PtyEvent::Data(data) => {
                        reader_session
                            .last_activity
                            .store(unix_now_secs(), Ordering::Relaxed);
                        let n = reader_session.hub.publish(Bytes::from(data));
                        reader_telemetry
                            .bytes_broadcast
                            .fetch_add(n as u64, Ordering::Relaxed);
                    }
                    PtyEvent::Eof => {
                        info!(session_id = %reader_session.id, "pty eof");
                        reader_telemetry
                            .sessions_closed_graceful
                            .fetch_add(1, Ordering::Relaxed);
                        reader_session.transition_closed(SessionState::ClosedGraceful);
                        break;
                    }
                    PtyEvent::ReadError(err) => {
                        warn!(session_id = %reader_session.id, error = %err, "pty read error");
                        reader_telemetry
                            .sessions_closed_error
                            .fetch_add(1, Ordering::Relaxed);
                        reader_session.transition_closed(SessionState::ClosedError);
                        break;
                    }
                }
            }
        });

        Ok(session)
    }

    fn transition_closed(&self, state: SessionState) {
        if self.closed_emitted.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.state_tx.send(state);
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    fn can_write(&self, requester: &Requester, cfg: &BrokerConfig) -> bool {
        let acl = self.acl.lock().expect("acl mutex");
        can_write(requester, &acl, cfg.open_mode)
    }

    /// Attach a new subscriber: replay the buffer then hand back a live receiver.
    /// Valid regardless of session state (Closed* sessions just have no further
    /// live bytes arrive on the receiver).
    pub fn attach(&self) -> (Vec<u8>, broadcast::Receiver<Bytes>) {
        self.hub.attach()
    }

    pub async fn write_input(
        &self,
        requester: &Requester,
        data: Vec<u8>,
        cfg: &BrokerConfig,
    ) -> Result<usize, BrokerError> {
        if !self.can_write(requester, cfg) {
            self.telemetry.permission_denials.fetch_add(1, Ordering::Relaxed);
            return Err(BrokerError::PermissionDenied(format!(
                "{} may not write to session {}",
                requester.identity, self.id
            )));
        }
        let n = self
            .pty
            .write(data, cfg.write_timeout)
            .await
            .map_err(|e| match e {
                pty::PtyError::WriteTimeout => BrokerError::WriteTimeout,
                pty::PtyError::NotOpen => BrokerError::NotFound(self.id.to_string()),
                other => BrokerError::InternalError.tap_log(&other.to_string()),
            })?;
        self.last_activity.store(unix_now_secs(), Ordering::Relaxed);
        Ok(n)
    }

    pub fn resize(
        &self,
        requester: &Requester,
        cols: u16,
        rows: u16,
        cfg: &BrokerConfig,
    ) -> Result<(), BrokerError> {
        if !self.can_write(requester, cfg) {
            self.telemetry.permission_denials.fetch_add(1, Ordering::Relaxed);
            return Err(BrokerError::PermissionDenied(format!(
                "{} may not resize session {}",
                requester.identity, self.id
            )));
        }
        let cols = cols.clamp(1, 1000);
        let rows = rows.clamp(1, 1000);
        *self.dimensions.lock().expect("dimensions mutex") = (cols, rows);
        self.pty
            .resize(cols, rows)
            .map_err(|e| BrokerError::InternalError.tap_log(&e.to_string()))
    }

    pub fn dimensions(&self) -> (u16, u16) {
        *self.dimensions.lock().expect("dimensions mutex")
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Close the session. `requester` is `None` for server-initiated closes (eviction
    /// sweep, shutdown), which always succeed.
    pub async fn close(&self, requester: Option<&Requester>, cfg: &BrokerConfig) -> Result<(), BrokerError> {
        if let Some(req) = requester {
            if !self.can_write(req, cfg) {
                self.telemetry.permission_denials.fetch_add(1, Ordering::Relaxed);
                return Err(BrokerError::PermissionDenied(format!(
                    "{} may not close session {}",
                    req.identity, self.id
                )));
            }
        }
        self.pty.close(cfg.close_grace_period).await;
        self.transition_closed(SessionState::ClosedGraceful);
        Ok(())
    }
}

// Small ergonomic helper kept local to this module: log at the error call site while
// still returning the coarse wire-safe variant.
trait TapLog {
    fn tap_log(self, detail: &str) -> BrokerError;
}

impl TapLog for BrokerError {
    fn tap_log(self, detail: &str) -> BrokerError {
        tracing::error!(detail, "internal error");
        self
    }
}

/// Outcome of `attach_or_replay`: distinguishes a live attach from a replay of a
/// retained-but-closed session's buffer, so the dispatcher can pick the right
/// `terminal_ready`/`session_reconnected` status.
pub enum AttachOutcome {
    Attached {
        replay: Vec<u8>,
        rx: broadcast::Receiver<Bytes>,
    },
    ReplayedClosed {
        replay: Vec<u8>,
    },
    NotFound,
}

/// Process-wide map of session id to Terminal Session.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<TerminalSession>>,
    pub telemetry: Arc<Telemetry>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            telemetry: Arc::new(Telemetry::default()),
        })
    }

    pub fn create(
        self: &Arc<Self>,
        owner: Identity,
        cols: u16,
        rows: u16,
        cwd: Option<PathBuf>,
        cfg: &BrokerConfig,
    ) -> Result<Arc<TerminalSession>, BrokerError> {
        let session = TerminalSession::start(owner, cols, rows, cwd, cfg, Arc::clone(&self.telemetry))?;
        self.sessions.insert(session.id, Arc::clone(&session));
        Ok(session)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<TerminalSession>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// If Running, a standard live attach. If Closed* with a retained buffer, a
    /// replay snapshot with no live subscription. If absent, NotFound.
    pub fn attach_or_replay(&self, id: SessionId) -> AttachOutcome {
        match self.sessions.get(&id) {
            None => AttachOutcome::NotFound,
            Some(entry) => {
                let session = entry.value();
                if session.state().is_closed() {
                    AttachOutcome::ReplayedClosed {
                        replay: session.hub.replay_only(),
                    }
                } else {
                    let (replay, rx) = session.attach();
                    AttachOutcome::Attached { replay, rx }
                }
            }
        }
    }

    pub async fn close(
        &self,
        id: SessionId,
        requester: Option<&Requester>,
        cfg: &BrokerConfig,
    ) -> Result<(), BrokerError> {
        let session = self
            .get(id)
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))?;
        session.close(requester, cfg).await
    }

    pub fn list_by_identity(&self, identity: &str) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().owner == identity)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Every session id currently in the registry, regardless of state. Used for the
    /// process-shutdown drain: every live session is closed gracefully with a bounded
    /// drain before the process exits.
    pub fn list_all(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Spawn the periodic eviction sweep: removes Closed* sessions whose
    /// buffer has been idle past `retention`. Runs for the lifetime of the registry.
    pub fn spawn_eviction_sweep(self: &Arc<Self>, retention: Duration, interval: Duration) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = unix_now_secs();
                let retention_secs = retention.as_secs();
                let stale: Vec<SessionId> = registry
                    .sessions
                    .iter()
                    .filter(|entry| {
                        let s = entry.value();
                        s.state().is_closed()
                            && now.saturating_sub(s.last_activity()) > retention_secs
                    })
                    .map(|entry| *entry.key())
                    .collect();
                for id in stale {
                    registry.sessions.remove(&id);
                    info!(session_id = %id, "evicted closed session past retention window");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::Role;

    fn requester(identity: &str, role: Role) -> Requester {
        Requester {
            identity: identity.to_string(),
            role,
        }
    }

    #[test]
    fn output_hub_attach_sees_prior_publish_and_live_after() {
        let hub = OutputHub::new(1024, 100);
        hub.publish(Bytes::from_static(b"before"));
        let (replay, mut rx) = hub.attach();
        assert_eq!(replay, b"before".to_vec());
        hub.publish(Bytes::from_static(b"after"));
        let received = rx.try_recv().expect("live byte delivered");
        assert_eq!(received.as_ref(), b"after");
    }

    #[test]
    fn session_id_is_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn spawn_attach_input_and_close_lifecycle() {
        let cfg = BrokerConfig::default();
        let telemetry = Arc::new(Telemetry::default());
        let Ok(session) = TerminalSession::start("alice".into(), 80, 24, None, &cfg, Arc::clone(&telemetry))
        else {
            return;
        };
        let owner = requester("alice", Role::User);
        let stranger = requester("mallory", Role::User);

        assert!(session.write_input(&stranger, b"x".to_vec(), &cfg).await.is_err());
        assert!(session
            .write_input(&owner, b"echo hi\n".to_vec(), &cfg)
            .await
            .is_ok());

        let (_, _rx) = session.attach();
        assert!(session.resize(&owner, 120, 40, &cfg).is_ok());
        assert_eq!(session.dimensions(), (120, 40));

        session.close(None, &cfg).await.expect("close succeeds");
        assert!(session.state().is_closed());
        // A second close is a harmless no-op at the state-transition level.
        session.close(None, &cfg).await.expect("idempotent close");
    }

    #[tokio::test]
    async fn registry_attach_or_replay_distinguishes_running_from_closed() {
        let cfg = BrokerConfig::default();
        let registry = SessionRegistry::new();
        let Ok(session) = registry.create("alice".into(), 80, 24, None, &cfg) else {
            return;
        };
        let id = session.id;
        match registry.attach_or_replay(id) {
            AttachOutcome::Attached { .. } => {}
            _ => panic!("expected Attached for a Running session"),
        }
        registry.close(id, None, &cfg).await.expect("close");
        // Give the reader task's own transition a moment; our explicit close already
        // flipped state synchronously via transition_closed, so this should hold now.
        match registry.attach_or_replay(id) {
            AttachOutcome::ReplayedClosed { .. } => {}
            _ => panic!("expected ReplayedClosed for a Closed* session"),
        }
    }

    #[test]
    fn registry_reports_not_found_for_unknown_id() {
        let registry = SessionRegistry::new();
        match registry.attach_or_replay(SessionId::new()) {
            AttachOutcome::NotFound => {}
            _ => panic!("expected NotFound"),
        }
    }
}
