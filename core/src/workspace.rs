//! Workspace Model: the server-authoritative tabs → panes → session-id shape
//! clients resume into. A single process-wide Workspace; all mutations apply under
//! one lock so broadcast order equals apply order (single mutator discipline).

use crate::session::SessionId;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TabId(pub uuid::Uuid);

impl TabId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct PaneId(pub uuid::Uuid);

impl PaneId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for PaneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TabType {
    Terminal,
    AiAgent,
    LogMonitor,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Pane {
    pub id: PaneId,
    #[serde(rename = "type")]
    pub pane_type: TabType,
    pub sub_type: Option<String>,
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Tab {
    pub id: TabId,
    pub title: String,
    #[serde(rename = "type")]
    pub tab_type: TabType,
    pub sub_type: Option<String>,
    pub panes: Vec<Pane>,
    pub layout: String,
}

/// Spec for creating a tab. Client-supplied `id` fields anywhere in this tree are
/// rejected at the call site in `createTab`/`createPane`: the server is sole minter.
pub struct TabSpec {
    pub title: String,
    pub tab_type: TabType,
    pub sub_type: Option<String>,
    pub layout: String,
}

pub struct PaneSpec {
    pub pane_type: TabType,
    pub sub_type: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkspaceSnapshot {
    pub tabs: Vec<Tab>,
    pub active_tab_id: Option<TabId>,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("tab not found: {0}")]
    TabNotFound(TabId),
    #[error("pane not found: {0}")]
    PaneNotFound(PaneId),
}

struct WorkspaceState {
    tabs: Vec<Tab>,
    active_tab_id: Option<TabId>,
}

/// Singleton per process. All mutation methods take `&self` and serialize through
/// one internal mutex: all mutations to the workspace originate server-side.
pub struct Workspace {
    state: Mutex<WorkspaceState>,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WorkspaceState {
                tabs: Vec::new(),
                active_tab_id: None,
            }),
        }
    }

    pub fn snapshot(&self) -> WorkspaceSnapshot {
        let state = self.state.lock().expect("workspace mutex");
        WorkspaceSnapshot {
            tabs: state.tabs.clone(),
            active_tab_id: state.active_tab_id,
        }
    }

    /// Create a tab with a server-minted id. If `with_default_pane` is set, also
    /// creates a single pane of the tab's own type (the binding of that pane to a
    /// freshly spawned Terminal Session is the dispatcher's job, not the workspace's:
    /// the workspace only records the shape, it never starts a PTY itself).
    pub fn create_tab(&self, spec: TabSpec, with_default_pane: bool) -> Tab {
        let mut state = self.state.lock().expect("workspace mutex");
        let panes = if with_default_pane {
            vec![Pane {
                id: PaneId::new(),
                pane_type: spec.tab_type,
                sub_type: spec.sub_type.clone(),
                session_id: None,
            }]
        } else {
            Vec::new()
        };
        let tab = Tab {
            id: TabId::new(),
            title: spec.title,
            tab_type: spec.tab_type,
            sub_type: spec.sub_type,
            panes,
            layout: spec.layout,
        };
        state.tabs.push(tab.clone());
        if state.active_tab_id.is_none() {
            state.active_tab_id = Some(tab.id);
        }
        tab
    }

    /// Remove a tab. Returns the session ids that were bound to its panes so the
    /// caller (dispatcher) can issue `Registry::close` for each one.
    pub fn delete_tab(&self, id: TabId) -> Result<Vec<SessionId>, WorkspaceError> {
        let mut state = self.state.lock().expect("workspace mutex");
        let idx = state
            .tabs
            .iter()
            .position(|t| t.id == id)
            .ok_or(WorkspaceError::TabNotFound(id))?;
        let removed = state.tabs.remove(idx);
        if state.active_tab_id == Some(id) {
            state.active_tab_id = state.tabs.first().map(|t| t.id);
        }
        Ok(removed.panes.into_iter().filter_map(|p| p.session_id).collect())
    }

    pub fn create_pane(&self, tab_id: TabId, spec: PaneSpec) -> Result<Pane, WorkspaceError> {
        let mut state = self.state.lock().expect("workspace mutex");
        let tab = state
            .tabs
            .iter_mut()
            .find(|t| t.id == tab_id)
            .ok_or(WorkspaceError::TabNotFound(tab_id))?;
        let pane = Pane {
            id: PaneId::new(),
            pane_type: spec.pane_type,
            sub_type: spec.sub_type,
            session_id: None,
        };
        tab.panes.push(pane.clone());
        Ok(pane)
    }

    /// Returns the session id that was bound to the removed pane, if any.
    pub fn delete_pane(&self, pane_id: PaneId) -> Result<Option<SessionId>, WorkspaceError> {
        let mut state = self.state.lock().expect("workspace mutex");
        for tab in state.tabs.iter_mut() {
            if let Some(idx) = tab.panes.iter().position(|p| p.id == pane_id) {
                let pane = tab.panes.remove(idx);
                return Ok(pane.session_id);
            }
        }
        Err(WorkspaceError::PaneNotFound(pane_id))
    }

    /// Idempotent: used during resume to stitch a replayed pane to a retained
    /// session, or during creation to bind a freshly spawned one.
    pub fn bind_pane_to_session(
        &self,
        pane_id: PaneId,
        session_id: SessionId,
    ) -> Result<(), WorkspaceError> {
        let mut state = self.state.lock().expect("workspace mutex");
        for tab in state.tabs.iter_mut() {
            if let Some(pane) = tab.panes.iter_mut().find(|p| p.id == pane_id) {
                pane.session_id = Some(session_id);
                return Ok(());
            }
        }
        Err(WorkspaceError::PaneNotFound(pane_id))
    }

    pub fn find_pane_session(&self, pane_id: PaneId) -> Option<SessionId> {
        let state = self.state.lock().expect("workspace mutex");
        state
            .tabs
            .iter()
            .flat_map(|t| t.panes.iter())
            .find(|p| p.id == pane_id)
            .and_then(|p| p.session_id)
    }
}

/// A lightweight lookup table from pane id to containing tab id, rebuilt on demand
/// by callers that need it (e.g. `resume_workspace`'s rebuild bookkeeping). Kept
/// separate from `Workspace` itself so the hot path never builds it unnecessarily.
pub fn index_panes_by_tab(snapshot: &WorkspaceSnapshot) -> HashMap<PaneId, TabId> {
    let mut map = HashMap::new();
    for tab in &snapshot.tabs {
        for pane in &tab.panes {
            map.insert(pane.id, tab.id);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(title: &str) -> TabSpec {
        TabSpec {
            title: title.to_string(),
            tab_type: TabType::Terminal,
            sub_type: None,
            layout: "single".to_string(),
        }
    }

    #[test]
    fn create_tab_mints_server_side_ids() {
        let ws = Workspace::new();
        let tab = ws.create_tab(spec("shell"), true);
        assert_eq!(tab.panes.len(), 1);
        let snapshot = ws.snapshot();
        assert_eq!(snapshot.tabs.len(), 1);
        assert_eq!(snapshot.active_tab_id, Some(tab.id));
    }

    #[test]
    fn create_then_delete_tab_returns_to_prior_shape() {
        let ws = Workspace::new();
        let before = ws.snapshot().tabs.len();
        let tab = ws.create_tab(spec("scratch"), false);
        ws.delete_tab(tab.id).expect("delete succeeds");
        let after = ws.snapshot().tabs.len();
        assert_eq!(before, after);
    }

    #[test]
    fn delete_tab_reports_bound_sessions_for_cleanup() {
        let ws = Workspace::new();
        let tab = ws.create_tab(spec("shell"), true);
        let pane_id = tab.panes[0].id;
        let sid = SessionId::new();
        ws.bind_pane_to_session(pane_id, sid).expect("bind succeeds");
        let closed = ws.delete_tab(tab.id).expect("delete succeeds");
        assert_eq!(closed, vec![sid]);
    }

    #[test]
    fn bind_pane_to_session_is_idempotent() {
        let ws = Workspace::new();
        let tab = ws.create_tab(spec("shell"), true);
        let pane_id = tab.panes[0].id;
        let sid = SessionId::new();
        ws.bind_pane_to_session(pane_id, sid).unwrap();
        ws.bind_pane_to_session(pane_id, sid).unwrap();
        assert_eq!(ws.find_pane_session(pane_id), Some(sid));
    }

    #[test]
    fn create_pane_rejects_unknown_tab() {
        let ws = Workspace::new();
        let result = ws.create_pane(
            TabId::new(),
            PaneSpec {
                pane_type: TabType::Terminal,
                sub_type: None,
            },
        );
        assert!(matches!(result, Err(WorkspaceError::TabNotFound(_))));
    }

    #[test]
    fn delete_pane_unknown_is_error() {
        let ws = Workspace::new();
        assert!(matches!(
            ws.delete_pane(PaneId::new()),
            Err(WorkspaceError::PaneNotFound(_))
        ));
    }
}
