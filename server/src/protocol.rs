//! Wire event vocabulary. Named events with structured JSON payloads, carried
//! as WebSocket text frames. `data` fields are base64 so arbitrary PTY bytes survive
//! a JSON string round-trip exactly, including bytes that aren't valid UTF-8.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use termhub_core::session::SessionId;
use termhub_core::workspace::{Pane, Tab, TabId, TabType, WorkspaceSnapshot};

const B64: base64::engine::general_purpose::GeneralPurpose = base64::engine::general_purpose::STANDARD;

pub fn encode_data(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

pub fn decode_data(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    B64.decode(s)
}

/// Events a client may send. Tagged by `"type"`; unknown types deserialize to `Err`
/// at the dispatcher boundary, which answers with `InvalidRequest`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    #[serde(rename = "workspace_connect")]
    WorkspaceConnect { role: String },
    #[serde(rename = "workspace_get")]
    WorkspaceGet {},
    #[serde(rename = "tab_create")]
    TabCreate {
        #[serde(default)]
        workspace_id: Option<String>,
        title: String,
        #[serde(rename = "type")]
        tab_type: String,
        #[serde(default)]
        sub_type: Option<String>,
    },
    #[serde(rename = "tab_delete")]
    TabDelete { id: String },
    #[serde(rename = "pane_create")]
    PaneCreate {
        tab_id: String,
        #[serde(rename = "type")]
        pane_type: String,
        #[serde(default)]
        sub_type: Option<String>,
    },
    #[serde(rename = "pane_delete")]
    PaneDelete { id: String },
    #[serde(rename = "create_terminal")]
    CreateTerminal {
        cols: u16,
        rows: u16,
        #[serde(default)]
        tab_id: Option<String>,
        #[serde(default)]
        pane_id: Option<String>,
        #[serde(default)]
        sub_type: Option<String>,
        #[serde(default)]
        reconnect: Option<bool>,
    },
    #[serde(rename = "terminal_input")]
    TerminalInput { session: String, data: String },
    #[serde(rename = "terminal_resize")]
    TerminalResize { session: String, cols: u16, rows: u16 },
    #[serde(rename = "reconnect_session")]
    ReconnectSession { session: String },
    #[serde(rename = "resume_workspace")]
    ResumeWorkspace {
        workspace_id: String,
        tabs: Vec<ResumeTabSpec>,
    },
    #[serde(rename = "close_terminal")]
    CloseTerminal { session: String },
    /// Retired: recognized only so the dispatcher can answer with a
    /// pointed `InvalidRequest` instead of silently ignoring old clients.
    #[serde(rename = "resume_terminal")]
    ResumeTerminal {},
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeTabSpec {
    pub id: String,
    #[serde(default)]
    pub sub_type: Option<String>,
    pub panes: Vec<ResumePaneSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumePaneSpec {
    pub id: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WireTab {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub tab_type: &'static str,
    pub sub_type: Option<String>,
    pub panes: Vec<WirePane>,
    pub layout: String,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WirePane {
    pub id: String,
    #[serde(rename = "type")]
    pub pane_type: &'static str,
    pub sub_type: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WireWorkspace {
    pub tabs: Vec<WireTab>,
    pub active_tab_id: Option<String>,
}

fn tab_type_str(t: TabType) -> &'static str {
    match t {
        TabType::Terminal => "terminal",
        TabType::AiAgent => "ai-agent",
        TabType::LogMonitor => "log-monitor",
    }
}

impl From<&Pane> for WirePane {
    fn from(p: &Pane) -> Self {
        WirePane {
            id: p.id.to_string(),
            pane_type: tab_type_str(p.pane_type),
            sub_type: p.sub_type.clone(),
            session_id: p.session_id.map(|s| s.to_string()),
        }
    }
}

impl From<&Tab> for WireTab {
    fn from(t: &Tab) -> Self {
        WireTab {
            id: t.id.to_string(),
            title: t.title.clone(),
            tab_type: tab_type_str(t.tab_type),
            sub_type: t.sub_type.clone(),
            panes: t.panes.iter().map(WirePane::from).collect(),
            layout: t.layout.clone(),
        }
    }
}

impl From<&WorkspaceSnapshot> for WireWorkspace {
    fn from(s: &WorkspaceSnapshot) -> Self {
        WireWorkspace {
            tabs: s.tabs.iter().map(WireTab::from).collect(),
            active_tab_id: s.active_tab_id.map(|id| id.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ResumedTab {
    pub tab_id: String,
    pub panes: Vec<ResumedPane>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ResumedPane {
    pub pane_id: String,
    pub session_id: String,
}

/// Events the server may send. Tagged by `"type"` to match.
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "workspace_connected")]
    WorkspaceConnected { workspace: WireWorkspace },
    #[serde(rename = "workspace_data")]
    WorkspaceData { workspace: WireWorkspace },
    #[serde(rename = "tab_created")]
    TabCreated { tab: WireTab },
    #[serde(rename = "tab_deleted")]
    TabDeleted { id: String },
    #[serde(rename = "pane_created")]
    PaneCreated { pane: WirePane },
    #[serde(rename = "pane_deleted")]
    PaneDeleted { id: String },
    #[serde(rename = "workspace_error")]
    WorkspaceError { error: String },
    #[serde(rename = "terminal_ready")]
    TerminalReady {
        session: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tab_id: Option<String>,
        status: &'static str,
    },
    #[serde(rename = "terminal_error")]
    TerminalError {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    #[serde(rename = "terminal_output")]
    TerminalOutput { session: String, data: String },
    #[serde(rename = "terminal_closed")]
    TerminalClosed {
        session: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "session_reconnected")]
    SessionReconnected {
        session_id: String,
        history_lines: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        restored_from_buffer: Option<bool>,
    },
    #[serde(rename = "session_reconnect_error")]
    SessionReconnectError { error: String },
    #[serde(rename = "workspace_resumed")]
    WorkspaceResumed {
        workspace_id: String,
        resumed_tabs: Vec<ResumedTab>,
        created_tabs: Vec<ResumedTab>,
    },
}

/// Ceiling for a single `terminal_output` frame's `data` payload.
pub const MAX_CHUNK_BYTES: usize = 64 * 1024;

/// Split `data` into ordered chunks no larger than `max_chunk_bytes`, each becoming
/// its own `terminal_output` event so concatenation of the decoded `data` fields
/// equals the original payload.
pub fn chunk_output(session: SessionId, data: &[u8], max_chunk_bytes: usize) -> Vec<ServerEvent> {
    if data.is_empty() {
        return Vec::new();
    }
    data.chunks(max_chunk_bytes.max(1))
        .map(|chunk| ServerEvent::TerminalOutput {
            session: session.to_string(),
            data: encode_data(chunk),
        })
        .collect()
}
