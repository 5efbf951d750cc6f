//! Global config singleton. Load settings.json once; every caller that needs tunables
//! calls `ensure_loaded()` so the first caller does the work, later callers get the
//! same instance. This carries no tunnel/IM credentials — the broker core is
//! self-contained and in-memory.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Root directory for config: settings.json lives next to the workspace Cargo.toml.
fn config_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("..")
}

static CONFIG: OnceLock<BrokerConfig> = OnceLock::new();

/// Tunables for the PTY Session Broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Session Buffer byte cap (default 500 KiB).
    pub scrollback_byte_cap: usize,
    /// Session Buffer line cap (default 5,000 lines).
    pub scrollback_line_cap: usize,
    /// How long a Closed* session's buffer is retained before the registry evicts it.
    pub retention_window: Duration,
    /// How often the registry sweeps for sessions past their retention window.
    pub eviction_sweep_interval: Duration,
    /// Deadline for a single PTY write before it fails with `WriteTimeout`.
    pub write_timeout: Duration,
    /// High-water mark for a client's outbound queue before it is dropped for `Overflow`.
    pub outbound_queue_capacity: usize,
    /// Per-message wire chunk ceiling for `terminal_output` (default 64 KiB).
    pub max_chunk_bytes: usize,
    /// Grace period between SIGHUP and SIGKILL when closing a PTY child.
    pub close_grace_period: Duration,
    /// When true (CLI `--unsecure`), Anonymous connections may write as if role User.
    pub open_mode: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            scrollback_byte_cap: crate::buffer::DEFAULT_BYTE_CAP,
            scrollback_line_cap: crate::buffer::DEFAULT_LINE_CAP,
            retention_window: Duration::from_secs(24 * 60 * 60),
            eviction_sweep_interval: Duration::from_secs(5 * 60),
            write_timeout: Duration::from_secs(5),
            outbound_queue_capacity: 256,
            max_chunk_bytes: 64 * 1024,
            close_grace_period: Duration::from_secs(3),
            open_mode: false,
        }
    }
}

/// Ensure config is loaded (idempotent). Loads settings.json on first call; returns the
/// same instance afterwards.
pub fn ensure_loaded() -> &'static BrokerConfig {
    CONFIG.get_or_init(|| {
        let path = config_root().join("settings.json");
        load_settings_from(&path)
    })
}

/// Like `ensure_loaded`, but lets the binary's CLI surface fold in an `--unsecure`
/// flag before the singleton is first initialized. A no-op on every call after the
/// first, same as `ensure_loaded` itself.
pub fn ensure_loaded_with_open_mode(open_mode: Option<bool>) -> &'static BrokerConfig {
    CONFIG.get_or_init(|| {
        let path = config_root().join("settings.json");
        let mut cfg = load_settings_from(&path);
        if let Some(v) = open_mode {
            cfg.open_mode = v;
        }
        cfg
    })
}

fn load_settings_from(path: &std::path::Path) -> BrokerConfig {
    let Ok(data) = std::fs::read_to_string(path) else {
        return BrokerConfig::default();
    };
    let Ok(root) = serde_json::from_str::<serde_json::Value>(&data) else {
        return BrokerConfig::default();
    };
    apply_overrides(BrokerConfig::default(), &root)
}

fn apply_overrides(mut cfg: BrokerConfig, root: &serde_json::Value) -> BrokerConfig {
    if let Some(v) = root.get("scrollback_byte_cap").and_then(|v| v.as_u64()) {
        cfg.scrollback_byte_cap = v as usize;
    }
    if let Some(v) = root.get("scrollback_line_cap").and_then(|v| v.as_u64()) {
        cfg.scrollback_line_cap = v as usize;
    }
    if let Some(v) = root.get("retention_window_secs").and_then(|v| v.as_u64()) {
        cfg.retention_window = Duration::from_secs(v);
    }
    if let Some(v) = root.get("eviction_sweep_interval_secs").and_then(|v| v.as_u64()) {
        cfg.eviction_sweep_interval = Duration::from_secs(v);
    }
    if let Some(v) = root.get("write_timeout_secs").and_then(|v| v.as_u64()) {
        cfg.write_timeout = Duration::from_secs(v);
    }
    if let Some(v) = root.get("outbound_queue_capacity").and_then(|v| v.as_u64()) {
        cfg.outbound_queue_capacity = v as usize;
    }
    if let Some(v) = root.get("max_chunk_bytes").and_then(|v| v.as_u64()) {
        cfg.max_chunk_bytes = v as usize;
    }
    if let Some(v) = root.get("open_mode").and_then(|v| v.as_bool()) {
        cfg.open_mode = v;
    }
    cfg
}
