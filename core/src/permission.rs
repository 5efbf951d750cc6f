//! Permission Policy: role and ownership checks gating write/resize/close operations.
//! Pure, side-effect-free so handlers and tests can evaluate it without touching a session.

use std::collections::HashSet;

/// Coarse capability level applied at the connection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Role {
    Anonymous,
    Viewer,
    User,
    Owner,
    Supervisor,
}

impl Role {
    pub fn from_wire(s: &str) -> Option<Role> {
        match s {
            "Anonymous" => Some(Role::Anonymous),
            "Viewer" => Some(Role::Viewer),
            "User" => Some(Role::User),
            "Owner" => Some(Role::Owner),
            "Supervisor" => Some(Role::Supervisor),
            _ => None,
        }
    }
}

pub type Identity = String;

/// Per-session access control attributes consulted by the policy.
#[derive(Debug, Clone, Default)]
pub struct SessionAcl {
    pub owner: Identity,
    pub allowed_identities: HashSet<Identity>,
    pub allow_any_authenticated: bool,
}

impl SessionAcl {
    pub fn new(owner: Identity) -> Self {
        Self {
            owner,
            allowed_identities: HashSet::new(),
            allow_any_authenticated: false,
        }
    }
}

/// A connection's standing when it attempts a gated operation.
#[derive(Debug, Clone)]
pub struct Requester {
    pub identity: Identity,
    pub role: Role,
}

/// Evaluate the write/resize/close gate. Rules are evaluated in order; first match wins.
/// `open_mode` is the deployment-wide flag (CLI `--unsecure`) that treats Anonymous
/// connections as implicitly writable.
pub fn can_write(requester: &Requester, acl: &SessionAcl, open_mode: bool) -> bool {
    if requester.role == Role::Anonymous {
        return open_mode;
    }
    if requester.role == Role::Viewer {
        return false;
    }
    if requester.identity == acl.owner {
        return true;
    }
    if matches!(requester.role, Role::Supervisor | Role::Owner) {
        return true;
    }
    if acl.allowed_identities.contains(&requester.identity) {
        return true;
    }
    if acl.allow_any_authenticated && !matches!(requester.role, Role::Viewer | Role::Anonymous) {
        return true;
    }
    false
}
