//! Observable service status

use std::fmt;
use uuid::Uuid;

/// Lifecycle status of the tunnel service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Stopped,
    Starting,
    Active,
    Stopping,
}

impl Status {
    /// Whether a connect attempt is in flight or established
    pub fn is_running(self) -> bool {
        matches!(self, Status::Starting | Status::Active)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Stopped => "stopped",
            Status::Starting => "starting",
            Status::Active => "active",
            Status::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Fully-formed view of the service published to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub session_id: Uuid,
    pub status: Status,
    pub want_running: bool,
    /// VPN permission has been prepared for this process
    pub prepared: bool,
    pub exit_node_name: Option<String>,
}

impl StatusSnapshot {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            status: Status::Stopped,
            want_running: false,
            prepared: false,
            exit_node_name: None,
        }
    }
}
