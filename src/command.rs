//! Command events and the host command bridge
//!
//! The host platform delivers four logical commands however its VPN
//! integration does it. [`CommandBridge`] is the adapter: it turns each
//! delivery into a [`CommandEvent`] and dispatches it on its own task, so
//! deliveries never wait on each other.

use crate::controller::LifecycleService;
use crate::error::{LifecycleError, Result};
use crate::policy::PolicySnapshot;
use crate::status::Status;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// The four logical commands of the OS surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Start,
    Stop,
    /// The OS withdrew VPN permission
    Revoke,
    /// The OS restarted the service without an explicit command
    SystemRestart,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Start => "start",
            CommandKind::Stop => "stop",
            CommandKind::Revoke => "revoke",
            CommandKind::SystemRestart => "system-restart",
        };
        f.write_str(name)
    }
}

impl FromStr for CommandKind {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" | "connect" => Ok(CommandKind::Start),
            "stop" | "disconnect" => Ok(CommandKind::Stop),
            "revoke" => Ok(CommandKind::Revoke),
            "restart" | "system-restart" | "always-on" => Ok(CommandKind::SystemRestart),
            other => Err(LifecycleError::UnknownCommand(other.to_string())),
        }
    }
}

/// A delivered command, optionally carrying the policy seen at dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    Start { snapshot: Option<PolicySnapshot> },
    Stop { snapshot: Option<PolicySnapshot> },
    Revoke { snapshot: Option<PolicySnapshot> },
    SystemRestart { snapshot: Option<PolicySnapshot> },
}

impl CommandEvent {
    pub fn new(kind: CommandKind, snapshot: Option<PolicySnapshot>) -> Self {
        match kind {
            CommandKind::Start => CommandEvent::Start { snapshot },
            CommandKind::Stop => CommandEvent::Stop { snapshot },
            CommandKind::Revoke => CommandEvent::Revoke { snapshot },
            CommandKind::SystemRestart => CommandEvent::SystemRestart { snapshot },
        }
    }

    pub fn start() -> Self {
        Self::new(CommandKind::Start, None)
    }

    pub fn stop() -> Self {
        Self::new(CommandKind::Stop, None)
    }

    pub fn revoke() -> Self {
        Self::new(CommandKind::Revoke, None)
    }

    pub fn system_restart() -> Self {
        Self::new(CommandKind::SystemRestart, None)
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            CommandEvent::Start { .. } => CommandKind::Start,
            CommandEvent::Stop { .. } => CommandKind::Stop,
            CommandEvent::Revoke { .. } => CommandKind::Revoke,
            CommandEvent::SystemRestart { .. } => CommandKind::SystemRestart,
        }
    }

    pub fn snapshot(&self) -> Option<&PolicySnapshot> {
        match self {
            CommandEvent::Start { snapshot }
            | CommandEvent::Stop { snapshot }
            | CommandEvent::Revoke { snapshot }
            | CommandEvent::SystemRestart { snapshot } => snapshot.as_ref(),
        }
    }
}

/// Dispatches host deliveries to a [`LifecycleService`]
#[derive(Clone)]
pub struct CommandBridge {
    service: Arc<dyn LifecycleService>,
}

impl CommandBridge {
    pub fn new(service: Arc<dyn LifecycleService>) -> Self {
        Self { service }
    }

    /// Dispatch `event` on a new task
    pub fn deliver(&self, event: CommandEvent) -> JoinHandle<Status> {
        let service = Arc::clone(&self.service);
        tokio::spawn(async move { service.handle_command(event).await })
    }

    /// Parse a textual command and dispatch it
    pub fn deliver_str(&self, command: &str) -> Result<JoinHandle<Status>> {
        let kind = command.parse::<CommandKind>()?;
        Ok(self.deliver(CommandEvent::new(kind, None)))
    }

    pub fn current_status(&self) -> Status {
        self.service.current_status()
    }
}
