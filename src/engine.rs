//! Tunnel engine client interface

use crate::error::{LifecycleError, Result};
use crate::routing::RoutingPolicy;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Client side of the external tunnel engine.
///
/// Both requests are fire-and-forget: an `Ok` only means the engine
/// accepted the request. Outcomes come back as [`EngineReport`]s.
pub trait TunnelEngineClient: Send + Sync {
    fn request_connect(&self, session_id: Uuid, policy: &RoutingPolicy) -> Result<()>;

    fn request_disconnect(&self, session_id: Uuid) -> Result<()>;
}

/// Asynchronous status reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineReport {
    /// The last connect request was honored
    Connected,
    /// The engine could not bring the tunnel up or lost it
    Failed(String),
    /// The engine went down on its own
    Disconnected,
}

/// Request as seen by the engine host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineRequest {
    Connect {
        session_id: Uuid,
        policy: RoutingPolicy,
    },
    Disconnect {
        session_id: Uuid,
    },
}

/// Engine client forwarding requests over a channel to the engine host
#[derive(Debug, Clone)]
pub struct ChannelEngineClient {
    tx: mpsc::UnboundedSender<EngineRequest>,
}

impl ChannelEngineClient {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, request: EngineRequest) -> Result<()> {
        self.tx.send(request).map_err(|e| match e.0 {
            EngineRequest::Connect { .. } => {
                LifecycleError::EngineConnect("engine host is gone".to_string())
            }
            EngineRequest::Disconnect { .. } => {
                LifecycleError::EngineDisconnect("engine host is gone".to_string())
            }
        })
    }
}

impl TunnelEngineClient for ChannelEngineClient {
    fn request_connect(&self, session_id: Uuid, policy: &RoutingPolicy) -> Result<()> {
        log::debug!("Requesting engine connect for session {session_id}");
        self.send(EngineRequest::Connect {
            session_id,
            policy: policy.clone(),
        })
    }

    fn request_disconnect(&self, session_id: Uuid) -> Result<()> {
        log::debug!("Requesting engine disconnect for session {session_id}");
        self.send(EngineRequest::Disconnect { session_id })
    }
}
