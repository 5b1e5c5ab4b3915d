//! OS tunnel interface ownership
//!
//! The controller is the only owner of the interface handle. It is opened
//! once the engine confirms a connect and closed before `Stopped` is
//! published.

use crate::error::Result;
use crate::routing::RoutingPolicy;

pub mod tun_device;

pub use tun_device::TunInterface;

/// Handle to the OS tunnel interface
pub trait TunnelInterface: Send {
    /// Establish the interface for `policy`
    fn open(&mut self, policy: &RoutingPolicy) -> Result<()>;

    /// Tear the interface down; closing a closed interface is a no-op
    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;
}
