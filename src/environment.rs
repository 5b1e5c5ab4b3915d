//! Host environment checks for implicit starts

use crate::error::{LifecycleError, Result};
use serde::{Deserialize, Serialize};

/// Facts about the host that gate an OS-initiated start
pub trait Environment: Send + Sync {
    /// The user has granted VPN permission to this process
    fn vpn_permission_granted(&self) -> bool;

    /// An administrator has disabled the VPN on this device
    fn admin_blocked(&self) -> bool;

    /// The OS is configured to keep this VPN always on
    fn always_on_enabled(&self) -> bool {
        false
    }
}

/// Check that an implicit start may proceed at all
pub fn check_eligible(environment: &dyn Environment) -> Result<()> {
    if !environment.vpn_permission_granted() {
        return Err(LifecycleError::IneligibleRestart(
            "VPN permission not granted".to_string(),
        ));
    }
    if environment.admin_blocked() {
        return Err(LifecycleError::IneligibleRestart(
            "blocked by administrator".to_string(),
        ));
    }
    Ok(())
}

/// Environment with fixed answers, loaded from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticEnvironment {
    #[serde(default = "default_true")]
    pub permission_granted: bool,
    #[serde(default)]
    pub admin_blocked: bool,
    #[serde(default)]
    pub always_on: bool,
}

impl Default for StaticEnvironment {
    fn default() -> Self {
        Self {
            permission_granted: true,
            admin_blocked: false,
            always_on: false,
        }
    }
}

impl Environment for StaticEnvironment {
    fn vpn_permission_granted(&self) -> bool {
        self.permission_granted
    }

    fn admin_blocked(&self) -> bool {
        self.admin_blocked
    }

    fn always_on_enabled(&self) -> bool {
        self.always_on
    }
}

fn default_true() -> bool {
    true
}
