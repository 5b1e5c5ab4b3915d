//! Configuration module for the VPN lifecycle service
//!
//! This module provides TOML-based configuration parsing and validation.

use crate::environment::StaticEnvironment;
use crate::error::{LifecycleError, Result};
use crate::policy::PolicyValues;
use crate::routing::{PackageRegistry, PatternRegistry, BUILTIN_EXCLUDED_PACKAGES};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Path of the persisted run-intent file
    #[serde(default = "default_intent_path")]
    pub intent_path: String,
    /// Optional policy file re-read on every access; `[policy]` is used
    /// when absent
    pub policy_path: Option<String>,
    /// Platform distinguishes metered networks
    #[serde(default = "default_true")]
    pub metered_supported: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            intent_path: default_intent_path(),
            policy_path: None,
            metered_supported: true,
        }
    }
}

/// Routing policy inputs that are not policy-controlled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Applications always excluded in deny-list mode
    #[serde(default = "default_builtin_exclusions")]
    pub builtin_exclusions: Vec<String>,
    /// Installed application identifiers; when empty any well-formed
    /// identifier is accepted
    #[serde(default)]
    pub installed_packages: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            builtin_exclusions: default_builtin_exclusions(),
            installed_packages: Vec::new(),
        }
    }
}

/// TUN interface settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    #[serde(default = "default_interface_name")]
    pub interface_name: String,
    #[serde(default = "default_address")]
    pub address: Ipv4Addr,
    #[serde(default = "default_netmask")]
    pub netmask: Ipv4Addr,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            interface_name: default_interface_name(),
            address: default_address(),
            netmask: default_netmask(),
            mtu: default_mtu(),
        }
    }
}

/// Engine host settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Acknowledge connect requests locally instead of waiting on a real
    /// engine
    #[serde(default)]
    pub loopback: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub environment: StaticEnvironment,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub tunnel: InterfaceConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Static policy values
    #[serde(default)]
    pub policy: PolicyValues,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| LifecycleError::Config(format!("Failed to read config file: {e}")))?;

        <Self as FromStr>::from_str(&contents)
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| LifecycleError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.service.intent_path.trim().is_empty() {
            return Err(LifecycleError::Config(
                "Intent path cannot be empty".to_string(),
            ));
        }

        if matches!(&self.service.policy_path, Some(path) if path.trim().is_empty()) {
            return Err(LifecycleError::Config(
                "Policy path cannot be empty when set".to_string(),
            ));
        }

        if self.tunnel.interface_name.is_empty() {
            return Err(LifecycleError::Config(
                "Interface name cannot be empty".to_string(),
            ));
        }

        if self.tunnel.mtu < 576 || self.tunnel.mtu > 9000 {
            return Err(LifecycleError::Config(
                "MTU must be between 576 and 9000".to_string(),
            ));
        }

        for package in &self.routing.builtin_exclusions {
            PatternRegistry.validate(package).map_err(|e| {
                LifecycleError::Config(format!("Invalid built-in exclusion: {e}"))
            })?;
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = LifecycleError;

    fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| LifecycleError::Config(format!("Failed to parse TOML: {e}")))
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_intent_path() -> String {
    "vpnse-intent.toml".to_string()
}

fn default_builtin_exclusions() -> Vec<String> {
    BUILTIN_EXCLUDED_PACKAGES
        .iter()
        .map(|p| p.to_string())
        .collect()
}

fn default_interface_name() -> String {
    "vpnse0".to_string()
}

fn default_address() -> Ipv4Addr {
    Ipv4Addr::new(100, 64, 0, 2)
}

fn default_netmask() -> Ipv4Addr {
    Ipv4Addr::new(255, 192, 0, 0)
}

fn default_mtu() -> u16 {
    1280
}

fn default_log_level() -> String {
    "info".to_string()
}
