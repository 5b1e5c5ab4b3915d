//! VPNSE Lifecycle - VPN service lifecycle controller
//!
//! This crate sits between an operating system's VPN subsystem and an
//! external tunnel engine. It receives start, stop, revoke and
//! system-restart commands, drives the tunnel up or down, computes the
//! per-connection split-tunnel routing policy and publishes an observable
//! status for UI and notification consumers.
//!
//! ## What This Crate Provides
//! - The lifecycle state machine ([`VpnLifecycleController`])
//! - Deterministic routing policy evaluation ([`TunnelConfigBuilder`])
//! - Persisted run intent, file-backed policy sources and TOML configuration
//! - A command bridge for host platform integrations
//! - TUN interface ownership
//!
//! ## What The Host Must Provide
//! - The tunnel engine behind [`TunnelEngineClient`]
//! - Notification rendering behind [`NotificationPresenter`]
//! - Permission and admin state behind [`Environment`]

pub mod command;
pub mod config;
pub mod controller;
pub mod engine;
pub mod environment;
pub mod error;
pub mod intent;
pub mod notification;
pub mod policy;
pub mod routing;
pub mod status;
pub mod tunnel;

pub use command::{CommandBridge, CommandEvent, CommandKind};
pub use config::Config;
pub use controller::{LifecycleService, ServiceContext, VpnLifecycleController};
pub use engine::{EngineReport, TunnelEngineClient};
pub use environment::Environment;
pub use error::{LifecycleError, Result};
pub use notification::NotificationPresenter;
pub use policy::{PolicySnapshot, PolicySource};
pub use routing::{AppFilter, RoutingPolicy, TunnelConfigBuilder};
pub use status::{Status, StatusSnapshot};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
