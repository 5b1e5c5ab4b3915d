//! Policy sources and immutable policy snapshots
//!
//! A [`PolicySource`] exposes admin- and user-controlled values that may
//! change at any time. The controller never holds a live subscription; it
//! reads a [`PolicySnapshot`] once per decision point and works from that.

use crate::error::{LifecycleError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Local preferences relevant to status presentation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prefs {
    /// Stable id of the selected exit node, if any
    #[serde(default)]
    pub exit_node_id: Option<String>,
}

/// A peer as seen in the network map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    /// Fully-qualified node name
    pub name: String,
    /// Short name as shown to users
    #[serde(default)]
    pub computed_name: Option<String>,
}

impl Peer {
    /// Name shown to the user: the computed name, else the first label of
    /// the fully-qualified name
    pub fn display_name(&self) -> String {
        match self.computed_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self
                .name
                .split('.')
                .next()
                .unwrap_or(self.name.as_str())
                .to_string(),
        }
    }
}

/// Most recent network map pushed by the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMap {
    #[serde(default)]
    pub peers: Vec<Peer>,
}

/// Prefs and network map read together as one consistent pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitNodeView {
    #[serde(default)]
    pub prefs: Prefs,
    #[serde(default)]
    pub netmap: Option<NetworkMap>,
}

impl ExitNodeView {
    /// Display name of the selected exit node.
    ///
    /// Returns `None` when no exit node is selected, no network map is
    /// available yet, or the selected node is not in the map.
    pub fn display_name(&self) -> Option<String> {
        let id = self.prefs.exit_node_id.as_deref()?;
        let netmap = self.netmap.as_ref()?;
        netmap
            .peers
            .iter()
            .find(|peer| peer.id == id)
            .map(Peer::display_name)
    }
}

/// Read-only, possibly-changing configuration values
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Admin flag forcing the tunnel on (hides the disconnect action)
    async fn read_force_enabled(&self) -> Result<bool>;

    /// Comma-separated application identifiers to route exclusively
    async fn read_included_packages(&self) -> Result<String>;

    /// Application identifiers the user chose to exclude
    async fn read_disallowed_packages(&self) -> Result<BTreeSet<String>>;

    /// Underlying networks the tunnel should use; empty means all available
    async fn read_underlying_networks(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Prefs and network map, read as a single pair
    async fn read_exit_node_view(&self) -> Result<ExitNodeView> {
        Ok(ExitNodeView::default())
    }
}

/// Immutable snapshot of every policy value a decision needs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySnapshot {
    pub force_enabled: bool,
    pub included_packages: String,
    pub disallowed_packages: BTreeSet<String>,
    pub underlying_networks: Vec<String>,
    pub exit_node: ExitNodeView,
}

impl PolicySnapshot {
    /// Read a snapshot from `source`.
    ///
    /// A failed read of any value is treated as "no override" for that
    /// value; this never fails.
    pub async fn read(source: &dyn PolicySource) -> Self {
        Self {
            force_enabled: or_default(source.read_force_enabled().await, "force-enabled flag"),
            included_packages: or_default(
                source.read_included_packages().await,
                "included packages",
            ),
            disallowed_packages: or_default(
                source.read_disallowed_packages().await,
                "disallowed packages",
            ),
            underlying_networks: or_default(
                source.read_underlying_networks().await,
                "underlying networks",
            ),
            exit_node: or_default(source.read_exit_node_view().await, "exit node view"),
        }
    }
}

fn or_default<T: Default>(result: Result<T>, what: &str) -> T {
    result.unwrap_or_else(|e| {
        log::warn!("Ignoring {what}: {e}");
        T::default()
    })
}

/// Serialized form of a policy source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyValues {
    #[serde(default)]
    pub force_enabled: bool,
    #[serde(default)]
    pub included_packages: String,
    #[serde(default)]
    pub disallowed_packages: BTreeSet<String>,
    #[serde(default)]
    pub underlying_networks: Vec<String>,
    #[serde(default)]
    pub prefs: Prefs,
    #[serde(default)]
    pub netmap: Option<NetworkMap>,
}

impl PolicyValues {
    fn exit_node_view(&self) -> ExitNodeView {
        ExitNodeView {
            prefs: self.prefs.clone(),
            netmap: self.netmap.clone(),
        }
    }
}

/// In-memory policy source whose values can be replaced at runtime
#[derive(Debug, Default)]
pub struct StaticPolicySource {
    values: RwLock<PolicyValues>,
}

impl StaticPolicySource {
    pub fn new(values: PolicyValues) -> Self {
        Self {
            values: RwLock::new(values),
        }
    }

    /// Replace all values
    pub fn update(&self, values: PolicyValues) -> Result<()> {
        let mut guard = self
            .values
            .write()
            .map_err(|_| LifecycleError::PolicyRead("policy lock poisoned".to_string()))?;
        *guard = values;
        Ok(())
    }

    fn with<T>(&self, read: impl FnOnce(&PolicyValues) -> T) -> Result<T> {
        let guard = self
            .values
            .read()
            .map_err(|_| LifecycleError::PolicyRead("policy lock poisoned".to_string()))?;
        Ok(read(&guard))
    }
}

#[async_trait]
impl PolicySource for StaticPolicySource {
    async fn read_force_enabled(&self) -> Result<bool> {
        self.with(|v| v.force_enabled)
    }

    async fn read_included_packages(&self) -> Result<String> {
        self.with(|v| v.included_packages.clone())
    }

    async fn read_disallowed_packages(&self) -> Result<BTreeSet<String>> {
        self.with(|v| v.disallowed_packages.clone())
    }

    async fn read_underlying_networks(&self) -> Result<Vec<String>> {
        self.with(|v| v.underlying_networks.clone())
    }

    async fn read_exit_node_view(&self) -> Result<ExitNodeView> {
        self.with(PolicyValues::exit_node_view)
    }
}

/// Policy source backed by a TOML file that is re-read on every access
#[derive(Debug, Clone)]
pub struct FilePolicySource {
    path: PathBuf,
}

impl FilePolicySource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn load(&self) -> Result<PolicyValues> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            LifecycleError::PolicyRead(format!("{}: {e}", self.path.display()))
        })?;
        toml::from_str(&contents).map_err(|e| {
            LifecycleError::PolicyRead(format!("malformed {}: {e}", self.path.display()))
        })
    }
}

#[async_trait]
impl PolicySource for FilePolicySource {
    async fn read_force_enabled(&self) -> Result<bool> {
        Ok(self.load().await?.force_enabled)
    }

    async fn read_included_packages(&self) -> Result<String> {
        Ok(self.load().await?.included_packages)
    }

    async fn read_disallowed_packages(&self) -> Result<BTreeSet<String>> {
        Ok(self.load().await?.disallowed_packages)
    }

    async fn read_underlying_networks(&self) -> Result<Vec<String>> {
        Ok(self.load().await?.underlying_networks)
    }

    async fn read_exit_node_view(&self) -> Result<ExitNodeView> {
        Ok(self.load().await?.exit_node_view())
    }
}
