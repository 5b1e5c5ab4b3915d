//! Routing policy evaluation
//!
//! [`TunnelConfigBuilder::build`] turns a [`PolicySnapshot`] into the
//! [`RoutingPolicy`] handed to the tunnel engine. The result depends only
//! on the snapshot and the builder's fixed inputs, so the same snapshot
//! always yields an equal policy.

use crate::error::{LifecycleError, Result};
use crate::policy::PolicySnapshot;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Applications known to malfunction when their traffic is tunneled
pub const BUILTIN_EXCLUDED_PACKAGES: &[&str] = &[
    // RCS messaging rejects connections from VPN addresses
    "com.google.android.apps.messaging",
    // Android Auto
    "com.google.android.projection.gearhead",
    // Local cast discovery breaks
    "com.google.android.apps.chromecast.app",
    "com.google.stadia.android",
    // Pixel Buds companion
    "com.google.android.apps.wearables.maestro.companion",
];

lazy_static::lazy_static! {
    static ref PACKAGE_PATTERN: Regex =
        Regex::new(r"^[A-Za-z][A-Za-z0-9_]*(\.[A-Za-z][A-Za-z0-9_]*)+$").unwrap();
}

/// IP address family carried by the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// How the tunnel reports metered-ness to the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeteredMode {
    /// Metered iff the underlying network is metered
    InheritUnderlying,
}

/// Which applications' traffic is carried by the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AppFilter {
    /// Only these applications use the tunnel
    AllowList(BTreeSet<String>),
    /// Every application except these uses the tunnel
    DenyList(BTreeSet<String>),
}

impl AppFilter {
    pub fn packages(&self) -> &BTreeSet<String> {
        match self {
            AppFilter::AllowList(packages) | AppFilter::DenyList(packages) => packages,
        }
    }

    /// Whether traffic from `package` goes through the tunnel
    pub fn routes(&self, package: &str) -> bool {
        match self {
            AppFilter::AllowList(packages) => packages.contains(package),
            AppFilter::DenyList(packages) => !packages.contains(package),
        }
    }
}

/// Per-connection routing policy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingPolicy {
    pub address_families: Vec<AddressFamily>,
    /// Default routes, one per address family
    pub routes: Vec<IpNet>,
    /// `None` on platforms without the metered distinction
    pub metered: Option<MeteredMode>,
    /// Empty means all available networks
    pub underlying_networks: Vec<String>,
    pub app_filter: AppFilter,
}

impl RoutingPolicy {
    pub fn uses_all_networks(&self) -> bool {
        self.underlying_networks.is_empty()
    }
}

/// Validates application identifiers against the OS application registry
pub trait PackageRegistry: Send + Sync {
    fn validate(&self, package: &str) -> Result<()>;
}

/// Accepts any well-formed reverse-DNS application identifier
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternRegistry;

impl PackageRegistry for PatternRegistry {
    fn validate(&self, package: &str) -> Result<()> {
        if PACKAGE_PATTERN.is_match(package) {
            Ok(())
        } else {
            Err(LifecycleError::PackageValidation {
                package: package.to_string(),
                reason: "not a valid application identifier".to_string(),
            })
        }
    }
}

/// Accepts only identifiers from a known set of installed applications
#[derive(Debug, Clone, Default)]
pub struct InstalledPackages {
    packages: BTreeSet<String>,
}

impl InstalledPackages {
    pub fn new<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            packages: packages.into_iter().map(Into::into).collect(),
        }
    }
}

impl PackageRegistry for InstalledPackages {
    fn validate(&self, package: &str) -> Result<()> {
        if self.packages.contains(package) {
            Ok(())
        } else {
            Err(LifecycleError::PackageValidation {
                package: package.to_string(),
                reason: "not installed".to_string(),
            })
        }
    }
}

/// Builds a [`RoutingPolicy`] from policy snapshots
#[derive(Clone)]
pub struct TunnelConfigBuilder {
    builtin_exclusions: BTreeSet<String>,
    metered_supported: bool,
    registry: Arc<dyn PackageRegistry>,
}

impl TunnelConfigBuilder {
    pub fn new(registry: Arc<dyn PackageRegistry>) -> Self {
        Self {
            builtin_exclusions: BUILTIN_EXCLUDED_PACKAGES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            metered_supported: true,
            registry,
        }
    }

    /// Replace the built-in exclusion set
    pub fn with_builtin_exclusions<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.builtin_exclusions = packages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metered_support(mut self, supported: bool) -> Self {
        self.metered_supported = supported;
        self
    }

    pub fn build(&self, snapshot: &PolicySnapshot) -> RoutingPolicy {
        RoutingPolicy {
            address_families: vec![AddressFamily::Ipv4, AddressFamily::Ipv6],
            routes: vec![
                IpNet::V4(Ipv4Net::default()),
                IpNet::V6(Ipv6Net::default()),
            ],
            metered: self
                .metered_supported
                .then_some(MeteredMode::InheritUnderlying),
            underlying_networks: snapshot.underlying_networks.clone(),
            app_filter: self.app_filter(snapshot),
        }
    }

    fn app_filter(&self, snapshot: &PolicySnapshot) -> AppFilter {
        let included = parse_package_list(&snapshot.included_packages);
        if !included.is_empty() {
            let allowed = self.validated(included);
            if !allowed.is_empty() {
                if !snapshot.disallowed_packages.is_empty() {
                    log::debug!(
                        "Inclusion list set; ignoring {} user exclusions",
                        snapshot.disallowed_packages.len()
                    );
                }
                return AppFilter::AllowList(allowed);
            }
            // An empty allow list would carry no traffic at all
            log::warn!("No included package is valid; falling back to exclusions");
        }

        let excluded = self
            .builtin_exclusions
            .iter()
            .chain(snapshot.disallowed_packages.iter())
            .map(String::as_str);
        AppFilter::DenyList(self.validated(excluded))
    }

    fn validated<'a>(&self, packages: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        packages
            .into_iter()
            .filter(|package| match self.registry.validate(package) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Skipping package: {e}");
                    false
                }
            })
            .map(str::to_string)
            .collect()
    }
}

/// Split a comma-separated identifier list, trimming entries and dropping
/// empty ones
pub fn parse_package_list(list: &str) -> Vec<&str> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .collect()
}
