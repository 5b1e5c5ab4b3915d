//! Status notifications

use crate::error::Result;
use crate::policy::{PolicySnapshot, PolicySource};
use async_trait::async_trait;

/// Posts status notifications on behalf of the service
#[async_trait]
pub trait NotificationPresenter: Send + Sync {
    /// Post a notification tied to foreground-service promotion
    async fn post_foreground(
        &self,
        active: bool,
        hide_disconnect: bool,
        exit_node_name: Option<String>,
    ) -> Result<()>;

    /// Post a plain notification when the process was not started in a
    /// foreground context
    async fn post_background(
        &self,
        hide_disconnect: bool,
        exit_node_name: Option<String>,
    ) -> Result<()>;
}

/// Values a notification is rendered from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationContent {
    /// The admin forces the tunnel on, so no disconnect action is offered
    pub hide_disconnect: bool,
    pub exit_node_name: Option<String>,
}

impl NotificationContent {
    pub fn from_snapshot(snapshot: &PolicySnapshot) -> Self {
        Self {
            hide_disconnect: snapshot.force_enabled,
            exit_node_name: snapshot.exit_node.display_name(),
        }
    }

    /// Read the force-enabled flag and the exit-node view from `source`.
    ///
    /// The exit node name comes from a single prefs and network map read.
    pub async fn read(source: &dyn PolicySource) -> Self {
        let hide_disconnect = source.read_force_enabled().await.unwrap_or_else(|e| {
            log::warn!("Ignoring force-enabled flag: {e}");
            false
        });
        let exit_node_name = match source.read_exit_node_view().await {
            Ok(view) => view.display_name(),
            Err(e) => {
                log::warn!("Ignoring exit node view: {e}");
                None
            }
        };
        Self {
            hide_disconnect,
            exit_node_name,
        }
    }
}

/// Presenter that writes notifications to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPresenter;

#[async_trait]
impl NotificationPresenter for LogPresenter {
    async fn post_foreground(
        &self,
        active: bool,
        hide_disconnect: bool,
        exit_node_name: Option<String>,
    ) -> Result<()> {
        let state = if active { "Connected" } else { "Connecting" };
        log::info!(
            "[notification] {state}{}{}",
            describe_exit_node(exit_node_name.as_deref()),
            if hide_disconnect { " (managed)" } else { "" }
        );
        Ok(())
    }

    async fn post_background(
        &self,
        hide_disconnect: bool,
        exit_node_name: Option<String>,
    ) -> Result<()> {
        log::info!(
            "[notification] VPN on{}{}",
            describe_exit_node(exit_node_name.as_deref()),
            if hide_disconnect { " (managed)" } else { "" }
        );
        Ok(())
    }
}

fn describe_exit_node(name: Option<&str>) -> String {
    name.map(|n| format!(" via exit node {n}")).unwrap_or_default()
}
