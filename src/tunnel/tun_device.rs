//! TUN device backed by the `tun` crate

use super::TunnelInterface;
use crate::config::InterfaceConfig;
use crate::error::Result;
use crate::routing::{AppFilter, RoutingPolicy};

/// Tunnel interface realised as a TUN device
pub struct TunInterface {
    config: InterfaceConfig,
    device: Option<tun::platform::Device>,
}

impl TunInterface {
    pub fn new(config: InterfaceConfig) -> Self {
        Self {
            config,
            device: None,
        }
    }

    pub fn interface_name(&self) -> &str {
        &self.config.interface_name
    }
}

impl TunnelInterface for TunInterface {
    fn open(&mut self, policy: &RoutingPolicy) -> Result<()> {
        if self.device.is_some() {
            log::debug!("TUN interface {} already open", self.config.interface_name);
            return Ok(());
        }

        let mut config = tun::Configuration::default();
        config
            .name(&self.config.interface_name)
            .address(self.config.address)
            .netmask(self.config.netmask)
            .mtu(i32::from(self.config.mtu))
            .up();

        let device = tun::create(&config)?;
        self.device = Some(device);

        let (mode, count) = match &policy.app_filter {
            AppFilter::AllowList(packages) => ("allow", packages.len()),
            AppFilter::DenyList(packages) => ("deny", packages.len()),
        };
        log::info!(
            "TUN interface {} up: {}/{} mtu {}, {} routes, {mode}-list of {count} apps",
            self.config.interface_name,
            self.config.address,
            self.config.netmask,
            self.config.mtu,
            policy.routes.len(),
        );
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(device) = self.device.take() {
            log::info!("Closing TUN interface {}", self.config.interface_name);
            drop(device);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }
}

impl Drop for TunInterface {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
