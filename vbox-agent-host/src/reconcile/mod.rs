//! Device reconciliation loop
//!
//! Every tick the inventory is rebuilt from the hypervisor and diffed against
//! the previous tick. New ports are bound to their host interface and reported
//! up, vanished ports are reported down. Any failure switches the next tick to
//! resync mode, which rebinds every known port and retries earlier removals.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::{AgentConfig, NetworkMappings};
use crate::error::VBoxResult;
use crate::inventory::NetworkInventory;
use crate::plugin_rpc::{DeviceDetails, PluginApi};

pub const TYPE_FLAT: &str = "flat";
pub const TYPE_LOCAL: &str = "local";

/// Port ids seen by one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub current: BTreeSet<String>,
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl DeviceSnapshot {
    /// Diff `current` against the previous tick
    ///
    /// In resync mode every current port counts as added, and removals that
    /// may have failed before are retried.
    pub fn diff(
        previous: Option<&DeviceSnapshot>,
        current: BTreeSet<String>,
        resync: bool,
    ) -> Self {
        let empty = DeviceSnapshot::default();
        let resync = resync || previous.is_none();
        let previous = previous.unwrap_or(&empty);

        let (added, removed) = if resync {
            let removed = previous
                .removed
                .union(&previous.current)
                .filter(|id| !current.contains(*id))
                .cloned()
                .collect();
            (current.clone(), removed)
        } else {
            (
                current.difference(&previous.current).cloned().collect(),
                previous.current.difference(&current).cloned().collect(),
            )
        };

        DeviceSnapshot {
            current,
            added,
            removed,
        }
    }

    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Keeps VM adapters in line with the control plane's port bindings
pub struct ReconciliationLoop {
    inventory: NetworkInventory,
    plugin: Arc<dyn PluginApi>,
    mappings: NetworkMappings,
    local_network: String,
    polling_interval: Duration,
    agent_id: String,
    host: String,
}

impl ReconciliationLoop {
    pub fn new(
        config: &AgentConfig,
        inventory: NetworkInventory,
        plugin: Arc<dyn PluginApi>,
        agent_id: &str,
    ) -> Self {
        let mappings = NetworkMappings::parse(&config.agent.physical_network_mappings);
        debug!("{} physical network mappings loaded", mappings.len());

        Self {
            inventory,
            plugin,
            mappings,
            local_network: config.agent.local_network.clone(),
            polling_interval: config.agent.polling_interval(),
            agent_id: agent_id.to_string(),
            host: config.agent.host.clone(),
        }
    }

    /// Host interface a port of this network should be attached to
    pub fn interface_name(&self, network_type: &str, physical_network: Option<&str>) -> String {
        if network_type == TYPE_LOCAL {
            self.local_network.clone()
        } else {
            self.mappings.interface_for(physical_network)
        }
    }

    pub async fn scan_devices(
        &mut self,
        previous: Option<&DeviceSnapshot>,
        resync: bool,
    ) -> VBoxResult<DeviceSnapshot> {
        self.inventory.refresh().await?;
        Ok(DeviceSnapshot::diff(previous, self.inventory.devices(), resync))
    }

    /// Bind one port; `Ok(false)` when the details are rejected
    async fn add_device(&self, details: &DeviceDetails) -> VBoxResult<bool> {
        let Some(port_id) = details.port_id.as_deref() else {
            debug!("The `port_id` is not provided for device {}", details.device);
            return Ok(false);
        };

        let network_type = details.network_type.as_deref().unwrap_or_default();
        if network_type != TYPE_FLAT {
            error!("Unsupported network type {:?} for port {}", network_type, port_id);
            return Ok(false);
        }

        if !self.inventory.device_exists(port_id) {
            warn!("No port {} defined on agent.", port_id);
            return Ok(false);
        }

        let interface = self.interface_name(network_type, details.physical_network.as_deref());
        if let Some(adapter) = self.inventory.device(port_id) {
            debug!(
                "Binding port {} to {}: adapter {} of `{}` ({}) is {} {} on {:?}, cable connected: {:?}",
                port_id,
                interface,
                adapter.index,
                adapter.instance,
                adapter.state.as_str(),
                adapter.nic_type.as_deref().unwrap_or("unknown"),
                adapter.mode.as_str(),
                adapter
                    .bridge_adapter
                    .as_deref()
                    .or(adapter.hostonly_adapter.as_deref()),
                adapter.cable_connected
            );
        }
        self.inventory.setup_device(port_id, &interface).await?;
        Ok(true)
    }

    /// Returns whether a resync is needed
    pub async fn treat_devices_added(&self, devices: &BTreeSet<String>) -> bool {
        debug!("Treat devices {:?} added.", devices);
        let devices: Vec<String> = devices.iter().cloned().collect();

        let details_list = match self
            .plugin
            .get_devices_details(&devices, &self.agent_id)
            .await
        {
            Ok(details_list) => details_list,
            Err(e) => {
                warn!("Unable to get ports details for devices {:?}: {:#}", devices, e);
                return true;
            }
        };

        let mut resync = false;
        for details in &details_list {
            debug!("Treat device: {:?}", details);
            match self.add_device(details).await {
                Ok(true) => info!("Port {} updated. Details: {:?}", details.device, details),
                Ok(false) => {}
                Err(e) => {
                    error!(
                        "Fail to bind port {}: {}",
                        details.port_id.as_deref().unwrap_or(&details.device),
                        e
                    );
                    resync = true;
                    continue;
                }
            }

            if let Err(e) = self
                .plugin
                .update_device_up(&details.device, &self.agent_id, &self.host)
                .await
            {
                error!("Failed to report device {} up: {:#}", details.device, e);
                resync = true;
            }
        }

        resync
    }

    /// Returns whether a resync is needed
    pub async fn treat_devices_removed(&self, devices: &BTreeSet<String>) -> bool {
        debug!("Treat devices {:?} removed", devices);
        let mut resync = false;

        for device in devices {
            info!("Removing port {}", device);
            if let Err(e) = self
                .plugin
                .update_device_down(device, &self.agent_id, &self.host)
                .await
            {
                debug!("Removing port failed for device {}: {:#}", device, e);
                resync = true;
            }
        }

        resync
    }

    /// Added and removed ports are handled independently; either failing
    /// requests a resync
    pub async fn process_network_devices(&self, snapshot: &DeviceSnapshot) -> bool {
        let mut resync = false;

        if !snapshot.added.is_empty() {
            resync |= self.treat_devices_added(&snapshot.added).await;
        }

        if !snapshot.removed.is_empty() {
            resync |= self.treat_devices_removed(&snapshot.removed).await;
        }

        resync
    }

    /// One reconciliation pass; returns the snapshot and resync flag for the next tick
    pub async fn tick(
        &mut self,
        previous: Option<DeviceSnapshot>,
        resync: bool,
    ) -> (Option<DeviceSnapshot>, bool) {
        if resync {
            info!("Agent out of sync with plugin!");
        }

        let snapshot = match self.scan_devices(previous.as_ref(), resync).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Error: `{}` in agent loop. Devices info: {:?}", e, previous);
                return (previous, true);
            }
        };

        if !snapshot.has_changes() {
            return (Some(snapshot), false);
        }

        debug!("Agent loop found changes! {:?}", snapshot);
        let resync = self.process_network_devices(&snapshot).await;
        (Some(snapshot), resync)
    }

    /// Poll forever, one tick per polling interval
    pub async fn daemon_loop(&mut self) {
        info!("VBox agent daemon started!");
        let mut snapshot = None;
        let mut resync = true;

        loop {
            let start = Instant::now();
            (snapshot, resync) = self.tick(snapshot.take(), resync).await;

            // sleep till end of polling interval
            let elapsed = start.elapsed();
            if elapsed < self.polling_interval {
                tokio::time::sleep(self.polling_interval - elapsed).await;
            } else {
                debug!(
                    "Loop iteration exceeded interval ({:?} vs. {:?})!",
                    self.polling_interval, elapsed
                );
            }
        }
    }
}
