//! Port ↔ adapter inventory
//!
//! Rebuilt from scratch on every [`NetworkInventory::refresh`]:
//! - `list vms` enumerates the registered VMs
//! - each VM's description carries `{"network": {<mac>: <port_id>}}`
//! - `showvminfo` adapter fields are matched to ports by MAC address
//!
//! The inventory also applies a port's binding to its adapter, offline through
//! `modifyvm` when the VM is powered off, live through `controlvm` otherwise.

use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

use crate::config::{OfflineFallback, VirtualBoxConfig};
use crate::error::{VBoxError, VBoxResult};
use crate::vboxmanage::{ControlField, ListCategory, ModifyField, VBoxManage, VmInfo, ON};

/// Adapters reported per VM (`nic1` .. `nic8`)
pub const MAX_ADAPTERS: u8 = 8;

const VM_STATE: &str = "VMState";
const VM_DESCRIPTION: &str = "description";

/// Adapter attachment mode; `none` (disabled) is not a mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NicMode {
    Null,
    Nat,
    NatNetwork,
    Bridged,
    Intnet,
    HostOnly,
    Generic,
    Other(String),
}

impl NicMode {
    pub fn parse(value: &str) -> Self {
        match value {
            "null" => NicMode::Null,
            "nat" => NicMode::Nat,
            "natnetwork" => NicMode::NatNetwork,
            "bridged" => NicMode::Bridged,
            "intnet" => NicMode::Intnet,
            "hostonly" => NicMode::HostOnly,
            "generic" => NicMode::Generic,
            other => NicMode::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            NicMode::Null => "null",
            NicMode::Nat => "nat",
            NicMode::NatNetwork => "natnetwork",
            NicMode::Bridged => "bridged",
            NicMode::Intnet => "intnet",
            NicMode::HostOnly => "hostonly",
            NicMode::Generic => "generic",
            NicMode::Other(mode) => mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmState {
    PowerOff,
    Running,
    Other(String),
}

impl VmState {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("poweroff") => VmState::PowerOff,
            Some("running") => VmState::Running,
            Some(other) => VmState::Other(other.to_string()),
            None => VmState::Other("unknown".to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            VmState::PowerOff => "poweroff",
            VmState::Running => "running",
            VmState::Other(state) => state,
        }
    }
}

/// One VM adapter bound to a control-plane port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterRecord {
    pub index: u8,
    pub mac: String,
    pub mode: NicMode,
    pub nic_type: Option<String>,
    pub cable_connected: Option<bool>,
    pub bridge_adapter: Option<String>,
    pub hostonly_adapter: Option<String>,
    pub instance: String,
    pub state: VmState,
}

#[derive(Debug, Deserialize)]
struct Description {
    network: HashMap<String, String>,
}

/// Upper-case hex digits only, so `08:00:27:ab:cd:ef` == `080027ABCDEF`
pub fn normalize_mac(mac: &str) -> String {
    mac.chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// VM names from `list vms` lines of the form `"name" {uuid}`
pub fn parse_vm_names(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (name, uuid) = line.rsplit_once(' ')?;
            if !(uuid.starts_with('{') && uuid.ends_with('}')) {
                return None;
            }
            let name = name.trim().trim_matches('"');
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

/// MAC → port id entries of a VM description
fn parse_description(description: &str) -> Result<HashMap<String, String>, serde_json::Error> {
    let description: Description = serde_json::from_str(description)?;
    Ok(description
        .network
        .into_iter()
        .map(|(mac, port_id)| (normalize_mac(&mac), port_id))
        .collect())
}

/// Typed adapters of a VM, by explicit iteration over the adapter fields
fn read_adapters(info: &VmInfo, instance: &str, state: &VmState) -> Vec<AdapterRecord> {
    (1..=MAX_ADAPTERS)
        .filter_map(|index| {
            let field = |name: &str| info.get(&format!("{}{}", name, index)).map(str::to_string);

            let mac = field("macaddress")?;
            // `nic<i>="none"` parses as absent
            let Some(mode) = field("nic") else {
                if info.contains_key(&format!("nic{}", index)) {
                    debug!("Adapter {} of `{}` is disabled", index, instance);
                }
                return None;
            };
            let mode = NicMode::parse(&mode);

            Some(AdapterRecord {
                index,
                mac: normalize_mac(&mac),
                mode,
                nic_type: field("nictype"),
                cable_connected: field("cableconnected").map(|value| value == ON),
                bridge_adapter: field("bridgeadapter"),
                hostonly_adapter: field("hostonlyadapter"),
                instance: instance.to_string(),
                state: state.clone(),
            })
        })
        .collect()
}

/// Cached port → adapter correlation plus the reconfiguration policy
pub struct NetworkInventory {
    vbox: VBoxManage,
    nic_type: String,
    use_local_network: bool,
    offline_fallback: OfflineFallback,
    devices: HashMap<String, AdapterRecord>,
}

impl NetworkInventory {
    pub fn new(config: &VirtualBoxConfig, vbox: VBoxManage) -> Self {
        Self {
            vbox,
            nic_type: config.nic_type.clone(),
            use_local_network: config.use_local_network,
            offline_fallback: config.offline_fallback,
            devices: HashMap::new(),
        }
    }

    /// Whether adapters are attached host-only instead of bridged
    pub fn use_local_network(&self) -> bool {
        self.use_local_network
    }

    /// Rebuild the cache from the hypervisor
    ///
    /// Bad VMs are skipped; only a failing `list vms` fails the refresh, in
    /// which case the previous cache is kept.
    pub async fn refresh(&mut self) -> VBoxResult<()> {
        let listing = self.vbox.list(ListCategory::Vms).await?;

        let mut mac_index = HashMap::new();
        let mut devices = HashMap::new();
        for instance in parse_vm_names(&listing) {
            self.inspect_instance(&instance, &mut mac_index, &mut devices)
                .await;
        }

        debug!(
            "Inventory refreshed: {} devices, {} known MACs",
            devices.len(),
            mac_index.len()
        );
        self.devices = devices;
        Ok(())
    }

    async fn inspect_instance(
        &self,
        instance: &str,
        mac_index: &mut HashMap<String, String>,
        devices: &mut HashMap<String, AdapterRecord>,
    ) {
        let info = match self.vbox.show_vm_info(instance).await {
            Ok(info) => info,
            Err(VBoxError::InstanceNotFound { .. }) => {
                warn!("Failed to get specification for `{}`", instance);
                return;
            }
            Err(e) => {
                warn!("Skipping `{}` for this cycle: {}", instance, e);
                return;
            }
        };

        let Some(description) = info.get(VM_DESCRIPTION) else {
            debug!("No description for `{}`", instance);
            return;
        };
        match parse_description(description) {
            Ok(entries) => mac_index.extend(entries),
            Err(e) => {
                warn!(
                    "Invalid description for `{}`: {} ({})",
                    instance, description, e
                );
                return;
            }
        }

        let state = VmState::parse(info.get(VM_STATE));
        for adapter in read_adapters(&info, instance, &state) {
            if let Some(port_id) = mac_index.get(&adapter.mac) {
                debug!(
                    "Port {} is adapter {} of `{}`",
                    port_id, adapter.index, instance
                );
                devices.insert(port_id.clone(), adapter);
            }
        }
    }

    /// Test whether a device exists
    pub fn device_exists(&self, port_id: &str) -> bool {
        self.devices.contains_key(port_id)
    }

    /// Port ids of all known devices
    pub fn devices(&self) -> BTreeSet<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn device(&self, port_id: &str) -> Option<&AdapterRecord> {
        self.devices.get(port_id)
    }

    fn nic_mode(&self) -> NicMode {
        if self.use_local_network {
            NicMode::HostOnly
        } else {
            NicMode::Bridged
        }
    }

    /// Change the adapter's properties while the VM is powered off
    async fn modify_network(&self, device: &AdapterRecord, interface: &str) -> VBoxResult<()> {
        let adapter = if self.use_local_network {
            ModifyField::HostOnlyAdapter
        } else {
            ModifyField::BridgeAdapter
        };

        self.vbox
            .modify_network(
                &device.instance,
                device.index,
                &[
                    (ModifyField::NicType, self.nic_type.clone()),
                    (ModifyField::Nic, self.nic_mode().as_str().to_string()),
                    (adapter, interface.to_string()),
                    (ModifyField::CableConnected, ON.to_string()),
                ],
            )
            .await
    }

    /// Rebind the adapter of a running VM and bring its link up
    async fn update_network(&self, device: &AdapterRecord, interface: &str) -> VBoxResult<()> {
        self.vbox
            .update_network(
                &device.instance,
                device.index,
                ControlField::Nic,
                &[self.nic_mode().as_str().to_string(), interface.to_string()],
            )
            .await?;

        self.vbox
            .update_network(
                &device.instance,
                device.index,
                ControlField::LinkState,
                &[ON.to_string()],
            )
            .await
    }

    fn falls_back_to_live(&self, error: &VBoxError) -> bool {
        match self.offline_fallback {
            OfflineFallback::AnyError => true,
            OfflineFallback::InvalidState => error.is_invalid_state(),
        }
    }

    /// Connect the port's adapter to `interface`; unknown ports are ignored
    pub async fn setup_device(&self, port_id: &str, interface: &str) -> VBoxResult<()> {
        let Some(device) = self.device(port_id) else {
            debug!("No adapter for port {}, nothing to set up", port_id);
            return Ok(());
        };

        if device.state == VmState::PowerOff {
            match self.modify_network(device, interface).await {
                Ok(()) => {
                    info!(
                        "Port {} bound offline to {} (adapter {} of `{}`)",
                        port_id, interface, device.index, device.instance
                    );
                    return Ok(());
                }
                // the VM probably left the powered-off state since the refresh
                Err(e) if self.falls_back_to_live(&e) => {
                    debug!("Failed to modify network for {}: {}", port_id, e);
                }
                Err(e) => return Err(e),
            }
        }

        self.update_network(device, interface).await?;
        info!(
            "Port {} bound live to {} (adapter {} of `{}`)",
            port_id, interface, device.index, device.instance
        );
        Ok(())
    }
}
