//! VBox Agent Host - keeps VirtualBox network adapters bound to control-plane ports
//!
//! This agent runs next to VirtualBox on a compute host:
//! - Polls VBoxManage for VMs and the ports tagged in their descriptions
//! - Binds new ports to their physical or internal network and reports them up
//! - Reports vanished ports down, resyncing everything after any failure
//! - Periodically reports its state to the control plane over MQTT

mod config;
mod error;
mod execution;
mod heartbeat;
mod inventory;
mod plugin_rpc;
mod reconcile;
mod vboxmanage;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use config::{AgentConfig, NetworkMappings};
use execution::ProcessExecutor;
use inventory::NetworkInventory;
use plugin_rpc::{AgentState, MqttPluginApi, PluginApi};
use reconcile::ReconciliationLoop;
use vboxmanage::VBoxManage;

/// Agent id the control plane knows this host by
fn agent_id() -> String {
    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    format!("vbox_{}", hostname)
}

/// Main agent state
struct Agent {
    reconciler: ReconciliationLoop,
    heartbeat: Option<JoinHandle<()>>,
}

impl Agent {
    /// Create new agent instance
    fn new(config: &AgentConfig) -> Self {
        let agent_id = agent_id();
        info!(
            "Initializing VBox Agent Host v{} - ID: {}, Host: {}",
            env!("CARGO_PKG_VERSION"),
            agent_id,
            config.agent.host
        );

        let plugin: Arc<dyn PluginApi> = Arc::new(MqttPluginApi::connect(&config.mqtt, &agent_id));

        let heartbeat = match config.agent.report_interval() {
            Some(interval) => {
                let mappings = NetworkMappings::parse(&config.agent.physical_network_mappings);
                let state = AgentState::new(&config.agent.host, &mappings);
                Some(heartbeat::spawn_state_reporter(plugin.clone(), state, interval))
            }
            None => {
                warn!("State reporting disabled, the control plane will not see this agent");
                None
            }
        };

        let vbox = VBoxManage::new(&config.virtualbox, Arc::new(ProcessExecutor));
        let inventory = NetworkInventory::new(&config.virtualbox, vbox);
        info!(
            "Adapters will be attached {}",
            if inventory.use_local_network() {
                "host-only"
            } else {
                "bridged"
            }
        );
        let reconciler = ReconciliationLoop::new(config, inventory, plugin, &agent_id);

        Self {
            reconciler,
            heartbeat,
        }
    }

    /// Run the reconciliation loop until ctrl-c
    async fn run(&mut self) -> Result<()> {
        tokio::select! {
            _ = self.reconciler.daemon_loop() => {}
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for ctrl-c")?;
                info!("Shutdown requested");
            }
        }

        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::load()
        .await
        .context("Failed to load configuration")?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(config.log_level())
        .init();

    info!("VBox Agent Host starting...");

    let mut agent = Agent::new(&config);
    agent.run().await.context("Agent execution failed")?;

    info!("VBox Agent Host stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id() {
        let id = agent_id();
        assert!(id.starts_with("vbox_"));
        assert!(id.len() > "vbox_".len());
    }
}
