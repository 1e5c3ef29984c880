//! Periodic agent state report
//!
//! The control plane treats the agent as alive while these reports arrive.
//! The first successful report carries `start_flag`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::plugin_rpc::{AgentState, PluginApi};

/// Report the agent state once; `start_flag` is dropped after the first success
pub async fn report_once(plugin: &dyn PluginApi, state: &mut AgentState) -> bool {
    match plugin.report_state(state).await {
        Ok(()) => {
            debug!("Agent state reported");
            state.start_flag = None;
            true
        }
        Err(e) => {
            error!("Failed reporting state!: {:#}", e);
            false
        }
    }
}

/// Report the agent state every `interval` until the task is aborted
pub fn spawn_state_reporter(
    plugin: Arc<dyn PluginApi>,
    mut state: AgentState,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            report_once(plugin.as_ref(), &mut state).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkMappings;
    use crate::testing::RecordingPluginApi;

    fn state() -> AgentState {
        AgentState::new("host-1", &NetworkMappings::parse(&["physnet1:eth1".to_string()]))
    }

    #[tokio::test]
    async fn test_start_flag_survives_failures() {
        let plugin = RecordingPluginApi::new();
        plugin.fail_next_reports(1);
        let mut state = state();

        assert!(!report_once(&plugin, &mut state).await);
        assert_eq!(state.start_flag, Some(true));

        assert!(report_once(&plugin, &mut state).await);
        assert_eq!(state.start_flag, None);

        assert!(report_once(&plugin, &mut state).await);
        let reported = plugin.states();
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0].start_flag, Some(true));
        assert_eq!(reported[1].start_flag, None);
        assert_eq!(reported[1].configurations.network_mappings["physnet1"], "eth1");
    }

    #[tokio::test]
    async fn test_reporter_keeps_running() {
        let plugin = Arc::new(RecordingPluginApi::new());
        plugin.fail_next_reports(1);

        let handle = spawn_state_reporter(plugin.clone(), state(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        let reported = plugin.states();
        assert!(!reported.is_empty());
        assert_eq!(reported[0].start_flag, Some(true));
    }
}
