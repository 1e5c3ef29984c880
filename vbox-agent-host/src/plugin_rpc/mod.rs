//! Control-plane API consumed by the agent
//!
//! [`PluginApi`] is what the reconciliation loop and the heartbeat talk to.
//! [`MqttPluginApi`] carries it over MQTT:
//! - `vbox/agents/device-details@v1/request` → replies on `.../reply/<agent_id>`
//! - `vbox/agents/device-up@v1` / `vbox/agents/device-down@v1`
//! - `vbox/agents/state@v1`

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{MqttConfig, NetworkMappings};

pub const DETAILS_REQUEST_TOPIC: &str = "vbox/agents/device-details@v1/request";
pub const DETAILS_REPLY_TOPIC: &str = "vbox/agents/device-details@v1/reply";
pub const DEVICE_UP_TOPIC: &str = "vbox/agents/device-up@v1";
pub const DEVICE_DOWN_TOPIC: &str = "vbox/agents/device-down@v1";
pub const STATE_TOPIC: &str = "vbox/agents/state@v1";

/// Requests buffered for the event loop; publishing blocks once it is full
const REQUEST_QUEUE_CAPACITY: usize = 10;

pub const AGENT_BINARY: &str = "vbox-network-agent";
pub const AGENT_TOPIC: &str = "vbox_agent";
pub const AGENT_TYPE: &str = "VirtualBox agent";

/// Port binding details returned by the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDetails {
    pub device: String,
    #[serde(default)]
    pub port_id: Option<String>,
    #[serde(default)]
    pub network_type: Option<String>,
    #[serde(default)]
    pub physical_network: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfigurations {
    pub network_mappings: BTreeMap<String, String>,
}

/// Liveness payload reported periodically
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    pub binary: String,
    pub host: String,
    pub topic: String,
    pub agent_type: String,
    pub configurations: AgentConfigurations,
    /// Only set until the first successful report
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_flag: Option<bool>,
}

impl AgentState {
    pub fn new(host: &str, mappings: &NetworkMappings) -> Self {
        Self {
            binary: AGENT_BINARY.to_string(),
            host: host.to_string(),
            topic: AGENT_TOPIC.to_string(),
            agent_type: AGENT_TYPE.to_string(),
            configurations: AgentConfigurations {
                network_mappings: mappings.to_report(),
            },
            start_flag: Some(true),
        }
    }
}

/// Calls the agent makes on the control plane
#[async_trait]
pub trait PluginApi: Send + Sync {
    async fn get_devices_details(
        &self,
        devices: &[String],
        agent_id: &str,
    ) -> Result<Vec<DeviceDetails>>;

    async fn update_device_up(&self, device: &str, agent_id: &str, host: &str) -> Result<()>;

    async fn update_device_down(&self, device: &str, agent_id: &str, host: &str) -> Result<()>;

    async fn report_state(&self, state: &AgentState) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct DetailsRequest<'a> {
    request_id: &'a str,
    agent_id: &'a str,
    devices: &'a [String],
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct DetailsReply {
    request_id: String,
    #[serde(default)]
    details: Option<Vec<DeviceDetails>>,
    #[serde(default)]
    error: Option<String>,
}

impl DetailsReply {
    fn into_result(self) -> Result<Vec<DeviceDetails>> {
        match (self.details, self.error) {
            (_, Some(error)) => Err(anyhow!("Control plane error: {}", error)),
            (details, None) => Ok(details.unwrap_or_default()),
        }
    }
}

#[derive(Debug, Serialize)]
struct DeviceStatusMessage<'a> {
    device: &'a str,
    agent_id: &'a str,
    host: &'a str,
    timestamp: DateTime<Utc>,
}

type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<DetailsReply>>>>;

/// [`PluginApi`] over MQTT
pub struct MqttPluginApi {
    client: AsyncClient,
    pending: PendingReplies,
    rpc_timeout: Duration,
}

impl MqttPluginApi {
    /// Configure the MQTT client and start routing replies in the background
    pub fn connect(config: &MqttConfig, agent_id: &str) -> Self {
        let mut mqtt_options = MqttOptions::new(
            format!("vbox-agent-{}", agent_id),
            &config.broker_host,
            config.broker_port,
        );
        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        mqtt_options.set_clean_session(true);
        mqtt_options.set_max_packet_size(256 * 1024, 256 * 1024);

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_QUEUE_CAPACITY);
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let reply_topic = format!("{}/{}", DETAILS_REPLY_TOPIC, agent_id);

        tokio::spawn(route_replies(
            eventloop,
            client.clone(),
            reply_topic,
            pending.clone(),
        ));

        info!(
            "Control plane client configured for {}:{}",
            config.broker_host, config.broker_port
        );

        Self {
            client,
            pending,
            rpc_timeout: config.rpc_timeout(),
        }
    }

    /// Hand a message to the event loop, failing after `rpc_timeout` while
    /// the request queue stays full
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let publish = self.client.publish(topic, QoS::AtLeastOnce, false, payload);
        match tokio::time::timeout(self.rpc_timeout, publish).await {
            Ok(result) => result.with_context(|| format!("Failed to publish to {}", topic)),
            Err(_) => bail!(
                "Timed out publishing to {} after {}s, broker unreachable?",
                topic,
                self.rpc_timeout.as_secs()
            ),
        }
    }

    async fn publish_status(
        &self,
        topic: &str,
        device: &str,
        agent_id: &str,
        host: &str,
    ) -> Result<()> {
        let message = DeviceStatusMessage {
            device,
            agent_id,
            host,
            timestamp: Utc::now(),
        };
        let payload =
            serde_json::to_string(&message).context("Failed to serialize device status")?;

        self.publish(topic, payload).await
    }
}

/// Drive the MQTT event loop, handing details replies to their waiting request
async fn route_replies(
    mut eventloop: EventLoop,
    client: AsyncClient,
    reply_topic: String,
    pending: PendingReplies,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                // clean session: subscribe again on every connection
                match client.try_subscribe(&reply_topic, QoS::AtLeastOnce) {
                    Ok(()) => info!("Subscribed to replies on: {}", reply_topic),
                    Err(e) => error!("Failed to subscribe to {}: {}", reply_topic, e),
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) if publish.topic == reply_topic => {
                match serde_json::from_slice::<DetailsReply>(&publish.payload) {
                    Ok(reply) => match pending.lock().remove(&reply.request_id) {
                        Some(sender) => {
                            if sender.send(reply).is_err() {
                                debug!("Details request gave up before its reply arrived");
                            }
                        }
                        None => debug!("Dropping reply for unknown request {}", reply.request_id),
                    },
                    Err(e) => warn!("Invalid details reply: {}", e),
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT connection error: {}", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

#[async_trait]
impl PluginApi for MqttPluginApi {
    async fn get_devices_details(
        &self,
        devices: &[String],
        agent_id: &str,
    ) -> Result<Vec<DeviceDetails>> {
        let request_id = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), sender);

        let request = DetailsRequest {
            request_id: &request_id,
            agent_id,
            devices,
            timestamp: Utc::now(),
        };
        let payload =
            serde_json::to_string(&request).context("Failed to serialize details request")?;

        if let Err(e) = self.publish(DETAILS_REQUEST_TOPIC, payload).await {
            self.pending.lock().remove(&request_id);
            return Err(e).context("Failed to publish details request");
        }

        let reply = match tokio::time::timeout(self.rpc_timeout, receiver).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => bail!("Details reply channel closed"),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                bail!(
                    "No details reply within {}s for {} devices",
                    self.rpc_timeout.as_secs(),
                    devices.len()
                );
            }
        };

        reply.into_result()
    }

    async fn update_device_up(&self, device: &str, agent_id: &str, host: &str) -> Result<()> {
        self.publish_status(DEVICE_UP_TOPIC, device, agent_id, host)
            .await
    }

    async fn update_device_down(&self, device: &str, agent_id: &str, host: &str) -> Result<()> {
        self.publish_status(DEVICE_DOWN_TOPIC, device, agent_id, host)
            .await
    }

    async fn report_state(&self, state: &AgentState) -> Result<()> {
        let payload = serde_json::to_string(state).context("Failed to serialize agent state")?;

        self.publish(STATE_TOPIC, payload)
            .await
            .context("Failed to publish agent state")
    }
}
