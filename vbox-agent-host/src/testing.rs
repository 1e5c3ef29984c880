//! Test doubles for the VBoxManage executor and the control plane

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::execution::{CommandOutput, Execute};
use crate::plugin_rpc::{AgentState, DeviceDetails, PluginApi};

pub fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

struct Rule {
    prefix: Vec<String>,
    outputs: VecDeque<CommandOutput>,
}

/// Executor answering from scripted rules and recording every invocation
///
/// A rule matches when the arguments after `--nologo` start with its prefix.
/// Each match consumes one output; the last one keeps answering. Unmatched
/// invocations succeed with empty output. Later rules take precedence.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, prefix: &[&str], outputs: Vec<CommandOutput>) {
        self.rules.lock().unwrap().push(Rule {
            prefix: args(prefix),
            outputs: outputs.into(),
        });
    }

    /// Full argument lists, `--nologo` included
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(program, _)| program.clone())
            .collect()
    }

    /// Invocations of one subcommand (`modifyvm`, `controlvm`, ...)
    pub fn calls_to(&self, subcommand: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|call| call.get(1).map(String::as_str) == Some(subcommand))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl Execute for ScriptedExecutor {
    async fn execute(&self, program: &str, args: &[String]) -> CommandOutput {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));

        let subcommand = args.get(1..).unwrap_or_default();
        let mut rules = self.rules.lock().unwrap();
        let rule = rules
            .iter_mut()
            .rev()
            .find(|rule| subcommand.starts_with(&rule.prefix));

        match rule {
            Some(rule) if rule.outputs.len() > 1 => rule.outputs.pop_front().unwrap_or_default(),
            Some(rule) => rule.outputs.front().cloned().unwrap_or_default(),
            None => CommandOutput::default(),
        }
    }
}

/// Control plane double recording every call
#[derive(Default)]
pub struct RecordingPluginApi {
    details: Mutex<Vec<DeviceDetails>>,
    details_unreachable: Mutex<bool>,
    failing_up: Mutex<HashSet<String>>,
    failing_down: Mutex<HashSet<String>>,
    failing_reports: Mutex<usize>,
    pub details_requests: Mutex<Vec<Vec<String>>>,
    pub ups: Mutex<Vec<String>>,
    pub downs: Mutex<Vec<String>>,
    pub states: Mutex<Vec<AgentState>>,
}

impl RecordingPluginApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_details(details: Vec<DeviceDetails>) -> Self {
        let api = Self::default();
        *api.details.lock().unwrap() = details;
        api
    }

    pub fn set_details_unreachable(&self, unreachable: bool) {
        *self.details_unreachable.lock().unwrap() = unreachable;
    }

    pub fn fail_up(&self, device: &str) {
        self.failing_up.lock().unwrap().insert(device.to_string());
    }

    pub fn fail_down(&self, device: &str) {
        self.failing_down.lock().unwrap().insert(device.to_string());
    }

    pub fn fail_next_reports(&self, count: usize) {
        *self.failing_reports.lock().unwrap() = count;
    }

    pub fn ups(&self) -> Vec<String> {
        self.ups.lock().unwrap().clone()
    }

    pub fn downs(&self) -> Vec<String> {
        self.downs.lock().unwrap().clone()
    }

    pub fn details_requests(&self) -> Vec<Vec<String>> {
        self.details_requests.lock().unwrap().clone()
    }

    pub fn states(&self) -> Vec<AgentState> {
        self.states.lock().unwrap().clone()
    }
}

#[async_trait]
impl PluginApi for RecordingPluginApi {
    async fn get_devices_details(
        &self,
        devices: &[String],
        _agent_id: &str,
    ) -> Result<Vec<DeviceDetails>> {
        self.details_requests.lock().unwrap().push(devices.to_vec());
        if *self.details_unreachable.lock().unwrap() {
            return Err(anyhow!("control plane unreachable"));
        }

        let details = self.details.lock().unwrap();
        Ok(details
            .iter()
            .filter(|detail| devices.contains(&detail.device))
            .cloned()
            .collect())
    }

    async fn update_device_up(&self, device: &str, _agent_id: &str, _host: &str) -> Result<()> {
        if self.failing_up.lock().unwrap().contains(device) {
            return Err(anyhow!("device up rejected for {}", device));
        }
        self.ups.lock().unwrap().push(device.to_string());
        Ok(())
    }

    async fn update_device_down(&self, device: &str, _agent_id: &str, _host: &str) -> Result<()> {
        if self.failing_down.lock().unwrap().contains(device) {
            return Err(anyhow!("device down rejected for {}", device));
        }
        self.downs.lock().unwrap().push(device.to_string());
        Ok(())
    }

    async fn report_state(&self, state: &AgentState) -> Result<()> {
        let mut failing = self.failing_reports.lock().unwrap();
        if *failing > 0 {
            *failing -= 1;
            return Err(anyhow!("state report rejected"));
        }
        self.states.lock().unwrap().push(state.clone());
        Ok(())
    }
}

/// `showvminfo --machinereadable` output for a VM with the given adapters
///
/// Each adapter is `(index, mac, nic mode)`.
pub fn vm_info_output(
    name: &str,
    state: &str,
    description: Option<&str>,
    adapters: &[(u8, &str, &str)],
) -> CommandOutput {
    let mut lines = vec![
        format!("name=\"{}\"", name),
        format!("VMState=\"{}\"", state),
    ];
    if let Some(description) = description {
        lines.push(format!("description=\"{}\"", description));
    }
    for (index, mac, mode) in adapters {
        lines.push(format!("nic{}=\"{}\"", index, mode));
        lines.push(format!("macaddress{}=\"{}\"", index, mac));
        lines.push(format!("nictype{}=\"82540EM\"", index));
        lines.push(format!("cableconnected{}=\"on\"", index));
    }
    CommandOutput::stdout(lines.join("\n"))
}
