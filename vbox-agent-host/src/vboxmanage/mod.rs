//! Wrapper over the `VBoxManage` command line tool
//!
//! Every call is `<vboxmanage_cmd> --nologo <subcommand> <args...>`. The tool
//! reports problems on stderr; this module retries the transient
//! `E_ACCESSDENIED` failure in place and turns anything else into a
//! [`VBoxError`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::VirtualBoxConfig;
use crate::error::{VBoxError, VBoxResult};
use crate::execution::{CommandOutput, Execute};

pub const CONTROL_VM: &str = "controlvm";
pub const LIST: &str = "list";
pub const SHOW_VM_INFO: &str = "showvminfo";
pub const MODIFY_VM: &str = "modifyvm";

pub const ON: &str = "on";

const E_ACCESSDENIED: &str = "E_ACCESSDENIED";
const E_INSTANCE_NOT_FOUND: &str = "Could not find a registered machine named";
const E_INVALID_STATE: &[&str] = &[
    "VBOX_E_INVALID_VM_STATE",
    "VBOX_E_INVALID_OBJECT_STATE",
    "Machine in invalid state",
];

/// `VBoxManage list <category>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListCategory {
    /// All registered virtual machines
    Vms,
}

impl ListCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ListCategory::Vms => "vms",
        }
    }
}

/// Adapter settings changed through `modifyvm` (VM powered off)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyField {
    Nic,
    NicType,
    CableConnected,
    BridgeAdapter,
    HostOnlyAdapter,
}

impl ModifyField {
    pub fn for_adapter(self, index: u8) -> String {
        let template = match self {
            ModifyField::Nic => "--nic",
            ModifyField::NicType => "--nictype",
            ModifyField::CableConnected => "--cableconnected",
            ModifyField::BridgeAdapter => "--bridgeadapter",
            ModifyField::HostOnlyAdapter => "--hostonlyadapter",
        };
        format!("{}{}", template, index)
    }
}

/// Adapter settings changed through `controlvm` (VM running)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlField {
    Nic,
    LinkState,
}

impl ControlField {
    pub fn for_adapter(self, index: u8) -> String {
        let template = match self {
            ControlField::Nic => "nic",
            ControlField::LinkState => "setlinkstate",
        };
        format!("{}{}", template, index)
    }
}

/// Parsed `showvminfo --machinereadable` output
///
/// The literal value `none` is stored as an absent value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmInfo {
    fields: HashMap<String, Option<String>>,
}

impl VmInfo {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|value| value.as_deref())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }
}

impl FromIterator<(String, Option<String>)> for VmInfo {
    fn from_iter<I: IntoIterator<Item = (String, Option<String>)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Parse `"key"="value"` lines; unparseable lines are skipped
pub fn parse_machine_readable(output: &str) -> VmInfo {
    let strip = |s: &str| s.trim_matches(|c: char| c.is_whitespace() || c == '"').to_string();

    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match line.split_once('=') {
            Some((key, value)) => {
                let value = strip(value);
                let value = (value != "none").then_some(value);
                Some((strip(key), value))
            }
            None => {
                warn!("Could not parse the following line: {}", line);
                None
            }
        })
        .collect()
}

fn classify_stderr(stderr: &str, instance: &str, method: &str) -> VBoxError {
    if stderr.contains(E_INSTANCE_NOT_FOUND) {
        return VBoxError::InstanceNotFound {
            instance: instance.to_string(),
        };
    }

    if E_INVALID_STATE.iter().any(|signature| stderr.contains(signature)) {
        return VBoxError::InvalidState {
            instance: instance.to_string(),
            method: method.to_string(),
            details: stderr.trim().to_string(),
        };
    }

    VBoxError::manage(method, stderr.trim())
}

/// Retrying `VBoxManage` client
pub struct VBoxManage {
    executor: Arc<dyn Execute>,
    program: String,
    retry_count: u32,
    retry_interval: Duration,
}

impl VBoxManage {
    pub fn new(config: &VirtualBoxConfig, executor: Arc<dyn Execute>) -> Self {
        Self {
            executor,
            program: config.vboxmanage_cmd.clone(),
            retry_count: config.retry_count.max(1),
            retry_interval: config.retry_interval(),
        }
    }

    /// Run a subcommand, retrying while the tool answers `E_ACCESSDENIED`
    async fn execute(&self, args: Vec<String>) -> CommandOutput {
        let mut command = Vec::with_capacity(args.len() + 1);
        command.push("--nologo".to_string());
        command.extend(args);

        let mut output = CommandOutput::default();
        for attempt in 1..=self.retry_count {
            output = self.executor.execute(&self.program, &command).await;
            if !output.stderr.contains(E_ACCESSDENIED) {
                return output;
            }

            if attempt < self.retry_count {
                warn!(
                    "Access denied running {:?} (attempt {}/{}), trying again",
                    command, attempt, self.retry_count
                );
                tokio::time::sleep(self.retry_interval).await;
            }
        }

        warn!("Failed to process command {:?}", command);
        output
    }

    /// Raw listing of `VBoxManage list <category>`
    pub async fn list(&self, category: ListCategory) -> VBoxResult<String> {
        let output = self
            .execute(vec![LIST.to_string(), category.as_str().to_string()])
            .await;
        if output.has_error() {
            return Err(VBoxError::manage(LIST, output.stderr.trim()));
        }
        Ok(output.stdout)
    }

    /// Configuration of a particular VM
    pub async fn show_vm_info(&self, instance: &str) -> VBoxResult<VmInfo> {
        let output = self
            .execute(vec![
                SHOW_VM_INFO.to_string(),
                instance.to_string(),
                "--machinereadable".to_string(),
            ])
            .await;
        if output.has_error() {
            return Err(classify_stderr(&output.stderr, instance, SHOW_VM_INFO));
        }
        Ok(parse_machine_readable(&output.stdout))
    }

    /// Change adapter settings of a powered-off VM in a single `modifyvm` call
    ///
    /// Fields with an empty value are passed as bare flags. A VM that is not
    /// powered off (or is locked by a session) yields [`VBoxError::InvalidState`].
    pub async fn modify_network(
        &self,
        instance: &str,
        index: u8,
        fields: &[(ModifyField, String)],
    ) -> VBoxResult<()> {
        let mut command = vec![MODIFY_VM.to_string(), instance.to_string()];
        for (field, value) in fields {
            command.push(field.for_adapter(index));
            if !value.is_empty() {
                command.push(value.clone());
            }
        }

        let output = self.execute(command).await;
        if output.has_error() {
            return Err(classify_stderr(&output.stderr, instance, MODIFY_VM));
        }
        debug!("Modified adapter {} of {}", index, instance);
        Ok(())
    }

    /// Change adapter settings of a running VM through `controlvm`
    pub async fn update_network(
        &self,
        instance: &str,
        index: u8,
        field: ControlField,
        values: &[String],
    ) -> VBoxResult<()> {
        let mut command = vec![
            CONTROL_VM.to_string(),
            instance.to_string(),
            field.for_adapter(index),
        ];
        command.extend(values.iter().cloned());

        let output = self.execute(command).await;
        if output.has_error() {
            return Err(VBoxError::manage(CONTROL_VM, output.stderr.trim()));
        }
        Ok(())
    }
}
