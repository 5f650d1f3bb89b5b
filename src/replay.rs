//! Replay of recorded observer event traces.
//!
//! A trace is a stream of JSON events: port status words, transfers, and
//! the responses the control pipe should give to the observer's own
//! requests. Replaying a trace writes one line per event, followed after
//! each port or transfer event by a summary of the host's registry.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Deserializer;

use crate::device::Device;
use crate::hook::{HookPhase, Transfer};
use crate::host::{ControlPipe, Host, ObserverConfig};
use crate::port::PortChange;
use crate::usb::{
    DescriptorType,
    DeviceAddr,
    Direction,
    EndpointNum,
    PID,
    SETUP_PACKET_SIZE,
    SetupFields,
};

/// A request seen by a [`ScriptedPipe`]:
/// address, max packet size, descriptor type, length.
pub type Request = (DeviceAddr, u8, DescriptorType, u16);

/// Control pipe answering from a queue of prepared responses.
#[derive(Default)]
pub struct ScriptedPipe {
    responses: Mutex<VecDeque<Result<Vec<u8>, String>>>,
    requests: Mutex<Vec<Request>>,
}

impl ScriptedPipe {
    /// Queue a successful response.
    pub fn respond(&self, bytes: Vec<u8>) {
        self.responses.lock().push_back(Ok(bytes));
    }

    /// Queue a failed request.
    pub fn fail(&self, reason: impl Into<String>) {
        self.responses.lock().push_back(Err(reason.into()));
    }

    /// Requests issued so far, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn pending(&self) -> usize {
        self.responses.lock().len()
    }
}

impl ControlPipe for ScriptedPipe {
    fn get_descriptor(&self,
                      address: DeviceAddr,
                      max_packet_size_0: u8,
                      descriptor_type: DescriptorType,
                      _index: u8,
                      length: u16)
        -> anyhow::Result<Vec<u8>>
    {
        self.requests.lock()
            .push((address, max_packet_size_0, descriptor_type, length));
        match self.responses.lock().pop_front() {
            Some(Ok(mut bytes)) => {
                bytes.truncate(usize::from(length));
                Ok(bytes)
            },
            Some(Err(reason)) => Err(anyhow!("{reason}")),
            None => Err(anyhow!("No response scripted for {} request",
                                descriptor_type.description())),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Event {
    PortStatus {
        port: u8,
        status: u16,
        reset_bit: u8,
    },
    Transfer {
        phase: HookPhase,
        address: DeviceAddr,
        #[serde(default)]
        endpoint: EndpointNum,
        pid: PID,
        #[serde(default)]
        setup: Option<[u8; SETUP_PACKET_SIZE]>,
        #[serde(default)]
        data: Vec<u8>,
    },
    Respond(Vec<u8>),
    Fail(String),
}

/// A host with its device monitor installed, fed from a trace.
pub struct Replay {
    host: Host,
    pipe: Arc<ScriptedPipe>,
}

impl Replay {
    pub fn new(config: ObserverConfig) -> Self {
        let pipe = Arc::new(ScriptedPipe::default());
        let host = Host::new("replay", pipe.clone(), config);
        host.init_device_monitor();
        Replay { host, pipe }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Apply one event, returning a line describing what happened.
    pub fn apply(&self, event: Event) -> String {
        match event {
            Event::PortStatus { port, status, reset_bit } => {
                let change = self.host.on_port_status(port, status, reset_bit);
                format!("Port {port} status 0x{status:04X}: {}",
                        describe_change(&change))
            },
            Event::Transfer { phase, address, endpoint, pid, setup, data } => {
                let fields = setup.as_ref().map(SetupFields::from_bytes);
                let direction = match (fields, pid) {
                    (Some(fields), _) => fields.type_fields.direction(),
                    (None, PID::IN) => Direction::In,
                    (None, _) => Direction::Out,
                };
                let mut line = format!("{phase} {pid} to {address}.{endpoint}");
                if let Some(fields) = fields {
                    line += &format!(" [{:02X} {:04X}]",
                                     fields.request, fields.value);
                }
                if !data.is_empty() {
                    line += &format!(" with {} bytes", data.len());
                }
                let mut transfer = Transfer {
                    address,
                    endpoint,
                    pid,
                    direction,
                    setup,
                    data,
                    device: None,
                };
                let action = self.host.on_transfer(phase, &mut transfer);
                format!("{line}: {action:?}")
            },
            Event::Respond(bytes) => {
                let line = format!("Scripted {} byte response", bytes.len());
                self.pipe.respond(bytes);
                line
            },
            Event::Fail(reason) => {
                let line = format!("Scripted failure: {reason}");
                self.pipe.fail(reason);
                line
            },
        }
    }

    /// Describe the host's registry and hook chains.
    pub fn summary(&self) -> Vec<String> {
        let hooks = HookPhase::ALL.iter()
            .map(|phase| format!("{phase} {}", self.host.hooks().len(*phase)))
            .join(", ");
        let devices = self.host.devices();
        let mut lines = vec![
            format!("Devices: {}, hooks: {hooks}", devices.len())
        ];
        for device in devices {
            summarize_device(&device, &mut lines);
        }
        lines
    }
}

fn describe_change(change: &PortChange) -> String {
    let mut parts = Vec::new();
    if let Some(address) = change.disconnected {
        parts.push(format!("disconnected device {address}"));
    }
    if change.connected {
        parts.push(String::from("connected"));
    }
    if let Some(address) = change.reset {
        parts.push(format!("reset device {address}"));
    }
    if parts.is_empty() {
        String::from("no change")
    } else {
        parts.join(", ")
    }
}

fn summarize_device(device: &Device, lines: &mut Vec<String>) {
    let state = device.lock();
    let descriptor = state.descriptor;
    let mut line = format!("  Device {} on port {}: {}, ID {:04X}:{:04X}",
                           device.address(), device.port(), state.lifecycle,
                           descriptor.vendor_id, descriptor.product_id);
    if let Some(value) = state.configuration_value {
        line += &format!(", configuration {value}");
    }
    lines.push(line);
    let Some(tree) = &state.config else {
        return;
    };
    for config in &tree.configurations {
        lines.push(format!("    Configuration {}: {} alt-settings",
                           config.descriptor.config_value(),
                           config.interface.num_altsetting()));
        for alt in &config.interface.altsettings {
            let number = alt.descriptor.interface_number;
            let setting = alt.descriptor.alternate_setting;
            let (class, subclass, protocol) = alt.descriptor.class_triple();
            let endpoints = alt.endpoints.iter()
                .map(|ep| format!("{:02X}/{}",
                                  ep.descriptor.address().0,
                                  ep.descriptor.max_packet_size()))
                .join(", ");
            lines.push(format!(
                "      Interface {number} alt {setting}: \
                 class {class:02X}:{subclass:02X}:{protocol:02X}, \
                 endpoints [{endpoints}], {} extra bytes",
                alt.extra.len()));
        }
    }
}

/// Replay a JSON event stream through a fresh host, writing the outcome.
pub fn replay<R: Read, W: Write>(reader: R,
                                 writer: &mut W,
                                 config: ObserverConfig)
    -> anyhow::Result<()>
{
    let replay = Replay::new(config);
    for result in Deserializer::from_reader(reader).into_iter::<Event>() {
        let event = result.context("Failed to deserialize event")?;
        let summarize = matches!(event,
            Event::PortStatus { .. } | Event::Transfer { .. });
        writeln!(writer, "{}", replay.apply(event))?;
        if summarize {
            for line in replay.summary() {
                writeln!(writer, "{line}")?;
            }
        }
    }
    replay.host.check_links()?;
    Ok(())
}
