//! Per-device state tracked by the observer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering::AcqRel, Ordering::Acquire};

use log::{debug, info};
use num_enum::{IntoPrimitive, FromPrimitive};
use parking_lot::{Mutex, MutexGuard};

use crate::descriptor::{ConfigTree, parse_config_descriptor, parse_device_descriptor};
use crate::host::Host;
use crate::id::Handle;
use crate::usb::{
    DescriptorType,
    DeviceAddr,
    DeviceDescriptor,
    InterfaceDescriptor,
    PortId,
};

/// Registry slot of a device. Stale once the device has been freed.
pub type DeviceId = Handle<Device>;

/// Lifecycle of a device as deduced from traffic on the wire.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq,
         IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Lifecycle {
    /// Not in the registry.
    #[default]
    Detached = 0,
    /// Address assigned; descriptors may have been fetched.
    Addressed = 1,
    /// The host has selected a configuration.
    Configured = 2,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", match self {
            Lifecycle::Detached => "detached",
            Lifecycle::Addressed => "addressed",
            Lifecycle::Configured => "configured",
        })
    }
}

/// State owned by a class shim bound to a device.
pub trait ClassHandle: Send {
    /// Short name for diagnostics.
    fn name(&self) -> &str;

    /// Called once when the device goes away, with no locks held.
    fn remove(self: Box<Self>, device: &Device);
}

/// Offered each newly enumerated device, to attach a class handle.
pub trait ClassBinder: Send + Sync {
    /// Inspect the first alt-setting of the device's first configuration
    /// and return a handle to claim the device.
    fn bind(&self,
            host: &Host,
            device: &Arc<Device>,
            interface: &InterfaceDescriptor)
        -> Option<Box<dyn ClassHandle>>;
}

/// Mutable part of a device, guarded by the device lock.
#[derive(Default)]
pub struct DeviceState {
    pub lifecycle: Lifecycle,
    pub descriptor: DeviceDescriptor,
    pub config: Option<ConfigTree>,
    /// Value from the last `SET_CONFIGURATION` seen.
    pub configuration_value: Option<u8>,
    handle: Option<Box<dyn ClassHandle>>,
}

impl DeviceState {
    pub fn handle_name(&self) -> Option<&str> {
        self.handle.as_ref().map(|handle| handle.name())
    }
}

pub struct Device {
    id: DeviceId,
    address: DeviceAddr,
    port: PortId,
    freed: AtomicBool,
    state: Mutex<DeviceState>,
}

impl Device {
    pub(crate) fn new(id: DeviceId, address: DeviceAddr, port: PortId)
        -> Self
    {
        Device {
            id,
            address,
            port,
            freed: AtomicBool::new(false),
            state: Mutex::new(DeviceState {
                lifecycle: Lifecycle::Addressed,
                ..DeviceState::default()
            }),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn address(&self) -> DeviceAddr {
        self.address
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    /// Take the device lock. Must not be held while taking the host's
    /// hook lock.
    pub fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        self.state.lock().descriptor
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Acquire)
    }

    /// Feed a descriptor reply for this device to the parser.
    ///
    /// Device replies overwrite the leading bytes of the device descriptor.
    /// Configuration replies replace the configuration tree, unless the
    /// reply is incomplete or holds no configuration. Returns whether
    /// anything was updated.
    pub fn apply_descriptor(&self, kind: DescriptorType, bytes: &[u8])
        -> bool
    {
        info!("GetDescriptor({}, {}, {}) found.",
              self.address, kind.description(), bytes.len());
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Detached {
            return false;
        }
        match kind {
            DescriptorType::Device => {
                let previous = state.descriptor.max_packet_size_0;
                let updated =
                    parse_device_descriptor(&mut state.descriptor, bytes) > 0;
                let max_packet_size_0 = state.descriptor.max_packet_size_0;
                if max_packet_size_0 != previous {
                    if let Some(tree) = state.config.as_mut() {
                        tree.synthesize_endpoint_zero(max_packet_size_0);
                    }
                }
                updated
            },
            DescriptorType::Configuration => {
                let max_packet_size_0 = state.descriptor.max_packet_size_0;
                match parse_config_descriptor(bytes, max_packet_size_0) {
                    Some(tree) => {
                        state.config = Some(tree);
                        true
                    },
                    None => false,
                }
            },
            _ => false,
        }
    }

    pub(crate) fn mark_configured(&self, value: u8) {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Detached {
            return;
        }
        state.lifecycle = Lifecycle::Configured;
        state.configuration_value = Some(value);
    }

    /// Install a class handle, returning any handle it displaced.
    pub(crate) fn set_handle(&self, handle: Box<dyn ClassHandle>)
        -> Option<Box<dyn ClassHandle>>
    {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Detached {
            return Some(handle);
        }
        state.handle.replace(handle)
    }

    /// Mark the device freed and strip its state. Returns `None` if it was
    /// already freed, otherwise the class handle it held, if any.
    pub(crate) fn release(&self) -> Option<Option<Box<dyn ClassHandle>>> {
        if self.freed.swap(true, AcqRel) {
            return None;
        }
        let mut state = self.state.lock();
        state.lifecycle = Lifecycle::Detached;
        state.config = None;
        let handle = state.handle.take();
        if let Some(handle) = &handle {
            debug!("Releasing {} handle of device {}",
                   handle.name(), self.address);
        }
        Some(handle)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("freed", &self.is_freed())
            .finish()
    }
}
