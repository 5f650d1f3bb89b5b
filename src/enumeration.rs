//! Device lifecycle driven by control transfers seen on the wire.
//!
//! A host-wide hook catches `SET_ADDRESS` replies and creates the device,
//! then fetches its descriptors through the host's control pipe. Each
//! device gets its own `SET_CONFIGURATION` hook, which is evicted along
//! with the device.

use std::sync::{Arc, Weak};

use log::{debug, info, trace, warn};

use crate::device::Device;
use crate::error::{Error, Result};
use crate::hook::{HookAction, HookId, HookMatch, HookPattern, HookPhase, Transfer};
use crate::host::Host;
use crate::usb::{
    DescriptorType,
    DeviceAddr,
    EndpointNum,
    DEVICE_DESCRIPTOR_PREFIX,
    DEVICE_DESCRIPTOR_SIZE,
};

/// Low 16 bits of a setup packet: bmRequestType, bRequest.
const REQUEST_MASK: u64 = 0xffff;
const SET_ADDRESS: u64 = 0x0500;
const SET_CONFIGURATION: u64 = 0x0900;
const GET_DESCRIPTOR: u64 = 0x0680;

/// Hooks installed by [`Host::init_device_monitor`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceMonitor {
    pub set_address: HookId,
    pub get_descriptor: Option<HookId>,
}

impl Host {
    /// Start following device enumeration on this host.
    pub fn init_device_monitor(&self) -> DeviceMonitor {
        let set_address = self.register_hook(
            HookPhase::Reply,
            HookMatch::any()
                .pattern(HookPattern::setup(REQUEST_MASK, SET_ADDRESS)),
            None,
            |host: &Host, transfer: &mut Transfer| host.new_usb_device(transfer));
        let get_descriptor = self.config().track_guest_descriptors.then(|| {
            self.register_hook(
                HookPhase::Reply,
                HookMatch::any()
                    .pattern(HookPattern::setup(REQUEST_MASK, GET_DESCRIPTOR)),
                None,
                |_: &Host, transfer: &mut Transfer| guest_descriptor(transfer))
        });
        debug!("Device monitor installed on {}", self.name());
        DeviceMonitor { set_address, get_descriptor }
    }

    fn new_usb_device(&self, transfer: &mut Transfer) -> HookAction {
        let Some(setup) = transfer.setup_fields() else {
            return HookAction::Pass;
        };
        let address = DeviceAddr::from_set_address(setup.value);
        info!("SetAddress({address}) found.");

        if let Some(incumbent) = self.lookup_by_address(address) {
            info!("The same address({address}) found! Maybe reset.");
            self.free_device(&incumbent);
        }
        let port = self.last_changed_port();
        if let Some(incumbent) = self.lookup_by_port(port) {
            info!("The same port({port}) found! Maybe reset.");
            self.free_device(&incumbent);
        }

        let device = self.insert_device(address, port);
        info!("PORTNO {port}: USB device connect, address {address}.");
        self.fetch_descriptors(&device);
        self.watch_configuration(&device);
        if device.is_freed() {
            // Unplugged while enumerating. free_device may have evicted
            // before the watch hook went in.
            let evicted = self.hooks().evict(device.id());
            info!("Device {address} gone during enumeration, \
                   {evicted} hooks evicted.");
            return HookAction::Pass;
        }
        self.bind_class(&device);
        HookAction::Pass
    }

    /// Fetch the device and configuration descriptors of a new device and
    /// feed them to the parser.
    fn fetch_descriptors(&self, device: &Device) {
        let pipe = self.pipe();
        let address = device.address();
        let fetch = |mps0: u8, kind: DescriptorType, length: u16| {
            if device.is_freed() {
                return None;
            }
            match pipe.get_descriptor(address, mps0, kind, 0, length) {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    warn!("GetDescriptor({address}, {}, {length}): {}",
                          kind.description(), Error::Transfer(err));
                    None
                }
            }
        };

        let mut mps0 = 0;
        if let Some(bytes) = fetch(0, DescriptorType::Device,
                                   DEVICE_DESCRIPTOR_PREFIX as u16)
        {
            device.apply_descriptor(DescriptorType::Device, &bytes);
            if bytes.len() >= DEVICE_DESCRIPTOR_PREFIX {
                mps0 = bytes[7];
            }
        }
        if let Some(bytes) = fetch(mps0, DescriptorType::Device,
                                   DEVICE_DESCRIPTOR_SIZE as u16)
        {
            device.apply_descriptor(DescriptorType::Device, &bytes);
            if bytes.len() >= 14 {
                info!("USB device {address}: {}", device.descriptor());
            }
        }
        if let Some(bytes) = fetch(mps0, DescriptorType::Configuration,
                                   self.config().config_fetch_length)
        {
            device.apply_descriptor(DescriptorType::Configuration, &bytes);
        }
    }

    /// Fetch the descriptors of a registered device again, replacing its
    /// configuration tree if the new reply parses.
    pub fn refresh_descriptors(&self, device: &Device) -> Result<()> {
        if device.is_freed() || !self.is_registered(device) {
            return Err(Error::StaleDevice { address: device.address() });
        }
        self.fetch_descriptors(device);
        Ok(())
    }

    /// Follow `SET_CONFIGURATION` requests to a device.
    fn watch_configuration(&self, device: &Arc<Device>) -> HookId {
        let weak: Weak<Device> = Arc::downgrade(device);
        self.register_hook(
            HookPhase::Reply,
            HookMatch::any()
                .address(device.address())
                .endpoint(EndpointNum(0))
                .pattern(HookPattern::setup(REQUEST_MASK, SET_CONFIGURATION)),
            Some(device),
            move |_: &Host, transfer: &mut Transfer| {
                if let (Some(device), Some(setup)) =
                    (weak.upgrade(), transfer.setup_fields())
                {
                    let value = setup.value as u8;
                    info!("SetConfiguration({}, {value}) found.",
                          device.address());
                    device.mark_configured(value);
                }
                HookAction::Pass
            })
    }
}

/// Parse descriptor replies to requests the guest issued itself.
fn guest_descriptor(transfer: &mut Transfer) -> HookAction {
    let (Some(device), Some(setup)) =
        (transfer.device.as_ref(), transfer.setup_fields())
    else {
        return HookAction::Pass;
    };
    let index = setup.value & 0xff;
    match setup.descriptor_type() {
        DescriptorType::Device => {
            device.apply_descriptor(DescriptorType::Device, &transfer.data);
        },
        // Only the first configuration is tracked.
        DescriptorType::Configuration if index == 0 => {
            device.apply_descriptor(DescriptorType::Configuration,
                                    &transfer.data);
        },
        kind => trace!("Ignoring {} descriptor {index} of device {}",
                       kind.description(), device.address()),
    }
    HookAction::Pass
}
