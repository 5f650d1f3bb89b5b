//! Reaction to root hub port status changes.

use log::{debug, info, trace, warn};

use crate::host::Host;
use crate::usb::{DeviceAddr, PortId};

/// A device is attached to the port.
pub const PORT_CONNECT: u16 = 1 << 0;
/// The device on the port went away.
pub const PORT_DISCONNECT: u16 = 1 << 1;

/// What one status word did to the registry.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PortChange {
    /// Device freed because of the disconnect bit.
    pub disconnected: Option<DeviceAddr>,
    /// The connect bit was set, so the port awaits enumeration.
    pub connected: bool,
    /// Device freed because of the reset bit.
    pub reset: Option<DeviceAddr>,
}

/// Root ports are reported to the registry numbered from 1, so index 255
/// has no identifier.
fn port_id(port_index: u8) -> Option<PortId> {
    port_index.checked_add(1).map(PortId::root)
}

impl Host {
    /// Handle the connect and disconnect bits of a status word.
    pub fn handle_connect_status(&self, port_index: u8, status: u16)
        -> PortChange
    {
        let mut change = PortChange::default();
        let Some(port) = port_id(port_index) else {
            warn!("Ignoring status 0x{status:04x} of port index {port_index}");
            return change;
        };
        trace!("Port {port} status 0x{status:04x}");
        if status & PORT_DISCONNECT != 0 {
            match self.lookup_by_port(port) {
                Some(device) => {
                    info!("PORTNO {port}: USB device disconnect.");
                    self.free_device(&device);
                    change.disconnected = Some(device.address());
                },
                None => debug!("Disconnect on port {port} with no device"),
            }
        }
        if status & PORT_CONNECT != 0 {
            self.set_last_changed_port(port);
            change.connected = true;
        }
        change
    }

    /// Handle the reset bit of a status word, at bit `reset_bit`.
    /// Returns whether a device was evicted.
    pub fn handle_port_reset(&self, port_index: u8, status: u16, reset_bit: u8)
        -> bool
    {
        self.reset_port(port_index, status, reset_bit).is_some()
    }

    fn reset_port(&self, port_index: u8, status: u16, reset_bit: u8)
        -> Option<DeviceAddr>
    {
        let mask = 1u16.checked_shl(u32::from(reset_bit))?;
        if status & mask == 0 {
            return None;
        }
        let port = port_id(port_index)?;
        let Some(device) = self.lookup_by_port(port) else {
            debug!("Reset on port {port} with no device");
            return None;
        };
        info!("PORTNO {port}: reset, releasing device {}.", device.address());
        self.set_last_changed_port(port);
        self.free_device(&device).then_some(device.address())
    }

    /// Entry point for every observed port status word.
    pub fn on_port_status(&self, port_index: u8, status: u16, reset_bit: u8)
        -> PortChange
    {
        let mut change = self.handle_connect_status(port_index, status);
        change.reset = self.reset_port(port_index, status, reset_bit);
        change
    }
}
