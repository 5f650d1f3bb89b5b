use std::mem::size_of;

use bytemuck::{Zeroable as _, bytes_of_mut};
use bytemuck_derive::{Pod, Zeroable};
use derive_more::{From, Into, Display};
use itertools::Itertools;
use num_enum::{IntoPrimitive, FromPrimitive};
use usb_ids::FromId;

/// Size of the setup packet that opens every control transfer.
pub const SETUP_PACKET_SIZE: usize = 8;

/// Size of the part of a device descriptor that a device must return
/// before its maximum packet size for endpoint zero is known.
pub const DEVICE_DESCRIPTOR_PREFIX: usize = 8;

pub const DEVICE_DESCRIPTOR_SIZE: usize = size_of::<DeviceDescriptor>();
pub const CONFIG_DESCRIPTOR_SIZE: usize = size_of::<ConfigDescriptor>();
pub const INTERFACE_DESCRIPTOR_SIZE: usize = size_of::<InterfaceDescriptor>();
pub const ENDPOINT_DESCRIPTOR_SIZE: usize = size_of::<EndpointDescriptor>();

/// Maximum number of hub levels a port identifier can describe.
pub const PORT_PATH_LIMIT: usize = 8;

#[allow(clippy::upper_case_acronyms)]
#[derive(Copy, Clone, Debug, Default, IntoPrimitive, FromPrimitive,
         PartialEq, Eq, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum PID {
    OUT   = 0xE1,
    IN    = 0x69,
    SETUP = 0x2D,
    #[default]
    Malformed = 0,
}

impl std::fmt::Display for PID {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Hash,
         Pod, Zeroable, From, Into, Display)]
#[derive(serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct DeviceAddr(pub u8);

impl DeviceAddr {
    /// Address every device answers on before `SET_ADDRESS`.
    pub const DEFAULT: DeviceAddr = DeviceAddr(0);

    /// Extract the new address from the `wValue` of a `SET_ADDRESS`.
    pub fn from_set_address(value: u16) -> Self {
        DeviceAddr((value & 0x7F) as u8)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Hash,
         Pod, Zeroable, From, Into, Display)]
#[derive(serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct EndpointNum(pub u8);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default,
         Pod, Zeroable, From, Into, Display)]
#[repr(transparent)]
pub struct EndpointAddr(pub u8);

impl EndpointAddr {
    pub fn number(&self) -> EndpointNum {
        EndpointNum(self.0 & 0x7F)
    }

    pub fn direction(&self) -> Direction {
        if self.0 & 0x80 == 0 {
            Direction::Out
        } else {
            Direction::In
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default,
         Pod, Zeroable, From, Into, Display)]
#[repr(transparent)]
pub struct EndpointAttr(pub u8);

impl EndpointAttr {
    pub fn endpoint_type(&self) -> EndpointType {
        EndpointType::from(self.0 & 0x03)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum EndpointType {
    #[default]
    Control     = 0,
    Isochronous = 1,
    Bulk        = 2,
    Interrupt   = 3,
}

impl std::fmt::Display for EndpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Control => write!(f, "control"),
            Self::Isochronous => write!(f, "isochronous"),
            Self::Bulk => write!(f, "bulk"),
            Self::Interrupt => write!(f, "interrupt"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BCDVersion {
    pub minor: u8,
    pub major: u8,
}

impl std::fmt::Display for BCDVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:X}.{:02X}", self.major, self.minor)
    }
}

#[derive(Copy, Clone, Debug, FromPrimitive, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    #[default]
    Reserved = 3,
}

#[derive(Copy, Clone, Debug, FromPrimitive, PartialEq, Eq)]
#[repr(u8)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
    #[default]
    Reserved = 4,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash,
         FromPrimitive, IntoPrimitive)]
#[derive(serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum Direction {
    #[default]
    Out = 0,
    In = 1,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", match self {
            Direction::In  => "IN",
            Direction::Out => "OUT"})
    }
}

bitfield! {
    #[derive(Copy, Clone, Debug, Default)]
    pub struct RequestTypeFields(u8);
    pub u8, into Recipient, recipient, _: 4, 0;
    pub u8, into RequestType, request_type, _: 6, 5;
    pub u8, into Direction, direction, _: 7, 7;
}

/// Decoded fields of an 8-byte setup packet.
#[derive(Copy, Clone, Debug)]
pub struct SetupFields {
    pub type_fields: RequestTypeFields,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupFields {
    pub fn from_bytes(packet: &[u8; SETUP_PACKET_SIZE]) -> Self {
        SetupFields {
            type_fields: RequestTypeFields(packet[0]),
            request: packet[1],
            value: u16::from_le_bytes([packet[2], packet[3]]),
            index: u16::from_le_bytes([packet[4], packet[5]]),
            length: u16::from_le_bytes([packet[6], packet[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_SIZE] {
        let [v0, v1] = self.value.to_le_bytes();
        let [i0, i1] = self.index.to_le_bytes();
        let [l0, l1] = self.length.to_le_bytes();
        [self.type_fields.0, self.request, v0, v1, i0, i1, l0, l1]
    }

    /// Build a standard device-to-host `GET_DESCRIPTOR` request.
    pub fn get_descriptor(desc_type: DescriptorType, index: u8, length: u16)
        -> Self
    {
        SetupFields {
            type_fields: RequestTypeFields(0x80),
            request: StandardRequest::GetDescriptor.into(),
            value: (u16::from(u8::from(desc_type)) << 8) | u16::from(index),
            index: 0,
            length,
        }
    }

    /// Build a standard host-to-device request with no data stage.
    pub fn standard(request: StandardRequest, value: u16) -> Self {
        SetupFields {
            type_fields: RequestTypeFields(0x00),
            request: request.into(),
            value,
            index: 0,
            length: 0,
        }
    }

    /// The standard request, if this is a standard request at all.
    pub fn standard_request(&self) -> Option<StandardRequest> {
        match self.type_fields.request_type() {
            RequestType::Standard => Some(StandardRequest::from(self.request)),
            _ => None,
        }
    }

    /// Descriptor type selected by a `GET_DESCRIPTOR` request.
    pub fn descriptor_type(&self) -> DescriptorType {
        DescriptorType::from((self.value >> 8) as u8)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StandardRequest {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    SetDescriptor = 7,
    GetConfiguration = 8,
    SetConfiguration = 9,
    GetInterface = 10,
    SetInterface = 11,
    SynchFrame = 12,
    #[default]
    Unknown = 13,
}

#[derive(Copy, Clone, Debug, FromPrimitive, IntoPrimitive, PartialEq, Eq)]
#[repr(u8)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
    #[num_enum(catch_all)]
    Other(u8),
}

impl DescriptorType {
    pub fn description(self) -> &'static str {
        use DescriptorType::*;
        match self {
            Device => "device",
            Configuration => "configuration",
            String => "string",
            Interface => "interface",
            Endpoint => "endpoint",
            DeviceQualifier => "device qualifier",
            OtherSpeedConfiguration => "other speed configuration",
            InterfacePower => "interface power",
            Other(0x21) => "HID",
            Other(_) => "class or vendor specific",
        }
    }
}

/// The two bytes that open every descriptor record.
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct DescriptorHeader {
    pub length: u8,
    pub descriptor_type: u8,
}

impl DescriptorHeader {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [length, descriptor_type, ..] => Some(DescriptorHeader {
                length: *length,
                descriptor_type: *descriptor_type,
            }),
            _ => None,
        }
    }

    pub fn kind(&self) -> DescriptorType {
        DescriptorType::from(self.descriptor_type)
    }
}

/// Read a descriptor record whose wire length may be shorter than the
/// structure. Missing trailing fields are left zeroed; surplus bytes are
/// ignored.
pub fn read_prefix<T: bytemuck::Pod>(bytes: &[u8]) -> T {
    let mut value = T::zeroed();
    let target = bytes_of_mut(&mut value);
    let count = bytes.len().min(target.len());
    target[..count].copy_from_slice(&bytes[..count]);
    value
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub usb_version: BCDVersion,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size_0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: BCDVersion,
    pub manufacturer_str_id: u8,
    pub product_str_id: u8,
    pub serial_str_id: u8,
    pub num_configurations: u8
}

impl DeviceDescriptor {
    /// Overwrite the leading bytes of this descriptor with a (possibly
    /// partial) reply. Returns the number of bytes taken from `bytes`.
    pub fn update_from(&mut self, bytes: &[u8]) -> usize {
        let target = bytes_of_mut(self);
        let count = bytes.len().min(target.len());
        target[..count].copy_from_slice(&bytes[..count]);
        count
    }

    pub fn vendor_name(&self) -> Option<&'static str> {
        usb_ids::Vendor::from_id(self.vendor_id).map(|v| v.name())
    }

    pub fn product_name(&self) -> Option<&'static str> {
        usb_ids::Device::from_vid_pid(self.vendor_id, self.product_id)
            .map(|d| d.name())
    }
}

impl std::fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vendor_id, self.product_id)?;
        match (self.vendor_name(), self.product_name()) {
            (Some(vendor), Some(product)) => write!(f, " ({vendor} {product})"),
            (Some(vendor), None) => write!(f, " ({vendor})"),
            _ => Ok(())
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct ConfigDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub total_length: u16,
    pub num_interfaces: u8,
    pub config_value: u8,
    pub config_str_id: u8,
    pub attributes: u8,
    pub max_power: u8
}

impl ConfigDescriptor {
    pub fn total_length(&self) -> u16 {
        self.total_length
    }

    pub fn num_interfaces(&self) -> u8 {
        self.num_interfaces
    }

    pub fn config_value(&self) -> u8 {
        self.config_value
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface_str_id: u8,
}

impl InterfaceDescriptor {
    pub fn num_endpoints(&self) -> u8 {
        self.num_endpoints
    }

    pub fn class_triple(&self) -> (u8, u8, u8) {
        (self.interface_class,
         self.interface_subclass,
         self.interface_protocol)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub endpoint_address: EndpointAddr,
    pub attributes: EndpointAttr,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    /// The control endpoint every alt-setting implicitly carries.
    pub fn endpoint_zero(max_packet_size_0: u8) -> Self {
        EndpointDescriptor {
            max_packet_size: u16::from(max_packet_size_0),
            ..EndpointDescriptor::zeroed()
        }
    }

    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    pub fn address(&self) -> EndpointAddr {
        self.endpoint_address
    }
}

/// Packed path through the USB tree to a device.
///
/// Each byte is a port number on one hub; the least significant byte is
/// the port on the nearest upstream hub, so a device on root port 1 is
/// `0x01`, and a device on port 3 of a hub on root port 1 is `0x0103`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Hash, From, Into)]
#[derive(serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct PortId(pub u64);

impl PortId {
    pub const NONE: PortId = PortId(0);

    /// Identifier of a root hub port, numbered from 1.
    pub fn root(port: u8) -> Self {
        PortId(u64::from(port))
    }

    /// Identifier of the given port on a hub attached at this port.
    /// Returns `None` when the path is already at the hub depth limit.
    pub fn downstream(self, port: u8) -> Option<Self> {
        if self.depth() >= PORT_PATH_LIMIT {
            return None;
        }
        Some(PortId((self.0 << 8) | u64::from(port)))
    }

    /// Identifier of the hub port this path hangs off, if any.
    pub fn parent(self) -> Option<Self> {
        match self.0 >> 8 {
            0 => None,
            upstream => Some(PortId(upstream)),
        }
    }

    /// Port number on the nearest upstream hub.
    pub fn port(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// Number of hub levels in the path.
    pub fn depth(self) -> usize {
        PORT_PATH_LIMIT - (self.0.leading_zeros() as usize / 8)
    }
}

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let path = self.0
            .to_be_bytes()
            .iter()
            .map(|byte| byte.to_string())
            .join("-");
        write!(f, "{path}")
    }
}
