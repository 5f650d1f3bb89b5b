//! Descriptor records and the configuration tree built from them.
//!
//! A `GET_DESCRIPTOR(CONFIG)` reply is a run of concatenated records, each
//! opened by a `bLength`/`bDescriptorType` header. The standard records
//! (configuration, interface, endpoint) open a level of the tree; any other
//! record is attached as raw bytes to the level that was most recently
//! opened, or to the tree-wide *other* bucket when no level is open.

use log::{debug, trace, warn};

use crate::usb::{
    CONFIG_DESCRIPTOR_SIZE,
    ConfigDescriptor,
    DescriptorHeader,
    DescriptorType,
    DeviceDescriptor,
    EndpointDescriptor,
    InterfaceDescriptor,
    read_prefix,
};

/// One record of a descriptor stream, borrowed from the reply buffer.
#[derive(Debug)]
pub enum Record<'bytes> {
    Configuration(ConfigDescriptor, &'bytes [u8]),
    Interface(InterfaceDescriptor, &'bytes [u8]),
    Endpoint(EndpointDescriptor, &'bytes [u8]),
    Unknown(DescriptorType, &'bytes [u8]),
    /// Trailing bytes too short to hold the record their header announces.
    Truncated(&'bytes [u8]),
}

impl Record<'_> {
    pub fn bytes(&self) -> &[u8] {
        use Record::*;
        match self {
            Configuration(_, bytes) |
            Interface(_, bytes) |
            Endpoint(_, bytes) |
            Unknown(_, bytes) |
            Truncated(bytes) => bytes,
        }
    }
}

/// Walks the records of a descriptor stream in wire order.
///
/// Iteration ends at the end of the buffer, after a truncated record, or
/// at the first record with a `bLength` of zero.
pub struct RecordIterator<'bytes> {
    bytes: &'bytes [u8],
    offset: usize,
    zero_length_at: Option<usize>,
}

impl<'bytes> RecordIterator<'bytes> {
    pub fn new(bytes: &'bytes [u8]) -> Self {
        RecordIterator {
            bytes,
            offset: 0,
            zero_length_at: None,
        }
    }

    /// Offset of the zero-length record that stopped iteration, if any.
    pub fn zero_length_at(&self) -> Option<usize> {
        self.zero_length_at
    }

    /// Number of bytes handed out so far.
    pub fn consumed(&self) -> usize {
        self.offset
    }
}

impl<'bytes> Iterator for RecordIterator<'bytes> {
    type Item = Record<'bytes>;

    fn next(&mut self) -> Option<Record<'bytes>> {
        if self.zero_length_at.is_some() || self.offset >= self.bytes.len() {
            return None;
        }
        let remaining = &self.bytes[self.offset..];
        let Some(header) = DescriptorHeader::from_bytes(remaining) else {
            self.offset = self.bytes.len();
            return Some(Record::Truncated(remaining));
        };
        let length = header.length as usize;
        if length == 0 {
            self.zero_length_at = Some(self.offset);
            return None;
        }
        if length > remaining.len() {
            self.offset = self.bytes.len();
            return Some(Record::Truncated(remaining));
        }
        let bytes = &remaining[..length];
        self.offset += length;
        Some(match header.kind() {
            DescriptorType::Configuration =>
                Record::Configuration(read_prefix(bytes), bytes),
            DescriptorType::Interface =>
                Record::Interface(read_prefix(bytes), bytes),
            DescriptorType::Endpoint =>
                Record::Endpoint(read_prefix(bytes), bytes),
            other => Record::Unknown(other, bytes),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub descriptor: EndpointDescriptor,
    /// Wire bytes of the record; empty for the synthesized endpoint zero.
    pub raw: Vec<u8>,
    pub extra: Vec<u8>,
}

impl Endpoint {
    fn synthesized(max_packet_size_0: u8) -> Self {
        Endpoint {
            descriptor: EndpointDescriptor::endpoint_zero(max_packet_size_0),
            raw: Vec::new(),
            extra: Vec::new(),
        }
    }

    pub fn is_synthesized(&self) -> bool {
        self.raw.is_empty()
    }
}

/// One alternate setting of an interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AltSetting {
    pub descriptor: InterfaceDescriptor,
    pub raw: Vec<u8>,
    pub extra: Vec<u8>,
    /// Index 0 is the synthesized control endpoint once the tree has been
    /// installed on a device; parsed endpoints follow in wire order.
    pub endpoints: Vec<Endpoint>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Interface {
    pub altsettings: Vec<AltSetting>,
}

impl Interface {
    pub fn num_altsetting(&self) -> usize {
        self.altsettings.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Configuration {
    pub descriptor: ConfigDescriptor,
    pub raw: Vec<u8>,
    pub extra: Vec<u8>,
    pub interface: Interface,
}

/// Every configuration found in one reply, plus the bytes that belonged
/// to no open level.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigTree {
    pub configurations: Vec<Configuration>,
    pub other: Vec<u8>,
    /// Length of the reply the tree was built from.
    pub reply_length: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Level {
    Configuration,
    Interface,
    Endpoint,
}

fn try_push<T>(vec: &mut Vec<T>, value: T) -> bool {
    if vec.try_reserve(1).is_err() {
        warn!("Out of memory extending descriptor tree");
        return false;
    }
    vec.push(value);
    true
}

fn try_append(buf: &mut Vec<u8>, bytes: &[u8]) -> bool {
    if buf.try_reserve(bytes.len()).is_err() {
        warn!("Out of memory storing {} descriptor bytes", bytes.len());
        return false;
    }
    buf.extend_from_slice(bytes);
    true
}

impl ConfigTree {
    /// Build a tree from a configuration reply, without endpoint zero.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut tree = ConfigTree {
            reply_length: bytes.len(),
            ..ConfigTree::default()
        };
        let mut last_level: Option<Level> = None;
        let mut records = RecordIterator::new(bytes);
        for record in records.by_ref() {
            match record {
                Record::Configuration(descriptor, raw) => {
                    trace!("a config. descriptor found");
                    let config = Configuration {
                        descriptor,
                        raw: raw.to_vec(),
                        extra: Vec::new(),
                        interface: Interface::default(),
                    };
                    if try_push(&mut tree.configurations, config) {
                        last_level = Some(Level::Configuration);
                    }
                },
                Record::Interface(descriptor, raw) => {
                    trace!("an interface descriptor found");
                    let Some(config) = tree.configurations.last_mut() else {
                        debug!("Interface descriptor with no configuration");
                        try_append(&mut tree.other, raw);
                        continue;
                    };
                    let alt = AltSetting {
                        descriptor,
                        raw: raw.to_vec(),
                        extra: Vec::new(),
                        endpoints: Vec::new(),
                    };
                    if try_push(&mut config.interface.altsettings, alt) {
                        last_level = Some(Level::Interface);
                    }
                },
                Record::Endpoint(descriptor, raw) => {
                    trace!("an endpoint descriptor found");
                    let alt = tree.configurations
                        .last_mut()
                        .and_then(|c| c.interface.altsettings.last_mut());
                    let Some(alt) = alt else {
                        debug!("Endpoint descriptor with no interface");
                        try_append(&mut tree.other, raw);
                        continue;
                    };
                    let endpoint = Endpoint {
                        descriptor,
                        raw: raw.to_vec(),
                        extra: Vec::new(),
                    };
                    if try_push(&mut alt.endpoints, endpoint) {
                        last_level = Some(Level::Endpoint);
                    }
                },
                Record::Unknown(kind, raw) => {
                    trace!("other descriptor ({:02x}, {}) follows {:?}",
                           u8::from(kind), kind.description(), last_level);
                    let target = tree.extra_for(last_level);
                    try_append(target, raw);
                },
                Record::Truncated(raw) => {
                    debug!("Truncated descriptor record of {} bytes",
                           raw.len());
                    try_append(&mut tree.other, raw);
                },
            }
        }
        if let Some(offset) = records.zero_length_at() {
            debug!("0 byte descriptor at offset {offset}, \
                    ignoring {} remaining bytes", bytes.len() - offset);
        }
        tree
    }

    fn extra_for(&mut self, level: Option<Level>) -> &mut Vec<u8> {
        match (level, self.configurations.last_mut()) {
            (Some(Level::Configuration), Some(config)) => &mut config.extra,
            (Some(Level::Interface), Some(config)) => {
                match config.interface.altsettings.last_mut() {
                    Some(alt) => &mut alt.extra,
                    None => &mut config.extra,
                }
            },
            (Some(Level::Endpoint), Some(config)) => {
                match config.interface.altsettings.last_mut() {
                    Some(alt) => match alt.endpoints.last_mut() {
                        Some(endpoint) => &mut endpoint.extra,
                        None => &mut alt.extra,
                    },
                    None => &mut config.extra,
                }
            },
            _ => &mut self.other,
        }
    }

    /// Whether the reply was too short to hold more than the bare
    /// configuration header, although interfaces were announced.
    pub fn is_incomplete(&self) -> bool {
        match self.configurations.first() {
            Some(config) =>
                config.descriptor.num_interfaces() != 0 &&
                self.reply_length <= CONFIG_DESCRIPTOR_SIZE,
            None => false,
        }
    }

    /// Prepend the control endpoint to every alt-setting's endpoint list.
    pub fn synthesize_endpoint_zero(&mut self, max_packet_size_0: u8) {
        for alt in self.configurations
            .iter_mut()
            .flat_map(|c| c.interface.altsettings.iter_mut())
        {
            if alt.endpoints.first().is_some_and(Endpoint::is_synthesized) {
                alt.endpoints[0] = Endpoint::synthesized(max_packet_size_0);
            } else if alt.endpoints.try_reserve(1).is_ok() {
                alt.endpoints.insert(0, Endpoint::synthesized(max_packet_size_0));
            } else {
                warn!("Out of memory adding endpoint zero");
            }
        }
    }

    /// The configuration consulted by enumeration.
    pub fn first(&self) -> Option<&Configuration> {
        self.configurations.first()
    }

    /// The first alt-setting of the first configuration's interface.
    pub fn primary_altsetting(&self) -> Option<&AltSetting> {
        self.first().and_then(|c| c.interface.altsettings.first())
    }

    /// Concatenate the wire bytes of every record in emit order. The
    /// synthesized endpoint zero is not part of the output.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.attributed_length());
        for config in &self.configurations {
            bytes.extend_from_slice(&config.raw);
            bytes.extend_from_slice(&config.extra);
            for alt in &config.interface.altsettings {
                bytes.extend_from_slice(&alt.raw);
                bytes.extend_from_slice(&alt.extra);
                for endpoint in &alt.endpoints {
                    bytes.extend_from_slice(&endpoint.raw);
                    bytes.extend_from_slice(&endpoint.extra);
                }
            }
        }
        bytes.extend_from_slice(&self.other);
        bytes
    }

    /// Number of reply bytes held somewhere in the tree.
    pub fn attributed_length(&self) -> usize {
        let endpoints = |alt: &AltSetting| -> usize {
            alt.endpoints
                .iter()
                .map(|e| e.raw.len() + e.extra.len())
                .sum()
        };
        let altsettings = |config: &Configuration| -> usize {
            config.interface.altsettings
                .iter()
                .map(|a| a.raw.len() + a.extra.len() + endpoints(a))
                .sum()
        };
        self.configurations
            .iter()
            .map(|c| c.raw.len() + c.extra.len() + altsettings(c))
            .sum::<usize>() + self.other.len()
    }
}

/// Parse a configuration reply for a device whose endpoint zero has the
/// given maximum packet size.
///
/// Returns `None` when the reply holds no configuration record, or when it
/// is too short to be anything but the header a host fetches first to learn
/// `wTotalLength`; in both cases any previously installed tree should stay.
pub fn parse_config_descriptor(bytes: &[u8], max_packet_size_0: u8)
    -> Option<ConfigTree>
{
    if bytes.is_empty() {
        return None;
    }
    let mut tree = ConfigTree::from_bytes(bytes);
    if tree.configurations.is_empty() {
        debug!("No configuration descriptor in {} byte reply", bytes.len());
        return None;
    }
    if tree.configurations.len() > 1 {
        debug!("{} configurations in one reply, only the first is used",
               tree.configurations.len());
    }
    if tree.is_incomplete() {
        debug!("Ignoring incomplete configuration descriptor ({} bytes)",
               bytes.len());
        return None;
    }
    tree.synthesize_endpoint_zero(max_packet_size_0);
    Some(tree)
}

/// Apply a (possibly partial) device descriptor reply. Only the leading
/// `min(len, 18)` bytes of `descriptor` change. Returns the number of
/// bytes that were valid.
pub fn parse_device_descriptor(descriptor: &mut DeviceDescriptor,
                               bytes: &[u8])
    -> usize
{
    let valid = descriptor.update_from(bytes);
    if valid > 8 {
        trace!("bDeviceClass = 0x{:02x}, bMaxPacketSize0 = {}",
               descriptor.device_class, descriptor.max_packet_size_0);
    }
    if valid >= 14 {
        trace!("idVendor = 0x{:04x}, idProduct = 0x{:04x}, bcdDevice = {}",
               descriptor.vendor_id, descriptor.product_id,
               descriptor.device_version);
    }
    valid
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_xorshift::XorShiftRng;

    pub const MOUSE_CONFIG: [u8; 34] = [
        // Configuration: 1 interface, value 1, bus powered, 100mA.
        0x09, 0x02, 0x22, 0x00, 0x01, 0x01, 0x00, 0xA0, 0x32,
        // Interface 0: one endpoint, HID boot mouse.
        0x09, 0x04, 0x00, 0x00, 0x01, 0x03, 0x01, 0x02, 0x00,
        // HID descriptor.
        0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x34, 0x00,
        // Endpoint 0x81: interrupt, 4 bytes, interval 10.
        0x07, 0x05, 0x81, 0x03, 0x04, 0x00, 0x0A,
    ];

    #[test]
    fn test_mouse_config() {
        let tree = parse_config_descriptor(&MOUSE_CONFIG, 8).unwrap();
        assert_eq!(tree.configurations.len(), 1);
        let config = tree.first().unwrap();
        assert_eq!(config.descriptor.num_interfaces(), 1);
        assert_eq!(config.descriptor.total_length(), 34);
        assert!(config.extra.is_empty());
        assert_eq!(config.interface.num_altsetting(), 1);
        let alt = &config.interface.altsettings[0];
        assert_eq!(alt.descriptor.num_endpoints(), 1);
        assert_eq!(alt.descriptor.class_triple(), (3, 1, 2));
        assert_eq!(alt.extra, &MOUSE_CONFIG[18..27]);
        assert_eq!(alt.endpoints.len(), 2);
        assert!(alt.endpoints[0].is_synthesized());
        assert_eq!(alt.endpoints[0].descriptor.max_packet_size(), 8);
        let ep1 = &alt.endpoints[1];
        assert!(!ep1.is_synthesized());
        assert_eq!(ep1.descriptor.address().0, 0x81);
        assert_eq!(ep1.descriptor.max_packet_size(), 4);
        assert!(tree.other.is_empty());
    }

    #[test]
    fn test_round_trip() {
        let tree = parse_config_descriptor(&MOUSE_CONFIG, 64).unwrap();
        assert_eq!(tree.to_bytes(), MOUSE_CONFIG);
        assert_eq!(tree.attributed_length(), MOUSE_CONFIG.len());
    }

    #[test]
    fn test_record_iterator() {
        let mut records = RecordIterator::new(&MOUSE_CONFIG[..30]);
        let mut seen = Vec::new();
        let mut kinds = Vec::new();
        for record in records.by_ref() {
            seen.extend_from_slice(record.bytes());
            kinds.push(match record {
                Record::Configuration(..) => "config",
                Record::Interface(..) => "interface",
                Record::Endpoint(..) => "endpoint",
                Record::Unknown(..) => "unknown",
                Record::Truncated(..) => "truncated",
            });
        }
        assert_eq!(kinds,
                   ["config", "interface", "unknown", "truncated"]);
        assert_eq!(seen, &MOUSE_CONFIG[..30]);
        assert_eq!(records.consumed(), 30);
        assert_eq!(records.zero_length_at(), None);

        let mut bytes = MOUSE_CONFIG[..9].to_vec();
        bytes.extend_from_slice(&[0x00, 0x04]);
        let mut records = RecordIterator::new(&bytes);
        assert_eq!(records.by_ref().count(), 1);
        assert_eq!(records.consumed(), 9);
        assert_eq!(records.zero_length_at(), Some(9));
    }

    #[test]
    fn test_zero_length_record() {
        let mut bytes = MOUSE_CONFIG[..9].to_vec();
        bytes.extend_from_slice(&[0x00, 0x00, 0x00, 0x09, 0x04]);
        bytes.extend_from_slice(&MOUSE_CONFIG[9..]);
        let tree = parse_config_descriptor(&bytes, 8).unwrap();
        let config = tree.first().unwrap();
        assert_eq!(config.raw, &MOUSE_CONFIG[..9]);
        assert_eq!(config.interface.num_altsetting(), 0);
        assert!(tree.other.is_empty());
    }

    #[test]
    fn test_incomplete_header() {
        assert!(parse_config_descriptor(&MOUSE_CONFIG[..9], 8).is_none());
        let tree = ConfigTree::from_bytes(&MOUSE_CONFIG[..9]);
        assert!(tree.is_incomplete());
        // A configuration announcing no interfaces is complete as it is.
        let mut empty = MOUSE_CONFIG[..9].to_vec();
        empty[4] = 0;
        assert!(parse_config_descriptor(&empty, 8).is_some());
    }

    #[test]
    fn test_no_configuration() {
        assert!(parse_config_descriptor(&[], 8).is_none());
        assert!(parse_config_descriptor(&MOUSE_CONFIG[9..], 8).is_none());
    }

    #[test]
    fn test_orphan_records() {
        // Interface and endpoint records before any configuration.
        let bytes = &MOUSE_CONFIG[9..];
        let tree = ConfigTree::from_bytes(bytes);
        assert!(tree.configurations.is_empty());
        assert_eq!(tree.other, bytes);
    }

    #[test]
    fn test_endpoint_extras() {
        // SuperSpeed companion descriptor after an endpoint.
        let mut bytes = MOUSE_CONFIG.to_vec();
        let companion = [0x06, 0x30, 0x00, 0x00, 0x00, 0x00];
        bytes.extend_from_slice(&companion);
        bytes[2] = bytes.len() as u8;
        let tree = parse_config_descriptor(&bytes, 8).unwrap();
        let alt = &tree.first().unwrap().interface.altsettings[0];
        assert_eq!(alt.endpoints[1].extra, companion);
        assert_eq!(alt.extra, &MOUSE_CONFIG[18..27]);
        assert_eq!(tree.to_bytes(), bytes);
    }

    #[test]
    fn test_consecutive_class_descriptors() {
        // Two class descriptors after the configuration record both stay
        // with the configuration.
        let mut bytes = MOUSE_CONFIG[..9].to_vec();
        let iad = [0x08, 0x0B, 0x00, 0x02, 0x0E, 0x03, 0x00, 0x00];
        let vendor = [0x04, 0xFF, 0x01, 0x02];
        bytes.extend_from_slice(&iad);
        bytes.extend_from_slice(&vendor);
        bytes.extend_from_slice(&MOUSE_CONFIG[9..]);
        let tree = parse_config_descriptor(&bytes, 8).unwrap();
        let config = tree.first().unwrap();
        assert_eq!(config.extra.len(), iad.len() + vendor.len());
        assert_eq!(&config.extra[..8], iad);
        assert_eq!(config.interface.altsettings[0].extra.len(), 9);
    }

    #[test]
    fn test_alt_settings_get_endpoint_zero() {
        let mut bytes = MOUSE_CONFIG.to_vec();
        // Alternate setting 1 of interface 0, with no endpoints.
        bytes.extend_from_slice(
            &[0x09, 0x04, 0x00, 0x01, 0x00, 0x03, 0x01, 0x02, 0x00]);
        let tree = parse_config_descriptor(&bytes, 16).unwrap();
        let interface = &tree.first().unwrap().interface;
        assert_eq!(interface.num_altsetting(), 2);
        for alt in &interface.altsettings {
            assert!(alt.endpoints[0].is_synthesized());
            assert_eq!(alt.endpoints[0].descriptor.max_packet_size(), 16);
        }
        assert_eq!(interface.altsettings[1].endpoints.len(), 1);
    }

    #[test]
    fn test_truncated_record() {
        let bytes = &MOUSE_CONFIG[..30];
        let tree = parse_config_descriptor(bytes, 8).unwrap();
        let alt = &tree.first().unwrap().interface.altsettings[0];
        assert_eq!(alt.endpoints.len(), 1);
        assert_eq!(tree.other, &MOUSE_CONFIG[27..30]);
        assert_eq!(tree.attributed_length(), bytes.len());
    }

    #[test]
    fn test_resynthesis_is_idempotent() {
        let mut tree = parse_config_descriptor(&MOUSE_CONFIG, 8).unwrap();
        tree.synthesize_endpoint_zero(64);
        let alt = &tree.first().unwrap().interface.altsettings[0];
        assert_eq!(alt.endpoints.len(), 2);
        assert_eq!(alt.endpoints[0].descriptor.max_packet_size(), 64);
    }

    #[test]
    fn test_device_descriptor_prefix() {
        let mut descriptor = DeviceDescriptor::default();
        let full = [
            0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x08,
            0x6D, 0x04, 0x77, 0xC0, 0x00, 0x01, 0x01, 0x02, 0x00, 0x01];
        assert_eq!(parse_device_descriptor(&mut descriptor, &full), 18);
        assert_eq!(descriptor.vendor_id, 0x046D);
        assert_eq!(descriptor.product_id, 0xC077);
        let prefix = [0x12, 0x01, 0x10, 0x01, 0x00, 0x00, 0x00, 0x40];
        assert_eq!(parse_device_descriptor(&mut descriptor, &prefix), 8);
        assert_eq!(descriptor.max_packet_size_0, 0x40);
        assert_eq!(descriptor.vendor_id, 0x046D);
        assert_eq!(descriptor.num_configurations, 1);
    }

    fn random_record(prng: &mut XorShiftRng) -> Vec<u8> {
        let (kind, length) = match prng.gen_range(0..6) {
            0 => (2, 9),
            1 | 2 => (4, 9),
            3 => (5, 7),
            4 => (0x21, 9),
            _ => (prng.gen_range(0x06..0xFF), prng.gen_range(2..20)),
        };
        let mut record = vec![0u8; length];
        prng.fill(&mut record[2..]);
        record[0] = length as u8;
        record[1] = kind;
        record
    }

    #[test]
    fn test_every_byte_attributed() {
        let mut prng = XorShiftRng::seed_from_u64(42);
        for _ in 0..500 {
            let count = prng.gen_range(1..24);
            let bytes: Vec<u8> = (0..count)
                .flat_map(|_| random_record(&mut prng))
                .collect();
            let tree = ConfigTree::from_bytes(&bytes);
            assert_eq!(tree.attributed_length(), bytes.len());
            if tree.other.is_empty() {
                assert_eq!(tree.to_bytes(), bytes);
            }
        }
    }
}
