//! Per-host observer state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use arc_swap::ArcSwapOption;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use crate::device::{ClassBinder, Device};
use crate::error::{Error, Result};
use crate::hook::{
    HookAction,
    HookChains,
    HookId,
    HookMatch,
    HookPhase,
    Transfer,
};
use crate::registry::Registry;
use crate::usb::{DescriptorType, DeviceAddr, PortId};

/// Runtime knobs of an observer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObserverConfig {
    /// `wLength` of the configuration descriptor fetched after addressing.
    pub config_fetch_length: u16,
    /// Also parse descriptor replies to requests issued by the guest.
    pub track_guest_descriptors: bool,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        ObserverConfig {
            config_fetch_length: 255,
            track_guest_descriptors: true,
        }
    }
}

/// Control requests issued by the observer itself.
pub trait ControlPipe: Send + Sync {
    /// Fetch a descriptor from a device. A `max_packet_size_0` of zero
    /// means the device's control packet size is not yet known.
    fn get_descriptor(&self,
                      address: DeviceAddr,
                      max_packet_size_0: u8,
                      descriptor_type: DescriptorType,
                      index: u8,
                      length: u16)
        -> anyhow::Result<Vec<u8>>;
}

pub struct Host {
    name: String,
    config: ObserverConfig,
    pipe: Arc<dyn ControlPipe>,
    registry: Mutex<Registry>,
    bus_head: ArcSwapOption<Device>,
    hooks: HookChains,
    binders: RwLock<Vec<Arc<dyn ClassBinder>>>,
    /// Port whose status most recently showed a connect or a reset, or 0.
    ///
    /// The USB protocol has only one device at a time answering on the
    /// default address, so the host enumerates serially and the next
    /// `SET_ADDRESS` belongs to this port. Two connects close together on
    /// different ports can overwrite each other here.
    last_changed_port: AtomicU64,
}

impl Host {
    pub fn new(name: impl Into<String>,
               pipe: Arc<dyn ControlPipe>,
               config: ObserverConfig)
        -> Self
    {
        Host {
            name: name.into(),
            config,
            pipe,
            registry: Mutex::new(Registry::new()),
            bus_head: ArcSwapOption::empty(),
            hooks: HookChains::new(),
            binders: RwLock::new(Vec::new()),
            last_changed_port: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    pub(crate) fn pipe(&self) -> &dyn ControlPipe {
        self.pipe.as_ref()
    }

    pub fn hooks(&self) -> &HookChains {
        &self.hooks
    }

    pub fn register_hook<F>(&self,
                            phase: HookPhase,
                            matcher: HookMatch,
                            owner: Option<&Device>,
                            callback: F)
        -> HookId
        where F: Fn(&Host, &mut Transfer) -> HookAction + Send + Sync + 'static
    {
        self.hooks.register(phase, matcher, owner.map(Device::id), callback)
    }

    pub fn unregister_hook(&self, phase: HookPhase, id: HookId) -> Result<()> {
        self.hooks.unregister(phase, id)
    }

    pub fn add_class_binder(&self, binder: Arc<dyn ClassBinder>) {
        self.binders.write().push(binder);
    }

    /// Entry point for every observed transfer.
    pub fn on_transfer(&self, phase: HookPhase, transfer: &mut Transfer)
        -> HookAction
    {
        if transfer.device.is_none() {
            transfer.device = self.lookup_by_address(transfer.address);
        }
        self.hooks.dispatch(self, phase, transfer)
    }

    pub fn last_changed_port(&self) -> PortId {
        PortId(self.last_changed_port.load(Relaxed))
    }

    pub fn set_last_changed_port(&self, port: PortId) {
        self.last_changed_port.store(port.0, Relaxed);
    }

    pub fn lookup_by_address(&self, address: DeviceAddr)
        -> Option<Arc<Device>>
    {
        self.registry.lock().lookup_by_address(address)
    }

    pub fn lookup_by_port(&self, port: PortId) -> Option<Arc<Device>> {
        self.registry.lock().lookup_by_port(port)
    }

    /// Whether the device is still linked into this host's registry.
    pub fn is_registered(&self, device: &Device) -> bool {
        self.registry.lock()
            .get(device.id())
            .is_some_and(|live| std::ptr::eq(live.as_ref(), device))
    }

    /// Live devices, newest first.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.registry.lock().iter().cloned().collect()
    }

    pub fn device_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Newest device, readable without taking the registry lock.
    pub fn bus_head(&self) -> Option<Arc<Device>> {
        self.bus_head.load_full()
    }

    pub fn check_links(&self) -> Result<()> {
        let registry = self.registry.lock();
        registry.check_links()?;
        let mirrored = self.bus_head.load();
        match (registry.head(), mirrored.as_ref()) {
            (None, None) => Ok(()),
            (Some(head), Some(mirror)) if Arc::ptr_eq(head, mirror) => Ok(()),
            _ => Err(Error::CorruptChain(
                String::from("bus head mirror out of date"))),
        }
    }

    pub(crate) fn insert_device(&self, address: DeviceAddr, port: PortId)
        -> Arc<Device>
    {
        let mut registry = self.registry.lock();
        let device = registry.insert_with(|id| Device::new(id, address, port));
        self.bus_head.store(registry.head().cloned());
        device
    }

    /// Remove a device from the host: drop its configuration, evict its
    /// hooks, unlink it, and finally let its class handle clean up.
    /// Returns false if the device had already been freed.
    ///
    /// The device is marked freed before its hooks are evicted, so a hook
    /// registered for it concurrently is either evicted here or seen as
    /// stale by its registrant.
    pub fn free_device(&self, device: &Device) -> bool {
        let Some(handle) = device.release() else {
            return false;
        };
        let evicted = self.hooks.evict(device.id());
        {
            let mut registry = self.registry.lock();
            if registry.remove(device.id()).is_none() {
                debug!("Device {} was not in the registry of {}",
                       device.address(), self.name);
            }
            self.bus_head.store(registry.head().cloned());
        }
        if let Some(handle) = handle {
            handle.remove(device);
        }
        info!("USB Device Address({}) free, {} hooks evicted.",
              device.address(), evicted);
        true
    }

    /// Offer a freshly enumerated device to the class binders.
    pub(crate) fn bind_class(&self, device: &Arc<Device>) {
        if device.is_freed() {
            return;
        }
        let interface = device.lock().config.as_ref()
            .and_then(|tree| tree.primary_altsetting())
            .map(|alt| alt.descriptor);
        let Some(interface) = interface else {
            return;
        };
        let binders = self.binders.read().clone();
        for binder in binders {
            if let Some(handle) = binder.bind(self, device, &interface) {
                info!("Device {} bound to {} class handle",
                      device.address(), handle.name());
                if let Some(displaced) = device.set_handle(handle) {
                    displaced.remove(device);
                }
                return;
            }
        }
        let (class, subclass, protocol) = interface.class_triple();
        debug!("No class handle for device {} ({:02X}:{:02X}:{:02X})",
               device.address(), class, subclass, protocol);
    }
}
