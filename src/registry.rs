//! Registry of live devices.
//!
//! Devices live in an arena of generational slots and are threaded through
//! a doubly linked chain, newest first. The registry itself does no locking;
//! the host keeps it behind a mutex.

use std::sync::Arc;

use crate::device::{Device, DeviceId};
use crate::error::{Error, Result};
use crate::id::Handle;
use crate::usb::{DeviceAddr, PortId};

struct Entry {
    device: Arc<Device>,
    prev: Option<DeviceId>,
    next: Option<DeviceId>,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
pub struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<DeviceId>,
    len: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn entry(&self, id: DeviceId) -> Option<&Entry> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn entry_mut(&mut self, id: DeviceId) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Entry that the chain says is linked. A missing one means the chain
    /// was modified without the registry lock, which is unrecoverable.
    fn linked(&mut self, id: DeviceId) -> &mut Entry {
        match self.entry_mut(id) {
            Some(entry) => entry,
            None => panic!("Device chain links to free slot {id:?}"),
        }
    }

    pub fn get(&self, id: DeviceId) -> Option<&Arc<Device>> {
        self.entry(id).map(|entry| &entry.device)
    }

    /// Most recently inserted device.
    pub fn head(&self) -> Option<&Arc<Device>> {
        self.head.and_then(|id| self.get(id))
    }

    /// Allocate a slot, build a device for it, and link it at the head of
    /// the chain.
    pub fn insert_with<F>(&mut self, build: F) -> Arc<Device>
        where F: FnOnce(DeviceId) -> Device
    {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let id = Handle::new(index, self.slots[index as usize].generation);
        let device = Arc::new(build(id));
        let next = self.head;
        if let Some(old_head) = next {
            let old = self.linked(old_head);
            debug_assert!(old.prev.is_none());
            old.prev = Some(id);
        }
        self.slots[index as usize].entry = Some(Entry {
            device: device.clone(),
            prev: None,
            next,
        });
        self.head = Some(id);
        self.len += 1;
        device
    }

    /// Unlink a device and free its slot. Returns `None` for a handle that
    /// is stale or was never issued.
    pub fn remove(&mut self, id: DeviceId) -> Option<Arc<Device>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let Entry { device, prev, next } = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        match prev {
            Some(prev_id) => {
                let prev_entry = self.linked(prev_id);
                assert_eq!(prev_entry.next, Some(id),
                           "Broken next link at {prev_id:?}");
                prev_entry.next = next;
            },
            None => {
                assert_eq!(self.head, Some(id), "Broken head link");
                self.head = next;
            }
        }
        if let Some(next_id) = next {
            let next_entry = self.linked(next_id);
            assert_eq!(next_entry.prev, Some(id),
                       "Broken prev link at {next_id:?}");
            next_entry.prev = prev;
        }
        self.free.push(id.index);
        self.len -= 1;
        Some(device)
    }

    /// Devices in chain order, newest first.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            registry: self,
            cursor: self.head,
        }
    }

    pub fn lookup_by_address(&self, address: DeviceAddr)
        -> Option<Arc<Device>>
    {
        self.iter().find(|dev| dev.address() == address).cloned()
    }

    pub fn lookup_by_port(&self, port: PortId) -> Option<Arc<Device>> {
        self.iter().find(|dev| dev.port() == port).cloned()
    }

    /// Walk the whole chain verifying both directions of every link.
    pub fn check_links(&self) -> Result<()> {
        let mut prev = None;
        let mut cursor = self.head;
        let mut count = 0;
        while let Some(id) = cursor {
            let entry = self.entry(id).ok_or_else(|| Error::CorruptChain(
                format!("link to free slot {id:?}")))?;
            if entry.prev != prev {
                return Err(Error::CorruptChain(format!(
                    "{id:?} links back to {:?}, expected {prev:?}",
                    entry.prev)));
            }
            if entry.device.id() != id {
                return Err(Error::CorruptChain(format!(
                    "slot {id:?} holds device {:?}", entry.device.id())));
            }
            count += 1;
            if count > self.len {
                return Err(Error::CorruptChain(format!(
                    "chain longer than {} devices", self.len)));
            }
            prev = Some(id);
            cursor = entry.next;
        }
        if count != self.len {
            return Err(Error::CorruptChain(format!(
                "chain has {count} devices, registry has {}", self.len)));
        }
        Ok(())
    }
}

pub struct Iter<'r> {
    registry: &'r Registry,
    cursor: Option<DeviceId>,
}

impl<'r> Iterator for Iter<'r> {
    type Item = &'r Arc<Device>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.registry.entry(self.cursor?)?;
        self.cursor = entry.next;
        Some(&entry.device)
    }
}
