//! Follows the lifecycle of USB devices from the traffic an interception
//! layer observes between a guest and its host controller.
//!
//! A [`Host`] keeps a registry of the devices enumerated on one controller.
//! Port status words go to [`Host::on_port_status`] and transfers go to
//! [`Host::on_transfer`], where they are run through per-phase hook chains.
//! The device monitor installed by [`Host::init_device_monitor`] is itself
//! a set of hooks: it creates devices on `SET_ADDRESS`, fetches and parses
//! their descriptors, and follows `SET_CONFIGURATION`.

#[macro_use]
extern crate bitfield;

pub mod descriptor;
pub mod device;
mod enumeration;
pub mod error;
pub mod hook;
pub mod host;
pub mod id;
pub mod port;
mod rcu;
pub mod registry;
#[cfg(any(test, feature="replay"))]
pub mod replay;
pub mod usb;

pub use device::{ClassBinder, ClassHandle, Device, DeviceId, Lifecycle};
pub use enumeration::DeviceMonitor;
pub use error::{Error, Result};
pub use hook::{
    HookAction,
    HookId,
    HookMatch,
    HookPattern,
    HookPhase,
    Transfer,
};
pub use host::{ControlPipe, Host, ObserverConfig};
pub use port::PortChange;
