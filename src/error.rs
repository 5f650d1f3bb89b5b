use thiserror::Error;

use crate::hook::{HookId, HookPhase};
use crate::usb::DeviceAddr;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No hook {id} registered on the {phase} chain")]
    UnknownHook { phase: HookPhase, id: HookId },

    #[error("Device at address {address} is no longer registered")]
    StaleDevice { address: DeviceAddr },

    #[error("Control transfer failed: {0:#}")]
    Transfer(anyhow::Error),

    #[error("Device chain corrupted: {0}")]
    CorruptChain(String),
}

pub type Result<T> = std::result::Result<T, Error>;
