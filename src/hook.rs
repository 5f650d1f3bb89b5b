//! Pattern-matched callbacks fired against observed transfers.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::{debug, error, trace};
use parking_lot::{Mutex, MutexGuard};

use crate::device::{Device, DeviceId};
use crate::error::{Error, Result};
use crate::host::Host;
use crate::id::{Id, IdSource};
use crate::rcu::SingleWriterRcu;
use crate::usb::{
    Direction,
    DeviceAddr,
    EndpointNum,
    PID,
    SETUP_PACKET_SIZE,
    SetupFields,
};

/// Stage of a transfer at which a chain is consulted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub enum HookPhase {
    /// Setup packet seen, before it reaches the device.
    Setup,
    /// Data stage.
    Data,
    /// Transfer completed and acknowledged.
    Reply,
}

impl HookPhase {
    pub const ALL: [HookPhase; 3] =
        [HookPhase::Setup, HookPhase::Data, HookPhase::Reply];

    fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", match self {
            HookPhase::Setup => "SETUP",
            HookPhase::Data => "DATA",
            HookPhase::Reply => "REPLY",
        })
    }
}

/// What a callback wants done with the transfer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum HookAction {
    /// Continue with the next hook.
    #[default]
    Pass,
    /// Stop, and have the caller drop the transfer.
    Discard,
    /// Stop; the callback has rewritten the transfer's buffers.
    Rewrite,
}

/// A transfer as seen by the observer.
#[derive(Clone, Debug, Default)]
pub struct Transfer {
    pub address: DeviceAddr,
    pub endpoint: EndpointNum,
    pub pid: PID,
    pub direction: Direction,
    pub setup: Option<[u8; SETUP_PACKET_SIZE]>,
    pub data: Vec<u8>,
    /// Device the transfer is addressed to, if it is registered.
    pub device: Option<Arc<Device>>,
}

impl Transfer {
    /// A control transfer to endpoint 0 of `address`.
    pub fn control(address: DeviceAddr, setup: SetupFields, data: Vec<u8>)
        -> Self
    {
        Transfer {
            address,
            endpoint: EndpointNum(0),
            pid: PID::SETUP,
            direction: setup.type_fields.direction(),
            setup: Some(setup.to_bytes()),
            data,
            device: None,
        }
    }

    pub fn setup_fields(&self) -> Option<SetupFields> {
        self.setup.as_ref().map(SetupFields::from_bytes)
    }

    /// Load 8 bytes little-endian from the buffer a pattern with the given
    /// PID applies to. Bytes past the end read as zero.
    pub fn load_u64(&self, pid: PID, offset: usize) -> Option<u64> {
        let buffer: &[u8] = match pid {
            PID::SETUP => self.setup.as_ref()?,
            PID::IN | PID::OUT => &self.data,
            PID::Malformed => return None,
        };
        let mut bytes = [0; 8];
        if let Some(tail) = buffer.get(offset..) {
            let count = tail.len().min(8);
            bytes[..count].copy_from_slice(&tail[..count]);
        }
        Some(u64::from_le_bytes(bytes))
    }
}

/// One term of a match predicate: `(load(offset) & mask) == pattern`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HookPattern {
    pub pid: PID,
    pub mask: u64,
    pub pattern: u64,
    pub offset: u8,
}

impl HookPattern {
    pub fn new(pid: PID, mask: u64, pattern: u64, offset: u8) -> Self {
        HookPattern { pid, mask, pattern, offset }
    }

    /// Match the first bytes of a setup packet.
    pub fn setup(mask: u64, pattern: u64) -> Self {
        Self::new(PID::SETUP, mask, pattern, 0)
    }

    pub fn matches(&self, transfer: &Transfer) -> bool {
        transfer.load_u64(self.pid, usize::from(self.offset))
            .is_some_and(|value| value & self.mask == self.pattern)
    }
}

/// Predicate selecting the transfers a hook fires on. `None` fields are
/// wildcards; patterns are ANDed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HookMatch {
    pub address: Option<DeviceAddr>,
    pub endpoint: Option<EndpointNum>,
    pub direction: Option<Direction>,
    pub patterns: Vec<HookPattern>,
}

impl HookMatch {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: DeviceAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn endpoint(mut self, endpoint: EndpointNum) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn pattern(mut self, pattern: HookPattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    pub fn matches(&self, transfer: &Transfer) -> bool {
        self.address.is_none_or(|address| address == transfer.address) &&
        self.endpoint.is_none_or(|endpoint| endpoint == transfer.endpoint) &&
        self.direction.is_none_or(|dir| dir == transfer.direction) &&
        self.patterns.iter().all(|pattern| pattern.matches(transfer))
    }
}

pub type HookId = Id<Hook>;

pub type HookCallback =
    dyn Fn(&Host, &mut Transfer) -> HookAction + Send + Sync;

pub struct Hook {
    id: HookId,
    matcher: HookMatch,
    owner: Option<DeviceId>,
    callback: Box<HookCallback>,
}

impl Hook {
    pub fn id(&self) -> HookId {
        self.id
    }

    pub fn owner(&self) -> Option<DeviceId> {
        self.owner
    }

    pub fn matcher(&self) -> &HookMatch {
        &self.matcher
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("id", &self.id)
            .field("matcher", &self.matcher)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

type Chain = Vec<Arc<Hook>>;

/// One chain of hooks per phase.
///
/// Writers are serialized by the hook lock. Dispatch runs lock-free over
/// the chain as it was when dispatch began, so callbacks may register and
/// unregister hooks, including themselves.
pub struct HookChains {
    lock: Mutex<()>,
    chains: [ArcSwap<Chain>; 3],
    ids: IdSource<Hook>,
}

impl Default for HookChains {
    fn default() -> Self {
        HookChains {
            lock: Mutex::new(()),
            chains: std::array::from_fn(|_| ArcSwap::from_pointee(Vec::new())),
            ids: IdSource::new(),
        }
    }
}

impl HookChains {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the hook lock. Must be acquired before any device lock.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    fn chain(&self, phase: HookPhase) -> &ArcSwap<Chain> {
        &self.chains[phase.index()]
    }

    /// The chain as it currently stands.
    pub fn snapshot(&self, phase: HookPhase) -> Arc<Chain> {
        self.chain(phase).load_full()
    }

    pub fn ids(&self, phase: HookPhase) -> Vec<HookId> {
        self.snapshot(phase).iter().map(|hook| hook.id).collect()
    }

    pub fn len(&self, phase: HookPhase) -> usize {
        self.chain(phase).load().len()
    }

    /// Append a hook to the end of a phase's chain.
    pub fn register<F>(&self,
                       phase: HookPhase,
                       matcher: HookMatch,
                       owner: Option<DeviceId>,
                       callback: F)
        -> HookId
        where F: Fn(&Host, &mut Transfer) -> HookAction + Send + Sync + 'static
    {
        let hook = Arc::new(Hook {
            id: self.ids.next(),
            matcher,
            owner,
            callback: Box::new(callback),
        });
        let id = hook.id;
        debug!("Registering {phase} hook {id} for {:?}", hook.matcher);
        let _guard = self.lock();
        self.chain(phase).update(|chain| chain.push(hook));
        id
    }

    pub fn unregister(&self, phase: HookPhase, id: HookId) -> Result<()> {
        let _guard = self.lock();
        self.chain(phase)
            .maybe_update(|chain| {
                let position = chain.iter().position(|hook| hook.id == id)?;
                Some(chain.remove(position))
            })
            .map(|_| debug!("Unregistered {phase} hook {id}"))
            .ok_or(Error::UnknownHook { phase, id })
    }

    /// Unregister every hook owned by a device, across all phases.
    /// Returns the number of hooks removed.
    pub fn evict(&self, owner: DeviceId) -> usize {
        let _guard = self.lock();
        HookPhase::ALL.into_iter()
            .filter_map(|phase| self.chain(phase).maybe_update(|chain| {
                let before = chain.len();
                chain.retain(|hook| hook.owner != Some(owner));
                let removed = before - chain.len();
                (removed > 0).then_some(removed)
            }))
            .sum()
    }

    /// Run the matching hooks of a phase against a transfer.
    pub fn dispatch(&self,
                    host: &Host,
                    phase: HookPhase,
                    transfer: &mut Transfer)
        -> HookAction
    {
        let chain = self.snapshot(phase);
        if chain.is_empty() {
            return HookAction::Pass;
        }
        let original = (transfer.setup, transfer.data.clone());
        for hook in chain.iter() {
            if !hook.matcher.matches(transfer) {
                continue;
            }
            trace!("{phase} hook {} fired on {}.{}",
                   hook.id, transfer.address, transfer.endpoint);
            let outcome = catch_unwind(AssertUnwindSafe(||
                (hook.callback)(host, transfer)));
            match outcome {
                Ok(HookAction::Pass) => continue,
                Ok(action) => return action,
                Err(panic) => {
                    let message = panic.downcast_ref::<&str>().copied()
                        .or_else(|| panic.downcast_ref::<String>()
                            .map(String::as_str))
                        .unwrap_or("unknown panic");
                    error!("{phase} hook {} panicked: {message}", hook.id);
                    (transfer.setup, transfer.data) = original;
                    return HookAction::Pass;
                }
            }
        }
        HookAction::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use crate::host::tests::host;
    use crate::replay::ScriptedPipe;
    use crate::usb::StandardRequest;

    fn set_address(address: u16) -> Transfer {
        let setup = SetupFields::standard(StandardRequest::SetAddress, address);
        Transfer::control(DeviceAddr(0), setup, vec![])
    }

    #[test]
    fn test_pattern_loads() {
        let transfer = set_address(3);
        assert_eq!(transfer.load_u64(PID::SETUP, 0), Some(0x0000_0000_0003_0500));
        // Past the end reads as zero.
        assert_eq!(transfer.load_u64(PID::SETUP, 2), Some(0x0003));
        assert_eq!(transfer.load_u64(PID::SETUP, 20), Some(0));
        assert_eq!(transfer.load_u64(PID::IN, 0), Some(0));
        assert_eq!(transfer.load_u64(PID::Malformed, 0), None);
        assert!(HookPattern::setup(0xffff, 0x0500).matches(&transfer));
        assert!(!HookPattern::setup(0xffff, 0x0900).matches(&transfer));
        assert!(HookPattern::new(PID::SETUP, 0xff, 0x03, 2).matches(&transfer));
        let no_setup = Transfer { pid: PID::IN, data: vec![5], ..Transfer::default() };
        assert!(!HookPattern::setup(0xff, 0x05).matches(&no_setup));
        assert!(HookPattern::new(PID::IN, 0xff, 0x05, 0).matches(&no_setup));
    }

    #[test]
    fn test_match_fields() {
        let transfer = set_address(3);
        assert!(HookMatch::any().matches(&transfer));
        assert!(HookMatch::any().address(DeviceAddr(0)).matches(&transfer));
        assert!(!HookMatch::any().address(DeviceAddr(3)).matches(&transfer));
        assert!(HookMatch::any().endpoint(EndpointNum(0)).matches(&transfer));
        assert!(!HookMatch::any().endpoint(EndpointNum(1)).matches(&transfer));
        assert!(HookMatch::any().direction(Direction::Out).matches(&transfer));
        assert!(!HookMatch::any().direction(Direction::In).matches(&transfer));
        let both = HookMatch::any()
            .pattern(HookPattern::setup(0xff, 0x00))
            .pattern(HookPattern::setup(0xff00, 0x0900));
        assert!(!both.matches(&transfer));
    }

    #[test]
    fn test_register_unregister_restores_chain() {
        let chains = HookChains::new();
        let a = chains.register(HookPhase::Setup, HookMatch::any(), None,
                                |_, _| HookAction::Pass);
        let before = chains.ids(HookPhase::Setup);
        let b = chains.register(HookPhase::Setup, HookMatch::any(), None,
                                |_, _| HookAction::Pass);
        assert_eq!(chains.ids(HookPhase::Setup), vec![a, b]);
        chains.unregister(HookPhase::Setup, b).unwrap();
        assert_eq!(chains.ids(HookPhase::Setup), before);
        assert!(matches!(chains.unregister(HookPhase::Setup, b),
                         Err(Error::UnknownHook { .. })));
        assert!(chains.unregister(HookPhase::Reply, a).is_err());
        assert_eq!(chains.len(HookPhase::Setup), 1);
    }

    #[test]
    fn test_evict_by_owner() {
        use crate::id::Handle;
        let chains = HookChains::new();
        let owner = Handle::new(1, 0);
        let other = Handle::new(2, 0);
        chains.register(HookPhase::Setup, HookMatch::any(), Some(owner),
                        |_, _| HookAction::Pass);
        chains.register(HookPhase::Reply, HookMatch::any(), Some(owner),
                        |_, _| HookAction::Pass);
        let kept = chains.register(HookPhase::Reply, HookMatch::any(),
                                   Some(other), |_, _| HookAction::Pass);
        assert_eq!(chains.evict(owner), 2);
        assert_eq!(chains.len(HookPhase::Setup), 0);
        assert_eq!(chains.ids(HookPhase::Reply), vec![kept]);
        assert_eq!(chains.evict(owner), 0);
    }

    #[test]
    fn test_unregister_during_dispatch() {
        let (host, _pipe) = host(ScriptedPipe::default());
        let log = Arc::new(StdMutex::new(Vec::new()));
        let c_id = Arc::new(StdMutex::new(None));
        let record = |name: &'static str| {
            let log = log.clone();
            move |_: &Host, _: &mut Transfer| {
                log.lock().unwrap().push(name);
                HookAction::Pass
            }
        };
        let hooks = host.hooks();
        hooks.register(HookPhase::Setup, HookMatch::any(), None, record("A"));
        let b_log = log.clone();
        let b_target = c_id.clone();
        hooks.register(HookPhase::Setup, HookMatch::any(), None,
            move |host: &Host, _: &mut Transfer| {
                b_log.lock().unwrap().push("B");
                if let Some(id) = b_target.lock().unwrap().take() {
                    host.hooks().unregister(HookPhase::Setup, id).unwrap();
                }
                HookAction::Pass
            });
        let c = hooks.register(HookPhase::Setup, HookMatch::any(), None,
                               record("C"));
        *c_id.lock().unwrap() = Some(c);

        let mut transfer = set_address(3);
        assert_eq!(host.on_transfer(HookPhase::Setup, &mut transfer),
                   HookAction::Pass);
        assert_eq!(*log.lock().unwrap(), vec!["A", "B", "C"]);
        log.lock().unwrap().clear();
        host.on_transfer(HookPhase::Setup, &mut transfer);
        assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);
    }

    #[test]
    fn test_register_during_dispatch() {
        let (host, _pipe) = host(ScriptedPipe::default());
        let count = Arc::new(StdMutex::new(0));
        let inner = count.clone();
        host.hooks().register(HookPhase::Data, HookMatch::any(), None,
            move |host: &Host, _: &mut Transfer| {
                let inner = inner.clone();
                host.hooks().register(HookPhase::Data, HookMatch::any(), None,
                    move |_: &Host, _: &mut Transfer| {
                        *inner.lock().unwrap() += 1;
                        HookAction::Pass
                    });
                HookAction::Pass
            });
        let mut transfer = Transfer::default();
        host.on_transfer(HookPhase::Data, &mut transfer);
        assert_eq!(*count.lock().unwrap(), 0);
        host.on_transfer(HookPhase::Data, &mut transfer);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_discard_and_rewrite_stop_chain() {
        let (host, _pipe) = host(ScriptedPipe::default());
        let hooks = host.hooks();
        hooks.register(HookPhase::Setup,
            HookMatch::any().pattern(HookPattern::setup(0xffff, 0x0500)),
            None,
            |_: &Host, transfer: &mut Transfer| {
                if let Some(setup) = transfer.setup.as_mut() {
                    setup[2] = 9;
                }
                HookAction::Rewrite
            });
        hooks.register(HookPhase::Setup, HookMatch::any(), None,
                       |_, _| HookAction::Discard);
        let mut transfer = set_address(3);
        assert_eq!(host.on_transfer(HookPhase::Setup, &mut transfer),
                   HookAction::Rewrite);
        assert_eq!(transfer.setup_fields().unwrap().value, 9);
        let mut other = Transfer::default();
        assert_eq!(host.on_transfer(HookPhase::Setup, &mut other),
                   HookAction::Discard);
    }

    #[test]
    fn test_panicking_hook_is_contained() {
        let (host, _pipe) = host(ScriptedPipe::default());
        let hooks = host.hooks();
        hooks.register(HookPhase::Setup, HookMatch::any(), None,
            |_: &Host, transfer: &mut Transfer| {
                transfer.data.push(0xAA);
                panic!("callback failed");
            });
        hooks.register(HookPhase::Setup, HookMatch::any(), None,
                       |_, _| HookAction::Discard);
        let mut transfer = set_address(3);
        assert_eq!(host.on_transfer(HookPhase::Setup, &mut transfer),
                   HookAction::Pass);
        assert!(transfer.data.is_empty());
        // Dispatch still works for the next transfer.
        assert_eq!(host.on_transfer(HookPhase::Setup, &mut transfer),
                   HookAction::Pass);
    }
}
