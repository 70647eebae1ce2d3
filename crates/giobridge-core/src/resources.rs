use crate::provider::ContextId;
use core::fmt;
use giobridge_proto::Status;

/// Resource kinds a region needs before it can serve requests, in acquisition order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// Context memory, which becomes a context's staging buffer.
    ContextMemory,
    /// Control handle used for read/write and ioctl transfers.
    RwHandle,
    /// Control handle used for diagnostic ops.
    DiagHandle,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::ContextMemory,
        ResourceKind::RwHandle,
        ResourceKind::DiagHandle,
    ];

    fn index(self) -> usize {
        match self {
            ResourceKind::ContextMemory => 0,
            ResourceKind::RwHandle => 1,
            ResourceKind::DiagHandle => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::ContextMemory => "context_memory",
            ResourceKind::RwHandle => "rw_handle",
            ResourceKind::DiagHandle => "diag_handle",
        }
    }

    fn next(self) -> Option<ResourceKind> {
        Self::ALL.get(self.index() + 1).copied()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of fully acquired resource kinds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceSet([bool; 3]);

impl ResourceSet {
    pub const FULL: ResourceSet = ResourceSet([true; 3]);

    pub fn contains(&self, kind: ResourceKind) -> bool {
        self.0[kind.index()]
    }

    pub fn insert(&mut self, kind: ResourceKind) {
        self.0[kind.index()] = true;
    }

    pub fn is_complete(&self) -> bool {
        *self == Self::FULL
    }

    /// Bitmask view, one bit per kind in acquisition order.
    pub fn bits(&self) -> u32 {
        ResourceKind::ALL
            .iter()
            .filter(|kind| self.contains(**kind))
            .fold(0, |mask, kind| mask | (1 << kind.index()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    Requesting(ResourceKind),
    Ready,
    Failed(Status),
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionState::Idle => f.write_str("idle"),
            AcquisitionState::Requesting(kind) => write!(f, "requesting({kind})"),
            AcquisitionState::Ready => f.write_str("ready"),
            AcquisitionState::Failed(status) => write!(f, "failed({status})"),
        }
    }
}

/// Commands emitted by the acquisition controller for the region to act upon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquisitionCommand {
    /// Issue one allocation of `kind` for context `slot`.
    Allocate {
        kind: ResourceKind,
        slot: ContextId,
        size: usize,
    },
    /// Every kind is acquired; the pool can be populated.
    Ready,
    /// An allocation failed; the region never becomes ready.
    Failed(Status),
    /// Nothing to do (event ignored in the current state).
    Idle,
}

/// Sequences resource allocations one at a time: for each context slot, memory, then the
/// read/write handle, then the diagnostic handle.
///
/// The controller only tracks state and emits commands. The region issues the allocations
/// and classifies the resources that come back.
#[derive(Debug)]
pub struct AcquisitionController {
    state: AcquisitionState,
    acquired: ResourceSet,
    per_kind: [u16; 3],
    contexts: u16,
    slot: u16,
    staging_size: usize,
}

impl AcquisitionController {
    pub fn new(contexts: u16, staging_size: usize) -> Self {
        Self {
            state: AcquisitionState::Idle,
            acquired: ResourceSet::default(),
            per_kind: [0; 3],
            contexts,
            slot: 0,
            staging_size,
        }
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn acquired(&self) -> ResourceSet {
        self.acquired
    }

    /// Context slots that have received their memory so far.
    pub fn contexts_allocated(&self) -> u16 {
        self.per_kind[ResourceKind::ContextMemory.index()]
    }

    /// Leave `Idle` and request the first resource.
    pub fn start(&mut self) -> AcquisitionCommand {
        if self.state != AcquisitionState::Idle {
            return AcquisitionCommand::Idle;
        }
        if self.contexts == 0 {
            return self.fail(Status::RESOURCE_UNAVAILABLE);
        }
        self.request(ResourceKind::ContextMemory)
    }

    /// Record a successful allocation of `kind` and chain to the next one.
    pub fn on_allocated(&mut self, kind: ResourceKind) -> AcquisitionCommand {
        if self.state != AcquisitionState::Requesting(kind) {
            return AcquisitionCommand::Idle;
        }
        let count = &mut self.per_kind[kind.index()];
        *count += 1;
        if *count == self.contexts {
            self.acquired.insert(kind);
        }
        match kind.next() {
            Some(next) => self.request(next),
            None => {
                self.slot += 1;
                if self.slot == self.contexts {
                    debug_assert!(self.acquired.is_complete());
                    self.state = AcquisitionState::Ready;
                    AcquisitionCommand::Ready
                } else {
                    self.request(ResourceKind::ContextMemory)
                }
            }
        }
    }

    /// Record a failed allocation. Terminal: no retry is attempted.
    pub fn on_failed(&mut self, kind: ResourceKind, status: Status) -> AcquisitionCommand {
        if self.state != AcquisitionState::Requesting(kind) {
            return AcquisitionCommand::Idle;
        }
        let status = if status.is_ok() {
            Status::RESOURCE_UNAVAILABLE
        } else {
            status
        };
        self.fail(status)
    }

    fn request(&mut self, kind: ResourceKind) -> AcquisitionCommand {
        self.state = AcquisitionState::Requesting(kind);
        let size = match kind {
            ResourceKind::ContextMemory => self.staging_size,
            ResourceKind::RwHandle | ResourceKind::DiagHandle => 0,
        };
        AcquisitionCommand::Allocate {
            kind,
            slot: ContextId(self.slot),
            size,
        }
    }

    fn fail(&mut self, status: Status) -> AcquisitionCommand {
        self.state = AcquisitionState::Failed(status);
        AcquisitionCommand::Failed(status)
    }
}
