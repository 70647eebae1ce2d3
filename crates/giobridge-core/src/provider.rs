use crate::resources::ResourceKind;
use core::fmt;
use giobridge_proto::{DeviceOffset, Direction, GioOp, Params, Status};

/// Index of a request context within its region's pool.
///
/// Providers hand it back verbatim on completion; the mapper never gives out pointers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(pub u16);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// Provider control block handle acquired during resource acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ControlHandle {
    pub kind: ResourceKind,
    pub id: u32,
}

/// A resource handed out by [`GioProvider::alloc_resource`].
#[derive(Debug, PartialEq, Eq)]
pub enum Resource {
    Memory(Vec<u8>),
    Control(ControlHandle),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Memory(_) => ResourceKind::ContextMemory,
            Resource::Control(handle) => handle.kind,
        }
    }
}

/// Allocation limits advertised by a provider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProviderLimits {
    /// Largest allocation the provider can satisfy without risk; 0 means no limit.
    pub max_safe_alloc: usize,
}

/// One asynchronous transfer issued to a provider.
#[derive(Debug)]
pub struct XferRequest {
    pub context: ContextId,
    pub handle: ControlHandle,
    pub op: GioOp,
    pub direction: Direction,
    /// Device position for READ/WRITE; zero on unbounded devices.
    pub offset: DeviceOffset,
    pub len: u32,
    /// At least `len` bytes. Carries outgoing data for writes and receives data for reads.
    pub buffer: Vec<u8>,
    pub params: Params,
}

/// Result of one provider transfer.
#[derive(Debug)]
pub struct XferCompletion {
    pub context: ContextId,
    pub status: Status,
    pub transferred: u32,
    pub buffer: Vec<u8>,
}

type XferSink = Box<dyn FnOnce(XferCompletion) + Send>;

/// Completion token for [`GioProvider::xfer_request`].
///
/// Must be completed exactly once. Dropping it completes the transfer with
/// [`Status::ABORTED`] and no data.
pub struct XferCompleter {
    context: ContextId,
    sink: Option<XferSink>,
}

impl XferCompleter {
    pub(crate) fn new(
        context: ContextId,
        sink: impl FnOnce(XferCompletion) + Send + 'static,
    ) -> Self {
        Self {
            context,
            sink: Some(Box::new(sink)),
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn complete(mut self, status: Status, transferred: u32, buffer: Vec<u8>) {
        self.finish(status, transferred, buffer);
    }

    fn finish(&mut self, status: Status, transferred: u32, buffer: Vec<u8>) {
        if let Some(sink) = self.sink.take() {
            sink(XferCompletion {
                context: self.context,
                status,
                transferred,
                buffer,
            });
        }
    }
}

impl Drop for XferCompleter {
    fn drop(&mut self) {
        self.finish(Status::ABORTED, 0, Vec::new());
    }
}

impl fmt::Debug for XferCompleter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XferCompleter")
            .field("context", &self.context)
            .field("pending", &self.sink.is_some())
            .finish()
    }
}

type AllocSink = Box<dyn FnOnce(Result<Resource, Status>) + Send>;

/// Completion token for [`GioProvider::alloc_resource`]. Dropping it fails the allocation
/// with [`Status::ABORTED`].
pub struct AllocCompleter {
    kind: ResourceKind,
    sink: Option<AllocSink>,
}

impl AllocCompleter {
    pub(crate) fn new(
        kind: ResourceKind,
        sink: impl FnOnce(Result<Resource, Status>) + Send + 'static,
    ) -> Self {
        Self {
            kind,
            sink: Some(Box::new(sink)),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn complete(mut self, result: Result<Resource, Status>) {
        if let Some(sink) = self.sink.take() {
            sink(result);
        }
    }
}

impl Drop for AllocCompleter {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink(Err(Status::ABORTED));
        }
    }
}

impl fmt::Debug for AllocCompleter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocCompleter")
            .field("kind", &self.kind)
            .field("pending", &self.sink.is_some())
            .finish()
    }
}

/// The underlying asynchronous device a region drives.
///
/// Every method must return without blocking. Completers may be invoked from any thread,
/// including inline from within the call that received them.
pub trait GioProvider: Send + Sync + 'static {
    fn driver_name(&self) -> &str;

    /// Device size in bytes at bind time. `None` (or zero) means an unbounded sequential device.
    fn device_size(&self) -> Option<u64>;

    fn limits(&self) -> ProviderLimits {
        ProviderLimits::default()
    }

    fn xfer_request(&self, request: XferRequest, completer: XferCompleter);

    fn alloc_resource(&self, kind: ResourceKind, size: usize, completer: AllocCompleter);

    /// Return a resource at region teardown.
    fn free_resource(&self, _resource: Resource) {}
}
