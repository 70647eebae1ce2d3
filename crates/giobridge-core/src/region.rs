use crate::{
    MapperConfig, MapperError, MapperErrorKind, MapperResult,
    completion::{AsyncStatus, DetachedTransfer, Dispatched, InflightTable},
    metrics,
    pool::{ContextPool, RequestContext},
    provider::{AllocCompleter, ContextId, GioProvider, Resource, XferCompleter, XferCompletion},
    resources::{AcquisitionCommand, AcquisitionController, ResourceKind},
};
use core::fmt;
use giobridge_proto::{AsyncHandle, Direction, Status};
use std::{
    collections::VecDeque,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionState {
    Acquiring,
    Ready,
    /// Resource acquisition failed. Terminal.
    Failed(Status),
    TearingDown,
    Closed,
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionState::Acquiring => f.write_str("acquiring"),
            RegionState::Ready => f.write_str("ready"),
            RegionState::Failed(status) => write!(f, "failed({status})"),
            RegionState::TearingDown => f.write_str("tearing_down"),
            RegionState::Closed => f.write_str("closed"),
        }
    }
}

/// Point-in-time view of a region for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionStats {
    pub state: RegionState,
    pub resource_mask: u32,
    pub staging_buffer_size: u32,
    pub free: usize,
    pub in_use: usize,
    pub total: usize,
    pub in_flight: usize,
}

struct Acquisition {
    controller: AcquisitionController,
    /// Allocations waiting to be classified into contexts.
    staging: VecDeque<Resource>,
    /// Contexts built so far, handed to the pool once every kind is acquired.
    building: Vec<RequestContext>,
    /// Set while some thread is issuing commands; completions that land meanwhile queue theirs.
    pumping: bool,
    queued: Option<AcquisitionCommand>,
}

impl Acquisition {
    /// Turn staged allocations into contexts. Returns anything that could not be placed.
    fn classify(&mut self) -> Vec<Resource> {
        let mut orphans = Vec::new();
        while let Some(resource) = self.staging.pop_front() {
            match resource {
                Resource::Memory(buf) => {
                    let id = ContextId(self.building.len() as u16);
                    self.building.push(RequestContext::new(id, buf));
                }
                Resource::Control(handle) => match self.building.last_mut() {
                    Some(ctx) => ctx.attach_handle(handle),
                    None => orphans.push(Resource::Control(handle)),
                },
            }
        }
        orphans
    }
}

/// Per-instance adapter state for one bound device.
pub struct Region {
    instance: u32,
    provider: Arc<dyn GioProvider>,
    driver_name: String,
    device_size: Option<u64>,
    staging_buffer_size: u32,
    pool: ContextPool,
    lifecycle: Mutex<RegionState>,
    lifecycle_changed: Condvar,
    acquisition: Mutex<Acquisition>,
    inflight: Mutex<InflightTable>,
    next_async_id: AtomicU32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Region {
    pub(crate) fn new(
        instance: u32,
        provider: Arc<dyn GioProvider>,
        config: &MapperConfig,
    ) -> Arc<Self> {
        let staging_buffer_size = config.effective_staging_size(provider.limits());
        let device_size = provider.device_size().filter(|size| *size > 0);
        let driver_name = provider.driver_name().to_owned();
        Arc::new(Self {
            instance,
            provider,
            driver_name,
            device_size,
            staging_buffer_size,
            pool: ContextPool::new(),
            lifecycle: Mutex::new(RegionState::Acquiring),
            lifecycle_changed: Condvar::new(),
            acquisition: Mutex::new(Acquisition {
                controller: AcquisitionController::new(
                    config.max_contexts,
                    staging_buffer_size as usize,
                ),
                staging: VecDeque::new(),
                building: Vec::new(),
                pumping: false,
                queued: None,
            }),
            inflight: Mutex::new(InflightTable::default()),
            next_async_id: AtomicU32::new(1),
        })
    }

    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// `None` for unbounded sequential devices.
    pub fn device_size(&self) -> Option<u64> {
        self.device_size
    }

    pub fn staging_buffer_size(&self) -> u32 {
        self.staging_buffer_size
    }

    pub fn state(&self) -> RegionState {
        *lock(&self.lifecycle)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == RegionState::Ready
    }

    pub(crate) fn provider(&self) -> &dyn GioProvider {
        self.provider.as_ref()
    }

    pub(crate) fn pool(&self) -> &ContextPool {
        &self.pool
    }

    fn transition(&self, state: &mut RegionState, next: RegionState) {
        if *state == next {
            return;
        }
        info!(
            instance = self.instance,
            driver = %self.driver_name,
            from = %*state,
            to = %next,
            "region state transition"
        );
        *state = next;
        self.lifecycle_changed.notify_all();
    }

    /// Kick off resource acquisition. Allocations are chained one after another from their
    /// completions.
    pub(crate) fn start_acquisition(self: &Arc<Self>) {
        let cmd = lock(&self.acquisition).controller.start();
        debug!(
            instance = self.instance,
            staging = self.staging_buffer_size,
            "starting resource acquisition"
        );
        self.run_acquisition(cmd);
    }

    /// Drive `cmd` and whatever follows it. A provider that completes allocations inline
    /// re-enters here from inside `alloc_resource`; that call only queues its command so the
    /// chain runs as a loop on the outermost caller instead of growing the stack.
    fn run_acquisition(self: &Arc<Self>, cmd: AcquisitionCommand) {
        {
            let mut acquisition = lock(&self.acquisition);
            if acquisition.pumping {
                acquisition.queued = Some(cmd);
                return;
            }
            acquisition.pumping = true;
        }
        let mut next = Some(cmd);
        while let Some(cmd) = next {
            self.issue_acquisition(cmd);
            let mut acquisition = lock(&self.acquisition);
            next = acquisition.queued.take();
            if next.is_none() {
                acquisition.pumping = false;
            }
        }
    }

    fn issue_acquisition(self: &Arc<Self>, cmd: AcquisitionCommand) {
        match cmd {
            AcquisitionCommand::Allocate { kind, slot, size } => {
                trace!(instance = self.instance, %kind, ctx = %slot, size, "requesting resource");
                let region = Arc::downgrade(self);
                let completer = AllocCompleter::new(kind, move |result| {
                    if let Some(region) = region.upgrade() {
                        region.on_alloc_complete(kind, result);
                    }
                });
                self.provider.alloc_resource(kind, size, completer);
            }
            AcquisitionCommand::Ready => self.finish_acquisition(),
            AcquisitionCommand::Failed(status) => self.fail_acquisition(status),
            AcquisitionCommand::Idle => {}
        }
    }

    fn on_alloc_complete(self: &Arc<Self>, kind: ResourceKind, result: Result<Resource, Status>) {
        let mut rejected = Vec::new();
        let cmd = {
            let mut acquisition = lock(&self.acquisition);
            if matches!(
                self.state(),
                RegionState::TearingDown | RegionState::Closed
            ) {
                drop(acquisition);
                if let Ok(resource) = result {
                    trace!(instance = self.instance, %kind, "returning late allocation");
                    self.provider.free_resource(resource);
                }
                return;
            }
            match result {
                Ok(resource) if resource.kind() == kind => {
                    metrics::record_resource_alloc(kind);
                    acquisition.staging.push_back(resource);
                    rejected = acquisition.classify();
                    if rejected.is_empty() {
                        acquisition.controller.on_allocated(kind)
                    } else {
                        acquisition
                            .controller
                            .on_failed(kind, Status::RESOURCE_UNAVAILABLE)
                    }
                }
                Ok(resource) => {
                    warn!(
                        instance = self.instance,
                        requested = %kind,
                        got = %resource.kind(),
                        "provider returned the wrong resource kind"
                    );
                    rejected.push(resource);
                    acquisition
                        .controller
                        .on_failed(kind, Status::RESOURCE_UNAVAILABLE)
                }
                Err(status) => acquisition.controller.on_failed(kind, status),
            }
        };
        for resource in rejected {
            self.provider.free_resource(resource);
        }
        self.run_acquisition(cmd);
    }

    fn finish_acquisition(&self) {
        let (contexts, leftovers) = {
            let mut acquisition = lock(&self.acquisition);
            let leftovers: Vec<_> = acquisition.staging.drain(..).collect();
            (std::mem::take(&mut acquisition.building), leftovers)
        };
        for resource in leftovers {
            self.provider.free_resource(resource);
        }
        let count = contexts.len();
        let mut state = lock(&self.lifecycle);
        if *state != RegionState::Acquiring {
            drop(state);
            debug!(instance = self.instance, "acquisition finished after teardown");
            for ctx in contexts {
                self.free_context(ctx);
            }
            return;
        }
        self.pool.populate(contexts);
        self.transition(&mut state, RegionState::Ready);
        info!(
            instance = self.instance,
            contexts = count,
            staging = self.staging_buffer_size,
            "region ready"
        );
    }

    fn fail_acquisition(&self, status: Status) {
        let mut state = lock(&self.lifecycle);
        if *state != RegionState::Acquiring {
            return;
        }
        error!(instance = self.instance, %status, "resource acquisition failed");
        self.transition(&mut state, RegionState::Failed(status));
        drop(state);
        self.pool.shutdown();
    }

    /// Block until acquisition settles, up to `timeout`.
    pub fn wait_ready(&self, timeout: Duration) -> MapperResult<()> {
        let state = lock(&self.lifecycle);
        let (state, _) = self
            .lifecycle_changed
            .wait_timeout_while(state, timeout, |state| *state == RegionState::Acquiring)
            .unwrap_or_else(PoisonError::into_inner);
        let current = *state;
        drop(state);
        Self::serving(current)
    }

    /// Fail fast unless the region can take new work.
    pub(crate) fn ensure_serving(&self) -> MapperResult<()> {
        Self::serving(self.state())
    }

    fn serving(state: RegionState) -> MapperResult<()> {
        match state {
            RegionState::Ready => Ok(()),
            RegionState::Acquiring => Err(MapperError::with_message(
                MapperErrorKind::NotReady,
                "region resources not acquired yet",
            )),
            RegionState::Failed(status) => Err(MapperError::with_message(
                MapperErrorKind::ResourceUnavailable,
                format!("resource acquisition failed: {status}"),
            )),
            RegionState::TearingDown | RegionState::Closed => Err(MapperError::with_message(
                MapperErrorKind::ResourceUnavailable,
                "region is shutting down",
            )),
        }
    }

    pub(crate) fn register_blocking(&self, ctx: &RequestContext) {
        lock(&self.inflight).insert_blocking(ctx);
    }

    /// Hand a context to the in-flight table for a fire-and-forget transfer.
    pub(crate) fn register_detached(
        &self,
        ctx: RequestContext,
        direction: Direction,
    ) -> AsyncHandle {
        let handle = AsyncHandle {
            id: self.next_async_id.fetch_add(1, Ordering::Relaxed),
            context: ctx.id().0,
        };
        lock(&self.inflight).insert_detached(DetachedTransfer {
            ctx,
            handle,
            direction,
            started: Instant::now(),
            abort_requested: false,
        });
        handle
    }

    /// Completer that routes a provider completion for `ctx` back into this region.
    pub(crate) fn completer(self: &Arc<Self>, ctx: ContextId) -> XferCompleter {
        let region = Arc::downgrade(self);
        XferCompleter::new(ctx, move |completion| match region.upgrade() {
            Some(region) => region.complete(completion),
            None => trace!(ctx = %completion.context, "completion after region dropped"),
        })
    }

    /// Completion dispatcher entry point. Never blocks.
    pub(crate) fn complete(&self, completion: XferCompletion) {
        let outcome = lock(&self.inflight).dispatch(completion);
        if let Dispatched::Release(ctx) = outcome {
            self.recycle(ctx);
        }
    }

    /// Return a context to the pool, or to the provider once the region has closed.
    pub(crate) fn recycle(&self, ctx: RequestContext) {
        let state = lock(&self.lifecycle);
        if *state == RegionState::Closed {
            drop(state);
            self.pool.retire(&ctx);
            self.free_context(ctx);
            return;
        }
        self.pool.release(ctx);
    }

    pub fn poll_async(&self, handle: AsyncHandle) -> AsyncStatus {
        lock(&self.inflight).poll(handle)
    }

    /// Flag a pending async request so its completion is recorded as aborted.
    pub fn abort(&self, handle: AsyncHandle) -> bool {
        let flagged = lock(&self.inflight).request_abort(handle);
        if flagged {
            debug!(instance = self.instance, handle = handle.id, "abort requested");
        }
        flagged
    }

    pub fn stats(&self) -> RegionStats {
        let state = self.state();
        let resource_mask = lock(&self.acquisition).controller.acquired().bits();
        let counts = self.pool.counts();
        let in_flight = lock(&self.inflight).len();
        RegionStats {
            state,
            resource_mask,
            staging_buffer_size: self.staging_buffer_size,
            free: counts.free,
            in_use: counts.in_use,
            total: counts.total,
            in_flight,
        }
    }

    /// Refuse new work, drain in-flight contexts, shut the pool down and give every
    /// acquired resource back to the provider. Returns `false` if the drain timed out.
    pub(crate) fn teardown(&self, drain_timeout: Duration) -> bool {
        {
            let mut state = lock(&self.lifecycle);
            if matches!(*state, RegionState::TearingDown | RegionState::Closed) {
                return true;
            }
            self.transition(&mut state, RegionState::TearingDown);
        }
        let drained = self.pool.drain(drain_timeout);
        if !drained {
            warn!(
                instance = self.instance,
                in_use = self.pool.counts().in_use,
                timeout_ms = drain_timeout.as_millis() as u64,
                "drain timed out; contexts will be freed as their completions arrive"
            );
        }
        self.pool.shutdown();
        let contexts = {
            let mut state = lock(&self.lifecycle);
            self.transition(&mut state, RegionState::Closed);
            self.pool.take_free()
        };
        let (building, staged) = {
            let mut acquisition = lock(&self.acquisition);
            let staged: Vec<_> = acquisition.staging.drain(..).collect();
            (std::mem::take(&mut acquisition.building), staged)
        };
        for ctx in contexts.into_iter().chain(building) {
            self.free_context(ctx);
        }
        for resource in staged {
            self.provider.free_resource(resource);
        }
        drained
    }

    fn free_context(&self, mut ctx: RequestContext) {
        if let Some(buf) = ctx.staging.take() {
            self.provider.free_resource(Resource::Memory(buf));
        }
        for handle in [ctx.rw_handle.take(), ctx.diag_handle.take()]
            .into_iter()
            .flatten()
        {
            self.provider.free_resource(Resource::Control(handle));
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("instance", &self.instance)
            .field("driver_name", &self.driver_name)
            .field("device_size", &self.device_size)
            .field("state", &self.state())
            .finish()
    }
}
