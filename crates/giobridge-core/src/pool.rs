use crate::{
    MapperError, MapperErrorKind, MapperResult, metrics,
    provider::{ContextId, ControlHandle, XferCompletion},
    resources::ResourceKind,
};
use async_channel::{Receiver, Sender};
use giobridge_proto::Status;
use std::{
    collections::{BTreeSet, VecDeque},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};
use tracing::trace;

/// What a context is currently carrying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextKind {
    BlockIo,
    IoctlTransfer,
    Diagnostic,
}

/// Who allocated the buffer a context currently has lent out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BufferOrigin {
    Provider,
    Local,
}

/// One reusable request slot: staging buffer, control handles and completion bookkeeping.
///
/// Only one owner at a time: the pool's free queue, a caller between `acquire` and
/// `release`, or the in-flight table while a detached async transfer is outstanding.
#[derive(Debug)]
pub struct RequestContext {
    id: ContextId,
    pub(crate) kind: ContextKind,
    pub(crate) status: Status,
    /// Provider-allocated context memory; the only buffer ever returned to the provider.
    pub(crate) staging: Option<Vec<u8>>,
    lent: Option<BufferOrigin>,
    pub(crate) rw_handle: Option<ControlHandle>,
    pub(crate) diag_handle: Option<ControlHandle>,
    pub(crate) transferred: u32,
    pub(crate) remaining: u32,
    pub(crate) single_shot: bool,
    signal_tx: Sender<XferCompletion>,
    signal_rx: Receiver<XferCompletion>,
}

impl RequestContext {
    pub(crate) fn new(id: ContextId, staging: Vec<u8>) -> Self {
        let (signal_tx, signal_rx) = async_channel::bounded(1);
        Self {
            id,
            kind: ContextKind::BlockIo,
            status: Status::OK,
            staging: Some(staging),
            lent: None,
            rw_handle: None,
            diag_handle: None,
            transferred: 0,
            remaining: 0,
            single_shot: true,
            signal_tx,
            signal_rx,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub(crate) fn attach_handle(&mut self, handle: ControlHandle) {
        match handle.kind {
            ResourceKind::DiagHandle => self.diag_handle = Some(handle),
            _ => self.rw_handle = Some(handle),
        }
    }

    /// Sender the completion path uses to wake this context's waiter.
    pub(crate) fn signal(&self) -> Sender<XferCompletion> {
        self.signal_tx.clone()
    }

    /// Suspend until the completion path signals this context.
    pub(crate) fn wait(&self) -> XferCompletion {
        match self.signal_rx.recv_blocking() {
            Ok(completion) => completion,
            // Unreachable while the context owns its own sender.
            Err(_) => XferCompletion {
                context: self.id,
                status: Status::ABORTED,
                transferred: 0,
                buffer: Vec::new(),
            },
        }
    }

    /// Lend out the staging buffer if it can hold `len` bytes, otherwise a scratch buffer sized
    /// exactly to `len`. The provider's memory stays parked on the context in the latter case.
    pub(crate) fn take_buffer(&mut self, len: usize) -> Vec<u8> {
        match self.staging.take() {
            Some(buf) if buf.len() >= len => {
                self.lent = Some(BufferOrigin::Provider);
                buf
            }
            staging => {
                self.staging = staging;
                self.lent = Some(BufferOrigin::Local);
                trace!(ctx = %self.id, len, "allocating exact-size scratch buffer");
                vec![0; len]
            }
        }
    }

    /// Take back whatever `take_buffer` lent out. Scratch buffers are dropped here.
    pub(crate) fn restore_buffer(&mut self, buf: Vec<u8>) {
        match self.lent.take() {
            Some(BufferOrigin::Provider) if !buf.is_empty() => self.staging = Some(buf),
            Some(BufferOrigin::Provider) => {
                trace!(ctx = %self.id, "provider kept the staging buffer")
            }
            Some(BufferOrigin::Local) | None => {}
        }
    }

    fn reset(&mut self) {
        self.status = Status::OK;
        self.transferred = 0;
        self.remaining = 0;
        self.single_shot = true;
        while self.signal_rx.try_recv().is_ok() {}
    }
}

/// Queue lengths at one instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub free: usize,
    pub in_use: usize,
    pub total: usize,
}

#[derive(Debug, Default)]
struct PoolQueues {
    free: VecDeque<RequestContext>,
    in_use: BTreeSet<ContextId>,
    total: usize,
    shutdown: bool,
}

/// Bounded pool of request contexts, served free-list FIFO.
///
/// The lock is only held while moving contexts between queues, never across a wait on the
/// provider.
#[derive(Debug, Default)]
pub struct ContextPool {
    queues: Mutex<PoolQueues>,
    available: Condvar,
    drained: Condvar,
}

impl ContextPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PoolQueues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add freshly built contexts to the tail of the free queue.
    pub(crate) fn populate(&self, contexts: Vec<RequestContext>) {
        let mut queues = self.lock();
        queues.total += contexts.len();
        queues.free.extend(contexts);
        drop(queues);
        self.available.notify_all();
    }

    /// Take the head of the free queue, blocking until one is released.
    ///
    /// Must not be called from a provider completion path.
    pub fn acquire(&self) -> MapperResult<RequestContext> {
        let mut queues = self.lock();
        loop {
            if queues.shutdown {
                return Err(MapperError::with_message(
                    MapperErrorKind::ResourceUnavailable,
                    "context pool shut down",
                ));
            }
            if let Some(ctx) = queues.free.pop_front() {
                queues.in_use.insert(ctx.id);
                metrics::record_contexts_in_use(queues.in_use.len());
                return Ok(ctx);
            }
            queues = self
                .available
                .wait(queues)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking variant of [`ContextPool::acquire`].
    pub fn try_acquire(&self) -> MapperResult<Option<RequestContext>> {
        let mut queues = self.lock();
        if queues.shutdown {
            return Err(MapperError::with_message(
                MapperErrorKind::ResourceUnavailable,
                "context pool shut down",
            ));
        }
        let ctx = queues.free.pop_front();
        if let Some(ctx) = &ctx {
            queues.in_use.insert(ctx.id);
            metrics::record_contexts_in_use(queues.in_use.len());
        }
        Ok(ctx)
    }

    /// Return a context to the tail of the free queue and wake one waiter. Never blocks on
    /// anything but the queue lock, so it is safe from the completion path.
    pub fn release(&self, mut ctx: RequestContext) {
        ctx.reset();
        let mut queues = self.lock();
        let was_in_use = queues.in_use.remove(&ctx.id);
        debug_assert!(was_in_use, "{} released but not in use", ctx.id);
        queues.free.push_back(ctx);
        let idle = queues.in_use.is_empty();
        metrics::record_contexts_in_use(queues.in_use.len());
        drop(queues);
        self.available.notify_one();
        if idle {
            self.drained.notify_all();
        }
    }

    /// Forget an in-use context without returning it to the free queue. Used when a context
    /// is retired after the pool has been torn down.
    pub(crate) fn retire(&self, ctx: &RequestContext) {
        let mut queues = self.lock();
        if queues.in_use.remove(&ctx.id) {
            queues.total -= 1;
        }
        let idle = queues.in_use.is_empty();
        drop(queues);
        if idle {
            self.drained.notify_all();
        }
    }

    /// Wait until no context is in use, up to `timeout`. Returns `false` on timeout.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queues = self.lock();
        while !queues.in_use.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .drained
                .wait_timeout(queues, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            queues = guard;
        }
        true
    }

    /// Refuse further acquisitions and wake every waiter with `ResourceUnavailable`.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.available.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Remove every free context, for teardown.
    pub(crate) fn take_free(&self) -> Vec<RequestContext> {
        let mut queues = self.lock();
        let taken: Vec<_> = queues.free.drain(..).collect();
        queues.total -= taken.len();
        taken
    }

    pub fn counts(&self) -> PoolCounts {
        let queues = self.lock();
        PoolCounts {
            free: queues.free.len(),
            in_use: queues.in_use.len(),
            total: queues.total,
        }
    }
}
