use crate::{
    metrics,
    pool::RequestContext,
    provider::{ContextId, XferCompletion},
};
use async_channel::Sender;
use giobridge_proto::{AsyncHandle, Direction, Status};
use std::{
    collections::{BTreeMap, HashMap},
    time::Instant,
};
use tracing::{debug, trace, warn};

/// Finished async results kept for polling before the oldest are evicted.
const MAX_FINISHED: usize = 256;

/// Observable state of an asynchronous control request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsyncStatus {
    Pending,
    /// Completed with this status. Reported once, then forgotten.
    Complete(Status),
    Unknown,
}

/// Who is waiting for a context's outstanding provider call.
pub(crate) enum Waiter {
    /// A calling thread is suspended on the context's completion signal.
    Blocking(Sender<XferCompletion>),
    /// The caller went away with a pending handle; the completion path owns the context.
    Detached(DetachedTransfer),
}

pub(crate) struct DetachedTransfer {
    pub(crate) ctx: RequestContext,
    pub(crate) handle: AsyncHandle,
    pub(crate) direction: Direction,
    pub(crate) started: Instant,
    pub(crate) abort_requested: bool,
}

/// What the region must do once the table lock is dropped.
pub(crate) enum Dispatched {
    /// A suspended caller was signalled.
    Woke,
    /// Nobody is waiting; return the context to the pool.
    Release(RequestContext),
    /// No outstanding call for this context.
    Stray,
}

/// Outstanding provider calls keyed by context id, plus finished async results.
#[derive(Default)]
pub(crate) struct InflightTable {
    waiters: HashMap<ContextId, Waiter>,
    finished: BTreeMap<AsyncHandle, Status>,
}

impl InflightTable {
    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Register a suspended caller. Must happen before the provider sees the request, since
    /// the provider may complete inline.
    pub(crate) fn insert_blocking(&mut self, ctx: &RequestContext) {
        let previous = self.waiters.insert(ctx.id(), Waiter::Blocking(ctx.signal()));
        debug_assert!(previous.is_none(), "{} already in flight", ctx.id());
    }

    pub(crate) fn insert_detached(&mut self, transfer: DetachedTransfer) {
        let id = transfer.ctx.id();
        let previous = self.waiters.insert(id, Waiter::Detached(transfer));
        debug_assert!(previous.is_none(), "{id} already in flight");
    }

    pub(crate) fn poll(&mut self, handle: AsyncHandle) -> AsyncStatus {
        if let Some(Waiter::Detached(transfer)) = self.waiters.get(&ContextId(handle.context)) {
            if transfer.handle == handle {
                return AsyncStatus::Pending;
            }
        }
        match self.finished.remove(&handle) {
            Some(status) => AsyncStatus::Complete(status),
            None => AsyncStatus::Unknown,
        }
    }

    /// Flag a pending async transfer so its completion takes the abort path.
    pub(crate) fn request_abort(&mut self, handle: AsyncHandle) -> bool {
        match self.waiters.get_mut(&ContextId(handle.context)) {
            Some(Waiter::Detached(transfer)) if transfer.handle == handle => {
                transfer.abort_requested = true;
                true
            }
            _ => false,
        }
    }

    /// Route one provider completion. Only mutates state and signals; never blocks.
    pub(crate) fn dispatch(&mut self, completion: XferCompletion) -> Dispatched {
        let id = completion.context;
        match self.waiters.remove(&id) {
            Some(Waiter::Blocking(signal)) => {
                trace!(ctx = %id, status = %completion.status, len = completion.transferred, "waking caller");
                if let Err(err) = signal.try_send(completion) {
                    warn!(ctx = %id, error = %err, "completion signal already pending");
                }
                Dispatched::Woke
            }
            Some(Waiter::Detached(transfer)) => {
                let DetachedTransfer {
                    mut ctx,
                    handle,
                    direction,
                    started,
                    abort_requested,
                } = transfer;
                let status = if abort_requested {
                    Status::ABORTED
                } else {
                    completion.status
                };
                metrics::observe_transfer(
                    direction,
                    completion.transferred as usize,
                    started.elapsed(),
                );
                metrics::record_detached_completion();
                debug!(
                    ctx = %id,
                    handle = handle.id,
                    %status,
                    len = completion.transferred,
                    aborted = abort_requested,
                    "async transfer finished"
                );
                ctx.status = status;
                ctx.transferred = completion.transferred;
                ctx.restore_buffer(completion.buffer);
                self.record_finished(handle, status);
                Dispatched::Release(ctx)
            }
            None => {
                metrics::record_stray_completion();
                warn!(ctx = %id, status = %completion.status, "completion for idle context");
                Dispatched::Stray
            }
        }
    }

    fn record_finished(&mut self, handle: AsyncHandle, status: Status) {
        if self.finished.len() >= MAX_FINISHED {
            self.finished.pop_first();
        }
        self.finished.insert(handle, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(id: u16, status: Status, transferred: u32) -> XferCompletion {
        XferCompletion {
            context: ContextId(id),
            status,
            transferred,
            buffer: vec![0; 8],
        }
    }

    fn detached(id: u16, handle_id: u32) -> DetachedTransfer {
        DetachedTransfer {
            ctx: RequestContext::new(ContextId(id), vec![0; 8]),
            handle: AsyncHandle {
                id: handle_id,
                context: id,
            },
            direction: Direction::WRITE,
            started: Instant::now(),
            abort_requested: false,
        }
    }

    #[test]
    fn blocking_waiter_is_signalled() {
        let mut table = InflightTable::default();
        let ctx = RequestContext::new(ContextId(1), vec![0; 8]);
        table.insert_blocking(&ctx);
        assert_eq!(table.len(), 1);
        assert!(matches!(
            table.dispatch(completion(1, Status::OK, 8)),
            Dispatched::Woke
        ));
        let got = ctx.wait();
        assert_eq!(got.transferred, 8);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn duplicate_completion_is_stray() {
        let mut table = InflightTable::default();
        let ctx = RequestContext::new(ContextId(0), vec![0; 8]);
        table.insert_blocking(&ctx);
        table.dispatch(completion(0, Status::OK, 1));
        assert!(matches!(
            table.dispatch(completion(0, Status::OK, 1)),
            Dispatched::Stray
        ));
    }

    #[test]
    fn detached_completion_releases_and_records() {
        let mut table = InflightTable::default();
        let transfer = detached(2, 40);
        let handle = transfer.handle;
        table.insert_detached(transfer);
        assert_eq!(table.poll(handle), AsyncStatus::Pending);
        match table.dispatch(completion(2, Status::DATA_ERROR, 3)) {
            Dispatched::Release(ctx) => assert_eq!(ctx.status(), Status::DATA_ERROR),
            _ => panic!("expected release"),
        }
        assert_eq!(table.poll(handle), AsyncStatus::Complete(Status::DATA_ERROR));
        assert_eq!(table.poll(handle), AsyncStatus::Unknown);
    }

    #[test]
    fn abort_flag_overrides_status() {
        let mut table = InflightTable::default();
        let transfer = detached(0, 7);
        let handle = transfer.handle;
        table.insert_detached(transfer);
        assert!(table.request_abort(handle));
        assert!(!table.request_abort(AsyncHandle { id: 8, context: 0 }));
        assert!(matches!(
            table.dispatch(completion(0, Status::OK, 8)),
            Dispatched::Release(_)
        ));
        assert_eq!(table.poll(handle), AsyncStatus::Complete(Status::ABORTED));
    }

    #[test]
    fn finished_results_are_bounded() {
        let mut table = InflightTable::default();
        for id in 0..(MAX_FINISHED as u32 + 10) {
            table.record_finished(AsyncHandle { id, context: 0 }, Status::OK);
        }
        assert_eq!(table.finished.len(), MAX_FINISHED);
        assert_eq!(
            table.poll(AsyncHandle { id: 0, context: 0 }),
            AsyncStatus::Unknown
        );
    }
}
