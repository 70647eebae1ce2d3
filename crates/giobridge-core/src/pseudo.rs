//! Loopback test device driven by a worker thread.
//!
//! The pseudo provider answers every request from a dedicated thread, so completions
//! always arrive on a different thread than the one that issued them, the way a real
//! interrupt-driven provider behaves. It also keeps a log of every transfer it served and
//! can inject failures for tests.

use crate::{
    provider::{
        AllocCompleter, ControlHandle, GioProvider, ProviderLimits, Resource, XferCompleter,
        XferRequest,
    },
    resources::ResourceKind,
};
use async_channel::{Receiver, Sender};
use giobridge_proto::{GioOp, Status};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{Level, debug, info, trace, warn};

/// Capacity of the sequential loopback queue.
pub const SEQUENTIAL_QUEUE_LEN: usize = 1024;

/// What the device does with data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PseudoMode {
    /// Writes are stored and reads return them.
    #[default]
    Loopback,
    /// Reads produce [`pattern_byte`]s, writes are accepted.
    Pattern,
    /// Writes are swallowed, reads return nothing.
    Sink,
}

/// Byte the pattern mode produces at device position `pos`.
pub fn pattern_byte(pos: u64) -> u8 {
    (pos % 251) as u8
}

#[derive(Clone, Debug)]
pub struct PseudoConfig {
    pub driver_name: String,
    pub mode: PseudoMode,
    /// `None` makes a sequential device.
    pub device_size: Option<u64>,
    pub max_safe_alloc: usize,
}

impl Default for PseudoConfig {
    fn default() -> Self {
        Self {
            driver_name: "pseudo".to_owned(),
            mode: PseudoMode::Loopback,
            device_size: Some(1 << 20),
            max_safe_alloc: 0,
        }
    }
}

enum Job {
    Xfer(XferRequest, XferCompleter),
    Alloc(ResourceKind, usize, AllocCompleter),
}

#[derive(Default)]
struct Faults {
    fail_alloc: Option<(ResourceKind, Status)>,
    fail_next_xfer: Option<Status>,
    hold: bool,
}

struct PseudoState {
    mode: PseudoMode,
    sequential: bool,
    /// Backing store for a bounded loopback device.
    store: Vec<u8>,
    /// Queue for a sequential loopback device.
    queue: VecDeque<u8>,
    /// Position counter for sequential pattern reads.
    produced: u64,
    faults: Faults,
    held: Vec<Job>,
    log: Vec<u32>,
    next_handle: u32,
    allocated: Vec<ResourceKind>,
    freed: usize,
}

fn lock(state: &Mutex<PseudoState>) -> MutexGuard<'_, PseudoState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Test provider modelled on a loopback pseudo driver.
pub struct PseudoProvider {
    config: PseudoConfig,
    jobs: Sender<Job>,
    state: Arc<Mutex<PseudoState>>,
    worker: Option<JoinHandle<()>>,
}

impl PseudoProvider {
    pub fn new(config: PseudoConfig) -> Arc<Self> {
        let sequential = config.device_size.is_none_or(|size| size == 0);
        let store = match config.device_size {
            Some(size) if !sequential && config.mode == PseudoMode::Loopback => {
                vec![0; size as usize]
            }
            _ => Vec::new(),
        };
        let state = Arc::new(Mutex::new(PseudoState {
            mode: config.mode,
            sequential,
            store,
            queue: VecDeque::with_capacity(SEQUENTIAL_QUEUE_LEN),
            produced: 0,
            faults: Faults::default(),
            held: Vec::new(),
            log: Vec::new(),
            next_handle: 1,
            allocated: Vec::new(),
            freed: 0,
        }));
        let (jobs, rx) = async_channel::unbounded();
        let worker_state = Arc::clone(&state);
        let span = tracing::span!(Level::DEBUG, "pseudo", driver = %config.driver_name);
        let worker = thread::spawn(move || {
            let _enter = span.enter();
            run_worker(rx, worker_state);
        });
        info!(
            driver = %config.driver_name,
            mode = ?config.mode,
            device_size = config.device_size,
            "pseudo provider started"
        );
        Arc::new(Self {
            config,
            jobs,
            state,
            worker: Some(worker),
        })
    }

    fn submit(&self, job: Job) {
        // A closed queue drops the job, which aborts its completer.
        if self.jobs.try_send(job).is_err() {
            warn!("pseudo worker gone; dropping job");
        }
    }

    pub fn mode(&self) -> PseudoMode {
        lock(&self.state).mode
    }

    pub fn set_mode(&self, mode: PseudoMode) {
        lock(&self.state).mode = mode;
    }

    /// Lengths of every transfer served, in order.
    pub fn transfer_log(&self) -> Vec<u32> {
        lock(&self.state).log.clone()
    }

    pub fn clear_log(&self) {
        lock(&self.state).log.clear();
    }

    /// Fail the next allocation of `kind` with `status`.
    pub fn fail_alloc(&self, kind: ResourceKind, status: Status) {
        lock(&self.state).faults.fail_alloc = Some((kind, status));
    }

    /// Fail the next transfer with `status`.
    pub fn fail_next_xfer(&self, status: Status) {
        lock(&self.state).faults.fail_next_xfer = Some(status);
    }

    /// Park every new request instead of completing it.
    pub fn hold_completions(&self) {
        lock(&self.state).faults.hold = true;
    }

    /// Stop parking requests and complete the ones already parked.
    pub fn release_held(&self) {
        let held = {
            let mut state = lock(&self.state);
            state.faults.hold = false;
            std::mem::take(&mut state.held)
        };
        debug!(count = held.len(), "releasing held requests");
        for job in held {
            self.submit(job);
        }
    }

    pub fn held_count(&self) -> usize {
        lock(&self.state).held.len()
    }

    /// Poll until `count` requests are parked or `timeout` passes.
    pub fn wait_held(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.held_count() < count {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Kinds of every resource handed out, in order.
    pub fn allocations(&self) -> Vec<ResourceKind> {
        lock(&self.state).allocated.clone()
    }

    /// Number of resources returned through [`GioProvider::free_resource`].
    pub fn freed(&self) -> usize {
        lock(&self.state).freed
    }

    /// Snapshot of the bounded loopback store.
    pub fn contents(&self, offset: usize, len: usize) -> Vec<u8> {
        let state = lock(&self.state);
        let end = (offset + len).min(state.store.len());
        state.store.get(offset..end).map(<[u8]>::to_vec).unwrap_or_default()
    }
}

impl GioProvider for PseudoProvider {
    fn driver_name(&self) -> &str {
        &self.config.driver_name
    }

    fn device_size(&self) -> Option<u64> {
        self.config.device_size
    }

    fn limits(&self) -> ProviderLimits {
        ProviderLimits {
            max_safe_alloc: self.config.max_safe_alloc,
        }
    }

    fn xfer_request(&self, request: XferRequest, completer: XferCompleter) {
        self.submit(Job::Xfer(request, completer));
    }

    fn alloc_resource(&self, kind: ResourceKind, size: usize, completer: AllocCompleter) {
        self.submit(Job::Alloc(kind, size, completer));
    }

    fn free_resource(&self, resource: Resource) {
        trace!(kind = %resource.kind(), "resource freed");
        lock(&self.state).freed += 1;
    }
}

impl Drop for PseudoProvider {
    fn drop(&mut self) {
        self.jobs.close();
        let Some(worker) = self.worker.take() else {
            return;
        };
        // The last reference can go away inside a completion on the worker itself.
        if worker.thread().id() != thread::current().id() {
            if worker.join().is_err() {
                warn!("pseudo worker panicked");
            }
        }
    }
}

fn run_worker(rx: Receiver<Job>, state: Arc<Mutex<PseudoState>>) {
    debug!("pseudo worker running");
    while let Ok(job) = rx.recv_blocking() {
        let mut guard = lock(&state);
        if guard.faults.hold {
            guard.held.push(job);
            continue;
        }
        match job {
            Job::Alloc(kind, size, completer) => {
                let result = guard.allocate(kind, size);
                drop(guard);
                completer.complete(result);
            }
            Job::Xfer(request, completer) => {
                let (status, transferred, buffer) = guard.serve(request);
                drop(guard);
                completer.complete(status, transferred, buffer);
            }
        }
    }
    debug!("pseudo worker stopped");
}

impl PseudoState {
    fn allocate(&mut self, kind: ResourceKind, size: usize) -> Result<Resource, Status> {
        if let Some((failing, status)) = self.faults.fail_alloc {
            if failing == kind {
                self.faults.fail_alloc = None;
                debug!(%kind, %status, "injected allocation failure");
                return Err(status);
            }
        }
        self.allocated.push(kind);
        Ok(match kind {
            ResourceKind::ContextMemory => Resource::Memory(vec![0; size]),
            ResourceKind::RwHandle | ResourceKind::DiagHandle => {
                let id = self.next_handle;
                self.next_handle += 1;
                Resource::Control(ControlHandle { kind, id })
            }
        })
    }

    fn serve(&mut self, request: XferRequest) -> (Status, u32, Vec<u8>) {
        let XferRequest {
            op,
            direction,
            offset,
            len,
            mut buffer,
            ..
        } = request;
        self.log.push(len);
        if let Some(status) = self.faults.fail_next_xfer.take() {
            debug!(%op, %status, "injected transfer failure");
            return (status, 0, buffer);
        }
        let len = (len as usize).min(buffer.len());
        let pos = offset.as_bytes();
        let transferred = if op == GioOp::DIAG_RUN_TEST || !direction.has_data() {
            0
        } else if direction.reads() {
            self.read(op, pos, &mut buffer[..len])
        } else {
            self.write(op, pos, &buffer[..len])
        };
        trace!(%op, offset = pos, len, transferred, "served transfer");
        (Status::OK, transferred as u32, buffer)
    }

    fn read(&mut self, op: GioOp, pos: u64, dst: &mut [u8]) -> usize {
        match self.mode {
            PseudoMode::Sink => 0,
            PseudoMode::Pattern => {
                let base = if op.is_transfer() && !self.sequential {
                    pos
                } else {
                    self.produced
                };
                for (i, byte) in dst.iter_mut().enumerate() {
                    *byte = pattern_byte(base + i as u64);
                }
                self.produced += dst.len() as u64;
                dst.len()
            }
            PseudoMode::Loopback if !self.sequential => {
                let start = (pos as usize).min(self.store.len());
                let end = (start + dst.len()).min(self.store.len());
                dst[..end - start].copy_from_slice(&self.store[start..end]);
                end - start
            }
            PseudoMode::Loopback => {
                let n = dst.len().min(self.queue.len());
                for (byte, value) in dst.iter_mut().zip(self.queue.drain(..n)) {
                    *byte = value;
                }
                n
            }
        }
    }

    fn write(&mut self, _op: GioOp, pos: u64, src: &[u8]) -> usize {
        match self.mode {
            PseudoMode::Sink | PseudoMode::Pattern => src.len(),
            PseudoMode::Loopback if !self.sequential => {
                let start = (pos as usize).min(self.store.len());
                let end = (start + src.len()).min(self.store.len());
                self.store[start..end].copy_from_slice(&src[..end - start]);
                end - start
            }
            PseudoMode::Loopback => {
                let n = src.len().min(SEQUENTIAL_QUEUE_LEN - self.queue.len());
                self.queue.extend(&src[..n]);
                n
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ContextId;
    use giobridge_proto::{DeviceOffset, Direction, Params};
    use std::sync::mpsc;

    fn xfer(op: GioOp, direction: Direction, offset: u64, buffer: Vec<u8>) -> XferRequest {
        XferRequest {
            context: ContextId(0),
            handle: ControlHandle {
                kind: ResourceKind::RwHandle,
                id: 1,
            },
            op,
            direction,
            offset: DeviceOffset::from_bytes(offset),
            len: buffer.len() as u32,
            buffer,
            params: Params::new(),
        }
    }

    fn run(provider: &PseudoProvider, request: XferRequest) -> (Status, u32, Vec<u8>) {
        let (tx, rx) = mpsc::channel();
        let completer = XferCompleter::new(request.context, move |completion| {
            tx.send((completion.status, completion.transferred, completion.buffer))
                .unwrap();
        });
        provider.xfer_request(request, completer);
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn loopback_stores_and_returns_data() {
        let provider = PseudoProvider::new(PseudoConfig {
            device_size: Some(4096),
            ..PseudoConfig::default()
        });
        let (status, n, _) = run(
            &provider,
            xfer(GioOp::WRITE, Direction::WRITE, 100, vec![7; 10]),
        );
        assert_eq!((status, n), (Status::OK, 10));
        let (_, n, buf) = run(
            &provider,
            xfer(GioOp::READ, Direction::READ, 100, vec![0; 10]),
        );
        assert_eq!(n, 10);
        assert_eq!(buf, vec![7; 10]);
        assert_eq!(provider.contents(98, 4), vec![0, 0, 7, 7]);
        assert_eq!(provider.transfer_log(), vec![10, 10]);
    }

    #[test]
    fn sink_reads_nothing() {
        let provider = PseudoProvider::new(PseudoConfig {
            mode: PseudoMode::Sink,
            ..PseudoConfig::default()
        });
        let (_, n, _) = run(&provider, xfer(GioOp::READ, Direction::READ, 0, vec![0; 8]));
        assert_eq!(n, 0);
        let (_, n, _) = run(
            &provider,
            xfer(GioOp::WRITE, Direction::WRITE, 0, vec![1; 8]),
        );
        assert_eq!(n, 8);
    }

    #[test]
    fn pattern_follows_offset() {
        let provider = PseudoProvider::new(PseudoConfig {
            mode: PseudoMode::Pattern,
            ..PseudoConfig::default()
        });
        let (_, _, buf) = run(
            &provider,
            xfer(GioOp::READ, Direction::READ, 250, vec![0; 3]),
        );
        assert_eq!(buf, vec![pattern_byte(250), 0, 1]);
    }

    #[test]
    fn sequential_loopback_is_fifo() {
        let provider = PseudoProvider::new(PseudoConfig {
            device_size: None,
            ..PseudoConfig::default()
        });
        run(
            &provider,
            xfer(GioOp::WRITE, Direction::WRITE, 0, vec![1, 2, 3]),
        );
        let (_, n, buf) = run(&provider, xfer(GioOp::READ, Direction::READ, 0, vec![0; 8]));
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[test]
    fn injected_failure_hits_next_transfer_only() {
        let provider = PseudoProvider::new(PseudoConfig::default());
        provider.fail_next_xfer(Status::HW_PROBLEM);
        let (status, n, _) = run(
            &provider,
            xfer(GioOp::WRITE, Direction::WRITE, 0, vec![1; 4]),
        );
        assert_eq!((status, n), (Status::HW_PROBLEM, 0));
        let (status, _, _) = run(
            &provider,
            xfer(GioOp::WRITE, Direction::WRITE, 0, vec![1; 4]),
        );
        assert_eq!(status, Status::OK);
    }

    #[test]
    fn held_requests_complete_on_release() {
        let provider = PseudoProvider::new(PseudoConfig::default());
        provider.hold_completions();
        let (tx, rx) = mpsc::channel();
        let completer = XferCompleter::new(ContextId(0), move |completion| {
            tx.send(completion.status).unwrap();
        });
        provider.xfer_request(
            xfer(GioOp::WRITE, Direction::WRITE, 0, vec![0; 4]),
            completer,
        );
        assert!(provider.wait_held(1, Duration::from_secs(5)));
        assert!(rx.try_recv().is_err());
        provider.release_held();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Status::OK);
    }
}
