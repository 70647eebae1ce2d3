use crate::{
    MapperConfig, MapperError, MapperErrorKind, MapperResult,
    binding::{Attachment, BindingRegistry, HostAttach, NodeTable, UnbindOutcome},
    completion::AsyncStatus,
    dispatch::{self, CallerData, Submission, Submitted},
    provider::GioProvider,
    region::{Region, RegionStats},
};
use giobridge_proto::{
    AsyncHandle, ControlReply, ControlRequest, DeviceOffset, Direction, GioOp, Params,
    SECTOR_SHIFT, SECTOR_SIZE, Status,
};
use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use tracing::{info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Split a byte offset into sector number and intra-sector offset.
fn device_offset(offset: u64) -> MapperResult<DeviceOffset> {
    let block = u32::try_from(offset >> SECTOR_SHIFT).map_err(|_| {
        MapperError::with_message(
            MapperErrorKind::NotSupported,
            format!("offset {offset:#x} beyond addressable range"),
        )
    })?;
    let block_offset = (offset & u64::from(SECTOR_SIZE - 1)) as u16;
    Ok(DeviceOffset::encode(block, block_offset))
}

fn request_len(len: usize) -> MapperResult<u32> {
    u32::try_from(len).map_err(|_| {
        MapperError::with_message(
            MapperErrorKind::NotSupported,
            format!("transfer of {len} bytes exceeds 32-bit length"),
        )
    })
}

/// An open device instance: the synchronous, byte-stream face of a region.
///
/// Calls block the current thread until the provider completes them, so drive devices from
/// threads that may sleep (e.g. `spawn_blocking`), never from a completion callback.
#[derive(Clone, Debug)]
pub struct GioDevice {
    region: Arc<Region>,
}

impl GioDevice {
    pub fn instance(&self) -> u32 {
        self.region.instance()
    }

    pub fn driver_name(&self) -> &str {
        self.region.driver_name()
    }

    pub fn device_size(&self) -> Option<u64> {
        self.region.device_size()
    }

    /// Block until the region finished resource acquisition, up to `timeout`.
    pub fn wait_ready(&self, timeout: Duration) -> MapperResult<()> {
        self.region.wait_ready(timeout)
    }

    /// Read into `buf` starting at byte `offset`. Returns the bytes read, which is short at
    /// the end of a bounded device and `0` past it.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> MapperResult<usize> {
        let requested_len = request_len(buf.len())?;
        let params = Params::new();
        let submission = Submission {
            op: GioOp::READ,
            direction: Direction::READ,
            offset: device_offset(offset)?,
            requested_len,
            is_async: false,
            params: &params,
            data: CallerData::Read(buf),
        };
        Self::transferred(dispatch::submit(&self.region, submission)?)
    }

    /// Write `buf` starting at byte `offset`. Returns the bytes written.
    pub fn write(&self, offset: u64, buf: &[u8]) -> MapperResult<usize> {
        let requested_len = request_len(buf.len())?;
        let params = Params::new();
        let submission = Submission {
            op: GioOp::WRITE,
            direction: Direction::WRITE,
            offset: device_offset(offset)?,
            requested_len,
            is_async: false,
            params: &params,
            data: CallerData::Write(buf),
        };
        Self::transferred(dispatch::submit(&self.region, submission)?)
    }

    fn transferred(submitted: Submitted) -> MapperResult<usize> {
        match submitted {
            Submitted::Complete {
                transferred,
                status,
            } if status.is_ok() => Ok(transferred as usize),
            Submitted::Complete { transferred, status } => Err(MapperError::with_message(
                MapperErrorKind::Io(status),
                format!("provider failed after {transferred} bytes"),
            )),
            // Synchronous submissions never detach.
            Submitted::Pending(_) => Err(MapperError::new(MapperErrorKind::NotSupported)),
        }
    }

    /// Issue a control transfer. `data` is the source for write-direction requests and the
    /// destination for read-direction ones; it must hold at least `requested_len` bytes.
    ///
    /// Provider failures come back as a reply with a non-OK status. Requests the mapper
    /// refuses to issue are errors.
    pub fn control(&self, request: &ControlRequest, data: &mut [u8]) -> MapperResult<ControlReply> {
        let data = if request.direction.is_conflicting() || !request.direction.has_data() {
            CallerData::None
        } else if request.direction.reads() {
            CallerData::Read(data)
        } else {
            CallerData::Write(data)
        };
        let submission = Submission {
            op: request.op,
            direction: request.direction,
            offset: DeviceOffset::from_bytes(request.address),
            requested_len: request.requested_len,
            is_async: request.is_async,
            params: &request.params,
            data,
        };
        match dispatch::submit(&self.region, submission)? {
            Submitted::Complete {
                transferred,
                status,
            } => Ok(ControlReply::complete(transferred, status)),
            Submitted::Pending(handle) => Ok(ControlReply::pending(handle)),
        }
    }

    pub fn poll_async(&self, handle: AsyncHandle) -> AsyncStatus {
        self.region.poll_async(handle)
    }

    /// Ask for a pending async request to be reported as aborted once the provider
    /// completes it. Returns `false` if the handle is no longer pending.
    pub fn abort(&self, handle: AsyncHandle) -> bool {
        self.region.abort(handle)
    }

    pub fn stats(&self) -> RegionStats {
        self.region.stats()
    }
}

/// A bind whose handshake has started but not yet been confirmed.
#[must_use = "finish the bind with Mapper::bind_complete"]
#[derive(Debug)]
pub struct PendingBind {
    instance: u32,
    region: Arc<Region>,
}

impl PendingBind {
    pub fn instance(&self) -> u32 {
        self.instance
    }
}

struct InstanceEntry {
    region: Arc<Region>,
}

/// Owns the binding registry and every bound instance.
pub struct Mapper {
    config: MapperConfig,
    registry: Mutex<BindingRegistry>,
    instances: Mutex<BTreeMap<u32, InstanceEntry>>,
    next_instance: AtomicU32,
}

impl Mapper {
    pub fn new(config: MapperConfig, host: impl HostAttach + 'static) -> MapperResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry: Mutex::new(BindingRegistry::new(host)),
            instances: Mutex::new(BTreeMap::new()),
            next_instance: AtomicU32::new(0),
        })
    }

    /// Mapper backed by the default [`NodeTable`] host attachment.
    pub fn with_node_table(config: MapperConfig) -> MapperResult<Self> {
        Self::new(config, NodeTable::new())
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    /// Create the region for `provider` and start acquiring its resources.
    pub fn begin_bind(&self, provider: Arc<dyn GioProvider>) -> MapperResult<PendingBind> {
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let region = Region::new(instance, provider, &self.config);
        info!(
            instance,
            driver = %region.driver_name(),
            device_size = region.device_size(),
            "bind started"
        );
        region.start_acquisition();
        Ok(PendingBind { instance, region })
    }

    /// Finish a bind. A non-OK `status` refuses the bind and tears the region down.
    pub fn bind_complete(&self, pending: PendingBind, status: Status) -> MapperResult<GioDevice> {
        let PendingBind { instance, region } = pending;
        if !status.is_ok() {
            warn!(instance, %status, "bind refused");
            region.teardown(self.config.drain_timeout());
            return Err(MapperError::with_message(
                MapperErrorKind::CannotBind,
                format!("bind handshake failed: {status}"),
            ));
        }
        let random_access = region.device_size().is_some();
        let attached = lock(&self.registry).bind(region.driver_name(), random_access);
        if let Err(err) = attached {
            warn!(instance, error = %err, "host attach failed");
            region.teardown(self.config.drain_timeout());
            return Err(MapperError::with_message(
                MapperErrorKind::ResourceUnavailable,
                format!("host attach failed: {err}"),
            ));
        }
        lock(&self.instances).insert(
            instance,
            InstanceEntry {
                region: Arc::clone(&region),
            },
        );
        info!(instance, driver = %region.driver_name(), "instance bound");
        Ok(GioDevice { region })
    }

    /// Begin and complete a bind in one step.
    pub fn bind(&self, provider: Arc<dyn GioProvider>) -> MapperResult<GioDevice> {
        let pending = self.begin_bind(provider)?;
        self.bind_complete(pending, Status::OK)
    }

    pub fn open(&self, instance: u32) -> MapperResult<GioDevice> {
        lock(&self.instances)
            .get(&instance)
            .map(|entry| GioDevice {
                region: Arc::clone(&entry.region),
            })
            .ok_or_else(|| {
                MapperError::with_message(
                    MapperErrorKind::NoDevice,
                    format!("instance {instance} is not bound"),
                )
            })
    }

    /// Tear an instance down and drop its driver reference. Clones of `device` that are
    /// still around fail every call afterwards.
    pub fn unbind(&self, device: GioDevice) -> MapperResult<UnbindOutcome> {
        let instance = device.instance();
        let Some(entry) = lock(&self.instances).remove(&instance) else {
            return Err(MapperError::with_message(
                MapperErrorKind::NoDevice,
                format!("instance {instance} is not bound"),
            ));
        };
        let drained = entry.region.teardown(self.config.drain_timeout());
        let outcome = lock(&self.registry).unbind(entry.region.driver_name())?;
        info!(instance, drained, "instance unbound");
        Ok(outcome)
    }

    /// Numbers of all bound instances, ascending.
    pub fn instances(&self) -> Vec<u32> {
        lock(&self.instances).keys().copied().collect()
    }

    pub fn refcount(&self, driver_name: &str) -> Option<u32> {
        lock(&self.registry).refcount(driver_name)
    }

    pub fn attachment(&self, driver_name: &str) -> Option<Attachment> {
        lock(&self.registry).attachment(driver_name).cloned()
    }
}

impl core::fmt::Debug for Mapper {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mapper")
            .field("config", &self.config)
            .field("instances", &self.instances())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use giobridge_proto::MAX_BLOCK;

    #[test]
    fn byte_offsets_split_into_sectors() {
        assert_eq!(device_offset(0).unwrap(), DeviceOffset::ZERO);
        assert_eq!(device_offset(1000).unwrap().decode(), (1, 488));
        let wrap = device_offset(u64::from(MAX_BLOCK) << SECTOR_SHIFT).unwrap();
        assert_eq!(wrap, DeviceOffset::new(1, 0));
    }

    #[test]
    fn offsets_past_addressable_range_are_rejected() {
        let err = device_offset(1 << 42).unwrap_err();
        assert_eq!(err.kind(), MapperErrorKind::NotSupported);
    }
}
