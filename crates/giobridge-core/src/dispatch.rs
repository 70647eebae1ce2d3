//! Translation of one synchronous read/write/control call into provider transfers.

use crate::{
    MapperError, MapperErrorKind, MapperResult, metrics,
    pool::{ContextKind, RequestContext},
    provider::{XferCompletion, XferRequest},
    region::Region,
};
use giobridge_proto::{AsyncHandle, DeviceOffset, Direction, GioOp, Params, Status};
use std::{sync::Arc, time::Instant};
use tracing::{debug, trace};

/// Caller data for one submission.
pub(crate) enum CallerData<'a> {
    None,
    /// Destination for read-direction data.
    Read(&'a mut [u8]),
    /// Source for write-direction data.
    Write(&'a [u8]),
}

impl CallerData<'_> {
    fn len(&self) -> usize {
        match self {
            CallerData::None => 0,
            CallerData::Read(buf) => buf.len(),
            CallerData::Write(buf) => buf.len(),
        }
    }
}

pub(crate) struct Submission<'a> {
    pub(crate) op: GioOp,
    pub(crate) direction: Direction,
    pub(crate) offset: DeviceOffset,
    pub(crate) requested_len: u32,
    pub(crate) is_async: bool,
    pub(crate) params: &'a Params,
    pub(crate) data: CallerData<'a>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Submitted {
    /// Finished. A non-OK status is a provider error; `transferred` counts what moved first.
    Complete { transferred: u32, status: Status },
    /// Handed to the provider; the completion path releases the context.
    Pending(AsyncHandle),
}

fn reject(kind: MapperErrorKind, message: &str) -> MapperError {
    MapperError::with_message(kind, message)
}

fn validate(region: &Region, sub: &Submission<'_>) -> MapperResult<()> {
    region.ensure_serving()?;
    if sub.direction.is_conflicting() {
        return Err(reject(
            MapperErrorKind::NotUnderstood,
            "request asks for both read and write",
        ));
    }
    if (sub.op == GioOp::READ && sub.direction != Direction::READ)
        || (sub.op == GioOp::WRITE && sub.direction != Direction::WRITE)
    {
        return Err(reject(
            MapperErrorKind::NotUnderstood,
            "transfer op direction mismatch",
        ));
    }
    if sub.is_async && sub.direction.reads() {
        return Err(reject(
            MapperErrorKind::NotSupported,
            "asynchronous reads are not supported",
        ));
    }
    if sub.direction.has_data() && sub.data.len() < sub.requested_len as usize {
        return Err(reject(
            MapperErrorKind::Fault,
            "caller buffer shorter than requested length",
        ));
    }
    let single_shot = sub.requested_len <= region.staging_buffer_size();
    if !single_shot && sub.direction.writes() && sub.op != GioOp::WRITE {
        return Err(reject(
            MapperErrorKind::NotSupported,
            "chunked write-direction ioctl cannot replay its parameters",
        ));
    }
    Ok(())
}

/// Bytes actually moved: clamped to what remains on a bounded device.
fn effective_len(region: &Region, sub: &Submission<'_>) -> u32 {
    if !sub.direction.has_data() {
        return 0;
    }
    match (sub.op.is_transfer(), region.device_size()) {
        (true, Some(size)) => {
            let left = size.saturating_sub(sub.offset.as_bytes());
            left.min(u64::from(sub.requested_len)) as u32
        }
        _ => sub.requested_len,
    }
}

fn context_kind(op: GioOp) -> ContextKind {
    if op.is_transfer() {
        ContextKind::BlockIo
    } else if op.is_diagnostic() {
        ContextKind::Diagnostic
    } else {
        ContextKind::IoctlTransfer
    }
}

/// Run one request to completion (or hand it off as pending).
pub(crate) fn submit(region: &Arc<Region>, sub: Submission<'_>) -> MapperResult<Submitted> {
    validate(region, &sub)?;
    if sub.requested_len == 0 && sub.direction.has_data() {
        trace!(instance = region.instance(), op = %sub.op, "empty request");
        return Ok(Submitted::Complete {
            transferred: 0,
            status: Status::OK,
        });
    }
    let staging = region.staging_buffer_size();
    let amount = effective_len(region, &sub);
    let single_shot = sub.requested_len <= staging;

    let mut ctx = region.pool().acquire()?;
    ctx.kind = context_kind(sub.op);
    ctx.single_shot = single_shot;
    ctx.remaining = amount;
    ctx.transferred = 0;

    if amount == 0 && sub.direction.has_data() {
        return Ok(fake_ack(region, ctx));
    }

    let handle = match ctx.kind {
        ContextKind::Diagnostic => ctx.diag_handle,
        _ => ctx.rw_handle,
    };
    let Some(handle) = handle else {
        region.recycle(ctx);
        return Err(reject(
            MapperErrorKind::ResourceUnavailable,
            "context has no control handle",
        ));
    };

    // Sequential devices have no position.
    let mut cursor = match (sub.op.is_transfer(), region.device_size()) {
        (true, None) => DeviceOffset::ZERO,
        _ => sub.offset,
    };

    if sub.is_async && !single_shot {
        debug!(
            instance = region.instance(),
            len = sub.requested_len,
            "chunked async write forced synchronous"
        );
    }
    let detach = sub.is_async && single_shot;
    let mut data = sub.data;

    let status = loop {
        let chunk = ctx.remaining.min(staging);
        let mut buffer = if sub.direction.has_data() {
            ctx.take_buffer(chunk as usize)
        } else {
            Vec::new()
        };
        if let CallerData::Write(src) = &data {
            let start = ctx.transferred as usize;
            buffer[..chunk as usize].copy_from_slice(&src[start..start + chunk as usize]);
        }
        let request = XferRequest {
            context: ctx.id(),
            handle,
            op: sub.op,
            direction: sub.direction,
            offset: cursor,
            len: chunk,
            buffer,
            params: sub.params.clone(),
        };
        trace!(
            instance = region.instance(),
            ctx = %ctx.id(),
            op = %sub.op,
            offset = %cursor,
            len = chunk,
            "issuing transfer"
        );

        if detach {
            let id = ctx.id();
            let completer = region.completer(id);
            let async_handle = region.register_detached(ctx, sub.direction);
            region.provider().xfer_request(request, completer);
            debug!(
                instance = region.instance(),
                ctx = %id,
                handle = async_handle.id,
                "async transfer pending"
            );
            return Ok(Submitted::Pending(async_handle));
        }

        let started = Instant::now();
        region.register_blocking(&ctx);
        region
            .provider()
            .xfer_request(request, region.completer(ctx.id()));
        let XferCompletion {
            status: chunk_status,
            transferred,
            buffer,
            ..
        } = ctx.wait();
        let moved = transferred.min(chunk);
        metrics::observe_transfer(sub.direction, moved as usize, started.elapsed());

        if let CallerData::Read(dst) = &mut data {
            let start = ctx.transferred as usize;
            let available = moved.min(buffer.len() as u32) as usize;
            dst[start..start + available].copy_from_slice(&buffer[..available]);
        }
        ctx.restore_buffer(buffer);
        ctx.status = chunk_status;
        ctx.transferred += moved;
        ctx.remaining -= moved;

        if !chunk_status.is_ok() || moved == 0 || ctx.remaining == 0 {
            break chunk_status;
        }
        if sub.op.is_transfer() && region.device_size().is_some() {
            cursor = cursor.advance(moved);
        }
    };

    let transferred = ctx.transferred;
    trace!(
        instance = region.instance(),
        ctx = %ctx.id(),
        len = transferred,
        %status,
        "request finished"
    );
    region.recycle(ctx);
    Ok(Submitted::Complete {
        transferred,
        status,
    })
}

/// Complete a request that ran past the device end through the completion path, without
/// involving the provider.
fn fake_ack(region: &Arc<Region>, mut ctx: RequestContext) -> Submitted {
    metrics::record_fake_ack();
    trace!(instance = region.instance(), ctx = %ctx.id(), "zero-length fake ack");
    let buffer = ctx.take_buffer(0);
    region.register_blocking(&ctx);
    region.complete(XferCompletion {
        context: ctx.id(),
        status: Status::OK,
        transferred: 0,
        buffer,
    });
    let completion = ctx.wait();
    ctx.restore_buffer(completion.buffer);
    let status = completion.status;
    region.recycle(ctx);
    Submitted::Complete {
        transferred: 0,
        status,
    }
}
