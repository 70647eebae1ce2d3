use giobridge_core::{
    AsyncStatus, GioDevice, Mapper, MapperConfig, MapperErrorKind, PseudoConfig, PseudoMode,
    PseudoProvider,
    proto::{AsyncHandle, CONTROL_REQUEST_LEN, ControlRequest, Direction, GioOp, Status},
    pseudo::pattern_byte,
};
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

fn bind_with(staging: u32, config: PseudoConfig) -> (Mapper, Arc<PseudoProvider>, GioDevice) {
    let mapper = Mapper::with_node_table(MapperConfig {
        max_contexts: 2,
        staging_buffer_size: staging,
        drain_timeout_ms: 200,
    })
    .expect("mapper");
    let provider = PseudoProvider::new(config);
    let device = mapper.bind(provider.clone()).expect("bind");
    device.wait_ready(Duration::from_secs(5)).expect("ready");
    provider.clear_log();
    (mapper, provider, device)
}

fn wait_done(device: &GioDevice, handle: AsyncHandle) -> AsyncStatus {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match device.poll_async(handle) {
            AsyncStatus::Pending if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(1))
            }
            other => return other,
        }
    }
}

/// The finished status is visible slightly before the context returns to the pool.
fn wait_idle(device: &GioDevice) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let stats = device.stats();
        if stats.free == stats.total && stats.in_flight == 0 {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn conflicting_directions_are_not_understood() {
    let (_mapper, provider, device) = bind_with(4096, PseudoConfig::default());
    let request = ControlRequest::new(
        GioOp::custom(0x90).unwrap(),
        Direction::READ.union(Direction::WRITE),
        0,
        16,
    );
    let err = device.control(&request, &mut [0u8; 16]).unwrap_err();
    assert_eq!(err.kind(), MapperErrorKind::NotUnderstood);

    let mismatched = ControlRequest::new(GioOp::READ, Direction::WRITE, 0, 16);
    let err = device.control(&mismatched, &mut [0u8; 16]).unwrap_err();
    assert_eq!(err.kind(), MapperErrorKind::NotUnderstood);
    assert!(provider.transfer_log().is_empty());
}

#[test]
fn async_reads_are_rejected() {
    let (_mapper, _provider, device) = bind_with(4096, PseudoConfig::default());
    let request = ControlRequest::read(0, 16).asynchronous(true);
    let err = device.control(&request, &mut [0u8; 16]).unwrap_err();
    assert_eq!(err.kind(), MapperErrorKind::NotSupported);
}

#[test]
fn chunked_custom_write_is_rejected_but_custom_read_chunks() {
    let (_mapper, provider, device) = bind_with(
        64,
        PseudoConfig {
            mode: PseudoMode::Pattern,
            ..PseudoConfig::default()
        },
    );
    let op = GioOp::custom(0xA0).unwrap();
    let write = ControlRequest::new(op, Direction::WRITE, 0, 100);
    let err = device.control(&write, &mut [0u8; 100]).unwrap_err();
    assert_eq!(err.kind(), MapperErrorKind::NotSupported);

    let single = ControlRequest::new(op, Direction::WRITE, 0, 64);
    let reply = device.control(&single, &mut [0u8; 64]).expect("single-shot write");
    assert_eq!(reply.transferred_len, 64);

    provider.clear_log();
    let read = ControlRequest::new(op, Direction::READ, 0, 100);
    let mut buf = [0u8; 100];
    let reply = device.control(&read, &mut buf).expect("chunked read");
    assert_eq!(reply.status, Status::OK);
    assert_eq!(reply.transferred_len, 100);
    assert_eq!(provider.transfer_log(), vec![64, 36]);
}

#[test]
fn short_caller_buffer_faults() {
    let (_mapper, _provider, device) = bind_with(4096, PseudoConfig::default());
    let request = ControlRequest::write(0, 32);
    let err = device.control(&request, &mut [0u8; 8]).unwrap_err();
    assert_eq!(err.kind(), MapperErrorKind::Fault);
}

#[test]
fn diagnostic_ops_are_forwarded_without_data() {
    let (_mapper, provider, device) = bind_with(4096, PseudoConfig::default());
    let request = ControlRequest::new(GioOp::DIAG_RUN_TEST, Direction::NONE, 0, 0)
        .with_params(&[1, 2, 3])
        .unwrap();
    let reply = device.control(&request, &mut []).expect("diag");
    assert_eq!(reply.status, Status::OK);
    assert_eq!(reply.transferred_len, 0);
    assert_eq!(reply.async_handle, None);
    assert_eq!(provider.transfer_log(), vec![0]);
}

#[test]
fn provider_errors_travel_in_the_reply() {
    let (_mapper, provider, device) = bind_with(4096, PseudoConfig::default());
    provider.fail_next_xfer(Status::HW_PROBLEM);
    let reply = device
        .control(&ControlRequest::write(0, 16), &mut [5u8; 16])
        .expect("reply");
    assert_eq!(reply.status, Status::HW_PROBLEM);
    assert_eq!(reply.transferred_len, 0);
}

#[test]
fn async_single_shot_write_returns_pending_handle() {
    let (_mapper, provider, device) = bind_with(4096, PseudoConfig::default());
    let request = ControlRequest::write(512, 32).asynchronous(true);
    let reply = device.control(&request, &mut [6u8; 32]).expect("control");
    assert_eq!(reply.transferred_len, 0);
    let handle = reply.async_handle.expect("pending handle");
    assert_eq!(wait_done(&device, handle), AsyncStatus::Complete(Status::OK));
    assert_eq!(provider.transfer_log(), vec![32]);
    assert!(wait_idle(&device));
    assert_eq!(provider.contents(512, 32), vec![6u8; 32]);
}

#[test]
fn completed_handle_is_reported_once() {
    let (_mapper, provider, device) = bind_with(4096, PseudoConfig::default());
    provider.hold_completions();
    let reply = device
        .control(&ControlRequest::write(0, 8).asynchronous(true), &mut [1u8; 8])
        .expect("control");
    let handle = reply.async_handle.expect("handle");
    assert!(provider.wait_held(1, Duration::from_secs(5)));
    assert_eq!(device.poll_async(handle), AsyncStatus::Pending);
    assert_eq!(device.stats().in_flight, 1);

    provider.release_held();
    assert_eq!(wait_done(&device, handle), AsyncStatus::Complete(Status::OK));
    assert_eq!(device.poll_async(handle), AsyncStatus::Unknown);
}

#[test]
fn chunked_async_write_runs_synchronously() {
    let (_mapper, provider, device) = bind_with(64, PseudoConfig::default());
    let request = ControlRequest::write(0, 200).asynchronous(true);
    let reply = device.control(&request, &mut [4u8; 200]).expect("control");
    assert_eq!(reply.async_handle, None);
    assert_eq!(reply.transferred_len, 200);
    assert_eq!(provider.transfer_log(), vec![64, 64, 64, 8]);
}

#[test]
fn abort_marks_pending_request() {
    let (_mapper, provider, device) = bind_with(4096, PseudoConfig::default());
    provider.hold_completions();
    let reply = device
        .control(&ControlRequest::write(0, 8).asynchronous(true), &mut [1u8; 8])
        .expect("control");
    let handle = reply.async_handle.expect("handle");
    assert!(device.abort(handle));
    assert!(provider.wait_held(1, Duration::from_secs(5)));

    provider.release_held();
    assert_eq!(
        wait_done(&device, handle),
        AsyncStatus::Complete(Status::ABORTED)
    );
    assert!(wait_idle(&device));
    assert!(!device.abort(handle));
}

#[test]
fn decoded_requests_drive_the_device() {
    let (_mapper, _provider, device) = bind_with(
        4096,
        PseudoConfig {
            mode: PseudoMode::Pattern,
            ..PseudoConfig::default()
        },
    );
    let bytes = ControlRequest::read(300, 20).encode();
    assert_eq!(bytes.len(), CONTROL_REQUEST_LEN);
    let request = ControlRequest::try_from(bytes.as_slice()).expect("decode");
    let mut buf = [0u8; 20];
    let reply = device.control(&request, &mut buf).expect("control");
    assert_eq!(reply.transferred_len, 20);
    assert_eq!(buf[0], pattern_byte(300));
    assert_eq!(buf[19], pattern_byte(319));
}

#[test]
fn requests_before_acquisition_finishes_are_not_ready() {
    let mapper = Mapper::with_node_table(MapperConfig {
        max_contexts: 2,
        staging_buffer_size: 4096,
        drain_timeout_ms: 200,
    })
    .expect("mapper");
    let provider = PseudoProvider::new(PseudoConfig::default());
    provider.hold_completions();
    let device = mapper.bind(provider.clone()).expect("bind");
    assert!(provider.wait_held(1, Duration::from_secs(5)));

    let err = device
        .control(&ControlRequest::read(0, 4), &mut [0u8; 4])
        .unwrap_err();
    assert_eq!(err.kind(), MapperErrorKind::NotReady);
    let err = device.wait_ready(Duration::from_millis(10)).unwrap_err();
    assert_eq!(err.kind(), MapperErrorKind::NotReady);

    provider.release_held();
    device.wait_ready(Duration::from_secs(5)).expect("ready");
    let reply = device
        .control(&ControlRequest::read(0, 4), &mut [0u8; 4])
        .expect("control");
    assert_eq!(reply.transferred_len, 4);
}
