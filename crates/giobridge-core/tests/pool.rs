use giobridge_core::{
    GioDevice, Mapper, MapperConfig, MapperErrorKind, PseudoConfig, PseudoProvider,
    proto::ControlRequest,
};
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

fn bind(contexts: u16, drain_timeout_ms: u64) -> (Mapper, Arc<PseudoProvider>, GioDevice) {
    let mapper = Mapper::with_node_table(MapperConfig {
        max_contexts: contexts,
        staging_buffer_size: 256,
        drain_timeout_ms,
    })
    .expect("mapper");
    let provider = PseudoProvider::new(PseudoConfig::default());
    let device = mapper.bind(provider.clone()).expect("bind");
    device.wait_ready(Duration::from_secs(5)).expect("ready");
    (mapper, provider, device)
}

fn occupy_all(device: &GioDevice, provider: &PseudoProvider, contexts: usize) {
    provider.hold_completions();
    for i in 0..contexts {
        let reply = device
            .control(
                &ControlRequest::write(i as u64 * 16, 16).asynchronous(true),
                &mut [i as u8; 16],
            )
            .expect("async write");
        assert!(reply.async_handle.is_some());
    }
    assert!(provider.wait_held(contexts, Duration::from_secs(5)));
}

#[test]
fn exhausted_pool_blocks_until_a_context_returns() {
    let (_mapper, provider, device) = bind(2, 200);
    occupy_all(&device, &provider, 2);
    let stats = device.stats();
    assert_eq!((stats.free, stats.in_use, stats.total), (0, 2, 2));
    assert_eq!(stats.in_flight, 2);

    let blocked = {
        let device = device.clone();
        thread::spawn(move || device.write(100, &[9u8; 32]))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!blocked.is_finished());

    provider.release_held();
    assert_eq!(blocked.join().unwrap().expect("write"), 32);
    assert_eq!(provider.contents(100, 32), vec![9u8; 32]);
}

#[test]
fn counts_stay_conserved_under_load() {
    let (_mapper, _provider, device) = bind(4, 200);
    let workers = 8;
    let rounds = 50;

    thread::scope(|scope| {
        for worker in 0..workers {
            let device = device.clone();
            scope.spawn(move || {
                let offset = worker as u64 * 512;
                let data: Vec<u8> = (0..300).map(|i| (i + worker) as u8).collect();
                let mut back = vec![0u8; data.len()];
                for _ in 0..rounds {
                    assert_eq!(device.write(offset, &data).unwrap(), data.len());
                    assert_eq!(device.read(offset, &mut back).unwrap(), data.len());
                    assert_eq!(back, data);
                }
            });
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            let stats = device.stats();
            assert_eq!(stats.free + stats.in_use, stats.total);
            assert!(stats.in_use <= 4);
            thread::sleep(Duration::from_micros(200));
        }
    });

    let stats = device.stats();
    assert_eq!((stats.free, stats.in_use), (4, 0));
}

#[test]
fn unbind_wakes_blocked_callers_and_frees_late_contexts() {
    let (mapper, provider, device) = bind(2, 100);
    occupy_all(&device, &provider, 2);

    let blocked = {
        let device = device.clone();
        thread::spawn(move || device.write(0, &[1u8; 8]))
    };
    thread::sleep(Duration::from_millis(20));

    mapper.unbind(device.clone()).expect("unbind");
    let err = blocked.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), MapperErrorKind::ResourceUnavailable);

    // Both contexts were still in flight; they go back to the provider as they complete.
    let allocated = provider.allocations().len();
    assert!(provider.freed() < allocated);
    provider.release_held();
    let deadline = Instant::now() + Duration::from_secs(5);
    while provider.freed() < allocated && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(provider.freed(), allocated);
    assert_eq!(device.stats().total, 0);
}

#[test]
fn empty_requests_complete_while_every_context_is_busy() {
    let (_mapper, provider, device) = bind(1, 200);
    occupy_all(&device, &provider, 1);

    let empty = {
        let device = device.clone();
        thread::spawn(move || {
            let read = device.read(0, &mut []);
            let write = device.write(0, &[]);
            (read, write)
        })
    };
    let deadline = Instant::now() + Duration::from_secs(2);
    while !empty.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(empty.is_finished());
    let (read, write) = empty.join().unwrap();
    assert_eq!(read.expect("empty read"), 0);
    assert_eq!(write.expect("empty write"), 0);
    assert_eq!(device.stats().in_use, 1);

    provider.release_held();
}
