mod config;

use anyhow::{Context, Result, anyhow, ensure};
use clap::Parser;
use config::{Mode, Settings};
use giobridge_core::{
    GioDevice, Mapper, PseudoProvider, UnbindOutcome,
    proto::{ControlRequest, Direction, GioOp},
};
use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{signal, task::JoinHandle};
use tracing::{debug, info, warn};

const READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "giobridge", version)]
#[command(about = "Drive giobridge pseudo devices through the blocking byte-stream interface", long_about = None)]
struct Args {
    /// JSON config file; flags override its values.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Request contexts acquired per device.
    #[arg(long)]
    contexts: Option<u16>,
    /// Staging buffer size per context (bytes).
    #[arg(long, value_name = "BYTES")]
    staging_size: Option<u32>,
    /// How long unbind waits for in-flight requests.
    #[arg(long, value_name = "MS")]
    drain_timeout_ms: Option<u64>,
    /// Behaviour of the pseudo devices.
    #[arg(long, value_enum)]
    mode: Option<Mode>,
    /// Device size in bytes; 0 binds sequential devices.
    #[arg(long, value_name = "BYTES")]
    device_size: Option<u64>,
    /// Largest staging allocation the pseudo provider accepts; 0 means no limit.
    #[arg(long, value_name = "BYTES")]
    max_safe_alloc: Option<usize>,
    /// Number of device instances to bind.
    #[arg(long)]
    instances: Option<u32>,
    /// Blocking worker threads, spread across instances.
    #[arg(long)]
    workers: Option<usize>,
    /// Bytes per read and write.
    #[arg(long, value_name = "BYTES")]
    transfer_size: Option<usize>,
    /// Write/read rounds per worker.
    #[arg(long)]
    iterations: Option<u32>,
}

impl Args {
    fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        if let Some(contexts) = self.contexts {
            settings.mapper.max_contexts = contexts;
        }
        if let Some(size) = self.staging_size {
            settings.mapper.staging_buffer_size = size;
        }
        if let Some(ms) = self.drain_timeout_ms {
            settings.mapper.drain_timeout_ms = ms;
        }
        if let Some(mode) = self.mode {
            settings.device.mode = mode;
        }
        if let Some(size) = self.device_size {
            settings.device.device_size = size;
        }
        if let Some(limit) = self.max_safe_alloc {
            settings.device.max_safe_alloc = limit;
        }
        if let Some(instances) = self.instances {
            settings.device.instances = instances;
        }
        if let Some(workers) = self.workers {
            settings.workload.workers = workers;
        }
        if let Some(size) = self.transfer_size {
            settings.workload.transfer_size = size;
        }
        if let Some(iterations) = self.iterations {
            settings.workload.iterations = iterations;
        }
        ensure!(settings.device.instances > 0, "at least one instance is required");
        ensure!(settings.workload.workers > 0, "at least one worker is required");
        ensure!(settings.workload.transfer_size > 0, "transfer size must be non-zero");
        Ok(settings)
    }
}

#[derive(Debug, Default)]
struct WorkerReport {
    written: u64,
    read: u64,
    mismatches: u32,
    controls: u32,
}

struct WorkerPlan {
    index: usize,
    offset: u64,
    transfer_size: usize,
    iterations: u32,
    verify: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let settings = args.settings().context("load settings")?;
    debug!(?settings, "effective settings");

    let mapper = Mapper::with_node_table(settings.mapper.clone()).context("init mapper")?;
    let mut devices = Vec::new();
    for _ in 0..settings.device.instances {
        let provider = PseudoProvider::new(settings.device.pseudo_config());
        let device = mapper.bind(provider).context("bind pseudo device")?;
        device
            .wait_ready(READY_TIMEOUT)
            .context(format!("instance {} resource acquisition", device.instance()))?;
        let stats = device.stats();
        info!(
            instance = device.instance(),
            driver = %device.driver_name(),
            contexts = stats.total,
            staging = stats.staging_buffer_size,
            "device ready"
        );
        devices.push(device);
    }
    if let Some(attachment) = mapper.attachment(&settings.device.driver_name) {
        info!(
            node = %attachment.node,
            major = attachment.major,
            refcount = mapper.refcount(&settings.device.driver_name),
            "host node attached"
        );
    }

    let stop = Arc::new(AtomicBool::new(false));
    let started = Instant::now();
    let workers = spawn_workers(&settings, &devices, &stop);

    let collect = async {
        let mut reports = Vec::with_capacity(workers.len());
        for (index, handle) in workers.into_iter().enumerate() {
            let report = handle
                .await
                .map_err(|err| anyhow!("worker {index} panicked: {err}"))?
                .context(format!("worker {index}"))?;
            reports.push(report);
        }
        Ok::<_, anyhow::Error>(reports)
    };
    tokio::pin!(collect);

    let reports = tokio::select! {
        res = &mut collect => res,
        _ = signal::ctrl_c() => {
            info!("shutdown requested");
            stop.store(true, Ordering::Relaxed);
            collect.await
        }
    };

    let elapsed = started.elapsed();
    let outcome = reports.map(|reports| summarize(&reports, elapsed));

    for device in devices {
        let instance = device.instance();
        let stats = device.stats();
        info!(
            instance,
            state = %stats.state,
            free = stats.free,
            total = stats.total,
            in_flight = stats.in_flight,
            "unbinding"
        );
        match mapper.unbind(device).context(format!("unbind instance {instance}"))? {
            UnbindOutcome::Retained { refcount } => debug!(instance, refcount, "driver retained"),
            UnbindOutcome::Detached(attachment) => {
                info!(instance, node = %attachment.node, "host node removed")
            }
        }
    }

    let mismatches = outcome?;
    ensure!(mismatches == 0, "{mismatches} read-back mismatches");
    Ok(())
}

fn spawn_workers(
    settings: &Settings,
    devices: &[GioDevice],
    stop: &Arc<AtomicBool>,
) -> Vec<JoinHandle<Result<WorkerReport>>> {
    let workload = &settings.workload;
    let per_device = workload.workers.div_ceil(devices.len()) as u64;
    let slot = workload.transfer_size as u64;
    let fits = devices
        .first()
        .and_then(GioDevice::device_size)
        .is_some_and(|size| per_device * slot <= size);
    let verify = settings.device.mode == Mode::Loopback && fits;
    if !verify {
        debug!("read-back verification disabled for this workload");
    }

    (0..workload.workers)
        .map(|index| {
            let device = devices[index % devices.len()].clone();
            let plan = WorkerPlan {
                index,
                offset: (index / devices.len()) as u64 * slot,
                transfer_size: workload.transfer_size,
                iterations: workload.iterations,
                verify,
            };
            let stop = Arc::clone(stop);
            tokio::task::spawn_blocking(move || run_worker(&device, &plan, &stop))
        })
        .collect()
}

fn run_worker(device: &GioDevice, plan: &WorkerPlan, stop: &AtomicBool) -> Result<WorkerReport> {
    let mut report = WorkerReport::default();
    let mut out = vec![0u8; plan.transfer_size];
    let mut back = vec![0u8; plan.transfer_size];
    let diag = ControlRequest::new(GioOp::DIAG_RUN_TEST, Direction::NONE, 0, 0)
        .with_params(&[plan.index as u8])
        .map_err(|err| anyhow!("build diagnostic request: {err}"))?;

    for round in 0..plan.iterations {
        if stop.load(Ordering::Relaxed) {
            debug!(worker = plan.index, round, "worker stopping early");
            break;
        }
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = (i as u32 ^ round ^ plan.index as u32) as u8;
        }
        let written = device
            .write(plan.offset, &out)
            .context(format!("write at {}", plan.offset))?;
        report.written += written as u64;

        let read = device
            .read(plan.offset, &mut back)
            .context(format!("read at {}", plan.offset))?;
        report.read += read as u64;
        if plan.verify && (read != written || back[..read] != out[..read]) {
            warn!(worker = plan.index, round, written, read, "read-back mismatch");
            report.mismatches += 1;
        }

        let reply = device.control(&diag, &mut []).context("diagnostic control")?;
        if !reply.status.is_ok() {
            warn!(worker = plan.index, status = %reply.status, "diagnostic failed");
        }
        report.controls += 1;
    }
    debug!(worker = plan.index, ?report, "worker finished");
    Ok(report)
}

fn summarize(reports: &[WorkerReport], elapsed: Duration) -> u32 {
    let written: u64 = reports.iter().map(|r| r.written).sum();
    let read: u64 = reports.iter().map(|r| r.read).sum();
    let controls: u32 = reports.iter().map(|r| r.controls).sum();
    let mismatches: u32 = reports.iter().map(|r| r.mismatches).sum();
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        workers = reports.len(),
        written,
        read,
        controls,
        mismatches,
        elapsed_ms = elapsed.as_millis() as u64,
        mib_per_sec = %format!("{:.1}", (written + read) as f64 / secs / (1 << 20) as f64),
        "workload finished"
    );
    mismatches
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn flags_override_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("giobridge.json");
        fs::write(
            &path,
            r#"{ "mapper": { "max_contexts": 2 }, "workload": { "workers": 9, "iterations": 5 } }"#,
        )
        .unwrap();

        let args = Args::parse_from([
            "giobridge",
            "--config",
            path.to_str().unwrap(),
            "--workers",
            "3",
            "--mode",
            "sink",
        ]);
        let settings = args.settings().unwrap();
        assert_eq!(settings.mapper.max_contexts, 2);
        assert_eq!(settings.workload.workers, 3);
        assert_eq!(settings.workload.iterations, 5);
        assert_eq!(settings.device.mode, Mode::Sink);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let args = Args::parse_from(["giobridge", "--workers", "0"]);
        assert!(args.settings().is_err());
    }

    #[test]
    fn worker_round_trips_through_loopback() {
        let settings = Settings::default();
        let mapper = Mapper::with_node_table(settings.mapper.clone()).unwrap();
        let device = mapper
            .bind(PseudoProvider::new(settings.device.pseudo_config()))
            .unwrap();
        device.wait_ready(READY_TIMEOUT).unwrap();
        let plan = WorkerPlan {
            index: 1,
            offset: 4096,
            transfer_size: 1000,
            iterations: 4,
            verify: true,
        };
        let report = run_worker(&device, &plan, &AtomicBool::new(false)).unwrap();
        assert_eq!(report.written, 4000);
        assert_eq!(report.read, 4000);
        assert_eq!(report.mismatches, 0);
        assert_eq!(report.controls, 4);
        mapper.unbind(device).unwrap();
    }
}
