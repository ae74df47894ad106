//! # Device Manager
//!
//! Owns the pool of virtual devices of one benchmark host and drives timed
//! runs over it.
//!
//! ## Run Lifecycle
//!
//! ```text
//!            start(clients)                      timer / stop()
//!   Idle ─────────────────────────► Running ─────────────────────► Idle + record
//!     │                                ▲
//!     │ start(servers)                 │ join_barrier() released
//!     └──────────────────► Armed ──────┘
//!                            │ stop() / abort
//!                            └───────────────────────────────────► Idle, no record
//! ```
//!
//! - Client runs start their duration timer immediately.
//! - Server (observe) runs arm a barrier of `n + 1` parties. Every server
//!   waits there once it has been observed. The coordinator is the extra
//!   party, and the duration timer starts only after the barrier releases.
//! - `stop()` is idempotent: the phase is swapped to `Stopping` under the
//!   run lock, so a timer and an operator racing to stop produce one record.
//!   Device threads are joined with the lock released; the run becomes
//!   `Idle` once its record is written.
//!
//! The pool is reconciled rather than rebuilt: resizing keeps every healthy
//! device of the right kind and only creates or closes the difference.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::barrier::{BarrierOutcome, StartBarrier};
use crate::benchmark::{BenchmarkProcess, TimerId};
use crate::coap::{check_address_family, Method, TargetUri};
use crate::device::{DeviceFactory, DeviceKind, DeviceSettings, DeviceTimeouts, VirtualDevice};
use crate::error::{BenchError, Result};
use crate::metrics::{RunTotals, StatisticsRecord};

/// Operator-facing configuration of a manager.
#[derive(Clone, Debug)]
pub struct ManagerSettings {
    pub uri: Option<TargetUri>,
    pub bind: Option<IpAddr>,
    pub method: Method,
    pub payload: Option<Vec<u8>>,
    pub confirmable: bool,
    pub track_latency: bool,
    pub check_mid: bool,
    pub timeouts: DeviceTimeouts,
    /// Pause after each run of a series before the next level starts.
    pub guard_band: Duration,
    /// Pause after the last run of a series.
    pub tail_guard: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            uri: None,
            bind: None,
            method: Method::Get,
            payload: None,
            confirmable: true,
            track_latency: false,
            check_mid: true,
            timeouts: DeviceTimeouts::default(),
            guard_band: crate::defaults::SERIES_GUARD_BAND,
            tail_guard: crate::defaults::SERIES_TAIL_GUARD,
        }
    }
}

/// How many devices the pool has created and closed over its lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: usize,
    pub closed: usize,
}

#[derive(Debug)]
enum RunPhase {
    Idle,
    /// Observe run waiting for the coordinator at the barrier.
    Armed,
    Running { started: Instant },
    /// Devices are being joined outside the run lock.
    Stopping,
}

struct RunState {
    devices: Vec<Box<dyn VirtualDevice>>,
    next_device_id: usize,
    phase: RunPhase,
    run_id: u64,
    concurrency: usize,
    duration: Duration,
    barrier: Option<Arc<StartBarrier>>,
    timer: Option<TimerId>,
    pool: PoolStats,
}

struct Inner {
    settings: Mutex<ManagerSettings>,
    resolved: Mutex<Option<Arc<DeviceSettings>>>,
    run: Mutex<RunState>,
    idle: Condvar,
}

/// Owns the device pool and the lifecycle of benchmark runs.
#[derive(Clone)]
pub struct DeviceManager {
    process: Arc<BenchmarkProcess>,
    inner: Arc<Inner>,
}

impl DeviceManager {
    pub fn new(process: Arc<BenchmarkProcess>) -> Self {
        Self::with_settings(process, ManagerSettings::default())
    }

    pub fn with_settings(process: Arc<BenchmarkProcess>, settings: ManagerSettings) -> Self {
        Self {
            process,
            inner: Arc::new(Inner {
                settings: Mutex::new(settings),
                resolved: Mutex::new(None),
                run: Mutex::new(RunState {
                    devices: Vec::new(),
                    next_device_id: 1,
                    phase: RunPhase::Idle,
                    run_id: 0,
                    concurrency: 0,
                    duration: Duration::ZERO,
                    barrier: None,
                    timer: None,
                    pool: PoolStats::default(),
                }),
                idle: Condvar::new(),
            }),
        }
    }

    pub fn settings(&self) -> ManagerSettings {
        self.inner.settings.lock().clone()
    }

    /// Change the configuration. Devices pick it up at the next start.
    pub fn update_settings(&self, update: impl FnOnce(&mut ManagerSettings)) {
        let mut settings = self.inner.settings.lock();
        update(&mut settings);
        *self.inner.resolved.lock() = None;
    }

    pub fn set_uri(&self, uri: &str) -> Result<()> {
        let uri = TargetUri::parse(uri)?;
        self.update_settings(|s| s.uri = Some(uri));
        Ok(())
    }

    /// Set the local bind address, rejecting one whose family differs from
    /// the current target's.
    pub fn set_bind_address(&self, bind: Option<IpAddr>) -> Result<()> {
        if let (Some(bind), Some(uri)) = (bind, self.settings().uri) {
            check_address_family(bind, uri.resolve()?)?;
        }
        self.update_settings(|s| s.bind = bind);
        Ok(())
    }

    pub fn set_confirmable(&self, confirmable: bool) {
        self.update_settings(|s| s.confirmable = confirmable);
    }

    pub fn set_track_latency(&self, track_latency: bool) {
        self.update_settings(|s| s.track_latency = track_latency);
    }

    /// Resolve the settings into what devices need, once per change.
    fn device_settings(&self) -> Result<Arc<DeviceSettings>> {
        let settings = self.inner.settings.lock();
        let mut resolved = self.inner.resolved.lock();
        if let Some(existing) = resolved.as_ref() {
            return Ok(Arc::clone(existing));
        }

        let uri = settings.uri.clone().ok_or(BenchError::NoTarget)?;
        let target_addr = uri.resolve()?;
        if let Some(bind) = settings.bind {
            check_address_family(bind, target_addr)?;
        }

        let device_settings = Arc::new(DeviceSettings {
            target: uri,
            target_addr,
            bind: settings.bind,
            method: settings.method,
            payload: settings.payload.clone(),
            confirmable: settings.confirmable,
            track_latency: settings.track_latency,
            check_mid: settings.check_mid,
            timeouts: settings.timeouts,
            verbose: self.process.verbose(),
        });
        *resolved = Some(Arc::clone(&device_settings));
        Ok(device_settings)
    }

    /// Reconcile the pool to exactly `n` devices of `kind`.
    pub fn set_device_count(&self, n: usize, kind: DeviceKind) -> Result<()> {
        let mut state = self.inner.run.lock();
        if !matches!(state.phase, RunPhase::Idle) {
            return Err(BenchError::RunActive);
        }
        self.reconcile(&mut state, n, kind)
    }

    fn reconcile(&self, state: &mut RunState, n: usize, kind: DeviceKind) -> Result<()> {
        let settings = self.device_settings()?;

        let mut closed = 0;
        let mut kept: Vec<Box<dyn VirtualDevice>> = Vec::with_capacity(n);
        for mut device in state.devices.drain(..) {
            if device.kind() == kind && !device.has_failed() && kept.len() < n {
                kept.push(device);
            } else {
                device.close();
                closed += 1;
            }
        }
        state.devices = kept;
        state.pool.closed += closed;

        while state.devices.len() < n {
            let id = state.next_device_id;
            state.next_device_id += 1;
            let mut device = DeviceFactory::create(kind, id);
            device.bind(settings.bind_addr())?;
            state.devices.push(device);
            state.pool.created += 1;
        }

        for device in state.devices.iter_mut() {
            device.set_target(Arc::clone(&settings))?;
        }
        debug!("Pool reconciled to {} {} devices (closed {})", n, kind, closed);
        Ok(())
    }

    pub fn device_count(&self) -> usize {
        self.inner.run.lock().devices.len()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.run.lock().pool
    }

    /// Start a run of `n` devices for `duration`.
    ///
    /// ## Returns
    /// The id of the new run. Client runs are already timed; server runs
    /// wait for [`join_barrier`](Self::join_barrier).
    pub fn start(&self, n: usize, duration: Duration, kind: DeviceKind) -> Result<u64> {
        let mut state = self.inner.run.lock();
        if !matches!(state.phase, RunPhase::Idle) {
            return Err(BenchError::RunActive);
        }
        self.reconcile(&mut state, n, kind)?;

        state.run_id += 1;
        state.concurrency = n;
        state.duration = duration;
        let run_id = state.run_id;

        let barrier = match kind {
            DeviceKind::Server => Some(Arc::new(StartBarrier::new(n + 1))),
            DeviceKind::Client => None,
        };
        state.barrier = barrier.clone();

        for device in state.devices.iter() {
            device.reset();
        }
        let mut launch_error = None;
        for device in state.devices.iter_mut() {
            if let Err(e) = device.start(barrier.clone()) {
                launch_error = Some(e);
                break;
            }
        }
        if let Some(e) = launch_error {
            error!("Failed to launch devices: {}", e);
            state.phase = RunPhase::Armed;
            self.finish_run(&mut state);
            return Err(e);
        }

        match kind {
            DeviceKind::Client => {
                state.phase = RunPhase::Running {
                    started: Instant::now(),
                };
                state.timer = Some(self.schedule_stop(run_id, duration));
                info!("Started {} clients for {:?}", n, duration);
            }
            DeviceKind::Server => {
                state.phase = RunPhase::Armed;
                info!("Armed {} servers, waiting for start signal", n);
            }
        }
        Ok(run_id)
    }

    fn schedule_stop(&self, run_id: u64, duration: Duration) -> TimerId {
        let manager = self.clone();
        self.process.scheduler().schedule(duration, move || {
            manager.stop_run(Some(run_id));
        })
    }

    /// Join the start barrier as the coordinator. Once it releases, the run
    /// becomes timed.
    pub fn join_barrier(&self) -> BarrierOutcome {
        let (barrier, run_id) = {
            let state = self.inner.run.lock();
            match (&state.phase, &state.barrier) {
                (RunPhase::Armed, Some(barrier)) => (Arc::clone(barrier), state.run_id),
                _ => return BarrierOutcome::Aborted,
            }
        };

        let outcome = barrier.wait();
        if outcome == BarrierOutcome::Released {
            let mut state = self.inner.run.lock();
            if state.run_id == run_id && matches!(state.phase, RunPhase::Armed) {
                state.phase = RunPhase::Running {
                    started: Instant::now(),
                };
                let duration = state.duration;
                state.timer = Some(self.schedule_stop(run_id, duration));
                info!("Observe run released for {:?}", duration);
            }
        }
        outcome
    }

    /// Devices currently blocked at the start barrier.
    pub fn devices_at_barrier(&self) -> usize {
        self.inner
            .run
            .lock()
            .barrier
            .as_ref()
            .map(|b| b.waiting())
            .unwrap_or(0)
    }

    pub fn failed_devices(&self) -> usize {
        self.inner
            .run
            .lock()
            .devices
            .iter()
            .filter(|d| d.has_failed())
            .count()
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.inner.run.lock().phase, RunPhase::Idle)
    }

    /// Stop the active run and record its statistics.
    ///
    /// ## Returns
    /// The record of a timed run, or `None` if nothing was running or the
    /// run was still waiting at the barrier.
    pub fn stop(&self) -> Option<StatisticsRecord> {
        self.stop_run(None)
    }

    fn stop_run(&self, only_run: Option<u64>) -> Option<StatisticsRecord> {
        let mut state = self.inner.run.lock();
        match only_run {
            Some(run_id) if state.run_id != run_id => return None,
            Some(_) => {}
            // An explicit stop returns only once the run is fully down.
            None => {
                while matches!(state.phase, RunPhase::Stopping) {
                    self.inner.idle.wait(&mut state);
                }
            }
        }
        self.finish_run(&mut state)
    }

    fn finish_run(&self, state: &mut MutexGuard<'_, RunState>) -> Option<StatisticsRecord> {
        let elapsed = match std::mem::replace(&mut state.phase, RunPhase::Stopping) {
            RunPhase::Idle => {
                state.phase = RunPhase::Idle;
                return None;
            }
            RunPhase::Stopping => return None,
            RunPhase::Armed => None,
            RunPhase::Running { started } => Some(started.elapsed()),
        };

        if let Some(timer) = state.timer.take() {
            self.process.scheduler().cancel(timer);
        }
        for device in state.devices.iter() {
            device.stop();
        }
        if let Some(barrier) = state.barrier.take() {
            barrier.abort();
        }

        // A device may sit in a socket read for a full timeout before it
        // sees the stop flag.
        let mut devices = std::mem::take(&mut state.devices);
        MutexGuard::unlocked(state, || {
            for device in devices.iter_mut() {
                device.join();
            }
        });
        state.devices = devices;

        let record = elapsed.map(|elapsed| self.aggregate(&**state, elapsed));
        if record.is_none() {
            info!("Run aborted before it started, nothing recorded");
        }
        state.phase = RunPhase::Idle;
        self.inner.idle.notify_all();
        record
    }

    fn aggregate(&self, state: &RunState, elapsed: Duration) -> StatisticsRecord {
        let mut totals = RunTotals {
            uri: self
                .settings()
                .uri
                .map(|u| u.to_string())
                .unwrap_or_default(),
            concurrency: state.concurrency,
            elapsed_ms: elapsed.as_millis() as u64,
            ..Default::default()
        };
        let mut latencies = Vec::new();
        for device in state.devices.iter() {
            totals.completed += device.completed_count();
            totals.timeouts += device.timeout_count();
            totals.sent += device.sent_count();
            latencies.extend(device.take_latency_samples());
        }
        let failed = state.devices.iter().filter(|d| d.has_failed()).count();
        if failed > 0 {
            warn!("{} devices failed during the run", failed);
        }

        let record = StatisticsRecord::compute(totals, &mut latencies);
        if let Err(e) = self.process.sink().lock().record(record.clone()) {
            error!("Failed to write statistics: {:#}", e);
        }
        record
    }

    /// Block until no run is active or `timeout` passes.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.run.lock();
        while !matches!(state.phase, RunPhase::Idle) {
            if self.inner.idle.wait_until(&mut state, deadline).timed_out() {
                return matches!(state.phase, RunPhase::Idle);
            }
        }
        true
    }

    /// Run one timed client run per level, in order.
    pub fn run_concurrency_series(
        &self,
        levels: &[usize],
        duration: Duration,
    ) -> anyhow::Result<Vec<StatisticsRecord>> {
        let settings = self.settings();
        let first_record = self.process.sink().lock().records().len();
        info!("Run series: {:?}", levels);

        for (index, &level) in levels.iter().enumerate() {
            self.start(level, duration, DeviceKind::Client)
                .with_context(|| format!("Failed to start run with {} clients", level))?;

            let guard = if index + 1 == levels.len() {
                settings.tail_guard
            } else {
                settings.guard_band
            };
            thread::sleep(duration + guard);

            if !self.wait_idle(settings.timeouts.response) {
                warn!("Run with {} clients still active after guard band, stopping", level);
                self.stop();
            }
        }

        let sink = self.process.sink().lock();
        Ok(sink.records()[first_record..].to_vec())
    }

    /// Every statistics record of the process so far.
    pub fn records(&self) -> Vec<StatisticsRecord> {
        self.process.sink().lock().records().to_vec()
    }

    /// Write a free-form entry into the statistics log.
    pub fn log(&self, entry: &str) -> anyhow::Result<()> {
        self.process.sink().lock().log_entry(entry)
    }

    /// Switch the statistics log to a new file named after `name`.
    pub fn lognew(&self, name: &str) -> anyhow::Result<PathBuf> {
        self.process.sink().lock().start_log(name)
    }

    /// Stop any run and close every device.
    pub fn shutdown(&self) {
        self.stop();
        let mut state = self.inner.run.lock();
        while matches!(state.phase, RunPhase::Stopping) {
            self.inner.idle.wait(&mut state);
        }
        let closed = state.devices.len();
        for device in state.devices.iter_mut() {
            device.close();
        }
        state.devices.clear();
        state.pool.closed += closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::ProcessSettings;
    use std::net::UdpSocket;

    fn manager(dir: &std::path::Path) -> DeviceManager {
        let process = BenchmarkProcess::new(ProcessSettings {
            log_dir: dir.to_path_buf(),
            echo_statistics: false,
            ..Default::default()
        })
        .unwrap();
        DeviceManager::with_settings(
            process,
            ManagerSettings {
                timeouts: DeviceTimeouts {
                    response: Duration::from_millis(100),
                    ack: Duration::from_millis(100),
                    registration: Duration::from_millis(100),
                    registration_attempts: 2,
                    observe_request: Duration::from_millis(100),
                },
                guard_band: Duration::from_millis(100),
                tail_guard: Duration::from_millis(50),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_set_device_count_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.set_uri("coap://127.0.0.1:5683/test").unwrap();

        manager.set_device_count(5, DeviceKind::Client).unwrap();
        assert_eq!(manager.pool_stats(), PoolStats { created: 5, closed: 0 });
        manager.set_device_count(5, DeviceKind::Client).unwrap();
        assert_eq!(manager.pool_stats(), PoolStats { created: 5, closed: 0 });
        assert_eq!(manager.device_count(), 5);
    }

    #[test]
    fn test_reconcile_creates_and_closes_only_the_difference() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.set_uri("coap://127.0.0.1:5683/test").unwrap();

        manager.set_device_count(3, DeviceKind::Client).unwrap();
        manager.set_device_count(5, DeviceKind::Client).unwrap();
        assert_eq!(manager.pool_stats(), PoolStats { created: 5, closed: 0 });
        manager.set_device_count(2, DeviceKind::Client).unwrap();
        assert_eq!(manager.pool_stats(), PoolStats { created: 5, closed: 3 });
        manager.set_device_count(2, DeviceKind::Server).unwrap();
        assert_eq!(manager.pool_stats(), PoolStats { created: 7, closed: 5 });
    }

    #[test]
    fn test_requires_target() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert!(matches!(
            manager.set_device_count(1, DeviceKind::Client),
            Err(BenchError::NoTarget)
        ));
    }

    #[test]
    fn test_bind_address_family_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.set_uri("coap://127.0.0.1:5683/test").unwrap();
        assert!(manager.set_bind_address(Some("::1".parse().unwrap())).is_err());
        assert!(manager.set_bind_address(Some("127.0.0.1".parse().unwrap())).is_ok());
    }

    #[test]
    fn test_stop_twice_records_once() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        manager
            .set_uri(&format!("coap://{}/test", silent.local_addr().unwrap()))
            .unwrap();

        manager
            .start(2, Duration::from_secs(60), DeviceKind::Client)
            .unwrap();
        assert!(matches!(
            manager.start(2, Duration::from_secs(60), DeviceKind::Client),
            Err(BenchError::RunActive)
        ));
        thread::sleep(Duration::from_millis(150));

        assert!(manager.stop().is_some());
        assert!(manager.stop().is_none());
        assert!(!manager.is_running());
        assert_eq!(manager.process.sink().lock().records().len(), 1);
    }

    #[test]
    fn test_timer_stops_client_run() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        manager
            .set_uri(&format!("coap://{}/test", silent.local_addr().unwrap()))
            .unwrap();

        manager
            .start(1, Duration::from_millis(200), DeviceKind::Client)
            .unwrap();
        assert!(manager.wait_idle(Duration::from_secs(5)));

        let sink = manager.process.sink().lock();
        let record = &sink.records()[0];
        assert_eq!(record.concurrency, 1);
        assert_eq!(record.completed, 0);
        assert_eq!(record.sent, record.timeouts);
    }

    #[test]
    fn test_stop_joins_devices_without_holding_the_run_lock() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.update_settings(|s| s.timeouts.response = Duration::from_millis(600));
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        manager
            .set_uri(&format!("coap://{}/test", silent.local_addr().unwrap()))
            .unwrap();

        manager.start(2, Duration::from_secs(10), DeviceKind::Client).unwrap();
        thread::sleep(Duration::from_millis(50));

        let stopper = {
            let manager = manager.clone();
            thread::spawn(move || manager.stop())
        };
        thread::sleep(Duration::from_millis(50));

        // The clients are still blocked in their reads, yet the run state
        // can be inspected.
        let query_started = Instant::now();
        assert!(manager.is_running());
        assert!(manager.start(1, Duration::from_secs(1), DeviceKind::Client).is_err());
        assert!(query_started.elapsed() < Duration::from_millis(200));

        // A second stop waits for the first one and records nothing.
        assert!(manager.stop().is_none());
        assert!(!manager.is_running());
        let record = stopper.join().unwrap().expect("record of the stopped run");
        assert_eq!(record.concurrency, 2);
        assert_eq!(manager.records().len(), 1);
        assert_eq!(manager.device_count(), 2);
    }

    #[test]
    fn test_aborting_armed_observe_run_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        manager
            .set_uri(&format!("coap://{}/announce", silent.local_addr().unwrap()))
            .unwrap();

        manager
            .start(2, Duration::from_secs(1), DeviceKind::Server)
            .unwrap();
        assert!(manager.is_running());
        assert_eq!(manager.devices_at_barrier(), 0);

        assert!(manager.stop().is_none());
        assert!(!manager.is_running());
        assert_eq!(manager.join_barrier(), BarrierOutcome::Aborted);
        assert!(manager.process.sink().lock().records().is_empty());
    }
}
