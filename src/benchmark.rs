//! # Benchmark Process Context
//!
//! Process-wide state lives in one [`BenchmarkProcess`] value that is built
//! once in `main` and shared as an `Arc`. Nothing in the crate uses global
//! mutable statics; components that need the shared pieces get them from
//! here.
//!
//! ## Key Components
//!
//! - **Session identity**: a UUID and the start timestamp, used in the JSON
//!   report and in log messages.
//! - **Statistics sink**: the single writer of statistics log lines.
//! - **Scheduler**: one timer thread shared by every device manager in the
//!   process. Duration timers of benchmark runs are jobs on this scheduler.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::results::{SessionReport, StatisticsSink};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle of a scheduled job, used to cancel it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

enum SchedulerMessage {
    Schedule {
        id: u64,
        deadline: Instant,
        job: Job,
    },
    Cancel(u64),
    Shutdown,
}

/// A single thread running delayed jobs in deadline order.
pub struct Scheduler {
    sender: Sender<SchedulerMessage>,
    next_id: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Result<Self> {
        let (sender, receiver) = channel::unbounded();
        thread::Builder::new()
            .name("coapbench-scheduler".to_string())
            .spawn(move || Self::run(receiver))
            .context("Failed to spawn scheduler thread")?;
        Ok(Self {
            sender,
            next_id: AtomicU64::new(1),
        })
    }

    /// Run `job` on the scheduler thread after `delay`.
    pub fn schedule(&self, delay: Duration, job: impl FnOnce() + Send + 'static) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = SchedulerMessage::Schedule {
            id,
            deadline: Instant::now() + delay,
            job: Box::new(job),
        };
        if self.sender.send(message).is_err() {
            debug!("Scheduler is shut down, dropping timer {}", id);
        }
        TimerId(id)
    }

    /// Cancel a pending job. Cancelling a job that already ran is a no-op.
    pub fn cancel(&self, timer: TimerId) {
        let _ = self.sender.send(SchedulerMessage::Cancel(timer.0));
    }

    fn run(receiver: Receiver<SchedulerMessage>) {
        let mut pending: BTreeMap<(Instant, u64), Job> = BTreeMap::new();
        let mut deadlines: HashMap<u64, Instant> = HashMap::new();

        loop {
            let message = match pending.keys().next().copied() {
                Some((deadline, id)) => {
                    let now = Instant::now();
                    if deadline <= now {
                        deadlines.remove(&id);
                        if let Some(job) = pending.remove(&(deadline, id)) {
                            job();
                        }
                        continue;
                    }
                    receiver.recv_timeout(deadline - now)
                }
                None => receiver
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };

            match message {
                Ok(SchedulerMessage::Schedule { id, deadline, job }) => {
                    deadlines.insert(id, deadline);
                    pending.insert((deadline, id), job);
                }
                Ok(SchedulerMessage::Cancel(id)) => {
                    if let Some(deadline) = deadlines.remove(&id) {
                        pending.remove(&(deadline, id));
                    }
                }
                Ok(SchedulerMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        debug!("Scheduler stopped with {} pending jobs", pending.len());
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.sender.send(SchedulerMessage::Shutdown);
    }
}

/// Settings that apply to the whole process.
#[derive(Clone, Debug)]
pub struct ProcessSettings {
    /// Directory that receives statistics logs.
    pub log_dir: PathBuf,
    /// Base name of the statistics log.
    pub log_name: String,
    pub verbose: bool,
    /// Print statistics lines to stdout as well as the log.
    pub echo_statistics: bool,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("."),
            log_name: crate::defaults::LOG_NAME.to_string(),
            verbose: false,
            echo_statistics: true,
        }
    }
}

/// Shared, process-scoped state.
pub struct BenchmarkProcess {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    settings: ProcessSettings,
    sink: Mutex<StatisticsSink>,
    scheduler: Scheduler,
}

impl BenchmarkProcess {
    pub fn new(settings: ProcessSettings) -> Result<Arc<Self>> {
        let mut sink = StatisticsSink::new(&settings.log_dir, &settings.log_name);
        sink.set_echo(settings.echo_statistics);
        let process = Self {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            sink: Mutex::new(sink),
            scheduler: Scheduler::new()?,
            settings,
        };
        info!("Benchmark session {}", process.session_id);
        Ok(Arc::new(process))
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn verbose(&self) -> bool {
        self.settings.verbose
    }

    pub fn settings(&self) -> &ProcessSettings {
        &self.settings
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn sink(&self) -> &Mutex<StatisticsSink> {
        &self.sink
    }

    /// Snapshot every record produced so far as a JSON-ready report.
    pub fn report(&self, target: Option<String>) -> SessionReport {
        SessionReport {
            session_id: self.session_id,
            version: crate::VERSION.to_string(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            target,
            cpu_cores: num_cpus::get(),
            records: self.sink.lock().records().to_vec(),
        }
    }
}
