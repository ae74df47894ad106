//! # CoAP Benchmark Library
//!
//! A load generator and distributed benchmark engine for CoAP servers.
//! Many simulated devices drive a target over UDP while the library
//! measures throughput, timeouts and latency percentiles.
//!
//! ## Benchmark Kinds
//!
//! - **Client runs**: closed-loop request/response clients, one outstanding
//!   request per device, run for a fixed duration per concurrency level.
//! - **Observe runs**: the inverse benchmark. Virtual servers register with
//!   a real observer, wait to be observed and then push notifications. All
//!   servers start pushing at the same instant through a start barrier.
//! - **Stress load**: an open-loop generator that keeps sending without
//!   waiting for replies.
//!
//! ## Architecture Overview
//!
//! - `coap`: frame templates mutated in place, URI handling, byte helpers
//! - `device`: the virtual client and server devices
//! - `manager`: the device pool and the lifecycle of timed runs
//! - `metrics` / `results`: statistics computation, logs and JSON export
//! - `benchmark`: the process context with the shared scheduler and sink
//! - `control`: the controller/agent protocol for distributed runs
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use coapbench::{BenchmarkProcess, DeviceManager, ProcessSettings};
//! use std::time::Duration;
//!
//! fn main() -> anyhow::Result<()> {
//!     let process = BenchmarkProcess::new(ProcessSettings::default())?;
//!     let manager = DeviceManager::new(process);
//!     manager.set_uri("coap://127.0.0.1/test")?;
//!     manager.set_track_latency(true);
//!
//!     let records = manager.run_concurrency_series(&[1, 10, 100], Duration::from_secs(10))?;
//!     for record in records {
//!         println!("{:.0} requests/s with {} clients", record.throughput, record.concurrency);
//!     }
//!     Ok(())
//! }
//! ```

/// Start barrier with a cooperative abort
pub mod barrier;

/// Process context: session identity, statistics sink and timer scheduler
pub mod benchmark;

/// Command-line interface and configuration
///
/// Argument parsing with clap, validation, and conversion of the options
/// into manager and process settings.
pub mod cli;

/// CoAP frames, URIs and raw byte accessors
pub mod coap;

/// Distributed control: command grammar, controller and agent
pub mod control;

/// Simulated CoAP devices
///
/// Each device owns a UDP socket and runs on its own thread. Clients send
/// requests and count responses; servers push observe notifications.
pub mod device;

pub mod error;

pub mod logging;

/// Device pool and timed benchmark runs
pub mod manager;

/// Statistics computation and log line formatting
pub mod metrics;

/// Statistics log files and JSON export
pub mod results;

pub mod stress;

pub mod utils;

pub use barrier::{BarrierOutcome, StartBarrier};
pub use benchmark::{BenchmarkProcess, ProcessSettings, Scheduler};
pub use cli::Args;
pub use coap::{Frame, Method, TargetUri};
pub use control::{Agent, Command, Controller};
pub use device::{DeviceKind, VirtualDevice};
pub use error::{BenchError, FrameError};
pub use manager::{DeviceManager, ManagerSettings};
pub use metrics::StatisticsRecord;
pub use results::{ResultsManager, SessionReport, StatisticsSink};

/// The current version of coapbench, reported in the JSON export.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Clients per run when `-c` is not given.
    pub const DEFAULT_CLIENTS: usize = 1;

    /// Virtual servers per observe run when `-s` is not given.
    pub const DEFAULT_SERVERS: usize = 1;

    /// Seconds per run.
    pub const DEFAULT_TIME_SECS: u64 = 30;

    pub const DEFAULT_METHOD: &str = "GET";

    /// Controller host an agent connects to.
    pub const MASTER_ADDRESS: &str = "localhost";

    /// TCP port of the control protocol.
    pub const MASTER_PORT: u16 = 58888;

    /// Default CoAP port for URIs without one.
    pub const COAP_PORT: u16 = 5683;

    /// Wait for a response to one client request. Timeouts are counted,
    /// never fatal.
    pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Wait for the ack of one confirmable notification.
    pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);

    /// Wait per registration or deregistration attempt of a virtual server.
    pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(1);

    pub const REGISTRATION_ATTEMPTS: u32 = 10;

    /// Read timeout of a server waiting to be observed; it rechecks its
    /// stop flag after each one.
    pub const OBSERVE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Pause between two runs of a series so in-flight traffic of one level
    /// does not leak into the next.
    pub const SERIES_GUARD_BAND: Duration = Duration::from_secs(5);

    /// Pause after the last run of a series.
    pub const SERIES_TAIL_GUARD: Duration = Duration::from_secs(1);

    /// Wait for an agent's ping reply.
    pub const PING_TIMEOUT: Duration = Duration::from_secs(2);

    /// Delay between an agent's connection attempts.
    pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

    /// How often an agent checks whether all servers reached the barrier,
    /// and how many times before it gives up.
    pub const BARRIER_POLL_INTERVAL: Duration = Duration::from_millis(250);
    pub const BARRIER_POLL_ATTEMPTS: u32 = 80;

    /// Base name of the statistics log.
    pub const LOG_NAME: &str = "coapbench";

    /// Outstanding requests that pause the stress sender.
    pub const STRESS_OCCUPATION: u64 = 20_000;
}
