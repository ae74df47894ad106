//! # Virtual Devices
//!
//! A virtual device is one simulated CoAP actor with its own UDP socket and
//! its own OS thread. Two variants share the [`VirtualDevice`] capability
//! set:
//!
//! - [`VirtualClient`]: closed-loop request/response load. One outstanding
//!   request at a time; latency and timeouts are counted per exchange.
//! - [`VirtualServer`]: the inverse observe benchmark. The device registers
//!   itself with the target, waits to be observed, then pushes
//!   notifications until stopped.
//!
//! ## Threading Model
//!
//! The device object stays with the [`crate::manager::DeviceManager`]; only
//! the socket, the shared [`DeviceState`] and (for clients) the frame move
//! into the worker thread. Stopping is cooperative: the worker checks the
//! running flag at the top of its loop and after every timeout, so a stop
//! takes effect within one socket timeout.

pub mod client;
pub mod server;

pub use client::VirtualClient;
pub use server::VirtualServer;

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::barrier::StartBarrier;
use crate::coap::{Method, TargetUri};
use crate::error::Result;

/// Socket buffer size requested for every device socket.
pub const SOCKET_BUFFER_SIZE: usize = 1 << 20;

/// Receive buffer for a single datagram.
pub const DATAGRAM_SIZE: usize = 2048;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Client,
    Server,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Client => write!(f, "client"),
            DeviceKind::Server => write!(f, "server"),
        }
    }
}

/// Socket waits used by the devices.
#[derive(Clone, Copy, Debug)]
pub struct DeviceTimeouts {
    /// Wait for a response to a client request.
    pub response: Duration,
    /// Wait for the ack of a confirmable notification.
    pub ack: Duration,
    /// Wait per registration or deregistration attempt.
    pub registration: Duration,
    pub registration_attempts: u32,
    /// Read timeout while waiting for the observe request.
    pub observe_request: Duration,
}

impl Default for DeviceTimeouts {
    fn default() -> Self {
        use crate::defaults;
        Self {
            response: defaults::RESPONSE_TIMEOUT,
            ack: defaults::ACK_TIMEOUT,
            registration: defaults::REGISTRATION_TIMEOUT,
            registration_attempts: defaults::REGISTRATION_ATTEMPTS,
            observe_request: defaults::OBSERVE_REQUEST_TIMEOUT,
        }
    }
}

/// Everything a device needs to know about its target, resolved once per
/// configuration change and shared by all devices of a manager.
#[derive(Clone, Debug)]
pub struct DeviceSettings {
    pub target: TargetUri,
    pub target_addr: SocketAddr,
    pub bind: Option<IpAddr>,
    pub method: Method,
    pub payload: Option<Vec<u8>>,
    pub confirmable: bool,
    pub track_latency: bool,
    pub check_mid: bool,
    pub timeouts: DeviceTimeouts,
    pub verbose: bool,
}

impl DeviceSettings {
    /// Local address new sockets bind to: the configured address or the
    /// wildcard of the target's family, always on an ephemeral port.
    pub fn bind_addr(&self) -> SocketAddr {
        let ip = self
            .bind
            .unwrap_or_else(|| crate::coap::unspecified_for(self.target_addr));
        SocketAddr::new(ip, 0)
    }
}

/// Per-run counters of one device.
#[derive(Debug, Default)]
pub struct DeviceCounters {
    sent: AtomicU64,
    completed: AtomicU64,
    timeouts: AtomicU64,
    latencies: Mutex<Vec<u32>>,
}

impl DeviceCounters {
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, latency: Option<Duration>) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = latency {
            let ms = latency.as_millis().min(u32::MAX as u128) as u32;
            self.latencies.lock().push(ms);
        }
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn take_latencies(&self) -> Vec<u32> {
        std::mem::take(&mut *self.latencies.lock())
    }

    pub fn reset(&self) {
        self.sent.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.latencies.lock().clear();
    }
}

/// State shared between a device and its worker thread.
#[derive(Debug, Default)]
pub struct DeviceState {
    running: AtomicBool,
    failed: AtomicBool,
    registered: AtomicBool,
    pub counters: DeviceCounters,
}

impl DeviceState {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Mark the device unusable and stop its loop.
    pub fn fail(&self) {
        self.failed.store(true, Ordering::Release);
        self.set_running(false);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::Release);
    }
}

/// Capability set shared by the client and server variants.
pub trait VirtualDevice: Send {
    fn id(&self) -> usize;

    fn kind(&self) -> DeviceKind;

    /// Open the device socket on `addr` (port 0 picks an ephemeral port).
    fn bind(&mut self, addr: SocketAddr) -> Result<SocketAddr>;

    /// Point the device at a target; rebuilds templates only when the
    /// settings actually changed.
    fn set_target(&mut self, settings: Arc<DeviceSettings>) -> Result<()>;

    /// Launch the worker thread. Servers wait at `barrier` before pushing.
    fn start(&mut self, barrier: Option<Arc<StartBarrier>>) -> Result<()>;

    /// Ask the worker to stop; returns immediately.
    fn stop(&self);

    /// Wait for the worker thread to finish its current exchange and exit.
    fn join(&mut self);

    /// Clear the counters for a new run.
    fn reset(&self);

    fn sent_count(&self) -> u64;

    fn completed_count(&self) -> u64;

    fn timeout_count(&self) -> u64;

    /// Drain the latency samples (milliseconds) of the last run.
    fn take_latency_samples(&self) -> Vec<u32>;

    fn is_running(&self) -> bool;

    fn has_failed(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Stop, join and release the socket.
    fn close(&mut self);
}

/// Creates devices of the requested kind.
pub struct DeviceFactory;

impl DeviceFactory {
    pub fn create(kind: DeviceKind, id: usize) -> Box<dyn VirtualDevice> {
        match kind {
            DeviceKind::Client => Box::new(VirtualClient::new(id)),
            DeviceKind::Server => Box::new(VirtualServer::new(id)),
        }
    }
}

/// Open a UDP socket with enlarged kernel buffers.
pub(crate) fn open_udp_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    // Buffer sizes are hints; the kernel may clamp them.
    let _ = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE);
    let _ = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE);
    socket.bind(&addr.into())?;
    Ok(socket.into())
}
