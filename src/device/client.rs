//! Closed-loop request/response client.
//!
//! Each loop iteration sends the template with the next message ID and
//! blocks for the matching response. A response with a different message
//! ID or an unexpected code is ignored and the read resumes with whatever
//! time is left; when the time runs out the exchange counts as a timeout.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{open_udp_socket, DeviceKind, DeviceSettings, DeviceState, VirtualDevice, DATAGRAM_SIZE};
use crate::barrier::StartBarrier;
use crate::coap::{self, Frame};
use crate::error::{BenchError, Result};

pub struct VirtualClient {
    id: usize,
    socket: Option<Arc<UdpSocket>>,
    settings: Option<Arc<DeviceSettings>>,
    frame: Option<Frame>,
    state: Arc<DeviceState>,
    handle: Option<JoinHandle<Frame>>,
}

impl VirtualClient {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            socket: None,
            settings: None,
            frame: None,
            state: Arc::new(DeviceState::default()),
            handle: None,
        }
    }
}

impl VirtualDevice for VirtualClient {
    fn id(&self) -> usize {
        self.id
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Client
    }

    fn bind(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        let socket = open_udp_socket(addr).map_err(|e| BenchError::socket("binding client socket", e))?;
        let local = socket
            .local_addr()
            .map_err(|e| BenchError::socket("reading client address", e))?;
        self.socket = Some(Arc::new(socket));
        Ok(local)
    }

    fn set_target(&mut self, settings: Arc<DeviceSettings>) -> Result<()> {
        if let Some(current) = &self.settings {
            if Arc::ptr_eq(current, &settings) && self.frame.is_some() {
                return Ok(());
            }
        }

        let socket = self.socket.as_ref().ok_or_else(|| {
            BenchError::socket("setting target", io::Error::new(io::ErrorKind::NotConnected, "socket not bound"))
        })?;
        socket
            .connect(settings.target_addr)
            .map_err(|e| BenchError::socket("connecting client socket", e))?;
        socket
            .set_read_timeout(Some(settings.timeouts.response))
            .map_err(|e| BenchError::socket("configuring client socket", e))?;

        let mut frame = Frame::request_template(
            settings.method,
            &settings.target,
            settings.payload.as_deref(),
            settings.confirmable,
        )?;
        // Random first MID so restarted clients do not replay old exchanges.
        frame.set_message_id(rand::random());
        self.frame = Some(frame);
        self.settings = Some(settings);
        Ok(())
    }

    fn start(&mut self, _barrier: Option<Arc<StartBarrier>>) -> Result<()> {
        if self.handle.is_some() {
            return Err(BenchError::RunActive);
        }
        let socket = self.socket.clone().ok_or_else(|| {
            BenchError::socket("starting client", io::Error::new(io::ErrorKind::NotConnected, "socket not bound"))
        })?;
        let settings = self.settings.clone().ok_or(BenchError::NoTarget)?;
        let frame = self.frame.take().ok_or(BenchError::NoTarget)?;
        let state = Arc::clone(&self.state);
        let id = self.id;

        state.set_running(true);
        let handle = thread::Builder::new()
            .name(format!("coapbench-client-{}", id))
            .spawn(move || run_client(id, socket, settings, frame, state))
            .map_err(|e| BenchError::socket("spawning client thread", e))?;
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.state.set_running(false);
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(frame) => self.frame = Some(frame),
                Err(_) => {
                    warn!("Client {} thread panicked", self.id);
                    self.state.fail();
                }
            }
        }
    }

    fn reset(&self) {
        self.state.counters.reset();
    }

    fn sent_count(&self) -> u64 {
        self.state.counters.sent()
    }

    fn completed_count(&self) -> u64 {
        self.state.counters.completed()
    }

    fn timeout_count(&self) -> u64 {
        self.state.counters.timeouts()
    }

    fn take_latency_samples(&self) -> Vec<u32> {
        self.state.counters.take_latencies()
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }

    fn has_failed(&self) -> bool {
        self.state.has_failed()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn close(&mut self) {
        self.stop();
        self.join();
        self.socket = None;
    }
}

fn run_client(
    id: usize,
    socket: Arc<UdpSocket>,
    settings: Arc<DeviceSettings>,
    mut frame: Frame,
    state: Arc<DeviceState>,
) -> Frame {
    let mut buf = vec![0u8; DATAGRAM_SIZE];
    let timeout = settings.timeouts.response;

    while state.is_running() {
        let sent_at = Instant::now();
        let sent = socket.send(frame.next_mid());
        let mid = frame.message_id();
        state.counters.record_sent();

        match sent {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                state.counters.record_timeout();
                thread_sleep_remaining(Instant::now() + timeout);
                continue;
            }
            Err(e) => {
                warn!("Client {} failed to send: {}", id, e);
                state.counters.record_timeout();
                state.fail();
                break;
            }
        }

        match await_response(&socket, &mut buf, mid, &settings, timeout) {
            Ok(()) => {
                let latency = settings.track_latency.then(|| sent_at.elapsed());
                state.counters.record_completed(latency);
            }
            Err(BenchError::Timeout(_)) => {
                debug!("Client {} timed out waiting for MID {}", id, mid);
                state.counters.record_timeout();
            }
            Err(e) => {
                warn!("Client {} stopped: {}", id, e);
                state.counters.record_timeout();
                state.fail();
                break;
            }
        }
    }

    if settings.verbose {
        info!(
            "Client {} finished: sent={} completed={} timeouts={}",
            id,
            state.counters.sent(),
            state.counters.completed(),
            state.counters.timeouts()
        );
    }
    frame
}

/// Wait for a valid response to `expected_mid`.
fn await_response(
    socket: &UdpSocket,
    buf: &mut [u8],
    expected_mid: u16,
    settings: &DeviceSettings,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut shortened = false;

    let outcome = loop {
        let n = match socket.recv(buf) {
            Ok(n) => n,
            Err(e) if coap::is_timeout(&e) => break Err(BenchError::Timeout("response")),
            // An ICMP port unreachable from a previous send surfaces here;
            // the server may come up later, so treat it like a lost reply.
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                thread_sleep_remaining(deadline);
                break Err(BenchError::Timeout("response"));
            }
            Err(e) => break Err(BenchError::socket("receiving response", e)),
        };

        match validate(&buf[..n], expected_mid, settings) {
            Ok(()) => break Ok(()),
            Err(e) => debug!("Ignoring datagram: {}", e),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break Err(BenchError::Timeout("response"));
        }
        if let Err(e) = socket.set_read_timeout(Some(remaining)) {
            break Err(BenchError::socket("configuring client socket", e));
        }
        shortened = true;
    };

    if shortened {
        socket
            .set_read_timeout(Some(timeout))
            .map_err(|e| BenchError::socket("configuring client socket", e))?;
    }
    outcome
}

fn thread_sleep_remaining(deadline: Instant) {
    let remaining = deadline.saturating_duration_since(Instant::now());
    // Cap so a stop request is noticed quickly.
    thread::sleep(remaining.min(Duration::from_millis(100)));
}

fn validate(reply: &[u8], expected_mid: u16, settings: &DeviceSettings) -> Result<()> {
    if !coap::is_coap_v1(reply) {
        return Err(BenchError::MalformedResponse {
            reason: format!("not a CoAP message ({} bytes)", reply.len()),
        });
    }
    let mid = coap::message_id(reply).unwrap_or_default();
    if settings.check_mid && mid != expected_mid {
        return Err(BenchError::MalformedResponse {
            reason: format!("expected MID {} but got {}", expected_mid, mid),
        });
    }
    let code = coap::code(reply).unwrap_or_default();
    if !settings.method.accepts(code) {
        return Err(BenchError::MalformedResponse {
            reason: format!("unexpected response code {}.{:02}", code >> 5, code & 0x1F),
        });
    }
    Ok(())
}
