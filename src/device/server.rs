//! Virtual server for the inverse observe benchmark.
//!
//! Lifecycle of one run:
//!
//! 1. POST `coap://<address>:<port>/benchmark` to the target so the real
//!    observer learns about this device (retried on timeout).
//! 2. Wait for the observer's GET with an Observe registration and capture
//!    its token and address.
//! 3. Wait at the start barrier.
//! 4. Push notifications until stopped: confirmable notifications wait for
//!    their ack, non-confirmable ones are sent back to back.
//! 5. Deregister with a 4.04 frame carrying the observer's token.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{open_udp_socket, DeviceKind, DeviceSettings, DeviceState, VirtualDevice, DATAGRAM_SIZE};
use crate::barrier::{BarrierOutcome, StartBarrier};
use crate::coap::{self, Frame, Method, CODE_GET, OPTION_OBSERVE, TYPE_ACK, TYPE_RST};
use crate::error::{BenchError, FrameError, Result};

pub struct VirtualServer {
    id: usize,
    socket: Option<Arc<UdpSocket>>,
    settings: Option<Arc<DeviceSettings>>,
    state: Arc<DeviceState>,
    handle: Option<JoinHandle<()>>,
}

impl VirtualServer {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            socket: None,
            settings: None,
            state: Arc::new(DeviceState::default()),
            handle: None,
        }
    }

    /// Whether the device has been observed in the current run.
    pub fn is_registered(&self) -> bool {
        self.state.is_registered()
    }
}

impl VirtualDevice for VirtualServer {
    fn id(&self) -> usize {
        self.id
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Server
    }

    fn bind(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        let socket = open_udp_socket(addr).map_err(|e| BenchError::socket("binding server socket", e))?;
        let local = socket
            .local_addr()
            .map_err(|e| BenchError::socket("reading server address", e))?;
        self.socket = Some(Arc::new(socket));
        Ok(local)
    }

    fn set_target(&mut self, settings: Arc<DeviceSettings>) -> Result<()> {
        self.settings = Some(settings);
        Ok(())
    }

    fn start(&mut self, barrier: Option<Arc<StartBarrier>>) -> Result<()> {
        if self.handle.is_some() {
            return Err(BenchError::RunActive);
        }
        let socket = self.socket.clone().ok_or_else(|| {
            BenchError::socket("starting server", io::Error::new(io::ErrorKind::NotConnected, "socket not bound"))
        })?;
        let settings = self.settings.clone().ok_or(BenchError::NoTarget)?;
        let context = ServerContext {
            id: self.id,
            socket,
            settings,
            state: Arc::clone(&self.state),
        };

        self.state.set_registered(false);
        self.state.set_running(true);
        let handle = thread::Builder::new()
            .name(format!("coapbench-server-{}", self.id))
            .spawn(move || run_server(context, barrier))
            .map_err(|e| BenchError::socket("spawning server thread", e))?;
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.state.set_running(false);
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Server {} thread panicked", self.id);
                self.state.fail();
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

struct ServerContext {
    id: usize,
    socket: Arc<UdpSocket>,
    settings: Arc<DeviceSettings>,
    state: Arc<DeviceState>,
}

impl ServerContext {
    fn running(&self) -> bool {
        self.state.is_running()
    }

    fn set_read_timeout(&self, timeout: Duration) -> Result<()> {
        self.socket
            .set_read_timeout(Some(timeout))
            .map_err(|e| BenchError::socket("configuring server socket", e))
    }
}

/// The observer's side of an observe relationship.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    pub peer: SocketAddr,
    pub token: Vec<u8>,
    pub message_id: u16,
}

enum Registration {
    Acknowledged,
    /// The observe request overtook the POST response.
    Observed(Observation),
    Stopped,
}

enum Ack {
    Acked,
    Reset,
}

fn run_server(context: ServerContext, barrier: Option<Arc<StartBarrier>>) {
    match serve(&context, barrier.as_deref()) {
        Ok(()) => {}
        Err(BenchError::BarrierAborted) => debug!("Server {} released by abort", context.id),
        Err(e) => {
            warn!("Server {} failed: {}", context.id, e);
            context.state.fail();
        }
    }

    if context.settings.verbose {
        info!(
            "Server {} finished: sent={} completed={} timeouts={}",
            context.id,
            context.state.counters.sent(),
            context.state.counters.completed(),
            context.state.counters.timeouts()
        );
    }
    context.state.set_registered(false);
    context.state.set_running(false);
}

fn serve(ctx: &ServerContext, barrier: Option<&StartBarrier>) -> Result<()> {
    let mut buf = vec![0u8; DATAGRAM_SIZE];

    let observation = match register(ctx, &mut buf)? {
        Registration::Stopped => return Ok(()),
        Registration::Observed(observation) => observation,
        Registration::Acknowledged => match await_observe(ctx, &mut buf)? {
            Some(observation) => observation,
            None => return Ok(()),
        },
    };
    debug!("Server {} observed by {}", ctx.id, observation.peer);
    ctx.state.set_registered(true);

    let mut frame = Frame::notification_template(&observation.token, 0, ctx.settings.confirmable)?;
    // Notifications continue the observe request's MID sequence: the first
    // one carries the request's MID + 1.
    frame.set_message_id(observation.message_id);

    if let Some(barrier) = barrier {
        if barrier.wait() == BarrierOutcome::Aborted {
            deregister(ctx, &mut frame, &observation, &mut buf, 1)?;
            return Err(BenchError::BarrierAborted);
        }
    }

    push(ctx, &mut frame, &observation, &mut buf)?;
    deregister(
        ctx,
        &mut frame,
        &observation,
        &mut buf,
        ctx.settings.timeouts.registration_attempts,
    )
}

/// Address announced to the target in the registration payload.
fn advertised_ip(settings: &DeviceSettings) -> IpAddr {
    match settings.bind {
        Some(ip) if !ip.is_unspecified() => ip,
        _ if settings.target_addr.is_ipv6() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

fn register(ctx: &ServerContext, buf: &mut [u8]) -> Result<Registration> {
    let local = ctx
        .socket
        .local_addr()
        .map_err(|e| BenchError::socket("reading server address", e))?;
    let announced = SocketAddr::new(advertised_ip(&ctx.settings), local.port());
    let payload = format!("coap://{}/benchmark", announced);

    let mut frame = Frame::request_template(
        Method::Post,
        &ctx.settings.target,
        Some(payload.as_bytes()),
        true,
    )?;
    let timeout = ctx.settings.timeouts.registration;
    ctx.set_read_timeout(timeout)?;

    for attempt in 1..=ctx.settings.timeouts.registration_attempts {
        if !ctx.running() {
            return Ok(Registration::Stopped);
        }
        ctx.socket
            .send_to(frame.next_mid(), ctx.settings.target_addr)
            .map_err(|e| BenchError::socket("sending registration", e))?;
        let mid = frame.message_id();
        let deadline = Instant::now() + timeout;

        loop {
            match ctx.socket.recv_from(buf) {
                Ok((n, from)) => {
                    let datagram = &buf[..n];
                    if let Some(observation) = parse_observe_request(datagram, from) {
                        return Ok(Registration::Observed(observation));
                    }
                    if coap::message_id(datagram) == Some(mid) {
                        return Ok(Registration::Acknowledged);
                    }
                    if Instant::now() >= deadline {
                        break;
                    }
                }
                Err(e) if coap::is_timeout(&e) => break,
                Err(e) => return Err(BenchError::socket("receiving registration response", e)),
            }
        }
        debug!("Server {} registration attempt {} timed out", ctx.id, attempt);
    }
    Err(BenchError::Timeout("registration response"))
}

fn await_observe(ctx: &ServerContext, buf: &mut [u8]) -> Result<Option<Observation>> {
    ctx.set_read_timeout(ctx.settings.timeouts.observe_request)?;
    while ctx.running() {
        match ctx.socket.recv_from(buf) {
            Ok((n, from)) => {
                if let Some(observation) = parse_observe_request(&buf[..n], from) {
                    return Ok(Some(observation));
                }
                debug!("Server {} ignoring datagram while waiting to be observed", ctx.id);
            }
            Err(e) if coap::is_timeout(&e) => {
                debug!("Server {} still waiting for an observe request", ctx.id);
            }
            Err(e) => return Err(BenchError::socket("receiving observe request", e)),
        }
    }
    Ok(None)
}

/// Recognize a GET carrying an Observe registration (value 0).
pub fn parse_observe_request(datagram: &[u8], from: SocketAddr) -> Option<Observation> {
    if !coap::is_coap_v1(datagram) || coap::code(datagram)? != CODE_GET {
        return None;
    }
    let (_, value_offset, len) = coap::find_option(datagram, OPTION_OBSERVE)?;
    let value = datagram.get(value_offset..value_offset + len)?;
    if coap::decode_uint(value) != 0 {
        return None;
    }
    Some(Observation {
        peer: from,
        token: coap::token(datagram)?.to_vec(),
        message_id: coap::message_id(datagram)?,
    })
}

fn push(ctx: &ServerContext, frame: &mut Frame, observation: &Observation, buf: &mut [u8]) -> Result<()> {
    let confirmable = ctx.settings.confirmable;
    ctx.set_read_timeout(ctx.settings.timeouts.ack)?;

    while ctx.running() {
        let sent_at = Instant::now();
        let sent = match frame.next_notification() {
            Ok(bytes) => ctx.socket.send_to(bytes, observation.peer),
            Err(FrameError::ObserveExhausted) => {
                info!("Server {} exhausted its observe sequence numbers", ctx.id);
                break;
            }
            Err(e) => return Err(e.into()),
        };
        ctx.state.counters.record_sent();
        if let Err(e) = sent {
            ctx.state.counters.record_timeout();
            return Err(BenchError::socket("sending notification", e));
        }

        if !confirmable {
            ctx.state.counters.record_completed(None);
            continue;
        }

        match await_ack(ctx, observation.peer, frame.message_id(), buf) {
            Ok(Ack::Acked) => {
                let latency = ctx.settings.track_latency.then(|| sent_at.elapsed());
                ctx.state.counters.record_completed(latency);
            }
            Ok(Ack::Reset) => {
                info!("Server {} notification rejected by observer, ending push", ctx.id);
                ctx.state.counters.record_timeout();
                break;
            }
            Err(BenchError::Timeout(_)) => ctx.state.counters.record_timeout(),
            Err(e) => {
                ctx.state.counters.record_timeout();
                return Err(e);
            }
        }
    }
    Ok(())
}

fn await_ack(ctx: &ServerContext, peer: SocketAddr, mid: u16, buf: &mut [u8]) -> Result<Ack> {
    let deadline = Instant::now() + ctx.settings.timeouts.ack;
    loop {
        match ctx.socket.recv_from(buf) {
            Ok((n, from)) => {
                let datagram = &buf[..n];
                if from == peer && coap::message_id(datagram) == Some(mid) {
                    match coap::message_type(datagram) {
                        Some(TYPE_ACK) => return Ok(Ack::Acked),
                        Some(TYPE_RST) => return Ok(Ack::Reset),
                        _ => {}
                    }
                }
                if Instant::now() >= deadline {
                    return Err(BenchError::Timeout("notification ack"));
                }
            }
            Err(e) if coap::is_timeout(&e) => return Err(BenchError::Timeout("notification ack")),
            Err(e) => return Err(BenchError::socket("receiving notification ack", e)),
        }
    }
}

/// Best-effort teardown of the observe relationship.
fn deregister(
    ctx: &ServerContext,
    frame: &mut Frame,
    observation: &Observation,
    buf: &mut [u8],
    attempts: u32,
) -> Result<()> {
    let teardown = frame.deregistration_frame();
    let mid = coap::message_id(&teardown);
    ctx.set_read_timeout(ctx.settings.timeouts.registration)?;

    for _ in 0..attempts.max(1) {
        if let Err(e) = ctx.socket.send_to(&teardown, observation.peer) {
            debug!("Server {} could not send deregistration: {}", ctx.id, e);
            return Ok(());
        }
        if !ctx.settings.confirmable {
            return Ok(());
        }
        match ctx.socket.recv_from(buf) {
            Ok((n, from)) if from == observation.peer && coap::message_id(&buf[..n]) == mid => {
                debug!("Server {} deregistered", ctx.id);
                return Ok(());
            }
            Ok(_) => {}
            Err(e) if coap::is_timeout(&e) => {}
            Err(e) => {
                debug!("Server {} deregistration read failed: {}", ctx.id, e);
                return Ok(());
            }
        }
    }
    debug!("Server {} deregistration was not acknowledged", ctx.id);
    Ok(())
}
