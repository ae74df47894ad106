//! Open-loop stress load.
//!
//! Unlike the closed-loop clients, the stress generator does not wait for a
//! response before sending the next request. A sender thread emits
//! non-confirmable GETs on one socket while a receiver thread counts the
//! replies. An occupation meter pauses the sender while too many requests
//! are outstanding and resumes it once the backlog has halved.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::coap::{self, Frame, Method, TargetUri};
use crate::device::{open_udp_socket, DATAGRAM_SIZE};
use crate::error::{BenchError, Result};

const RECEIVE_POLL: Duration = Duration::from_millis(100);
const PAUSE_POLL: Duration = Duration::from_millis(1);

/// Counts of a finished stress run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StressReport {
    pub requested: u64,
    pub responded: u64,
    pub pauses: u64,
    pub elapsed_ms: u64,
}

impl StressReport {
    pub fn request_rate(&self) -> f64 {
        if self.elapsed_ms == 0 {
            0.0
        } else {
            self.requested as f64 * 1000.0 / self.elapsed_ms as f64
        }
    }
}

#[derive(Debug, Default)]
struct StressCounters {
    running: AtomicBool,
    requested: AtomicU64,
    responded: AtomicU64,
    pauses: AtomicU64,
}

impl StressCounters {
    fn outstanding(&self) -> u64 {
        let requested = self.requested.load(Ordering::Relaxed);
        requested.saturating_sub(self.responded.load(Ordering::Relaxed))
    }
}

/// A running open-loop generator. Dropping it stops the threads.
pub struct StressClient {
    target: SocketAddr,
    counters: Arc<StressCounters>,
    started: Instant,
    sender: Option<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
}

impl StressClient {
    /// Start sending to `uri`. `occupation` is the backlog that pauses the
    /// sender.
    pub fn start(uri: &TargetUri, bind: Option<IpAddr>, occupation: u64) -> Result<Self> {
        let target = uri.resolve()?;
        let local = SocketAddr::new(bind.unwrap_or_else(|| coap::unspecified_for(target)), 0);
        let socket = open_udp_socket(local).map_err(|e| BenchError::socket("binding stress socket", e))?;
        socket
            .connect(target)
            .map_err(|e| BenchError::socket("connecting stress socket", e))?;
        socket
            .set_read_timeout(Some(RECEIVE_POLL))
            .map_err(|e| BenchError::socket("configuring stress socket", e))?;
        let socket = Arc::new(socket);
        let mut frame = Frame::request_template(Method::Get, uri, None, false)?;
        frame.set_message_id(rand::random());

        let counters = Arc::new(StressCounters::default());
        counters.running.store(true, Ordering::Release);

        let sender = {
            let socket = Arc::clone(&socket);
            let counters = Arc::clone(&counters);
            thread::Builder::new()
                .name("coapbench-stress-tx".to_string())
                .spawn(move || send_loop(&socket, frame, &counters, occupation.max(2)))
                .map_err(|e| BenchError::socket("spawning stress sender", e))?
        };
        let receiver = {
            let counters = Arc::clone(&counters);
            thread::Builder::new()
                .name("coapbench-stress-rx".to_string())
                .spawn(move || receive_loop(&socket, &counters))
                .map_err(|e| BenchError::socket("spawning stress receiver", e))?
        };

        info!("Stress load started against {} (occupation {})", target, occupation);
        Ok(Self {
            target,
            counters,
            started: Instant::now(),
            sender: Some(sender),
            receiver: Some(receiver),
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn outstanding(&self) -> u64 {
        self.counters.outstanding()
    }

    /// Stop both threads and report what was sent and answered.
    pub fn stop(mut self) -> StressReport {
        self.halt();
        let report = StressReport {
            requested: self.counters.requested.load(Ordering::Relaxed),
            responded: self.counters.responded.load(Ordering::Relaxed),
            pauses: self.counters.pauses.load(Ordering::Relaxed),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        };
        info!(
            "Stress load stopped: requested={} responded={} rate={:.0}/s",
            report.requested,
            report.responded,
            report.request_rate()
        );
        report
    }

    fn halt(&mut self) {
        self.counters.running.store(false, Ordering::Release);
        for handle in [self.sender.take(), self.receiver.take()].into_iter().flatten() {
            if handle.join().is_err() {
                warn!("Stress thread panicked");
            }
        }
    }
}

impl Drop for StressClient {
    fn drop(&mut self) {
        self.halt();
    }
}

fn send_loop(socket: &UdpSocket, mut frame: Frame, counters: &StressCounters, occupation: u64) {
    let resume_below = occupation / 2;
    while counters.running.load(Ordering::Acquire) {
        if counters.outstanding() > occupation {
            counters.pauses.fetch_add(1, Ordering::Relaxed);
            debug!("Stress sender paused with {} outstanding", counters.outstanding());
            while counters.running.load(Ordering::Acquire) && counters.outstanding() >= resume_below {
                thread::sleep(PAUSE_POLL);
            }
            continue;
        }
        match socket.send(frame.next_mid()) {
            Ok(_) => {
                counters.requested.fetch_add(1, Ordering::Relaxed);
            }
            // Port unreachable from an earlier datagram; keep going.
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                thread::sleep(PAUSE_POLL);
            }
            Err(e) => {
                warn!("Stress sender stopped: {}", e);
                break;
            }
        }
    }
}

fn receive_loop(socket: &UdpSocket, counters: &StressCounters) {
    let mut buf = vec![0u8; DATAGRAM_SIZE];
    while counters.running.load(Ordering::Acquire) {
        match socket.recv(&mut buf) {
            Ok(n) if coap::is_coap_v1(&buf[..n]) => {
                counters.responded.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(e) if coap::is_timeout(&e) => {}
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {}
            Err(e) => {
                warn!("Stress receiver stopped: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stress_against_echo_counts_replies() {
        let echo = UdpSocket::bind("127.0.0.1:0").unwrap();
        echo.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let addr = echo.local_addr().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_echo = Arc::clone(&stop);
        let responder = thread::spawn(move || {
            let mut buf = [0u8; 2048];
            while !stop_echo.load(Ordering::Relaxed) {
                if let Ok((n, from)) = echo.recv_from(&mut buf) {
                    let _ = echo.send_to(&buf[..n], from);
                }
            }
        });

        let uri = TargetUri::parse(&format!("coap://{}/stress", addr)).unwrap();
        let client = StressClient::start(&uri, None, 100).unwrap();
        thread::sleep(Duration::from_millis(300));
        let report = client.stop();
        stop.store(true, Ordering::Relaxed);
        responder.join().unwrap();

        assert!(report.requested > 0);
        assert!(report.responded > 0);
        assert!(report.responded <= report.requested);
    }

    #[test]
    fn test_occupation_pauses_sender_without_replies() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let uri = TargetUri::parse(&format!("coap://{}/stress", silent.local_addr().unwrap())).unwrap();
        let client = StressClient::start(&uri, None, 50).unwrap();
        thread::sleep(Duration::from_millis(200));
        let report = client.stop();

        assert_eq!(report.responded, 0);
        assert!(report.requested <= 51);
        assert!(report.pauses >= 1);
    }

    #[test]
    fn test_request_rate() {
        let report = StressReport {
            requested: 500,
            responded: 0,
            pauses: 0,
            elapsed_ms: 250,
        };
        assert_eq!(report.request_rate(), 2000.0);
        assert_eq!(StressReport::default().request_rate(), 0.0);
    }
}
