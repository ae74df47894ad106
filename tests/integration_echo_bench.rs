use anyhow::Result;
use coapbench::{BenchmarkProcess, DeviceKind, DeviceManager, ManagerSettings, ProcessSettings};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A UDP responder that acknowledges every CoAP request with a piggybacked
/// 2.05 Content response carrying the request's MID and token.
struct EchoResponder {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EchoResponder {
    fn start() -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0")?;
        socket.set_read_timeout(Some(Duration::from_millis(50)))?;
        let addr = socket.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 2048];
            while !flag.load(Ordering::Relaxed) {
                let (n, from) = match socket.recv_from(&mut buf) {
                    Ok(received) => received,
                    Err(_) => continue,
                };
                if n < 4 {
                    continue;
                }
                let tkl = (buf[0] & 0x0F) as usize;
                let mut response = vec![0x60 | tkl as u8, 0x45, buf[2], buf[3]];
                response.extend_from_slice(&buf[4..4 + tkl.min(n - 4)]);
                response.extend_from_slice(&[0xFF, b'o', b'k']);
                let _ = socket.send_to(&response, from);
            }
        });

        Ok(Self {
            addr,
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EchoResponder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn manager(log_dir: &std::path::Path, track_latency: bool) -> Result<DeviceManager> {
    let process = BenchmarkProcess::new(ProcessSettings {
        log_dir: log_dir.to_path_buf(),
        echo_statistics: false,
        ..Default::default()
    })?;
    let mut settings = ManagerSettings {
        track_latency,
        guard_band: Duration::from_millis(100),
        tail_guard: Duration::from_millis(100),
        ..Default::default()
    };
    settings.timeouts.response = Duration::from_millis(500);
    Ok(DeviceManager::with_settings(process, settings))
}

/// Ten clients against a local echo responder for one second.
#[test]
fn echo_bench_counts_and_log_line() -> Result<()> {
    let responder = EchoResponder::start()?;
    let dir = tempfile::tempdir()?;
    let manager = manager(dir.path(), true)?;
    manager.set_uri(&format!("coap://{}/test", responder.addr))?;

    manager.start(10, Duration::from_millis(1000), DeviceKind::Client)?;
    assert!(manager.wait_idle(Duration::from_secs(10)));

    let log_path = dir.path().join("coapbench");
    let content = std::fs::read_to_string(&log_path)?;
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2, "header plus one run line: {:?}", lines);

    let (counts, distribution) = lines[1].split_once(" | ").expect("percentile separator");
    let counts: Vec<&str> = counts.split(", ").collect();
    assert_eq!(counts.len(), 5);
    assert_eq!(counts[1], "10");
    let distribution: Vec<&str> = distribution.split(", ").collect();
    assert_eq!(distribution.len(), 10, "nine percentiles plus stdev");

    let timeouts: u64 = counts[0].parse()?;
    let elapsed_secs: f64 = counts[2].parse()?;
    let completed: u64 = counts[3].parse()?;
    let throughput: f64 = counts[4].parse()?;

    assert!(completed > 0);
    assert!(elapsed_secs >= 1.0 && elapsed_secs < 3.0);
    let expected = completed as f64 / elapsed_secs;
    assert!((throughput - expected).abs() <= expected * 0.01 + 1.0);

    // Each device finishes its in-flight exchange before stopping, so every
    // send attempt ends as either a response or a timeout.
    let records = manager.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.completed, completed);
    assert_eq!(record.timeouts, timeouts);
    assert_eq!(record.completed + record.timeouts, record.sent);
    assert_eq!(record.latency.as_ref().map(|l| l.samples), Some(completed as usize));

    manager.shutdown();
    Ok(())
}

/// The counters identity holds on the recorded statistics.
#[test]
fn echo_bench_every_send_is_accounted_for() -> Result<()> {
    let responder = EchoResponder::start()?;
    let dir = tempfile::tempdir()?;
    let manager = manager(dir.path(), false)?;
    manager.set_uri(&format!("coap://{}/test", responder.addr))?;

    let records = manager.run_concurrency_series(&[2, 4], Duration::from_millis(300))?;
    assert_eq!(records.len(), 2);
    for (record, level) in records.iter().zip([2, 4]) {
        assert_eq!(record.concurrency, level);
        assert_eq!(record.completed + record.timeouts, record.sent);
        assert!(record.completed > 0);
        assert!(record.latency.is_none());
        assert!(record.to_log_line().starts_with(&format!("c={}, ", level)));
    }

    manager.shutdown();
    Ok(())
}
