//! Agent ("slave") side of the distributed control protocol.
//!
//! An agent connects out to the controller, retrying every second, and
//! executes the commands it receives on its own [`DeviceManager`]. Device
//! work blocks on sockets and thread joins, so every manager call runs on
//! tokio's blocking pool.
//!
//! For `observe` the agent arms its servers, waits until every one of them
//! sits at the start barrier and answers `observe_ready`. The controller's
//! `observe_start` then makes the agent join the barrier as its last party,
//! which releases the push phase.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use super::{reply_line, Command, Verb, OBSERVE_FAIL, OBSERVE_READY, PING_REPLY};
use crate::barrier::BarrierOutcome;
use crate::benchmark::BenchmarkProcess;
use crate::coap::{self, TargetUri};
use crate::device::DeviceKind;
use crate::manager::{DeviceManager, ManagerSettings};
use crate::stress::StressClient;
use crate::utils::validate_concurrency;

#[derive(Clone, Debug)]
pub struct AgentSettings {
    /// `host:port` of the controller.
    pub master: String,
    /// Local address for device sockets; chosen per target when unset.
    pub bind: Option<IpAddr>,
    pub reconnect_interval: Duration,
    pub barrier_poll_interval: Duration,
    pub barrier_poll_attempts: u32,
    pub stress_occupation: u64,
    pub manager: ManagerSettings,
}

impl Default for AgentSettings {
    fn default() -> Self {
        use crate::defaults;
        Self {
            master: format!("{}:{}", defaults::MASTER_ADDRESS, defaults::MASTER_PORT),
            bind: None,
            reconnect_interval: defaults::RECONNECT_INTERVAL,
            barrier_poll_interval: defaults::BARRIER_POLL_INTERVAL,
            barrier_poll_attempts: defaults::BARRIER_POLL_ATTEMPTS,
            stress_occupation: defaults::STRESS_OCCUPATION,
            manager: ManagerSettings::default(),
        }
    }
}

/// Whether the connection loop should keep going.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Next {
    Continue,
    Exit,
}

pub struct Agent {
    settings: AgentSettings,
    manager: DeviceManager,
    stress: Option<StressClient>,
}

impl Agent {
    pub fn new(process: Arc<BenchmarkProcess>, settings: AgentSettings) -> Self {
        let manager = DeviceManager::with_settings(process, settings.manager.clone());
        Self {
            settings,
            manager,
            stress: None,
        }
    }

    pub fn manager(&self) -> &DeviceManager {
        &self.manager
    }

    /// Connect to the controller and serve it until told to exit.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let stream = match TcpStream::connect(&self.settings.master).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("Controller {} not reachable: {}", self.settings.master, e);
                    tokio::time::sleep(self.settings.reconnect_interval).await;
                    continue;
                }
            };
            info!("Connected to controller {}", self.settings.master);

            let exit = self.serve(stream).await;
            self.stop_all().await;
            match exit {
                Ok(true) => {
                    info!("Controller asked to exit");
                    break;
                }
                Ok(false) => warn!("Controller connection closed, reconnecting"),
                Err(e) => warn!("Controller connection failed: {:#}", e),
            }
            tokio::time::sleep(self.settings.reconnect_interval).await;
        }
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || manager.shutdown())
            .await
            .context("Manager shutdown task failed")?;
        Ok(())
    }

    /// Serve one controller connection.
    ///
    /// ## Returns
    /// `true` if the controller sent `exit`, `false` if the connection ended.
    pub async fn serve(&mut self, stream: TcpStream) -> Result<bool> {
        let _ = stream.set_nodelay(true);
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines.next_line().await.context("Failed to read from controller")? {
            let command = match Command::parse(&line) {
                Ok(command) => command,
                Err(e) => {
                    warn!("Ignoring command '{}': {}", line.trim(), e);
                    continue;
                }
            };
            match self.handle(&command, &mut writer).await {
                Ok(Next::Exit) => return Ok(true),
                Ok(Next::Continue) => {}
                Err(e) => error!("Command '{}' failed: {:#}", line.trim(), e),
            }
        }
        Ok(false)
    }

    async fn handle(&mut self, command: &Command, writer: &mut OwnedWriteHalf) -> Result<Next> {
        debug!("Received '{}'", command);
        match &command.verb {
            Verb::Ping => reply(writer, &reply_line(PING_REPLY, command.round())).await?,
            Verb::Bench => self.bench(command).await?,
            Verb::Observe => {
                let verdict = match self.observe(command).await {
                    Ok(true) => OBSERVE_READY,
                    Ok(false) => OBSERVE_FAIL,
                    Err(e) => {
                        error!("Observe setup failed: {:#}", e);
                        self.stop_run().await;
                        OBSERVE_FAIL
                    }
                };
                reply(writer, &reply_line(verdict, command.round())).await?;
            }
            Verb::ObserveStart => {
                let manager = self.manager.clone();
                tokio::task::spawn_blocking(move || match manager.join_barrier() {
                    BarrierOutcome::Released => info!("Observe push phase started"),
                    BarrierOutcome::Aborted => warn!("Observe run was aborted before it started"),
                });
            }
            Verb::ObserveFail => {
                info!("Controller aborted the observe run");
                self.stop_run().await;
            }
            Verb::Stress => self.stress(command)?,
            Verb::Exit => return Ok(Next::Exit),
            Verb::Wait => {
                let ms = command.option_as::<u64>("t").unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            _ => warn!("Unsupported command '{}'", command),
        }
        Ok(Next::Continue)
    }

    async fn bench(&mut self, command: &Command) -> Result<()> {
        if let Some(name) = command.option("new-log") {
            let path = self.manager.lognew(name)?;
            info!("Statistics log is now {}", path.display());
        }
        if command.has_option("log") {
            let mut entry: Vec<&str> = command.option("log").into_iter().collect();
            entry.extend(command.params.iter().map(String::as_str));
            self.manager.log(&entry.join(" "))?;
            return Ok(());
        }

        let uri = match command.last_param() {
            Some(uri) => uri,
            None if command.has_option("new-log") => return Ok(()),
            None => anyhow::bail!("bench needs a target URI"),
        };
        let levels = match command.option("c") {
            Some(levels) => crate::cli::parse_series(levels).map_err(anyhow::Error::msg)?.0,
            None => vec![crate::defaults::DEFAULT_CLIENTS],
        };
        for &level in &levels {
            validate_concurrency(level)?;
        }
        let duration = Duration::from_secs(
            command
                .option_as::<u64>("t")
                .unwrap_or(crate::defaults::DEFAULT_TIME_SECS),
        );

        self.manager.set_uri(uri)?;
        self.manager.set_bind_address(self.settings.bind)?;
        self.manager.set_track_latency(command.has_option("latency"));
        self.manager.set_confirmable(true);

        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = manager.run_concurrency_series(&levels, duration) {
                error!("Benchmark series failed: {:#}", e);
            }
        });
        Ok(())
    }

    /// Arm the servers and wait until all of them are at the barrier.
    ///
    /// ## Returns
    /// `true` when every server is registered, observed and waiting.
    async fn observe(&mut self, command: &Command) -> Result<bool> {
        // The controller stops waiting after this long, so a later answer is useless.
        let deadline = Instant::now()
            + command
                .observe_timeout()
                .min(self.settings.barrier_poll_interval * self.settings.barrier_poll_attempts);
        let uri = TargetUri::parse(command.last_param().context("observe needs a target URI")?)?;
        let servers = command
            .option_as::<usize>("s")
            .unwrap_or(crate::defaults::DEFAULT_SERVERS);
        validate_concurrency(servers)?;
        let duration = Duration::from_secs(
            command
                .option_as::<u64>("t")
                .unwrap_or(crate::defaults::DEFAULT_TIME_SECS),
        );
        let confirmable = !command.has_option("non");
        let latency = command.has_option("latency");
        let bind = self.settings.bind;

        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            manager.stop();
            let target = uri.resolve()?;
            let bind = bind.or_else(|| coap::route_local_address(target));
            manager.update_settings(|s| {
                s.uri = Some(uri);
                s.bind = bind;
                s.confirmable = confirmable;
                s.track_latency = latency;
            });
            manager.start(servers, duration, DeviceKind::Server)?;
            Ok(())
        })
        .await
        .context("Observe setup task failed")??;

        loop {
            let failed = self.manager.failed_devices();
            if failed > 0 {
                warn!("{} servers failed to register", failed);
                self.stop_run().await;
                return Ok(false);
            }
            if self.manager.devices_at_barrier() == servers {
                info!("All {} servers are waiting at the barrier", servers);
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.settings.barrier_poll_interval.min(deadline - now)).await;
        }

        warn!(
            "Only {} of {} servers reached the barrier",
            self.manager.devices_at_barrier(),
            servers
        );
        self.stop_run().await;
        Ok(false)
    }

    fn stress(&mut self, command: &Command) -> Result<()> {
        if command.has_option("stop") {
            match self.stress.take() {
                Some(client) => {
                    client.stop();
                }
                None => info!("No stress load running"),
            }
            return Ok(());
        }
        if command.has_option("start") {
            if let Some(previous) = self.stress.take() {
                previous.stop();
            }
            let uri = TargetUri::parse(command.last_param().context("stress -start needs a target URI")?)?;
            self.stress = Some(StressClient::start(
                &uri,
                self.settings.bind,
                self.settings.stress_occupation,
            )?);
            return Ok(());
        }
        anyhow::bail!("stress needs -start <uri> or -stop")
    }

    async fn stop_run(&self) {
        let manager = self.manager.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || manager.stop()).await {
            error!("Stop task failed: {}", e);
        }
    }

    async fn stop_all(&mut self) {
        if let Some(client) = self.stress.take() {
            client.stop();
        }
        self.stop_run().await;
    }
}

async fn reply(writer: &mut OwnedWriteHalf, line: &str) -> Result<()> {
    writer
        .write_all(format!("{}\n", line).as_bytes())
        .await
        .context("Failed to reply to controller")
}
