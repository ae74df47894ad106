//! Controller ("master") side of the distributed control protocol.
//!
//! The controller accepts agent connections in a background task and keeps
//! them in a registry ordered by arrival. Operator commands are dispatched
//! one at a time; a command that needs replies (`ping`, `observe`) reads
//! them from the agent connections directly while it holds the registry.

use std::io::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{
    parse_reply, split_commands, Command, Verb, HELP, OBSERVE_FAIL, OBSERVE_READY, OBSERVE_START, PING_REPLY,
};
use crate::coap::{self, TargetUri};
use crate::error::BenchError;

/// Longest a single command write may block before the agent is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// What the operator loop should do after a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Result of a coordinated observe run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// Every targeted agent was ready and received `observe_start`.
    Started { agents: usize },
    /// At least one agent was not ready; every target received `observe_fail`.
    Failed { not_ready: Vec<usize> },
}

struct AgentConn {
    peer: SocketAddr,
    writer: OwnedWriteHalf,
    lines: Lines<BufReader<OwnedReadHalf>>,
    last_rtt: Option<Duration>,
}

impl AgentConn {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self {
            peer,
            writer,
            lines: BufReader::new(reader).lines(),
            last_rtt: None,
        }
    }

    async fn send(&mut self, line: &str) -> std::io::Result<()> {
        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');
        match timeout(WRITE_TIMEOUT, self.writer.write_all(framed.as_bytes())).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "agent did not accept the command",
            )),
        }
    }

    /// Discard replies that are already buffered, such as answers that
    /// arrived after an earlier round gave up on them.
    async fn drain(&mut self) -> std::io::Result<()> {
        loop {
            match timeout(Duration::ZERO, self.lines.next_line()).await {
                Ok(Ok(Some(line))) => debug!("Discarding stale '{}' from agent {}", line.trim(), self.peer),
                Ok(Ok(None)) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "agent closed the connection",
                    ))
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(()),
            }
        }
    }

    /// Wait for one of the `accept` tokens tagged with `round`, skipping
    /// everything else. `Ok(None)` on timeout.
    async fn await_reply(
        &mut self,
        accept: &[&str],
        round: u64,
        wait: Duration,
    ) -> std::io::Result<Option<String>> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match timeout(remaining, self.lines.next_line()).await {
                Err(_) => return Ok(None),
                Ok(Ok(Some(line))) => match parse_reply(&line) {
                    (token, Some(tag)) if tag == round && accept.contains(&token) => {
                        return Ok(Some(token.to_string()))
                    }
                    _ => debug!("Ignoring '{}' from agent {} in round {}", line.trim(), self.peer, round),
                },
                Ok(Ok(None)) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "agent closed the connection",
                    ))
                }
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// Send a tagged request after discarding stale replies.
    async fn request(&mut self, command: &Command, round: u64) -> std::io::Result<()> {
        self.drain().await?;
        self.send(&command.with_round(round).body()).await
    }
}

type Registry = Arc<Mutex<Vec<AgentConn>>>;

/// Drives any number of agents from one operator console.
pub struct Controller {
    local_addr: SocketAddr,
    agents: Registry,
    accept_task: JoinHandle<()>,
    last_line: Option<String>,
    observe_timeout: Option<Duration>,
    ping_timeout: Duration,
    rounds: AtomicU64,
}

impl Controller {
    /// Listen for agents on `addr`.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to listen for agents on {}", addr))?;
        let local_addr = listener.local_addr().context("Failed to read controller address")?;
        let agents: Registry = Arc::new(Mutex::new(Vec::new()));

        let registry = Arc::clone(&agents);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let mut agents = registry.lock().await;
                        agents.push(AgentConn::new(stream, peer));
                        info!("Agent @{} connected from {}", agents.len(), peer);
                    }
                    Err(e) => {
                        error!("Failed to accept agent connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        info!("Controller listening on {}", local_addr);
        Ok(Self {
            local_addr,
            agents,
            accept_task,
            last_line: None,
            observe_timeout: None,
            ping_timeout: crate::defaults::PING_TIMEOUT,
            rounds: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Override the computed per-agent observe timeout.
    pub fn set_observe_timeout(&mut self, timeout: Option<Duration>) {
        self.observe_timeout = timeout;
    }

    pub fn set_ping_timeout(&mut self, timeout: Duration) {
        self.ping_timeout = timeout;
    }

    pub async fn agent_count(&self) -> usize {
        self.agents.lock().await.len()
    }

    /// Peer addresses of the connected agents, in ordinal order.
    pub async fn agent_peers(&self) -> Vec<SocketAddr> {
        self.agents.lock().await.iter().map(|a| a.peer).collect()
    }

    /// Poll until `count` agents are connected or `wait` passes.
    pub async fn wait_for_agents(&self, count: usize, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            if self.agent_count().await >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Read operator commands from stdin until `exit` or end of input.
    pub async fn run_interactive(mut self) -> Result<()> {
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        println!("Type 'help' for the command list.");
        loop {
            print!("> ");
            let _ = std::io::stdout().flush();
            let line = match stdin.next_line().await.context("Failed to read command")? {
                Some(line) => line,
                None => break,
            };
            match self.execute_line(&line).await {
                Ok(Flow::Exit) => break,
                Ok(Flow::Continue) => {}
                Err(e) => error!("Command '{}' failed: {:#}", line.trim(), e),
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Execute one operator line: `-` repeats the previous line and `;`
    /// separates commands.
    pub async fn execute_line(&mut self, line: &str) -> Result<Flow> {
        let line = line.trim();
        let line = if line == "-" {
            match self.last_line.clone() {
                Some(previous) => previous,
                None => {
                    println!("No previous command");
                    return Ok(Flow::Continue);
                }
            }
        } else {
            line.to_string()
        };
        if line.is_empty() {
            return Ok(Flow::Continue);
        }
        self.last_line = Some(line.clone());

        for text in split_commands(&line) {
            let command = match Command::parse(text) {
                Ok(command) => command,
                Err(e) => {
                    println!("Unknown command '{}': {}", text, e);
                    continue;
                }
            };
            match self.execute(&command).await {
                Ok(Flow::Exit) => return Ok(Flow::Exit),
                Ok(Flow::Continue) => {}
                Err(e) => error!("Command '{}' failed: {:#}", text, e),
            }
        }
        Ok(Flow::Continue)
    }

    pub async fn execute(&mut self, command: &Command) -> Result<Flow> {
        match &command.verb {
            Verb::Exit => {
                if command.has_option("all") {
                    self.broadcast(command.target, "exit").await;
                }
                return Ok(Flow::Exit);
            }
            Verb::Help => println!("{}", HELP),
            Verb::Beep => {
                print!("\x07");
                let _ = std::io::stdout().flush();
            }
            Verb::Status => self.print_status().await,
            Verb::Ping => {
                for (ordinal, rtt) in self.ping(command.target).await {
                    match rtt {
                        Some(rtt) => println!("@{}: {} ms", ordinal, rtt.as_millis()),
                        None => println!("@{}: -1", ordinal),
                    }
                }
            }
            Verb::Wait => {
                let ms = command.option_as::<u64>("t").unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            Verb::Post => self.post(command).await?,
            Verb::Observe => {
                let outcome = self.observe(command).await?;
                info!("Observe run: {:?}", outcome);
            }
            Verb::Bench | Verb::Stress | Verb::ObserveStart | Verb::ObserveFail => {
                let sent = self.broadcast(command.target, &command.body()).await;
                debug!("'{}' sent to {} agents", command.body(), sent);
            }
            Verb::ObserveReady | Verb::Unknown(_) => {
                println!("Unknown command '{}'", command);
            }
        }
        Ok(Flow::Continue)
    }

    async fn print_status(&self) {
        let agents = self.agents.lock().await;
        println!("{} agents connected", agents.len());
        for (index, agent) in agents.iter().enumerate() {
            match agent.last_rtt {
                Some(rtt) => println!("  @{} {} (rtt {} ms)", index + 1, agent.peer, rtt.as_millis()),
                None => println!("  @{} {}", index + 1, agent.peer),
            }
        }
    }

    async fn post(&self, command: &Command) -> Result<()> {
        let uri = command.params.first().context("post needs a target URI")?;
        let uri = TargetUri::parse(uri)?;
        let payload = command.params.get(1..).map(|rest| rest.join(" ")).filter(|p| !p.is_empty());
        let code = tokio::task::spawn_blocking(move || {
            coap::post_once(&uri, payload.as_deref().map(str::as_bytes), crate::defaults::RESPONSE_TIMEOUT)
        })
        .await
        .context("POST task failed")??;
        println!("Response code {}.{:02}", code >> 5, code & 0x1F);
        Ok(())
    }

    /// Registry indices addressed by `target`.
    fn targets(agents: &[AgentConn], target: Option<usize>) -> Vec<usize> {
        match target {
            Some(ordinal) if ordinal <= agents.len() => vec![ordinal - 1],
            Some(ordinal) => {
                warn!("No agent @{} ({} connected)", ordinal, agents.len());
                Vec::new()
            }
            None => (0..agents.len()).collect(),
        }
    }

    /// Remove the agents at `indices`, logging why.
    fn remove(agents: &mut Vec<AgentConn>, mut indices: Vec<usize>, reason: &str) {
        indices.sort_unstable();
        indices.dedup();
        for index in indices.into_iter().rev() {
            if index < agents.len() {
                let agent = agents.remove(index);
                let err = BenchError::AgentUnreachable {
                    agent: agent.peer,
                    reason: reason.to_string(),
                };
                warn!("Removing agent: {}", err);
            }
        }
    }

    /// Send `line` to the addressed agents, dropping any whose socket fails.
    ///
    /// ## Returns
    /// The number of agents that accepted the line.
    pub async fn broadcast(&self, target: Option<usize>, line: &str) -> usize {
        let mut agents = self.agents.lock().await;
        let targets = Self::targets(&agents, target);
        let mut failed = Vec::new();
        for &index in &targets {
            if let Err(e) = agents[index].send(line).await {
                warn!("Failed to send '{}' to {}: {}", line, agents[index].peer, e);
                failed.push(index);
            }
        }
        let delivered = targets.len() - failed.len();
        Self::remove(&mut agents, failed, "send failed");
        delivered
    }

    /// Measure the round trip to each addressed agent.
    ///
    /// An agent that does not answer is reported as `None` and gets one more
    /// health-check ping; it is removed only if that fails too.
    pub async fn ping(&self, target: Option<usize>) -> Vec<(usize, Option<Duration>)> {
        let mut agents = self.agents.lock().await;
        let targets = Self::targets(&agents, target);
        let mut results = Vec::with_capacity(targets.len());
        let mut unreachable = Vec::new();

        for index in targets {
            let rtt = self.ping_once(&mut agents[index]).await;
            agents[index].last_rtt = rtt;
            if rtt.is_none() && !self.is_alive(&mut agents[index], 1).await {
                unreachable.push(index);
            }
            results.push((index + 1, rtt));
        }

        Self::remove(&mut agents, unreachable, "no reply to ping");
        results
    }

    fn next_round(&self) -> u64 {
        self.rounds.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn ping_once(&self, agent: &mut AgentConn) -> Option<Duration> {
        let round = self.next_round();
        let sent_at = Instant::now();
        if let Err(e) = agent.request(&Command::bare(Verb::Ping), round).await {
            debug!("Ping to {} failed: {}", agent.peer, e);
            return None;
        }
        match agent.await_reply(&[PING_REPLY], round, self.ping_timeout).await {
            Ok(Some(_)) => Some(sent_at.elapsed()),
            Ok(None) => None,
            Err(e) => {
                debug!("Ping reply from {} failed: {}", agent.peer, e);
                None
            }
        }
    }

    /// Health check for an agent that missed a reply: up to `attempts`
    /// pings, alive if any of them is answered.
    async fn is_alive(&self, agent: &mut AgentConn, attempts: u32) -> bool {
        for _ in 0..attempts {
            if self.ping_once(agent).await.is_some() {
                return true;
            }
        }
        false
    }

    /// Two-phase observe commit.
    ///
    /// The setup command goes to every addressed agent. Each agent then has
    /// its own timeout to answer `observe_ready`. Only if all of them do is
    /// `observe_start` broadcast; otherwise every addressed agent receives
    /// `observe_fail`.
    ///
    /// Each call is a new round: only replies tagged with its round count,
    /// so an answer that missed an earlier round cannot start this one. An
    /// agent that misses its timeout and then fails two health-check pings
    /// is removed.
    pub async fn observe(&self, command: &Command) -> Result<ObserveOutcome> {
        let wait = self.observe_timeout.unwrap_or_else(|| command.observe_timeout());
        let round = self.next_round();
        let setup = command.with_round(round);
        let mut agents = self.agents.lock().await;
        let targets = Self::targets(&agents, command.target);
        if targets.is_empty() {
            anyhow::bail!("No agents to run '{}'", setup);
        }

        let mut not_ready = Vec::new();
        let mut dead = Vec::new();
        let mut unreachable = Vec::new();
        for &index in &targets {
            if let Err(e) = agents[index].request(&setup, round).await {
                warn!("Failed to send observe setup to {}: {}", agents[index].peer, e);
                not_ready.push(index);
                dead.push(index);
            }
        }

        for &index in &targets {
            if dead.contains(&index) {
                continue;
            }
            let agent = &mut agents[index];
            match agent.await_reply(&[OBSERVE_READY, OBSERVE_FAIL], round, wait).await {
                Ok(Some(reply)) if reply == OBSERVE_READY => debug!("Agent @{} ready", index + 1),
                Ok(Some(_)) => {
                    warn!("Agent @{} failed to set up the observe run", index + 1);
                    not_ready.push(index);
                }
                Ok(None) => {
                    warn!("Agent @{} not ready after {:?}", index + 1, wait);
                    not_ready.push(index);
                    if !self.is_alive(agent, 2).await {
                        unreachable.push(index);
                    }
                }
                Err(e) => {
                    warn!("Agent @{} dropped during observe setup: {}", index + 1, e);
                    not_ready.push(index);
                    dead.push(index);
                }
            }
        }

        let verdict = if not_ready.is_empty() { OBSERVE_START } else { OBSERVE_FAIL };
        for &index in &targets {
            if dead.contains(&index) {
                continue;
            }
            if let Err(e) = agents[index].send(verdict).await {
                warn!("Failed to send {} to {}: {}", verdict, agents[index].peer, e);
                dead.push(index);
            }
        }
        dead.extend(unreachable);
        Self::remove(&mut agents, dead, "lost or unresponsive during observe");

        if not_ready.is_empty() {
            info!("Observe run started on {} agents", targets.len());
            Ok(ObserveOutcome::Started {
                agents: targets.len(),
            })
        } else {
            let mut ordinals: Vec<usize> = not_ready.into_iter().map(|i| i + 1).collect();
            ordinals.sort_unstable();
            ordinals.dedup();
            Ok(ObserveOutcome::Failed { not_ready: ordinals })
        }
    }

    /// Stop accepting agents and close every connection.
    pub async fn shutdown(&self) {
        self.accept_task.abort();
        let mut agents = self.agents.lock().await;
        for agent in agents.iter_mut() {
            let _ = agent.writer.shutdown().await;
        }
        agents.clear();
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn controller() -> Controller {
        Controller::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    async fn connect(controller: &Controller) -> Lines<BufReader<TcpStream>> {
        let stream = TcpStream::connect(controller.local_addr()).await.unwrap();
        BufReader::new(stream).lines()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_addressed_agent_only() {
        let mut controller = controller().await;
        let mut first = connect(&controller).await;
        assert!(controller.wait_for_agents(1, Duration::from_secs(2)).await);
        let mut second = connect(&controller).await;
        assert!(controller.wait_for_agents(2, Duration::from_secs(2)).await);

        controller.execute_line("@2 bench -c 3 coap://h/x").await.unwrap();
        let line = timeout(Duration::from_secs(2), second.next_line()).await.unwrap().unwrap();
        assert_eq!(line.as_deref(), Some("bench -c 3 coap://h/x"));
        assert!(timeout(Duration::from_millis(100), first.next_line()).await.is_err());
    }

    #[tokio::test]
    async fn test_repeat_and_multiple_commands() {
        let mut controller = controller().await;
        let mut agent = connect(&controller).await;
        assert!(controller.wait_for_agents(1, Duration::from_secs(2)).await);

        controller.execute_line("stress -stop; bench -log a").await.unwrap();
        controller.execute_line("-").await.unwrap();

        let mut received = Vec::new();
        for _ in 0..4 {
            let line = timeout(Duration::from_secs(2), agent.next_line()).await.unwrap().unwrap();
            received.push(line.unwrap());
        }
        assert_eq!(received, vec!["stress -stop", "bench -log a", "stress -stop", "bench -log a"]);
    }

    #[tokio::test]
    async fn test_unresponsive_agent_is_removed_after_health_check() {
        let mut controller = controller().await;
        controller.set_ping_timeout(Duration::from_millis(100));
        let _silent = connect(&controller).await;
        assert!(controller.wait_for_agents(1, Duration::from_secs(2)).await);

        let results = controller.ping(None).await;
        assert_eq!(results, vec![(1, None)]);
        assert_eq!(controller.agent_count().await, 0);
    }

    #[tokio::test]
    async fn test_ping_measures_round_trip() {
        let controller = controller().await;
        let stream = TcpStream::connect(controller.local_addr()).await.unwrap();
        assert!(controller.wait_for_agents(1, Duration::from_secs(2)).await);

        tokio::spawn(async move {
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let command = Command::parse(&line).unwrap();
                if command.verb == Verb::Ping {
                    let reply = crate::control::reply_line(PING_REPLY, command.round());
                    writer.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
                }
            }
        });

        let results = controller.ping(None).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_some());
        assert_eq!(controller.agent_count().await, 1);
    }

    #[tokio::test]
    async fn test_late_ping_reply_does_not_answer_the_next_ping() {
        let mut controller = controller().await;
        controller.set_ping_timeout(Duration::from_millis(100));
        let stream = TcpStream::connect(controller.local_addr()).await.unwrap();
        assert!(controller.wait_for_agents(1, Duration::from_secs(2)).await);

        // Answers the first ping only, after its timeout has passed.
        tokio::spawn(async move {
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            if let Ok(Some(line)) = lines.next_line().await {
                let round = Command::parse(&line).unwrap().round();
                tokio::time::sleep(Duration::from_millis(150)).await;
                let reply = crate::control::reply_line(PING_REPLY, round);
                writer.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
            }
            while let Ok(Some(_)) = lines.next_line().await {}
        });

        assert_eq!(controller.ping(None).await, vec![(1, None)]);
        assert_eq!(controller.agent_count().await, 0);
    }

    #[tokio::test]
    async fn test_exit_flow() {
        let mut controller = controller().await;
        assert_eq!(controller.execute_line("status").await.unwrap(), Flow::Continue);
        assert_eq!(controller.execute_line("nonsense").await.unwrap(), Flow::Continue);
        assert_eq!(controller.execute_line("exit").await.unwrap(), Flow::Exit);
    }
}
