use anyhow::Result;
use coapbench::control::controller::ObserveOutcome;
use coapbench::control::{reply_line, Verb};
use coapbench::{Command, Controller};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// The agent end of a control connection, driven by hand.
struct FakeAgent {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl FakeAgent {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read).lines(),
            writer,
        })
    }

    async fn next_command(&mut self) -> Result<Command> {
        let line = timeout(Duration::from_secs(3), self.lines.next_line()).await??;
        let line = line.ok_or_else(|| anyhow::anyhow!("controller closed the connection"))?;
        Ok(Command::parse(&line)?)
    }

    /// Next command that is not a health-check ping, leaving pings unanswered.
    async fn next_skipping_pings(&mut self) -> Result<Command> {
        loop {
            let command = self.next_command().await?;
            if command.verb != Verb::Ping {
                return Ok(command);
            }
        }
    }

    async fn reply(&mut self, token: &str, round: Option<u64>) -> Result<()> {
        let line = format!("{}\n", reply_line(token, round));
        self.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Read the observe setup and answer it as ready.
    async fn accept_setup(&mut self) -> Result<()> {
        let setup = self.next_command().await?;
        assert_eq!(setup.verb, Verb::Observe);
        assert_eq!(setup.last_param(), Some("coap://127.0.0.1/x"));
        self.reply("observe_ready", setup.round()).await
    }
}

/// Connect agents one at a time so their ordinals follow connection order.
async fn setup(count: usize) -> Result<(Controller, Vec<FakeAgent>)> {
    let mut controller = Controller::bind("127.0.0.1:0".parse()?).await?;
    controller.set_observe_timeout(Some(Duration::from_millis(300)));
    controller.set_ping_timeout(Duration::from_millis(200));

    let mut agents = Vec::new();
    for n in 1..=count {
        agents.push(FakeAgent::connect(controller.local_addr()).await?);
        assert!(controller.wait_for_agents(n, Duration::from_secs(2)).await);
    }
    Ok((controller, agents))
}

#[tokio::test]
async fn observe_starts_when_every_agent_is_ready() -> Result<()> {
    let (controller, mut agents) = setup(3).await?;
    let command = Command::parse("observe -s 5 coap://127.0.0.1/x")?;

    let answer = async {
        for agent in agents.iter_mut() {
            agent.accept_setup().await?;
        }
        anyhow::Ok(())
    };
    let (outcome, answered) = tokio::join!(controller.observe(&command), answer);
    answered?;

    assert_eq!(outcome?, ObserveOutcome::Started { agents: 3 });
    for agent in agents.iter_mut() {
        assert_eq!(agent.next_command().await?.verb, Verb::ObserveStart);
    }
    assert_eq!(controller.agent_count().await, 3);
    controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn silent_agent_aborts_observe_everywhere_and_is_removed() -> Result<()> {
    let (controller, mut agents) = setup(3).await?;
    let command = Command::parse("observe -s 5 coap://127.0.0.1/x")?;

    let answer = async {
        for (ordinal, agent) in agents.iter_mut().enumerate() {
            if ordinal == 1 {
                agent.next_command().await?;
            } else {
                agent.accept_setup().await?;
            }
        }
        anyhow::Ok(())
    };
    let (outcome, answered) = tokio::join!(controller.observe(&command), answer);
    answered?;

    assert_eq!(outcome?, ObserveOutcome::Failed { not_ready: vec![2] });
    for agent in agents.iter_mut() {
        assert_eq!(agent.next_skipping_pings().await?.verb, Verb::ObserveFail);
    }
    // Agent 2 answered neither the setup nor the health-check pings.
    assert_eq!(controller.agent_count().await, 2);
    controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn late_ready_does_not_start_the_next_round() -> Result<()> {
    let (controller, mut agents) = setup(1).await?;
    let command = Command::parse("observe -s 1 coap://127.0.0.1/x")?;
    let agent = &mut agents[0];

    // Round one: the agent is alive but only gets ready after the
    // controller gave up, so its answer arrives late.
    let slow = async {
        let setup = agent.next_command().await?;
        let ping = agent.next_command().await?;
        assert_eq!(ping.verb, Verb::Ping);
        agent.reply("ping", ping.round()).await?;
        assert_eq!(agent.next_command().await?.verb, Verb::ObserveFail);
        agent.reply("observe_ready", setup.round()).await?;
        anyhow::Ok(())
    };
    let (outcome, answered) = tokio::join!(controller.observe(&command), slow);
    answered?;
    assert_eq!(outcome?, ObserveOutcome::Failed { not_ready: vec![1] });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Round two: the agent never answers the setup but stays reachable.
    let silent = async {
        let setup = agent.next_command().await?;
        assert_eq!(setup.verb, Verb::Observe);
        let ping = agent.next_command().await?;
        assert_eq!(ping.verb, Verb::Ping);
        agent.reply("ping", ping.round()).await?;
        anyhow::Ok(agent.next_command().await?)
    };
    let (outcome, verdict) = tokio::join!(controller.observe(&command), silent);
    assert_eq!(outcome?, ObserveOutcome::Failed { not_ready: vec![1] });
    assert_eq!(verdict?.verb, Verb::ObserveFail);
    assert_eq!(controller.agent_count().await, 1);
    controller.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn addressed_observe_only_involves_one_agent() -> Result<()> {
    let (controller, mut agents) = setup(2).await?;
    let command = Command::parse("@2 observe -s 1 coap://127.0.0.1/x")?;

    let (outcome, answered) = tokio::join!(controller.observe(&command), agents[1].accept_setup());
    answered?;

    assert_eq!(outcome?, ObserveOutcome::Started { agents: 1 });
    assert_eq!(agents[1].next_command().await?.verb, Verb::ObserveStart);
    let untouched = timeout(Duration::from_millis(200), agents[0].lines.next_line()).await;
    assert!(untouched.is_err(), "agent @1 must not receive observe traffic");
    controller.shutdown().await;
    Ok(())
}
