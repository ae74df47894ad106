//! # Distributed Control
//!
//! One controller drives any number of agents over plain TCP. Each line is a
//! command:
//!
//! ```text
//! command := ['@' ordinal] body
//! body    := verb { option | parameter }
//! option  := '-' name [value]
//! ```
//!
//! An option takes the following token as its value unless that token is
//! itself an option or the option is one of the [`FLAGS`], which never carry
//! a value. Everything else is a positional parameter. `@N`
//! addresses the N-th connected agent (1-based); without it a command goes
//! to every agent.
//!
//! The same [`Command`] parser serves both ends of the connection, so the
//! controller and agent never disagree about what a line means.

pub mod agent;
pub mod controller;

pub use agent::Agent;
pub use controller::Controller;

use std::fmt;
use std::time::Duration;

/// Replies and control tokens that travel from agent to controller.
pub const OBSERVE_READY: &str = "observe_ready";
pub const OBSERVE_FAIL: &str = "observe_fail";
pub const OBSERVE_START: &str = "observe_start";
pub const PING_REPLY: &str = "ping";

/// Option a controller attaches to `ping` and `observe` so that replies can
/// be matched to the request that asked for them. The agent echoes the
/// value after its reply token, e.g. `observe_ready 7`.
pub const ROUND_OPTION: &str = "round";

/// Reply line for `token`, tagged with `round` when the request carried one.
pub fn reply_line(token: &str, round: Option<u64>) -> String {
    match round {
        Some(round) => format!("{} {}", token, round),
        None => token.to_string(),
    }
}

/// Split a reply line into its token and round tag.
pub fn parse_reply(line: &str) -> (&str, Option<u64>) {
    let mut words = line.split_whitespace();
    let token = words.next().unwrap_or("");
    (token, words.next().and_then(|w| w.parse().ok()))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verb {
    Exit,
    Status,
    Ping,
    Stress,
    Bench,
    Observe,
    ObserveStart,
    ObserveReady,
    ObserveFail,
    Wait,
    Help,
    Post,
    Beep,
    Unknown(String),
}

impl Verb {
    fn parse(word: &str) -> Self {
        match word.to_ascii_lowercase().as_str() {
            "exit" | "quit" => Verb::Exit,
            "status" => Verb::Status,
            "ping" => Verb::Ping,
            "stress" => Verb::Stress,
            "bench" => Verb::Bench,
            "observe" => Verb::Observe,
            OBSERVE_START => Verb::ObserveStart,
            OBSERVE_READY => Verb::ObserveReady,
            OBSERVE_FAIL => Verb::ObserveFail,
            "wait" => Verb::Wait,
            "help" | "?" => Verb::Help,
            "post" => Verb::Post,
            "beep" => Verb::Beep,
            _ => Verb::Unknown(word.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Verb::Exit => "exit",
            Verb::Status => "status",
            Verb::Ping => "ping",
            Verb::Stress => "stress",
            Verb::Bench => "bench",
            Verb::Observe => "observe",
            Verb::ObserveStart => OBSERVE_START,
            Verb::ObserveReady => OBSERVE_READY,
            Verb::ObserveFail => OBSERVE_FAIL,
            Verb::Wait => "wait",
            Verb::Help => "help",
            Verb::Post => "post",
            Verb::Beep => "beep",
            Verb::Unknown(word) => word,
        }
    }
}

/// A parsed command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    /// 1-based agent ordinal from a leading `@N`.
    pub target: Option<usize>,
    pub verb: Verb,
    /// Options in order of appearance. Flags without a value map to `None`.
    pub options: Vec<(String, Option<String>)>,
    pub params: Vec<String>,
}

/// Why a line could not be parsed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("invalid agent address '{0}'")]
    InvalidTarget(String),
    #[error("missing command after '{0}'")]
    MissingVerb(String),
}

/// Split a line on whitespace.
pub fn tokenize(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

/// Options that never take a value.
pub const FLAGS: &[&str] = &["all", "latency", "non", "start", "stop"];

fn is_option(token: &str) -> bool {
    token.len() > 1 && token.starts_with('-') && token[1..].parse::<f64>().is_err()
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let tokens = tokenize(line);
        let mut iter = tokens.iter().copied().peekable();

        let first = iter.next().ok_or(ParseError::Empty)?;
        let (target, verb_word) = match first.strip_prefix('@') {
            Some(ordinal) => {
                let n = ordinal
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| ParseError::InvalidTarget(first.to_string()))?;
                let verb = iter.next().ok_or_else(|| ParseError::MissingVerb(first.to_string()))?;
                (Some(n), verb)
            }
            None => (None, first),
        };

        let mut options = Vec::new();
        let mut params = Vec::new();
        while let Some(token) = iter.next() {
            if is_option(token) {
                let name = token.trim_start_matches('-').to_ascii_lowercase();
                let value = match iter.peek() {
                    Some(next) if !is_option(next) && !FLAGS.contains(&name.as_str()) => {
                        iter.next().map(str::to_string)
                    }
                    _ => None,
                };
                options.push((name, value));
            } else {
                params.push(token.to_string());
            }
        }

        Ok(Self {
            target,
            verb: Verb::parse(verb_word),
            options,
            params,
        })
    }

    /// A bare command with no options or parameters.
    pub fn bare(verb: Verb) -> Command {
        Command {
            target: None,
            verb,
            options: Vec::new(),
            params: Vec::new(),
        }
    }

    pub fn has_option(&self, name: &str) -> bool {
        self.options.iter().any(|(n, _)| n == name)
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Typed option value; `None` when the option is absent or unparseable.
    pub fn option_as<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.option(name).and_then(|v| v.parse().ok())
    }

    /// The last positional parameter, conventionally the target URI.
    pub fn last_param(&self) -> Option<&str> {
        self.params.last().map(String::as_str)
    }

    /// Re-render the command without its agent address, for forwarding.
    pub fn body(&self) -> String {
        let mut line = self.verb.as_str().to_string();
        for (name, value) in &self.options {
            line.push_str(" -");
            line.push_str(name);
            if let Some(value) = value {
                line.push(' ');
                line.push_str(value);
            }
        }
        for param in &self.params {
            line.push(' ');
            line.push_str(param);
        }
        line
    }

    /// Per-agent wait for an observe setup to report ready. Server counts
    /// above [`MAX_CONCURRENCY`](crate::utils::MAX_CONCURRENCY) are clamped;
    /// the agent rejects them anyway.
    pub fn observe_timeout(&self) -> Duration {
        let servers = self
            .option_as::<u64>("s")
            .unwrap_or(crate::defaults::DEFAULT_SERVERS as u64)
            .min(crate::utils::MAX_CONCURRENCY as u64);
        observe_timeout(servers)
    }

    /// Round tag of a `ping` or `observe` request.
    pub fn round(&self) -> Option<u64> {
        self.option_as::<u64>(ROUND_OPTION)
    }

    /// This command with its round tag set to `round`.
    pub fn with_round(&self, round: u64) -> Command {
        let mut tagged = self.clone();
        tagged.options.retain(|(name, _)| name != ROUND_OPTION);
        tagged
            .options
            .push((ROUND_OPTION.to_string(), Some(round.to_string())));
        tagged
    }
}

/// `max(1000, (250 + servers) * 40)` milliseconds.
pub fn observe_timeout(servers: u64) -> Duration {
    Duration::from_millis(1000u64.max(servers.saturating_add(250).saturating_mul(40)))
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(target) = self.target {
            write!(f, "@{} ", target)?;
        }
        f.write_str(&self.body())
    }
}

/// Split an operator line into its `;`-separated commands.
pub fn split_commands(line: &str) -> Vec<&str> {
    line.split(';')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect()
}

pub const HELP: &str = "\
Commands (prefix with @N to address a single agent):
  status                                list connected agents
  ping                                  measure the round trip to each agent
  bench [-c N] [-t secs] [-latency] <uri>
                                        run a client benchmark on the agents
  bench -new-log <name>                 start a new statistics log
  bench -log <entry>                    write an entry into the statistics log
  observe [-s N] [-t secs] [-non] [-latency] <uri>
                                        synchronized observe benchmark
  stress -start <uri> | -stop           open-loop stress load
  wait -t <ms>                          pause the controller
  post <uri> [payload]                  send one CoAP POST from here
  beep                                  ring the terminal bell
  exit [-all]                           quit (and stop every agent with -all)
  -                                     repeat the previous line
Separate several commands with ';'.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_collapses_whitespace() {
        assert_eq!(tokenize("  bench   -c 10\t coap://h/x "), vec!["bench", "-c", "10", "coap://h/x"]);
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn test_parse_options_and_params() {
        let cmd = Command::parse("bench -c 100 -t 30 -latency coap://host/test").unwrap();
        assert_eq!(cmd.target, None);
        assert_eq!(cmd.verb, Verb::Bench);
        assert_eq!(cmd.option_as::<usize>("c"), Some(100));
        assert_eq!(cmd.option_as::<u64>("t"), Some(30));
        assert!(cmd.has_option("latency"));
        assert_eq!(cmd.option("latency"), None);
        assert_eq!(cmd.params, vec!["coap://host/test"]);
    }

    #[test]
    fn test_parse_flag_before_option() {
        let cmd = Command::parse("observe -non -s 50 coap://h/x").unwrap();
        assert!(cmd.has_option("non"));
        assert_eq!(cmd.option("non"), None);
        assert_eq!(cmd.option_as::<u64>("s"), Some(50));
        assert_eq!(cmd.last_param(), Some("coap://h/x"));
    }

    #[test]
    fn test_parse_agent_address() {
        let cmd = Command::parse("@2 ping").unwrap();
        assert_eq!(cmd.target, Some(2));
        assert_eq!(cmd.verb, Verb::Ping);

        assert_eq!(Command::parse("@0 ping"), Err(ParseError::InvalidTarget("@0".into())));
        assert_eq!(Command::parse("@x ping"), Err(ParseError::InvalidTarget("@x".into())));
        assert_eq!(Command::parse("@3"), Err(ParseError::MissingVerb("@3".into())));
        assert_eq!(Command::parse(""), Err(ParseError::Empty));
    }

    #[test]
    fn test_value_option_takes_next_token() {
        let cmd = Command::parse("bench -new-log run1").unwrap();
        assert_eq!(cmd.option("new-log"), Some("run1"));
        assert!(cmd.params.is_empty());
    }

    #[test]
    fn test_negative_number_is_a_value() {
        let cmd = Command::parse("wait -t -5").unwrap();
        assert_eq!(cmd.option("t"), Some("-5"));
    }

    #[test]
    fn test_unknown_verb_is_preserved() {
        let cmd = Command::parse("frobnicate -x").unwrap();
        assert_eq!(cmd.verb, Verb::Unknown("frobnicate".into()));
        assert_eq!(cmd.body(), "frobnicate -x");
    }

    #[test]
    fn test_body_drops_address() {
        let cmd = Command::parse("@1 bench -c 5 coap://h/x").unwrap();
        assert_eq!(cmd.body(), "bench -c 5 coap://h/x");
        assert_eq!(cmd.to_string(), "@1 bench -c 5 coap://h/x");
    }

    #[test]
    fn test_split_commands() {
        assert_eq!(split_commands("ping; status ;;wait -t 10"), vec!["ping", "status", "wait -t 10"]);
    }

    #[test]
    fn test_observe_timeout() {
        assert_eq!(observe_timeout(0), Duration::from_millis(10_000));
        assert_eq!(observe_timeout(750), Duration::from_millis(40_000));
        let cmd = Command::parse("observe -s 10 coap://h/x").unwrap();
        assert_eq!(cmd.observe_timeout(), Duration::from_millis(10_400));
    }

    #[test]
    fn test_observe_timeout_saturates_on_huge_server_counts() {
        assert_eq!(observe_timeout(u64::MAX), Duration::from_millis(u64::MAX));
        let cmd = Command::parse("observe -s 18446744073709551615 coap://h/x").unwrap();
        let clamped = (250 + crate::utils::MAX_CONCURRENCY as u64) * 40;
        assert_eq!(cmd.observe_timeout(), Duration::from_millis(clamped));
    }

    #[test]
    fn test_round_tags() {
        let cmd = Command::parse("observe -s 2 coap://h/x").unwrap();
        assert_eq!(cmd.round(), None);
        let tagged = cmd.with_round(7).with_round(8);
        assert_eq!(tagged.body(), "observe -s 2 -round 8 coap://h/x");
        assert_eq!(Command::parse(&tagged.body()).unwrap().round(), Some(8));

        assert_eq!(reply_line(OBSERVE_READY, Some(8)), "observe_ready 8");
        assert_eq!(reply_line(PING_REPLY, None), "ping");
        assert_eq!(parse_reply("observe_ready 8"), (OBSERVE_READY, Some(8)));
        assert_eq!(parse_reply(" ping "), (PING_REPLY, None));
        assert_eq!(parse_reply(""), ("", None));
    }
}
