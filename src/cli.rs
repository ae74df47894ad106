use clap::{ArgAction, Parser};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::benchmark::ProcessSettings;
use crate::coap::{check_address_family, Method, TargetUri};
use crate::manager::ManagerSettings;

/// coapbench - load generator and distributed benchmark for CoAP servers
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Target URI, e.g. coap://127.0.0.1:5683/test (local mode)
    #[clap(value_name = "URI")]
    pub uri: Option<String>,

    /// Number of concurrent clients, or a comma-separated series (e.g. 1,10,100)
    #[clap(short = 'c', long = "clients", value_parser = parse_series, default_value = "1", help_heading = "Benchmark Options")]
    pub clients: Series,

    /// Duration of each run in seconds
    #[clap(short = 't', long = "time", default_value_t = crate::defaults::DEFAULT_TIME_SECS, help_heading = "Benchmark Options")]
    pub time: u64,

    /// Local address to bind device sockets to
    #[clap(short = 'b', long = "bind", help_heading = "Benchmark Options")]
    pub bind: Option<IpAddr>,

    /// Record per-request latency and report percentiles
    #[clap(long, default_value_t = false, help_heading = "Benchmark Options")]
    pub latency: bool,

    /// Request method (GET, POST, PUT, DELETE)
    #[clap(short = 'm', long, value_parser = parse_method, default_value = crate::defaults::DEFAULT_METHOD, help_heading = "Benchmark Options")]
    pub method: Method,

    /// File whose content is sent as request payload
    #[clap(short = 'y', long = "payload-file", help_heading = "Benchmark Options")]
    pub payload_file: Option<PathBuf>,

    /// Send non-confirmable requests
    #[clap(long, default_value_t = false, help_heading = "Benchmark Options")]
    pub non: bool,

    /// Run as controller and wait for agents
    #[clap(long, default_value_t = false, conflicts_with = "slave", help_heading = "Distributed Mode")]
    pub master: bool,

    /// Run as agent and connect to a controller
    #[clap(long, default_value_t = false, help_heading = "Distributed Mode")]
    pub slave: bool,

    /// Controller address an agent connects to
    #[clap(short = 'a', long = "master-address", default_value = crate::defaults::MASTER_ADDRESS, help_heading = "Distributed Mode")]
    pub master_address: String,

    /// Controller port
    #[clap(short = 'p', long, default_value_t = crate::defaults::MASTER_PORT, help_heading = "Distributed Mode")]
    pub port: u16,

    /// Directory for statistics logs
    #[clap(long = "log-dir", default_value = ".")]
    pub log_dir: PathBuf,

    /// Also write diagnostics to this file
    #[clap(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Write all statistics records as JSON to this file
    #[clap(short = 'o', long = "output-file")]
    pub output_file: Option<PathBuf>,

    /// Only log warnings and errors
    #[clap(short = 'q', long, default_value_t = false)]
    pub quiet: bool,

    /// Verbose output (-v debug, -vv trace)
    #[clap(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Which role the process plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Local,
    Master,
    Slave,
}

/// Ordered list of concurrency levels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Series(pub Vec<usize>);

impl Args {
    pub fn mode(&self) -> Mode {
        if self.master {
            Mode::Master
        } else if self.slave {
            Mode::Slave
        } else {
            Mode::Local
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.time)
    }

    /// Check the arguments before anything runs.
    pub fn validate(&self) -> Result<()> {
        crate::utils::validate_port(self.port)?;
        if self.mode() != Mode::Local {
            return Ok(());
        }

        for &level in &self.clients.0 {
            crate::utils::validate_concurrency(level)?;
        }
        if self.time == 0 {
            anyhow::bail!("Duration must be greater than 0 seconds");
        }
        let uri = self.target()?;
        if let Some(bind) = self.bind {
            check_address_family(bind, uri.resolve()?)?;
        }
        Ok(())
    }

    /// The parsed target URI of local mode.
    pub fn target(&self) -> Result<TargetUri> {
        let uri = self
            .uri
            .as_deref()
            .context("A target URI is required, e.g. coap://127.0.0.1/test")?;
        Ok(TargetUri::parse(uri)?)
    }

    /// `host:port` of the controller for agent mode.
    pub fn master_endpoint(&self) -> String {
        if self.master_address.contains(':') && !self.master_address.starts_with('[') {
            format!("[{}]:{}", self.master_address, self.port)
        } else {
            format!("{}:{}", self.master_address, self.port)
        }
    }

    pub fn process_settings(&self) -> ProcessSettings {
        ProcessSettings {
            log_dir: self.log_dir.clone(),
            verbose: self.verbose > 0,
            ..Default::default()
        }
    }

    /// Manager configuration of local mode, reading the payload file.
    pub fn manager_settings(&self) -> Result<ManagerSettings> {
        let payload = match &self.payload_file {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read payload file {:?}", path))?
                    .into_bytes(),
            ),
            None => None,
        };
        Ok(ManagerSettings {
            uri: self.uri.as_deref().map(TargetUri::parse).transpose()?,
            bind: self.bind,
            method: self.method,
            payload,
            confirmable: !self.non,
            track_latency: self.latency,
            ..Default::default()
        })
    }
}

/// Parse `N` or `a,b,c` into concurrency levels.
pub fn parse_series(s: &str) -> Result<Series, String> {
    let levels = s
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<usize>()
                .map_err(|_| format!("Invalid concurrency level: {}", part))
                .and_then(|n| {
                    if n == 0 {
                        Err("Concurrency levels must be greater than 0".to_string())
                    } else {
                        Ok(n)
                    }
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if levels.is_empty() {
        return Err("At least one concurrency level is required".to_string());
    }
    Ok(Series(levels))
}

fn parse_method(s: &str) -> Result<Method, String> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_series() {
        assert_eq!(parse_series("10").unwrap(), Series(vec![10]));
        assert_eq!(parse_series("1, 10,100").unwrap(), Series(vec![1, 10, 100]));
        assert!(parse_series("").is_err());
        assert!(parse_series("1,0").is_err());
        assert!(parse_series("1,x").is_err());
    }

    #[test]
    fn test_local_mode_defaults() {
        let args = Args::parse_from(["coapbench", "coap://127.0.0.1/test"]);
        assert_eq!(args.mode(), Mode::Local);
        assert_eq!(args.clients, Series(vec![1]));
        assert_eq!(args.duration(), Duration::from_secs(crate::defaults::DEFAULT_TIME_SECS));
        assert_eq!(args.method, Method::Get);
        assert!(args.validate().is_ok());

        let settings = args.manager_settings().unwrap();
        assert!(settings.confirmable);
        assert!(!settings.track_latency);
        assert_eq!(settings.uri.unwrap().path(), "/test");
    }

    #[test]
    fn test_local_mode_flags() {
        let args = Args::parse_from([
            "coapbench", "-c", "1,5", "-t", "3", "--latency", "--non", "-m", "post", "-vv",
            "coap://127.0.0.1/test",
        ]);
        assert_eq!(args.clients, Series(vec![1, 5]));
        assert_eq!(args.method, Method::Post);
        assert_eq!(args.verbose, 2);
        let settings = args.manager_settings().unwrap();
        assert!(!settings.confirmable);
        assert!(settings.track_latency);
    }

    #[test]
    fn test_validation_failures() {
        assert!(Args::parse_from(["coapbench"]).validate().is_err());
        assert!(Args::parse_from(["coapbench", "http://h/x"]).validate().is_err());
        assert!(Args::parse_from(["coapbench", "-t", "0", "coap://127.0.0.1/x"]).validate().is_err());
        assert!(Args::parse_from(["coapbench", "-b", "::1", "coap://127.0.0.1/x"])
            .validate()
            .is_err());
        assert!(Args::parse_from(["coapbench", "--slave", "-p", "0"]).validate().is_err());
    }

    #[test]
    fn test_distributed_modes() {
        let args = Args::parse_from(["coapbench", "--master", "-p", "6000"]);
        assert_eq!(args.mode(), Mode::Master);
        assert!(args.validate().is_ok());

        let args = Args::parse_from(["coapbench", "--slave", "-a", "10.0.0.1"]);
        assert_eq!(args.mode(), Mode::Slave);
        assert_eq!(args.master_endpoint(), "10.0.0.1:58888");

        let args = Args::parse_from(["coapbench", "--slave", "-a", "::1", "-p", "7000"]);
        assert_eq!(args.master_endpoint(), "[::1]:7000");

        assert!(Args::try_parse_from(["coapbench", "--master", "--slave"]).is_err());
    }
}
