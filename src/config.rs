use anyhow::{Context, bail};
use std::net::SocketAddr;
use std::time::Duration;

use crate::membership::reconciler::{DEFAULT_STATE_TIMEOUT, ReconcilerConfig};
use crate::transport::cluster::{ClusterConfig, DEFAULT_JOIN_TIMEOUT};

pub const DEFAULT_GROUP: &str = "replicated-map";

/// Node settings taken from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub bind: SocketAddr,
    pub seeds: Vec<SocketAddr>,
    pub group: String,
    pub state_timeout: Duration,
    pub join_timeout: Duration,
    pub verbose: bool,
}

impl NodeConfig {
    /// Parses `args` as passed to the process, program name first.
    pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
        let mut bind: Option<SocketAddr> = None;
        let mut seeds: Vec<SocketAddr> = vec![];
        let mut group = DEFAULT_GROUP.to_string();
        let mut state_timeout = DEFAULT_STATE_TIMEOUT;
        let mut join_timeout = DEFAULT_JOIN_TIMEOUT;
        let mut verbose = false;

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--verbose" => {
                    verbose = true;
                    i += 1;
                    continue;
                }
                "--bind" | "--seed" | "--group" | "--state-timeout-ms" | "--join-timeout-ms" => {}
                other => bail!("unknown argument: {}", other),
            }

            let value = args
                .get(i + 1)
                .with_context(|| format!("{} needs a value", flag))?;
            match flag {
                "--bind" => {
                    bind = Some(parse_addr(flag, value)?);
                }
                "--seed" => {
                    seeds.push(parse_addr(flag, value)?);
                }
                "--group" => {
                    if value.is_empty() {
                        bail!("--group must not be empty");
                    }
                    group = value.clone();
                }
                "--state-timeout-ms" => {
                    state_timeout = parse_millis(flag, value)?;
                }
                _ => {
                    join_timeout = parse_millis(flag, value)?;
                }
            }
            i += 2;
        }

        let bind = bind.context("--bind is required")?;

        Ok(Self {
            bind,
            seeds,
            group,
            state_timeout,
            join_timeout,
            verbose,
        })
    }

    pub fn usage(program: &str) -> String {
        format!(
            "Usage: {program} --bind <addr:port> [--seed <addr:port>]... [--group <name>]\n\
             \x20      [--state-timeout-ms <n>] [--join-timeout-ms <n>] [--verbose]\n\
             Example: {program} --bind 127.0.0.1:5000\n\
             Example: {program} --bind 127.0.0.1:5001 --seed 127.0.0.1:5000"
        )
    }

    pub fn cluster(&self) -> ClusterConfig {
        ClusterConfig {
            bind: self.bind,
            seeds: self.seeds.clone(),
            join_timeout: self.join_timeout,
            discard_own_messages: true,
        }
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            state_timeout: self.state_timeout,
        }
    }
}

fn parse_addr(flag: &str, value: &str) -> anyhow::Result<SocketAddr> {
    value
        .parse()
        .with_context(|| format!("{} expects <addr:port>, got '{}'", flag, value))
}

fn parse_millis(flag: &str, value: &str) -> anyhow::Result<Duration> {
    let millis: u64 = value
        .parse()
        .with_context(|| format!("{} expects milliseconds, got '{}'", flag, value))?;
    if millis == 0 {
        bail!("{} must be greater than zero", flag);
    }
    Ok(Duration::from_millis(millis))
}
