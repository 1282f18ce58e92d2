//! Command-line surface of the `agent-host` binary.

use anyhow::{Context, Result};
use clap::Parser;
use membership_core::AgentHostOptions;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "agent-host")]
#[command(about = "Cluster membership and agent hosting daemon")]
pub struct Args {
    /// YAML file with agent host options
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IP address to bind (overrides the config file)
    #[arg(short, long)]
    pub addr: Option<String>,

    /// Port to bind (overrides the config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Cluster environment (overrides the config file)
    #[arg(long)]
    pub env: Option<String>,

    /// Seed host to join through (repeatable)
    #[arg(short, long = "seed")]
    pub seeds: Vec<SocketAddr>,

    /// Agent to host once joined (repeatable)
    #[arg(long = "host-agent")]
    pub agents: Vec<String>,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

impl Args {
    /// Load the config file (if any) and apply CLI overrides.
    pub fn options(&self) -> Result<AgentHostOptions> {
        let mut options = match &self.config {
            Some(path) => AgentHostOptions::from_yaml_file(path)
                .with_context(|| format!("Failed to load config from {:?}", path))?,
            None => AgentHostOptions::default(),
        };

        if let Some(addr) = &self.addr {
            options.addr = addr.clone();
        }
        if let Some(port) = self.port {
            options.port = port;
        }
        if let Some(env) = &self.env {
            options.env = env.clone();
        }

        options.validate().context("Invalid agent host options")?;
        Ok(options)
    }

    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "debug,agent_host=debug"
        } else {
            "info,agent_host=info"
        }
    }
}
