//! agent-host: joins a cluster, hosts agents and reports membership changes.

use agent_host::AgentHost;
use agent_host::cli::Args;
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let options = args.options()?;
    info!("Starting agent-host");
    info!("Environment: {}", options.env);
    info!("Bind address: {}:{}", options.addr, options.port);

    let host = AgentHost::start(options)
        .await
        .context("Failed to start agent host")?;
    info!("Local endpoint: {}", host.local());

    if !args.seeds.is_empty() {
        info!("Joining via {:?}", args.seeds);
        host.join(args.seeds.iter().copied())
            .await
            .context("Failed to join cluster")?;
    }

    let mut agents = Vec::new();
    for agent_id in &args.agents {
        match host.host(agent_id).await {
            Ok(agent) => agents.push(agent),
            Err(e) => error!("Failed to host {}: {}", agent_id, e),
        }
    }

    let mut membership = host.membership();
    let mut landscape = host.landscape();

    info!("Agent host running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            result = membership.changed() => {
                if result.is_err() {
                    break;
                }
                let members = membership.borrow_and_update().clone();
                info!("Membership ({}):", members.len());
                for (endpoint, tags) in &members {
                    info!("  {} {:?}", endpoint, tags);
                }
            }

            result = landscape.changed() => {
                if result.is_err() {
                    break;
                }
                let view = landscape.borrow_and_update().clone();
                for (agent, hosts) in &view {
                    let hosts: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
                    info!("Agent {} hosted on {}", agent, hosts.join(", "));
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    drop(agents);
    host.close().await;
    Ok(())
}
