//! AgentHost: the public facade over one cluster member.
//!
//! Lifecycle: `Init → Starting → Started → Stopping → Shutdown`.
//! `host`/`stop_hosting`/`join` are only allowed while started. `close` is
//! idempotent; concurrent callers all return once `Shutdown` is reached.

use crate::agent::Agent;
use crate::error::{HostError, Result};
use crate::messenger::Messenger;
use crate::scheduler::{Command, Scheduler, Views};
use crate::transport::{Transport, UdpTransport};
use membership_core::endpoint::next_incarnation;
use membership_core::{
    AgentHostOptions, AutoDropper, DetectorConfig, EndpointResolver, Envelope, FailureDetector,
    HostEndpoint, HostMemberList, Landscape, MemberSelector, Members, ReplicaId,
};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Commands queued between the facade and the scheduler.
const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Init,
    Starting,
    Started,
    Stopping,
    Shutdown,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostState::Init => "init",
            HostState::Starting => "starting",
            HostState::Started => "started",
            HostState::Stopping => "stopping",
            HostState::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

struct Inner {
    env: String,
    state: watch::Sender<HostState>,
    commands: mpsc::Sender<Command>,
    local: watch::Receiver<HostEndpoint>,
    members: watch::Receiver<Members>,
    landscape: watch::Receiver<Landscape>,
    observers: broadcast::Sender<Envelope>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running agent host. Cheap to clone.
#[derive(Clone)]
pub struct AgentHost {
    inner: Arc<Inner>,
}

impl AgentHost {
    /// Bind a UDP socket on `options.addr:options.port` and start.
    pub async fn start(options: AgentHostOptions) -> Result<Self> {
        let bind_addr = options.bind_addr()?;
        let transport = UdpTransport::bind(bind_addr).await?;
        Self::start_with_transport(options, Arc::new(transport)).await
    }

    /// Start on an already bound transport.
    pub async fn start_with_transport(
        options: AgentHostOptions,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        if let Err(e) = options.validate() {
            transport.shutdown().await;
            return Err(e.into());
        }

        let (state, _) = watch::channel(HostState::Init);
        state.send_replace(HostState::Starting);

        let bound = transport.local_addr();
        let local = HostEndpoint::new(options.addr.clone(), bound.port(), next_incarnation(0));
        let tags: BTreeSet<String> = [
            format!("env={}", options.env),
            format!("addr={}", local.host_port()),
        ]
        .into_iter()
        .collect();

        let replica = ReplicaId::generate();
        let members = match HostMemberList::new(local.clone(), tags, replica) {
            Ok(members) => members,
            Err(e) => {
                transport.shutdown().await;
                return Err(e.into());
            }
        };

        let mut messenger = Messenger::new(&options, local.clone(), replica, transport);
        let observers = messenger.observers();
        let inbound = messenger.start();

        let selector = MemberSelector::new(Arc::new(EndpointResolver));
        let detector = FailureDetector::new(DetectorConfig::from(&options), local.clone());
        let dropper = AutoDropper::new(detector);

        let (local_tx, local_rx) = watch::channel(local.clone());
        let (members_tx, members_rx) = watch::channel(Members::new());
        let (landscape_tx, landscape_rx) = watch::channel(Landscape::new());
        let views = Views {
            local: local_tx,
            members: members_tx,
            landscape: landscape_tx,
        };

        let env = options.env.clone();
        let scheduler = Scheduler::new(options, messenger, members, selector, dropper, views);
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(scheduler.run(command_rx, inbound));

        state.send_replace(HostState::Started);
        info!("Agent host {} started in env '{}' on {}", local, env, bound);

        Ok(Self {
            inner: Arc::new(Inner {
                env,
                state,
                commands,
                local: local_rx,
                members: members_rx,
                landscape: landscape_rx,
                observers,
                task: Mutex::new(Some(task)),
            }),
        })
    }

    pub fn env(&self) -> &str {
        &self.inner.env
    }

    pub fn state(&self) -> HostState {
        *self.inner.state.borrow()
    }

    /// Our current endpoint (changes if we are evicted and reincarnate).
    pub fn local(&self) -> HostEndpoint {
        self.inner.local.borrow().clone()
    }

    /// Live view of the membership.
    pub fn membership(&self) -> watch::Receiver<Members> {
        self.inner.members.clone()
    }

    /// Live view of which endpoints host which agents.
    pub fn landscape(&self) -> watch::Receiver<Landscape> {
        self.inner.landscape.clone()
    }

    /// Every inbound envelope accepted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inner.observers.subscribe()
    }

    /// Join the cluster through `seeds`.
    ///
    /// Completes on the first seed reply; retries until then. Concurrent
    /// joins share one attempt.
    pub async fn join(&self, seeds: impl IntoIterator<Item = SocketAddr>) -> Result<()> {
        self.require_started()?;
        let seeds = seeds.into_iter().collect();
        self.request(|reply| Command::Join { seeds, reply }).await?
    }

    /// Announce that this host runs `agent_id`.
    pub async fn host(&self, agent_id: &str) -> Result<Agent> {
        self.require_started()?;
        let agent = agent_id.to_string();
        self.request(|reply| Command::Host { agent, reply }).await??;

        Ok(Agent::new(
            agent_id,
            self.inner.local.clone(),
            self.inner.landscape.clone(),
        ))
    }

    pub async fn stop_hosting(&self, agent_id: &str) -> Result<()> {
        self.require_started()?;
        let agent = agent_id.to_string();
        self.request(|reply| Command::StopHosting { agent, reply })
            .await?
    }

    /// Leave the cluster and release the transport.
    pub async fn close(&self) {
        let won = self.inner.state.send_if_modified(|state| {
            if *state == HostState::Started {
                *state = HostState::Stopping;
                true
            } else {
                false
            }
        });

        if !won {
            let mut state = self.inner.state.subscribe();
            let _ = state.wait_for(|s| *s == HostState::Shutdown).await;
            return;
        }

        let (reply, done) = oneshot::channel();
        if self.inner.commands.send(Command::Stop { reply }).await.is_err() {
            warn!("Scheduler already gone during close");
        } else if done.await.is_err() {
            warn!("Scheduler exited before acknowledging close");
        }

        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Scheduler task failed: {}", e);
            }
        }

        self.inner.state.send_replace(HostState::Shutdown);
        info!("Agent host {} shut down", self.local());
    }

    fn require_started(&self) -> Result<()> {
        match self.state() {
            HostState::Started => Ok(()),
            state => Err(HostError::IllegalState(state)),
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.inner
            .commands
            .send(command(reply))
            .await
            .map_err(|_| HostError::Closed)?;
        response.await.map_err(|_| HostError::Closed)
    }
}
