//! Datagram transport between agent hosts.
//!
//! Implementations:
//! - [`UdpTransport`]: tokio UDP socket
//! - [`MemoryNetwork`] / [`MemoryTransport`]: in-process network for tests,
//!   with simulated loss and node kills

use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Receive buffer large enough for any UDP datagram.
const RECV_BUFFER_SIZE: usize = 65_536;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport is shut down")]
    Closed,

    #[error("Address already bound: {0}")]
    AddrInUse(SocketAddr),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Whether the caller wants the transport to try harder to deliver.
///
/// Datagram transports accept both; the memory transport never drops
/// `Reliable` sends when simulating loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    BestEffort,
    Reliable,
}

/// Unreliable, unordered datagram transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address we're bound to (the real port if 0 was requested).
    fn local_addr(&self) -> SocketAddr;

    /// Hand one payload to the network. `Ok` means accepted, not delivered.
    async fn send(&self, payload: &[u8], dest: SocketAddr, delivery: Delivery) -> Result<()>;

    /// Next inbound payload and its source. Fails with `Closed` after shutdown.
    async fn recv(&self) -> Result<(Vec<u8>, SocketAddr)>;

    /// Release the bound address. Idempotent.
    async fn shutdown(&self);
}

// ==================== UDP ====================

pub struct UdpTransport {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    closed: watch::Sender<bool>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let (closed, _) = watch::channel(false);
        debug!("UDP transport bound to {}", local_addr);

        Ok(Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            local_addr,
            closed,
        })
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send(&self, payload: &[u8], dest: SocketAddr, _delivery: Delivery) -> Result<()> {
        let socket = self.socket()?;
        socket.send_to(payload, dest).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<(Vec<u8>, SocketAddr)> {
        let socket = self.socket()?;
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (len, from) = result?;
                buf.truncate(len);
                Ok((buf, from))
            }
            _ = closed.changed() => Err(TransportError::Closed),
        }
    }

    async fn shutdown(&self) {
        let socket = self.socket.lock().unwrap_or_else(|e| e.into_inner()).take();
        if socket.is_some() {
            self.closed.send_replace(true);
            debug!("UDP transport {} shut down", self.local_addr);
        }
    }
}

// ==================== In-Memory ====================

type Datagram = (Vec<u8>, SocketAddr);

#[derive(Default)]
struct NetworkState {
    routes: HashMap<SocketAddr, (u64, mpsc::UnboundedSender<Datagram>)>,
    killed: HashSet<SocketAddr>,
    next_port: u16,
    next_binding: u64,
    loss: f64,
}

/// An in-process datagram network.
///
/// Cheap to clone; all clones share the same routes.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind `ip:port`; port 0 picks a free port.
    pub fn bind(&self, ip: IpAddr, port: u16) -> Result<MemoryTransport> {
        let mut state = self.lock();

        let addr = if port == 0 {
            loop {
                state.next_port = state.next_port.max(20_000).wrapping_add(1);
                let candidate = SocketAddr::new(ip, state.next_port);
                if !state.routes.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            SocketAddr::new(ip, port)
        };

        if state.routes.contains_key(&addr) {
            return Err(TransportError::AddrInUse(addr));
        }

        state.next_binding += 1;
        let binding = state.next_binding;
        let (tx, rx) = mpsc::unbounded_channel();
        state.routes.insert(addr, (binding, tx));
        let (closed, _) = watch::channel(false);

        Ok(MemoryTransport {
            network: self.clone(),
            addr,
            binding,
            inbox: tokio::sync::Mutex::new(rx),
            closed,
        })
    }

    /// Drop all traffic to and from `addr` until revived.
    pub fn kill(&self, addr: SocketAddr) {
        self.lock().killed.insert(addr);
    }

    pub fn revive(&self, addr: SocketAddr) {
        self.lock().killed.remove(&addr);
    }

    /// Probability in `[0, 1]` of dropping a best-effort datagram.
    pub fn set_loss(&self, loss: f64) {
        self.lock().loss = loss.clamp(0.0, 1.0);
    }

    fn deliver(&self, payload: &[u8], from: SocketAddr, dest: SocketAddr, delivery: Delivery) {
        let state = self.lock();
        if state.killed.contains(&from) || state.killed.contains(&dest) {
            return;
        }
        if delivery == Delivery::BestEffort
            && state.loss > 0.0
            && rand::rng().random_bool(state.loss)
        {
            return;
        }
        if let Some((_, tx)) = state.routes.get(&dest) {
            let _ = tx.send((payload.to_vec(), from));
        }
    }

    fn unbind(&self, addr: SocketAddr, binding: u64) {
        let mut state = self.lock();
        if matches!(state.routes.get(&addr), Some((b, _)) if *b == binding) {
            state.routes.remove(&addr);
        }
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    addr: SocketAddr,
    binding: u64,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send(&self, payload: &[u8], dest: SocketAddr, delivery: Delivery) -> Result<()> {
        if *self.closed.borrow() {
            return Err(TransportError::Closed);
        }
        self.network.deliver(payload, self.addr, dest, delivery);
        Ok(())
    }

    async fn recv(&self) -> Result<(Vec<u8>, SocketAddr)> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }

        let mut inbox = self.inbox.lock().await;
        tokio::select! {
            datagram = inbox.recv() => datagram.ok_or(TransportError::Closed),
            _ = closed.changed() => Err(TransportError::Closed),
        }
    }

    async fn shutdown(&self) {
        if !self.closed.send_replace(true) {
            self.network.unbind(self.addr, self.binding);
            debug!("Memory transport {} shut down", self.addr);
        }
    }
}
