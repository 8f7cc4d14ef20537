//! One enabled period of the local-network transport
//!
//! A session owns the TCP listener, the service announcement, the browse
//! subscription and the map of live peers keyed by endpoint. All of it lives
//! in a single task, so listener and browser events are handled in order and
//! the map needs no lock.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use meshlink_core::{BonjourConfig, LinkId, PeerTransport, PublicKey, RoutingEngine};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::discovery::{BrowseEvent, BrowseResult, ServiceDiscovery, ServiceRecord};
use crate::endpoint::Endpoint;
use crate::error::{BonjourError, Result};
use crate::peer::NetworkPeer;

/// Key characters used as the announced instance name
pub const INSTANCE_KEY_CHARS: usize = 16;

enum Command {
    PeerStopped { endpoint: Endpoint, link: LinkId },
    Endpoints(oneshot::Sender<Vec<Endpoint>>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running local-network session
pub struct BonjourSession {
    local_addr: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BonjourSession {
    /// Listen, announce and browse; returns once all three are in place.
    ///
    /// The instance name is a key prefix; the full key travels in the TXT
    /// record. Reads from peers are cut at `max_frame_size` bytes.
    pub async fn start(
        engine: Arc<dyn RoutingEngine>,
        discovery: Arc<dyn ServiceDiscovery>,
        config: &BonjourConfig,
        max_frame_size: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let key = engine.public_key();

        let instance = key.truncated(INSTANCE_KEY_CHARS);
        let record = ServiceRecord::new(&config.service_type, instance.as_str(), local_addr.port())
            .with_txt(&config.txt_key, key.as_str());
        discovery.register(&record)?;

        let browse = match discovery.browse(&config.service_type) {
            Ok(browse) => browse,
            Err(e) => {
                if let Err(unregister) = discovery.unregister(&record) {
                    debug!("Ignoring unregister failure: {}", unregister);
                }
                return Err(e);
            }
        };

        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = SessionTask {
            engine,
            discovery,
            record,
            local_key: key,
            txt_key: config.txt_key.clone(),
            max_frame_size,
            peers: HashMap::new(),
            commands: commands.clone(),
        };
        info!("Bonjour session listening on {}", local_addr);
        let handle = tokio::spawn(task.run(listener, browse, command_rx));

        Ok(Self {
            local_addr,
            commands,
            task: Mutex::new(Some(handle)),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Endpoints with a tracked peer
    pub async fn endpoints(&self) -> Result<Vec<Endpoint>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Endpoints(tx))
            .map_err(|_| BonjourError::SessionClosed)?;
        rx.await.map_err(|_| BonjourError::SessionClosed)
    }

    /// Withdraw the announcement, stop browsing and close every peer.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Bonjour session task failed: {}", e);
            }
        }
    }
}

impl Drop for BonjourSession {
    fn drop(&mut self) {
        let (tx, _) = oneshot::channel();
        let _ = self.commands.send(Command::Shutdown(tx));
    }
}

// ----------------------------------------------------------------------------
// Session Task
// ----------------------------------------------------------------------------

struct SessionTask {
    engine: Arc<dyn RoutingEngine>,
    discovery: Arc<dyn ServiceDiscovery>,
    record: ServiceRecord,
    local_key: PublicKey,
    txt_key: String,
    max_frame_size: usize,
    peers: HashMap<Endpoint, Arc<NetworkPeer>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionTask {
    async fn run(
        mut self,
        listener: TcpListener,
        mut browse: mpsc::UnboundedReceiver<BrowseEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut browsing = true;
        let ack = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => self.on_inbound(stream, remote),
                    Err(e) => warn!("Accept failed: {}", e),
                },
                event = browse.recv(), if browsing => match event {
                    Some(BrowseEvent::Resolved(result)) => self.on_resolved(result),
                    Some(BrowseEvent::Removed(endpoint)) => {
                        debug!("Service {} went away", endpoint);
                    }
                    None => {
                        warn!("Browse subscription ended");
                        browsing = false;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::PeerStopped { endpoint, link }) => self.on_peer_stopped(endpoint, link),
                    Some(Command::Endpoints(reply)) => {
                        let _ = reply.send(self.peers.keys().cloned().collect());
                    }
                    Some(Command::Shutdown(reply)) => break Some(reply),
                    None => break None,
                },
            }
        };

        self.tear_down();
        drop(listener);
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    fn on_inbound(&mut self, stream: TcpStream, remote: SocketAddr) {
        let endpoint = Endpoint::Address(remote);
        if let Some(existing) = self.peers.remove(&endpoint) {
            debug!("Replacing peering for {}", endpoint);
            existing.close();
        }

        match self.spawn_peer(endpoint.clone(), async move { Ok(stream) }) {
            Ok(peer) => {
                self.peers.insert(endpoint.clone(), peer);
                info!("Inbound endpoint connected: {}", endpoint);
            }
            Err(e) => warn!("Failed to create peering: {}", e),
        }
    }

    fn on_resolved(&mut self, result: BrowseResult) {
        let Some(key) = result.txt_value(&self.txt_key) else {
            debug!("Ignoring {} without a {} record", result.endpoint, self.txt_key);
            return;
        };
        if PublicKey::new(key).cmp_ignore_case(&self.local_key).is_eq() {
            return;
        }
        if !result.endpoint.is_service() || self.peers.contains_key(&result.endpoint) {
            return;
        }

        let endpoint = result.endpoint.clone();
        let addrs = result.addrs;
        let target = endpoint.clone();
        match self.spawn_peer(endpoint.clone(), connect_any(target, addrs)) {
            Ok(peer) => {
                self.peers.insert(endpoint.clone(), peer);
                info!("Outbound endpoint connected: {}", endpoint);
            }
            Err(e) => warn!("Failed to create peering: {}", e),
        }
    }

    fn on_peer_stopped(&mut self, endpoint: Endpoint, link: LinkId) {
        let current = self
            .peers
            .get(&endpoint)
            .map_or(false, |peer| peer.link_id() == link);
        if current {
            self.peers.remove(&endpoint);
            info!("Endpoint disconnected: {}", endpoint);
        }
    }

    fn spawn_peer<C, S>(&self, endpoint: Endpoint, connection: C) -> Result<Arc<NetworkPeer>>
    where
        C: std::future::Future<Output = io::Result<S>> + Send + 'static,
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let commands = self.commands.clone();
        let stopped = endpoint.clone();
        NetworkPeer::spawn(
            self.engine.as_ref(),
            endpoint,
            connection,
            self.max_frame_size,
            Box::new(move |link| {
                let _ = commands.send(Command::PeerStopped {
                    endpoint: stopped,
                    link,
                });
            }),
        )
    }

    fn tear_down(&mut self) {
        if let Err(e) = self.discovery.stop_browse(&self.record.service_type) {
            debug!("Ignoring stop browse failure: {}", e);
        }
        if let Err(e) = self.discovery.unregister(&self.record) {
            error!("Failed to withdraw {}: {}", self.record.fullname(), e);
        }
        let peers: Vec<_> = self.peers.drain().map(|(_, peer)| peer).collect();
        info!("Bonjour session stopping, closing {} peerings", peers.len());
        for peer in peers {
            peer.close();
        }
    }
}

/// Dial the resolved addresses in order until one accepts.
async fn connect_any(endpoint: Endpoint, addrs: Vec<SocketAddr>) -> io::Result<TcpStream> {
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", endpoint, e);
                }
                return Ok(stream);
            }
            Err(e) => {
                debug!("Connecting to {} via {} failed: {}", endpoint, addr, e);
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            BonjourError::Unreachable {
                endpoint: endpoint.to_string(),
            }
            .to_string(),
        )
    }))
}
