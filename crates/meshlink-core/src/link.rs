//! Peer transport bookkeeping shared by the BLE and network links
//!
//! Every transport owns a [`LinkCore`]: the engine conduit it pumps, its
//! `pending -> open -> closed` lifecycle and the one-shot `when_stopped` hook.
//! Closing is idempotent and the hook fires exactly once, however many tasks
//! race to close the link.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::engine::{Conduit, RoutingEngine};
use crate::errors::EngineError;
use crate::types::{LinkId, PeerType};

/// Callback run once after a transport has stopped, given the stopped link's id
pub type StopHook = Box<dyn FnOnce(LinkId) + Send + 'static>;

/// Uniform view of a live peer connection
pub trait PeerTransport: Send + Sync + fmt::Debug {
    fn link_id(&self) -> LinkId;
    fn peer_type(&self) -> PeerType;
    fn zone(&self) -> &str;
    fn is_open(&self) -> bool;

    /// Tear the link down. Safe to call repeatedly and from any task.
    fn close(&self);
}

// ----------------------------------------------------------------------------
// Link State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Pending,
    Open,
    Closed,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LinkState::Pending,
            1 => LinkState::Open,
            _ => LinkState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LinkState::Pending => 0,
            LinkState::Open => 1,
            LinkState::Closed => 2,
        }
    }
}

/// What an inbound pump does when the socket reports end of stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EofPolicy {
    /// Treat EOF as a dead link
    Close,
    /// Stop reading but leave the link up
    Idle,
}

pub struct LinkCore {
    id: LinkId,
    zone: String,
    peer_type: PeerType,
    conduit: Arc<dyn Conduit>,
    state: AtomicU8,
    when_stopped: Mutex<Option<StopHook>>,
    shutdown: watch::Sender<bool>,
}

impl LinkCore {
    /// Allocate a conduit from `engine` and start in the pending state.
    pub fn new(
        engine: &dyn RoutingEngine,
        zone: impl Into<String>,
        peer_type: PeerType,
        when_stopped: StopHook,
    ) -> Result<Self, EngineError> {
        let zone = zone.into();
        let conduit = engine.conduit(&zone, peer_type)?;
        let (shutdown, _) = watch::channel(false);
        let id = LinkId::next();
        debug!("Allocated {} for {} peer in zone {}", id, peer_type, zone);

        Ok(Self {
            id,
            zone,
            peer_type,
            conduit,
            state: AtomicU8::new(LinkState::Pending.as_u8()),
            when_stopped: Mutex::new(Some(when_stopped)),
            shutdown,
        })
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn peer_type(&self) -> PeerType {
        self.peer_type
    }

    pub fn conduit(&self) -> Arc<dyn Conduit> {
        self.conduit.clone()
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == LinkState::Closed
    }

    /// Move from pending to open. Returns false if the link was already
    /// opened or closed.
    pub fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                LinkState::Pending.as_u8(),
                LinkState::Open.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Close the conduit, wake the pumps and run the stop hook. Returns true
    /// only for the call that actually performed the close.
    pub fn close(&self) -> bool {
        let previous = self.state.swap(LinkState::Closed.as_u8(), Ordering::SeqCst);
        if previous == LinkState::Closed.as_u8() {
            return false;
        }

        if let Err(e) = self.conduit.close() {
            warn!("Failed to close conduit for {}: {}", self.id, e);
        }
        self.shutdown.send_replace(true);

        let hook = self
            .when_stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook(self.id);
        }
        debug!("Closed {} ({} peer, zone {})", self.id, self.peer_type, self.zone);
        true
    }

    /// Resolves once the link has been closed.
    pub async fn stopped(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for LinkCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkCore")
            .field("id", &self.id)
            .field("zone", &self.zone)
            .field("peer_type", &self.peer_type)
            .field("state", &self.state())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Conduit Pumping
// ----------------------------------------------------------------------------

fn join_failure(err: tokio::task::JoinError) -> EngineError {
    EngineError::Internal(format!("conduit task failed: {}", err))
}

/// Write into the conduit from a blocking-capable thread.
pub async fn conduit_write(conduit: Arc<dyn Conduit>, bytes: Vec<u8>) -> Result<usize, EngineError> {
    tokio::task::spawn_blocking(move || conduit.write(&bytes))
        .await
        .map_err(join_failure)?
}

/// Wait for the next outbound frame on a blocking-capable thread.
pub async fn conduit_read(conduit: Arc<dyn Conduit>) -> Result<Vec<u8>, EngineError> {
    tokio::task::spawn_blocking(move || conduit.read_copy())
        .await
        .map_err(join_failure)?
}

/// Copy socket bytes into the conduit until the link closes.
///
/// Read errors and conduit write failures close the link; EOF is handled per
/// `on_eof`.
pub async fn pump_inbound<R>(core: Arc<LinkCore>, mut reader: R, max_frame: usize, on_eof: EofPolicy)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; max_frame];
    loop {
        let read = tokio::select! {
            _ = core.stopped() => return,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                debug!("{} reached end of stream", core.id());
                if on_eof == EofPolicy::Close {
                    core.close();
                }
                return;
            }
            Ok(n) => {
                if let Err(e) = conduit_write(core.conduit(), buf[..n].to_vec()).await {
                    warn!("Conduit write failed on {}: {}", core.id(), e);
                    core.close();
                    return;
                }
            }
            Err(e) => {
                warn!("Read failed on {}: {}", core.id(), e);
                core.close();
                return;
            }
        }
    }
}

/// Copy conduit frames onto the socket until the link closes.
///
/// Any conduit or socket error closes the link. The writer is shut down on
/// the way out.
pub async fn pump_outbound<W>(core: Arc<LinkCore>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = core.stopped() => break,
            frame = conduit_read(core.conduit()) => frame,
        };

        let result: io::Result<()> = match frame {
            Ok(frame) => writer.write_all(&frame).await,
            Err(EngineError::ConduitClosed) => {
                debug!("Conduit for {} closed", core.id());
                core.close();
                break;
            }
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        };

        if let Err(e) = result {
            warn!("Write failed on {}: {}", core.id(), e);
            core.close();
            break;
        }
    }

    let _ = writer.shutdown().await;
}
