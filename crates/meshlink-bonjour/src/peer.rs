//! A routing-engine peer carried over one TCP connection
//!
//! The connection may still be in flight when the peer is created: the conduit
//! is allocated up front and the pumps start once the connect future yields a
//! socket. A failed connect closes the peer, which releases the conduit and
//! runs the stop hook. End of stream only stops the reader; the link stays up
//! until a write fails or it is closed.

use std::future::Future;
use std::io;
use std::sync::Arc;

use meshlink_core::link::{pump_inbound, pump_outbound, EofPolicy, LinkCore};
use meshlink_core::{LinkId, PeerTransport, PeerType, RoutingEngine, StopHook};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::Result;

#[derive(Debug)]
pub struct NetworkPeer {
    endpoint: Endpoint,
    core: Arc<LinkCore>,
}

impl NetworkPeer {
    /// Allocate a conduit for `endpoint` and drive `connection` to a socket.
    pub fn spawn<C, S>(
        engine: &dyn RoutingEngine,
        endpoint: Endpoint,
        connection: C,
        max_frame_size: usize,
        when_stopped: StopHook,
    ) -> Result<Arc<Self>>
    where
        C: Future<Output = io::Result<S>> + Send + 'static,
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let core = Arc::new(LinkCore::new(
            engine,
            endpoint.to_string(),
            PeerType::Bonjour,
            when_stopped,
        )?);
        debug!("Created network peering {} for {}", core.id(), endpoint);

        let task_core = core.clone();
        let task_endpoint = endpoint.clone();
        tokio::spawn(async move {
            let stream = tokio::select! {
                _ = task_core.stopped() => return,
                connected = connection => connected,
            };

            match stream {
                Ok(stream) => {
                    if !task_core.mark_open() {
                        return;
                    }
                    info!("Network peering with {} is ready", task_endpoint);
                    let (reader, writer) = tokio::io::split(stream);
                    tokio::spawn(pump_inbound(
                        task_core.clone(),
                        reader,
                        max_frame_size,
                        EofPolicy::Idle,
                    ));
                    pump_outbound(task_core, writer).await;
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", task_endpoint, e);
                    task_core.close();
                }
            }
        });

        Ok(Arc::new(Self { endpoint, core }))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl PeerTransport for NetworkPeer {
    fn link_id(&self) -> LinkId {
        self.core.id()
    }

    fn peer_type(&self) -> PeerType {
        PeerType::Bonjour
    }

    fn zone(&self) -> &str {
        self.core.zone()
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn close(&self) {
        if self.core.close() {
            info!("Closing connection: {}", self.endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_core::{MemoryEngine, PublicKey};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn engine() -> MemoryEngine {
        let engine = MemoryEngine::new(PublicKey::new("ab"));
        engine.start().unwrap();
        engine
    }

    fn counting_hook() -> (Arc<AtomicUsize>, StopHook) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let hook: StopHook = Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (calls, hook)
    }

    fn endpoint() -> Endpoint {
        Endpoint::service("peer._pinecone._tcp.local.")
    }

    #[tokio::test]
    async fn test_ready_connection_bridges_both_ways() {
        let engine = engine();
        let (local, mut remote) = tokio::io::duplex(1024);
        let (_, hook) = counting_hook();
        let peer = NetworkPeer::spawn(
            &engine,
            endpoint(),
            async move { Ok(local) },
            1024,
            hook,
        )
        .unwrap();

        remote.write_all(b"inbound").await.unwrap();
        let conduit = engine.conduits()[0].clone();
        assert_eq!(conduit.wait_for_bytes(7).await, b"inbound");
        assert_eq!(conduit.zone(), "peer._pinecone._tcp.local.");
        assert!(peer.is_open());

        conduit.inject(b"outbound".to_vec());
        let mut buf = [0u8; 8];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"outbound");
    }

    #[tokio::test]
    async fn test_failed_connect_releases_conduit() {
        let engine = engine();
        let (calls, hook) = counting_hook();
        let peer = NetworkPeer::spawn(
            &engine,
            endpoint(),
            async {
                Err::<tokio::io::DuplexStream, _>(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "refused",
                ))
            },
            1024,
            hook,
        )
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!peer.is_open());
        assert!(engine.conduits()[0].is_closed());
    }

    #[tokio::test]
    async fn test_close_before_ready_stops_connecting() {
        let engine = engine();
        let (calls, hook) = counting_hook();
        let peer = NetworkPeer::spawn(
            &engine,
            endpoint(),
            futures::future::pending::<io::Result<tokio::io::DuplexStream>>(),
            1024,
            hook,
        )
        .unwrap();

        peer.close();
        peer.close();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(engine.conduits()[0].is_closed());
    }

    #[tokio::test]
    async fn test_end_of_stream_leaves_link_up() {
        let engine = engine();
        let mock = tokio_test::io::Builder::new().read(b"hello").build();
        let (calls, hook) = counting_hook();
        let peer =
            NetworkPeer::spawn(&engine, endpoint(), async move { Ok(mock) }, 1024, hook).unwrap();

        let conduit = engine.conduits()[0].clone();
        assert_eq!(conduit.wait_for_bytes(5).await, b"hello");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(peer.is_open());
        assert!(!conduit.is_closed());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        peer.close();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_conduit_refusal_fails_construction() {
        let engine = engine();
        engine.fail_conduits(true);
        let (calls, hook) = counting_hook();
        let result = NetworkPeer::spawn(
            &engine,
            endpoint(),
            futures::future::pending::<io::Result<tokio::io::DuplexStream>>(),
            1024,
            hook,
        );
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
