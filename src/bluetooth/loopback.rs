// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! In-memory transport.
//!
//! Peers are scripted through the methods on [`LoopbackTransport`]; opened
//! channels are `tokio::io::duplex` pairs whose far ends are handed out by
//! [`LoopbackTransport::next_remote`].

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::debug;
use uuid::Uuid;

use super::transport::{
    Acceptor, ByteStream, PeerEvent, PeerIdentity, RemotePeer, ServiceRecord, Transport,
};
use crate::error::TransportError;

const DUPLEX_CAPACITY: usize = 64 * 1024;

/// How a scripted peer responds to service lookup and channel opening.
#[derive(Debug, Clone, Default)]
pub enum ChannelBehavior {
    /// Open a working channel.
    #[default]
    Accept,
    /// Open the channel only after the notify fires.
    Hold(Arc<Notify>),
    /// Service lookup succeeds but opening the channel fails.
    Refuse,
    /// The peer offers no serial port service.
    NoService,
    /// The peer cannot be reached.
    Unreachable,
    /// The platform denies access to the peer.
    Denied,
    /// Channel opens, every read fails.
    FailingReads,
    /// Channel opens, every write fails.
    FailingWrites,
}

#[derive(Debug, Clone)]
struct LoopbackPeer {
    identity: PeerIdentity,
    resolvable: bool,
    behavior: ChannelBehavior,
}

#[derive(Default)]
struct LoopbackState {
    peers: HashMap<String, LoopbackPeer>,
    watchers: Vec<mpsc::UnboundedSender<PeerEvent>>,
    inbound: Option<mpsc::UnboundedSender<(ByteStream, RemotePeer)>>,
    advertise_denied: bool,
}

/// Scriptable in-memory [`Transport`].
pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
    remotes_tx: mpsc::UnboundedSender<DuplexStream>,
    remotes_rx: AsyncMutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        let (remotes_tx, remotes_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(LoopbackState::default()),
            remotes_tx,
            remotes_rx: AsyncMutex::new(remotes_rx),
        }
    }

    /// Make a peer visible and announce it to watchers.
    pub fn add_peer(&self, identity: PeerIdentity) {
        self.insert_peer(identity, true);
    }

    /// Announce a peer whose identity lookup will fail.
    pub fn add_unresolvable_peer(&self, id: &str) {
        self.insert_peer(
            PeerIdentity {
                id: id.to_string(),
                ..Default::default()
            },
            false,
        );
    }

    fn insert_peer(&self, identity: PeerIdentity, resolvable: bool) {
        let id = identity.id.clone();
        let mut state = self.state.lock();
        state.peers.insert(
            id.clone(),
            LoopbackPeer {
                identity,
                resolvable,
                behavior: ChannelBehavior::Accept,
            },
        );
        Self::announce(&mut state, PeerEvent::Added(id));
    }

    /// Make a peer disappear and announce it to watchers.
    pub fn remove_peer(&self, id: &str) {
        let mut state = self.state.lock();
        state.peers.remove(id);
        Self::announce(&mut state, PeerEvent::Removed(id.to_string()));
    }

    /// Hide a peer from enumeration without announcing anything.
    pub fn forget_peer(&self, id: &str) {
        self.state.lock().peers.remove(id);
    }

    pub fn set_behavior(&self, id: &str, behavior: ChannelBehavior) {
        if let Some(peer) = self.state.lock().peers.get_mut(id) {
            peer.behavior = behavior;
        }
    }

    pub fn deny_advertising(&self, denied: bool) {
        self.state.lock().advertise_denied = denied;
    }

    pub fn is_advertising(&self) -> bool {
        self.state
            .lock()
            .inbound
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Far end of the next channel opened by `open_channel`.
    pub async fn next_remote(&self) -> Option<DuplexStream> {
        self.remotes_rx.lock().await.recv().await
    }

    /// Simulate an inbound connection. Returns the far end, or `None` when
    /// nothing is listening.
    pub fn connect_inbound(&self, peer: RemotePeer) -> Option<DuplexStream> {
        let state = self.state.lock();
        let tx = state.inbound.as_ref().filter(|tx| !tx.is_closed())?;
        let (local, far) = tokio::io::duplex(DUPLEX_CAPACITY);
        let stream: ByteStream = Box::new(local);
        tx.send((stream, peer)).ok()?;
        Some(far)
    }

    fn announce(state: &mut LoopbackState, event: PeerEvent) {
        state.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn peer(&self, id: &str) -> Result<LoopbackPeer, TransportError> {
        self.state
            .lock()
            .peers
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn watch(&self) -> Result<BoxStream<'static, PeerEvent>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            for id in state.peers.keys() {
                let _ = tx.send(PeerEvent::Added(id.clone()));
            }
            state.watchers.push(tx);
        }
        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(events.boxed())
    }

    async fn visible_peers(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.state.lock().peers.keys().cloned().collect())
    }

    async fn resolve_identity(&self, id: &str) -> Result<PeerIdentity, TransportError> {
        let peer = self.peer(id)?;
        if !peer.resolvable {
            return Err(TransportError::Unavailable(format!("{id} went away")));
        }
        Ok(peer.identity)
    }

    async fn find_service(
        &self,
        id: &str,
        service: Uuid,
    ) -> Result<Option<ServiceRecord>, TransportError> {
        let peer = self.peer(id)?;
        match peer.behavior {
            ChannelBehavior::Unreachable => Err(TransportError::Unavailable(id.to_string())),
            ChannelBehavior::Denied => Err(TransportError::PermissionDenied(id.to_string())),
            ChannelBehavior::NoService => Ok(None),
            _ if !peer.identity.offers(service) => Ok(None),
            _ => Ok(Some(ServiceRecord {
                peer_id: id.to_string(),
                service,
            })),
        }
    }

    async fn open_channel(&self, record: &ServiceRecord) -> Result<ByteStream, TransportError> {
        let peer = self.peer(&record.peer_id)?;
        match &peer.behavior {
            ChannelBehavior::Refuse => {
                return Err(TransportError::Unavailable(format!(
                    "{} refused the connection",
                    record.peer_id
                )))
            }
            ChannelBehavior::Hold(gate) => gate.notified().await,
            _ => {}
        }

        let (local, far) = tokio::io::duplex(DUPLEX_CAPACITY);
        debug!("Loopback channel opened to {}", record.peer_id);
        let stream: ByteStream = match &peer.behavior {
            ChannelBehavior::FailingReads => Box::new(Faulty::reads(local)),
            ChannelBehavior::FailingWrites => Box::new(Faulty::writes(local)),
            _ => Box::new(local),
        };
        let _ = self.remotes_tx.send(far);
        Ok(stream)
    }

    async fn advertise(&self, _service: Uuid) -> Result<Box<dyn Acceptor>, TransportError> {
        let mut state = self.state.lock();
        if state.advertise_denied {
            return Err(TransportError::PermissionDenied(
                "advertising not permitted".to_string(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.inbound = Some(tx);
        Ok(Box::new(LoopbackAcceptor { rx }))
    }
}

struct LoopbackAcceptor {
    rx: mpsc::UnboundedReceiver<(ByteStream, RemotePeer)>,
}

#[async_trait]
impl Acceptor for LoopbackAcceptor {
    async fn accept(&mut self) -> Result<(ByteStream, RemotePeer), TransportError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| TransportError::Unavailable("advertising stopped".to_string()))
    }
}

/// Duplex end that fails one direction.
struct Faulty {
    inner: DuplexStream,
    fail_reads: bool,
    fail_writes: bool,
}

impl Faulty {
    fn reads(inner: DuplexStream) -> Self {
        Self {
            inner,
            fail_reads: true,
            fail_writes: false,
        }
    }

    fn writes(inner: DuplexStream) -> Self {
        Self {
            inner,
            fail_reads: false,
            fail_writes: true,
        }
    }
}

impl AsyncRead for Faulty {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.fail_reads {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Faulty {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fail_writes {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
