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

//! Transport abstraction over the platform Bluetooth stack.
//!
//! The connection manager and discovery watcher only talk to [`Transport`];
//! BlueZ and the in-memory loopback both implement it.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::error::TransportError;

/// A reliable, ordered byte-stream channel to a peer.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned byte-stream handle.
pub type ByteStream = Box<dyn AsyncStream>;

/// Platform add/remove notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Added(String),
    Removed(String),
}

/// Extended identity of a discovered peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerIdentity {
    pub id: String,
    pub name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub address: Option<String>,
}

impl PeerIdentity {
    pub fn offers(&self, service: Uuid) -> bool {
        self.service_uuids.contains(&service)
    }
}

/// A service found on a peer, ready to be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub peer_id: String,
    pub service: Uuid,
}

/// Identity of the remote side of an inbound connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    pub id: String,
    pub name: Option<String>,
    pub address: Option<String>,
}

/// Collaborator operations required from the Bluetooth stack.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to add/remove notifications for nearby peers.
    async fn watch(&self) -> Result<BoxStream<'static, PeerEvent>, TransportError>;

    /// Ids of all currently visible peers.
    async fn visible_peers(&self) -> Result<Vec<String>, TransportError>;

    /// Resolve the extended identity of a peer.
    async fn resolve_identity(&self, id: &str) -> Result<PeerIdentity, TransportError>;

    /// Look up `service` on a peer.
    ///
    /// `Err` means the peer itself could not be reached or access was denied;
    /// `Ok(None)` means the peer is reachable but offers no usable service.
    async fn find_service(
        &self,
        id: &str,
        service: Uuid,
    ) -> Result<Option<ServiceRecord>, TransportError>;

    /// Open a stream channel to a service.
    async fn open_channel(&self, record: &ServiceRecord) -> Result<ByteStream, TransportError>;

    /// Advertise `service` and start accepting inbound connections.
    ///
    /// Dropping the returned acceptor stops advertising.
    async fn advertise(&self, service: Uuid) -> Result<Box<dyn Acceptor>, TransportError>;
}

/// Source of inbound stream connections.
#[async_trait]
pub trait Acceptor: Send {
    async fn accept(&mut self) -> Result<(ByteStream, RemotePeer), TransportError>;
}
