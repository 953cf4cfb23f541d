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

//! BlueZ transport using RFCOMM profiles.

use async_trait::async_trait;
use bluer::rfcomm::{Profile, ProfileHandle, Role};
use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::stream::{BoxStream, StreamExt};
use tracing::{debug, info};
use uuid::Uuid;

use super::transport::{
    Acceptor, ByteStream, PeerEvent, PeerIdentity, RemotePeer, ServiceRecord, Transport,
};
use crate::config::BluetoothConfig;
use crate::error::TransportError;

/// [`Transport`] backed by the system BlueZ daemon.
pub struct BluezTransport {
    session: Session,
    adapter: Adapter,
    alias: Option<String>,
    rfcomm_channel: u16,
}

impl BluezTransport {
    /// Open a BlueZ session on the configured adapter.
    pub async fn new(config: &BluetoothConfig) -> Result<Self, TransportError> {
        info!("Initializing Bluetooth transport...");

        // Create BlueZ session
        let session = Session::new().await?;
        info!("BlueZ session created");

        let adapter = match &config.adapter {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!("Using Bluetooth adapter: {}", adapter.name());

        // Ensure adapter is powered on
        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        Ok(Self {
            session,
            adapter,
            alias: config.alias.clone(),
            rfcomm_channel: config.rfcomm_channel,
        })
    }

    /// Get the adapter address.
    pub async fn address(&self) -> Result<Address, TransportError> {
        Ok(self.adapter.address().await?)
    }

    fn device(&self, id: &str) -> Result<bluer::Device, TransportError> {
        let address: Address = id
            .parse()
            .map_err(|_| TransportError::NotFound(format!("invalid device address {id}")))?;
        Ok(self.adapter.device(address)?)
    }
}

#[async_trait]
impl Transport for BluezTransport {
    async fn watch(&self) -> Result<BoxStream<'static, PeerEvent>, TransportError> {
        let events = self.adapter.discover_devices().await?;
        info!("Discovery started on {}", self.adapter.name());

        let peers = events.filter_map(|event| async move {
            match event {
                AdapterEvent::DeviceAdded(address) => Some(PeerEvent::Added(address.to_string())),
                AdapterEvent::DeviceRemoved(address) => {
                    Some(PeerEvent::Removed(address.to_string()))
                }
                _ => None,
            }
        });
        Ok(peers.boxed())
    }

    async fn visible_peers(&self) -> Result<Vec<String>, TransportError> {
        let addresses = self.adapter.device_addresses().await?;
        Ok(addresses.into_iter().map(|a| a.to_string()).collect())
    }

    async fn resolve_identity(&self, id: &str) -> Result<PeerIdentity, TransportError> {
        let device = self.device(id)?;

        let service_uuids = device.uuids().await?.unwrap_or_default();
        let name = match device.name().await? {
            Some(name) => Some(name),
            None => device.alias().await.ok(),
        };
        let modalias = device.modalias().await?;
        let (vendor_id, product_id) = match modalias {
            Some(m) => (u16::try_from(m.vendor).ok(), u16::try_from(m.product).ok()),
            None => (None, None),
        };

        Ok(PeerIdentity {
            id: id.to_string(),
            name,
            service_uuids: service_uuids.into_iter().collect(),
            vendor_id,
            product_id,
            address: Some(device.address().to_string()),
        })
    }

    async fn find_service(
        &self,
        id: &str,
        service: Uuid,
    ) -> Result<Option<ServiceRecord>, TransportError> {
        let device = self.device(id)?;
        let uuids = device.uuids().await?.unwrap_or_default();
        if !uuids.contains(&service) {
            return Ok(None);
        }
        Ok(Some(ServiceRecord {
            peer_id: id.to_string(),
            service,
        }))
    }

    async fn open_channel(&self, record: &ServiceRecord) -> Result<ByteStream, TransportError> {
        let device = self.device(&record.peer_id)?;

        let profile = Profile {
            uuid: record.service,
            role: Some(Role::Client),
            require_authentication: Some(false),
            require_authorization: Some(false),
            auto_connect: Some(false),
            ..Default::default()
        };
        let mut handle = self.session.register_profile(profile).await?;
        debug!("Client profile registered for {}", record.service);

        // BlueZ hands the socket to the profile while connect_profile is
        // still pending, so both have to be polled together.
        let request = tokio::select! {
            res = device.connect_profile(&record.service) => {
                res?;
                handle.next().await
            }
            req = handle.next() => req,
        };
        let request = request
            .ok_or_else(|| TransportError::Unavailable("profile unregistered".to_string()))?;

        let stream = request.accept()?;
        info!("RFCOMM channel open to {}", record.peer_id);
        Ok(Box::new(stream))
    }

    async fn advertise(&self, service: Uuid) -> Result<Box<dyn Acceptor>, TransportError> {
        if let Some(alias) = &self.alias {
            self.adapter.set_alias(alias.clone()).await?;
            info!("Bluetooth name set to: {}", alias);
        }

        // Make adapter discoverable
        self.adapter.set_discoverable(true).await?;
        self.adapter.set_pairable(true).await?;
        info!("Adapter is discoverable and pairable");

        let profile = Profile {
            uuid: service,
            name: Some("Serial Port".to_string()),
            role: Some(Role::Server),
            channel: Some(self.rfcomm_channel),
            require_authentication: Some(false),
            require_authorization: Some(false),
            ..Default::default()
        };
        let handle = self.session.register_profile(profile).await?;
        info!(
            "SPP service registered (UUID: {}) on RFCOMM channel {}",
            service, self.rfcomm_channel
        );

        Ok(Box::new(BluezAcceptor {
            adapter: self.adapter.clone(),
            handle,
        }))
    }
}

/// Accepts connections made to a registered server profile.
struct BluezAcceptor {
    adapter: Adapter,
    handle: ProfileHandle,
}

#[async_trait]
impl Acceptor for BluezAcceptor {
    async fn accept(&mut self) -> Result<(ByteStream, RemotePeer), TransportError> {
        let request = self
            .handle
            .next()
            .await
            .ok_or_else(|| TransportError::Unavailable("profile unregistered".to_string()))?;

        let address = request.device();
        let stream = request.accept()?;

        let name = match self.adapter.device(address) {
            Ok(device) => device.alias().await.ok(),
            Err(_) => None,
        };

        let stream: ByteStream = Box::new(stream);
        Ok((
            stream,
            RemotePeer {
                id: address.to_string(),
                name,
                address: Some(address.to_string()),
            },
        ))
    }
}
