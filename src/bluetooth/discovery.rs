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

//! Keeps the device registry in step with the peers the transport sees.
//!
//! Every registry write happens on one worker task. The live watch and
//! explicit refreshes both feed that task through a channel.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::ConnectionManager;
use super::protocol::SPP_UUID;
use super::transport::{PeerEvent, Transport};
use crate::device::{Device, DeviceRegistry};
use crate::error::TransportError;

enum Update {
    Peer(PeerEvent),
    Refresh(oneshot::Sender<Result<usize, TransportError>>),
}

/// Populates the [`DeviceRegistry`] from transport discovery.
pub struct DiscoveryWatcher {
    transport: Arc<dyn Transport>,
    updates: mpsc::UnboundedSender<Update>,
    worker: JoinHandle<()>,
    watch_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl DiscoveryWatcher {
    /// Create the watcher and spawn its worker. Must be called from within
    /// a Tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<DeviceRegistry>,
        connection: ConnectionManager,
    ) -> Self {
        let (updates, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            transport: transport.clone(),
            registry,
            connection,
        };
        Self {
            transport,
            updates,
            worker: tokio::spawn(worker.run(rx)),
            watch_task: AsyncMutex::new(None),
        }
    }

    /// Subscribe to peer add/remove notifications. Does nothing if already
    /// watching.
    pub async fn start_watching(&self) -> Result<(), TransportError> {
        let mut task = self.watch_task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("Discovery already running");
            return Ok(());
        }

        let mut events = self.transport.watch().await?;
        let updates = self.updates.clone();
        *task = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if updates.send(Update::Peer(event)).is_err() {
                    break;
                }
            }
            debug!("Discovery event stream ended");
        }));

        info!("Watching for serial port devices");
        Ok(())
    }

    /// Stop the live subscription. Devices already found stay registered.
    pub async fn stop_watching(&self) {
        if let Some(task) = self.watch_task.lock().await.take() {
            task.abort();
            info!("Stopped watching for devices");
        }
    }

    pub async fn is_watching(&self) -> bool {
        self.watch_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Enumerate all visible peers once and rebuild the registry from them.
    /// Returns the number of serial port devices found.
    pub async fn refresh_now(&self) -> Result<usize, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.updates
            .send(Update::Refresh(tx))
            .map_err(|_| TransportError::Unavailable("discovery stopped".to_string()))?;
        rx.await
            .map_err(|_| TransportError::Unavailable("discovery stopped".to_string()))?
    }
}

impl Drop for DiscoveryWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.watch_task.get_mut().take() {
            task.abort();
        }
        self.worker.abort();
    }
}

struct Worker {
    transport: Arc<dyn Transport>,
    registry: Arc<DeviceRegistry>,
    connection: ConnectionManager,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Update>) {
        while let Some(update) = rx.recv().await {
            match update {
                Update::Peer(PeerEvent::Added(id)) => {
                    if let Some(device) = self.resolve(&id).await {
                        self.registry.insert(device);
                    }
                }
                Update::Peer(PeerEvent::Removed(id)) => self.remove(&id),
                Update::Refresh(reply) => {
                    let _ = reply.send(self.refresh().await);
                }
            }
        }
    }

    /// Build a device for a serial-capable peer. Anything else, including a
    /// peer that vanished mid-lookup, yields `None`.
    async fn resolve(&self, id: &str) -> Option<Device> {
        let identity = match self.transport.resolve_identity(id).await {
            Ok(identity) => identity,
            Err(e) => {
                debug!("Ignoring {}: {}", id, e);
                return None;
            }
        };

        if !identity.offers(SPP_UUID) {
            debug!("Ignoring {}: no serial port service", id);
            return None;
        }

        Some(Device::from_identity(identity))
    }

    fn remove(&self, id: &str) {
        let removal = self.registry.remove(id);
        let was_active = self.connection.on_device_removed(id);
        if was_active && !removal.is_some_and(|r| r.was_selected) {
            self.registry.clear_selection();
        }
    }

    async fn refresh(&self) -> Result<usize, TransportError> {
        let ids = self.transport.visible_peers().await.map_err(|e| {
            warn!("Device enumeration failed: {}", e);
            e
        })?;

        let mut found = Vec::new();
        for id in ids {
            if let Some(device) = self.resolve(&id).await {
                found.push(device);
            }
        }
        let count = found.len();

        for removal in self.registry.replace_all(found) {
            if self.connection.on_device_removed(removal.device.id()) && !removal.was_selected {
                self.registry.clear_selection();
            }
        }

        info!("Refresh found {} serial port devices", count);
        Ok(count)
    }
}
