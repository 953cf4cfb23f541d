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

//! Front door for user interfaces.
//!
//! Wires discovery, the registry and the connection manager together and
//! exposes the observable state a UI binds to.

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::bluetooth::{
    ConnectOutcome, ConnectionManager, DiscoveryWatcher, LineEnding, Transport,
};
use crate::config::TerminalConfig;
use crate::device::{Device, DeviceRegistry};
use crate::error::{SerialError, TransportError};
use crate::events::SerialEvent;
use crate::message::Message;
use crate::state::ConnectionState;

const EVENT_CAPACITY: usize = 256;

/// A serial terminal session over one transport.
pub struct SerialConsole {
    registry: Arc<DeviceRegistry>,
    connection: ConnectionManager,
    discovery: DiscoveryWatcher,
    events: broadcast::Sender<SerialEvent>,
}

impl SerialConsole {
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: &TerminalConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = Arc::new(DeviceRegistry::new(events.clone()));
        let connection = ConnectionManager::new(
            transport.clone(),
            registry.clone(),
            events.clone(),
            config.read_buffer_size,
        );
        let discovery = DiscoveryWatcher::new(transport, registry.clone(), connection.clone());
        Self {
            registry,
            connection,
            discovery,
            events,
        }
    }

    /// Registry change, transcript and error notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SerialEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Known devices ordered by name.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.registry.list()
    }

    pub fn device(&self, id: &str) -> Option<Arc<Device>> {
        self.registry.get(id)
    }

    pub fn selected_device(&self) -> Option<Arc<Device>> {
        self.registry.selected()
    }

    /// Select a known device. Unknown ids leave the selection unchanged.
    pub fn select(&self, id: &str) -> Option<Arc<Device>> {
        self.registry.select(id)
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    /// Device of the live connection.
    pub fn active_device(&self) -> Option<Arc<Device>> {
        self.connection.active_device()
    }

    pub fn transcript(&self, device: &Device) -> Vec<Message> {
        device.transcript().snapshot()
    }

    pub fn clear_transcript(&self, device: &Device) {
        device.transcript().clear();
        info!("Transcript of {} cleared", device.id());
        let _ = self
            .events
            .send(SerialEvent::TranscriptCleared(device.id().to_string()));
    }

    pub async fn start_watching(&self) -> Result<(), TransportError> {
        self.discovery.start_watching().await
    }

    pub async fn stop_watching(&self) {
        self.discovery.stop_watching().await
    }

    /// Rebuild the device list from the peers visible right now.
    pub async fn refresh(&self) -> Result<usize, TransportError> {
        self.discovery.refresh_now().await
    }

    /// Connect to `device`, selecting it once the channel is open.
    pub async fn connect(
        &self,
        device: Option<Arc<Device>>,
    ) -> Result<ConnectOutcome, SerialError> {
        let outcome = self.connection.connect(device.clone()).await?;
        if let (ConnectOutcome::Connected, Some(device)) = (outcome, device) {
            self.registry.select_device(device);
        }
        Ok(outcome)
    }

    /// Connect to the selected device.
    pub async fn connect_selected(&self) -> Result<ConnectOutcome, SerialError> {
        self.connection.connect(self.selected_device()).await
    }

    pub fn disconnect(&self) -> bool {
        self.connection.disconnect()
    }

    /// Transmit `text`. `Ok(None)` when not connected.
    pub async fn send(
        &self,
        text: &str,
        as_hex: bool,
        eol: LineEnding,
    ) -> Result<Option<Message>, SerialError> {
        self.connection.send(text, as_hex, eol).await
    }

    pub async fn set_listening(&self, enable: bool) -> Result<(), SerialError> {
        self.connection.set_listening(enable).await
    }

    pub fn is_listening(&self) -> bool {
        self.connection.is_listening()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::loopback::LoopbackTransport;
    use crate::bluetooth::{PeerIdentity, SPP_UUID};

    fn console() -> (Arc<LoopbackTransport>, SerialConsole) {
        let transport = Arc::new(LoopbackTransport::new());
        let console = SerialConsole::new(transport.clone(), &TerminalConfig::default());
        (transport, console)
    }

    fn serial_peer(id: &str, name: &str) -> PeerIdentity {
        PeerIdentity {
            id: id.to_string(),
            name: Some(name.to_string()),
            service_uuids: vec![SPP_UUID],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_select_unknown_device() {
        let (transport, console) = console();
        transport.add_peer(serial_peer("dev-1", "Scale"));
        console.refresh().await.unwrap();

        assert!(console.select("dev-1").is_some());
        assert!(console.select("missing").is_none());
        assert_eq!(console.selected_device().unwrap().id(), "dev-1");
    }

    #[tokio::test]
    async fn test_connect_selected_without_selection() {
        let (_transport, console) = console();
        assert_eq!(
            console.connect_selected().await,
            Err(SerialError::NoDeviceSelected)
        );
    }

    #[tokio::test]
    async fn test_connect_selects_device() {
        let (transport, console) = console();
        transport.add_peer(serial_peer("dev-1", "Scale"));
        transport.add_peer(serial_peer("dev-2", "Meter"));
        console.refresh().await.unwrap();

        let names: Vec<String> = console.devices().iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["Meter", "Scale"]);

        console.select("dev-1");
        let outcome = console.connect(console.device("dev-2")).await.unwrap();
        assert_eq!(outcome, ConnectOutcome::Connected);
        assert_eq!(console.selected_device().unwrap().id(), "dev-2");
        assert_eq!(console.active_device().unwrap().id(), "dev-2");
        assert!(console.disconnect());
    }

    #[tokio::test]
    async fn test_busy_connect_keeps_selection() {
        let (transport, console) = console();
        transport.add_peer(serial_peer("dev-1", "Scale"));
        transport.add_peer(serial_peer("dev-2", "Meter"));
        console.refresh().await.unwrap();

        console.connect(console.device("dev-1")).await.unwrap();
        let mut events = console.subscribe();

        let outcome = console.connect(console.device("dev-2")).await.unwrap();
        assert_eq!(outcome, ConnectOutcome::Busy);
        assert_eq!(console.selected_device().unwrap().id(), "dev-1");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_clear_transcript() {
        let (transport, console) = console();
        transport.add_peer(serial_peer("dev-1", "Scale"));
        console.refresh().await.unwrap();
        let mut events = console.subscribe();

        let device = console.select("dev-1").unwrap();
        console.connect_selected().await.unwrap();
        console
            .send("ping", false, LineEnding::Lf)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(console.transcript(&device).len(), 1);

        console.clear_transcript(&device);
        assert!(console.transcript(&device).is_empty());

        let mut cleared = false;
        while let Ok(event) = events.try_recv() {
            if let SerialEvent::TranscriptCleared(id) = event {
                cleared = id == "dev-1";
            }
        }
        assert!(cleared);
    }
}
