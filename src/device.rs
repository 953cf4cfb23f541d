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

//! Discovered devices, their transcripts and the device registry.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::bluetooth::transport::{PeerIdentity, RemotePeer};
use crate::events::SerialEvent;
use crate::message::Message;

/// A serial-capable peer.
///
/// Equality and hashing use the platform id only.
#[derive(Debug)]
pub struct Device {
    id: String,
    name: RwLock<String>,
    vendor_id: u16,
    product_id: u16,
    address: Option<String>,
    transcript: Transcript,
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: RwLock::new(name.into()),
            vendor_id: 0,
            product_id: 0,
            address: None,
            transcript: Transcript::default(),
        }
    }

    /// Build a device from a resolved discovery identity.
    pub fn from_identity(identity: PeerIdentity) -> Self {
        let name = identity.name.unwrap_or_else(|| identity.id.clone());
        Self {
            id: identity.id,
            name: RwLock::new(name),
            vendor_id: identity.vendor_id.unwrap_or(0),
            product_id: identity.product_id.unwrap_or(0),
            address: identity.address,
            transcript: Transcript::default(),
        }
    }

    /// Build a device for an inbound peer discovery has not reported.
    pub fn from_remote(peer: &RemotePeer) -> Self {
        Self {
            id: peer.id.clone(),
            name: RwLock::new(peer.name.clone().unwrap_or_else(|| peer.id.clone())),
            vendor_id: 0,
            product_id: 0,
            address: peer.address.clone(),
            transcript: Transcript::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Multi-line identity card.
    pub fn summary(&self) -> String {
        format!(
            "Device ID: {}\nVendor ID: 0x{:04x}\nProduct ID: 0x{:04x}\nBluetooth address: {}\nName: {}",
            self.id,
            self.vendor_id,
            self.product_id,
            self.address.as_deref().unwrap_or("unknown"),
            self.name()
        )
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// Ordered, append-only log of messages exchanged with one device.
#[derive(Debug, Default)]
pub struct Transcript {
    messages: Mutex<Vec<Message>>,
}

impl Transcript {
    /// Append a message, returning its position.
    pub fn append(&self, message: Message) -> usize {
        let mut messages = self.messages.lock();
        messages.push(message);
        messages.len() - 1
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    pub fn last(&self) -> Option<Message> {
        self.messages.lock().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

/// Result of removing a device from the registry.
#[derive(Debug)]
pub struct Removal {
    pub device: Arc<Device>,
    pub was_selected: bool,
}

/// Live set of discovered devices plus the current selection.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<Device>>>,
    selected: RwLock<Option<Arc<Device>>>,
    events: broadcast::Sender<SerialEvent>,
}

impl DeviceRegistry {
    pub fn new(events: broadcast::Sender<SerialEvent>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            selected: RwLock::new(None),
            events,
        }
    }

    /// Insert a device. An existing entry with the same id is kept (along
    /// with its transcript) and only its name is refreshed.
    pub fn insert(&self, device: Device) -> Arc<Device> {
        // Re-adding the selected device keeps the selected instance.
        let device = match self.selected.read().as_ref() {
            Some(selected) if selected.id() == device.id() => {
                selected.set_name(device.name());
                selected.clone()
            }
            _ => Arc::new(device),
        };
        self.insert_shared(device)
    }

    /// Register a device handle that already lives elsewhere, such as the
    /// device of a live inbound connection. Same dedupe rules as `insert`.
    pub fn insert_shared(&self, device: Arc<Device>) -> Arc<Device> {
        let mut devices = self.devices.write();
        if let Some(existing) = devices.get(device.id()) {
            existing.set_name(device.name());
            return existing.clone();
        }

        devices.insert(device.id().to_string(), device.clone());
        drop(devices);

        info!("Device added: {} ({})", device.name(), device.id());
        let _ = self.events.send(SerialEvent::DeviceAdded(device.clone()));
        device
    }

    /// Remove a device, clearing the selection if it pointed at it.
    pub fn remove(&self, id: &str) -> Option<Removal> {
        let device = self.devices.write().remove(id)?;
        info!("Device removed: {} ({})", device.name(), id);
        let _ = self.events.send(SerialEvent::DeviceRemoved(id.to_string()));

        let was_selected = self.clear_selection_if(id);
        Some(Removal {
            device,
            was_selected,
        })
    }

    /// Replace the whole set with `found`, keeping existing entries for ids
    /// that are still present. Returns the removals.
    pub fn replace_all(&self, found: Vec<Device>) -> Vec<Removal> {
        let keep: HashSet<String> = found.iter().map(|d| d.id().to_string()).collect();
        let stale: Vec<String> = self
            .devices
            .read()
            .keys()
            .filter(|id| !keep.contains(*id))
            .cloned()
            .collect();

        let removals = stale.iter().filter_map(|id| self.remove(id)).collect();
        for device in found {
            self.insert(device);
        }
        removals
    }

    pub fn get(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.read().contains_key(id)
    }

    /// All devices ordered by name, then id.
    pub fn list(&self) -> Vec<Arc<Device>> {
        let mut devices: Vec<Arc<Device>> = self.devices.read().values().cloned().collect();
        devices.sort_by_cached_key(|d| (d.name().to_lowercase(), d.id().to_string()));
        devices
    }

    pub fn ids(&self) -> HashSet<String> {
        self.devices.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Select a registered device by id.
    pub fn select(&self, id: &str) -> Option<Arc<Device>> {
        let device = self.get(id)?;
        self.set_selected(Some(device.clone()));
        Some(device)
    }

    /// Select a device handle directly.
    pub fn select_device(&self, device: Arc<Device>) {
        self.set_selected(Some(device));
    }

    pub fn selected(&self) -> Option<Arc<Device>> {
        self.selected.read().clone()
    }

    pub fn clear_selection(&self) {
        self.set_selected(None);
    }

    fn clear_selection_if(&self, id: &str) -> bool {
        let mut selected = self.selected.write();
        if selected.as_ref().is_some_and(|d| d.id() == id) {
            *selected = None;
            drop(selected);
            debug!("Selection cleared");
            let _ = self.events.send(SerialEvent::SelectionChanged(None));
            return true;
        }
        false
    }

    fn set_selected(&self, device: Option<Arc<Device>>) {
        let id = device.as_ref().map(|d| d.id().to_string());
        let changed = {
            let mut selected = self.selected.write();
            let changed = selected.as_ref().map(|d| d.id()) != id.as_deref();
            *selected = device;
            changed
        };
        if changed {
            let _ = self.events.send(SerialEvent::SelectionChanged(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Direction;

    fn registry() -> (DeviceRegistry, broadcast::Receiver<SerialEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (DeviceRegistry::new(tx), rx)
    }

    fn identity(id: &str, name: &str) -> PeerIdentity {
        PeerIdentity {
            id: id.to_string(),
            name: Some(name.to_string()),
            vendor_id: Some(0x004c),
            product_id: Some(0x0203),
            address: Some("00:11:22:33:44:55".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_device_equality_by_id() {
        let a = Device::new("dev-1", "HC-05");
        let b = Device::new("dev-1", "Renamed");
        let c = Device::new("dev-2", "HC-05");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_device_summary() {
        let device = Device::from_identity(identity("dev-1", "HC-05"));
        let summary = device.summary();
        assert!(summary.contains("Device ID: dev-1"));
        assert!(summary.contains("Vendor ID: 0x004c"));
        assert!(summary.contains("Product ID: 0x0203"));
        assert!(summary.contains("Bluetooth address: 00:11:22:33:44:55"));
        assert!(summary.ends_with("Name: HC-05"));
    }

    #[test]
    fn test_device_defaults_when_identity_is_sparse() {
        let device = Device::from_identity(PeerIdentity {
            id: "dev-9".into(),
            ..Default::default()
        });
        assert_eq!(device.name(), "dev-9");
        assert_eq!(device.vendor_id(), 0);
        assert_eq!(device.product_id(), 0);
        assert_eq!(device.address(), None);
    }

    #[test]
    fn test_transcript_is_ordered() {
        let transcript = Transcript::default();
        assert_eq!(transcript.append(Message::sent(b"ping".to_vec())), 0);
        assert_eq!(transcript.append(Message::received(b"pong".to_vec())), 1);

        let messages = transcript.snapshot();
        assert_eq!(messages[0].direction(), Direction::Sent);
        assert_eq!(messages[1].text(), "pong");

        transcript.clear();
        assert!(transcript.is_empty());
    }

    #[test]
    fn test_insert_deduplicates() {
        let (registry, mut rx) = registry();
        let first = registry.insert(Device::new("dev-1", "Old"));
        first.transcript().append(Message::received(b"x".to_vec()));

        let second = registry.insert(Device::new("dev-1", "New"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(second.name(), "New");
        assert_eq!(second.transcript().len(), 1);

        assert!(matches!(rx.try_recv(), Ok(SerialEvent::DeviceAdded(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_insert_shared_keeps_handle() {
        let (registry, mut rx) = registry();
        let live = Arc::new(Device::new("remote-1", "Phone"));

        let stored = registry.insert_shared(live.clone());
        assert!(Arc::ptr_eq(&live, &stored));
        assert!(matches!(rx.try_recv(), Ok(SerialEvent::DeviceAdded(_))));

        let again = registry.insert_shared(Arc::new(Device::new("remote-1", "Phone 2")));
        assert!(Arc::ptr_eq(&live, &again));
        assert_eq!(live.name(), "Phone 2");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_remove_clears_selection() {
        let (registry, _rx) = registry();
        registry.insert(Device::new("dev-1", "A"));
        registry.insert(Device::new("dev-2", "B"));
        assert!(registry.select("dev-1").is_some());

        let removal = registry.remove("dev-2").unwrap();
        assert!(!removal.was_selected);
        assert!(registry.selected().is_some());

        let removal = registry.remove("dev-1").unwrap();
        assert!(removal.was_selected);
        assert!(registry.selected().is_none());
        assert!(registry.remove("dev-1").is_none());
    }

    #[test]
    fn test_select_unknown_id() {
        let (registry, _rx) = registry();
        assert!(registry.select("missing").is_none());
        assert!(registry.selected().is_none());
    }

    #[test]
    fn test_replace_all_keeps_surviving_entries() {
        let (registry, _rx) = registry();
        let kept = registry.insert(Device::new("dev-1", "A"));
        registry.insert(Device::new("dev-2", "B"));
        registry.select("dev-2");

        let removals =
            registry.replace_all(vec![Device::new("dev-1", "A"), Device::new("dev-3", "C")]);

        assert_eq!(removals.len(), 1);
        assert_eq!(removals[0].device.id(), "dev-2");
        assert!(removals[0].was_selected);
        assert!(Arc::ptr_eq(&kept, &registry.get("dev-1").unwrap()));
        assert_eq!(
            registry.ids(),
            HashSet::from(["dev-1".to_string(), "dev-3".to_string()])
        );
    }

    #[test]
    fn test_list_sorted_by_name() {
        let (registry, _rx) = registry();
        registry.insert(Device::new("b", "zeta"));
        registry.insert(Device::new("a", "Alpha"));
        let names: Vec<String> = registry.list().iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["Alpha", "zeta"]);
    }
}
