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

//! Serial connection lifecycle.
//!
//! Exactly one connection is live at a time. The channel handle lives inside
//! [`Phase::Connected`], so it exists iff the state is `Connected`. Teardown
//! takes the link out of the phase under the lock and releases it afterwards,
//! which keeps the receive loop and a concurrent disconnect from both
//! releasing the same handle.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::protocol::{encode_payload, LineEnding, SPP_UUID};
use super::transport::{Acceptor, ByteStream, RemotePeer, Transport};
use crate::device::{Device, DeviceRegistry};
use crate::error::SerialError;
use crate::events::SerialEvent;
use crate::message::Message;
use crate::state::ConnectionState;

/// Result of a `connect()` call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The channel is open and the receive loop is running.
    Connected,
    /// Another connection is live or being established; nothing changed.
    Busy,
    /// The peer offers no usable serial port service.
    NoService,
}

type SharedWriter = Arc<AsyncMutex<WriteHalf<ByteStream>>>;

/// A live channel.
struct Link {
    session: u64,
    device: Arc<Device>,
    writer: SharedWriter,
    reader: AbortHandle,
}

enum Phase {
    Disconnected,
    Connecting,
    Connected(Link),
}

impl Phase {
    fn state(&self) -> ConnectionState {
        match self {
            Phase::Disconnected => ConnectionState::Disconnected,
            Phase::Connecting => ConnectionState::Connecting,
            Phase::Connected(_) => ConnectionState::Connected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Outbound,
    Inbound,
}

struct Shared {
    transport: Arc<dyn Transport>,
    registry: Arc<DeviceRegistry>,
    phase: Mutex<Phase>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SerialEvent>,
    listener: Mutex<Option<JoinHandle<()>>>,
    next_session: AtomicU64,
    read_buffer_size: usize,
}

/// Owns the single serial connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<DeviceRegistry>,
        events: broadcast::Sender<SerialEvent>,
        read_buffer_size: usize,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                transport,
                registry,
                phase: Mutex::new(Phase::Disconnected),
                state_tx,
                events,
                listener: Mutex::new(None),
                next_session: AtomicU64::new(0),
                read_buffer_size: read_buffer_size.max(1),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.phase.lock().state()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Device of the live connection.
    pub fn active_device(&self) -> Option<Arc<Device>> {
        match &*self.shared.phase.lock() {
            Phase::Connected(link) => Some(link.device.clone()),
            _ => None,
        }
    }

    /// Open a serial channel to `device`.
    pub async fn connect(
        &self,
        device: Option<Arc<Device>>,
    ) -> Result<ConnectOutcome, SerialError> {
        let (_guard, device) = {
            let mut phase = self.shared.phase.lock();
            if !matches!(*phase, Phase::Disconnected) {
                info!("Connect ignored: connection is {}", phase.state());
                return Ok(ConnectOutcome::Busy);
            }
            let Some(device) = device else {
                return Err(SerialError::NoDeviceSelected);
            };
            self.shared.set_phase(&mut phase, Phase::Connecting);
            let guard = ConnectingGuard {
                shared: &self.shared,
            };
            (guard, device)
        };

        info!("Connecting to {} ({})", device.name(), device.id());

        let record = match self
            .shared
            .transport
            .find_service(device.id(), SPP_UUID)
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                info!("{} offers no accessible serial port service", device.id());
                return Ok(ConnectOutcome::NoService);
            }
            Err(e) => {
                warn!("Cannot reach {}: {}", device.id(), e);
                return Err(SerialError::unavailable(&e));
            }
        };

        let stream = match self.shared.transport.open_channel(&record).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to open serial channel to {}: {}", device.id(), e);
                return Err(SerialError::DeviceNotAvailable);
            }
        };

        match Shared::attach(&self.shared, stream, device.clone(), Origin::Outbound) {
            Ok(()) => {
                info!("Connected to {}", device.name());
                Ok(ConnectOutcome::Connected)
            }
            Err(()) => Ok(ConnectOutcome::Busy),
        }
    }

    /// Close the live connection. No-op unless connected.
    pub fn disconnect(&self) -> bool {
        self.shared.disconnect_session(None, true)
    }

    /// Encode and transmit `text`.
    ///
    /// Returns `Ok(None)` without doing anything when not connected.
    pub async fn send(
        &self,
        text: &str,
        as_hex: bool,
        eol: LineEnding,
    ) -> Result<Option<Message>, SerialError> {
        let Some((session, device, writer)) = self.shared.current_link() else {
            debug!("Send ignored: not connected");
            return Ok(None);
        };

        let data = encode_payload(text, as_hex, eol)?;

        let result = {
            let mut writer = writer.lock().await;
            match writer.write_all(&data).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        drop(writer);

        if let Err(e) = result {
            error!("Write to {} failed: {}", device.id(), e);
            self.shared.disconnect_session(Some(session), true);
            return Err(SerialError::SendFailed);
        }

        debug!("Sent {} bytes to {}", data.len(), device.id());
        let message = Message::sent(data);
        self.shared.record(&device, message.clone());
        Ok(Some(message))
    }

    pub fn is_listening(&self) -> bool {
        self.shared.listener.lock().is_some()
    }

    /// Switch listen mode on or off.
    ///
    /// Turning it off stops advertising but leaves a live connection alone.
    pub async fn set_listening(&self, enable: bool) -> Result<(), SerialError> {
        if !enable {
            let task = self.shared.listener.lock().take();
            if let Some(task) = task {
                task.abort();
                info!("Stopped listening for connections");
                self.shared.publish(SerialEvent::ListeningChanged(false));
            }
            return Ok(());
        }

        if self.is_listening() {
            return Ok(());
        }

        let acceptor = match self.shared.transport.advertise(SPP_UUID).await {
            Ok(acceptor) => acceptor,
            Err(e) => {
                warn!("Failed to advertise serial port service: {}", e);
                self.shared.publish(SerialEvent::ListeningChanged(false));
                return Err(SerialError::unavailable(&e));
            }
        };

        let task = tokio::spawn(accept_loop(self.shared.clone(), acceptor));
        if let Some(previous) = self.shared.listener.lock().replace(task) {
            previous.abort();
        }
        info!("Listening for serial port connections");
        self.shared.publish(SerialEvent::ListeningChanged(true));
        Ok(())
    }

    /// React to discovery losing a device. Returns whether it was the
    /// connected one.
    pub fn on_device_removed(&self, id: &str) -> bool {
        let active = self.active_device().is_some_and(|d| d.id() == id);
        if active {
            info!("Connected device {} disappeared", id);
            self.disconnect();
        }
        active
    }
}

impl Shared {
    fn set_phase(&self, phase: &mut Phase, next: Phase) {
        *phase = next;
        self.state_tx.send_replace(phase.state());
    }

    fn publish(&self, event: SerialEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, device: &Device, message: Message) {
        device.transcript().append(message.clone());
        self.publish(SerialEvent::MessageAppended {
            device_id: device.id().to_string(),
            message,
        });
    }

    fn is_current(&self, session: u64) -> bool {
        matches!(&*self.phase.lock(), Phase::Connected(link) if link.session == session)
    }

    fn current_link(&self) -> Option<(u64, Arc<Device>, SharedWriter)> {
        match &*self.phase.lock() {
            Phase::Connected(link) => Some((link.session, link.device.clone(), link.writer.clone())),
            _ => None,
        }
    }

    /// Install `stream` as the live link and start its receive loop.
    ///
    /// Outbound links replace `Connecting`; inbound links replace
    /// `Disconnected` or an older link, and are refused while an outbound
    /// connect is in flight.
    fn attach(
        this: &Arc<Self>,
        stream: ByteStream,
        device: Arc<Device>,
        origin: Origin,
    ) -> Result<(), ()> {
        let (reader, writer) = tokio::io::split(stream);
        let previous = {
            let mut phase = this.phase.lock();
            let allowed = match (&*phase, origin) {
                (Phase::Connecting, Origin::Outbound) => true,
                (Phase::Connecting, Origin::Inbound) => false,
                (_, Origin::Inbound) => true,
                (_, Origin::Outbound) => false,
            };
            if !allowed {
                warn!(
                    "Dropping {:?} channel from {}: connection is {}",
                    origin,
                    device.id(),
                    phase.state()
                );
                return Err(());
            }

            let session = this.next_session.fetch_add(1, Ordering::Relaxed) + 1;
            let task = tokio::spawn(receive_loop(this.clone(), session, reader, device.clone()));
            let link = Link {
                session,
                device,
                writer: Arc::new(AsyncMutex::new(writer)),
                reader: task.abort_handle(),
            };
            let previous = std::mem::replace(&mut *phase, Phase::Connected(link));
            this.state_tx.send_replace(ConnectionState::Connected);
            previous
        };

        if let Phase::Connected(old) = previous {
            info!("Replacing connection to {}", old.device.id());
            release(old, true);
        }
        Ok(())
    }

    /// Tear down the live link if it is still `session` (any link when `None`).
    fn disconnect_session(&self, session: Option<u64>, abort_reader: bool) -> bool {
        let link = {
            let mut phase = self.phase.lock();
            let live = match &*phase {
                Phase::Connected(link) => session.map_or(true, |s| s == link.session),
                _ => false,
            };
            if !live {
                return false;
            }
            let previous = std::mem::replace(&mut *phase, Phase::Disconnected);
            self.state_tx.send_replace(ConnectionState::Disconnected);
            match previous {
                Phase::Connected(link) => link,
                _ => return false,
            }
        };

        info!("Disconnected from {}", link.device.name());
        release(link, abort_reader);
        true
    }
}

/// Release a link that has already been taken out of the phase.
fn release(link: Link, abort_reader: bool) {
    if abort_reader {
        link.reader.abort();
    }
    debug!("Released channel for session {}", link.session);
    drop(link.writer);
}

/// Resets `Connecting` to `Disconnected` when a connect attempt ends early,
/// including when the connect future is dropped mid-handshake.
struct ConnectingGuard<'a> {
    shared: &'a Shared,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        let mut phase = self.shared.phase.lock();
        if matches!(*phase, Phase::Connecting) {
            self.shared.set_phase(&mut phase, Phase::Disconnected);
        }
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    session: u64,
    mut reader: ReadHalf<ByteStream>,
    device: Arc<Device>,
) {
    let mut buf = vec![0u8; shared.read_buffer_size];
    debug!("Receive loop started for session {}", session);

    loop {
        if !shared.is_current(session) {
            break;
        }

        match reader.read(&mut buf).await {
            Ok(0) => {
                info!("Connection closed by remote");
                if shared.disconnect_session(Some(session), false) {
                    shared.publish(SerialEvent::Error(SerialError::ReadFailed));
                }
                break;
            }
            Ok(n) => {
                if !shared.is_current(session) {
                    break;
                }
                debug!("Received {} bytes from {}", n, device.id());
                shared.record(&device, Message::received(buf[..n].to_vec()));
            }
            Err(e) => {
                info!("Read error: {}", e);
                shared.disconnect_session(Some(session), false);
                break;
            }
        }
    }

    debug!("Receive loop stopped for session {}", session);
}

async fn accept_loop(shared: Arc<Shared>, mut acceptor: Box<dyn Acceptor>) {
    info!("Waiting for connections...");

    loop {
        match acceptor.accept().await {
            Ok((stream, peer)) => {
                info!("Connection from: {}", peer.id);
                adopt_inbound(&shared, stream, peer);
            }
            Err(e) => {
                error!("Accept error: {}", e);
                // Continue listening despite errors
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        }
    }
}

fn adopt_inbound(shared: &Arc<Shared>, stream: ByteStream, peer: RemotePeer) {
    let known = shared.registry.get(&peer.id);
    let device = known
        .clone()
        .unwrap_or_else(|| Arc::new(Device::from_remote(&peer)));

    if Shared::attach(shared, stream, device.clone(), Origin::Inbound).is_err() {
        return;
    }

    // Unknown peers are registered only once their channel is live.
    match known {
        Some(device) => {
            if let Some(name) = &peer.name {
                device.set_name(name.clone());
            }
        }
        None => {
            shared.registry.insert_shared(device.clone());
        }
    }
    shared.registry.select_device(device.clone());
    info!("Accepted connection from {}", device.name());
}
