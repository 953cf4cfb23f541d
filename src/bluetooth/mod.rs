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

//! Bluetooth communication module.
//!
//! Handles device discovery and the RFCOMM serial port connection.

mod bluez;
mod connection;
mod discovery;
pub mod loopback;
mod protocol;
pub mod transport;

pub use bluez::BluezTransport;
pub use connection::{ConnectOutcome, ConnectionManager};
pub use discovery::DiscoveryWatcher;
pub use protocol::{
    encode_payload, encode_text, parse_hex, LineEnding, DEFAULT_READ_BUFFER_SIZE, SPP_UUID,
};
pub use transport::{Acceptor, ByteStream, PeerEvent, PeerIdentity, RemotePeer, Transport};
