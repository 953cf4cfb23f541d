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

//! Error types.

use thiserror::Error;

/// User-visible failures of the serial session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerialError {
    /// `connect()` was issued without a device.
    #[error("no device selected")]
    NoDeviceSelected,

    /// The Bluetooth stack could not be used for this peer.
    #[error("Bluetooth is not available (permission denied: {permission_denied})")]
    BluetoothUnavailable { permission_denied: bool },

    /// Opening the serial channel failed.
    #[error("device is not available")]
    DeviceNotAvailable,

    /// The remote side closed the channel.
    #[error("reading from the device failed: connection closed by remote")]
    ReadFailed,

    /// Hex input did not parse.
    #[error("invalid hex input: {0}")]
    InvalidHexInput(String),

    /// Writing to the channel failed.
    #[error("sending to the device failed")]
    SendFailed,
}

impl SerialError {
    pub(crate) fn unavailable(err: &TransportError) -> Self {
        Self::BluetoothUnavailable {
            permission_denied: err.is_permission_denied(),
        }
    }
}

/// Failures reported by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::PermissionDenied(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }
}

impl From<bluer::Error> for TransportError {
    fn from(err: bluer::Error) -> Self {
        use bluer::ErrorKind;

        match err.kind {
            ErrorKind::NotAuthorized | ErrorKind::NotPermitted => {
                Self::PermissionDenied(err.message)
            }
            ErrorKind::DoesNotExist | ErrorKind::NotFound => Self::NotFound(err.message),
            _ => Self::Unavailable(err.to_string()),
        }
    }
}
