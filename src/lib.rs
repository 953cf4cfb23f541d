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

//! Bluetooth serial port (RFCOMM) terminal.
//!
//! Discovers serial port devices, manages a single connection to one of
//! them and keeps a transcript of the bytes exchanged.

pub mod bluetooth;
pub mod commands;
pub mod config;
pub mod console;
pub mod device;
pub mod error;
pub mod events;
pub mod message;
pub mod state;

pub use console::SerialConsole;
pub use error::{SerialError, TransportError};
