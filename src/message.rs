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

//! Transcript messages.

use chrono::{DateTime, Local};
use std::fmt::Write;

/// Which way a message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// One transmitted or received byte sequence.
///
/// The text and hex views are derived once at construction; a message is
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    direction: Direction,
    data: Vec<u8>,
    text: String,
    hex: String,
    created_at: DateTime<Local>,
}

impl Message {
    pub fn new(direction: Direction, data: Vec<u8>) -> Self {
        let text = String::from_utf8_lossy(&data).into_owned();
        let hex = to_hex_pairs(&data);
        Self {
            direction,
            data,
            text,
            hex,
            created_at: Local::now(),
        }
    }

    pub fn sent(data: Vec<u8>) -> Self {
        Self::new(Direction::Sent, data)
    }

    pub fn received(data: Vec<u8>) -> Self {
        Self::new(Direction::Received, data)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Raw payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// UTF-8 view of the payload. Invalid sequences are replaced with U+FFFD.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Uppercase hex pairs, each followed by a space (`"0A 1F "`).
    pub fn hex(&self) -> &str {
        &self.hex
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }
}

/// Render bytes as uppercase hex pairs, each followed by a single space.
pub fn to_hex_pairs(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for byte in data {
        // Writing into a String cannot fail.
        let _ = write!(out, "{:02X} ", byte);
    }
    out
}
