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

//! Change notifications and their console rendering.

use std::sync::Arc;

use crate::device::Device;
use crate::error::SerialError;
use crate::message::{Direction, Message};

/// Notifications published to observers of the serial session.
///
/// Connection state changes go through a `watch` channel instead.
#[derive(Debug, Clone)]
pub enum SerialEvent {
    /// A serial-capable device appeared.
    DeviceAdded(Arc<Device>),
    /// A device disappeared.
    DeviceRemoved(String),
    /// The selection changed (`None` when cleared).
    SelectionChanged(Option<String>),
    /// A message was appended to a device's transcript.
    MessageAppended { device_id: String, message: Message },
    /// A device's transcript was cleared.
    TranscriptCleared(String),
    /// Listen mode was switched on or off.
    ListeningChanged(bool),
    /// A failure detected outside of a user call.
    Error(SerialError),
}

/// Renders events as console lines.
#[derive(Debug, Clone, Default)]
pub struct EventPrinter {
    show_hex: bool,
}

impl EventPrinter {
    pub fn new(show_hex: bool) -> Self {
        Self { show_hex }
    }

    /// Render an event, or `None` for events not worth printing.
    pub fn render(&self, event: &SerialEvent) -> Option<String> {
        match event {
            SerialEvent::DeviceAdded(device) => {
                Some(format!("+ {} [{}]", device.name(), device.id()))
            }
            SerialEvent::DeviceRemoved(id) => Some(format!("- {}", id)),
            SerialEvent::SelectionChanged(Some(id)) => Some(format!("selected {}", id)),
            SerialEvent::SelectionChanged(None) => None,
            SerialEvent::MessageAppended { message, .. } => Some(self.render_message(message)),
            SerialEvent::TranscriptCleared(id) => Some(format!("transcript of {} cleared", id)),
            SerialEvent::ListeningChanged(true) => Some("listening for connections".to_string()),
            SerialEvent::ListeningChanged(false) => Some("not listening".to_string()),
            SerialEvent::Error(e) => Some(format!("error: {}", e)),
        }
    }

    /// Render one transcript line.
    pub fn render_message(&self, message: &Message) -> String {
        let arrow = match message.direction() {
            Direction::Sent => ">>",
            Direction::Received => "<<",
        };
        let time = message.created_at().format("%H:%M:%S%.3f");
        if self.show_hex {
            format!("[{}] {} {}", time, arrow, message.hex().trim_end())
        } else {
            format!("[{}] {} {}", time, arrow, message.text().escape_debug())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_message_text_and_hex() {
        let message = Message::received(b"ok\r\n".to_vec());

        let text = EventPrinter::new(false).render_message(&message);
        assert!(text.contains("<< ok\\r\\n"));

        let hex = EventPrinter::new(true).render_message(&message);
        assert!(hex.ends_with("<< 6F 6B 0D 0A"));
    }

    #[test]
    fn test_render_events() {
        let printer = EventPrinter::default();
        assert_eq!(
            printer.render(&SerialEvent::DeviceRemoved("dev-1".into())),
            Some("- dev-1".to_string())
        );
        assert_eq!(printer.render(&SerialEvent::SelectionChanged(None)), None);
        assert_eq!(
            printer.render(&SerialEvent::Error(SerialError::ReadFailed)),
            Some(format!("error: {}", SerialError::ReadFailed))
        );
    }
}
