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

//! Serial Port Profile constants and outbound payload encoding.
//!
//! The channel is an unstructured byte stream; the only shaping done here is
//! line-ending rewriting for text input and hex decoding for binary input.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SerialError;

/// Standard SPP UUID.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// Default size of the receive buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Line ending applied to text payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    /// `\n`
    #[default]
    Lf,
    /// `\r\n`
    CrLf,
    /// `\r`
    Cr,
}

impl LineEnding {
    /// Line ending native to the platform we run on.
    pub const PLATFORM: LineEnding = if cfg!(windows) {
        LineEnding::CrLf
    } else {
        LineEnding::Lf
    };

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lf => "\n",
            Self::CrLf => "\r\n",
            Self::Cr => "\r",
        }
    }

    /// Short name as used in configuration and commands.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Lf => "lf",
            Self::CrLf => "crlf",
            Self::Cr => "cr",
        }
    }

    /// Parse from a short name (`lf`, `crlf`, `cr`; `unix`, `dos`, `mac` also accepted).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "lf" | "unix" => Some(Self::Lf),
            "crlf" | "dos" => Some(Self::CrLf),
            "cr" | "mac" => Some(Self::Cr),
            _ => None,
        }
    }
}

/// Decode whitespace-separated hex byte pairs.
///
/// Each token must be an even-length run of hex digits, so `"41 42"` and
/// `"4142"` both decode to `[0x41, 0x42]`.
pub fn parse_hex(input: &str) -> Result<Vec<u8>, SerialError> {
    let mut bytes = Vec::with_capacity(input.len() / 2);
    for token in input.split_whitespace() {
        let decoded =
            hex::decode(token).map_err(|e| SerialError::InvalidHexInput(format!("{token:?}: {e}")))?;
        bytes.extend_from_slice(&decoded);
    }
    Ok(bytes)
}

/// Encode text as UTF-8, rewriting line breaks when `eol` is not the platform default.
pub fn encode_text(text: &str, eol: LineEnding) -> Vec<u8> {
    if eol == LineEnding::PLATFORM {
        return text.as_bytes().to_vec();
    }

    let target = eol.as_str();
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str(target);
            }
            '\n' => out.push_str(target),
            other => out.push(other),
        }
    }
    out.into_bytes()
}

/// Build the bytes for one `send` call.
pub fn encode_payload(text: &str, as_hex: bool, eol: LineEnding) -> Result<Vec<u8>, SerialError> {
    if as_hex {
        parse_hex(text)
    } else {
        Ok(encode_text(text, eol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_pairs() {
        assert_eq!(parse_hex("41 42").unwrap(), vec![0x41, 0x42]);
        assert_eq!(parse_hex("4142").unwrap(), vec![0x41, 0x42]);
        assert_eq!(parse_hex("  0a\t1F\n").unwrap(), vec![0x0A, 0x1F]);
        assert_eq!(parse_hex("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_parse_hex_rejects_malformed() {
        assert!(matches!(parse_hex("ZZ"), Err(SerialError::InvalidHexInput(_))));
        assert!(matches!(parse_hex("41 4"), Err(SerialError::InvalidHexInput(_))));
        assert!(matches!(parse_hex("41 0x42"), Err(SerialError::InvalidHexInput(_))));
    }

    #[test]
    #[cfg(not(windows))]
    fn test_encode_text_crlf() {
        assert_eq!(encode_text("a\nb", LineEnding::CrLf), b"a\r\nb".to_vec());
        assert_eq!(encode_text("a\r\nb\rc", LineEnding::CrLf), b"a\r\nb\r\nc".to_vec());
    }

    #[test]
    #[cfg(not(windows))]
    fn test_encode_text_cr() {
        assert_eq!(encode_text("x\ny\r\n", LineEnding::Cr), b"x\ry\r".to_vec());
    }

    #[test]
    fn test_encode_text_platform_default_is_verbatim() {
        let text = "a\r\nb\nc";
        assert_eq!(encode_text(text, LineEnding::PLATFORM), text.as_bytes().to_vec());
    }

    #[test]
    #[cfg(not(windows))]
    fn test_encode_text_utf8() {
        assert_eq!(encode_text("é", LineEnding::Cr), vec![0xC3, 0xA9]);
    }

    #[test]
    fn test_line_ending_parse() {
        assert_eq!(LineEnding::parse("CRLF"), Some(LineEnding::CrLf));
        assert_eq!(LineEnding::parse("mac"), Some(LineEnding::Cr));
        assert_eq!(LineEnding::parse("lf"), Some(LineEnding::Lf));
        assert_eq!(LineEnding::parse("nl"), None);
    }
}
