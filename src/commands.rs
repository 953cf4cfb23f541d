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

//! Console command parsing.
//!
//! Maps lines typed at the terminal prompt to actions.

use crate::bluetooth::LineEnding;

/// Help text listing every command.
pub const HELP: &str = "\
devices            list serial port devices
refresh            re-enumerate visible devices
select <n|id>      select a device
connect [n|id]     connect to a device (default: selection)
disconnect         close the connection
send <text>        send text
hex <pairs>        send hex bytes, e.g. hex 41 42 0D
eol <lf|crlf|cr>   line ending for sent text
listen <on|off>    accept incoming connections
log                show the transcript of the active device
clear              clear the transcript of the active device
info               show details of the selected device
help               show this help
quit               exit";

/// Reference to a device by list position (1-based) or by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRef {
    Index(usize),
    Id(String),
}

impl DeviceRef {
    fn parse(s: &str) -> Self {
        match s.parse::<usize>() {
            Ok(n) if n > 0 => Self::Index(n),
            _ => Self::Id(s.to_string()),
        }
    }
}

/// Console command types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Devices,
    Refresh,
    Select(DeviceRef),
    Connect(Option<DeviceRef>),
    Disconnect,
    Send(String),
    Hex(String),
    Eol(LineEnding),
    Listen(bool),
    Log,
    Clear,
    Info,
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parse one input line.
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim_start();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest),
            None => (line, ""),
        };
        let arg = rest.trim();

        match word.to_lowercase().as_str() {
            "devices" | "ls" => Ok(Self::Devices),
            "refresh" => Ok(Self::Refresh),
            "select" if !arg.is_empty() => Ok(Self::Select(DeviceRef::parse(arg))),
            "select" => Err("usage: select <n|id>".to_string()),
            "connect" if arg.is_empty() => Ok(Self::Connect(None)),
            "connect" => Ok(Self::Connect(Some(DeviceRef::parse(arg)))),
            "disconnect" => Ok(Self::Disconnect),
            // Payload keeps inner and trailing spaces
            "send" => Ok(Self::Send(rest.to_string())),
            "hex" => Ok(Self::Hex(arg.to_string())),
            "eol" => LineEnding::parse(arg)
                .map(Self::Eol)
                .ok_or_else(|| "usage: eol <lf|crlf|cr>".to_string()),
            "listen" => match arg.to_lowercase().as_str() {
                "on" => Ok(Self::Listen(true)),
                "off" => Ok(Self::Listen(false)),
                _ => Err("usage: listen <on|off>".to_string()),
            },
            "log" => Ok(Self::Log),
            "clear" => Ok(Self::Clear),
            "info" => Ok(Self::Info),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            "" => Err(String::new()),
            other => Err(format!("unknown command: {other} (try help)")),
        }
    }
}
