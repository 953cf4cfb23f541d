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

//! RFCOMM Terminal

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rfcomm_terminal::bluetooth::{BluezTransport, ConnectOutcome, LineEnding};
use rfcomm_terminal::commands::{ConsoleCommand, DeviceRef, HELP};
use rfcomm_terminal::config::Config;
use rfcomm_terminal::device::Device;
use rfcomm_terminal::events::EventPrinter;
use rfcomm_terminal::SerialConsole;

/// Per-run terminal settings changed by commands.
struct Session {
    eol: LineEnding,
    hex_input: bool,
    printer: EventPrinter,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rfcomm_terminal=info".parse()?),
        )
        .init();

    info!("Starting RFCOMM Terminal v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    let transport = BluezTransport::new(&config.bluetooth).await?;
    info!("Local adapter address: {}", transport.address().await?);

    let console = SerialConsole::new(Arc::new(transport), &config.terminal);
    let mut events = console.subscribe();
    let mut state_rx = console.watch_state();

    if config.bluetooth.discover_on_start {
        if let Err(e) = console.start_watching().await {
            error!("Failed to start discovery: {}", e);
        }
    }
    if config.bluetooth.listen_on_start {
        if let Err(e) = console.set_listening(true).await {
            error!("Failed to start listening: {}", e);
        }
    }

    let mut session = Session {
        eol: config.terminal.line_ending,
        hex_input: config.terminal.hex_input,
        printer: EventPrinter::new(config.terminal.hex_input),
    };

    println!("Type 'help' for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match ConsoleCommand::parse(&line) {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(command) => execute(&console, &mut session, command).await,
                    Err(usage) if usage.is_empty() => {}
                    Err(usage) => println!("{}", usage),
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(line) = session.printer.render(&event) {
                        println!("{}", line);
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Console fell behind, {} events dropped", n),
                Err(RecvError::Closed) => break,
            },
            Ok(()) = state_rx.changed() => {
                let state = *state_rx.borrow_and_update();
                println!("[{}]", state);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    console.disconnect();
    if let Err(e) = console.set_listening(false).await {
        warn!("Failed to stop listening: {}", e);
    }

    info!("RFCOMM Terminal stopped");
    Ok(())
}

async fn execute(console: &SerialConsole, session: &mut Session, command: ConsoleCommand) {
    match command {
        ConsoleCommand::Devices => {
            let selected = console.selected_device();
            for (i, device) in console.devices().iter().enumerate() {
                let mark = if selected.as_deref() == Some(device.as_ref()) {
                    '*'
                } else {
                    ' '
                };
                println!("{}{:>3}  {:<24} {}", mark, i + 1, device.name(), device.id());
            }
        }
        ConsoleCommand::Refresh => match console.refresh().await {
            Ok(n) => println!("{} devices found", n),
            Err(e) => println!("error: {}", e),
        },
        ConsoleCommand::Select(target) => match resolve(console, &target) {
            Some(device) => {
                console.select(device.id());
            }
            None => println!("no such device"),
        },
        ConsoleCommand::Connect(target) => {
            let result = match target {
                Some(target) => match resolve(console, &target) {
                    Some(device) => console.connect(Some(device)).await,
                    None => {
                        println!("no such device");
                        return;
                    }
                },
                None => console.connect_selected().await,
            };
            match result {
                Ok(ConnectOutcome::Connected) => {}
                Ok(ConnectOutcome::Busy) => println!("already {}", console.state()),
                Ok(ConnectOutcome::NoService) => println!("device offers no serial port"),
                Err(e) => println!("error: {}", e),
            }
        }
        ConsoleCommand::Disconnect => {
            if !console.disconnect() {
                println!("not connected");
            }
        }
        ConsoleCommand::Send(text) => send(console, &text, session.hex_input, session.eol).await,
        ConsoleCommand::Hex(pairs) => send(console, &pairs, true, session.eol).await,
        ConsoleCommand::Eol(eol) => {
            session.eol = eol;
            println!("line ending: {}", eol.name());
        }
        ConsoleCommand::Listen(enable) => {
            if let Err(e) = console.set_listening(enable).await {
                println!("error: {}", e);
            }
        }
        ConsoleCommand::Log => match current_device(console) {
            Some(device) => {
                for message in console.transcript(&device) {
                    println!("{}", session.printer.render_message(&message));
                }
            }
            None => println!("no device"),
        },
        ConsoleCommand::Clear => match current_device(console) {
            Some(device) => console.clear_transcript(&device),
            None => println!("no device"),
        },
        ConsoleCommand::Info => {
            println!("state: {}", console.state());
            println!("listening: {}", console.is_listening());
            println!("line ending: {}", session.eol.name());
            println!("hex input: {}", session.hex_input);
            if let Some(device) = console.selected_device() {
                println!("{}", device.summary());
            }
        }
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
}

async fn send(console: &SerialConsole, text: &str, as_hex: bool, eol: LineEnding) {
    match console.send(text, as_hex, eol).await {
        Ok(Some(_)) => {}
        Ok(None) => println!("not connected"),
        Err(e) => println!("error: {}", e),
    }
}

fn resolve(console: &SerialConsole, target: &DeviceRef) -> Option<Arc<Device>> {
    match target {
        DeviceRef::Index(n) => console.devices().get(n - 1).cloned(),
        DeviceRef::Id(id) => console.device(id),
    }
}

/// The connected device, else the selected one.
fn current_device(console: &SerialConsole) -> Option<Arc<Device>> {
    console.active_device().or_else(|| console.selected_device())
}
