// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Light driven by a controller board on a serial port.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, ProtocolError};
use crate::manager::ReconnectionPolicy;
use crate::protocol::{MAX_LINE_LENGTH, SerialCommand, StatusLine};
use crate::state::DeviceState;

use super::{BoxedPort, SerialIo, spawn_until_cancelled};

/// Light connected through the controller board's line protocol.
///
/// Commands are queued and written by the link task, so intent changes never
/// wait on the port. The current intent is queued once on construction and
/// again after every reopen.
#[derive(Debug)]
pub struct SerialLight {
    name: String,
    port: String,
    reset_pin: Option<u32>,
    reconnection: ReconnectionPolicy,
    pub(super) state: Mutex<DeviceState>,
    outbound: mpsc::UnboundedSender<String>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl SerialLight {
    /// Creates a light for the board on `port`.
    ///
    /// The port is not opened until the link task is started.
    #[must_use]
    pub fn new(name: impl Into<String>, port: impl Into<String>) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let light = Self {
            name: name.into(),
            port: port.into(),
            reset_pin: None,
            reconnection: ReconnectionPolicy::default(),
            state: Mutex::new(DeviceState::new()),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        };
        light.send_update();
        light
    }

    /// Records the GPIO pin wired to the board's reset line.
    #[must_use]
    pub fn with_reset_pin(mut self, pin: Option<u32>) -> Self {
        self.reset_pin = pin;
        self
    }

    /// Sets the reopen backoff.
    #[must_use]
    pub fn with_reconnection(mut self, policy: ReconnectionPolicy) -> Self {
        self.reconnection = policy;
        self
    }

    /// Sets the staleness threshold.
    #[must_use]
    pub fn with_max_age(self, max_age: Duration) -> Self {
        self.state.lock().max_age = max_age;
        self
    }

    /// Returns the name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the serial device path.
    #[must_use]
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Returns the reset GPIO pin, if configured.
    #[must_use]
    pub fn reset_pin(&self) -> Option<u32> {
        self.reset_pin
    }

    pub(super) fn send_update(&self) {
        let (give_way, temp_error) = {
            let state = self.state.lock();
            (state.give_way, state.temp_error)
        };
        self.queue(SerialCommand::GiveWay(give_way));
        self.queue(SerialCommand::TempError(temp_error));
    }

    pub(super) fn set_config(&self, param: &str, value: i64) -> Result<(), ConfigError> {
        let command = SerialCommand::configure(param, value)?;
        tracing::info!(light = %self.name, param, value, "Changing board parameter");
        self.queue(command);
        Ok(())
    }

    fn queue(&self, command: SerialCommand) {
        // The receiver is only gone once the link task ended for good.
        if self.outbound.send(command.to_string()).is_err() {
            tracing::debug!(light = %self.name, %command, "Serial link stopped, dropping command");
        }
    }

    /// Applies one line received from the board.
    pub(crate) fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match StatusLine::parse(line) {
            Ok(status) => {
                let mut state = self.state.lock();
                state.state = status.state;
                state.batt_voltage = status.batt_voltage;
                state.lamp_currents = status.lamp_currents.to_vec();
                state.mark_seen();
            }
            Err(e) => {
                tracing::warn!(light = %self.name, error = %e, "Received garbled line");
            }
        }
    }

    pub(super) fn spawn_port_link(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        tracing::info!(
            light = %self.name,
            port = %self.port,
            reset_pin = ?self.reset_pin,
            "Starting serial link"
        );
        let port = self.port.clone();
        self.spawn_link(move || open_port(&port), cancel)
    }

    /// Runs the line protocol over streams produced by `connect`.
    ///
    /// A framing error or a closed stream drops the link; `connect` is then
    /// retried according to the reconnection policy. Returns `None` if the
    /// link was started before.
    pub fn spawn_link<S, C>(
        self: &Arc<Self>,
        mut connect: C,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>>
    where
        S: SerialIo + 'static,
        C: FnMut() -> Result<S, ProtocolError> + Send + 'static,
    {
        let Some(mut outbound_rx) = self.outbound_rx.lock().take() else {
            tracing::warn!(light = %self.name, "Serial link already running");
            return None;
        };
        let light = Arc::clone(self);

        Some(spawn_until_cancelled(cancel, async move {
            let mut attempt = 0;
            let mut opened_before = false;
            loop {
                match connect() {
                    Ok(stream) => {
                        attempt = 0;
                        tracing::info!(light = %light.name, port = %light.port, "Serial link open");
                        if opened_before {
                            light.send_update();
                        }
                        opened_before = true;
                        light.run_link(stream, &mut outbound_rx).await;
                    }
                    Err(e) => {
                        tracing::error!(light = %light.name, error = %e, "Cannot open serial port");
                    }
                }

                if !light.reconnection.should_retry(attempt) {
                    tracing::error!(light = %light.name, attempt, "Giving up on serial link");
                    return;
                }
                let delay = light.reconnection.delay_for_attempt(attempt);
                attempt += 1;
                tracing::debug!(light = %light.name, ?delay, "Reopening serial link");
                tokio::time::sleep(delay).await;
            }
        }))
    }

    async fn run_link<S: SerialIo>(
        &self,
        stream: S,
        outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    ) {
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        loop {
            tokio::select! {
                line = framed.next() => match line {
                    Some(Ok(line)) => self.handle_line(&line),
                    Some(Err(e)) => {
                        tracing::error!(light = %self.name, error = %e, "Line length exceeded or undecodable, baud rate error?");
                        return;
                    }
                    None => {
                        tracing::warn!(light = %self.name, "Serial link closed");
                        return;
                    }
                },
                Some(command) = outbound_rx.recv() => {
                    if let Err(e) = framed.send(command).await {
                        tracing::error!(light = %self.name, error = %e, "Serial write failed");
                        return;
                    }
                }
            }
        }
    }
}

/// Opens a serial device at the board's baud rate.
///
/// # Errors
///
/// Returns [`ProtocolError::Serial`] if the port cannot be opened, or if the
/// crate was built without the `serial` feature.
#[cfg(feature = "serial")]
pub fn open_port(path: &str) -> Result<BoxedPort, ProtocolError> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(path, crate::protocol::BAUD_RATE)
        .open_native_async()
        .map_err(|e| ProtocolError::Serial {
            port: path.to_string(),
            message: e.to_string(),
        })?;
    Ok(Box::new(port))
}

/// Opens a serial device at the board's baud rate.
///
/// # Errors
///
/// Always fails: serial support is disabled.
#[cfg(not(feature = "serial"))]
pub fn open_port(path: &str) -> Result<BoxedPort, ProtocolError> {
    Err(ProtocolError::Serial {
        port: path.to_string(),
        message: "built without serial support".to_string(),
    })
}
