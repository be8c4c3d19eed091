// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handheld controller for manual override on the master side.
//!
//! The handheld sends `G` (give way) or `g` (close), each of which also
//! clears the temporary error. It receives one status line per update:
//!
//! ```text
//! <lamp0 on> <lamp1 on> <lamp2 on> <state> <batt_voltage>
//! ```
//!
//! where a lamp counts as on above [`LAMP_ON_THRESHOLD`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};

use crate::protocol::MAX_LINE_LENGTH;
use crate::state::{DeviceState, LAMP_CHANNELS};

use super::SerialIo;
use super::group::GroupLight;

/// Current above which a lamp is reported as on.
pub const LAMP_ON_THRESHOLD: i32 = 10;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// An attached handheld controller.
#[derive(Debug)]
pub struct HandheldBridge {
    id: u64,
    path: String,
    outbound: mpsc::UnboundedSender<String>,
}

impl HandheldBridge {
    /// Creates a detached bridge and the receiving end of its status queue.
    ///
    /// The bridge must be stored in its group before [`Self::spawn_link`]
    /// runs, otherwise an immediate link loss cannot detach it.
    pub(super) fn new(path: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            path: path.to_string(),
            outbound,
        });
        (bridge, outbound_rx)
    }

    pub(super) fn spawn_link<S>(
        &self,
        group: Weak<GroupLight>,
        stream: S,
        outbound_rx: mpsc::UnboundedReceiver<String>,
    ) where
        S: SerialIo + 'static,
    {
        tokio::spawn(run(group, self.id, self.path.clone(), stream, outbound_rx));
    }

    /// Returns the identifier of this attachment.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the serial path of the controller.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    pub(super) fn send_status(&self, state: &DeviceState) {
        if self.outbound.send(status_line(state)).is_err() {
            tracing::debug!(path = %self.path, "Controller link gone, dropping status");
        }
    }
}

/// Formats the status line shown on the handheld.
///
/// Only the first three lamp channels are shown; for a group these are the
/// local ones.
#[must_use]
pub fn status_line(state: &DeviceState) -> String {
    state
        .lamp_currents
        .iter()
        .take(LAMP_CHANNELS)
        .map(|&current| String::from(if current > LAMP_ON_THRESHOLD { "1" } else { "0" }))
        .chain([state.state.to_string(), state.batt_voltage.to_string()])
        .collect::<Vec<_>>()
        .join(" ")
}

async fn run<S: SerialIo>(
    group: Weak<GroupLight>,
    id: u64,
    path: String,
    stream: S,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    loop {
        tokio::select! {
            line = framed.next() => match line {
                Some(Ok(line)) => {
                    tracing::debug!(%path, %line, "Received from controller");
                    let Some(group) = group.upgrade() else { return };
                    for c in line.chars() {
                        match c {
                            'G' => group.command_from_handheld(true),
                            'g' => group.command_from_handheld(false),
                            _ => {}
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::error!(%path, error = %e, "Controller link failed");
                    break;
                }
                None => break,
            },
            status = outbound_rx.recv() => match status {
                Some(status) => {
                    if let Err(e) = framed.send(status).await {
                        tracing::error!(%path, error = %e, "Controller write failed");
                        break;
                    }
                }
                None => return,
            },
        }
    }

    if let Some(group) = group.upgrade() {
        group.controller_lost(id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;
    use crate::device::{Device, GroupSettings, SimulatedLight};

    #[test]
    fn status_line_format() {
        let state = DeviceState {
            state: 3,
            batt_voltage: 12.5,
            lamp_currents: vec![0, 11, 60, 60, 0, 0],
            ..DeviceState::new()
        };
        assert_eq!(status_line(&state), "0 1 1 3 12.5");
    }

    #[test]
    fn threshold_is_exclusive() {
        let state = DeviceState {
            state: 0,
            batt_voltage: 12.0,
            lamp_currents: vec![10, 10, 10],
            ..DeviceState::new()
        };
        assert_eq!(status_line(&state), "0 0 0 0 12");
    }

    fn master_group() -> Arc<GroupLight> {
        let group = Arc::new(GroupLight::new(
            "crossing",
            GroupSettings::new("local", "remote")
                .with_master(true)
                .with_controller_paths(Vec::new()),
        ));
        let lights = [
            ("local".to_string(), Device::from(SimulatedLight::new("local", 0.0))),
            ("remote".to_string(), Device::from(SimulatedLight::new("remote", 0.0))),
        ]
        .into_iter()
        .collect();
        Device::Group(Arc::clone(&group))
            .dereference(&lights)
            .unwrap();
        group
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn link_closed_at_attach_is_detached() {
        let groups: Vec<_> = (0..200)
            .map(|_| {
                let group = master_group();
                let (handheld, port) = tokio::io::duplex(64);
                drop(handheld);
                group.attach_controller("/dev/ttyUSB0", port);
                group
            })
            .collect();

        tokio::time::timeout(Duration::from_secs(5), async {
            while groups.iter().any(|g| g.controller().is_some()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("every dead controller is detached");
    }

    #[tokio::test]
    async fn commands_reach_group_and_loss_detaches() {
        let group = master_group();

        let (handheld, port) = tokio::io::duplex(256);
        let bridge = group.attach_controller("/dev/ttyUSB0", port);
        assert_eq!(group.controller().map(|c| c.id()), Some(bridge.id()));

        let (handheld_rx, mut handheld_tx) = tokio::io::split(handheld);
        handheld_tx.write_all(b"g\n").await.unwrap();

        // The command triggers an update, which is echoed as a status line.
        let mut lines = BufReader::new(handheld_rx).lines();
        let status = tokio::time::timeout(Duration::from_secs(1), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(status.split(' ').count(), 5);
        assert!(!group.state.lock().give_way());

        drop(handheld_tx);
        drop(lines);
        tokio::time::timeout(Duration::from_secs(1), async {
            while group.controller().is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
