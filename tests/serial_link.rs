// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration tests for the serial line protocol over in-memory streams.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ampel_sync::device::{Device, GroupLight, GroupSettings, SerialLight, SimulatedLight};
use ampel_sync::manager::ReconnectionPolicy;
use ampel_sync::{ProtocolError, StatusEndpoint};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio_util::sync::CancellationToken;

fn no_more_ports() -> ProtocolError {
    ProtocolError::Serial {
        port: "test".to_string(),
        message: "no more ports".to_string(),
    }
}

fn board(light: &Arc<SerialLight>, cancel: &CancellationToken) -> DuplexStream {
    let (board, port) = tokio::io::duplex(1024);
    let mut port = Some(port);
    light
        .spawn_link(move || port.take().ok_or_else(no_more_ports), cancel.clone())
        .expect("first link");
    board
}

#[tokio::test]
async fn board_follows_commands_and_reports_status() {
    let device = Device::from(
        SerialLight::new("local", "/dev/ttyTEST")
            .with_reconnection(ReconnectionPolicy::disabled()),
    );
    let Device::Serial(light) = &device else {
        unreachable!()
    };
    let cancel = CancellationToken::new();
    let (board_rx, mut board_tx) = tokio::io::split(board(light, &cancel));
    let mut commands = BufReader::new(board_rx).lines();

    assert_eq!(commands.next_line().await.unwrap().unwrap(), "G");
    assert_eq!(commands.next_line().await.unwrap().unwrap(), "e");

    device.set_green(false);
    device.set_green(false);
    device.set_temp_error(true);
    device.set_config("min_on_current", 15).unwrap();
    assert_eq!(commands.next_line().await.unwrap().unwrap(), "g");
    assert_eq!(commands.next_line().await.unwrap().unwrap(), "e");
    assert_eq!(commands.next_line().await.unwrap().unwrap(), "g");
    assert_eq!(commands.next_line().await.unwrap().unwrap(), "E");
    assert_eq!(commands.next_line().await.unwrap().unwrap(), "s0=15");

    board_tx.write_all(b"garbage\n5 12.3 0 0 58 0\r\n").await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), async {
        while !device.seen() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    let state = device.snapshot();
    assert_eq!(state.state(), 5);
    assert_eq!(state.lamp_currents(), &[0, 58, 0]);
    assert!(device.is_good());

    let wire: serde_json::Value =
        serde_json::from_slice(&StatusEndpoint::new(device.clone()).get("")).unwrap();
    assert_eq!(wire["state"], 5);
    assert_eq!(wire["good"], true);
    assert_eq!(wire["give_way"], false);
    assert_eq!(wire["temp_error"], true);

    cancel.cancel();
}

#[tokio::test]
async fn handheld_controller_drives_group() {
    let local = Device::from(SimulatedLight::new("local", 0.0));
    let other = Device::from(SimulatedLight::new("other", 0.0));
    let group = Arc::new(GroupLight::new(
        "crossing",
        GroupSettings::new("local", "other")
            .with_master(true)
            .with_controller_paths(Vec::new()),
    ));
    let lights: BTreeMap<String, Device> = [("local", &local), ("other", &other)]
        .into_iter()
        .map(|(name, light)| (name.to_string(), light.clone()))
        .collect();
    Device::Group(Arc::clone(&group))
        .dereference(&lights)
        .unwrap();

    let (handheld, port) = tokio::io::duplex(1024);
    group.attach_controller("/dev/ttyHANDHELD", port);
    let (handheld_rx, mut handheld_tx) = tokio::io::split(handheld);
    let mut status = BufReader::new(handheld_rx).lines();

    handheld_tx.write_all(b"g\n").await.unwrap();
    let line = status.next_line().await.unwrap().unwrap();
    assert_eq!(line.split_whitespace().count(), 5);
    assert!(!local.snapshot().give_way());

    drop(handheld_tx);
    drop(status);
    tokio::time::timeout(Duration::from_secs(1), async {
        while group.controller().is_some() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}
