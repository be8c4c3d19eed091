// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Traffic light devices.
//!
//! A [`Device`] is a cheap, clonable handle to one of four light variants:
//!
//! - [`SerialLight`]: controller board on a serial port
//! - [`SimulatedLight`]: self-driving test double with failure injection
//! - [`RemoteLight`]: a peer's light, polled over HTTP
//! - [`GroupLight`]: a local and a remote light reconciled into one signal
//!
//! All variants share the same contract. Intent changes (`set_green`,
//! `set_temp_error`) are edge-triggered: only an actual change pushes an
//! update downstream.
//!
//! ```
//! use ampel_sync::device::{Device, SimulatedLight};
//!
//! let light = Device::from(SimulatedLight::new("sim", 0.0));
//! light.set_green(false);
//! light.set_green(false);
//!
//! let Device::Simulated(sim) = &light else { unreachable!() };
//! assert_eq!(sim.updates_sent(), 1);
//! ```

mod group;
mod handheld;
mod remote;
mod serial;
mod simulated;

pub use group::{GroupLight, GroupSettings, Health};
pub use handheld::HandheldBridge;
pub use remote::RemoteLight;
pub use serial::SerialLight;
pub use simulated::{Faults, SimulatedLight};

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{CodecError, DeviceError, Error, ParseError, ProtocolError};
use crate::protocol::TransportCodec;
use crate::state::{DeviceState, WireStatus};

/// A byte stream a line protocol can run over.
pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialIo for T {}

/// An opened serial port.
pub type BoxedPort = Box<dyn SerialIo>;

/// Handle to a traffic light.
#[derive(Debug, Clone)]
pub enum Device {
    /// Controller board on a serial port.
    Serial(Arc<SerialLight>),
    /// Simulated light.
    Simulated(Arc<SimulatedLight>),
    /// Peer light polled over HTTP.
    Remote(Arc<RemoteLight>),
    /// Local and remote light reconciled into one.
    Group(Arc<GroupLight>),
}

impl Device {
    /// Returns the configured name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Serial(light) => light.name(),
            Self::Simulated(light) => light.name(),
            Self::Remote(light) => light.name(),
            Self::Group(light) => light.name(),
        }
    }

    /// Returns the configuration type name of the variant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Serial(_) => "serial",
            Self::Simulated(_) => "dummy",
            Self::Remote(_) => "remote",
            Self::Group(_) => "group",
        }
    }

    fn cell(&self) -> &Mutex<DeviceState> {
        match self {
            Self::Serial(light) => &light.state,
            Self::Simulated(light) => &light.state,
            Self::Remote(light) => &light.state,
            Self::Group(light) => &light.state,
        }
    }

    /// Returns a copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> DeviceState {
        self.cell().lock().clone()
    }

    /// Returns `true` if the light reported within its `max_age`.
    ///
    /// A group is seen only while both of its members are.
    #[must_use]
    pub fn seen(&self) -> bool {
        match self {
            Self::Group(group) => group.seen(),
            _ => self.cell().lock().seen(),
        }
    }

    /// Returns `true` if the light is seen and not in hard error.
    ///
    /// A group is good while it is dereferenced and its last reconciliation
    /// was not a failure.
    #[must_use]
    pub fn is_good(&self) -> bool {
        match self {
            Self::Group(group) => group.is_good(),
            _ => self.cell().lock().is_good(),
        }
    }

    /// Tests whether an external caller holding `key` may change this light.
    #[must_use]
    pub fn is_writable(&self, key: Option<&str>) -> bool {
        self.cell().lock().is_writable(key)
    }

    /// Commands the give-way intent; pushes an update only on change.
    pub fn set_green(&self, give_way: bool) {
        let changed = {
            let mut state = self.cell().lock();
            std::mem::replace(&mut state.give_way, give_way) != give_way
        };
        if changed {
            if give_way {
                tracing::debug!(light = %self.name(), "Should give way");
            } else {
                tracing::debug!(light = %self.name(), "Should close way");
            }
            self.send_update();
        }
    }

    /// Sets the temporary error flag; pushes an update only on change.
    pub fn set_temp_error(&self, temp_error: bool) {
        let changed = {
            let mut state = self.cell().lock();
            std::mem::replace(&mut state.temp_error, temp_error) != temp_error
        };
        if changed {
            if temp_error {
                tracing::debug!(light = %self.name(), "Received temp error");
            } else {
                tracing::debug!(light = %self.name(), "No temp error");
            }
            self.send_update();
        }
    }

    /// Pushes the current intent downstream.
    pub fn send_update(&self) {
        match self {
            Self::Serial(light) => light.send_update(),
            Self::Simulated(light) => light.send_update(),
            Self::Remote(light) => light.send_update(),
            Self::Group(light) => light.send_update(),
        }
    }

    /// Serialises the state for the web interface or a polling peer.
    ///
    /// With a challenge the status is wrapped in a signed envelope. A
    /// challenge without a configured group key is logged and answered with
    /// plain status JSON.
    #[must_use]
    pub fn to_wire(&self, challenge: Option<&str>) -> Vec<u8> {
        let state = self.snapshot();
        let wire = WireStatus::from_state(&state, self.is_good());

        if let Some(challenge) = challenge {
            match state.codec() {
                Some(codec) => match codec.encapsulate(challenge, &wire) {
                    Ok(envelope) => return envelope.into_bytes(),
                    Err(e) => {
                        tracing::error!(light = %self.name(), error = %e, "Signing status failed");
                    }
                },
                None => {
                    tracing::error!(light = %self.name(), "Missing transport codec for challenge");
                }
            }
        }

        serde_json::to_vec(&wire).unwrap_or_default()
    }

    /// Adopts a status received from a peer.
    ///
    /// # Errors
    ///
    /// Fails without touching the state if the body cannot be decoded, the
    /// envelope does not verify, or this is a group (whose state is derived).
    pub fn from_wire(&self, body: &[u8], challenge: Option<&str>) -> Result<(), Error> {
        if let Self::Group(group) = self {
            return Err(DeviceError::DerivedState(group.name().to_string()).into());
        }
        let codec = self.cell().lock().codec();
        let wire = decode_wire(codec.as_ref(), body, challenge)?;
        tracing::debug!(light = %self.name(), ?wire, "Adopting status");
        self.cell().lock().apply_wire(&wire);
        Ok(())
    }

    /// Clears injected faults. Only simulated lights have any.
    pub fn reset(&self) {
        if let Self::Simulated(light) = self {
            light.reset();
        }
    }

    /// Resolves symbolic peer names against the full set of lights.
    ///
    /// # Errors
    ///
    /// Returns an error if a group references an unknown light.
    pub fn dereference(&self, lights: &BTreeMap<String, Device>) -> Result<(), Error> {
        match self {
            Self::Group(group) => group.dereference(lights),
            _ => Ok(()),
        }
    }

    /// Sets the shared group secret.
    pub fn set_group_key(&self, key: Option<&str>) {
        self.cell().lock().group_key = key.map(str::to_string);
    }

    /// Marks the light as read-only for pushed updates.
    pub fn set_read_only(&self, read_only: bool) {
        self.cell().lock().read_only = read_only;
    }

    /// Changes a hardware parameter.
    ///
    /// Only serial lights have parameters; the call is ignored elsewhere.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown parameter names.
    pub fn set_config(&self, param: &str, value: i64) -> Result<(), Error> {
        match self {
            Self::Serial(light) => Ok(light.set_config(param, value)?),
            _ => {
                tracing::debug!(light = %self.name(), param, "Ignoring parameter");
                Ok(())
            }
        }
    }

    /// Spawns the timers and I/O tasks that keep this light alive.
    pub fn spawn_tasks(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        match self {
            Self::Serial(light) => light.spawn_port_link(cancel.clone()).into_iter().collect(),
            Self::Simulated(light) => light.spawn_ticks(cancel),
            Self::Remote(light) => vec![light.spawn_polling(cancel.clone())],
            Self::Group(light) => vec![light.spawn_checks(cancel.clone())],
        }
    }
}

impl From<SerialLight> for Device {
    fn from(light: SerialLight) -> Self {
        Self::Serial(Arc::new(light))
    }
}

impl From<SimulatedLight> for Device {
    fn from(light: SimulatedLight) -> Self {
        Self::Simulated(Arc::new(light))
    }
}

impl From<RemoteLight> for Device {
    fn from(light: RemoteLight) -> Self {
        Self::Remote(Arc::new(light))
    }
}

impl From<GroupLight> for Device {
    fn from(light: GroupLight) -> Self {
        Self::Group(Arc::new(light))
    }
}

/// Decodes a status body, verifying the envelope when a challenge is given.
pub(crate) fn decode_wire(
    codec: Option<&TransportCodec>,
    body: &[u8],
    challenge: Option<&str>,
) -> Result<WireStatus, Error> {
    let wire: WireStatus = match challenge {
        None => serde_json::from_slice(body).map_err(ParseError::Json)?,
        Some(challenge) => codec
            .ok_or(CodecError::MissingKey)?
            .decapsulate(body, challenge)?
            .ok_or(ProtocolError::AuthenticationFailed)?,
    };
    wire.validate_single()?;
    Ok(wire)
}

/// Runs `tick` every `period` until cancelled.
///
/// Ticks that fall behind are skipped, so `tick` never overlaps itself.
pub(crate) fn every<F>(period: Duration, cancel: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    spawn_until_cancelled(cancel, async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            tick();
        }
    })
}

fn spawn_until_cancelled<F>(cancel: CancellationToken, task: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => {}
            () = task => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::HARD_ERROR;

    fn simulated() -> (Device, Arc<SimulatedLight>) {
        let light = Arc::new(SimulatedLight::new("sim", 0.0));
        (Device::Simulated(Arc::clone(&light)), light)
    }

    #[test]
    fn set_green_is_edge_triggered() {
        let (device, light) = simulated();
        assert!(device.snapshot().give_way());

        device.set_green(false);
        device.set_green(false);
        assert_eq!(light.updates_sent(), 1);
        assert!(!device.snapshot().give_way());

        device.set_green(true);
        assert_eq!(light.updates_sent(), 2);
    }

    #[test]
    fn set_temp_error_is_edge_triggered() {
        let (device, light) = simulated();
        device.set_temp_error(false);
        assert_eq!(light.updates_sent(), 0);

        device.set_temp_error(true);
        device.set_temp_error(true);
        assert_eq!(light.updates_sent(), 1);
    }

    #[test]
    fn plain_wire_round_trip() {
        let (source, light) = simulated();
        light.run_tick();
        source.set_green(false);

        let (target, _) = simulated();
        target.from_wire(&source.to_wire(None), None).unwrap();

        let (a, b) = (source.snapshot(), target.snapshot());
        assert_eq!(a.state(), b.state());
        assert_eq!(a.lamp_currents(), b.lamp_currents());
        assert_eq!(a.give_way(), b.give_way());
        assert!((a.batt_voltage() - b.batt_voltage()).abs() < 1e-9);
    }

    #[test]
    fn enveloped_wire_round_trip() {
        let (source, light) = simulated();
        light.run_tick();
        source.set_temp_error(true);
        source.set_group_key(Some("secret"));

        let (target, _) = simulated();
        target.set_group_key(Some("secret"));

        let body = source.to_wire(Some("c1"));
        target.from_wire(&body, Some("c1")).unwrap();
        assert!(target.snapshot().temp_error());
        assert_eq!(target.snapshot().state(), source.snapshot().state());
    }

    #[test]
    fn wrong_key_leaves_state_unchanged() {
        let (source, light) = simulated();
        light.run_tick();
        source.set_group_key(Some("secret"));

        let (target, _) = simulated();
        target.set_group_key(Some("other"));
        let before = target.snapshot();

        let err = target
            .from_wire(&source.to_wire(Some("c1")), Some("c1"))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::AuthenticationFailed)
        ));
        assert_eq!(target.snapshot(), before);
    }

    #[test]
    fn challenge_without_key_falls_back_to_plain_json() {
        let (source, _) = simulated();
        let body = source.to_wire(Some("c1"));
        let wire: WireStatus = serde_json::from_slice(&body).unwrap();
        assert_eq!(wire.state, 0);
    }

    #[test]
    fn from_wire_rejects_wrong_channel_count() {
        let (target, _) = simulated();
        let body = br#"{"state":9,"batt_voltage":1.0,"lamp_currents":[1],"good":false,"give_way":true,"temp_error":false}"#;
        assert!(target.from_wire(body, None).is_err());
        assert_ne!(target.snapshot().state(), HARD_ERROR);
    }

    #[test]
    fn writable_only_with_group_key() {
        let (device, _) = simulated();
        assert!(!device.is_writable(Some("secret")));
        device.set_group_key(Some("secret"));
        assert!(device.is_writable(Some("secret")));
    }

    #[test]
    fn set_config_is_ignored_by_simulator() {
        let (device, _) = simulated();
        assert!(device.set_config("min_on_current", 3).is_ok());
        assert_eq!(device.kind(), "dummy");
    }
}
