// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciliation of a local and a remote light into one signal.
//!
//! A [`GroupLight`] is checked every [`CHECK_PERIOD`]. Each check evaluates
//! the [`Health`] of the pair, derives the temporary error from it and pushes
//! the group's intent down to the local light:
//!
//! | Health               | Temporary error         |
//! |----------------------|-------------------------|
//! | `Good`               | cleared                 |
//! | `Diverging`          | unchanged               |
//! | `Bad`                | set                     |
//! | `MaxDivergeExceeded` | set                     |
//!
//! A slave additionally follows the give-way intent of its remote (the
//! master) whenever it can see it.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, DeviceError, Error, ProtocolError};
use crate::state::{DeviceState, HARD_ERROR};

use super::handheld::HandheldBridge;
use super::serial::open_port;
use super::{Device, SerialIo, every};

/// Period of the reconciliation check.
pub const CHECK_PERIOD: Duration = Duration::from_millis(250);

/// Default tolerance for diverging give-way intents.
pub const DEFAULT_MAX_DIVERGE: Duration = Duration::from_secs(10);

/// Outcome of one evaluation of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Both sides are seen, agree and are free of hard errors.
    Good,
    /// Both sides are seen but disagree, for less than `max_diverge`.
    Diverging,
    /// A side is unseen or in hard error.
    Bad,
    /// The sides disagreed for `max_diverge` or longer.
    MaxDivergeExceeded,
}

impl Health {
    /// Returns `true` for outcomes that raise the temporary error.
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Bad | Self::MaxDivergeExceeded)
    }
}

/// Configuration of a [`GroupLight`].
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSettings {
    i_am_master: bool,
    local: String,
    remote: String,
    max_diverge: Duration,
    group_key: Option<String>,
    controller_paths: Vec<String>,
}

impl GroupSettings {
    /// Creates settings for a slave group of the named lights.
    #[must_use]
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            i_am_master: false,
            local: local.into(),
            remote: remote.into(),
            max_diverge: DEFAULT_MAX_DIVERGE,
            group_key: None,
            controller_paths: default_controller_paths(),
        }
    }

    /// Sets the master role.
    #[must_use]
    pub fn with_master(mut self, i_am_master: bool) -> Self {
        self.i_am_master = i_am_master;
        self
    }

    /// Sets the divergence tolerance.
    #[must_use]
    pub fn with_max_diverge(mut self, max_diverge: Duration) -> Self {
        self.max_diverge = max_diverge;
        self
    }

    /// Sets the shared group secret.
    #[must_use]
    pub fn with_group_key(mut self, group_key: Option<String>) -> Self {
        self.group_key = group_key;
        self
    }

    /// Sets the serial paths searched for a handheld controller.
    #[must_use]
    pub fn with_controller_paths(mut self, paths: Vec<String>) -> Self {
        self.controller_paths = paths;
        self
    }

    /// Returns `true` for the master role.
    #[must_use]
    pub fn i_am_master(&self) -> bool {
        self.i_am_master
    }

    /// Returns the name of the local light.
    #[must_use]
    pub fn local(&self) -> &str {
        &self.local
    }

    /// Returns the name of the remote light.
    #[must_use]
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Returns the divergence tolerance.
    #[must_use]
    pub fn max_diverge(&self) -> Duration {
        self.max_diverge
    }

    /// Returns the searched controller paths.
    #[must_use]
    pub fn controller_paths(&self) -> &[String] {
        &self.controller_paths
    }
}

/// `/dev/ttyUSB0`, `/dev/ttyACM0`, … `/dev/ttyUSB4`, `/dev/ttyACM4`.
fn default_controller_paths() -> Vec<String> {
    (0..5)
        .flat_map(|i| [format!("/dev/ttyUSB{i}"), format!("/dev/ttyACM{i}")])
        .collect()
}

#[derive(Debug)]
struct Members {
    local: Device,
    remote: Device,
}

#[derive(Debug)]
struct Reconciliation {
    start_divergence: Option<Instant>,
    health: Health,
}

/// A local and a remote light acting as one.
///
/// The group's state and lamp currents are derived on every check and cannot
/// be written from outside. Only the master accepts give-way commands from
/// the web interface or a handheld controller.
#[derive(Debug)]
pub struct GroupLight {
    name: String,
    settings: GroupSettings,
    pub(super) state: Mutex<DeviceState>,
    members: OnceLock<Members>,
    reconcile: Mutex<Reconciliation>,
    controller: Mutex<Option<Arc<HandheldBridge>>>,
}

impl GroupLight {
    /// Creates a group. Its members are resolved by
    /// [`Device::dereference`].
    #[must_use]
    pub fn new(name: impl Into<String>, settings: GroupSettings) -> Self {
        let state = DeviceState {
            group_key: settings.group_key.clone(),
            ..DeviceState::new()
        };
        Self {
            name: name.into(),
            settings,
            state: Mutex::new(state),
            members: OnceLock::new(),
            reconcile: Mutex::new(Reconciliation {
                start_divergence: None,
                health: Health::Bad,
            }),
            controller: Mutex::new(None),
        }
    }

    /// Returns the name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the settings.
    #[must_use]
    pub fn settings(&self) -> &GroupSettings {
        &self.settings
    }

    /// Returns `true` once the members are resolved.
    #[must_use]
    pub fn is_dereferenced(&self) -> bool {
        self.members.get().is_some()
    }

    /// Returns the outcome of the last check.
    #[must_use]
    pub fn health(&self) -> Health {
        self.reconcile.lock().health
    }

    /// Returns the attached handheld controller.
    #[must_use]
    pub fn controller(&self) -> Option<Arc<HandheldBridge>> {
        self.controller.lock().clone()
    }

    pub(super) fn seen(&self) -> bool {
        self.members
            .get()
            .is_some_and(|m| m.local.seen() && m.remote.seen())
    }

    pub(super) fn is_good(&self) -> bool {
        self.is_dereferenced() && !self.health().is_failure()
    }

    pub(super) fn dereference(&self, lights: &BTreeMap<String, Device>) -> Result<(), Error> {
        let resolve = |role: &'static str, name: &str| -> Result<Device, Error> {
            if name == self.name {
                return Err(ConfigError::InvalidValue {
                    field: role.to_string(),
                    message: format!("group {name} cannot contain itself"),
                }
                .into());
            }
            lights.get(name).cloned().ok_or_else(|| {
                DeviceError::UnresolvedReference {
                    role,
                    name: name.to_string(),
                }
                .into()
            })
        };
        let local = resolve("local", &self.settings.local)?;
        let remote = resolve("remote", &self.settings.remote)?;

        let master = self.settings.i_am_master;
        let key = self.settings.group_key.as_deref();
        remote.set_read_only(!master);
        remote.set_group_key(key);
        local.set_group_key(key);
        {
            let mut state = self.state.lock();
            state.group_key = key.map(str::to_string);
            state.web_writeable = master;
        }

        if self.members.set(Members { local, remote }).is_err() {
            tracing::warn!(light = %self.name, "Already dereferenced, keeping first members");
        }
        Ok(())
    }

    /// Evaluates the pair at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NotDereferenced`] before the members are
    /// resolved.
    pub fn evaluate(&self, now: Instant) -> Result<Health, DeviceError> {
        let members = self
            .members
            .get()
            .ok_or_else(|| DeviceError::NotDereferenced(self.name.clone()))?;

        let (local_seen, remote_seen) = (members.local.seen(), members.remote.seen());
        if !local_seen || !remote_seen {
            tracing::debug!(light = %self.name, local_seen, remote_seen, "Member not seen");
            return Ok(Health::Bad);
        }

        let (local, remote) = (members.local.snapshot(), members.remote.snapshot());
        let mut reconcile = self.reconcile.lock();
        if local.give_way != remote.give_way {
            let since = *reconcile.start_divergence.get_or_insert(now);
            if now.saturating_duration_since(since) >= self.settings.max_diverge {
                return Ok(Health::MaxDivergeExceeded);
            }
            return Ok(Health::Diverging);
        }

        reconcile.start_divergence = None;
        if local.state == HARD_ERROR || remote.state == HARD_ERROR {
            Ok(Health::Bad)
        } else {
            Ok(Health::Good)
        }
    }

    /// Runs one reconciliation step.
    ///
    /// Returns the evaluated health, or `None` before the members are
    /// resolved.
    pub fn check(self: &Arc<Self>) -> Option<Health> {
        let Some(members) = self.members.get() else {
            tracing::debug!(light = %self.name, "Cannot check yet, not dereferenced");
            return None;
        };

        let master = self.settings.i_am_master;
        if master && self.controller.lock().is_none() {
            self.find_controller();
        }

        let health = self.evaluate(Instant::now()).ok()?;
        match health {
            Health::Good => tracing::info!(light = %self.name, "good"),
            Health::Diverging => tracing::info!(light = %self.name, "Diverged, try to realign"),
            Health::Bad | Health::MaxDivergeExceeded => {
                tracing::error!(light = %self.name, ?health, "Temporary error");
            }
        }

        let local = members.local.snapshot();
        let remote = members.remote.snapshot();
        let remote_seen = members.remote.seen();
        let follow_master = !master && remote_seen;
        if follow_master {
            tracing::info!(
                light = %self.name,
                remote_give_way = remote.give_way,
                remote_temp_error = remote.temp_error,
                "Will try to sync from master"
            );
        }
        let source = if remote_seen { &remote } else { &local };

        // Intent may be changed concurrently by the endpoint or the
        // handheld: read and write it under one guard.
        {
            let mut state = self.state.lock();
            let temp_error = match health {
                _ if follow_master && !health.is_failure() => remote.temp_error,
                Health::Good => false,
                Health::Diverging => state.temp_error,
                Health::Bad | Health::MaxDivergeExceeded => true,
            };
            if follow_master && state.give_way != remote.give_way {
                tracing::debug!(light = %self.name, give_way = remote.give_way, "Following master");
                state.give_way = remote.give_way;
            }
            if state.temp_error != temp_error {
                tracing::debug!(light = %self.name, temp_error, "Temporary error changed");
                state.temp_error = temp_error;
            }
            state.state = source.state;
            state.batt_voltage = source.batt_voltage;
            state.lamp_currents = local
                .lamp_currents
                .iter()
                .chain(&remote.lamp_currents)
                .copied()
                .collect();
        }
        self.reconcile.lock().health = health;

        self.send_update();
        Some(health)
    }

    pub(super) fn send_update(&self) {
        let Some(members) = self.members.get() else {
            return;
        };
        let state = self.state.lock().clone();
        members.local.set_green(state.give_way);
        members.local.set_temp_error(state.temp_error);

        let controller = self.controller.lock().clone();
        if let Some(controller) = controller {
            controller.send_status(&state);
        }
    }

    /// Applies a give-way command from the handheld controller.
    ///
    /// The command also clears the temporary error.
    pub fn command_from_handheld(&self, give_way: bool) {
        {
            let mut state = self.state.lock();
            state.give_way = give_way;
            state.temp_error = false;
        }
        tracing::info!(light = %self.name, give_way, "Handheld command");
        self.send_update();
    }

    /// Attaches a handheld controller talking over `stream`.
    pub fn attach_controller<S>(self: &Arc<Self>, path: &str, stream: S) -> Arc<HandheldBridge>
    where
        S: SerialIo + 'static,
    {
        let (bridge, outbound_rx) = HandheldBridge::new(path);
        *self.controller.lock() = Some(Arc::clone(&bridge));
        tracing::info!(light = %self.name, path, "Handheld controller attached");
        bridge.spawn_link(Arc::downgrade(self), stream, outbound_rx);
        bridge
    }

    /// Forgets the controller with `id` after its link was lost.
    pub(crate) fn controller_lost(&self, id: u64) {
        let mut controller = self.controller.lock();
        if controller.as_ref().is_some_and(|c| c.id() == id) {
            tracing::warn!(light = %self.name, "Handheld controller lost");
            *controller = None;
        }
    }

    fn find_controller(self: &Arc<Self>) {
        self.find_controller_with(open_port);
    }

    /// Attaches the first configured path that exists and opens.
    fn find_controller_with<S, F>(self: &Arc<Self>, mut open: F) -> Option<Arc<HandheldBridge>>
    where
        S: SerialIo + 'static,
        F: FnMut(&str) -> Result<S, ProtocolError>,
    {
        for path in &self.settings.controller_paths {
            tracing::trace!(light = %self.name, %path, "Looking for controller");
            if !Path::new(path).exists() {
                continue;
            }
            match open(path) {
                Ok(port) => return Some(self.attach_controller(path, port)),
                Err(e) => {
                    tracing::error!(light = %self.name, %path, error = %e, "Opening controller failed");
                }
            }
        }
        None
    }

    pub(super) fn spawn_checks(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let group = Arc::clone(self);
        every(CHECK_PERIOD, cancel, move || {
            group.check();
        })
    }
}
