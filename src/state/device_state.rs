// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device state tracking.

use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::TransportCodec;

use super::WireStatus;

/// State code of a light that never reported.
pub const UNINITIALIZED: u8 = 99;
/// State code of a hard fault.
pub const HARD_ERROR: u8 = 9;
/// State code forced while a temporary error is active.
pub const TEMP_ERROR: u8 = 8;

/// Number of physical lamp channels of a single light.
pub const LAMP_CHANNELS: usize = 3;

/// Age after which a light that stopped reporting counts as unseen.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(4);

/// Returns the nominal lamp currents for a state code.
///
/// Codes outside the operating cycle map to all lamps off.
#[must_use]
pub fn lamp_currents_for(state: u8) -> [i32; LAMP_CHANNELS] {
    match state {
        0 | 5 => [60, 0, 0],
        1 | 6 => [60, 60, 0],
        2 => [60, 60, 60],
        3 => [0, 0, 60],
        4 => [0, 60, 0],
        TEMP_ERROR => [0, 30, 0],
        HARD_ERROR => [0, 25, 0],
        _ => [0, 0, 0],
    }
}

/// Tracked state of a traffic light.
///
/// Holds both the reported telemetry (`state`, battery voltage, lamp
/// currents) and the commanded intent (`give_way`, `temp_error`), plus the
/// access flags consulted by the web interface.
///
/// # Examples
///
/// ```
/// use ampel_sync::state::{DeviceState, UNINITIALIZED};
///
/// let state = DeviceState::new();
/// assert_eq!(state.state(), UNINITIALIZED);
/// assert!(state.give_way());
/// assert!(!state.seen());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub(crate) state: u8,
    pub(crate) batt_voltage: f64,
    pub(crate) lamp_currents: Vec<i32>,
    pub(crate) last_seen: Option<Instant>,
    pub(crate) max_age: Duration,
    pub(crate) give_way: bool,
    pub(crate) temp_error: bool,
    pub(crate) read_only: bool,
    pub(crate) web_writeable: bool,
    pub(crate) group_key: Option<String>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            state: UNINITIALIZED,
            batt_voltage: 0.0,
            lamp_currents: vec![0; LAMP_CHANNELS],
            last_seen: None,
            max_age: DEFAULT_MAX_AGE,
            give_way: true,
            temp_error: false,
            read_only: false,
            web_writeable: false,
            group_key: None,
        }
    }
}

impl DeviceState {
    /// Creates a state for a light that has not reported yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Telemetry ==========

    /// Returns the state code.
    #[must_use]
    pub fn state(&self) -> u8 {
        self.state
    }

    /// Returns the battery voltage.
    #[must_use]
    pub fn batt_voltage(&self) -> f64 {
        self.batt_voltage
    }

    /// Returns the lamp currents.
    ///
    /// Single lights report one value per channel; groups report the local
    /// channels followed by the remote ones.
    #[must_use]
    pub fn lamp_currents(&self) -> &[i32] {
        &self.lamp_currents
    }

    // ========== Staleness ==========

    /// Returns when the light last confirmed its state.
    #[must_use]
    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    /// Returns the staleness threshold.
    #[must_use]
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Records a confirmed update now.
    pub fn mark_seen(&mut self) {
        self.last_seen = Some(Instant::now());
    }

    /// Returns `true` if the light reported within `max_age`.
    #[must_use]
    pub fn seen(&self) -> bool {
        self.seen_at(Instant::now())
    }

    /// Same as [`seen`](Self::seen), evaluated at `now`.
    #[must_use]
    pub fn seen_at(&self, now: Instant) -> bool {
        self.last_seen
            .is_some_and(|last| now.saturating_duration_since(last) < self.max_age)
    }

    /// Returns `true` if the light is seen and not in hard error.
    #[must_use]
    pub fn is_good(&self) -> bool {
        self.state != HARD_ERROR && self.seen()
    }

    // ========== Intent ==========

    /// Returns the commanded give-way intent.
    #[must_use]
    pub fn give_way(&self) -> bool {
        self.give_way
    }

    /// Returns the temporary error flag.
    #[must_use]
    pub fn temp_error(&self) -> bool {
        self.temp_error
    }

    // ========== Access ==========

    /// Returns `true` if updates must not be pushed to this light.
    #[must_use]
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Returns the shared group secret, if any.
    #[must_use]
    pub fn group_key(&self) -> Option<&str> {
        self.group_key.as_deref()
    }

    /// Returns the envelope codec for the group key, if one is set.
    #[must_use]
    pub fn codec(&self) -> Option<TransportCodec> {
        self.group_key.as_deref().map(TransportCodec::new)
    }

    /// Tests whether an external caller holding `key` may change this light.
    #[must_use]
    pub fn is_writable(&self, key: Option<&str>) -> bool {
        if self.web_writeable {
            return true;
        }
        match (&self.group_key, key) {
            (Some(group_key), Some(key)) => group_key == key,
            _ => false,
        }
    }

    /// Overwrites reported and commanded fields from a peer's status.
    pub(crate) fn apply_wire(&mut self, wire: &WireStatus) {
        self.state = wire.state;
        self.batt_voltage = wire.batt_voltage;
        self.lamp_currents.clone_from(&wire.lamp_currents);
        self.give_way = wire.give_way;
        self.temp_error = wire.temp_error;
    }
}
