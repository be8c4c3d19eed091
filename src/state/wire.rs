// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! JSON status exchanged between peers.

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

use super::{DeviceState, LAMP_CHANNELS};

/// The status object served on `GET …/status` and carried inside envelopes.
///
/// ```json
/// { "state": 3, "batt_voltage": 12.6, "lamp_currents": [0, 0, 60],
///   "good": true, "give_way": false, "temp_error": false }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireStatus {
    /// State code.
    pub state: u8,
    /// Battery voltage.
    pub batt_voltage: f64,
    /// Lamp currents.
    pub lamp_currents: Vec<i32>,
    /// Whether the sender considers itself healthy.
    pub good: bool,
    /// Commanded give-way intent.
    pub give_way: bool,
    /// Temporary error flag.
    pub temp_error: bool,
}

impl WireStatus {
    /// Builds the wire form of a state.
    #[must_use]
    pub fn from_state(state: &DeviceState, good: bool) -> Self {
        Self {
            state: state.state,
            batt_voltage: state.batt_voltage,
            lamp_currents: state.lamp_currents.clone(),
            good,
            give_way: state.give_way,
            temp_error: state.temp_error,
        }
    }

    /// Checks that the status describes exactly one light.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidValue`] if the lamp current count is wrong.
    pub fn validate_single(&self) -> Result<(), ParseError> {
        if self.lamp_currents.len() == LAMP_CHANNELS {
            Ok(())
        } else {
            Err(ParseError::InvalidValue {
                field: "lamp_currents".to_string(),
                message: format!(
                    "expected {LAMP_CHANNELS} channels, got {}",
                    self.lamp_currents.len()
                ),
            })
        }
    }
}
