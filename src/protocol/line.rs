// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Newline-delimited ASCII protocol spoken by the light controller board.
//!
//! The board reports one status line per cycle:
//!
//! ```text
//! <state> <batt_voltage> <error_state> <lamp0> <lamp1> <lamp2>
//! ```
//!
//! and accepts single-line commands: `G`/`g` (give way / close),
//! `E`/`e` (set / clear temporary error) and `s<index>=<value>` to change a
//! threshold.

use std::fmt;
use std::str::FromStr;

use crate::error::{ConfigError, ParseError};
use crate::state::LAMP_CHANNELS;

/// Baud rate of every serial link.
pub const BAUD_RATE: u32 = 19_200;

/// Longest line accepted before the link is considered out of sync.
pub const MAX_LINE_LENGTH: usize = 256;

/// A decoded status line.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusLine {
    /// State code.
    pub state: u8,
    /// Battery voltage as reported by the board.
    pub batt_voltage: f64,
    /// Board-internal error indicator.
    pub error_state: i32,
    /// Measured lamp currents.
    pub lamp_currents: [i32; LAMP_CHANNELS],
}

impl StatusLine {
    /// Parses a status line.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::MalformedLine`] on a wrong field count and
    /// [`ParseError::InvalidValue`] on a non-numeric field.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [state, batt, error_state, l0, l1, l2] = fields.as_slice() else {
            return Err(ParseError::MalformedLine(line.to_string()));
        };

        Ok(Self {
            state: number("state", state)?,
            batt_voltage: number("batt_voltage", batt)?,
            error_state: number("error_state", error_state)?,
            lamp_currents: [
                number("lamp_currents[0]", l0)?,
                number("lamp_currents[1]", l1)?,
                number("lamp_currents[2]", l2)?,
            ],
        })
    }
}

fn number<T>(field: &str, raw: &str) -> Result<T, ParseError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ParseError::InvalidValue {
        field: field.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}

/// A command sent to the controller board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialCommand {
    /// Open (`true`) or close (`false`) the way.
    GiveWay(bool),
    /// Set or clear the temporary error.
    TempError(bool),
    /// Change a board threshold.
    Configure {
        /// Parameter slot on the board.
        index: u8,
        /// New value.
        value: i64,
    },
}

impl SerialCommand {
    /// Builds a threshold command from a parameter name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownParameter`] for names the board does
    /// not know.
    pub fn configure(param: &str, value: i64) -> Result<Self, ConfigError> {
        Ok(Self::Configure {
            index: config_index(param)?,
            value,
        })
    }
}

impl fmt::Display for SerialCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GiveWay(true) => f.write_str("G"),
            Self::GiveWay(false) => f.write_str("g"),
            Self::TempError(true) => f.write_str("E"),
            Self::TempError(false) => f.write_str("e"),
            Self::Configure { index, value } => write!(f, "s{index}={value}"),
        }
    }
}

/// Maps a threshold name to its slot on the board.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownParameter`] for unknown names.
pub fn config_index(param: &str) -> Result<u8, ConfigError> {
    match param {
        "min_on_current" => Ok(0),
        "max_on_current" => Ok(1),
        "max_off_current" => Ok(2),
        other => Err(ConfigError::UnknownParameter(other.to_string())),
    }
}
