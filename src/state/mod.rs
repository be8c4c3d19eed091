// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Traffic light state types.
//!
//! Every light variant holds a [`DeviceState`]. The [`WireStatus`] is the
//! JSON shape exchanged with peers and served to the web interface.
//!
//! # Examples
//!
//! ```
//! use ampel_sync::state::{DeviceState, WireStatus};
//!
//! let mut state = DeviceState::new();
//! state.mark_seen();
//! assert!(state.seen());
//!
//! let wire = WireStatus::from_state(&state, state.is_good());
//! assert_eq!(wire.lamp_currents.len(), 3);
//! ```

mod device_state;
mod wire;

pub use device_state::{
    DEFAULT_MAX_AGE, DeviceState, HARD_ERROR, LAMP_CHANNELS, TEMP_ERROR, UNINITIALIZED,
    lamp_currents_for,
};
pub use wire::WireStatus;
