// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fleet of lights: configuration, construction and scheduling.
//!
//! A [`Fleet`] owns every light of the process together with the
//! cancellation token of their timers. It is built from a [`FleetConfig`],
//! usually decoded from TOML:
//!
//! ```toml
//! [lights.local]
//! type = "serial"            # serial | group | dummy | remote
//! port = "/dev/serial0"
//! reset_pin = 17
//! [lights.local.settings]
//! min_on_current = 20
//! [lights.local.reconnect]
//! initial_delay = 1
//! max_delay = 30
//! backoff = 2
//!
//! [lights.peer]
//! type = "remote"
//! url = "http://peer:8880/peer/status"
//! interval = 0.25
//!
//! [lights.crossing]
//! type = "group"
//! i_am_master = "yes"
//! local = "local"
//! remote = "peer"
//! max_diverge = 10
//! group_key = "secret"
//! ```
//!
//! # Examples
//!
//! ```
//! use ampel_sync::manager::{Fleet, FleetConfig, LightConfig, DummyConfig};
//!
//! let config = FleetConfig::new().with_light(
//!     "sim",
//!     LightConfig::Dummy(DummyConfig { fail_probability: 0.0 }),
//! );
//! let fleet = Fleet::build(config)?;
//! assert_eq!(fleet.interface_listing(), r#"["sim"]"#);
//! # Ok::<(), ampel_sync::Error>(())
//! ```

mod device_config;
mod fleet;

pub use device_config::{
    DummyConfig, FleetConfig, GroupConfig, LightConfig, ReconnectConfig, ReconnectionPolicy,
    RemoteConfig, SerialConfig,
};
pub use fleet::Fleet;
