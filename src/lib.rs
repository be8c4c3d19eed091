// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `ampel_sync` - Synchronises a pair of portable traffic lights.
//!
//! Two lights guarding a single-lane passage each run an instance of this
//! library. One side is the master: it decides which direction gets to go.
//! The other side is the slave and follows. Both sides continuously compare
//! their own light with the peer's and raise a temporary error when they
//! disagree for too long.
//!
//! # Building Blocks
//!
//! - **Devices** ([`device`]): serial controller boards, simulated lights,
//!   remote peers polled over HTTP, and groups that reconcile a local and a
//!   remote light
//! - **Transport** ([`protocol`]): HMAC-signed challenge-response envelope,
//!   the peer HTTP client, and the serial line protocol
//! - **Fleet** ([`manager`]): builds every light from TOML and runs their
//!   timers
//! - **Status resource** ([`endpoint`]): `GET`/`POST` handlers a host web
//!   server mounts per light
//!
//! # Quick Start
//!
//! ```no_run
//! use ampel_sync::{Fleet, StatusEndpoint};
//!
//! #[tokio::main]
//! async fn main() -> ampel_sync::Result<()> {
//!     let fleet = Fleet::from_toml_str(r#"
//!         [lights.local]
//!         type = "serial"
//!         port = "/dev/serial0"
//!
//!         [lights.peer]
//!         type = "remote"
//!         url = "http://peer:8880/peer/status"
//!
//!         [lights.crossing]
//!         type = "group"
//!         i_am_master = "yes"
//!         local = "local"
//!         remote = "peer"
//!         group_key = "secret"
//!     "#)?;
//!     fleet.start();
//!
//!     let endpoint = StatusEndpoint::new(fleet.device("crossing")?.clone());
//!     let answer = endpoint.post("key=secret&giveway=0");
//!     println!("{answer}");
//!
//!     fleet.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Simulation
//!
//! A pair of simulated lights is enough to exercise the reconciliation
//! without hardware:
//!
//! ```
//! use ampel_sync::device::{Device, SimulatedLight};
//!
//! let light = Device::from(SimulatedLight::new("sim", 0.0));
//! let Device::Simulated(sim) = &light else { unreachable!() };
//! sim.run_tick();
//! assert!(light.seen());
//! ```

pub mod device;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod state;

pub use device::{Device, GroupLight, Health, RemoteLight, SerialLight, SimulatedLight};
pub use endpoint::{PostOutcome, StatusEndpoint};
pub use error::{
    CodecError, ConfigError, DeviceError, Error, ParseError, ProtocolError, Result,
};
pub use manager::{Fleet, FleetConfig, LightConfig};
pub use protocol::TransportCodec;
pub use state::{DeviceState, WireStatus};
