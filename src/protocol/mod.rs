// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire protocols spoken by the lights.
//!
//! - [`TransportCodec`]: HMAC-signed challenge-response envelope between peers
//! - [`PeerClient`]: HTTP access to a peer's status resource
//! - [`StatusLine`] / [`SerialCommand`]: line protocol of the controller board

mod http;
mod line;
mod transport;

pub use http::{DEFAULT_TIMEOUT, PeerClient, PeerClientBuilder};
pub use line::{BAUD_RATE, MAX_LINE_LENGTH, SerialCommand, StatusLine, config_index};
pub use transport::{CHALLENGE_LEN, TransportCodec};
