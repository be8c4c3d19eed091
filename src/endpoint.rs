// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Status resource of a light, independent of any HTTP server.
//!
//! A host server routes `GET` and `POST` on `/<light>/status` to
//! [`StatusEndpoint::get`] and [`StatusEndpoint::post`], passing the raw
//! query string or form body.

use std::collections::BTreeMap;
use std::fmt;

use crate::device::Device;

/// Answer to a `POST` on the status resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    /// At least one field was applied.
    Ok,
    /// The caller may not change this light.
    NotWriteable,
    /// A field did not hold an integer.
    ValueError,
    /// No known field was present.
    NotOk,
}

impl PostOutcome {
    /// Returns the response body.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NotWriteable => "not writeable",
            Self::ValueError => "value error",
            Self::NotOk => "not ok",
        }
    }
}

impl fmt::Display for PostOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `GET`/`POST` handlers for one light.
///
/// # Examples
///
/// ```
/// use ampel_sync::device::{Device, SimulatedLight};
/// use ampel_sync::endpoint::{PostOutcome, StatusEndpoint};
///
/// let light = Device::from(SimulatedLight::new("sim", 0.0));
/// light.set_group_key(Some("secret"));
/// let endpoint = StatusEndpoint::new(light);
///
/// assert_eq!(endpoint.post("giveway=0"), PostOutcome::NotWriteable);
/// assert_eq!(endpoint.post("key=secret&giveway=0"), PostOutcome::Ok);
/// assert!(!endpoint.device().snapshot().give_way());
/// ```
#[derive(Debug, Clone)]
pub struct StatusEndpoint {
    device: Device,
}

impl StatusEndpoint {
    /// Creates the endpoint for `device`.
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    /// Returns the served light.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Handles `GET`; a `challenge` parameter selects the signed envelope.
    #[must_use]
    pub fn get(&self, query: &str) -> Vec<u8> {
        let mut params = parse_form(query);
        self.device.to_wire(params.remove("challenge").as_deref())
    }

    /// Handles `POST` with the form fields `key`, `giveway` and
    /// `temp_error`.
    #[must_use]
    pub fn post(&self, form: &str) -> PostOutcome {
        let fields = parse_form(form);
        if !self.device.is_writable(fields.get("key").map(String::as_str)) {
            tracing::warn!(light = %self.device.name(), "Rejected write without valid key");
            return PostOutcome::NotWriteable;
        }

        let mut handled = false;
        if let Some(raw) = fields.get("giveway") {
            let Some(give_way) = flag(raw) else {
                return PostOutcome::ValueError;
            };
            self.device.set_green(give_way);
            handled = true;
        }
        if let Some(raw) = fields.get("temp_error") {
            let Some(temp_error) = flag(raw) else {
                return PostOutcome::ValueError;
            };
            self.device.set_temp_error(temp_error);
            handled = true;
        }

        if handled {
            PostOutcome::Ok
        } else {
            PostOutcome::NotOk
        }
    }
}

fn flag(raw: &str) -> Option<bool> {
    raw.trim().parse::<i64>().ok().map(|value| value != 0)
}

/// Decodes `application/x-www-form-urlencoded` pairs; the first occurrence
/// of a name wins.
fn parse_form(input: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    for pair in input.trim_start_matches('?').split('&') {
        if pair.is_empty() {
            continue;
        }
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        fields.entry(decode(name)).or_insert_with(|| decode(value));
    }
    fields
}

fn decode(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}
