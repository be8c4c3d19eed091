// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Authenticated challenge-response envelope.
//!
//! A poller sends a fresh random challenge with each request. The answering
//! side injects the challenge and a timestamp into the payload, serialises it
//! (`raw`) and signs it with HMAC-SHA256 over the shared group key (`hash`):
//!
//! ```json
//! { "raw": "{\"_time\":1712345678.12,\"challenge\":\"…\",\"state\":3,…}",
//!   "hash": "5f0c…" }
//! ```
//!
//! The challenge lives inside the signed region, so a captured answer cannot
//! be replayed against a later poll.

use std::fmt;

use rand::seq::SliceRandom;
use ring::hmac;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;

/// Length of a generated challenge.
pub const CHALLENGE_LEN: usize = 32;

const TIME_FIELD: &str = "_time";
const CHALLENGE_FIELD: &str = "challenge";

#[derive(Serialize)]
struct Envelope<'a> {
    raw: &'a str,
    hash: &'a str,
}

#[derive(Deserialize)]
struct ReceivedEnvelope {
    raw: Option<String>,
    hash: Option<String>,
}

/// Signs and verifies envelopes with a shared group key.
///
/// # Examples
///
/// ```
/// use ampel_sync::protocol::TransportCodec;
/// use serde_json::json;
///
/// let codec = TransportCodec::new("group secret");
/// let challenge = TransportCodec::make_challenge();
///
/// let envelope = codec.encapsulate(&challenge, &json!({"state": 3})).unwrap();
/// let payload: serde_json::Value = codec
///     .decapsulate(envelope.as_bytes(), &challenge)
///     .unwrap()
///     .expect("signature verifies");
/// assert_eq!(payload["state"], 3);
/// ```
#[derive(Clone)]
pub struct TransportCodec {
    key: hmac::Key,
}

impl TransportCodec {
    /// Creates a codec for the given group secret.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
        }
    }

    /// Generates a single-use challenge.
    ///
    /// The token consists of [`CHALLENGE_LEN`] distinct printable ASCII
    /// characters.
    #[must_use]
    pub fn make_challenge() -> String {
        let printable: Vec<char> = ('!'..='~').collect();
        printable
            .choose_multiple(&mut rand::thread_rng(), CHALLENGE_LEN)
            .collect()
    }

    /// Signs `payload`, bound to `challenge`.
    ///
    /// The payload is cloned into a JSON object, `_time` and `challenge` are
    /// added, and the result is serialised and signed.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not serialise to a JSON object.
    pub fn encapsulate<T: Serialize + ?Sized>(
        &self,
        challenge: &str,
        payload: &T,
    ) -> Result<String, CodecError> {
        let Value::Object(mut fields) = serde_json::to_value(payload)? else {
            return Err(CodecError::MalformedPacket(
                "payload is not a JSON object".to_string(),
            ));
        };
        fields.insert(TIME_FIELD.to_string(), Value::from(unix_time()));
        fields.insert(
            CHALLENGE_FIELD.to_string(),
            Value::String(challenge.to_string()),
        );

        let raw = serde_json::to_string(&fields)?;
        let hash = self.digest(&raw);
        Ok(serde_json::to_string(&Envelope {
            raw: &raw,
            hash: &hash,
        })?)
    }

    /// Verifies an envelope and returns its payload.
    ///
    /// Returns `Ok(None)` when the signature does not match: the answer is
    /// not trusted, but this is an expected outcome with a dishonest or
    /// misconfigured peer.
    ///
    /// # Errors
    ///
    /// - [`CodecError::MalformedPacket`] if `raw` or `hash` is missing
    /// - [`CodecError::ChallengeMismatch`] if the signed payload answers a
    ///   different challenge (replay or cross-talk)
    /// - [`CodecError::Json`] if the signed payload cannot be decoded as `T`
    pub fn decapsulate<T: DeserializeOwned>(
        &self,
        envelope: &[u8],
        expected_challenge: &str,
    ) -> Result<Option<T>, CodecError> {
        let packet: ReceivedEnvelope = serde_json::from_slice(envelope)
            .map_err(|e| CodecError::MalformedPacket(e.to_string()))?;
        let (Some(raw), Some(hash)) = (packet.raw, packet.hash) else {
            return Err(CodecError::MalformedPacket(
                "missing raw or hash".to_string(),
            ));
        };

        let Some(tag) = decode_hex(&hash) else {
            return Ok(None);
        };
        if hmac::verify(&self.key, raw.as_bytes(), &tag).is_err() {
            return Ok(None);
        }

        let payload: Value = serde_json::from_str(&raw)?;
        let actual = payload
            .get(CHALLENGE_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default();
        if actual != expected_challenge {
            return Err(CodecError::ChallengeMismatch {
                expected: expected_challenge.to_string(),
                actual: actual.to_string(),
            });
        }

        Ok(Some(serde_json::from_value(payload)?))
    }

    fn digest(&self, raw: &str) -> String {
        hmac::sign(&self.key, raw.as_bytes())
            .as_ref()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

impl fmt::Debug for TransportCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportCodec").finish_non_exhaustive()
    }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

// Fractional seconds, as expected by peers reading `_time`.
#[allow(clippy::cast_precision_loss)]
fn unix_time() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
