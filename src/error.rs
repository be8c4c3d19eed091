// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `ampel_sync` library.
//!
//! Failures are grouped by where they originate: the authenticated
//! envelope, the transport to a peer or serial port, decoding of state
//! data, device wiring, and configuration.

use thiserror::Error;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// The authenticated envelope could not be processed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Error occurred during protocol communication.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Error occurred while parsing state data.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Error occurred during device operations.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// The configuration of a light is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No light with this name exists.
    #[error("light not found: {0}")]
    LightNotFound(String),
}

/// Errors raised by the authenticated challenge-response envelope.
///
/// A digest mismatch is not an error here: it is reported as
/// `Ok(None)` by [`TransportCodec::decapsulate`](crate::protocol::TransportCodec::decapsulate).
#[derive(Debug, Error)]
pub enum CodecError {
    /// The envelope lacks `raw` or `hash`, or is not a JSON object.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// The envelope was valid but bound to a different challenge.
    #[error("challenge mismatch: expected {expected:?}, got {actual:?}")]
    ChallengeMismatch {
        /// The challenge sent with the request.
        expected: String,
        /// The challenge found inside the authenticated region.
        actual: String,
    },

    /// A challenge was supplied but no group key is configured.
    #[error("no group key configured")]
    MissingKey,

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors related to communication with peers and serial ports.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The peer answered, but not with a success status.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The peer's answer failed HMAC verification.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Serial port could not be opened or used.
    #[error("serial port {port}: {message}")]
    Serial {
        /// The device path.
        port: String,
        /// Description of the failure.
        message: String,
    },
}

/// Errors related to decoding state data.
#[derive(Debug, Error)]
pub enum ParseError {
    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// A status line did not have the expected layout.
    #[error("malformed status line: {0:?}")]
    MalformedLine(String),

    /// Failed to parse a specific value.
    #[error("failed to parse {field}: {message}")]
    InvalidValue {
        /// The field that failed to parse.
        field: String,
        /// Description of the parsing failure.
        message: String,
    },
}

/// Errors related to device operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// A group was used before its peer names were resolved.
    #[error("group {0} is not dereferenced yet")]
    NotDereferenced(String),

    /// A symbolic peer name did not match any configured light.
    #[error("cannot find light {name:?} for {role}")]
    UnresolvedReference {
        /// Which side of the group referenced the name.
        role: &'static str,
        /// The unresolved name.
        name: String,
    },

    /// The caller tried to overwrite state that a group derives itself.
    #[error("state of group {0} is derived from its members")]
    DerivedState(String),
}

/// Errors related to light configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The `type` of a light is not known.
    #[error("unknown light type: {0}")]
    UnknownType(String),

    /// A configuration parameter is not known.
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    /// A parameter has an unusable value.
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// The offending parameter.
        field: String,
        /// Description of the problem.
        message: String,
    },

    /// The configuration document could not be decoded.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;
