// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Light configuration for the fleet.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::device::{Device, GroupLight, GroupSettings, RemoteLight, SerialLight, SimulatedLight};
use crate::error::{ConfigError, Error};

/// Configuration of a light on a serial port.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerialConfig {
    /// Serial device path.
    pub port: String,
    /// GPIO pin wired to the board's reset line.
    #[serde(default)]
    pub reset_pin: Option<u32>,
    /// Board thresholds applied at startup.
    #[serde(default)]
    pub settings: BTreeMap<String, i64>,
    /// Reopening of the port after the link fails.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// The `[reconnect]` table of a serial light.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    /// Reopen the port at all.
    pub enabled: bool,
    /// Delay before the first reopen, in seconds.
    pub initial_delay: f64,
    /// Upper bound of the delay, in seconds.
    pub max_delay: f64,
    /// Factor applied to the delay after each failed reopen.
    pub backoff: f64,
    /// Reopens before giving up; unlimited if absent.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: 1.0,
            max_delay: 30.0,
            backoff: 2.0,
            max_retries: None,
        }
    }
}

impl ReconnectConfig {
    /// Converts the table into a [`ReconnectionPolicy`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for negative or non-finite
    /// delays and a backoff below 1.
    pub fn policy(&self) -> Result<ReconnectionPolicy, ConfigError> {
        if !self.enabled {
            return Ok(ReconnectionPolicy::disabled());
        }
        if !(self.backoff.is_finite() && self.backoff >= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.backoff".to_string(),
                message: format!("{} is not a finite factor of at least 1", self.backoff),
            });
        }
        let policy = ReconnectionPolicy::new()
            .with_initial_delay(seconds("reconnect.initial_delay", self.initial_delay)?)
            .with_max_delay(seconds("reconnect.max_delay", self.max_delay)?)
            .with_backoff_multiplier(self.backoff);
        Ok(match self.max_retries {
            Some(retries) => policy.with_max_retries(retries),
            None => policy.with_infinite_retries(),
        })
    }
}

/// Configuration of a group.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    /// Master role; accepts booleans, `1` and `yes`/`true` in any case.
    #[serde(default, deserialize_with = "flexible_bool")]
    pub i_am_master: bool,
    /// Name of the local light.
    pub local: String,
    /// Name of the remote light.
    pub remote: String,
    /// Divergence tolerance in seconds.
    #[serde(default = "default_max_diverge")]
    pub max_diverge: f64,
    /// Shared group secret.
    #[serde(default)]
    pub group_key: Option<String>,
    /// Serial paths searched for a handheld controller, if not the default.
    #[serde(default)]
    pub controller_paths: Option<Vec<String>>,
}

/// Configuration of a simulated light.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DummyConfig {
    /// Probability of a fault per failure tick.
    #[serde(default)]
    pub fail_probability: f64,
}

/// Configuration of a peer's light.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    /// Status URL of the peer.
    pub url: String,
    /// Poll interval in seconds.
    #[serde(default = "default_interval")]
    pub interval: f64,
}

fn default_max_diverge() -> f64 {
    10.0
}

fn default_interval() -> f64 {
    0.25
}

fn flexible_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flexible {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    Ok(match Flexible::deserialize(deserializer)? {
        Flexible::Bool(value) => value,
        Flexible::Int(value) => value == 1,
        Flexible::Text(value) => matches!(value.to_uppercase().as_str(), "YES" | "TRUE" | "1"),
    })
}

/// Configuration of one light, selected by its `type`.
///
/// # Examples
///
/// ```
/// use ampel_sync::manager::LightConfig;
///
/// let table: toml::Table = toml::from_str(r#"
///     type = "remote"
///     url = "http://peer:8880/local/status"
/// "#).unwrap();
///
/// let config = LightConfig::from_table(table).unwrap();
/// assert_eq!(config.kind(), "remote");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum LightConfig {
    /// `type = "serial"`
    Serial(SerialConfig),
    /// `type = "group"`
    Group(GroupConfig),
    /// `type = "dummy"`
    Dummy(DummyConfig),
    /// `type = "remote"`
    Remote(RemoteConfig),
}

impl LightConfig {
    /// Decodes a light table.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownType`] for an unknown `type` and
    /// [`ConfigError::Toml`] for unknown or malformed parameters.
    pub fn from_table(mut table: toml::Table) -> Result<Self, ConfigError> {
        let kind = match table.remove("type") {
            Some(toml::Value::String(kind)) => kind,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    field: "type".to_string(),
                    message: format!("expected a string, got {other}"),
                });
            }
            None => {
                return Err(ConfigError::InvalidValue {
                    field: "type".to_string(),
                    message: "missing".to_string(),
                });
            }
        };

        let params = toml::Value::Table(table);
        match kind.as_str() {
            "serial" => Ok(Self::Serial(params.try_into()?)),
            "group" => Ok(Self::Group(params.try_into()?)),
            "dummy" => Ok(Self::Dummy(params.try_into()?)),
            "remote" => Ok(Self::Remote(params.try_into()?)),
            _ => Err(ConfigError::UnknownType(kind)),
        }
    }

    /// Returns the configured `type`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Serial(_) => "serial",
            Self::Group(_) => "group",
            Self::Dummy(_) => "dummy",
            Self::Remote(_) => "remote",
        }
    }

    /// Constructs the light.
    ///
    /// Group members are not resolved here; see [`Device::dereference`].
    ///
    /// # Errors
    ///
    /// Returns an error for out-of-range values or unknown board thresholds.
    pub fn build(&self, name: &str) -> Result<Device, Error> {
        match self {
            Self::Serial(config) => {
                let light = Device::from(
                    SerialLight::new(name, config.port.as_str())
                        .with_reset_pin(config.reset_pin)
                        .with_reconnection(config.reconnect.policy()?),
                );
                for (param, value) in &config.settings {
                    light.set_config(param, *value)?;
                }
                Ok(light)
            }
            Self::Group(config) => {
                let mut settings =
                    GroupSettings::new(config.local.as_str(), config.remote.as_str())
                        .with_master(config.i_am_master)
                        .with_max_diverge(seconds("max_diverge", config.max_diverge)?)
                        .with_group_key(config.group_key.clone());
                if let Some(paths) = &config.controller_paths {
                    settings = settings.with_controller_paths(paths.clone());
                }
                Ok(Device::from(GroupLight::new(name, settings)))
            }
            Self::Dummy(config) => {
                if !(0.0..=1.0).contains(&config.fail_probability) {
                    return Err(ConfigError::InvalidValue {
                        field: "fail_probability".to_string(),
                        message: format!("{} is not within 0..=1", config.fail_probability),
                    }
                    .into());
                }
                Ok(Device::from(SimulatedLight::new(name, config.fail_probability)))
            }
            Self::Remote(config) => {
                let interval = seconds("interval", config.interval)?;
                Ok(Device::from(RemoteLight::new(name, config.url.as_str(), interval)?))
            }
        }
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|e| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("{value}: {e}"),
    })
}

/// Lights of a fleet, decoded from TOML.
///
/// Each light is decoded on its own: a broken entry is recorded in
/// [`rejected`](Self::rejected) and does not affect the others.
///
/// ```toml
/// [lights.local]
/// type = "dummy"
/// fail_probability = 0.01
///
/// [lights.crossing]
/// type = "group"
/// i_am_master = "yes"
/// local = "local"
/// remote = "peer"
/// ```
#[derive(Debug, Default)]
pub struct FleetConfig {
    /// Decoded lights by name.
    pub lights: BTreeMap<String, LightConfig>,
    /// Lights that could not be decoded, by name.
    pub rejected: BTreeMap<String, ConfigError>,
}

impl FleetConfig {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a light.
    #[must_use]
    pub fn with_light(mut self, name: impl Into<String>, config: LightConfig) -> Self {
        self.lights.insert(name.into(), config);
        self
    }

    /// Decodes a TOML document with a `[lights.<name>]` table per light.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Toml`] only if the document itself is not valid
    /// TOML or `lights` is not a table of tables.
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct Document {
            #[serde(default)]
            lights: BTreeMap<String, toml::Table>,
        }

        let document: Document = toml::from_str(document)?;
        let mut config = Self::new();
        for (name, table) in document.lights {
            match LightConfig::from_table(table) {
                Ok(light) => {
                    config.lights.insert(name, light);
                }
                Err(e) => {
                    tracing::error!(light = %name, error = %e, "Rejecting light configuration");
                    config.rejected.insert(name, e);
                }
            }
        }
        Ok(config)
    }
}

/// Backoff for reopening a failed link.
///
/// The delay starts at `initial_delay`, is multiplied by
/// `backoff_multiplier` after every failed reopen and never exceeds
/// `max_delay`.
///
/// ```
/// use std::time::Duration;
/// use ampel_sync::manager::ReconnectionPolicy;
///
/// let policy = ReconnectionPolicy::default();
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
/// assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
///
/// let policy = ReconnectionPolicy::new().with_max_retries(5);
/// assert!(policy.should_retry(4));
/// assert!(!policy.should_retry(5));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectionPolicy {
    /// Reopen the link at all.
    pub enabled: bool,
    /// Reopens before giving up; `None` retries forever.
    pub max_retries: Option<u32>,
    /// Delay before the first reopen.
    pub initial_delay: Duration,
    /// Upper bound of the delay.
    pub max_delay: Duration,
    /// Growth of the delay per failed reopen.
    pub backoff_multiplier: f64,
}

impl ReconnectionPolicy {
    /// Reopens forever: 1 s, doubling, capped at 30 s.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Never reopens; the light stays unseen once the link fails.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn with_infinite_retries(mut self) -> Self {
        self.max_retries = None;
        self
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay before reopen number `attempt`, counted from zero.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether reopen number `attempt` may still be made.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && self.max_retries.is_none_or(|max| attempt < max)
    }
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(source: &str) -> toml::Table {
        toml::from_str(source).unwrap()
    }

    #[test]
    fn serial_config_with_settings() {
        let config = LightConfig::from_table(table(
            r#"
            type = "serial"
            port = "/dev/serial0"
            reset_pin = 17
            [settings]
            min_on_current = 20
            "#,
        ))
        .unwrap();

        let LightConfig::Serial(serial) = config else {
            panic!("Expected serial config");
        };
        assert_eq!(serial.port, "/dev/serial0");
        assert_eq!(serial.reset_pin, Some(17));
        assert_eq!(serial.settings.get("min_on_current"), Some(&20));
    }

    #[test]
    fn group_master_flag_variants() {
        for (raw, expected) in [
            ("\"yes\"", true),
            ("\"True\"", true),
            ("\"1\"", true),
            ("1", true),
            ("true", true),
            ("\"no\"", false),
            ("0", false),
        ] {
            let config = LightConfig::from_table(table(&format!(
                "type = \"group\"\ni_am_master = {raw}\nlocal = \"a\"\nremote = \"b\""
            )))
            .unwrap();
            let LightConfig::Group(group) = config else {
                panic!("Expected group config");
            };
            assert_eq!(group.i_am_master, expected, "i_am_master = {raw}");
            assert!((group.max_diverge - 10.0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn remote_default_interval() {
        let config =
            LightConfig::from_table(table("type = \"remote\"\nurl = \"peer/status\"")).unwrap();
        assert_eq!(
            config,
            LightConfig::Remote(RemoteConfig {
                url: "peer/status".to_string(),
                interval: 0.25,
            })
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = LightConfig::from_table(table("type = \"laser\"")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownType(ref kind) if kind == "laser"));
    }

    #[test]
    fn missing_type_is_rejected() {
        let err = LightConfig::from_table(table("port = \"/dev/x\"")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "type"));
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let err =
            LightConfig::from_table(table("type = \"dummy\"\ncolour = \"red\"")).unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn unknown_board_threshold_fails_build() {
        let config = LightConfig::Serial(SerialConfig {
            port: "/dev/null".to_string(),
            reset_pin: None,
            settings: BTreeMap::from([("brightness".to_string(), 3)]),
            reconnect: ReconnectConfig::default(),
        });
        assert!(matches!(
            config.build("local"),
            Err(Error::Config(ConfigError::UnknownParameter(_)))
        ));
    }

    #[test]
    fn out_of_range_values_fail_build() {
        let dummy = LightConfig::Dummy(DummyConfig {
            fail_probability: 1.5,
        });
        assert!(dummy.build("sim").is_err());

        let remote = LightConfig::Remote(RemoteConfig {
            url: "http://peer/status".to_string(),
            interval: -1.0,
        });
        assert!(remote.build("peer").is_err());
    }

    #[test]
    fn fleet_isolates_broken_lights() {
        let config = FleetConfig::from_toml_str(
            r#"
            [lights.sim]
            type = "dummy"
            fail_probability = 0.01

            [lights.broken]
            type = "dummy"
            fail_probability = 0.01
            flicker = true

            [lights.odd]
            type = "hologram"
            "#,
        )
        .unwrap();

        assert_eq!(config.lights.len(), 1);
        assert!(config.lights.contains_key("sim"));
        assert_eq!(config.rejected.len(), 2);
        assert!(matches!(
            config.rejected.get("odd"),
            Some(ConfigError::UnknownType(_))
        ));
    }

    #[test]
    fn invalid_document_is_an_error() {
        assert!(FleetConfig::from_toml_str("[lights").is_err());
    }

    #[test]
    fn serial_reconnect_table() {
        let LightConfig::Serial(serial) = LightConfig::from_table(table(
            r#"
            type = "serial"
            port = "/dev/serial0"
            [reconnect]
            initial_delay = 0.5
            max_delay = 4
            backoff = 3
            max_retries = 2
            "#,
        ))
        .unwrap() else {
            panic!("Expected serial config");
        };

        let policy = serial.reconnect.policy().unwrap();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }

    #[test]
    fn serial_reconnect_defaults_and_disable() {
        let LightConfig::Serial(serial) =
            LightConfig::from_table(table("type = \"serial\"\nport = \"/dev/x\"")).unwrap()
        else {
            panic!("Expected serial config");
        };
        assert_eq!(serial.reconnect.policy().unwrap(), ReconnectionPolicy::default());

        let disabled = ReconnectConfig {
            enabled: false,
            ..ReconnectConfig::default()
        };
        assert!(!disabled.policy().unwrap().should_retry(0));
    }

    #[test]
    fn invalid_reconnect_fails_build() {
        for reconnect in [
            ReconnectConfig {
                backoff: 0.5,
                ..ReconnectConfig::default()
            },
            ReconnectConfig {
                initial_delay: f64::NAN,
                ..ReconnectConfig::default()
            },
            ReconnectConfig {
                max_delay: -1.0,
                ..ReconnectConfig::default()
            },
        ] {
            let config = LightConfig::Serial(SerialConfig {
                port: "/dev/null".to_string(),
                reset_pin: None,
                settings: BTreeMap::new(),
                reconnect: reconnect.clone(),
            });
            assert!(
                matches!(
                    config.build("local"),
                    Err(Error::Config(ConfigError::InvalidValue { .. }))
                ),
                "{reconnect:?}"
            );
        }
    }

    #[test]
    fn reconnect_delay_grows_to_the_cap() {
        let policy = ReconnectionPolicy::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1));
        let delays: Vec<_> = (0..6).map(|n| policy.delay_for_attempt(n)).collect();
        assert_eq!(
            delays,
            [100, 200, 400, 800, 1000, 1000].map(Duration::from_millis)
        );
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn reconnect_retry_limits() {
        assert!(ReconnectionPolicy::default().should_retry(u32::MAX));
        assert!(!ReconnectionPolicy::disabled().should_retry(0));
        let limited = ReconnectionPolicy::new().with_max_retries(3);
        assert!(limited.should_retry(2));
        assert!(!limited.should_retry(3));
        assert!(limited.with_infinite_retries().should_retry(3));
    }
}
