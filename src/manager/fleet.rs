// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Registry and scheduler of all configured lights.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::Device;
use crate::error::Error;

use super::device_config::FleetConfig;

/// All lights of one process.
///
/// Built in two phases: every light is constructed first, then the
/// symbolic member names of groups are resolved against the complete set.
/// A light that fails to construct is left out and recorded in
/// [`failures`](Self::failures); a group naming a missing light fails the
/// whole build.
///
/// # Examples
///
/// ```no_run
/// use ampel_sync::manager::Fleet;
///
/// #[tokio::main]
/// async fn main() -> ampel_sync::Result<()> {
///     let fleet = Fleet::from_toml_str(r#"
///         [lights.local]
///         type = "serial"
///         port = "/dev/serial0"
///
///         [lights.peer]
///         type = "remote"
///         url = "http://peer:8880/peer/status"
///
///         [lights.crossing]
///         type = "group"
///         i_am_master = "yes"
///         local = "local"
///         remote = "peer"
///         group_key = "secret"
///     "#)?;
///
///     fleet.start();
///     fleet.device("crossing")?.set_green(false);
///
///     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
///     fleet.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct Fleet {
    lights: BTreeMap<String, Device>,
    failures: BTreeMap<String, Error>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Fleet {
    /// Builds the fleet described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a group references a light that does not exist.
    pub fn build(config: FleetConfig) -> Result<Self, Error> {
        let mut failures: BTreeMap<String, Error> = config
            .rejected
            .into_iter()
            .map(|(name, e)| (name, e.into()))
            .collect();

        let mut lights = BTreeMap::new();
        for (name, light) in &config.lights {
            match light.build(name) {
                Ok(device) => {
                    tracing::info!(light = %name, kind = device.kind(), "Light created");
                    lights.insert(name.clone(), device);
                }
                Err(e) => {
                    tracing::error!(light = %name, error = %e, "Light failed to initialise");
                    failures.insert(name.clone(), e);
                }
            }
        }

        for light in lights.values() {
            light.dereference(&lights)?;
        }

        Ok(Self {
            lights,
            failures,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Decodes and builds a fleet from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML or a group
    /// references a missing light.
    pub fn from_toml_str(document: &str) -> Result<Self, Error> {
        Self::build(FleetConfig::from_toml_str(document)?)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Returns the light called `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Device> {
        self.lights.get(name)
    }

    /// Returns the light called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LightNotFound`] for unknown names.
    pub fn device(&self, name: &str) -> Result<&Device, Error> {
        self.get(name)
            .ok_or_else(|| Error::LightNotFound(name.to_string()))
    }

    /// Returns the names of all lights, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.lights.keys().map(String::as_str)
    }

    /// Returns the number of lights.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lights.len()
    }

    /// Returns `true` if no light was built.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lights.is_empty()
    }

    /// Returns the lights that failed to initialise, by name.
    #[must_use]
    pub fn failures(&self) -> &BTreeMap<String, Error> {
        &self.failures
    }

    /// Returns the JSON array of light names served by the web interface.
    #[must_use]
    pub fn interface_listing(&self) -> String {
        serde_json::to_string(&self.names().collect::<Vec<_>>()).unwrap_or_default()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the timers and links of every light.
    ///
    /// Must be called from within a tokio runtime. Calling it again while
    /// running has no effect.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            tracing::warn!("Fleet already started");
            return;
        }
        for light in self.lights.values() {
            tasks.extend(light.spawn_tasks(&self.cancel));
        }
        tracing::info!(lights = self.lights.len(), tasks = tasks.len(), "Fleet started");
    }

    /// Returns `true` between [`start`](Self::start) and
    /// [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tasks.lock().is_empty()
    }

    /// Stops every task and waits for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Task failed during shutdown");
            }
        }
        tracing::info!("Fleet stopped");
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
