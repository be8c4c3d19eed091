// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Self-driving light for bench setups and tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::state::{DeviceState, HARD_ERROR, TEMP_ERROR, lamp_currents_for};

use super::every;

/// Period of the state machine.
pub const RUN_PERIOD: Duration = Duration::from_secs(1);
/// Period of the failure injection.
pub const FAIL_PERIOD: Duration = Duration::from_millis(500);

/// Injected faults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Faults {
    /// The light stops confirming its state.
    pub comm: bool,
    /// The light reports a hard error.
    pub lamp: bool,
}

/// Simulated light cycling through the operating states.
///
/// Each run tick advances one step: `0 → 1 → 2 → 3`, then `3 → 4` and
/// `5 → 6` only while giving way, `4 → 5` and `6 → 3` unconditionally. A
/// temporary error forces state 8, which returns to 3 once cleared.
#[derive(Debug)]
pub struct SimulatedLight {
    name: String,
    fail_probability: f64,
    pub(super) state: Mutex<DeviceState>,
    faults: Mutex<Faults>,
    updates: AtomicU64,
}

impl SimulatedLight {
    /// Creates a simulator injecting faults with `fail_probability` per
    /// failure tick.
    ///
    /// The probability is clamped to `0..=1`; a non-finite value disables
    /// failure injection.
    #[must_use]
    pub fn new(name: impl Into<String>, fail_probability: f64) -> Self {
        let fail_probability = if fail_probability.is_finite() {
            fail_probability.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            name: name.into(),
            fail_probability,
            state: Mutex::new(DeviceState {
                state: 0,
                ..DeviceState::new()
            }),
            faults: Mutex::new(Faults::default()),
            updates: AtomicU64::new(0),
        }
    }

    /// Returns the name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the fault probability per failure tick.
    #[must_use]
    pub fn fail_probability(&self) -> f64 {
        self.fail_probability
    }

    /// Returns the injected faults.
    #[must_use]
    pub fn faults(&self) -> Faults {
        *self.faults.lock()
    }

    /// Injects faults directly.
    pub fn set_faults(&self, faults: Faults) {
        *self.faults.lock() = faults;
    }

    /// Returns how many updates were pushed to this light.
    #[must_use]
    pub fn updates_sent(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub(super) fn send_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock();
        if state.read_only {
            tracing::debug!(light = %self.name, "Read-only: no update");
        } else {
            tracing::debug!(light = %self.name, state = state.state, "Would update");
        }
    }

    pub(super) fn reset(&self) {
        *self.faults.lock() = Faults::default();
        self.state.lock().state = 0;
    }

    /// Advances the state machine by one step.
    pub fn run_tick(&self) {
        let faults = self.faults();
        let mut state = self.state.lock();

        state.batt_voltage = 12.0 + rand::thread_rng().gen_range(0.0..1.5);
        if !faults.comm {
            state.mark_seen();
        }
        if faults.lamp {
            state.state = HARD_ERROR;
        }

        state.state = next_state(state.state, state.give_way);
        if state.temp_error {
            if state.state != TEMP_ERROR {
                tracing::warn!(light = %self.name, "Got temporary error");
            }
            state.state = TEMP_ERROR;
        } else if state.state == TEMP_ERROR {
            state.state = 3;
        }
        state.lamp_currents = lamp_currents_for(state.state).to_vec();

        tracing::debug!(
            light = %self.name,
            state = state.state,
            temp_error = state.temp_error,
            "Simulated tick"
        );
    }

    /// Rolls for new faults.
    pub fn failure_tick(&self) {
        let mut rng = rand::thread_rng();
        if rng.gen_bool(self.fail_probability) {
            let faults = Faults {
                lamp: rng.gen_bool(0.5),
                comm: rng.gen_bool(0.5),
            };
            tracing::warn!(
                light = %self.name,
                fail_lamp = faults.lamp,
                fail_comm = faults.comm,
                "Injecting failure"
            );
            *self.faults.lock() = faults;
        }
    }

    pub(super) fn spawn_ticks(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let run = Arc::clone(self);
        let fail = Arc::clone(self);
        vec![
            every(RUN_PERIOD, cancel.clone(), move || run.run_tick()),
            every(FAIL_PERIOD, cancel.clone(), move || fail.failure_tick()),
        ]
    }
}

fn next_state(state: u8, give_way: bool) -> u8 {
    match state {
        0..=2 => state + 1,
        3 if give_way => 4,
        4 => 5,
        5 if give_way => 6,
        6 => 3,
        other => other,
    }
}
