// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Light of a peer, mirrored by polling its status resource.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, Error, ProtocolError};
use crate::protocol::{PeerClient, TransportCodec};
use crate::state::DeviceState;

use super::decode_wire;

/// Default poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Start time of a poll, with a sequence number to keep same-instant polls
/// apart.
type RequestId = (Instant, u64);

#[derive(Debug)]
struct InFlight {
    challenge: Option<String>,
    task: JoinHandle<()>,
}

/// Concurrent polls of a peer, keyed by their start time.
///
/// Polls are never serialised: a slow peer simply leads to several requests
/// in flight. Whenever a reply is adopted, every request started before it is
/// cancelled, so an older reply can never overwrite newer state.
#[derive(Debug)]
struct RemotePoller {
    client: PeerClient,
    in_flight: Mutex<BTreeMap<RequestId, InFlight>>,
    request_count: AtomicU64,
    error_count: AtomicU64,
}

impl RemotePoller {
    fn new(client: PeerClient) -> Self {
        Self {
            client,
            in_flight: Mutex::new(BTreeMap::new()),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    fn count_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    #[allow(clippy::cast_precision_loss)]
    fn error_rate(&self) -> Option<f64> {
        let requests = self.request_count.load(Ordering::Relaxed);
        if requests == 0 {
            return None;
        }
        let errors = self.error_count.load(Ordering::Relaxed);
        Some(100.0 * errors as f64 / requests as f64)
    }
}

/// Peer light reached over HTTP.
///
/// With a group key every poll carries a fresh challenge and the answer must
/// be a signed envelope bound to it; without one the peer's plain status is
/// accepted.
#[derive(Debug)]
pub struct RemoteLight {
    name: String,
    interval: Duration,
    pub(super) state: Mutex<DeviceState>,
    poller: RemotePoller,
}

impl RemoteLight {
    /// Creates a light mirroring the status resource at `url`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero interval and a protocol
    /// error if the HTTP client cannot be created.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        interval: Duration,
    ) -> Result<Self, Error> {
        if interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "interval".to_string(),
                message: "must be greater than zero".to_string(),
            }
            .into());
        }
        Ok(Self {
            name: name.into(),
            interval,
            state: Mutex::new(DeviceState::new()),
            poller: RemotePoller::new(PeerClient::new(url)?),
        })
    }

    /// Sets the staleness threshold.
    #[must_use]
    pub fn with_max_age(self, max_age: Duration) -> Self {
        self.state.lock().max_age = max_age;
        self
    }

    /// Returns the name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the status URL of the peer.
    #[must_use]
    pub fn url(&self) -> &str {
        self.poller.client.url()
    }

    /// Returns the poll interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the number of polls issued.
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.poller.request_count.load(Ordering::Relaxed)
    }

    /// Returns the number of failed or discarded polls.
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.poller.error_count.load(Ordering::Relaxed)
    }

    /// Returns the share of failed polls in percent, `None` before the
    /// first poll.
    #[must_use]
    pub fn error_rate(&self) -> Option<f64> {
        self.poller.error_rate()
    }

    /// Returns the number of polls awaiting an answer.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.poller.in_flight.lock().len()
    }

    /// Issues one poll.
    ///
    /// Must be called from within a tokio runtime.
    pub fn poll(self: &Arc<Self>) {
        let has_key = self.state.lock().group_key.is_some();
        let challenge = has_key.then(TransportCodec::make_challenge);
        let started = Instant::now();
        let id = (
            started,
            self.poller.request_count.fetch_add(1, Ordering::Relaxed),
        );

        let mut in_flight = self.poller.in_flight.lock();
        let light = Arc::clone(self);
        let client = self.poller.client.clone();
        let request_challenge = challenge.clone();
        let task = tokio::spawn(async move {
            let result = client.fetch_status(request_challenge.as_deref()).await;
            light.on_reply(id, result);
        });
        in_flight.insert(id, InFlight { challenge, task });

        let age = self
            .state
            .lock()
            .last_seen
            .map(|seen| started.saturating_duration_since(seen));
        tracing::debug!(
            light = %self.name,
            in_flight = in_flight.len(),
            ?age,
            error_rate = ?self.poller.error_rate(),
            "Polling peer"
        );
    }

    fn on_reply(&self, id: RequestId, result: Result<Vec<u8>, ProtocolError>) {
        let mut in_flight = self.poller.in_flight.lock();
        let Some(request) = in_flight.remove(&id) else {
            tracing::warn!(light = %self.name, "State data arrived too late, discarding");
            return;
        };

        let body = match result {
            Ok(body) => body,
            Err(e) => {
                self.poller.count_error();
                tracing::error!(light = %self.name, error = %e, "Poll failed");
                return;
            }
        };

        let codec = self.state.lock().codec();
        let wire = match decode_wire(codec.as_ref(), &body, request.challenge.as_deref()) {
            Ok(wire) => wire,
            Err(Error::Codec(e)) => {
                self.poller.count_error();
                tracing::error!(light = %self.name, error = %e, "Protocol violation by peer");
                return;
            }
            Err(e) => {
                self.poller.count_error();
                tracing::warn!(light = %self.name, error = %e, "Discarding peer status");
                return;
            }
        };

        let (started, _) = id;
        {
            let mut state = self.state.lock();
            state.apply_wire(&wire);
            if state.last_seen.is_none_or(|seen| seen < started) {
                state.last_seen = Some(started);
            }
        }

        let newer = in_flight.split_off(&(started, 0));
        let stale = std::mem::replace(&mut *in_flight, newer);
        for (_, request) in stale {
            request.task.abort();
            self.poller.count_error();
        }
    }

    fn abort_in_flight(&self) {
        let in_flight = std::mem::take(&mut *self.poller.in_flight.lock());
        for (_, request) in in_flight {
            request.task.abort();
        }
    }

    pub(super) fn send_update(&self) {
        let (give_way, temp_error, key) = {
            let state = self.state.lock();
            if state.read_only {
                tracing::debug!(light = %self.name, "Read-only: no update");
                return;
            }
            (state.give_way, state.temp_error, state.group_key.clone())
        };
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!(light = %self.name, "No runtime, cannot update peer");
            return;
        };

        let client = self.poller.client.clone();
        let name = self.name.clone();
        runtime.spawn(async move {
            match client.push_state(give_way, temp_error, key.as_deref()).await {
                Ok(answer) if answer == "ok" => {
                    tracing::debug!(light = %name, give_way, temp_error, "Peer updated");
                }
                Ok(answer) => {
                    tracing::error!(light = %name, %answer, "Something went wrong trying to update peer");
                }
                Err(e) => {
                    tracing::error!(light = %name, error = %e, "Cannot update peer");
                }
            }
        });
    }

    pub(super) fn spawn_polling(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let light = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(light.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => light.poll(),
                }
            }
            light.abort_in_flight();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WireStatus;

    fn remote() -> Arc<RemoteLight> {
        Arc::new(
            RemoteLight::new("peer", "http://127.0.0.1:9/status", DEFAULT_POLL_INTERVAL).unwrap(),
        )
    }

    fn body(state: u8) -> Vec<u8> {
        serde_json::to_vec(&WireStatus {
            state,
            batt_voltage: 12.0,
            lamp_currents: vec![0, 0, 60],
            good: true,
            give_way: false,
            temp_error: false,
        })
        .unwrap()
    }

    fn register(light: &RemoteLight, started: Instant, seq: u64) -> RequestId {
        let id = (started, seq);
        light.poller.request_count.fetch_add(1, Ordering::Relaxed);
        light.poller.in_flight.lock().insert(
            id,
            InFlight {
                challenge: None,
                task: tokio::spawn(std::future::pending()),
            },
        );
        id
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = RemoteLight::new("peer", "http://peer/status", Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn error_rate_before_first_poll() {
        assert_eq!(remote().error_rate(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_does_not_overwrite_newer_state() {
        let light = remote();
        let t0 = Instant::now();
        let old = register(&light, t0, 0);
        tokio::time::advance(Duration::from_secs(1)).await;
        let t1 = Instant::now();
        let new = register(&light, t1, 1);

        light.on_reply(new, Ok(body(4)));
        assert_eq!(light.state.lock().last_seen(), Some(t1));
        assert_eq!(light.state.lock().state(), 4);
        assert_eq!(light.in_flight(), 0);
        assert_eq!(light.error_count(), 1);

        light.on_reply(old, Ok(body(3)));
        assert_eq!(light.state.lock().last_seen(), Some(t1));
        assert_eq!(light.state.lock().state(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_keeps_newer_requests_in_flight() {
        let light = remote();
        let t0 = Instant::now();
        let first = register(&light, t0, 0);
        tokio::time::advance(Duration::from_millis(250)).await;
        register(&light, Instant::now(), 1);

        light.on_reply(first, Ok(body(3)));
        assert_eq!(light.in_flight(), 1);
        assert_eq!(light.error_count(), 0);
        assert_eq!(light.state.lock().last_seen(), Some(t0));
    }

    #[tokio::test]
    async fn failed_poll_counts_an_error() {
        let light = remote();
        let id = register(&light, Instant::now(), 0);
        light.on_reply(
            id,
            Err(ProtocolError::ConnectionFailed("HTTP 500".to_string())),
        );

        assert_eq!(light.in_flight(), 0);
        assert_eq!(light.error_rate(), Some(100.0));
        assert!(light.state.lock().last_seen().is_none());
    }

    #[tokio::test]
    async fn unsigned_reply_to_challenge_is_an_error() {
        let light = remote();
        light.state.lock().group_key = Some("secret".to_string());
        let id = (Instant::now(), 0);
        light.poller.in_flight.lock().insert(
            id,
            InFlight {
                challenge: Some("c1".to_string()),
                task: tokio::spawn(std::future::pending()),
            },
        );

        light.on_reply(id, Ok(body(3)));
        assert_eq!(light.error_count(), 1);
        assert_ne!(light.state.lock().state(), 3);
    }
}
