// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration tests for peer polling over HTTP using wiremock.
//!
//! The mock server answers with the status resource of a simulated light,
//! so both ends of the signed exchange run the real code.

use std::sync::Arc;
use std::time::Duration;

use ampel_sync::device::{Device, RemoteLight, SimulatedLight};
use ampel_sync::{PostOutcome, StatusEndpoint};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

// ============================================================================
// Helpers
// ============================================================================

/// Serves `GET` of a status resource.
struct ServeStatus(StatusEndpoint);

impl Respond for ServeStatus {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body = self.0.get(request.url.query().unwrap_or_default());
        ResponseTemplate::new(200).set_body_raw(body, "application/json")
    }
}

/// Serves `POST` of a status resource.
struct AcceptPost(StatusEndpoint);

impl Respond for AcceptPost {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let form = String::from_utf8_lossy(&request.body);
        ResponseTemplate::new(200).set_body_string(self.0.post(&form).as_str())
    }
}

/// Starts a mock peer serving a ticked simulated light.
async fn peer(key: Option<&str>) -> (MockServer, Device) {
    let light = Device::from(SimulatedLight::new("peer", 0.0));
    light.set_group_key(key);
    if let Device::Simulated(sim) = &light {
        sim.run_tick();
    }

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/peer/status"))
        .respond_with(ServeStatus(StatusEndpoint::new(light.clone())))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/peer/status"))
        .respond_with(AcceptPost(StatusEndpoint::new(light.clone())))
        .mount(&server)
        .await;

    (server, light)
}

fn remote(server: &MockServer, key: Option<&str>) -> (Device, Arc<RemoteLight>) {
    let light = RemoteLight::new(
        "remote",
        format!("{}/peer/status", server.uri()),
        Duration::from_millis(250),
    )
    .unwrap();
    let device = Device::from(light);
    device.set_group_key(key);
    let Device::Remote(remote) = &device else {
        unreachable!()
    };
    let remote = Arc::clone(remote);
    (device, remote)
}

async fn poll_once(light: &Arc<RemoteLight>) {
    light.poll();
    tokio::time::timeout(Duration::from_secs(5), async {
        while light.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("poll completes");
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached");
}

// ============================================================================
// Polling
// ============================================================================

mod polling {
    use super::*;

    #[tokio::test]
    async fn plain_status_is_adopted() {
        let (server, peer) = peer(None).await;
        let (device, light) = remote(&server, None);

        poll_once(&light).await;

        let expected = peer.snapshot();
        let actual = device.snapshot();
        assert!(device.seen());
        assert_eq!(actual.state(), expected.state());
        assert!((actual.batt_voltage() - expected.batt_voltage()).abs() < f64::EPSILON);
        assert_eq!(actual.lamp_currents(), expected.lamp_currents());
        assert_eq!(light.request_count(), 1);
        assert_eq!(light.error_rate(), Some(0.0));
    }

    #[tokio::test]
    async fn signed_status_is_verified() {
        let (server, peer) = peer(Some("secret")).await;
        let (device, light) = remote(&server, Some("secret"));

        poll_once(&light).await;

        assert!(device.seen());
        assert_eq!(device.snapshot().state(), peer.snapshot().state());
        assert_eq!(light.error_count(), 0);

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].url.query().unwrap_or_default().starts_with("challenge="));
    }

    #[tokio::test]
    async fn wrong_key_is_rejected() {
        let (server, _peer) = peer(Some("secret")).await;
        let (device, light) = remote(&server, Some("guess"));

        poll_once(&light).await;

        assert!(!device.seen());
        assert_eq!(light.error_count(), 1);
    }

    #[tokio::test]
    async fn unsigned_answer_to_challenge_is_rejected() {
        let (server, _peer) = peer(None).await;
        let (device, light) = remote(&server, Some("secret"));

        poll_once(&light).await;

        assert!(!device.seen());
        assert_eq!(light.error_rate(), Some(100.0));
    }

    #[tokio::test]
    async fn server_error_counts_against_the_peer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let (device, light) = remote(&server, None);

        poll_once(&light).await;
        poll_once(&light).await;

        assert!(!device.seen());
        assert_eq!(light.request_count(), 2);
        assert_eq!(light.error_count(), 2);
    }

    #[tokio::test]
    async fn status_with_wrong_lamp_count_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "state": 3,
                "batt_voltage": 12.4,
                "lamp_currents": [0, 0, 60, 0, 0, 60],
                "good": true,
                "give_way": true,
                "temp_error": false
            })))
            .mount(&server)
            .await;
        let (device, light) = remote(&server, None);

        poll_once(&light).await;

        assert!(!device.seen());
        assert_eq!(light.error_count(), 1);
    }
}

// ============================================================================
// Pushing intent
// ============================================================================

mod pushing {
    use super::*;

    #[tokio::test]
    async fn intent_change_is_posted_with_key() {
        let (server, peer) = peer(Some("secret")).await;
        let (device, _light) = remote(&server, Some("secret"));

        device.set_green(false);
        wait_for(|| !peer.snapshot().give_way()).await;

        device.set_temp_error(true);
        wait_for(|| peer.snapshot().temp_error()).await;
    }

    #[tokio::test]
    async fn read_only_light_does_not_post() {
        let (server, peer) = peer(Some("secret")).await;
        let (device, _light) = remote(&server, Some("secret"));
        device.set_read_only(true);

        device.set_green(false);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(peer.snapshot().give_way());
        let requests = server.received_requests().await.unwrap();
        assert!(requests.iter().all(|r| r.method.as_str() != "POST"));
    }

    #[tokio::test]
    async fn post_without_key_is_refused() {
        let (server, peer) = peer(Some("secret")).await;
        let (device, _light) = remote(&server, None);

        device.set_green(false);
        wait_for_post(&server).await;

        assert!(peer.snapshot().give_way());
        let endpoint = StatusEndpoint::new(peer);
        assert_eq!(endpoint.post("giveway=0"), PostOutcome::NotWriteable);
    }

    async fn wait_for_post(server: &MockServer) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let requests = server.received_requests().await.unwrap_or_default();
                if requests.iter().any(|r| r.method.as_str() == "POST") {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("POST received");
        // The refusal is answered synchronously; give the client a moment.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
