// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP client for the status resource of a peer.

use std::time::Duration;

use reqwest::Client;

use crate::error::ProtocolError;

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client talking to the status resource of a peer light.
///
/// `GET <url>[?challenge=<token>]` returns the peer's state, `POST <url>`
/// with form fields changes it.
///
/// # Examples
///
/// ```no_run
/// use ampel_sync::protocol::PeerClient;
///
/// # async fn example() -> Result<(), ampel_sync::ProtocolError> {
/// let client = PeerClient::new("http://192.168.1.20:8880/local/status")?;
/// let body = client.fetch_status(Some("challenge-token")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PeerClient {
    url: String,
    client: Client,
}

impl PeerClient {
    /// Creates a client for the status resource at `url`.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be created.
    pub fn new(url: impl Into<String>) -> Result<Self, ProtocolError> {
        PeerClientBuilder::new().url(url).build()
    }

    /// Returns the status URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetches the peer's status body.
    ///
    /// With a challenge the peer answers with a signed envelope, otherwise
    /// with plain status JSON.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` on transport failure or a non-success status.
    pub async fn fetch_status(&self, challenge: Option<&str>) -> Result<Vec<u8>, ProtocolError> {
        let mut request = self.client.get(&self.url);
        if let Some(challenge) = challenge {
            request = request.query(&[("challenge", challenge)]);
        }

        tracing::trace!(url = %self.url, "Polling peer status");

        let response = request.send().await.map_err(ProtocolError::Http)?;
        if !response.status().is_success() {
            return Err(ProtocolError::ConnectionFailed(format!(
                "HTTP {} - {}",
                response.status().as_u16(),
                response.status().canonical_reason().unwrap_or("Unknown")
            )));
        }

        let body = response.bytes().await.map_err(ProtocolError::Http)?;
        Ok(body.to_vec())
    }

    /// Pushes give-way and temp-error to the peer.
    ///
    /// Returns the peer's answer, `ok` on success.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` on transport failure or a non-success status.
    pub async fn push_state(
        &self,
        give_way: bool,
        temp_error: bool,
        key: Option<&str>,
    ) -> Result<String, ProtocolError> {
        let mut form = vec![
            ("giveway", u8::from(give_way).to_string()),
            ("temp_error", u8::from(temp_error).to_string()),
        ];
        if let Some(key) = key {
            form.push(("key", key.to_string()));
        }

        tracing::debug!(url = %self.url, give_way, temp_error, "Pushing state to peer");

        let response = self
            .client
            .post(&self.url)
            .form(&form)
            .send()
            .await
            .map_err(ProtocolError::Http)?;
        if !response.status().is_success() {
            return Err(ProtocolError::ConnectionFailed(format!(
                "HTTP {}",
                response.status().as_u16()
            )));
        }

        let answer = response.text().await.map_err(ProtocolError::Http)?;
        Ok(answer.trim().to_string())
    }
}

/// Builder for a [`PeerClient`] with custom configuration.
#[derive(Debug, Default)]
pub struct PeerClientBuilder {
    url: Option<String>,
    timeout: Option<Duration>,
}

impl PeerClientBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the status URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns error if the URL is missing or the client cannot be created.
    pub fn build(self) -> Result<PeerClient, ProtocolError> {
        let url = self
            .url
            .ok_or_else(|| ProtocolError::ConnectionFailed("url is required".to_string()))?;
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url
        } else {
            format!("http://{url}")
        };

        let client = Client::builder()
            .timeout(self.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .map_err(ProtocolError::Http)?;

        Ok(PeerClient { url, client })
    }
}
