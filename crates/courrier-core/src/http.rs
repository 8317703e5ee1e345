//! HTTP implementations of the directory and relay seams.
//!
//! Thin REST clients over `reqwest`.  Transport failures map to the
//! `Unavailable` variants so the delivery worker treats them as
//! retryable; non-2xx responses map to `Rejected` with the status code
//! and are terminal.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use courrier_shared::keys::{DeviceRegistration, OneTimePreKeyPublic, PeerBundle};
use courrier_shared::protocol::{Frame, RelayEvent};
use courrier_shared::types::{ConversationId, DeviceId, UserId};

use crate::directory::DirectoryClient;
use crate::error::{DirectoryError, RelayError};
use crate::relay::{RelayChannel, Subscription};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
/// Long-poll requests get a wider window than plain calls.
const POLL_TIMEOUT: Duration = Duration::from_secs(40);
const POLL_RETRY_DELAY: Duration = Duration::from_secs(2);

fn build_client(timeout: Duration) -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| e.to_string())
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

pub struct HttpDirectoryClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpDirectoryClient {
    pub fn new(base_url: &str) -> Result<Self, DirectoryError> {
        let http = build_client(HTTP_TIMEOUT).map_err(DirectoryError::Unavailable)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn expect_success(
        &self,
        resp: reqwest::Response,
        what: &str,
    ) -> Result<reqwest::Response, DirectoryError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        debug!(what, status = status.as_u16(), "directory rejected request");
        Err(DirectoryError::Rejected {
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
    async fn register_device(
        &self,
        registration: &DeviceRegistration,
    ) -> Result<(), DirectoryError> {
        let url = format!("{}/devices", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(registration)
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        self.expect_success(resp, "register_device").await?;
        Ok(())
    }

    async fn publish_prekeys(
        &self,
        user: &UserId,
        device: DeviceId,
        prekeys: &[OneTimePreKeyPublic],
    ) -> Result<(), DirectoryError> {
        let url = format!(
            "{}/devices/user/{}/prekeys/{}",
            self.base_url,
            user.to_hex(),
            device
        );
        let resp = self
            .http
            .post(&url)
            .json(&prekeys)
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        self.expect_success(resp, "publish_prekeys").await?;
        Ok(())
    }

    async fn fetch_bundles(&self, user: &UserId) -> Result<Vec<PeerBundle>, DirectoryError> {
        let url = format!("{}/devices/user/{}", self.base_url, user.to_hex());
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DirectoryError::NoDevicesRegistered);
        }
        let resp = self.expect_success(resp, "fetch_bundles").await?;
        let mut bundles: Vec<PeerBundle> = resp
            .json()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        if bundles.is_empty() {
            return Err(DirectoryError::NoDevicesRegistered);
        }
        // The bundle listing is public material; one-time pre-keys are
        // claimed per device through their own endpoint.  A drained pool
        // is not fatal, the session just loses the one-time contribution.
        for bundle in &mut bundles {
            if bundle.one_time_prekey.is_none() {
                bundle.one_time_prekey = self.claim_prekey(user, bundle.device_id).await?;
            }
        }
        Ok(bundles)
    }
}

impl HttpDirectoryClient {
    async fn claim_prekey(
        &self,
        user: &UserId,
        device: DeviceId,
    ) -> Result<Option<OneTimePreKeyPublic>, DirectoryError> {
        let url = format!(
            "{}/devices/user/{}/prekeys/{}",
            self.base_url,
            user.to_hex(),
            device
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(peer = %user, device = %device, "peer one-time pre-key pool is empty");
            return Ok(None);
        }
        let resp = self.expect_success(resp, "claim_prekey").await?;
        let prekey = resp
            .json()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        Ok(Some(prekey))
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// One page of the conversation event feed.
#[derive(Deserialize)]
struct EventPage {
    next_cursor: u64,
    events: Vec<RelayEvent>,
}

pub struct HttpRelayChannel {
    base_url: String,
    http: reqwest::Client,
    poll: reqwest::Client,
}

impl HttpRelayChannel {
    pub fn new(base_url: &str) -> Result<Self, RelayError> {
        let http = build_client(HTTP_TIMEOUT).map_err(RelayError::Unavailable)?;
        let poll = build_client(POLL_TIMEOUT).map_err(RelayError::Unavailable)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            poll,
        })
    }
}

#[async_trait]
impl RelayChannel for HttpRelayChannel {
    async fn publish(&self, frame: &Frame) -> Result<(), RelayError> {
        let url = format!("{}/messages", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(frame)
            .send()
            .await
            .map_err(|e| RelayError::Unavailable(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RelayError::Rejected {
                status: status.as_u16(),
            })
        }
    }

    async fn subscribe(&self, conversation: ConversationId) -> Result<Subscription, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let url = format!("{}/conversations/{}/events", self.base_url, conversation);
        let poll = self.poll.clone();
        let handle = tokio::spawn(poll_events(poll, url, tx));
        Ok(Subscription::new(
            conversation,
            rx,
            Box::new(AbortOnDrop(handle)),
        ))
    }
}

/// Long-poll loop feeding one subscription.  Ends when the receiver side
/// is dropped; transport errors back off and retry.
async fn poll_events(
    poll: reqwest::Client,
    url: String,
    tx: mpsc::UnboundedSender<RelayEvent>,
) {
    let mut cursor: u64 = 0;
    loop {
        let resp = poll
            .get(&url)
            .query(&[("after", cursor)])
            .send()
            .await;
        let page: EventPage = match resp {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "event feed returned malformed page");
                    sleep(POLL_RETRY_DELAY).await;
                    continue;
                }
            },
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "event feed rejected poll");
                sleep(POLL_RETRY_DELAY).await;
                continue;
            }
            Err(e) => {
                debug!(error = %e, "event feed unreachable, retrying");
                sleep(POLL_RETRY_DELAY).await;
                continue;
            }
        };
        cursor = page.next_cursor;
        for event in page.events {
            if tx.send(event).is_err() {
                return;
            }
        }
    }
}

/// Subscription guard: dropping it stops the poll task.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
