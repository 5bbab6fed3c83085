use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use tokio::time::timeout;

use super::{parse_snapshot, parse_write_ack, RemoteStore, WriteMode, WriteOutcome};
use crate::config::RemoteConfig;
use crate::error::{PortalError, Result};
use crate::model::{Action, Dataset};

/// Remote store reached over HTTP: `GET` for snapshots, `POST` for actions.
pub struct HttpRemoteStore {
    config: RemoteConfig,
    client: reqwest::Client,
}

impl HttpRemoteStore {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(PortalError::InvalidConfiguration(
                "REMOTE_ENDPOINT is not set".to_string(),
            ));
        }

        // Redirects must be followed: spreadsheet web apps answer with a 302.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| PortalError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        tracing::info!(
            endpoint = %config.endpoint,
            read_timeout_secs = config.read_timeout.as_secs(),
            write_timeout_secs = config.write_timeout.as_secs(),
            write_mode = %config.write_mode,
            "Remote store adapter initialized"
        );

        Ok(Self { config, client })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Attempts a single snapshot read
    async fn try_fetch(&self) -> Result<Dataset> {
        let cache_buster = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default()
            .to_string();

        let fetch_future = async {
            let response = self
                .client
                .get(&self.config.endpoint)
                .query(&[("cb", cache_buster.as_str())])
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(PortalError::network(format!("Snapshot read returned HTTP {}", status)));
            }

            let body = response.text().await?;
            parse_snapshot(&body)
        };

        timeout(self.config.read_timeout, fetch_future)
            .await
            .map_err(|_| PortalError::Timeout("Snapshot read timed out".to_string()))?
    }

    async fn try_write(&self, action: &Action) -> Result<WriteOutcome> {
        let request = match self.config.write_mode {
            WriteMode::Envelope => self
                .client
                .post(&self.config.endpoint)
                .json(&action.to_envelope()?),
            WriteMode::Flattened => self
                .client
                .post(&self.config.endpoint)
                .json(&action.to_flattened()?),
            // text/plain keeps this a "simple request": no preflight, no readable reply.
            WriteMode::Opaque => self
                .client
                .post(&self.config.endpoint)
                .header(CONTENT_TYPE, "text/plain")
                .body(serde_json::to_string(&action.to_flattened()?)?),
        };

        let write_future = async {
            let response = request.send().await?;

            if self.config.write_mode == WriteMode::Opaque {
                return Ok(WriteOutcome::Ambiguous);
            }

            let status = response.status();
            if !status.is_success() {
                return Ok(WriteOutcome::Failed(format!("HTTP {}", status)));
            }

            let body = response.text().await.unwrap_or_default();
            Ok::<_, PortalError>(parse_write_ack(&body))
        };

        timeout(self.config.write_timeout, write_future)
            .await
            .map_err(|_| PortalError::Timeout("Write timed out".to_string()))?
    }
}

impl RemoteStore for HttpRemoteStore {
    /// Reads a snapshot, retrying transient failures with linear backoff.
    async fn fetch_snapshot(&self) -> Result<Dataset> {
        let attempts = self.config.read_retries.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            match self.try_fetch().await {
                Ok(dataset) => {
                    tracing::debug!(
                        attempt = attempt + 1,
                        students = dataset.students.len(),
                        sessions = dataset.sessions.len(),
                        rooms = dataset.rooms.len(),
                        "Snapshot fetched"
                    );
                    return Ok(dataset);
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        endpoint = %self.config.endpoint,
                        "Snapshot read failed"
                    );
                    last_error = Some(e);

                    if attempt + 1 < attempts {
                        // 500ms, 1s, 1.5s... plus jitter so many clients don't retry in lockstep
                        let jitter = rand::thread_rng().gen_range(0..250);
                        let delay = Duration::from_millis(500 * (u64::from(attempt) + 1) + jitter);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| PortalError::network("Snapshot read failed")))
    }

    /// Writes are not retried: a repeated ADD may not be idempotent remotely.
    async fn apply_action(&self, action: &Action) -> WriteOutcome {
        match self.try_write(action).await {
            Ok(outcome) => {
                tracing::debug!(action = %action.name(), outcome = ?outcome, "Write finished");
                outcome
            }
            Err(e) => {
                tracing::error!(action = %action.name(), error = %e, "Write failed");
                WriteOutcome::Failed(e.to_string())
            }
        }
    }
}
