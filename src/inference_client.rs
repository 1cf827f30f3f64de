//! HTTPS client for the remote inference server (spec.md §4.4, §6).
//!
//! Retry/backoff is grounded in the teacher's `cube_client.rs`
//! (`should_retry`/`backoff`), but narrowed per spec.md §7: only transient
//! transport errors (timeouts, connection resets, 5xx with no explicit
//! failure code) are retried here. The status codes spec.md §4.4 gives an
//! explicit meaning to (551/554/500/405/552/553) are returned to the caller
//! un-retried — the Coordinator is the one that decides what they mean for a
//! Task's state.

use std::time::Duration;

use bytes::Bytes;
use camino::Utf8Path;
use reqwest::{Client, StatusCode};

use crate::catalog::models::Task;
use crate::config::TlsTrust;
use crate::error::InferenceClientError;
use crate::ids::{HumanReadableId, InferenceServerUid};

const RETRYABLE_STATUS: &[StatusCode] = &[
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::TOO_MANY_REQUESTS,
];

/// The server-side statuses spec.md §4.4/§7 give an explicit, non-retryable
/// meaning to. `post`/`delete` don't special-case these; only `get` does.
const GET_PENDING_STATUS: &[u16] = &[551, 554];
const GET_FAILED_STATUS: &[u16] = &[500, 405, 552, 553];

/// Outcome of a `get` call (spec.md §4.4). `NotFound` (HTTP 404) is not
/// named in the status-mapping table; this client treats it distinctly from
/// the generic `Error` bucket, and the Coordinator folds it into `Failed`
/// (DESIGN.md records this as a resolved ambiguity). Status-carrying variants
/// keep the raw HTTP status so the Coordinator can append it to the
/// inference-server-response audit log (SPEC_FULL.md §3).
#[derive(Debug)]
pub enum GetOutcome {
    Bytes(Bytes),
    Pending(u16),
    Failed(u16),
    NotFound,
    Error(InferenceClientError),
}

pub struct InferenceClient {
    client: Client,
    retries: u16,
}

impl InferenceClient {
    pub fn new(trust: &TlsTrust, timeout: Duration, retries: u16) -> Result<Self, InferenceClientError> {
        let mut builder = Client::builder().timeout(timeout);
        builder = match trust {
            TlsTrust::System => builder,
            TlsTrust::Insecure => builder.danger_accept_invalid_certs(true),
            TlsTrust::Path(path) => {
                let pem = std::fs::read(path)?;
                let cert = reqwest::Certificate::from_pem(&pem)
                    .map_err(InferenceClientError::Transport)?;
                builder.add_root_certificate(cert)
            }
        };
        let client = builder.build().map_err(InferenceClientError::Transport)?;
        Ok(Self { client, retries })
    }

    /// `post(task) -> inference_server_uid` (spec.md §4.4, §6): multipart
    /// upload of the input archive under part name `tar_file`, query
    /// parameter `human_readable_id`.
    pub async fn post(
        &self,
        url: &str,
        human_readable_id: &HumanReadableId,
        task: &Task,
    ) -> Result<InferenceServerUid, InferenceClientError> {
        self.with_retries(|| self.send_post(url, human_readable_id, &task.input_archive_path)).await
    }

    async fn send_post(
        &self,
        url: &str,
        human_readable_id: &HumanReadableId,
        input_archive_path: &Utf8Path,
    ) -> Result<InferenceServerUid, InferenceClientError> {
        let bytes = fs_err::tokio::read(input_archive_path).await?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name("input.tar");
        let form = reqwest::multipart::Form::new().part("tar_file", part);
        let response = self
            .client
            .post(url)
            .query(&[("human_readable_id", human_readable_id.as_str())])
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(InferenceClientError::UnexpectedStatus(response.status()));
        }
        let uid: String = response.json().await?;
        Ok(InferenceServerUid::new(uid))
    }

    /// `get(task) -> GetOutcome` (spec.md §4.4, §6).
    pub async fn get(&self, url: &str, uid: &InferenceServerUid) -> GetOutcome {
        match self.with_retries(|| self.send_get(url, uid)).await {
            Ok(bytes) => GetOutcome::Bytes(bytes),
            Err(InferenceClientError::UnexpectedStatus(status)) => classify_get_status(status),
            Err(e) => GetOutcome::Error(e),
        }
    }

    async fn send_get(&self, url: &str, uid: &InferenceServerUid) -> Result<Bytes, InferenceClientError> {
        let response = self
            .client
            .get(format!("{url}/outputs/"))
            .query(&[("uid", uid.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(InferenceClientError::UnexpectedStatus(response.status()));
        }
        Ok(response.bytes().await?)
    }

    /// `delete(task) -> ok` (spec.md §4.4, §6).
    pub async fn delete(&self, url: &str, uid: &InferenceServerUid) -> Result<(), InferenceClientError> {
        self.with_retries(|| self.send_delete(url, uid)).await
    }

    async fn send_delete(&self, url: &str, uid: &InferenceServerUid) -> Result<(), InferenceClientError> {
        let response = self
            .client
            .delete(url)
            .query(&[("uid", uid.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(InferenceClientError::UnexpectedStatus(response.status()));
        }
        Ok(())
    }

    /// Retries only transient transport errors (spec.md §7); any response
    /// that carries a status code — success or otherwise — is returned
    /// immediately to the caller.
    async fn with_retries<F, Fut, T>(&self, mut attempt: F) -> Result<T, InferenceClientError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, InferenceClientError>>,
    {
        let max_attempts = self.retries + 1;
        let mut last_error = None;
        for attempt_no in 1..=max_attempts {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if should_retry(&e) && attempt_no < max_attempts => {
                    let duration = backoff(attempt_no);
                    tracing::warn!(attempt = attempt_no, error = %e, delay_secs = duration.as_secs(), "transient inference-client error, retrying");
                    tokio::time::sleep(duration).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.expect("loop runs at least once"))
    }
}

fn classify_get_status(status: StatusCode) -> GetOutcome {
    let code = status.as_u16();
    if GET_PENDING_STATUS.contains(&code) {
        GetOutcome::Pending(code)
    } else if GET_FAILED_STATUS.contains(&code) {
        GetOutcome::Failed(code)
    } else if status == StatusCode::NOT_FOUND {
        GetOutcome::NotFound
    } else {
        GetOutcome::Error(InferenceClientError::UnexpectedStatus(status))
    }
}

fn should_retry(e: &InferenceClientError) -> bool {
    match e {
        InferenceClientError::Transport(source) => source.is_timeout() || source.is_connect() || source.status().map(|s| RETRYABLE_STATUS.contains(&s)).unwrap_or(true),
        InferenceClientError::UnexpectedStatus(status) => RETRYABLE_STATUS.contains(status),
        InferenceClientError::Io(_) => false,
    }
}

/// Exponential backoff capped at 20s, identical in shape to the teacher's
/// `cube_client::backoff`.
fn backoff(attempt: u16) -> Duration {
    Duration::from_secs(std::cmp::min(2u64.pow(attempt as u32), 20))
}
