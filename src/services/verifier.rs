//! Verifier: the external authority asked which stored paths are orphans.
//!
//! The reconciler submits relative paths (archive directories suffixed with
//! `/`) and deletes only what comes back.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::StatusCode;
use std::{fmt, time::Duration};
use thiserror::Error;
use tracing::error;

/// Request timeout for the HTTP verifier.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("verifier request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("verifier responded with {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("verifier returned an unreadable payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[async_trait]
pub trait Verifier: Send + Sync + fmt::Debug {
    /// Return the subset of `paths` that is safe to delete.
    async fn check(&self, paths: &[String]) -> Result<Vec<String>, VerifierError>;
}

/// Verifier backed by an HTTP endpoint: `PUT <url>` with a JSON array body,
/// answered by a JSON array of deletable paths.
#[derive(Debug, Clone)]
pub struct HttpVerifier {
    http: reqwest::Client,
    url: String,
}

impl HttpVerifier {
    pub fn new(url: impl Into<String>) -> Result<Self, VerifierError> {
        let http = reqwest::Client::builder().timeout(VERIFY_TIMEOUT).build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Verifier for HttpVerifier {
    async fn check(&self, paths: &[String]) -> Result<Vec<String>, VerifierError> {
        let response = self
            .http
            .put(&self.url)
            .json(paths)
            .send()
            .await
            .inspect_err(|err| error!(%err, url = %self.url, "Fail to send verify request"))?;

        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&body).into_owned();
            error!(status = status.as_u16(), body = %body, "Verifier returned bad status code");
            return Err(VerifierError::Status { status, body });
        }

        serde_json::from_slice(&body).map_err(|err| {
            error!(%err, "Fail to parse verifier response");
            VerifierError::Payload(err)
        })
    }
}

type Handler = Box<dyn Fn(&[String]) -> Vec<String> + Send + Sync>;

/// In-process verifier used when no endpoint is configured.
///
/// Deletes nothing unless a handler is installed.
#[derive(Default)]
pub struct OfflineVerifier {
    handler: RwLock<Option<Handler>>,
}

impl OfflineVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&[String]) -> Vec<String> + Send + Sync + 'static,
    {
        let verifier = Self::new();
        verifier.set_handler(handler);
        verifier
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&[String]) -> Vec<String> + Send + Sync + 'static,
    {
        *self.handler.write() = Some(Box::new(handler));
    }
}

impl fmt::Debug for OfflineVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineVerifier")
            .field("has_handler", &self.handler.read().is_some())
            .finish()
    }
}

#[async_trait]
impl Verifier for OfflineVerifier {
    async fn check(&self, paths: &[String]) -> Result<Vec<String>, VerifierError> {
        Ok(self
            .handler
            .read()
            .as_ref()
            .map(|handler| handler(paths))
            .unwrap_or_default())
    }
}
