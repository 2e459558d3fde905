//! Reservation verification-code service client.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Timeout for requests to the verification service.
const VERIFIER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("unable to verify code")]
    VerificationFailed,

    #[error("unable to satisfy code")]
    SatisfyFailed,

    #[error("verification request timed out")]
    TimedOut,

    #[error("verification request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Checks reservation codes with the verification microservice.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Check that a code is valid and unspent.
    async fn verify_code(&self, code: &str) -> Result<(), VerifierError>;

    /// Mark a code as spent on a completed reservation.
    async fn satisfy_code(&self, code: &str, kitty_id: &str) -> Result<(), VerifierError>;
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    code: &'a str,
}

#[derive(Serialize)]
struct SatisfyRequest<'a> {
    code: &'a str,
    kitty_id: &'a str,
}

/// HTTP client for the verification service.
pub struct HttpVerifier {
    http: reqwest::Client,
    base_url: String,
}

impl HttpVerifier {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(VERIFIER_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn map_status(status: reqwest::StatusCode, failure: VerifierError) -> Result<(), VerifierError> {
        match status {
            reqwest::StatusCode::NO_CONTENT => Ok(()),
            reqwest::StatusCode::REQUEST_TIMEOUT => Err(VerifierError::TimedOut),
            _ => Err(failure),
        }
    }
}

#[async_trait]
impl Verifier for HttpVerifier {
    async fn verify_code(&self, code: &str) -> Result<(), VerifierError> {
        let url = format!("{}/api/verify_code", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&VerifyRequest { code })
            .send()
            .await?;
        Self::map_status(response.status(), VerifierError::VerificationFailed)
    }

    async fn satisfy_code(&self, code: &str, kitty_id: &str) -> Result<(), VerifierError> {
        let url = format!("{}/api/satisfy_code", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&SatisfyRequest { code, kitty_id })
            .send()
            .await?;
        Self::map_status(response.status(), VerifierError::SatisfyFailed)
    }
}

/// In-memory verifier for dummy mode and tests.
pub struct DummyVerifier {
    /// `None` accepts any code.
    valid_codes: Option<HashSet<String>>,
    satisfied: Mutex<Vec<(String, String)>>,
}

impl DummyVerifier {
    /// A verifier that accepts every code.
    pub fn accepting_all() -> Self {
        Self {
            valid_codes: None,
            satisfied: Mutex::new(Vec::new()),
        }
    }

    /// A verifier that accepts only the given codes.
    pub fn with_codes<I: IntoIterator<Item = String>>(codes: I) -> Self {
        Self {
            valid_codes: Some(codes.into_iter().collect()),
            satisfied: Mutex::new(Vec::new()),
        }
    }

    /// Codes that have been satisfied, with the kitty they were spent on.
    pub fn satisfied(&self) -> Vec<(String, String)> {
        self.satisfied
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Verifier for DummyVerifier {
    async fn verify_code(&self, code: &str) -> Result<(), VerifierError> {
        match &self.valid_codes {
            Some(codes) if !codes.contains(code) => Err(VerifierError::VerificationFailed),
            _ => Ok(()),
        }
    }

    async fn satisfy_code(&self, code: &str, kitty_id: &str) -> Result<(), VerifierError> {
        self.verify_code(code).await.map_err(|err| {
            warn!(code, "satisfying unknown code");
            err
        })?;
        if let Ok(mut satisfied) = self.satisfied.lock() {
            satisfied.push((code.to_string(), kitty_id.to_string()));
        }
        Ok(())
    }
}
