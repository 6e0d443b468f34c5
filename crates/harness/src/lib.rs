//! HTTP driver for the signup concurrency harness.
//!
//! [`HttpRegistrar`] posts registration requests to a running server so that
//! [`signup::harness::run_batch`] can hammer it with duplicates over the
//! network, the same way real clients retrying a request would.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use signup::coordinator::RegistrationOutcome;
use signup::harness::Registrar;
use signup::identity::RegistrationRequest;
use signup::server::RegisterResponse;
use tracing::debug;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Registers users through the `/register` HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpRegistrar {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRegistrar {
    /// `base_url` like `http://localhost:9999`, `register_path` like `register`.
    pub fn new(base_url: &str, register_path: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: join_url(base_url, register_path),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Map a response body back onto an outcome.
pub fn parse_outcome(body: &RegisterResponse) -> Option<RegistrationOutcome> {
    match body.outcome.as_str() {
        "Registered" => Some(RegistrationOutcome::Registered {
            id: body.id.unwrap_or_default(),
        }),
        "AlreadyRegistered" => Some(RegistrationOutcome::AlreadyRegistered),
        "RegistrationUnavailable" => Some(RegistrationOutcome::Unavailable),
        _ => None,
    }
}

#[async_trait]
impl Registrar for HttpRegistrar {
    async fn register(&self, request: &RegistrationRequest) -> Result<RegistrationOutcome> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.endpoint))?;

        let status = response.status();
        let body: RegisterResponse = response
            .json()
            .await
            .with_context(|| format!("unreadable response body ({status})"))?;
        debug!(openid = %request.openid, outcome = %body.outcome, code = body.code, "Registration response");

        parse_outcome(&body)
            .ok_or_else(|| anyhow!("server error {status}: {} ({})", body.message, body.outcome))
    }
}
