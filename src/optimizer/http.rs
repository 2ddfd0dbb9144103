//! HTTP optimizer client
//!
//! Posts the [`OptimizationRequest`] as JSON to `{base_url}/optimize` and
//! expects an [`OptimizationResponse`] back.

use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use super::{OptimizationRequest, OptimizationResponse, Optimizer, OptimizerError};
use crate::error::body_snippet;

/// Upstream error bodies are cut to this many characters.
const ERROR_BODY_MAX_CHARS: usize = 200;

/// Optimizer reached over HTTP.
#[derive(Clone)]
pub struct HttpOptimizer {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for HttpOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpOptimizer")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl HttpOptimizer {
    /// Build a client for the optimizer at `base_url`.
    ///
    /// No request timeout is set on the client; the executor's time budget
    /// and cancellation bound every call.
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, OptimizerError> {
        let parsed = Url::parse(base_url).map_err(|err| {
            OptimizerError::Configuration(format!("invalid optimizer base url '{base_url}': {err}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(OptimizerError::Configuration(format!(
                "optimizer base url must be http or https, got '{}'",
                parsed.scheme()
            )));
        }

        let client = Client::builder()
            .user_agent(concat!("route-optimizer-jobs/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/optimize", parsed.as_str().trim_end_matches('/')),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(
        &self,
        request: &OptimizationRequest,
    ) -> Result<OptimizationResponse, OptimizerError> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/json")
            .json(request);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                status = status.as_u16(),
                route_id = request.route_id,
                "Optimizer returned non-success status"
            );
            return Err(OptimizerError::Upstream {
                status: status.as_u16(),
                body: body_snippet(&body, ERROR_BODY_MAX_CHARS),
            });
        }

        let body = response.text().await?;
        serde_json::from_str::<OptimizationResponse>(&body).map_err(|err| {
            OptimizerError::InvalidResponse(format!(
                "{err}; body: {}",
                body_snippet(&body, ERROR_BODY_MAX_CHARS)
            ))
        })
    }
}

#[async_trait]
impl Optimizer for HttpOptimizer {
    #[instrument(skip(self, request, cancel), fields(route_id = request.route_id))]
    async fn optimize(
        &self,
        request: OptimizationRequest,
        cancel: CancellationToken,
    ) -> Result<OptimizationResponse, OptimizerError> {
        debug!(endpoint = %self.endpoint, "Calling optimizer");

        tokio::select! {
            _ = cancel.cancelled() => Err(OptimizerError::Cancelled),
            result = self.send(&request) => result,
        }
    }
}
