//! HTTP control-plane provider.
//!
//! Talks JSON to a resource gateway:
//! `POST /v1/resources` creates, `GET /v1/resources/{kind}/{handle}`
//! describes and `DELETE` on the same path deletes.
//!
//! Creates carry an `Idempotency-Key` header so a retried POST whose first
//! attempt was committed does not produce a second resource. Retries stop
//! as soon as the run is cancelled.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::{ProviderConfig, ResourceKind};
use crate::error::{ApplyError, ConfigError, ProviderError, Result, TierformError};

use super::traits::Provider;
use super::types::{CreateRequest, ProviderResource, ProviderStatus};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of attempts for transient failures.
const MAX_RETRIES: u32 = 3;

/// Base delay between retries.
const RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Retry delay used when a 429 carries no `Retry-After` header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Upper bound on a server-supplied `Retry-After`.
const MAX_RETRY_AFTER_SECS: u64 = 60;

/// Header carrying the create deduplication key.
const IDEMPOTENCY_KEY: &str = "idempotency-key";

/// Provider backed by an HTTP resource gateway.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Gateway base URL.
    endpoint: Url,
    /// Bearer token.
    token: String,
    /// Base delay between retries, multiplied by the attempt number.
    retry_delay: Duration,
    /// Stops retries once the run is cancelled.
    cancel: CancellationToken,
}

/// What a single gateway call produced.
#[derive(Debug)]
enum Reply {
    /// 404.
    NotFound,
    /// 2xx without a body.
    Empty,
    /// 2xx with a JSON body.
    Body(JsonValue),
}

/// Error body returned by the gateway.
#[derive(Debug, Deserialize)]
struct GatewayError {
    message: String,
}

impl HttpProvider {
    /// Creates a provider for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a valid URL or the HTTP client
    /// cannot be created.
    pub fn new(endpoint: &str, token: &str) -> Result<Self> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a provider with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a valid URL or the HTTP client
    /// cannot be created.
    pub fn with_timeout(endpoint: &str, token: &str, timeout_secs: u64) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| ConfigError::validation(format!("Invalid provider endpoint: {e}"), "provider.endpoint"))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            token: token.to_string(),
            retry_delay: RETRY_DELAY,
            cancel: CancellationToken::new(),
        })
    }

    /// Creates a provider from the plan's provider section.
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint is configured.
    pub fn from_config(config: &ProviderConfig, token: &str) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| ConfigError::validation("The http provider requires an endpoint", "provider.endpoint"))?;
        Self::with_timeout(endpoint, token, config.request_timeout_secs)
    }

    /// Overrides the base retry delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Stops retrying when `cancel` fires. A request already on the wire
    /// still completes.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| TierformError::internal(format!("Endpoint {} cannot be a base URL", self.endpoint)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Sends a request, retrying throttling, network errors and 5xx responses.
    ///
    /// No retry is issued once the cancellation token fires.
    async fn send(&self, request: Outgoing<'_>) -> Result<Reply> {
        let resource = request.resource;
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if let Some(error) = &last_error {
                let delay = match error {
                    TierformError::Provider(ProviderError::Throttled { retry_after_secs }) => {
                        Duration::from_secs(*retry_after_secs)
                    }
                    _ => self.retry_delay * attempt,
                };
                debug!(resource, attempt, delay_ms = delay.as_millis(), "Retrying provider call");
                tokio::select! {
                    () = self.cancel.cancelled() => {
                        debug!(resource, "Cancelled, not retrying provider call");
                        return Err(ApplyError::Cancelled {
                            resource: resource.to_string(),
                        }
                        .into());
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }

            match self.send_once(&request).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() => {
                    warn!(resource, attempt = attempt + 1, error = %e, "Provider call failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::network("Max retries exceeded").into()))
    }

    async fn send_once(&self, outgoing: &Outgoing<'_>) -> Result<Reply> {
        let resource = outgoing.resource;
        trace!(method = %outgoing.method, url = %outgoing.url, "Provider request");

        let mut request = self
            .client
            .request(outgoing.method.clone(), outgoing.url.clone())
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .header(header::ACCEPT, "application/json");
        if let Some(body) = outgoing.body {
            request = request.json(body);
        }
        if let Some(key) = outgoing.idempotency_key {
            request = request.header(IDEMPOTENCY_KEY, key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("Request failed: {e}")))?;

        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(Reply::NotFound);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
                .min(MAX_RETRY_AFTER_SECS);
            return Err(ProviderError::Throttled { retry_after_secs }.into());
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::AuthenticationFailed {
                message: format!("Gateway returned {status}"),
            }
            .into());
        }

        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::network(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            let message = serde_json::from_str::<GatewayError>(&text).map_or(text, |e| e.message);
            return Err(ProviderError::rejected(resource, status.as_u16(), message).into());
        }

        if text.trim().is_empty() {
            return Ok(Reply::Empty);
        }

        serde_json::from_str(&text)
            .map(Reply::Body)
            .map_err(|e| invalid_response(format!("Response is not JSON: {e}")))
    }
}

/// One gateway call, replayed verbatim on retry.
struct Outgoing<'a> {
    method: Method,
    url: Url,
    body: Option<&'a JsonValue>,
    idempotency_key: Option<&'a str>,
    resource: &'a str,
}

impl<'a> Outgoing<'a> {
    const fn new(method: Method, url: Url, resource: &'a str) -> Self {
        Self {
            method,
            url,
            body: None,
            idempotency_key: None,
            resource,
        }
    }
}

fn invalid_response(message: impl Into<String>) -> TierformError {
    ProviderError::InvalidResponse {
        message: message.into(),
    }
    .into()
}

fn decode<T: DeserializeOwned>(body: JsonValue, what: &str) -> Result<T> {
    serde_json::from_value(body).map_err(|e| invalid_response(format!("Failed to parse {what} response: {e}")))
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create(&self, request: &CreateRequest) -> Result<ProviderResource> {
        let url = self.url(&["v1", "resources"])?;
        let body = serde_json::to_value(request)
            .map_err(|e| TierformError::internal(format!("Failed to encode create request: {e}")))?;

        let key = request.idempotency_key();

        debug!(resource = %request.resource_id, kind = %request.kind, "Creating resource");

        let outgoing = Outgoing {
            body: Some(&body),
            idempotency_key: Some(&key),
            ..Outgoing::new(Method::POST, url, &request.resource_id)
        };
        match self.send(outgoing).await? {
            Reply::Body(body) => decode(body, "create"),
            Reply::Empty => Err(invalid_response("Create returned no body")),
            Reply::NotFound => Err(ProviderError::rejected(
                &request.resource_id,
                404,
                format!("Gateway does not support kind {}", request.kind),
            )
            .into()),
        }
    }

    async fn describe(&self, kind: ResourceKind, handle: &str) -> Result<ProviderResource> {
        let url = self.url(&["v1", "resources", kind.as_str(), handle])?;

        match self.send(Outgoing::new(Method::GET, url, handle)).await? {
            Reply::Body(body) => decode(body, "describe"),
            Reply::NotFound => Ok(ProviderResource::new(handle, ProviderStatus::NotFound)),
            Reply::Empty => Err(invalid_response("Describe returned no body")),
        }
    }

    async fn delete(&self, kind: ResourceKind, handle: &str) -> Result<ProviderStatus> {
        let url = self.url(&["v1", "resources", kind.as_str(), handle])?;

        debug!(%kind, handle, "Deleting resource");

        match self.send(Outgoing::new(Method::DELETE, url, handle)).await? {
            Reply::Body(body) => decode(body, "delete"),
            Reply::NotFound | Reply::Empty => Ok(ProviderStatus::NotFound),
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn provider(server: &MockServer) -> HttpProvider {
        HttpProvider::new(&server.uri(), "test-token")
            .unwrap()
            .with_retry_delay(Duration::from_millis(10))
    }

    fn vpc_request() -> CreateRequest {
        let mut attributes = BTreeMap::new();
        attributes.insert(String::from("cidr_block"), json!("10.0.0.0/16"));
        CreateRequest::new("vpc", ResourceKind::Vpc, attributes).with_region(Some("us-east-1"))
    }

    #[tokio::test]
    async fn test_create_sends_body_and_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/resources"))
            .and(header("authorization", "Bearer test-token"))
            .and(body_partial_json(json!({"kind": "vpc", "name": "vpc", "region": "us-east-1"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "handle": "vpc-0a1b",
                "status": {"state": "in_progress"},
                "attributes": {"id": "vpc-0a1b"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let resource = provider(&server).await.create(&vpc_request()).await.unwrap();
        assert_eq!(resource.handle, "vpc-0a1b");
        assert_eq!(resource.status, ProviderStatus::InProgress);
        assert_eq!(resource.attributes["id"], "vpc-0a1b");
    }

    #[tokio::test]
    async fn test_describe_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/resources/vpc/vpc-gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let resource = provider(&server).await.describe(ResourceKind::Vpc, "vpc-gone").await.unwrap();
        assert_eq!(resource.status, ProviderStatus::NotFound);
    }

    #[tokio::test]
    async fn test_delete_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/resources/subnet/subnet-1"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"state": "in_progress"})))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/resources/subnet/subnet-2"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let provider = provider(&server).await;
        assert_eq!(
            provider.delete(ResourceKind::Subnet, "subnet-1").await.unwrap(),
            ProviderStatus::InProgress
        );
        assert_eq!(
            provider.delete(ResourceKind::Subnet, "subnet-2").await.unwrap(),
            ProviderStatus::NotFound
        );
    }

    #[tokio::test]
    async fn test_client_error_is_rejected_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/resources"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"message": "invalid cidr_block"})))
            .expect(1)
            .mount(&server)
            .await;

        let err = provider(&server).await.create(&vpc_request()).await.unwrap_err();
        match err {
            TierformError::Provider(ProviderError::Rejected { resource, status, message }) => {
                assert_eq!(resource, "vpc");
                assert_eq!(status, 400);
                assert_eq!(message, "invalid cidr_block");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_errors_retried_then_fail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/resources/vpc/vpc-1"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .expect(u64::from(MAX_RETRIES))
            .mount(&server)
            .await;

        let err = provider(&server).await.describe(ResourceKind::Vpc, "vpc-1").await.unwrap_err();
        assert!(matches!(err, TierformError::Provider(ProviderError::Rejected { status: 503, .. })));
    }

    #[tokio::test]
    async fn test_throttled_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/resources/vpc/vpc-1"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/resources/vpc/vpc-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "handle": "vpc-1",
                "status": {"state": "available"}
            })))
            .mount(&server)
            .await;

        let resource = provider(&server).await.describe(ResourceKind::Vpc, "vpc-1").await.unwrap();
        assert_eq!(resource.status, ProviderStatus::Available);
        assert!(resource.attributes.is_empty());
    }

    #[tokio::test]
    async fn test_retry_after_is_capped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/resources/vpc/vpc-1"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "86400"))
            .mount(&server)
            .await;

        let provider = provider(&server).await;
        let url = provider.url(&["v1", "resources", "vpc", "vpc-1"]).unwrap();
        let err = provider.send_once(&Outgoing::new(Method::GET, url, "vpc-1")).await.unwrap_err();
        assert!(matches!(
            err,
            TierformError::Provider(ProviderError::Throttled { retry_after_secs: MAX_RETRY_AFTER_SECS })
        ));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_retry_wait() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/resources"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
            .expect(1)
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let provider = provider(&server).await.with_cancellation(cancel.clone());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = provider.create(&vpc_request()).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            TierformError::Apply(ApplyError::Cancelled { resource }) => assert_eq!(resource, "vpc"),
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_retry_reuses_idempotency_key() {
        let request = vpc_request().with_project("web-stack", "prod");
        let key = request.idempotency_key();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/resources"))
            .and(header(IDEMPOTENCY_KEY, key.as_str()))
            .respond_with(ResponseTemplate::new(503).set_body_string("gateway timeout"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/resources"))
            .and(header(IDEMPOTENCY_KEY, key.as_str()))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "handle": "vpc-0a1b",
                "status": {"state": "available"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let resource = provider(&server).await.create(&request).await.unwrap();
        assert_eq!(resource.handle, "vpc-0a1b");
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = provider(&server).await.create(&vpc_request()).await.unwrap_err();
        assert!(matches!(err, TierformError::Provider(ProviderError::AuthenticationFailed { .. })));
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(HttpProvider::new("not a url", "t").is_err());
    }

    #[test]
    fn test_from_config_requires_endpoint() {
        let err = HttpProvider::from_config(&ProviderConfig::default(), "t").unwrap_err();
        assert!(err.is_config());
    }
}
