use async_trait::async_trait;
use log::debug;
use tokio_util::sync::CancellationToken;
use crumple_core::{classify, TransformError, TransformRequest, TransportFailure};
use crate::config::ServiceConfig;
use crate::schemas::{TransformApiRequest, TransformApiResponse};

pub const REQUEST_ID_HEADER: &str = "X-Request-Id";
const MAX_ERROR_BODY: usize = 512;

/// Payload of a successful exchange
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteImage {
    /// Bare base64 as returned by the service
    pub image: String,
    pub seed: Option<u64>,
    pub message: String,
}

/// One request/response exchange against the transform service.
///
/// Implementations do not retry, cache or deduplicate. A fired `cancel`
/// token must end the call promptly with a `Cancelled` error.
#[async_trait]
pub trait TransformClient: Send + Sync {
    async fn execute(
        &self,
        request: &TransformRequest,
        attempt_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteImage, TransformError>;
}

pub struct HttpTransformClient {
    http: reqwest::Client,
    config: ServiceConfig,
}

impl HttpTransformClient {
    pub fn new(config: ServiceConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, config })
    }

    async fn send(
        &self,
        api_key: &str,
        request: &TransformRequest,
        attempt_id: &str,
    ) -> Result<RemoteImage, TransportFailure> {
        let body = TransformApiRequest::new(&self.config.model, request);

        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(api_key)
            .header(REQUEST_ID_HEADER, attempt_id)
            .timeout(self.config.timeout)
            .json(&body)
            .send()
            .await
            .map_err(transport_failure)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportFailure::Status {
                code: status.as_u16(),
                body: truncate(body),
            });
        }

        let parsed: TransformApiResponse = response.json().await.map_err(|e| {
            if e.is_decode() {
                TransportFailure::Malformed(e.to_string())
            } else {
                transport_failure(e)
            }
        })?;

        if !parsed.success {
            let reason = parsed
                .error
                .filter(|e| !e.is_empty())
                .unwrap_or(parsed.message);
            return Err(TransportFailure::Rejected(reason));
        }

        let data = parsed
            .data
            .ok_or_else(|| TransportFailure::Malformed("response has no image data".into()))?;

        Ok(RemoteImage {
            image: data.image,
            seed: Some(data.seed),
            message: parsed.message,
        })
    }
}

#[async_trait]
impl TransformClient for HttpTransformClient {
    async fn execute(
        &self,
        request: &TransformRequest,
        attempt_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteImage, TransformError> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            return Err(classify(&TransportFailure::MissingApiKey));
        };

        debug!("POST {} (attempt {})", self.config.api_url, attempt_id);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(classify(&TransportFailure::Cancelled)),
            outcome = self.send(api_key, request, attempt_id) => outcome.map_err(|f| classify(&f)),
        }
    }
}

fn transport_failure(e: reqwest::Error) -> TransportFailure {
    if e.is_timeout() {
        TransportFailure::Timeout
    } else {
        TransportFailure::Network(e.to_string())
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}
