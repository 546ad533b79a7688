use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, RETRY_AFTER},
    Client, StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

use super::{
    BackendError, ChatBackend, Concepts, ConceptsRequest, GenerateRequest, GenerateResponse,
    Summary, SummaryRequest,
};

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:3400";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;
const DEFAULT_MAX_BACKOFF_MS: u64 = 5_000;

pub const GENERATE_FLOW: &str = "generateMultimodalResponseFlow";
pub const SUMMARIZE_FLOW: &str = "summarizeHomeworkContextFlow";
pub const IDENTIFY_CONCEPTS_FLOW: &str = "identifyRelevantConceptsFlow";

#[derive(Debug, Clone)]
pub struct GenkitBackendConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
}

impl Default for GenkitBackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BACKEND_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            retry_max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl GenkitBackendConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(base_url) = read_non_empty_env("SAGE_BACKEND_URL") {
            config.base_url = base_url;
        }

        if let Some(timeout_secs) = read_parsed_env::<u64>("SAGE_BACKEND_TIMEOUT_SECS") {
            config.request_timeout_secs = timeout_secs.max(1);
        }

        if let Some(max_retries) = read_parsed_env::<u32>("SAGE_BACKEND_MAX_RETRIES") {
            config.max_retries = max_retries;
        }

        if let Some(initial_backoff_ms) =
            read_parsed_env::<u64>("SAGE_BACKEND_RETRY_INITIAL_BACKOFF_MS")
        {
            config.retry_initial_backoff_ms = initial_backoff_ms.max(1);
        }

        if let Some(max_backoff_ms) = read_parsed_env::<u64>("SAGE_BACKEND_RETRY_MAX_BACKOFF_MS") {
            config.retry_max_backoff_ms = max_backoff_ms.max(1);
        }

        if config.retry_initial_backoff_ms > config.retry_max_backoff_ms {
            config.retry_initial_backoff_ms = config.retry_max_backoff_ms;
        }

        debug!(
            base_url = %config.base_url,
            request_timeout_secs = config.request_timeout_secs,
            max_retries = config.max_retries,
            retry_initial_backoff_ms = config.retry_initial_backoff_ms,
            retry_max_backoff_ms = config.retry_max_backoff_ms,
            "loaded Genkit backend config"
        );
        config
    }

    fn flow_url(&self, flow: &str) -> String {
        format!("{}/{flow}", self.base_url.trim_end_matches('/'))
    }
}

/// Calls the homework-helper Genkit flows over their HTTP surface.
#[derive(Debug, Clone)]
pub struct GenkitChatBackend {
    client: Client,
    config: GenkitBackendConfig,
    jitter_seed: u64,
}

impl GenkitChatBackend {
    pub fn new(config: GenkitBackendConfig) -> Result<Self, BackendError> {
        Self::new_with_jitter_seed(config, seed_from_clock())
    }

    fn new_with_jitter_seed(
        config: GenkitBackendConfig,
        jitter_seed: u64,
    ) -> Result<Self, BackendError> {
        info!(
            base_url = %config.base_url,
            request_timeout_secs = config.request_timeout_secs,
            max_retries = config.max_retries,
            "Genkit chat backend initialized"
        );
        Ok(Self {
            client: build_client(&config)?,
            config,
            jitter_seed,
        })
    }

    fn retry_delay(&self, attempt_index: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(delay) = retry_after {
            return delay;
        }

        let growth_factor = 1_u64.checked_shl(attempt_index.min(20)).unwrap_or(u64::MAX);
        let uncapped_ms = self
            .config
            .retry_initial_backoff_ms
            .saturating_mul(growth_factor);
        let capped_ms = uncapped_ms.min(self.config.retry_max_backoff_ms).max(1);

        // Equal jitter: the delay lands in [base/2, base].
        let half_ms = capped_ms / 2;
        let jitter_span_ms = capped_ms.saturating_sub(half_ms);
        let jitter_offset = if jitter_span_ms == 0 {
            0
        } else {
            self.pseudo_random(attempt_index) % (jitter_span_ms + 1)
        };

        Duration::from_millis(half_ms.saturating_add(jitter_offset).max(1))
    }

    fn pseudo_random(&self, attempt_index: u32) -> u64 {
        let mut state =
            self.jitter_seed ^ (attempt_index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        state ^= state >> 12;
        state ^= state << 25;
        state ^= state >> 27;
        state.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    async fn invoke_flow<I, O>(&self, flow: &'static str, input: &I) -> Result<O, BackendError>
    where
        I: Serialize + Sync,
        O: DeserializeOwned + Send,
    {
        let url = self.config.flow_url(flow);
        let body = FlowRequest { data: input };
        let mut attempt_index = 0;
        info!(flow, url = %url, "starting Genkit flow request");

        loop {
            debug!(flow, attempt = attempt_index + 1, "sending Genkit flow request");
            let response = self.client.post(&url).json(&body).send().await;

            let response = match response {
                Ok(response) => response,
                Err(error) => {
                    let transport_error = map_transport_error(error);
                    if transport_error.retryable && attempt_index < self.config.max_retries {
                        let delay = self.retry_delay(attempt_index, None);
                        warn!(
                            flow,
                            attempt = attempt_index + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %transport_error.error,
                            "retrying Genkit flow request after transport error"
                        );
                        tokio::time::sleep(delay).await;
                        attempt_index += 1;
                        continue;
                    }
                    error!(
                        flow,
                        attempt = attempt_index + 1,
                        error = %transport_error.error,
                        "Genkit flow request failed without retry"
                    );
                    return Err(transport_error.error);
                }
            };

            if response.status().is_success() {
                let raw_body = response
                    .text()
                    .await
                    .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;
                let output = parse_flow_response::<O>(&raw_body)?;
                info!(flow, attempt = attempt_index + 1, "Genkit flow request succeeded");
                return Ok(output);
            }

            let http_error = map_http_error(response).await;
            if http_error.retryable && attempt_index < self.config.max_retries {
                let delay = self.retry_delay(attempt_index, http_error.retry_after);
                warn!(
                    flow,
                    attempt = attempt_index + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %http_error.error,
                    "retrying Genkit flow request after HTTP error"
                );
                tokio::time::sleep(delay).await;
                attempt_index += 1;
                continue;
            }

            error!(
                flow,
                attempt = attempt_index + 1,
                error = %http_error.error,
                "Genkit flow request failed without retry"
            );
            return Err(http_error.error);
        }
    }
}

#[async_trait]
impl ChatBackend for GenkitChatBackend {
    fn name(&self) -> &'static str {
        "genkit"
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, BackendError> {
        self.invoke_flow(GENERATE_FLOW, &request).await
    }

    async fn summarize(&self, context: String) -> Result<Summary, BackendError> {
        self.invoke_flow(SUMMARIZE_FLOW, &SummaryRequest { context })
            .await
    }

    async fn identify_concepts(&self, input: String) -> Result<Concepts, BackendError> {
        self.invoke_flow(IDENTIFY_CONCEPTS_FLOW, &ConceptsRequest { input })
            .await
    }
}

#[derive(Debug, Serialize)]
struct FlowRequest<'a, T> {
    data: &'a T,
}

#[derive(Debug, Deserialize)]
struct FlowResponse<T> {
    result: Option<T>,
    #[serde(default)]
    error: Option<FlowErrorBody>,
}

#[derive(Debug, Deserialize)]
struct FlowErrorEnvelope {
    error: FlowErrorBody,
}

#[derive(Debug, Deserialize)]
struct FlowErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

fn parse_flow_response<O: DeserializeOwned>(raw_body: &str) -> Result<O, BackendError> {
    let parsed = serde_json::from_str::<FlowResponse<O>>(raw_body)
        .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;

    if let Some(error) = parsed.error {
        let message = normalize_optional_string(error.message)
            .or_else(|| normalize_optional_string(error.status))
            .unwrap_or_else(|| "Flow reported an error".to_string());
        return Err(BackendError::Provider(message));
    }

    parsed
        .result
        .ok_or_else(|| BackendError::InvalidResponse("Flow response has no result".to_string()))
}

#[derive(Debug)]
struct RetryableError {
    error: BackendError,
    retryable: bool,
    retry_after: Option<Duration>,
}

fn map_transport_error(error: reqwest::Error) -> RetryableError {
    let retryable = error.is_timeout() || error.is_connect();
    let mapped = if retryable {
        BackendError::Network(error.to_string())
    } else {
        BackendError::Provider(error.to_string())
    };

    RetryableError {
        error: mapped,
        retryable,
        retry_after: None,
    }
}

async fn map_http_error(response: reqwest::Response) -> RetryableError {
    let status = response.status();
    let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
        parse_retry_after(response.headers())
    } else {
        None
    };
    let response_body = response.text().await.unwrap_or_default();
    let fallback_message = format!("Flow request failed with status {}", status.as_u16());
    let error_message = parse_flow_error_message(&response_body).unwrap_or(fallback_message);
    debug!(
        status = status.as_u16(),
        retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
        "mapped Genkit HTTP error response"
    );

    let mapped = match status {
        StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited(error_message),
        _ => BackendError::Http {
            status: status.as_u16(),
            message: error_message,
        },
    };

    RetryableError {
        retryable: status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error(),
        error: mapped,
        retry_after,
    }
}

fn parse_flow_error_message(raw_body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<FlowErrorEnvelope>(raw_body).ok()?;

    if let Some(message) = normalize_optional_string(parsed.error.message) {
        return Some(message);
    }

    normalize_optional_string(parsed.error.status)
}

fn normalize_optional_string(value: Option<String>) -> Option<String> {
    value.and_then(|content| {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn read_non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn read_parsed_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    read_non_empty_env(name).and_then(|value| value.parse::<T>().ok())
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header_value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if header_value.is_empty() {
        return None;
    }

    if let Ok(seconds) = header_value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let retry_at = httpdate::parse_http_date(header_value).ok()?;
    Some(
        retry_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::from_secs(0)),
    )
}

fn build_client(config: &GenkitBackendConfig) -> Result<Client, BackendError> {
    let timeout = Duration::from_secs(config.request_timeout_secs.max(1));
    debug!(timeout_secs = timeout.as_secs(), "building Genkit HTTP client");
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|error| BackendError::Provider(format!("Unable to build HTTP client: {error}")))
}

fn seed_from_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos() as u64)
        .unwrap_or(0xA5A5_A5A5_A5A5_A5A5)
}
