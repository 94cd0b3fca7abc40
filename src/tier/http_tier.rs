//! Tier 1: lightweight HTTP fetch, no JavaScript execution.
//!
//! The only tier the crate ships a concrete implementation for; every
//! stronger tier is a black box the orchestrator is handed by the caller.
//! Built on a `reqwest::Client` adapter, retrying on rate limits with a
//! jittered backoff.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::time::sleep;
use url::Url;

use crate::detector::ChallengeDetector;
use crate::tier::{ErrorType, FetchOptions, TierExecutor, TierLevel, TierResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const RATE_LIMIT_RETRY_BUDGET: u32 = 2;
const RATE_LIMIT_BACKOFF: Duration = Duration::from_millis(1100);
const RATE_LIMIT_BACKOFF_JITTER_MS: u64 = 250;

/// Sleeps roughly 1.1s per retry. A touch of jitter avoids every retrying
/// job on the same domain waking up in lockstep.
fn jittered_backoff() -> Duration {
    let jitter = rand::thread_rng().gen_range(0..RATE_LIMIT_BACKOFF_JITTER_MS);
    RATE_LIMIT_BACKOFF + Duration::from_millis(jitter)
}

#[derive(Debug, Error)]
pub enum HttpTierError {
    #[error("failed to build http client: {0}")]
    ClientBuild(String),
}

/// Plain HTTP fetcher with cookie-jar reuse, standing in for a real
/// TLS-fingerprint-impersonating client in production deployments.
pub struct HttpTier {
    client: Client,
    detector: ChallengeDetector,
    timeout: Duration,
}

impl HttpTier {
    pub fn new() -> Result<Self, HttpTierError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, HttpTierError> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()
            .map_err(|err| HttpTierError::ClientBuild(err.to_string()))?;

        Ok(Self {
            client,
            detector: ChallengeDetector::new(),
            timeout,
        })
    }

    fn build_request(
        &self,
        url: &Url,
        options: &FetchOptions,
    ) -> Result<reqwest::RequestBuilder, HttpTierError> {
        let mut builder = self.client.get(url.clone());

        if let Some(proxy) = &options.proxy_url {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|err| HttpTierError::ClientBuild(err.to_string()))?;
            // A fresh client is built per request when a proxy override is
            // supplied, since reqwest binds proxies at client-construction
            // time rather than per-request.
            let client = Client::builder()
                .cookie_store(true)
                .timeout(self.timeout)
                .proxy(proxy)
                .build()
                .map_err(|err| HttpTierError::ClientBuild(err.to_string()))?;
            builder = client.get(url.clone());
        }

        if !options.extra_cookies.is_empty() {
            let cookie_header = options
                .extra_cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header(reqwest::header::COOKIE, cookie_header);
        }

        for (name, value) in &options.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        Ok(builder)
    }

    fn classify_transport_error(err: &reqwest::Error) -> ErrorType {
        if err.is_timeout() {
            return ErrorType::Timeout;
        }
        if err.is_connect() {
            let message = err.to_string().to_lowercase();
            if message.contains("dns") || message.contains("name resolution") || message.contains("nodename") {
                return ErrorType::DnsError;
            }
            if message.contains("refused") {
                return ErrorType::ConnectionRefused;
            }
            return ErrorType::NetworkError;
        }
        if err.is_request() && err.to_string().to_lowercase().contains("tls") {
            return ErrorType::SslError;
        }
        ErrorType::NetworkError
    }
}

impl Default for HttpTier {
    fn default() -> Self {
        Self::new().expect("failed to build default HttpTier reqwest client")
    }
}

#[async_trait]
impl TierExecutor for HttpTier {
    fn name(&self) -> &'static str {
        "http"
    }

    fn level(&self) -> TierLevel {
        TierLevel::HTTP
    }

    async fn execute(&self, url: &Url, options: &FetchOptions) -> TierResult {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let request = match self.build_request(url, options) {
                Ok(request) => request,
                Err(err) => {
                    return TierResult::failure(self.level(), ErrorType::Unknown, err.to_string())
                        .with_execution_time(started.elapsed());
                }
            };

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    let error_type = Self::classify_transport_error(&err);
                    return TierResult::failure(self.level(), error_type, err.to_string())
                        .with_escalate(!error_type.is_fail_fast())
                        .with_execution_time(started.elapsed());
                }
            };

            let status = response.status();
            let body = match response.text().await {
                Ok(body) => body,
                Err(err) => {
                    return TierResult::failure(self.level(), ErrorType::NetworkError, err.to_string())
                        .with_execution_time(started.elapsed());
                }
            };

            if status == StatusCode::TOO_MANY_REQUESTS && attempts <= RATE_LIMIT_RETRY_BUDGET {
                log::debug!("tier1: rate limited on {url}, retrying (attempt {attempts})");
                sleep(jittered_backoff()).await;
                continue;
            }

            let detection = self.detector.classify(&body, status.as_u16());

            if status.is_success() && detection.is_none() {
                return TierResult::success(self.level(), body, status.as_u16())
                    .with_execution_time(started.elapsed());
            }

            let error_type = match (status.as_u16(), detection) {
                (_, Some(_)) if status == StatusCode::TOO_MANY_REQUESTS => ErrorType::RateLimit,
                (_, Some(challenge)) if challenge.requires_human() => ErrorType::CaptchaRequired,
                (_, Some(_)) => ErrorType::Blocked,
                (403, None) => ErrorType::Blocked,
                (429, None) => ErrorType::RateLimit,
                (500..=599, None) => ErrorType::ServerError,
                _ => ErrorType::Unknown,
            };

            let mut result = TierResult::failure(
                self.level(),
                error_type,
                format!("unexpected response: status {}", status.as_u16()),
            )
            .with_content(body)
            .with_status(status.as_u16())
            .with_execution_time(started.elapsed());

            if let Some(challenge) = detection {
                result = result.with_challenge(challenge);
            }

            // should_escalate defaults true except for the fail-fast classes
            // and the explicit "503 with no WAF vocabulary" case, which the
            // detector already returns as `None` for, landing us in
            // `ErrorType::ServerError` with escalation suppressed.
            if error_type == ErrorType::ServerError {
                result = result.with_escalate(false);
            }

            return result;
        }
    }

    async fn cleanup(&self) {}
}
