//! Tier executor contract.
//!
//! A *tier* is one fetching strategy (plain HTTP, browser-backed HTTP, full
//! browser render, ..., human-in-the-loop). The orchestrator drives a request
//! through an ordered list of tiers, advancing on failure until one succeeds
//! or the ladder is exhausted. This module defines the uniform contract every
//! tier implements and the one concrete tier the crate ships.

mod http_tier;

pub use http_tier::{HttpTier, HttpTierError};

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::detector::DetectedChallenge;

/// Totally ordered tier strength. Intermediate tiers (2-6) are pluggable;
/// the crate only ships a concrete implementation for `Http` (tier 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TierLevel(pub u8);

impl TierLevel {
    pub const HTTP: TierLevel = TierLevel(1);
    pub const BROWSER_HTTP: TierLevel = TierLevel(2);
    pub const FULL_BROWSER: TierLevel = TierLevel(3);
    pub const STEALTH_BROWSER: TierLevel = TierLevel(4);
    pub const CDP_CAPTCHA: TierLevel = TierLevel(5);
    pub const NON_WEBDRIVER: TierLevel = TierLevel(6);
    pub const HITL: TierLevel = TierLevel(7);

    pub fn next(self) -> TierLevel {
        TierLevel(self.0.saturating_add(1))
    }
}

impl std::fmt::Display for TierLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tier{}", self.0)
    }
}

/// Closed error taxonomy a tier must classify its own failures into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    Ok,
    Timeout,
    DnsError,
    ConnectionRefused,
    SslError,
    NetworkError,
    Blocked,
    CaptchaRequired,
    RateLimit,
    ServerError,
    BrowserCrash,
    Unknown,
}

impl ErrorType {
    /// A tier must never ask to escalate past a `dns_error` or
    /// `connection_refused`. No stronger tier resolves a bad hostname.
    pub fn is_fail_fast(self) -> bool {
        matches!(self, ErrorType::DnsError | ErrorType::ConnectionRefused)
    }
}

/// Per-request options. A closed struct rather than an open option bag;
/// unrecognised fields have no place to land, since the type itself is the
/// boundary check.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub proxy_url: Option<String>,
    pub extra_cookies: HashMap<String, String>,
    pub extra_headers: HashMap<String, String>,
    pub wait_selector: Option<String>,
    pub profile_id: Option<String>,
    pub use_stealth_navigation: bool,
}

impl FetchOptions {
    pub fn merge_cookies(&mut self, cookies: HashMap<String, String>) {
        for (name, value) in cookies {
            self.extra_cookies.entry(name).or_insert(value);
        }
    }

    pub fn merge_headers(&mut self, headers: HashMap<String, String>) {
        for (name, value) in headers {
            self.extra_headers.entry(name).or_insert(value);
        }
    }
}

/// Uniform result every tier returns, win or lose.
#[derive(Debug, Clone)]
pub struct TierResult {
    pub success: bool,
    pub content: Option<String>,
    pub status_code: Option<u16>,
    pub tier_used: TierLevel,
    pub execution_time_ms: u64,
    pub response_size_bytes: u64,
    pub error: Option<String>,
    pub error_type: ErrorType,
    pub detected_challenge: Option<DetectedChallenge>,
    pub should_escalate: bool,
    pub metadata: HashMap<String, Value>,
}

impl TierResult {
    pub fn success(tier_used: TierLevel, content: impl Into<String>, status_code: u16) -> Self {
        let content = content.into();
        Self {
            success: true,
            response_size_bytes: content.len() as u64,
            content: Some(content),
            status_code: Some(status_code),
            tier_used,
            execution_time_ms: 0,
            error: None,
            error_type: ErrorType::Ok,
            detected_challenge: None,
            should_escalate: false,
            metadata: HashMap::new(),
        }
    }

    pub fn failure(tier_used: TierLevel, error_type: ErrorType, error: impl Into<String>) -> Self {
        let should_escalate = match error_type {
            ErrorType::DnsError | ErrorType::ConnectionRefused => false,
            ErrorType::Blocked
            | ErrorType::CaptchaRequired
            | ErrorType::BrowserCrash
            | ErrorType::Timeout => true,
            _ => true,
        };
        Self {
            success: false,
            content: None,
            status_code: None,
            tier_used,
            execution_time_ms: 0,
            response_size_bytes: 0,
            error: Some(error.into()),
            error_type,
            detected_challenge: None,
            should_escalate,
            metadata: HashMap::new(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        let content = content.into();
        self.response_size_bytes = content.len() as u64;
        self.content = Some(content);
        self
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_challenge(mut self, challenge: DetectedChallenge) -> Self {
        self.detected_challenge = Some(challenge);
        self
    }

    pub fn with_escalate(mut self, should_escalate: bool) -> Self {
        self.should_escalate = should_escalate;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_execution_time(mut self, duration: Duration) -> Self {
        self.execution_time_ms = duration.as_millis() as u64;
        self
    }

    /// `status ∈ {success, failed, blocked, timeout}`.
    pub fn status_label(&self) -> &'static str {
        if self.success {
            return "success";
        }
        match self.error_type {
            ErrorType::Blocked | ErrorType::RateLimit => "blocked",
            ErrorType::Timeout => "timeout",
            _ => "failed",
        }
    }
}

/// Errors surfaced by the tier abstraction itself (distinct from `ErrorType`,
/// which is the tier's own classification of a *fetch* failure).
#[derive(Debug, Error)]
pub enum TierContractError {
    #[error("absolute http(s) url required, got: {0}")]
    InvalidUrl(String),
}

/// Every tier exposes exactly this surface. Implementations must never panic
/// on an unsupported option; they fail with a tier-appropriate `ErrorType`
/// instead rather than silently ignoring it.
#[async_trait]
pub trait TierExecutor: Send + Sync {
    /// Human-readable identifier used in logs and metrics keys.
    fn name(&self) -> &'static str;

    /// The tier level this executor implements.
    fn level(&self) -> TierLevel;

    async fn execute(&self, url: &Url, options: &FetchOptions) -> TierResult;

    /// Releases persistent resources (worker pools, browser processes).
    /// Safe to call multiple times.
    async fn cleanup(&self) {}
}

pub(crate) fn validate_absolute_http(url: &Url) -> Result<(), TierContractError> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(TierContractError::InvalidUrl(url.to_string()));
    }
    Ok(())
}
