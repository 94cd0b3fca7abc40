//! Ticket store: domain-scoped, TTL-bounded cache of harvested session
//! credentials ("Golden Tickets"). A pluggable contract; this module ships
//! an in-memory backend (tests, single-process deployments) and a durable
//! `redb`-backed one (see `redb_store`) for the standard deployment.

mod redb_store;

pub use redb_store::{RedbTicketStore, RedbTicketStoreError};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::detector::DetectedChallenge;

/// One harvested cookie.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub expires: Option<i64>,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: Option<String>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: "/".to_string(),
            expires: None,
            http_only: false,
            secure: true,
            same_site: None,
        }
    }
}

/// Credential bundle. `is_expired`/`has_cloudflare_clearance` are derived
/// fields rather than something callers recompute themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenTicket {
    pub domain: String,
    pub source_url: String,
    pub harvested_at: i64,
    pub ttl_seconds: i64,
    pub cookies: Vec<Cookie>,
    pub user_agent: Option<String>,
    pub proxy_url: Option<String>,
    pub extra_headers: HashMap<String, String>,
    pub challenge_type: Option<String>,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs() as i64
}

impl GoldenTicket {
    pub fn new(domain: impl Into<String>, source_url: impl Into<String>, cookies: Vec<Cookie>, ttl_seconds: i64, max_ttl: i64) -> Self {
        Self {
            domain: domain.into(),
            source_url: source_url.into(),
            harvested_at: now_unix(),
            ttl_seconds: ttl_seconds.clamp(0, max_ttl),
            cookies,
            user_agent: None,
            proxy_url: None,
            extra_headers: HashMap::new(),
            challenge_type: None,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_proxy_url(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy_url = Some(proxy_url.into());
        self
    }

    pub fn with_extra_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.extra_headers = headers;
        self
    }

    pub fn with_challenge_type(mut self, challenge: DetectedChallenge) -> Self {
        self.challenge_type = Some(challenge.tag().to_string());
        self
    }

    pub fn is_expired(&self) -> bool {
        now_unix() > self.harvested_at + self.ttl_seconds
    }

    pub fn has_cloudflare_clearance(&self) -> bool {
        self.cookies.iter().any(|cookie| cookie.name == "cf_clearance")
    }

    pub fn extend(&mut self, delta_seconds: i64, max_ttl: i64) {
        self.ttl_seconds = (self.ttl_seconds + delta_seconds).clamp(0, max_ttl);
    }

    /// Short summary for `TierResult.metadata["golden_ticket"]` on HITL
    /// success, without leaking raw cookie values into logs or metrics.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "domain": self.domain,
            "harvested_at": self.harvested_at,
            "ttl_seconds": self.ttl_seconds,
            "cookie_count": self.cookies.len(),
            "has_cloudflare_clearance": self.has_cloudflare_clearance(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TicketStoreError {
    #[error("backend error: {0}")]
    Backend(String),
}

/// Pluggable store contract. Implementations must enforce expiry at read
/// time even if their own eviction mechanism hasn't run yet.
#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn get(&self, domain: &str) -> Result<Option<GoldenTicket>, TicketStoreError>;
    async fn put(&self, ticket: GoldenTicket) -> Result<(), TicketStoreError>;
    async fn invalidate(&self, domain: &str) -> Result<(), TicketStoreError>;
    async fn get_all_domains(&self) -> Result<Vec<String>, TicketStoreError>;
    async fn extend(&self, domain: &str, delta_seconds: i64, max_ttl: i64) -> Result<bool, TicketStoreError>;
}

/// In-memory backend: tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryTicketStore {
    tickets: Arc<RwLock<HashMap<String, GoldenTicket>>>,
}

impl InMemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TicketStore for InMemoryTicketStore {
    async fn get(&self, domain: &str) -> Result<Option<GoldenTicket>, TicketStoreError> {
        let tickets = self.tickets.read().await;
        match tickets.get(domain) {
            Some(ticket) if !ticket.is_expired() => Ok(Some(ticket.clone())),
            Some(_) => Ok(None),
            None => Ok(None),
        }
    }

    async fn put(&self, ticket: GoldenTicket) -> Result<(), TicketStoreError> {
        let mut tickets = self.tickets.write().await;
        tickets.insert(ticket.domain.clone(), ticket); // overwrite semantics
        Ok(())
    }

    async fn invalidate(&self, domain: &str) -> Result<(), TicketStoreError> {
        let mut tickets = self.tickets.write().await;
        tickets.remove(domain);
        Ok(())
    }

    async fn get_all_domains(&self) -> Result<Vec<String>, TicketStoreError> {
        let tickets = self.tickets.read().await;
        Ok(tickets.keys().cloned().collect())
    }

    async fn extend(&self, domain: &str, delta_seconds: i64, max_ttl: i64) -> Result<bool, TicketStoreError> {
        let mut tickets = self.tickets.write().await;
        match tickets.get_mut(domain) {
            Some(ticket) => {
                ticket.extend(delta_seconds, max_ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ticket(domain: &str, ttl: i64) -> GoldenTicket {
        GoldenTicket::new(
            domain,
            format!("https://{domain}/"),
            vec![Cookie::new("cf_clearance", "abc123", domain)],
            ttl,
            3600,
        )
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = InMemoryTicketStore::new();
        store.put(sample_ticket("example.com", 300)).await.unwrap();
        let ticket = store.get("example.com").await.unwrap().unwrap();
        assert_eq!(ticket.domain, "example.com");
        assert!(ticket.has_cloudflare_clearance());
    }

    #[tokio::test]
    async fn expired_ticket_reads_as_none() {
        let store = InMemoryTicketStore::new();
        store.put(sample_ticket("example.com", -1)).await.unwrap();
        assert!(store.get("example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_overwrites_prior_ticket_for_same_domain() {
        let store = InMemoryTicketStore::new();
        store.put(sample_ticket("example.com", 300)).await.unwrap();
        let mut second = sample_ticket("example.com", 300);
        second.source_url = "https://example.com/other".to_string();
        store.put(second).await.unwrap();
        let ticket = store.get("example.com").await.unwrap().unwrap();
        assert_eq!(ticket.source_url, "https://example.com/other");
    }

    #[tokio::test]
    async fn extend_clamps_to_max_ttl() {
        let store = InMemoryTicketStore::new();
        store.put(sample_ticket("example.com", 100)).await.unwrap();
        store.extend("example.com", 10_000, 3600).await.unwrap();
        let ticket = store.get("example.com").await.unwrap().unwrap();
        assert_eq!(ticket.ttl_seconds, 3600);
    }

    #[tokio::test]
    async fn get_all_domains_lists_every_key() {
        let store = InMemoryTicketStore::new();
        store.put(sample_ticket("a.com", 300)).await.unwrap();
        store.put(sample_ticket("b.com", 300)).await.unwrap();
        let mut domains = store.get_all_domains().await.unwrap();
        domains.sort();
        assert_eq!(domains, vec!["a.com".to_string(), "b.com".to_string()]);
    }
}
