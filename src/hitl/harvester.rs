//! Credential harvesting at the end of a HITL session: extract cookies, user
//! agent, and proxy from the browser context, validate them, and build a
//! `GoldenTicket`.

use crate::hitl::session::HarvestContext;
use crate::ticket_store::GoldenTicket;

#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("harvested context has no cookies")]
    NoCookies,
    #[error("harvested context has no domain")]
    NoDomain,
}

pub struct SessionHarvester {
    max_ttl: i64,
}

impl SessionHarvester {
    pub fn new(max_ttl: i64) -> Self {
        Self { max_ttl }
    }

    /// Validates the harvested context (must have at least one cookie and a
    /// domain) and builds a `GoldenTicket` with TTL clamped to `session_ttl`.
    pub fn harvest(&self, domain: &str, source_url: &str, context: HarvestContext, session_ttl_seconds: i64) -> Result<GoldenTicket, HarvestError> {
        if context.cookies.is_empty() {
            return Err(HarvestError::NoCookies);
        }
        if domain.is_empty() {
            return Err(HarvestError::NoDomain);
        }

        let mut ticket = GoldenTicket::new(domain, source_url, context.cookies, session_ttl_seconds, self.max_ttl);
        if let Some(user_agent) = context.user_agent {
            ticket = ticket.with_user_agent(user_agent);
        }
        if let Some(proxy_url) = context.proxy_url {
            ticket = ticket.with_proxy_url(proxy_url);
        }
        Ok(ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket_store::Cookie;

    #[test]
    fn rejects_context_with_no_cookies() {
        let harvester = SessionHarvester::new(3600);
        let context = HarvestContext {
            cookies: vec![],
            user_agent: None,
            proxy_url: None,
        };
        let result = harvester.harvest("example.com", "https://example.com/", context, 300);
        assert!(matches!(result, Err(HarvestError::NoCookies)));
    }

    #[test]
    fn builds_ticket_clamped_to_max_ttl() {
        let harvester = SessionHarvester::new(600);
        let context = HarvestContext {
            cookies: vec![Cookie::new("cf_clearance", "x", "example.com")],
            user_agent: Some("ua".to_string()),
            proxy_url: None,
        };
        let ticket = harvester.harvest("example.com", "https://example.com/", context, 10_000).unwrap();
        assert_eq!(ticket.ttl_seconds, 600);
        assert!(ticket.has_cloudflare_clearance());
    }
}
