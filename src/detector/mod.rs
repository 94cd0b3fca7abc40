//! Challenge detection module. Classifies a `(content, status_code)` pair
//! into a `DetectedChallenge`, used both by tiers (to populate `TierResult`)
//! and by the HITL layer (to decide when a session has cleared). A pure,
//! deterministic layered classifier rather than a scored or adaptive model.

use once_cell::sync::Lazy;
use regex::Regex;

/// Closed challenge taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectedChallenge {
    Cloudflare,
    Captcha,
    Turnstile,
    BotDetected,
    AccessDenied,
    WafBlock,
}

impl DetectedChallenge {
    /// Short tag used in logs, metrics keys, and escalation history entries.
    pub fn tag(self) -> &'static str {
        match self {
            DetectedChallenge::Cloudflare => "cloudflare",
            DetectedChallenge::Captcha => "captcha",
            DetectedChallenge::Turnstile => "turnstile",
            DetectedChallenge::BotDetected => "bot_detected",
            DetectedChallenge::AccessDenied => "access_denied",
            DetectedChallenge::WafBlock => "waf_block",
        }
    }

    /// Whether this tier-1 signal means a JS-free tier 2 is doomed by
    /// construction and must be skipped.
    pub fn skips_browser_http_tier(self) -> bool {
        matches!(
            self,
            DetectedChallenge::Cloudflare
                | DetectedChallenge::Captcha
                | DetectedChallenge::Turnstile
                | DetectedChallenge::BotDetected
        )
    }

    /// Whether this signal alone means the orchestrator should short-circuit
    /// straight to HITL rather than keep climbing the tier ladder.
    pub fn requires_human(self) -> bool {
        matches!(self, DetectedChallenge::Captcha | DetectedChallenge::Turnstile)
    }
}

struct ContentPattern {
    regex: Lazy<Regex>,
    challenge: DetectedChallenge,
}

macro_rules! content_pattern {
    ($challenge:expr, $re:expr) => {
        ContentPattern {
            regex: Lazy::new(|| Regex::new($re).expect("static detector pattern is valid regex")),
            challenge: $challenge,
        }
    };
}

/// Strong content signatures, checked before any status-code fallback.
/// Order matters only for which tag wins when two patterns both match the
/// same body; earlier entries take priority.
static CONTENT_PATTERNS: &[ContentPattern] = &[
    content_pattern!(
        DetectedChallenge::Turnstile,
        r"(?i)cf-turnstile|challenges\.cloudflare\.com/turnstile"
    ),
    content_pattern!(
        DetectedChallenge::Cloudflare,
        r"(?i)checking your browser before accessing|cf-browser-verification|cf_chl_opt|/cdn-cgi/challenge-platform"
    ),
    content_pattern!(
        DetectedChallenge::Captcha,
        r"(?i)recaptcha|hcaptcha|g-recaptcha|data-sitekey|solve the captcha"
    ),
    content_pattern!(
        DetectedChallenge::BotDetected,
        r"(?i)automated (queries|requests|traffic)|unusual traffic from your (computer|network)|bot detection|please verify you are a human"
    ),
];

/// WAF vocabulary gating a bare `503` into `waf_block`. A `503` with none of
/// these present is left unclassified as a transient server error; treating
/// every `503` as a block would trigger unnecessary escalation.
static WAF_HINT_WORDS: &[&str] = &["firewall", "waf", "shield", "protection", "security check"];

pub struct ChallengeDetector;

impl ChallengeDetector {
    pub fn new() -> Self {
        ChallengeDetector
    }

    /// Layered classification:
    /// 1. Strong content signatures first (content wins over status).
    /// 2. Status-code fallback (`403`→access_denied, `429`→rate_limit,
    ///    `503`→waf_block only with corroborating WAF vocabulary).
    /// 3. Weak generic words never fire alone.
    pub fn classify(&self, content: &str, status_code: u16) -> Option<DetectedChallenge> {
        for pattern in CONTENT_PATTERNS {
            if pattern.regex.is_match(content) {
                return Some(pattern.challenge);
            }
        }

        match status_code {
            403 => Some(DetectedChallenge::AccessDenied),
            429 => None, // rate_limit is an ErrorType, not a detected_challenge tag.
            503 => {
                let lower = content.to_lowercase();
                if WAF_HINT_WORDS.iter().any(|hint| lower.contains(hint)) {
                    Some(DetectedChallenge::WafBlock)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

impl Default for ChallengeDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(body: &str, status: u16) -> Option<DetectedChallenge> {
        ChallengeDetector::new().classify(body, status)
    }

    #[test]
    fn detects_turnstile_over_generic_cloudflare_wording() {
        let body = r#"<div class="cf-turnstile" data-sitekey="x"></div>"#;
        assert_eq!(fixture(body, 403), Some(DetectedChallenge::Turnstile));
    }

    #[test]
    fn detects_cloudflare_interstitial() {
        let body = "Checking your browser before accessing example.com";
        assert_eq!(fixture(body, 503), Some(DetectedChallenge::Cloudflare));
    }

    #[test]
    fn detects_recaptcha() {
        let body = r#"<div class="g-recaptcha" data-sitekey="abc"></div>"#;
        assert_eq!(fixture(body, 200), Some(DetectedChallenge::Captcha));
    }

    #[test]
    fn bare_503_with_no_waf_vocabulary_is_unclassified() {
        assert_eq!(fixture("internal server error, please retry later", 503), None);
    }

    #[test]
    fn waf_worded_503_classifies_as_waf_block() {
        assert_eq!(
            fixture("Request blocked by our security firewall", 503),
            Some(DetectedChallenge::WafBlock)
        );
    }

    #[test]
    fn bare_403_classifies_as_access_denied() {
        assert_eq!(fixture("<h1>Forbidden</h1>", 403), Some(DetectedChallenge::AccessDenied));
    }

    #[test]
    fn weak_generic_word_alone_does_not_fire() {
        assert_eq!(fixture("access denied", 200), None);
        assert_eq!(fixture("you have been blocked", 200), None);
    }

    #[test]
    fn classifier_is_monotone_adding_a_signal_never_loses_detection() {
        let weak = fixture("access denied", 200);
        let strong = fixture("access denied. please verify you are a human.", 200);
        assert_eq!(weak, None);
        assert_eq!(strong, Some(DetectedChallenge::BotDetected));
    }
}
