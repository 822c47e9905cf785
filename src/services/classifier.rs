//! Maps upstream responses to failure kinds.
//!
//! The table is ordered; the first rule whose status predicate and body
//! signature both match wins. Nothing here touches the network, so every
//! rule is testable on plain strings.

use crate::error::ApiError;
use crate::models::Tier;
use crate::utils::truncate_body;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

const DIAGNOSTIC_BODY_LIMIT: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// 403 carrying the reCAPTCHA validation marker.
    RecaptchaRejected,
    /// Cloudflare interstitial (e.g. "Just a moment...").
    CloudflareChallenge,
    /// 403 without a recognisable marker.
    AntiBotBlocked,
    RateLimited,
    Transient,
    Malformed,
    NonRetryable,
}

/// A classified failed physical attempt.
#[derive(Debug, Clone)]
pub struct Failure {
    pub kind: FailureKind,
    pub tier: Tier,
    pub status: Option<u16>,
    pub body: String,
    pub retry_after: Option<Duration>,
}

impl Failure {
    pub fn new(kind: FailureKind, tier: Tier, status: Option<u16>, body: &str) -> Self {
        Self {
            kind,
            tier,
            status,
            body: truncate_body(body, DIAGNOSTIC_BODY_LIMIT),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Caller-visible error preserving the kind and upstream diagnostics.
    pub fn into_error(self) -> ApiError {
        let status = self.status.unwrap_or(0);
        match self.kind {
            FailureKind::RecaptchaRejected
            | FailureKind::CloudflareChallenge
            | FailureKind::AntiBotBlocked => ApiError::AntiBotRejected {
                status,
                detail: format!("{} tier: {}", self.tier, self.body),
            },
            FailureKind::RateLimited => ApiError::RateLimited {
                retry_after: self.retry_after,
                detail: self.body,
            },
            FailureKind::Transient => ApiError::TransientNetwork(if status > 0 {
                format!("HTTP {}: {}", status, self.body)
            } else {
                self.body
            }),
            FailureKind::Malformed => ApiError::MalformedUpstream {
                status,
                body: self.body,
            },
            FailureKind::NonRetryable => ApiError::NonRetryable {
                status,
                body: self.body,
            },
        }
    }
}

#[derive(Clone, Copy)]
enum StatusMatch {
    Exact(u16),
    Range(u16, u16),
    Success,
}

impl StatusMatch {
    fn matches(self, status: u16) -> bool {
        match self {
            StatusMatch::Exact(code) => status == code,
            StatusMatch::Range(lo, hi) => (lo..=hi).contains(&status),
            StatusMatch::Success => (200..300).contains(&status),
        }
    }
}

#[derive(Clone, Copy)]
enum Signature {
    Any,
    Recaptcha,
    Cloudflare,
    StreamRecord,
}

impl Signature {
    fn matches(self, body: &str) -> bool {
        match self {
            Signature::Any => true,
            Signature::Recaptcha => RECAPTCHA_MARKER.is_match(body),
            Signature::Cloudflare => is_cloudflare_challenge(body),
            Signature::StreamRecord => looks_like_stream_record(body),
        }
    }
}

struct Rule {
    name: &'static str,
    status: StatusMatch,
    signature: Signature,
    kind: Option<FailureKind>,
}

static RECAPTCHA_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)recaptcha\s+validation\s+failed").expect("valid regex"));

static CLOUDFLARE_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)<title>\s*Just a moment\.{0,3}\s*</title>",
        r"(?i)<title>\s*Attention Required!\s*\|\s*Cloudflare\s*</title>",
        r"(?i)cdn-cgi/challenge-platform",
        r"window\._cf_chl_opt",
        r#"(?i)id="challenge-form""#,
        r"(?i)cf-turnstile",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

static STREAM_RECORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]{1,8}:").expect("valid regex"));

/// Ordered classification table. `kind: None` means success.
static RULES: &[Rule] = &[
    Rule {
        name: "success",
        status: StatusMatch::Success,
        signature: Signature::StreamRecord,
        kind: None,
    },
    Rule {
        name: "success-challenge-page",
        status: StatusMatch::Success,
        signature: Signature::Cloudflare,
        kind: Some(FailureKind::CloudflareChallenge),
    },
    Rule {
        name: "success-not-a-stream",
        status: StatusMatch::Success,
        signature: Signature::Any,
        kind: Some(FailureKind::Malformed),
    },
    Rule {
        name: "rate-limited",
        status: StatusMatch::Exact(429),
        signature: Signature::Any,
        kind: Some(FailureKind::RateLimited),
    },
    Rule {
        name: "recaptcha-rejected",
        status: StatusMatch::Exact(403),
        signature: Signature::Recaptcha,
        kind: Some(FailureKind::RecaptchaRejected),
    },
    Rule {
        name: "cloudflare-challenge",
        status: StatusMatch::Range(400, 599),
        signature: Signature::Cloudflare,
        kind: Some(FailureKind::CloudflareChallenge),
    },
    Rule {
        name: "forbidden",
        status: StatusMatch::Exact(403),
        signature: Signature::Any,
        kind: Some(FailureKind::AntiBotBlocked),
    },
    Rule {
        name: "request-timeout",
        status: StatusMatch::Exact(408),
        signature: Signature::Any,
        kind: Some(FailureKind::Transient),
    },
    Rule {
        name: "client-error",
        status: StatusMatch::Range(400, 499),
        signature: Signature::Any,
        kind: Some(FailureKind::NonRetryable),
    },
    Rule {
        name: "server-error",
        status: StatusMatch::Range(500, 599),
        signature: Signature::Any,
        kind: Some(FailureKind::Transient),
    },
];

pub fn is_cloudflare_challenge(body: &str) -> bool {
    CLOUDFLARE_MARKERS.iter().any(|re| re.is_match(body))
}

fn looks_like_stream_record(body: &str) -> bool {
    body.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| STREAM_RECORD.is_match(line))
        .unwrap_or(false)
}

/// Classifies a response by status and body (or, for 2xx, the body prelude).
///
/// Returns `None` for success. Combinations no rule covers are treated as
/// transient.
pub fn classify(status: u16, body: &str) -> Option<FailureKind> {
    match RULES
        .iter()
        .find(|rule| rule.status.matches(status) && rule.signature.matches(body))
    {
        Some(rule) => {
            tracing::trace!("Response {} matched rule `{}`", status, rule.name);
            rule.kind
        }
        None => Some(FailureKind::Transient),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHALLENGE_PAGE: &str =
        "<!DOCTYPE html><html><head><title>Just a moment...</title></head><body></body></html>";

    #[test]
    fn test_success_stream() {
        assert_eq!(classify(200, "a0:\"Hello\"\n"), None);
        assert_eq!(classify(200, "\n\nad:{\"finishReason\":\"stop\"}"), None);
    }

    #[test]
    fn test_success_status_with_bad_body() {
        assert_eq!(classify(200, CHALLENGE_PAGE), Some(FailureKind::CloudflareChallenge));
        assert_eq!(classify(200, "{\"error\":\"oops\"}"), Some(FailureKind::Malformed));
        assert_eq!(classify(200, ""), Some(FailureKind::Malformed));
    }

    #[test]
    fn test_recaptcha_marker() {
        assert_eq!(
            classify(403, r#"{"error":"recaptcha validation failed"}"#),
            Some(FailureKind::RecaptchaRejected)
        );
        assert_eq!(
            classify(403, r#"{"error":"reCAPTCHA Validation Failed"}"#),
            Some(FailureKind::RecaptchaRejected)
        );
    }

    #[test]
    fn test_forbidden_variants() {
        assert_eq!(classify(403, CHALLENGE_PAGE), Some(FailureKind::CloudflareChallenge));
        assert_eq!(classify(503, CHALLENGE_PAGE), Some(FailureKind::CloudflareChallenge));
        assert_eq!(classify(403, "Forbidden"), Some(FailureKind::AntiBotBlocked));
    }

    #[test]
    fn test_rate_limit_wins_over_markers() {
        assert_eq!(
            classify(429, r#"{"error":"recaptcha validation failed"}"#),
            Some(FailureKind::RateLimited)
        );
        assert_eq!(classify(429, "Too Many Requests"), Some(FailureKind::RateLimited));
    }

    #[test]
    fn test_retryable_and_fatal_statuses() {
        assert_eq!(classify(400, "bad payload"), Some(FailureKind::NonRetryable));
        assert_eq!(classify(404, "unknown model"), Some(FailureKind::NonRetryable));
        assert_eq!(classify(408, ""), Some(FailureKind::Transient));
        assert_eq!(classify(502, "bad gateway"), Some(FailureKind::Transient));
        assert_eq!(classify(302, "moved"), Some(FailureKind::Transient));
    }

    #[test]
    fn test_failure_into_error_keeps_kind() {
        let err = Failure::new(FailureKind::RateLimited, Tier::Direct, Some(429), "slow down")
            .with_retry_after(Some(Duration::from_secs(7)))
            .into_error();
        match err {
            ApiError::RateLimited { retry_after, detail } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
                assert_eq!(detail, "slow down");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = Failure::new(FailureKind::Malformed, Tier::Browser, Some(200), "<xml/>").into_error();
        assert!(matches!(err, ApiError::MalformedUpstream { status: 200, .. }));
    }
}
