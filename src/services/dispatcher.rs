//! Turns one logical chat request into physical fetch attempts.
//!
//! Attempts start on the Direct tier (plain HTTP) unless the model is strict,
//! and move to the Browser tier when the upstream serves a challenge the
//! plain client cannot pass. Every failure is classified and retried under a
//! per-kind budget, so the loop always terminates.

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use rand::Rng;
use reqwest::Method;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{ArenaConfig, RetryConfig};
use crate::error::{ApiError, ApiResult};
use crate::models::Tier;
use crate::services::auth_pool::AuthTokenPool;
use crate::services::browser_fetch::{BrowserFetchError, BrowserFetchProvider};
use crate::services::captcha_broker::{CaptchaToken, CaptchaTokenBroker};
use crate::services::classifier::{classify, Failure, FailureKind};
use crate::services::direct_client::{build_request_headers, plain_headers, DirectTransport};
use crate::services::stream_translator::{translate, ByteStream, EventStream};
use crate::utils::{header_value, parse_retry_after, token_preview};

pub const RECAPTCHA_PAYLOAD_FIELD: &str = "recaptchaV3Token";

const PRELUDE_LIMIT: usize = 4 * 1024;
const ERROR_BODY_LIMIT: usize = 64 * 1024;

/// A logical request as the dispatcher sees it.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub model: String,
    pub method: Method,
    pub url: String,
    pub payload: Value,
    pub client_recaptcha_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success,
    Failed(FailureKind),
    BrowserUnavailable,
}

/// Record of one physical try.
#[derive(Debug, Clone)]
pub struct FetchAttempt {
    pub tier: Tier,
    pub ordinal: u32,
    pub captcha_token: Option<String>,
    pub auth_token: String,
    pub outcome: AttemptOutcome,
    pub wait_before_next: Option<Duration>,
}

pub struct Dispatched {
    pub events: EventStream,
    pub tier: Tier,
    pub attempts: Vec<FetchAttempt>,
}

impl fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatched")
            .field("tier", &self.tier)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refresh {
    Keep,
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    Retry {
        tier: Tier,
        refresh: Refresh,
        delay: Duration,
    },
    Fatal,
}

/// Remaining retries per failure kind for one logical request.
#[derive(Debug, Clone)]
struct Budgets {
    recaptcha: u32,
    rate_limit: u32,
    transient: u32,
    malformed: u32,
    browser: u32,
    rate_limit_used: u32,
    transient_used: u32,
}

impl Budgets {
    fn new(retry: &RetryConfig) -> Self {
        Self {
            recaptcha: retry.recaptcha_retries,
            rate_limit: retry.rate_limit_retries,
            transient: retry.transient_retries,
            malformed: retry.malformed_retries,
            browser: retry.browser_attempts.max(1),
            rate_limit_used: 0,
            transient_used: 0,
        }
    }

    /// Hard cap on physical attempts regardless of how budgets interleave.
    fn attempt_cap(&self) -> u32 {
        self.recaptcha + self.rate_limit + self.transient + self.malformed + self.browser + 1
    }
}

enum AttemptResult {
    Success(EventStream),
    Failed(Failure),
    Unavailable(String),
}

pub struct RequestDispatcher {
    auth_pool: Arc<AuthTokenPool>,
    captcha: Arc<CaptchaTokenBroker>,
    direct: Arc<dyn DirectTransport>,
    browser: Arc<dyn BrowserFetchProvider>,
    arena: ArenaConfig,
    retry: RetryConfig,
}

impl RequestDispatcher {
    pub fn new(
        auth_pool: Arc<AuthTokenPool>,
        captcha: Arc<CaptchaTokenBroker>,
        direct: Arc<dyn DirectTransport>,
        browser: Arc<dyn BrowserFetchProvider>,
        arena: ArenaConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            auth_pool,
            captcha,
            direct,
            browser,
            arena,
            retry,
        }
    }

    pub fn auth_pool(&self) -> &Arc<AuthTokenPool> {
        &self.auth_pool
    }

    pub async fn dispatch(&self, request: &UpstreamRequest) -> ApiResult<Dispatched> {
        let strict = self.arena.is_strict_model(&request.model);
        let challenge_budget = self.captcha.attempt_budget(&request.model);
        let key = self.captcha.site_key_action().clone();

        let mut budgets = Budgets::new(&self.retry);
        let attempt_cap = budgets.attempt_cap();
        let mut tier = if strict { Tier::Browser } else { Tier::Direct };
        let mut refresh = Refresh::Keep;
        let mut held: Option<CaptchaToken> = request.client_recaptcha_token.clone().map(|token| {
            debug!("Passing through caller captcha token {}", token_preview(&token));
            CaptchaToken::new(token)
        });
        let mut attempts: Vec<FetchAttempt> = Vec::new();
        let mut last_failure: Option<Failure> = None;
        let mut mint_error: Option<ApiError> = None;

        if strict {
            info!("Model {} is strict, using the browser tier only", request.model);
        }

        loop {
            let ordinal = attempts.len() as u32 + 1;
            if ordinal > attempt_cap {
                warn!("Attempt cap {} reached for model {}", attempt_cap, request.model);
                return Err(surface(last_failure, mint_error, "attempt cap reached"));
            }

            let auth_token = self.auth_pool.next()?;

            // A token the upstream did not reject rides along to the next
            // attempt; rejections and stale tokens go back to the broker.
            let reusable = held
                .take()
                .filter(|token| refresh == Refresh::Keep && self.captcha.is_fresh(token));
            held = match reusable {
                Some(token) => {
                    debug!("Reusing captcha token {}", token_preview(&token.value));
                    Some(token)
                }
                None => match self.captcha.refresh(&key, refresh == Refresh::Force, tier).await {
                    Ok(token) => Some(token),
                    Err(e) => {
                        warn!("Captcha mint failed on {} tier: {}", tier, e);
                        mint_error = Some(e);
                        if tier == Tier::Direct && budgets.browser > 0 {
                            info!("Escalating to browser tier after mint failure");
                            tier = Tier::Browser;
                        }
                        None
                    }
                },
            };
            let captcha_token = held.as_ref().map(|token| token.value.clone());

            if tier == Tier::Browser {
                budgets.browser = budgets.browser.saturating_sub(1);
            }

            let mut payload = request.payload.clone();
            if let (Some(token), Some(object)) = (&captcha_token, payload.as_object_mut()) {
                object.insert(RECAPTCHA_PAYLOAD_FIELD.to_string(), Value::String(token.clone()));
            }

            info!(
                "Attempt #{} for {} via {} tier (auth {}, captcha {})",
                ordinal,
                request.model,
                tier,
                token_preview(&auth_token),
                captcha_token.as_deref().map(token_preview).unwrap_or_else(|| "-".to_string())
            );

            let result = match tier {
                Tier::Direct => self.attempt_direct(request, &payload, &auth_token).await?,
                Tier::Browser => {
                    self.attempt_browser(request, &payload, &auth_token, captcha_token.as_deref(), challenge_budget)
                        .await?
                }
            };

            let mut attempt = FetchAttempt {
                tier,
                ordinal,
                captcha_token,
                auth_token,
                outcome: AttemptOutcome::Success,
                wait_before_next: None,
            };

            let failure = match result {
                AttemptResult::Success(events) => {
                    info!("Attempt #{} via {} tier succeeded", ordinal, tier);
                    attempts.push(attempt);
                    return Ok(Dispatched {
                        events,
                        tier,
                        attempts,
                    });
                }
                AttemptResult::Unavailable(detail) => {
                    warn!("Browser tier unavailable: {}", detail);
                    attempt.outcome = AttemptOutcome::BrowserUnavailable;
                    attempts.push(attempt);
                    return Err(surface(last_failure, mint_error, &detail));
                }
                AttemptResult::Failed(failure) => failure,
            };

            warn!(
                "Attempt #{} via {} tier failed: {:?} (status {:?})",
                ordinal, tier, failure.kind, failure.status
            );
            attempt.outcome = AttemptOutcome::Failed(failure.kind);

            match plan_next(&failure, &mut budgets, &self.retry) {
                Step::Retry {
                    tier: next_tier,
                    refresh: next_refresh,
                    delay,
                } => {
                    attempt.wait_before_next = Some(delay);
                    attempts.push(attempt);
                    if next_tier != tier {
                        info!("Escalating from {} to {} tier", tier, next_tier);
                    }
                    if !delay.is_zero() {
                        debug!("Waiting {:?} before next attempt", delay);
                        tokio::time::sleep(delay).await;
                    }
                    tier = next_tier;
                    refresh = next_refresh;
                    last_failure = Some(failure);
                }
                Step::Fatal => {
                    attempts.push(attempt);
                    return Err(failure.into_error());
                }
            }
        }
    }

    async fn attempt_direct(
        &self,
        request: &UpstreamRequest,
        payload: &Value,
        auth_token: &str,
    ) -> ApiResult<AttemptResult> {
        let headers = build_request_headers(&self.arena, auth_token)?;

        let response = match self
            .direct
            .send(&request.method, &request.url, payload, &headers)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return Ok(AttemptResult::Failed(Failure::new(
                    FailureKind::Transient,
                    Tier::Direct,
                    None,
                    &e.to_string(),
                )))
            }
        };

        let status = response.status;
        let retry_after = header_value(&response.headers, "retry-after").and_then(parse_retry_after);
        let mut body = response.body;

        if (200..300).contains(&status) {
            let prelude = match read_prelude(&mut body).await {
                Ok(prelude) => prelude,
                Err(e) => {
                    return Ok(AttemptResult::Failed(Failure::new(
                        FailureKind::Transient,
                        Tier::Direct,
                        Some(status),
                        &e.to_string(),
                    )))
                }
            };
            let text = String::from_utf8_lossy(&prelude).into_owned();
            return Ok(match classify(status, &text) {
                None => {
                    let head: ByteStream = Box::pin(stream::once(async move { Ok::<_, ApiError>(Bytes::from(prelude)) }));
                    AttemptResult::Success(translate(Box::pin(head.chain(body))))
                }
                Some(kind) => AttemptResult::Failed(Failure::new(kind, Tier::Direct, Some(status), &text)),
            });
        }

        let text = read_capped(&mut body, ERROR_BODY_LIMIT).await;
        let kind = classify(status, &text).unwrap_or(FailureKind::Transient);
        Ok(AttemptResult::Failed(
            Failure::new(kind, Tier::Direct, Some(status), &text).with_retry_after(retry_after),
        ))
    }

    async fn attempt_browser(
        &self,
        request: &UpstreamRequest,
        payload: &Value,
        auth_token: &str,
        captcha_token: Option<&str>,
        challenge_budget: u32,
    ) -> ApiResult<AttemptResult> {
        let mut headers = plain_headers(&build_request_headers(&self.arena, auth_token)?);
        if let Some(token) = captcha_token {
            headers.insert("X-Recaptcha-Token".to_string(), token.to_string());
            headers.insert(
                "X-Recaptcha-Action".to_string(),
                self.captcha.site_key_action().action.clone(),
            );
        }

        let response = match self
            .browser
            .fetch(&request.method, &request.url, payload, &headers, challenge_budget)
            .await
        {
            Ok(response) => response,
            Err(BrowserFetchError::Unavailable(detail)) => return Ok(AttemptResult::Unavailable(detail)),
            Err(e @ BrowserFetchError::ChallengeUnsolved { .. }) => {
                return Ok(AttemptResult::Failed(Failure::new(
                    FailureKind::CloudflareChallenge,
                    Tier::Browser,
                    None,
                    &e.to_string(),
                )))
            }
            Err(e @ BrowserFetchError::Transport(_)) => {
                return Ok(AttemptResult::Failed(Failure::new(
                    FailureKind::Transient,
                    Tier::Browser,
                    None,
                    &e.to_string(),
                )))
            }
        };

        self.record_browser_cookies(&response.cookies);

        let retry_after = header_value(&response.headers, "retry-after").and_then(parse_retry_after);
        Ok(match classify(response.status, &response.body) {
            None => {
                let body: ByteStream = Box::pin(stream::once(async move { Ok::<_, ApiError>(Bytes::from(response.body)) }));
                AttemptResult::Success(translate(body))
            }
            Some(kind) => AttemptResult::Failed(
                Failure::new(kind, Tier::Browser, Some(response.status), &response.body)
                    .with_retry_after(retry_after),
            ),
        })
    }

    fn record_browser_cookies(&self, cookies: &HashMap<String, String>) {
        if let Some(token) = cookies.get(&self.arena.auth_cookie_name) {
            if self.auth_pool.record_discovered(token) {
                debug!("Browser tier returned a new auth token");
            }
        }
    }
}

/// Decides what follows a classified failure, consuming budget as it goes.
fn plan_next(failure: &Failure, budgets: &mut Budgets, retry: &RetryConfig) -> Step {
    let tier = failure.tier;
    let browser_left = budgets.browser > 0;
    let to_browser = |refresh: Refresh, delay: Duration| -> Step {
        if browser_left {
            Step::Retry {
                tier: Tier::Browser,
                refresh,
                delay,
            }
        } else {
            Step::Fatal
        }
    };

    match failure.kind {
        FailureKind::RecaptchaRejected => {
            let delay = Duration::from_millis(retry.recaptcha_retry_delay_ms);
            if budgets.recaptcha > 0 {
                budgets.recaptcha -= 1;
                match tier {
                    Tier::Direct => Step::Retry {
                        tier,
                        refresh: Refresh::Force,
                        delay,
                    },
                    Tier::Browser => to_browser(Refresh::Force, delay),
                }
            } else if tier == Tier::Direct {
                to_browser(Refresh::Force, delay)
            } else {
                Step::Fatal
            }
        }
        // Direct cannot solve challenges; the browser gets another round
        // while it has budget. Either way the token is treated as burned.
        FailureKind::CloudflareChallenge | FailureKind::AntiBotBlocked => {
            to_browser(Refresh::Force, Duration::ZERO)
        }
        FailureKind::RateLimited => {
            let max_wait = Duration::from_secs(retry.max_rate_limit_wait_secs);
            if let Some(hint) = failure.retry_after {
                if hint > max_wait {
                    warn!("Retry-After {:?} exceeds the maximum wait {:?}", hint, max_wait);
                    return Step::Fatal;
                }
            }
            if budgets.rate_limit == 0 {
                return Step::Fatal;
            }
            budgets.rate_limit -= 1;
            budgets.rate_limit_used += 1;
            let delay = failure
                .retry_after
                .unwrap_or_else(|| backoff(retry, budgets.rate_limit_used));
            if tier == Tier::Browser && !browser_left {
                return Step::Fatal;
            }
            Step::Retry {
                tier,
                refresh: Refresh::Keep,
                delay,
            }
        }
        FailureKind::Transient => {
            if budgets.transient > 0 {
                budgets.transient -= 1;
                budgets.transient_used += 1;
                let delay = backoff(retry, budgets.transient_used);
                match tier {
                    Tier::Direct => Step::Retry {
                        tier,
                        refresh: Refresh::Keep,
                        delay,
                    },
                    Tier::Browser => to_browser(Refresh::Keep, delay),
                }
            } else if tier == Tier::Direct {
                to_browser(Refresh::Keep, Duration::ZERO)
            } else {
                Step::Fatal
            }
        }
        FailureKind::Malformed => {
            if budgets.malformed == 0 {
                return Step::Fatal;
            }
            budgets.malformed -= 1;
            let delay = Duration::from_millis(retry.backoff_floor_ms);
            match tier {
                Tier::Direct => Step::Retry {
                    tier,
                    refresh: Refresh::Keep,
                    delay,
                },
                Tier::Browser => to_browser(Refresh::Keep, delay),
            }
        }
        FailureKind::NonRetryable => Step::Fatal,
    }
}

/// `floor * 2^(n-1)` capped at the ceiling, plus jitter.
fn backoff(retry: &RetryConfig, n: u32) -> Duration {
    let exponent = n.saturating_sub(1).min(20);
    let base = retry
        .backoff_floor_ms
        .saturating_mul(1u64 << exponent)
        .min(retry.backoff_ceiling_ms);
    let jitter = if retry.backoff_jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=retry.backoff_jitter_ms)
    } else {
        0
    };
    Duration::from_millis(base + jitter)
}

fn surface(last_failure: Option<Failure>, mint_error: Option<ApiError>, detail: &str) -> ApiError {
    match (last_failure, mint_error) {
        (Some(failure), _) => failure.into_error(),
        (None, Some(err)) => err,
        (None, None) => ApiError::BrowserFetch(detail.to_string()),
    }
}

fn has_complete_line(buf: &[u8]) -> bool {
    match buf.iter().rposition(|b| *b == b'\n') {
        Some(end) => buf[..end].iter().any(|b| !b.is_ascii_whitespace()),
        None => false,
    }
}

/// Reads a 2xx body until its first non-blank line is complete.
async fn read_prelude(body: &mut ByteStream) -> ApiResult<Vec<u8>> {
    let mut prelude = Vec::new();
    while !has_complete_line(&prelude) && prelude.len() < PRELUDE_LIMIT {
        match body.next().await {
            Some(chunk) => prelude.extend_from_slice(&chunk?),
            None => break,
        }
    }
    Ok(prelude)
}

async fn read_capped(body: &mut ByteStream, limit: usize) -> String {
    let mut buf = Vec::new();
    while buf.len() < limit {
        match body.next().await {
            Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
            Some(Err(e)) => {
                debug!("Error body truncated: {}", e);
                break;
            }
            None => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::auth_pool::MemoryTokenStore;
    use crate::services::browser_fetch::{DisabledBrowserFetch, NormalizedResponse};
    use crate::services::captcha_broker::{CaptchaMinter, SiteKeyAction};
    use crate::services::direct_client::UpstreamResponse;
    use crate::services::stream_translator::StreamEvent;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use reqwest::header::HeaderMap;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    const RECAPTCHA_FAILED: &str = r#"{"error":"recaptcha validation failed"}"#;
    const HELLO_STREAM: &str = "a0:\"Hello\"\nad:{\"finishReason\":\"stop\"}\n";
    const CHALLENGE_PAGE: &str = "<html><head><title>Just a moment...</title></head></html>";

    struct Scripted {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        body: &'static str,
    }

    fn reply(status: u16, body: &'static str) -> Scripted {
        Scripted {
            status,
            headers: Vec::new(),
            body,
        }
    }

    #[derive(Default)]
    struct FakeDirect {
        script: Mutex<VecDeque<Scripted>>,
        seen_tokens: Mutex<Vec<Option<String>>>,
    }

    impl FakeDirect {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                seen_tokens: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen_tokens.lock().len()
        }
    }

    #[async_trait]
    impl DirectTransport for FakeDirect {
        async fn send(
            &self,
            _method: &Method,
            _url: &str,
            payload: &Value,
            _headers: &HeaderMap,
        ) -> ApiResult<UpstreamResponse> {
            self.seen_tokens.lock().push(
                payload
                    .get(RECAPTCHA_PAYLOAD_FIELD)
                    .and_then(Value::as_str)
                    .map(str::to_string),
            );
            let next = self
                .script
                .lock()
                .pop_front()
                .ok_or_else(|| ApiError::TransientNetwork("script exhausted".to_string()))?;
            let body: ByteStream = Box::pin(stream::once(async move { Ok::<_, ApiError>(Bytes::from_static(next.body.as_bytes())) }));
            Ok(UpstreamResponse {
                status: next.status,
                headers: next
                    .headers
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                body,
            })
        }
    }

    #[derive(Debug, Clone)]
    struct BrowserCall {
        captcha_header: Option<String>,
        max_challenge_attempts: u32,
    }

    #[derive(Default)]
    struct FakeBrowser {
        script: Mutex<VecDeque<Result<NormalizedResponse, BrowserFetchError>>>,
        calls: Mutex<Vec<BrowserCall>>,
    }

    impl FakeBrowser {
        fn new(script: Vec<Result<NormalizedResponse, BrowserFetchError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<BrowserCall> {
            self.calls.lock().clone()
        }
    }

    fn browser_ok(status: u16, body: &str) -> Result<NormalizedResponse, BrowserFetchError> {
        Ok(NormalizedResponse {
            status,
            body: body.to_string(),
            ..Default::default()
        })
    }

    #[async_trait]
    impl BrowserFetchProvider for FakeBrowser {
        async fn fetch(
            &self,
            _method: &Method,
            _url: &str,
            _payload: &Value,
            headers: &HashMap<String, String>,
            max_challenge_attempts: u32,
        ) -> Result<NormalizedResponse, BrowserFetchError> {
            self.calls.lock().push(BrowserCall {
                captcha_header: headers.get("X-Recaptcha-Token").cloned(),
                max_challenge_attempts,
            });
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(BrowserFetchError::Transport("script exhausted".to_string())))
        }
    }

    #[derive(Default)]
    struct SequenceMinter {
        minted: AtomicUsize,
    }

    #[async_trait]
    impl CaptchaMinter for SequenceMinter {
        fn name(&self) -> &str {
            "sequence"
        }

        fn tier(&self) -> Tier {
            Tier::Direct
        }

        async fn mint(&self, _key: &SiteKeyAction) -> ApiResult<String> {
            let n = self.minted.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("captcha-{}", n))
        }
    }

    struct Harness {
        dispatcher: RequestDispatcher,
        captcha: Arc<CaptchaTokenBroker>,
        minter: Arc<SequenceMinter>,
        pool: Arc<AuthTokenPool>,
    }

    fn harness(
        direct: Arc<dyn DirectTransport>,
        browser: Arc<dyn BrowserFetchProvider>,
        tweak: impl FnOnce(&mut ArenaConfig, &mut RetryConfig),
    ) -> Harness {
        let mut arena = ArenaConfig::default();
        let mut retry = RetryConfig::default();
        retry.backoff_jitter_ms = 0;
        tweak(&mut arena, &mut retry);

        let minter = Arc::new(SequenceMinter::default());
        let captcha = Arc::new(CaptchaTokenBroker::new(vec![minter.clone()], &arena, &retry));
        let pool = Arc::new(AuthTokenPool::new(
            vec!["auth-1".to_string()],
            Arc::new(MemoryTokenStore::default()),
            arena.auth_cookie_name.clone(),
            HashMap::new(),
        ));
        let dispatcher = RequestDispatcher::new(
            pool.clone(),
            captcha.clone(),
            direct,
            browser,
            arena,
            retry,
        );
        Harness {
            dispatcher,
            captcha,
            minter,
            pool,
        }
    }

    fn request(model: &str) -> UpstreamRequest {
        UpstreamRequest {
            model: model.to_string(),
            method: Method::POST,
            url: "https://lmarena.ai/nextjs-api/stream/create-evaluation".to_string(),
            payload: json!({"id": "eval-1", "modelAId": "model-a"}),
            client_recaptcha_token: None,
        }
    }

    async fn events(dispatched: Dispatched) -> Vec<StreamEvent> {
        dispatched.events.collect().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_recaptcha_rejection_then_success() {
        let direct = FakeDirect::new(vec![reply(403, RECAPTCHA_FAILED), reply(200, HELLO_STREAM)]);
        let h = harness(direct.clone(), Arc::new(DisabledBrowserFetch), |_, _| {});

        let dispatched = assert_ok!(h.dispatcher.dispatch(&request("gpt-4o")).await);
        assert_eq!(dispatched.tier, Tier::Direct);
        assert_eq!(
            events(dispatched).await,
            vec![
                StreamEvent::TextDelta("Hello".to_string()),
                StreamEvent::Finish("stop".to_string()),
            ]
        );

        assert_eq!(h.captcha.forced_refresh_count(), 1);
        let tokens = direct.seen_tokens.lock().clone();
        assert_eq!(tokens.len(), 2);
        assert_ne!(tokens[0], tokens[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_honours_retry_after() {
        let direct = FakeDirect::new(vec![
            Scripted {
                status: 429,
                headers: vec![("Retry-After", "7")],
                body: "Too Many Requests",
            },
            reply(200, HELLO_STREAM),
        ]);
        let h = harness(direct.clone(), Arc::new(DisabledBrowserFetch), |_, _| {});

        let started = Instant::now();
        let dispatched = assert_ok!(h.dispatcher.dispatch(&request("gpt-4o")).await);
        assert!(started.elapsed() >= Duration::from_secs(7));
        assert_eq!(dispatched.attempts[0].wait_before_next, Some(Duration::from_secs(7)));

        assert_eq!(h.captcha.forced_refresh_count(), 0);
        let tokens = direct.seen_tokens.lock().clone();
        assert_eq!(tokens[0], tokens[1]);
        assert_eq!(h.minter.minted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_beyond_max_wait_surfaces() {
        let direct = FakeDirect::new(vec![Scripted {
            status: 429,
            headers: vec![("retry-after", "600")],
            body: "Too Many Requests",
        }]);
        let h = harness(direct.clone(), Arc::new(DisabledBrowserFetch), |_, _| {});

        let err = assert_err!(h.dispatcher.dispatch(&request("gpt-4o")).await);
        match err {
            ApiError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(600)))
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(direct.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cloudflare_challenge_escalates_to_browser() {
        let direct = FakeDirect::new(vec![reply(403, CHALLENGE_PAGE), reply(200, HELLO_STREAM)]);
        let browser = FakeBrowser::new(vec![browser_ok(200, HELLO_STREAM)]);
        let h = harness(direct.clone(), browser.clone(), |_, _| {});

        let dispatched = assert_ok!(h.dispatcher.dispatch(&request("gpt-4o")).await);
        assert_eq!(dispatched.attempts.len(), 2);
        assert_eq!(dispatched.attempts[0].tier, Tier::Direct);
        assert_eq!(dispatched.attempts[1].tier, Tier::Browser);
        assert_eq!(direct.calls(), 1);
        assert_eq!(browser.calls().len(), 1);
        assert_ne!(dispatched.attempts[0].captcha_token, dispatched.attempts[1].captcha_token);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_model_never_uses_direct() {
        let direct = FakeDirect::new(vec![reply(200, HELLO_STREAM)]);
        let browser = FakeBrowser::new(vec![browser_ok(200, HELLO_STREAM)]);
        let h = harness(direct.clone(), browser.clone(), |_, retry| {
            retry
                .model_challenge_attempts
                .insert("gemini-3-pro-grounding".to_string(), 6);
        });

        let dispatched = assert_ok!(h.dispatcher.dispatch(&request("gemini-3-pro-grounding")).await);
        assert_eq!(dispatched.tier, Tier::Browser);
        assert_eq!(direct.calls(), 0);
        assert_eq!(browser.calls()[0].max_challenge_attempts, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_browser_recaptcha_rejection_gets_fresh_token() {
        let direct = FakeDirect::new(Vec::new());
        let browser = FakeBrowser::new(vec![browser_ok(403, RECAPTCHA_FAILED), browser_ok(200, HELLO_STREAM)]);
        let h = harness(direct.clone(), browser.clone(), |_, _| {});

        assert_ok!(h.dispatcher.dispatch(&request("gemini-3-pro-grounding")).await);
        let calls = browser.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].captcha_header.is_some());
        assert_ne!(calls[0].captcha_header, calls[1].captcha_header);
        assert_eq!(direct.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_status_fails_fast() {
        let direct = FakeDirect::new(vec![reply(400, "bad request"), reply(200, HELLO_STREAM)]);
        let h = harness(direct.clone(), Arc::new(DisabledBrowserFetch), |_, _| {});

        let err = assert_err!(h.dispatcher.dispatch(&request("gpt-4o")).await);
        assert!(matches!(err, ApiError::NonRetryable { status: 400, .. }));
        assert_eq!(direct.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_browser_surfaces_last_classification() {
        let direct = FakeDirect::new(vec![reply(403, "Forbidden")]);
        let h = harness(direct.clone(), Arc::new(DisabledBrowserFetch), |_, _| {});

        let err = assert_err!(h.dispatcher.dispatch(&request("gpt-4o")).await);
        assert!(matches!(err, ApiError::AntiBotRejected { status: 403, .. }));
        assert_eq!(err.kind(), "upstream_anti_bot");
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_token_is_passed_through() {
        let direct = FakeDirect::new(vec![reply(200, HELLO_STREAM)]);
        let h = harness(direct.clone(), Arc::new(DisabledBrowserFetch), |_, _| {});

        let mut req = request("gpt-4o");
        req.client_recaptcha_token = Some("caller-token".to_string());
        assert_ok!(h.dispatcher.dispatch(&req).await);

        assert_eq!(direct.seen_tokens.lock()[0].as_deref(), Some("caller-token"));
        assert_eq!(h.minter.minted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_token_survives_rate_limit() {
        let direct = FakeDirect::new(vec![
            Scripted {
                status: 429,
                headers: vec![("Retry-After", "7")],
                body: "Too Many Requests",
            },
            reply(200, HELLO_STREAM),
        ]);
        let h = harness(direct.clone(), Arc::new(DisabledBrowserFetch), |_, _| {});

        let mut req = request("gpt-4o");
        req.client_recaptcha_token = Some("caller-token".to_string());
        assert_ok!(h.dispatcher.dispatch(&req).await);

        let tokens = direct.seen_tokens.lock().clone();
        assert_eq!(
            tokens,
            vec![Some("caller-token".to_string()), Some("caller-token".to_string())]
        );
        assert_eq!(h.minter.minted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_are_not_shared_between_requests() {
        let direct = FakeDirect::new(vec![reply(200, HELLO_STREAM), reply(200, HELLO_STREAM)]);
        let h = harness(direct.clone(), Arc::new(DisabledBrowserFetch), |_, _| {});

        assert_ok!(h.dispatcher.dispatch(&request("gpt-4o")).await);
        assert_ok!(h.dispatcher.dispatch(&request("gpt-4o")).await);

        let tokens = direct.seen_tokens.lock().clone();
        assert_eq!(tokens.len(), 2);
        assert_ne!(tokens[0], tokens[1]);
        assert_eq!(h.minter.minted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_token_is_replaced_after_long_wait() {
        let direct = FakeDirect::new(vec![
            Scripted {
                status: 429,
                headers: vec![("Retry-After", "115")],
                body: "Too Many Requests",
            },
            reply(200, HELLO_STREAM),
        ]);
        let h = harness(direct.clone(), Arc::new(DisabledBrowserFetch), |_, _| {});

        assert_ok!(h.dispatcher.dispatch(&request("gpt-4o")).await);
        let tokens = direct.seen_tokens.lock().clone();
        assert_ne!(tokens[0], tokens[1]);
        assert_eq!(h.captcha.forced_refresh_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatched_debug_skips_events() {
        let direct = FakeDirect::new(vec![reply(200, HELLO_STREAM)]);
        let h = harness(direct, Arc::new(DisabledBrowserFetch), |_, _| {});

        let dispatched = assert_ok!(h.dispatcher.dispatch(&request("gpt-4o")).await);
        let rendered = format!("{:?}", dispatched);
        assert!(rendered.contains("Direct"));
        assert!(!rendered.contains("events"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_browser_cookies_feed_the_pool() {
        let direct = FakeDirect::new(Vec::new());
        let mut response = NormalizedResponse {
            status: 200,
            body: HELLO_STREAM.to_string(),
            ..Default::default()
        };
        response
            .cookies
            .insert("arena-auth-prod-v1".to_string(), "fresh-auth".to_string());
        let browser = FakeBrowser::new(vec![Ok(response)]);
        let h = harness(direct, browser, |_, _| {});

        assert_ok!(h.dispatcher.dispatch(&request("gemini-3-pro-grounding")).await);
        assert_eq!(h.pool.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_escalate_then_give_up() {
        let direct = FakeDirect::new(vec![reply(502, "bad gateway"), reply(503, "unavailable")]);
        let browser = FakeBrowser::new(vec![browser_ok(500, "oops")]);
        let h = harness(direct.clone(), browser.clone(), |_, retry| {
            retry.transient_retries = 1;
            retry.browser_attempts = 1;
        });

        let err = assert_err!(h.dispatcher.dispatch(&request("gpt-4o")).await);
        assert_eq!(err.kind(), "upstream_unavailable");
        assert_eq!(direct.calls(), 2);
        assert_eq!(browser.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_success_retried_once() {
        let direct = FakeDirect::new(vec![reply(200, "<xml/>"), reply(200, "{\"oops\":1}")]);
        let h = harness(direct.clone(), Arc::new(DisabledBrowserFetch), |_, _| {});

        let err = assert_err!(h.dispatcher.dispatch(&request("gpt-4o")).await);
        assert!(matches!(err, ApiError::MalformedUpstream { status: 200, .. }));
        assert_eq!(direct.calls(), 2);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            backoff_jitter_ms: 0,
            ..RetryConfig::default()
        };
        assert_eq!(backoff(&retry, 1), Duration::from_millis(1000));
        assert_eq!(backoff(&retry, 2), Duration::from_millis(2000));
        assert_eq!(backoff(&retry, 3), Duration::from_millis(4000));
        assert_eq!(backoff(&retry, 10), Duration::from_millis(30_000));
    }

    #[test]
    fn test_prelude_completion() {
        assert!(!has_complete_line(b"a0:\"Hel"));
        assert!(!has_complete_line(b"\n\n"));
        assert!(has_complete_line(b"\na0:\"Hello\"\n"));
    }
}
