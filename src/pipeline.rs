//! Authenticated request pipeline.
//!
//! Every call reads the current credential from the [`TokenManager`], attaches
//! it, and on a 401 with a refresh token available refreshes once and retries
//! once. Anything else is surfaced to the caller as an [`ApiError`].

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{HeaderMap, AUTHORIZATION, USER_AGENT};
use reqwest::Method;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::ApiError;
use crate::token::{AccessToken, TokenManager};

pub const DEFAULT_BASE_URL: &str = "https://oauth.reddit.com/";

/// Token grants the pipeline falls back on. Implemented by [`crate::auth::Flow`].
pub trait TokenGrants: Send + Sync {
    /// Exchanges the refresh token of `current` for a new user credential.
    fn refresh(&self, current: &AccessToken) -> Result<AccessToken, ApiError>;
    /// Obtains an anonymous credential bound to `device_id`.
    fn anonymous(&self, device_id: &str) -> Result<AccessToken, ApiError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRequirement {
    /// Fails with [`ApiError::InvalidCredential`] before any network traffic
    /// unless a user credential is present.
    User,
    /// Proceeds anonymously when nobody is logged in.
    Optional,
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub form: Option<Vec<(String, String)>>,
    pub auth: AuthRequirement,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            form: None,
            auth: AuthRequirement::Optional,
        }
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            query: Vec::new(),
            form: Some(Vec::new()),
            auth: AuthRequirement::Optional,
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn form(mut self, key: &str, value: impl ToString) -> Self {
        self.form
            .get_or_insert_with(Vec::new)
            .push((key.to_string(), value.to_string()));
        self
    }

    pub fn requires_user(mut self) -> Self {
        self.auth = AuthRequirement::User;
        self
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub user_agent: String,
    pub base_url: Option<String>,
    pub timeout: Duration,
    pub refresh_skew: Duration,
    pub http_client: Option<HttpClient>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            user_agent: String::new(),
            base_url: None,
            timeout: Duration::from_secs(20),
            refresh_skew: Duration::from_secs(30),
            http_client: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RateLimit {
    pub used: f64,
    pub remaining: f64,
    pub reset_at: Option<SystemTime>,
}

pub struct Pipeline {
    tokens: Arc<TokenManager>,
    grants: Arc<dyn TokenGrants>,
    http: HttpClient,
    user_agent: String,
    base_url: Url,
    refresh_skew: Duration,
    refresh_gate: Mutex<()>,
    rate: RwLock<RateLimit>,
}

impl Pipeline {
    pub fn new(
        tokens: Arc<TokenManager>,
        grants: Arc<dyn TokenGrants>,
        config: PipelineConfig,
    ) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("pipeline: user agent required");
        }
        let mut base = config
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).context("pipeline: parse base url")?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout)
                .build()
                .context("pipeline: build http client")?,
        };

        Ok(Self {
            tokens,
            grants,
            http,
            user_agent: config.user_agent,
            base_url,
            refresh_skew: config.refresh_skew,
            refresh_gate: Mutex::new(()),
            rate: RwLock::new(RateLimit::default()),
        })
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn rate_limit(&self) -> RateLimit {
        self.rate.read().clone()
    }

    /// Current credential if it belongs to a logged-in user.
    pub fn require_user(&self) -> Result<AccessToken, ApiError> {
        let token = self.tokens.get_token();
        if token.is_user() {
            Ok(token)
        } else {
            Err(ApiError::InvalidCredential)
        }
    }

    pub fn execute_json<T>(&self, request: &ApiRequest) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let body = self.execute(request)?.text()?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Runs `request` and discards a successful body.
    pub fn execute_empty(&self, request: &ApiRequest) -> Result<(), ApiError> {
        self.execute(request)?;
        Ok(())
    }

    pub fn execute(&self, request: &ApiRequest) -> Result<Response, ApiError> {
        let token = self.credential_for(request.auth)?;
        match self.send(request, &token) {
            Err(err) if err.is_unauthorized() && token.is_user() => {
                info!(
                    "pipeline: {} {} answered 401, refreshing credential",
                    request.method, request.path
                );
                let refreshed = match self.refresh_stale(&token) {
                    Ok(refreshed) => refreshed,
                    Err(refresh_err) => {
                        warn!("pipeline: refresh failed: {refresh_err}");
                        return Err(err);
                    }
                };
                self.send(request, &refreshed)
            }
            other => other,
        }
    }

    fn credential_for(&self, auth: AuthRequirement) -> Result<AccessToken, ApiError> {
        let token = self.tokens.get_token();
        if token.is_user() {
            if !token.is_expired(self.refresh_skew) {
                return Ok(token);
            }
            debug!("pipeline: user credential expired, refreshing before the call");
            return match self.refresh_stale(&token) {
                Ok(refreshed) => Ok(refreshed),
                Err(err) => {
                    warn!("pipeline: proactive refresh failed: {err}");
                    Ok(token)
                }
            };
        }
        if auth == AuthRequirement::User {
            return Err(ApiError::InvalidCredential);
        }
        if token.has_token() && !token.is_expired(self.refresh_skew) {
            return Ok(token);
        }
        self.acquire_anonymous(&token)
    }

    /// Refreshes `stale` unless another caller already replaced it. Only one
    /// refresh runs at a time; waiters reuse its result.
    fn refresh_stale(&self, stale: &AccessToken) -> Result<AccessToken, ApiError> {
        let _gate = self.refresh_gate.lock();
        let current = self.tokens.get_token();
        if current.access_token != stale.access_token {
            debug!("pipeline: credential already replaced by a concurrent refresh");
            return if current.is_user() {
                Ok(current)
            } else {
                Err(ApiError::InvalidCredential)
            };
        }

        let refreshed = self.grants.refresh(stale)?;
        let swapped = self
            .tokens
            .replace_if_current(&stale.access_token, refreshed.clone())
            .map_err(|err| ApiError::Storage(format!("{err:#}")))?;
        if swapped {
            info!("pipeline: credential refreshed");
            return Ok(refreshed);
        }
        let current = self.tokens.get_token();
        if current.is_user() {
            Ok(current)
        } else {
            Err(ApiError::InvalidCredential)
        }
    }

    fn acquire_anonymous(&self, stale: &AccessToken) -> Result<AccessToken, ApiError> {
        let _gate = self.refresh_gate.lock();
        let current = self.tokens.get_token();
        if current.access_token != stale.access_token {
            return Ok(current);
        }

        let device_id = current
            .device_id
            .clone()
            .unwrap_or_else(|| self.tokens.device_id().to_string());
        let granted = self.grants.anonymous(&device_id)?;
        let swapped = self
            .tokens
            .replace_if_current(&stale.access_token, granted.clone())
            .map_err(|err| ApiError::Storage(format!("{err:#}")))?;
        if swapped {
            info!("pipeline: obtained anonymous credential");
            Ok(granted)
        } else {
            Ok(self.tokens.get_token())
        }
    }

    fn send(&self, request: &ApiRequest, token: &AccessToken) -> Result<Response, ApiError> {
        let mut url = self.base_url.join(request.path.trim_start_matches('/'))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        debug!("pipeline: {} {}", request.method, url.path());

        let mut req = self
            .http
            .request(request.method.clone(), url)
            .header(USER_AGENT, self.user_agent.as_str());
        if token.has_token() {
            req = req.header(AUTHORIZATION, token.authorization_header());
        }
        if let Some(form) = &request.form {
            req = req.form(form);
        }

        let resp = req.send()?;
        self.capture_rate(resp.headers());
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().unwrap_or_default();
        debug!("pipeline: {} {} failed with {}", request.method, request.path, status);
        Err(ApiError::Http {
            code: status.as_u16(),
            body,
        })
    }

    fn capture_rate(&self, headers: &HeaderMap) {
        let remaining = header_float(headers, "x-ratelimit-remaining");
        let used = header_float(headers, "x-ratelimit-used");
        let reset = header_float(headers, "x-ratelimit-reset");
        if remaining == 0.0 && used == 0.0 && reset == 0.0 {
            return;
        }
        let reset_at = Duration::try_from_secs_f64(reset.max(0.0))
            .ok()
            .and_then(|wait| SystemTime::now().checked_add(wait));
        let mut rate = self.rate.write();
        rate.remaining = remaining;
        rate.used = used;
        rate.reset_at = reset_at;
    }
}

fn header_float(headers: &HeaderMap, key: &str) -> f64 {
    headers
        .get(key)
        .and_then(|value| value.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingStore, FakeGrants, MockServer, Reply};
    use serde_json::Value;
    use std::sync::atomic::Ordering;
    use std::thread;

    fn pipeline(server: &str, store: Arc<CountingStore>, grants: Arc<FakeGrants>) -> Pipeline {
        let tokens = Arc::new(TokenManager::load(store, Some("device-0123456789abcdefghij".into())));
        Pipeline::new(
            tokens,
            grants,
            PipelineConfig {
                user_agent: "redlurk-test/0.1".into(),
                base_url: Some(server.to_string()),
                timeout: Duration::from_secs(5),
                ..PipelineConfig::default()
            },
        )
        .unwrap()
    }

    fn logged_in(store: &CountingStore, access: &str) {
        store.seed(AccessToken::user(access, "identity read", "refresh-1", 3600));
    }

    #[test]
    fn unauthorized_refreshes_once_and_retries_once() {
        let server = MockServer::scripted(vec![
            Reply::json(401, r#"{"message": "Unauthorized"}"#),
            Reply::json(200, r#"{"name": "someone"}"#),
        ]);
        let store = Arc::new(CountingStore::default());
        logged_in(&store, "1-stale");
        let grants = Arc::new(FakeGrants::refreshing_to(AccessToken::user(
            "1-fresh", "identity read", "refresh-1", 3600,
        )));
        let pipeline = pipeline(&server.base_url, store.clone(), grants.clone());

        let me: Value = pipeline
            .execute_json(&ApiRequest::get("api/v1/me"))
            .unwrap();
        assert_eq!(me["name"], "someone");
        assert_eq!(grants.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.saves(), 1);
        assert_eq!(store.load_current().unwrap().access_token, "1-fresh");

        let auth: Vec<_> = server
            .seen()
            .into_iter()
            .map(|seen| seen.authorization.unwrap_or_default())
            .collect();
        assert_eq!(auth, ["Bearer 1-stale", "Bearer 1-fresh"]);
    }

    #[test]
    fn second_unauthorized_is_surfaced_without_third_attempt() {
        let server = MockServer::scripted(vec![
            Reply::json(401, "{}"),
            Reply::json(401, r#"{"reason": "still no"}"#),
            Reply::json(200, "{}"),
        ]);
        let store = Arc::new(CountingStore::default());
        logged_in(&store, "1-stale");
        let grants = Arc::new(FakeGrants::refreshing_to(AccessToken::user(
            "1-fresh", "", "refresh-1", 3600,
        )));
        let pipeline = pipeline(&server.base_url, store, grants.clone());

        let err = pipeline
            .execute_empty(&ApiRequest::get("api/v1/me"))
            .unwrap_err();
        assert!(err.is_unauthorized());
        assert!(err.to_string().contains("still no"));
        assert_eq!(server.hits(), 2);
        assert_eq!(grants.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_refresh_surfaces_original_failure() {
        let server = MockServer::scripted(vec![Reply::json(401, r#"{"first": true}"#)]);
        let store = Arc::new(CountingStore::default());
        logged_in(&store, "1-stale");
        let grants = Arc::new(FakeGrants::failing());
        let pipeline = pipeline(&server.base_url, store.clone(), grants);

        let err = pipeline
            .execute_empty(&ApiRequest::get("api/v1/me"))
            .unwrap_err();
        assert_eq!(err.code(), 401);
        assert!(err.to_string().contains("first"));
        assert_eq!(server.hits(), 1);
        assert_eq!(store.saves(), 0);
    }

    #[test]
    fn other_statuses_are_not_retried() {
        let server = MockServer::scripted(vec![Reply::json(503, "busy")]);
        let store = Arc::new(CountingStore::default());
        logged_in(&store, "1-a");
        let grants = Arc::new(FakeGrants::failing());
        let pipeline = pipeline(&server.base_url, store, grants.clone());

        let err = pipeline
            .execute_empty(&ApiRequest::get("hot"))
            .unwrap_err();
        assert_eq!(err.code(), 503);
        assert_eq!(server.hits(), 1);
        assert_eq!(grants.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn user_only_call_fails_fast_without_login() {
        let server = MockServer::scripted(Vec::new());
        let store = Arc::new(CountingStore::default());
        let grants = Arc::new(FakeGrants::failing());
        let pipeline = pipeline(&server.base_url, store, grants.clone());

        let err = pipeline
            .execute_empty(&ApiRequest::post("api/vote").form("dir", 1).requires_user())
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidCredential));
        assert_eq!(server.hits(), 0);
        assert_eq!(grants.anonymous_calls.load(Ordering::SeqCst), 0);
        assert!(pipeline.require_user().is_err());
    }

    #[test]
    fn anonymous_credential_is_obtained_lazily() {
        let server = MockServer::scripted(vec![Reply::json(200, "{}"), Reply::json(200, "{}")]);
        let store = Arc::new(CountingStore::default());
        let grants = Arc::new(FakeGrants::failing().with_anonymous(AccessToken::anonymous(
            "-anon",
            "*",
            3600,
            "device-0123456789abcdefghij",
        )));
        let pipeline = pipeline(&server.base_url, store.clone(), grants.clone());

        pipeline.execute_empty(&ApiRequest::get("hot")).unwrap();
        pipeline.execute_empty(&ApiRequest::get("new")).unwrap();

        assert_eq!(grants.anonymous_calls.load(Ordering::SeqCst), 1);
        let stored = store.load_current().unwrap();
        assert!(stored.is_anonymous());
        assert_eq!(stored.user_id(), None);
        let seen = server.seen();
        assert_eq!(seen[1].authorization.as_deref(), Some("Bearer -anon"));
        assert!(seen[0].url.starts_with("/hot"));
    }

    #[test]
    fn expired_user_credential_is_refreshed_before_the_call() {
        let server = MockServer::scripted(vec![Reply::json(200, "{}")]);
        let store = Arc::new(CountingStore::default());
        let mut stale = AccessToken::user("1-old", "", "refresh-1", 3600);
        stale.issued_at = chrono::Utc::now() - chrono::Duration::hours(2);
        store.seed(stale);
        let grants = Arc::new(FakeGrants::refreshing_to(AccessToken::user(
            "1-new", "", "refresh-1", 3600,
        )));
        let pipeline = pipeline(&server.base_url, store, grants.clone());

        pipeline.execute_empty(&ApiRequest::get("api/v1/me")).unwrap();
        assert_eq!(grants.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            server.seen()[0].authorization.as_deref(),
            Some("Bearer 1-new")
        );
    }

    #[test]
    fn concurrent_unauthorized_calls_share_one_refresh() {
        let server = MockServer::start(|seen| {
            if seen.authorization.as_deref() == Some("Bearer 1-stale") {
                Reply::json(401, "{}")
            } else {
                Reply::json(200, "{}")
            }
        });
        let store = Arc::new(CountingStore::default());
        logged_in(&store, "1-stale");
        let grants = Arc::new(FakeGrants::refreshing_to(AccessToken::user(
            "1-fresh", "", "refresh-1", 3600,
        )));
        let pipeline = Arc::new(pipeline(&server.base_url, store.clone(), grants.clone()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pipeline = pipeline.clone();
                thread::spawn(move || pipeline.execute_empty(&ApiRequest::get("api/v1/me")))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(grants.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.saves(), 1);
    }

    #[test]
    fn query_form_and_rate_headers() {
        let server = MockServer::scripted(vec![Reply::json(200, "{}")
            .header("x-ratelimit-remaining", "598.0")
            .header("x-ratelimit-used", "2")
            .header("x-ratelimit-reset", "300")]);
        let store = Arc::new(CountingStore::default());
        logged_in(&store, "1-a");
        let pipeline = pipeline(&server.base_url, store, Arc::new(FakeGrants::failing()));

        pipeline
            .execute_empty(
                &ApiRequest::post("/api/vote")
                    .query("raw_json", 1)
                    .form("id", "t3_abc")
                    .form("dir", -1),
            )
            .unwrap();
        let seen = &server.seen()[0];
        assert_eq!(seen.method, "POST");
        assert_eq!(seen.url, "/api/vote?raw_json=1");
        assert_eq!(seen.body, "id=t3_abc&dir=-1");
        assert_eq!(seen.user_agent.as_deref(), Some("redlurk-test/0.1"));

        let rate = pipeline.rate_limit();
        assert_eq!(rate.remaining, 598.0);
        assert_eq!(rate.used, 2.0);
        assert!(rate.reset_at.is_some());
    }

    #[test]
    fn unusable_rate_reset_is_ignored() {
        let server = MockServer::scripted(vec![
            Reply::json(200, "{}")
                .header("x-ratelimit-remaining", "10")
                .header("x-ratelimit-reset", "inf"),
            Reply::json(200, "{}")
                .header("x-ratelimit-remaining", "9")
                .header("x-ratelimit-reset", "1e30"),
        ]);
        let store = Arc::new(CountingStore::default());
        logged_in(&store, "1-a");
        let pipeline = pipeline(&server.base_url, store, Arc::new(FakeGrants::failing()));

        pipeline.execute_empty(&ApiRequest::get("hot")).unwrap();
        assert_eq!(pipeline.rate_limit().remaining, 10.0);
        assert!(pipeline.rate_limit().reset_at.is_none());

        pipeline.execute_empty(&ApiRequest::get("hot")).unwrap();
        assert_eq!(pipeline.rate_limit().remaining, 9.0);
        assert!(pipeline.rate_limit().reset_at.is_none());
    }
}
