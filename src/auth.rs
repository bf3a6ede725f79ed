//! OAuth grants against the Reddit token endpoint: the browser
//! authorization-code login, refresh, the anonymous installed-client grant,
//! and revocation on logout.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use rand::RngCore;
use reqwest::blocking::Client;
use reqwest::header::USER_AGENT;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tiny_http::{Header, Method, Response, Server};
use url::Url;

use crate::error::ApiError;
use crate::pipeline::TokenGrants;
use crate::token::{AccessToken, TokenManager};

pub const INSTALLED_CLIENT_GRANT: &str = "https://oauth.reddit.com/grants/installed_client";

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN: i64 = 3600;

static HTML_SUCCESS: Lazy<String> = Lazy::new(|| {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <title>{name} authorization complete</title>
    <style>
      body {{ font-family: sans-serif; display: flex; align-items: center; justify-content: center; min-height: 100vh; margin: 0; }}
      main {{ max-width: 420px; text-align: center; }}
    </style>
  </head>
  <body>
    <main>
      <h1>Authorization complete</h1>
      <p>{name} {version} is now connected to your Reddit account. You can close this tab.</p>
    </main>
  </body>
</html>"#,
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
    )
});

#[derive(Debug, Clone)]
pub struct Config {
    pub client_id: String,
    pub client_secret: String,
    pub scope: Vec<String>,
    pub user_agent: String,
    pub auth_url: String,
    pub token_url: String,
    pub revoke_url: String,
    pub redirect_uri: String,
    pub timeout: Duration,
    pub login_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            scope: vec![
                "identity".into(),
                "edit".into(),
                "history".into(),
                "modposts".into(),
                "mysubreddits".into(),
                "read".into(),
                "save".into(),
                "submit".into(),
                "subscribe".into(),
                "vote".into(),
            ],
            user_agent: concat!("redlurk/", env!("CARGO_PKG_VERSION")).into(),
            auth_url: "https://www.reddit.com/api/v1/authorize".into(),
            token_url: "https://www.reddit.com/api/v1/access_token".into(),
            revoke_url: "https://www.reddit.com/api/v1/revoke_token".into(),
            redirect_uri: "http://127.0.0.1:65010/redlurk/callback".into(),
            timeout: Duration::from_secs(20),
            login_timeout: Duration::from_secs(300),
        }
    }
}

pub struct Flow {
    cfg: Config,
    tokens: Arc<TokenManager>,
    client: Client,
}

/// A pending browser login. Dropping it stops the loopback listener.
pub struct AuthorizationRequest {
    pub browser_url: String,
    pub redirect_uri: String,
    verifier: String,
    rx: Receiver<Result<String>>,
    shutdown: Sender<()>,
}

impl Drop for AuthorizationRequest {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

impl Flow {
    pub fn new(tokens: Arc<TokenManager>, cfg: Config) -> Result<Self> {
        if cfg.client_id.trim().is_empty() {
            bail!("auth: client id is required");
        }
        if cfg.user_agent.trim().is_empty() {
            bail!("auth: user agent is required");
        }
        let client = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("auth: build http client")?;

        Ok(Self {
            cfg,
            tokens,
            client,
        })
    }

    /// Starts the loopback listener and returns the URL to open in a browser.
    pub fn begin(&self) -> Result<AuthorizationRequest> {
        let verifier = random_string(64);
        let challenge = code_challenge(&verifier);
        let state = random_string(32);

        let redirect = Url::parse(&self.cfg.redirect_uri).context("auth: parse redirect uri")?;
        let host = redirect.host_str().unwrap_or("127.0.0.1");
        let port = redirect.port().unwrap_or(0);
        let path = if redirect.path().is_empty() {
            "/"
        } else {
            redirect.path()
        };

        let server = Server::http(format!("{host}:{port}"))
            .map_err(|err| anyhow!("auth: listen: {err}"))?;
        let actual_redirect = Url::parse(&format!("http://{}{}", server.server_addr(), path))?;
        let browser_url = self.authorize_url(actual_redirect.as_str(), &state, &challenge)?;
        debug!("auth: waiting for redirect on {actual_redirect}");

        let (result_tx, result_rx) = bounded::<Result<String>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        thread::spawn(move || loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }
            match server.recv_timeout(Duration::from_millis(250)) {
                Ok(Some(request)) => {
                    let outcome = handle_redirect(request, &state);
                    let _ = result_tx.send(outcome);
                    break;
                }
                Ok(None) => continue,
                Err(err) => {
                    let _ = result_tx.send(Err(anyhow!("auth: loopback listener: {err}")));
                    break;
                }
            }
        });

        Ok(AuthorizationRequest {
            browser_url,
            redirect_uri: actual_redirect.to_string(),
            verifier,
            rx: result_rx,
            shutdown: shutdown_tx,
        })
    }

    fn authorize_url(&self, redirect_uri: &str, state: &str, challenge: &str) -> Result<String> {
        let mut auth = Url::parse(&self.cfg.auth_url).context("auth: parse authorize url")?;
        auth.query_pairs_mut()
            .append_pair("client_id", &self.cfg.client_id)
            .append_pair("response_type", "code")
            .append_pair("state", state)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("duration", "permanent")
            .append_pair("scope", &self.cfg.scope.join(" "))
            .append_pair("code_challenge", challenge)
            .append_pair("code_challenge_method", "S256");
        Ok(auth.to_string())
    }

    /// Waits for the browser redirect, exchanges the code and stores the
    /// resulting user credential.
    pub fn complete(&self, authz: AuthorizationRequest) -> Result<AccessToken> {
        let code = match authz.rx.recv_timeout(self.cfg.login_timeout) {
            Ok(outcome) => outcome?,
            Err(RecvTimeoutError::Timeout) => bail!("auth: timed out waiting for the browser"),
            Err(RecvTimeoutError::Disconnected) => bail!("auth: authorization cancelled"),
        };

        let payload = self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", authz.redirect_uri.as_str()),
            ("code_verifier", authz.verifier.as_str()),
        ])?;
        let refresh = payload
            .refresh_token
            .clone()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| anyhow!("auth: token response missing refresh token"))?;
        let token = payload.into_token(Some(refresh), None, &self.cfg.scope);
        self.tokens
            .save_token(token.clone())
            .context("auth: store credential")?;
        info!("auth: logged in");
        Ok(token)
    }

    pub fn refresh_grant(&self, current: &AccessToken) -> Result<AccessToken, ApiError> {
        let refresh = current
            .refresh_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or(ApiError::InvalidCredential)?;
        let payload = self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
        ])?;

        let scope = if current.scope.is_empty() {
            self.cfg.scope.clone()
        } else {
            current.scopes().into_iter().map(String::from).collect()
        };
        let rotated = payload
            .refresh_token
            .clone()
            .filter(|token| !token.is_empty())
            .unwrap_or_else(|| refresh.to_string());
        let mut token = payload.into_token(Some(rotated), None, &scope);
        if token.token_type.is_empty() {
            token.token_type = current.token_type.clone();
        }
        Ok(token)
    }

    pub fn anonymous_grant(&self, device_id: &str) -> Result<AccessToken, ApiError> {
        let payload = self.token_request(&[
            ("grant_type", INSTALLED_CLIENT_GRANT),
            ("device_id", device_id),
        ])?;
        Ok(payload.into_token(None, Some(device_id.to_string()), &[]))
    }

    /// Revokes the refresh token of a user credential. Callers treat a
    /// failure as non-fatal; the local credential is removed regardless.
    pub fn revoke(&self, token: &AccessToken) -> Result<()> {
        let Some(refresh) = token.refresh_token.as_deref().filter(|t| !t.is_empty()) else {
            return Ok(());
        };
        let resp = self
            .client
            .post(&self.cfg.revoke_url)
            .header(USER_AGENT, self.cfg.user_agent.as_str())
            .basic_auth(&self.cfg.client_id, Some(self.cfg.client_secret.as_str()))
            .form(&[("token", refresh), ("token_type_hint", "refresh_token")])
            .send()
            .context("auth: revoke request")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            bail!("auth: revoke failed with {status}: {body}");
        }
        info!("auth: refresh token revoked");
        Ok(())
    }

    fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenResponse, ApiError> {
        let resp = self
            .client
            .post(&self.cfg.token_url)
            .header(USER_AGENT, self.cfg.user_agent.as_str())
            .basic_auth(&self.cfg.client_id, Some(self.cfg.client_secret.as_str()))
            .form(form)
            .send()?;

        let status = resp.status();
        let body = resp.text()?;
        if !status.is_success() {
            let body = match serde_json::from_str::<TokenError>(&body) {
                Ok(err) => err.to_string(),
                Err(_) => body,
            };
            warn!("auth: token endpoint answered {status}");
            return Err(ApiError::Http {
                code: status.as_u16(),
                body,
            });
        }

        let payload: TokenResponse = serde_json::from_str(&body)?;
        if payload.access_token.is_empty() {
            // Reddit reports some grant failures as 200 with an `error` field.
            let reason = payload
                .error
                .clone()
                .unwrap_or_else(|| "missing access token".into());
            return Err(ApiError::Decode(format!("token response: {reason}")));
        }
        Ok(payload)
    }
}

impl TokenGrants for Flow {
    fn refresh(&self, current: &AccessToken) -> Result<AccessToken, ApiError> {
        self.refresh_grant(current)
    }

    fn anonymous(&self, device_id: &str) -> Result<AccessToken, ApiError> {
        self.anonymous_grant(device_id)
    }
}

fn random_string(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn handle_redirect(req: tiny_http::Request, state: &str) -> Result<String> {
    let refuse = |req: tiny_http::Request, status: u16, text: &str| {
        let _ = req.respond(Response::from_string(text).with_status_code(status));
    };

    if req.method() != &Method::Get {
        refuse(req, 405, "method not allowed");
        bail!("auth: unexpected redirect method");
    }

    let url = Url::parse(&format!("http://loopback{}", req.url()))?;
    let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
    if params.get("state").map(String::as_str) != Some(state) {
        refuse(req, 400, "state mismatch");
        bail!("auth: authorization state mismatch");
    }

    if let Some(error) = params.get("error") {
        refuse(req, 401, "authorization denied");
        bail!("auth: authorization error: {error}");
    }

    let Some(code) = params.get("code").filter(|code| !code.is_empty()) else {
        refuse(req, 400, "code missing");
        bail!("auth: authorization code missing");
    };

    let response = Response::from_string(HTML_SUCCESS.as_str()).with_header(
        Header::from_bytes(&b"Content-Type"[..], &b"text/html; charset=utf-8"[..])
            .expect("valid header"),
    );
    let _ = req.respond(response);
    Ok(code.clone())
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: String,
    #[serde(default)]
    error: Option<String>,
}

impl TokenResponse {
    fn into_token(
        self,
        refresh_token: Option<String>,
        device_id: Option<String>,
        fallback_scope: &[String],
    ) -> AccessToken {
        let scope = if self.scope.trim().is_empty() {
            fallback_scope.join(" ")
        } else {
            self.scope
        };
        let expires_in = if self.expires_in <= 0 {
            DEFAULT_EXPIRES_IN
        } else {
            self.expires_in
        };
        let mut token = match (refresh_token, device_id) {
            (Some(refresh), _) => AccessToken::user(self.access_token, scope, refresh, expires_in),
            (None, device) => AccessToken::anonymous(
                self.access_token,
                scope,
                expires_in,
                device.unwrap_or_default(),
            ),
        };
        if let Some(kind) = self.token_type.filter(|kind| !kind.is_empty()) {
            token.token_type = kind;
        }
        token
    }
}

#[derive(Debug, Deserialize)]
struct TokenError {
    #[serde(default)]
    error: String,
    #[serde(default, rename = "error_description")]
    description: String,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.error.is_empty(), self.description.is_empty()) {
            (true, true) => write!(f, "unknown token error"),
            (false, true) => write!(f, "authorization error: {}", self.error),
            (true, false) => write!(f, "authorization error: {}", self.description),
            (false, false) => write!(
                f,
                "authorization error: {} ({})",
                self.error, self.description
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockServer, Reply};
    use crate::token::MemoryStore;

    fn flow(token_url: &str) -> (Flow, Arc<TokenManager>) {
        let tokens = Arc::new(TokenManager::load(Arc::new(MemoryStore::new()), None));
        let cfg = Config {
            client_id: "client-abc".into(),
            token_url: token_url.into(),
            revoke_url: token_url.replace("access_token", "revoke_token"),
            redirect_uri: "http://127.0.0.1:0/redlurk/callback".into(),
            timeout: Duration::from_secs(5),
            login_timeout: Duration::from_secs(10),
            ..Config::default()
        };
        (Flow::new(tokens.clone(), cfg).unwrap(), tokens)
    }

    #[test]
    fn code_challenge_matches_rfc_7636_example() {
        assert_eq!(
            code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeKt8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn authorize_url_requests_permanent_pkce_grant() {
        let (flow, _) = flow("http://127.0.0.1:9/api/v1/access_token");
        let url = Url::parse(
            &flow
                .authorize_url("http://127.0.0.1:4000/cb", "state-1", "challenge-1")
                .unwrap(),
        )
        .unwrap();
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["duration"], "permanent");
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["client_id"], "client-abc");
        assert!(params["scope"].contains("vote"));
    }

    #[test]
    fn refresh_keeps_refresh_token_when_not_rotated() {
        let server = MockServer::scripted(vec![Reply::json(
            200,
            r#"{"access_token": "9-new", "token_type": "bearer", "expires_in": 86400, "scope": "read vote"}"#,
        )]);
        let (flow, _) = flow(&format!("{}api/v1/access_token", server.base_url));

        let current = AccessToken::user("9-old", "read vote", "refresh-xyz", 3600);
        let refreshed = flow.refresh_grant(&current).unwrap();
        assert_eq!(refreshed.access_token, "9-new");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("refresh-xyz"));
        assert_eq!(refreshed.expires_in, 86400);

        let seen = &server.seen()[0];
        assert_eq!(seen.path(), "/api/v1/access_token");
        assert_eq!(seen.form_value("grant_type").as_deref(), Some("refresh_token"));
        assert_eq!(seen.form_value("refresh_token").as_deref(), Some("refresh-xyz"));
        let basic = base64::engine::general_purpose::STANDARD.encode("client-abc:");
        assert_eq!(seen.authorization, Some(format!("Basic {basic}")));
    }

    #[test]
    fn anonymous_grant_binds_device_id() {
        let server = MockServer::scripted(vec![Reply::json(
            200,
            r#"{"access_token": "-anon", "token_type": "bearer", "expires_in": 3600, "scope": "*"}"#,
        )]);
        let (flow, _) = flow(&format!("{}api/v1/access_token", server.base_url));

        let token = flow.anonymous_grant("device-0123456789abcdefghij").unwrap();
        assert!(token.is_anonymous());
        assert_eq!(token.device_id.as_deref(), Some("device-0123456789abcdefghij"));
        assert_eq!(token.user_id(), None);

        let seen = &server.seen()[0];
        assert_eq!(
            seen.form_value("grant_type").as_deref(),
            Some(INSTALLED_CLIENT_GRANT)
        );
    }

    #[test]
    fn rejected_grant_keeps_status_and_reason() {
        let server = MockServer::scripted(vec![Reply::json(
            400,
            r#"{"error": "invalid_grant"}"#,
        )]);
        let (flow, _) = flow(&format!("{}api/v1/access_token", server.base_url));

        let err = flow
            .refresh_grant(&AccessToken::user("1-a", "", "bad", 60))
            .unwrap_err();
        assert_eq!(err.code(), 400);
        assert!(err.to_string().contains("invalid_grant"));
    }

    #[test]
    fn refresh_without_refresh_token_is_rejected_locally() {
        let (flow, _) = flow("http://127.0.0.1:9/api/v1/access_token");
        let err = flow
            .refresh_grant(&AccessToken::anonymous("-a", "*", 60, "device"))
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidCredential));
    }

    #[test]
    fn browser_login_stores_user_credential() {
        let server = MockServer::scripted(vec![Reply::json(
            200,
            r#"{"access_token": "5-user", "token_type": "bearer", "expires_in": 3600, "refresh_token": "r-5", "scope": "identity read"}"#,
        )]);
        let (flow, tokens) = flow(&format!("{}api/v1/access_token", server.base_url));

        let authz = flow.begin().unwrap();
        let browser = Url::parse(&authz.browser_url).unwrap();
        let state = browser
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        let callback = format!("{}?state={}&code=code-1", authz.redirect_uri, state);
        let browser_thread = thread::spawn(move || reqwest::blocking::get(callback).map(|r| r.status()));

        let token = flow.complete(authz).unwrap();
        assert_eq!(browser_thread.join().unwrap().unwrap().as_u16(), 200);
        assert_eq!(token.user_id(), Some(5));
        assert_eq!(tokens.get_token().access_token, "5-user");

        let seen = &server.seen()[0];
        assert_eq!(seen.form_value("code").as_deref(), Some("code-1"));
        assert!(seen.form_value("code_verifier").is_some());
    }

    #[test]
    fn login_with_wrong_state_fails() {
        let (flow, tokens) = flow("http://127.0.0.1:9/api/v1/access_token");
        let authz = flow.begin().unwrap();
        let callback = format!("{}?state=forged&code=code-1", authz.redirect_uri);
        let browser_thread = thread::spawn(move || reqwest::blocking::get(callback).map(|r| r.status()));

        let err = flow.complete(authz).unwrap_err();
        assert!(err.to_string().contains("state mismatch"));
        assert_eq!(browser_thread.join().unwrap().unwrap().as_u16(), 400);
        assert!(!tokens.get_token().has_token());
    }

    #[test]
    fn revoke_skips_anonymous_credentials() {
        let (flow, _) = flow("http://127.0.0.1:9/api/v1/access_token");
        flow.revoke(&AccessToken::anonymous("-a", "*", 60, "device"))
            .unwrap();
    }
}
