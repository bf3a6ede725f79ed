//! Test doubles: a scripted local HTTP server, canned token grants and a
//! credential store that counts writes.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use parking_lot::Mutex;
use tiny_http::{Header, Response, Server};

use crate::error::ApiError;
use crate::pipeline::TokenGrants;
use crate::token::{AccessToken, CredentialStore, MemoryStore};

#[derive(Debug, Clone)]
pub struct Seen {
    pub method: String,
    pub url: String,
    pub authorization: Option<String>,
    pub user_agent: Option<String>,
    pub body: String,
}

impl Seen {
    pub fn path(&self) -> &str {
        self.url.split('?').next().unwrap_or_default()
    }

    pub fn query_value(&self, key: &str) -> Option<String> {
        let url = url::Url::parse(&format!("http://mock{}", self.url)).ok()?;
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    pub fn form_value(&self, key: &str) -> Option<String> {
        url::form_urlencoded::parse(self.body.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl Reply {
    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: vec![("Content-Type".into(), "application/json".into())],
        }
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

pub struct MockServer {
    pub base_url: String,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl MockServer {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&Seen) -> Reply + Send + 'static,
    {
        let server = Server::http("127.0.0.1:0").expect("bind mock server");
        let base_url = format!("http://{}/", server.server_addr());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        thread::spawn(move || {
            for mut request in server.incoming_requests() {
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                let header = |name: &'static str| {
                    request
                        .headers()
                        .iter()
                        .find(|h| h.field.equiv(name))
                        .map(|h| h.value.as_str().to_string())
                };
                let entry = Seen {
                    method: request.method().to_string(),
                    url: request.url().to_string(),
                    authorization: header("Authorization"),
                    user_agent: header("User-Agent"),
                    body,
                };
                let reply = handler(&entry);
                log.lock().push(entry);

                let mut response = Response::from_string(reply.body).with_status_code(reply.status);
                for (key, value) in reply.headers {
                    if let Ok(header) = Header::from_bytes(key.as_bytes(), value.as_bytes()) {
                        response.add_header(header);
                    }
                }
                let _ = request.respond(response);
            }
        });

        Self { base_url, seen }
    }

    /// Answers requests with `replies` in order, then with 599.
    pub fn scripted(replies: Vec<Reply>) -> Self {
        let queue = Mutex::new(VecDeque::from(replies));
        Self::start(move |_| {
            queue
                .lock()
                .pop_front()
                .unwrap_or_else(|| Reply::json(599, "script exhausted"))
        })
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    pub fn hits(&self) -> usize {
        self.seen.lock().len()
    }
}

#[derive(Default)]
pub struct FakeGrants {
    pub refresh_calls: AtomicUsize,
    pub anonymous_calls: AtomicUsize,
    refresh_with: Option<AccessToken>,
    anonymous_with: Option<AccessToken>,
}

impl FakeGrants {
    pub fn refreshing_to(token: AccessToken) -> Self {
        Self {
            refresh_with: Some(token),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self::default()
    }

    pub fn with_anonymous(mut self, token: AccessToken) -> Self {
        self.anonymous_with = Some(token);
        self
    }
}

impl TokenGrants for FakeGrants {
    fn refresh(&self, _current: &AccessToken) -> Result<AccessToken, ApiError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refresh_with.clone().ok_or_else(|| ApiError::Http {
            code: 400,
            body: r#"{"error": "invalid_grant"}"#.into(),
        })
    }

    fn anonymous(&self, _device_id: &str) -> Result<AccessToken, ApiError> {
        self.anonymous_calls.fetch_add(1, Ordering::SeqCst);
        self.anonymous_with.clone().ok_or_else(|| ApiError::Http {
            code: 401,
            body: "unauthorized client".into(),
        })
    }
}

/// Memory-backed store that counts saves made after seeding.
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryStore,
    saves: AtomicUsize,
}

impl CountingStore {
    pub fn seed(&self, token: AccessToken) {
        let _ = self.inner.save(&token);
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn load_current(&self) -> Option<AccessToken> {
        self.inner.load().ok().flatten()
    }
}

impl CredentialStore for CountingStore {
    fn load(&self) -> Result<Option<AccessToken>> {
        self.inner.load()
    }

    fn save(&self, token: &AccessToken) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(token)
    }

    fn clear(&self) -> Result<()> {
        self.inner.clear()
    }
}
