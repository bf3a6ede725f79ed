//! The OAuth credential and the process-wide holder of the current one.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TOKEN_TYPE: &str = "bearer";

/// Reddit accepts device ids between 20 and 30 characters.
const DEVICE_ID_LEN: usize = 30;

/// A bearer credential, either for a logged-in user (refresh token present)
/// or anonymous (device id present, no refresh token).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    #[serde(default)]
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds, relative to `issued_at`. Zero never expires.
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub issued_at: DateTime<Utc>,
}

fn default_token_type() -> String {
    DEFAULT_TOKEN_TYPE.to_string()
}

impl AccessToken {
    pub fn user(
        access_token: impl Into<String>,
        scope: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in: i64,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            scope: scope.into(),
            refresh_token: Some(refresh_token.into()),
            expires_in,
            device_id: None,
            issued_at: Utc::now(),
        }
    }

    pub fn anonymous(
        access_token: impl Into<String>,
        scope: impl Into<String>,
        expires_in: i64,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            scope: scope.into(),
            refresh_token: None,
            expires_in,
            device_id: Some(device_id.into()),
            issued_at: Utc::now(),
        }
    }

    /// Credential reported when nothing is stored: anonymous, without a token string.
    pub fn placeholder(device_id: impl Into<String>) -> Self {
        Self::anonymous(String::new(), String::new(), 0, device_id)
    }

    pub fn is_user(&self) -> bool {
        self.refresh_token
            .as_deref()
            .map(|token| !token.is_empty())
            .unwrap_or(false)
    }

    pub fn is_anonymous(&self) -> bool {
        !self.is_user()
    }

    pub fn has_token(&self) -> bool {
        !self.access_token.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        let has_device = self
            .device_id
            .as_deref()
            .map(|id| !id.is_empty())
            .unwrap_or(false);
        if !self.is_user() && !has_device {
            bail!("token: credential has neither refresh token nor device id");
        }
        Ok(())
    }

    /// Account id encoded as the numeric prefix of user tokens (`"1234-abcd"`).
    /// `None` is the "no user id" sentinel and is always returned for anonymous credentials.
    pub fn user_id(&self) -> Option<u64> {
        if !self.is_user() {
            return None;
        }
        let (prefix, _) = self.access_token.split_once('-')?;
        if prefix.is_empty() {
            return None;
        }
        prefix.parse().ok()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.expires_in <= 0 {
            return None;
        }
        // A lifetime too large to represent is treated as never expiring.
        chrono::Duration::try_seconds(self.expires_in)
            .and_then(|lifetime| self.issued_at.checked_add_signed(lifetime))
    }

    pub fn is_expired(&self, skew: Duration) -> bool {
        let Some(expires_at) = self.expires_at() else {
            return false;
        };
        let skew = chrono::Duration::from_std(skew).unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() >= expires_at - skew
    }

    pub fn scopes(&self) -> Vec<&str> {
        self.scope.split_whitespace().collect()
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.split_whitespace().any(|s| s == scope)
    }

    pub fn authorization_header(&self) -> String {
        let mut chars = self.token_type.chars();
        let kind = match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
            None => "Bearer".to_string(),
        };
        format!("{} {}", kind, self.access_token)
    }
}

pub fn random_device_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(DEVICE_ID_LEN)
        .map(char::from)
        .collect()
}

/// Durable slot holding at most one credential.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<AccessToken>>;
    fn save(&self, token: &AccessToken) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    slot: Mutex<Option<AccessToken>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn load(&self) -> Result<Option<AccessToken>> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, token: &AccessToken) -> Result<()> {
        *self.slot.lock() = Some(token.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot.lock() = None;
        Ok(())
    }
}

/// Single source of truth for the current credential.
///
/// The in-memory value and the durable copy are updated under one lock, so
/// concurrent writers serialize and readers only ever see a whole credential.
pub struct TokenManager {
    store: Arc<dyn CredentialStore>,
    current: Mutex<Option<AccessToken>>,
    device_id: String,
}

impl TokenManager {
    /// Reads the stored credential. A store that cannot be read leaves the
    /// manager in the anonymous placeholder state.
    pub fn load(store: Arc<dyn CredentialStore>, device_id: Option<String>) -> Self {
        let stored = match store.load() {
            Ok(stored) => stored,
            Err(err) => {
                warn!("token: failed to read stored credential: {err:#}");
                None
            }
        };
        let stored = stored.filter(|token| match token.validate() {
            Ok(()) => true,
            Err(err) => {
                warn!("token: discarding stored credential: {err:#}");
                false
            }
        });

        let device_id = device_id
            .filter(|id| !id.trim().is_empty())
            .or_else(|| stored.as_ref().and_then(|token| token.device_id.clone()))
            .unwrap_or_else(random_device_id);

        if let Some(token) = stored.as_ref() {
            debug!(
                "token: loaded {} credential",
                if token.is_user() { "user" } else { "anonymous" }
            );
        }

        Self {
            store,
            current: Mutex::new(stored),
            device_id,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn get_token(&self) -> AccessToken {
        self.current
            .lock()
            .clone()
            .unwrap_or_else(|| AccessToken::placeholder(self.device_id.clone()))
    }

    pub fn save_token(&self, token: AccessToken) -> Result<()> {
        token.validate()?;
        let mut current = self.current.lock();
        self.store.save(&token)?;
        info!(
            "token: saved {} credential",
            if token.is_user() { "user" } else { "anonymous" }
        );
        *current = Some(token);
        Ok(())
    }

    /// Stores `token` only if the current access token still equals `expected`.
    /// Returns whether the swap happened.
    pub fn replace_if_current(&self, expected: &str, token: AccessToken) -> Result<bool> {
        token.validate()?;
        let mut current = self.current.lock();
        let current_access = current
            .as_ref()
            .map(|token| token.access_token.as_str())
            .unwrap_or_default();
        if current_access != expected {
            debug!("token: credential changed underneath a refresh, keeping the newer one");
            return Ok(false);
        }
        self.store.save(&token)?;
        *current = Some(token);
        Ok(true)
    }

    pub fn remove_token(&self) -> Result<()> {
        let mut current = self.current.lock();
        self.store.clear()?;
        *current = None;
        info!("token: credential removed");
        Ok(())
    }
}
