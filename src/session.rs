use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::auth::{AuthorizationRequest, Flow as AuthFlow};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::listing::User;
use crate::pipeline::Pipeline;
use crate::reddit;
use crate::storage;
use crate::token::{AccessToken, CredentialStore, MemoryStore, TokenManager};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("reddit.client_id is not configured")]
    MissingClientId,
    #[error("not logged in")]
    NotLoggedIn,
}

/// Owns every long-lived collaborator: the credential, the grant flow, the
/// request pipeline, the request models and the worker pool.
pub struct Session {
    tokens: Arc<TokenManager>,
    flow: Arc<AuthFlow>,
    client: Arc<reddit::Client>,
    dispatcher: Dispatcher,
}

impl Session {
    /// Opens the configured credential store and wires the rest on top.
    pub fn open(cfg: &Config) -> Result<Self> {
        let store: Arc<dyn CredentialStore> = match cfg.storage.path.clone() {
            Some(path) => Arc::new(
                storage::Store::open(storage::Options { path: Some(path) })
                    .context("open storage")?,
            ),
            None => Arc::new(MemoryStore::new()),
        };
        Self::with_store(cfg, store)
    }

    pub fn with_store(cfg: &Config, store: Arc<dyn CredentialStore>) -> Result<Self> {
        if cfg.reddit.client_id.trim().is_empty() {
            return Err(SessionError::MissingClientId.into());
        }
        let tokens = Arc::new(TokenManager::load(store, cfg.reddit.device_id.clone()));
        let flow = Arc::new(AuthFlow::new(tokens.clone(), cfg.auth())?);
        let pipeline = Arc::new(Pipeline::new(tokens.clone(), flow.clone(), cfg.pipeline())?);
        let client = Arc::new(reddit::Client::new(pipeline));
        let dispatcher = Dispatcher::new(cfg.dispatch());

        Ok(Self {
            tokens,
            flow,
            client,
            dispatcher,
        })
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn client(&self) -> &Arc<reddit::Client> {
        &self.client
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn begin_login(&self) -> Result<AuthorizationRequest> {
        self.flow.begin()
    }

    pub fn complete_login(&self, authz: AuthorizationRequest) -> Result<AccessToken> {
        self.flow.complete(authz)
    }

    /// Revokes the refresh token if possible and forgets the credential.
    pub fn logout(&self) -> Result<()> {
        let current = self.tokens.get_token();
        if !current.is_user() {
            return Err(SessionError::NotLoggedIn.into());
        }
        if let Err(err) = self.flow.revoke(&current) {
            warn!("session: revoke failed: {err:#}");
        }
        self.tokens.remove_token().context("remove credential")?;
        info!("session: logged out");
        Ok(())
    }

    /// The logged-in account, or `None` while browsing anonymously.
    pub fn whoami(&self) -> Result<Option<User>> {
        if !self.tokens.get_token().is_user() {
            return Ok(None);
        }
        let me = self.client.me().context("fetch account")?;
        Ok(Some(me))
    }
}
