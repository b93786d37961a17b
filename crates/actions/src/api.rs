//! Direct action execution against the home-automation server.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    async_trait::async_trait,
    dashmap::DashMap,
    hearth_config::{HearthConfig, ServerEntry},
    hearth_onboarding::{
        SharedTrust, TransportError, TrustStore,
        identity::{ClientIdentity, import_pkcs12_file},
        tls::{self, TlsObservations},
    },
    rustls::RootCertStore,
    secrecy::{ExposeSecret, Secret},
    serde_json::json,
    tracing::{debug, warn},
    url::Url,
};

use crate::action::Action;

const ACTION_FIRED_PATH: &str = "api/events/ios.action_fired";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A server resolved from config, with the trust the user granted it.
#[derive(Clone)]
pub struct ServerEndpoint {
    pub id: String,
    pub base_url: Url,
    pub token: Option<Secret<String>>,
    pub trust: TrustStore,
    pub client_identity: Option<PathBuf>,
}

impl fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerEndpoint")
            .field("id", &self.id)
            .field("base_url", &self.base_url.as_str())
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("trusted_certificates", &self.trust.exceptions().count())
            .field("client_identity", &self.client_identity)
            .finish()
    }
}

impl ServerEndpoint {
    pub fn from_entry(id: &str, entry: &ServerEntry) -> Result<Self, url::ParseError> {
        Ok(Self {
            id: id.to_string(),
            base_url: Url::parse(&entry.url)?,
            token: entry.token.clone(),
            trust: TrustStore::from_fingerprints(
                entry.trusted_certificates.iter().map(String::as_str),
            ),
            client_identity: entry.client_identity.clone(),
        })
    }

    /// Endpoint that records a fired action.
    pub fn action_url(&self) -> Result<Url, url::ParseError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}/{ACTION_FIRED_PATH}"))
    }
}

/// Servers known to the dispatcher, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ServerDirectory {
    servers: HashMap<String, ServerEndpoint>,
}

impl ServerDirectory {
    pub fn from_config(config: &HearthConfig) -> Self {
        let servers = config
            .servers
            .iter()
            .filter_map(|(id, entry)| match ServerEndpoint::from_entry(id, entry) {
                Ok(endpoint) => Some((id.clone(), endpoint)),
                Err(e) => {
                    warn!(server = %id, url = %entry.url, error = %e, "skipping server with invalid url");
                    None
                },
            })
            .collect();
        Self { servers }
    }

    pub fn insert(&mut self, endpoint: ServerEndpoint) {
        self.servers.insert(endpoint.id.clone(), endpoint);
    }

    pub fn resolve(&self, id: &str) -> Option<&ServerEndpoint> {
        self.servers.get(id)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// Fires an action on its server.
#[async_trait]
pub trait ActionApi: Send + Sync {
    async fn execute(
        &self,
        server: &ServerEndpoint,
        action: &Action,
        origin: &str,
    ) -> Result<(), TransportError>;
}

/// [`ActionApi`] over HTTPS with the server's persisted trust. Never prompts.
///
/// Client identities are read from disk on first use and kept for the life
/// of the value.
#[derive(Debug, Clone)]
pub struct HttpActionApi {
    timeout: Duration,
    roots: Arc<RootCertStore>,
    identities: Arc<DashMap<PathBuf, ClientIdentity>>,
}

impl Default for HttpActionApi {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl HttpActionApi {
    pub fn new(timeout: Duration) -> Self {
        Self::with_roots(timeout, tls::default_roots())
    }

    pub fn with_roots(timeout: Duration, roots: RootCertStore) -> Self {
        Self {
            timeout,
            roots: Arc::new(roots),
            identities: Arc::new(DashMap::new()),
        }
    }

    async fn identity(&self, path: &Path) -> Result<ClientIdentity, TransportError> {
        if let Some(identity) = self.identities.get(path).map(|entry| entry.value().clone()) {
            return Ok(identity);
        }
        let identity = import_pkcs12_file(path)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        self.identities.insert(path.to_path_buf(), identity.clone());
        Ok(identity)
    }

    async fn client(&self, server: &ServerEndpoint) -> Result<reqwest::Client, TransportError> {
        let trust = SharedTrust::new(server.trust.clone());
        if let Some(path) = &server.client_identity {
            trust.set_identity(self.identity(path).await?);
        }
        let host = server.base_url.host_str().unwrap_or_default();
        let tls = tls::client_config(
            host,
            RootCertStore::clone(&self.roots),
            trust,
            Arc::new(TlsObservations::default()),
        )
        .map_err(|e| TransportError::Tls(e.to_string()))?;

        reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .timeout(self.timeout)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))
    }
}

#[async_trait]
impl ActionApi for HttpActionApi {
    async fn execute(
        &self,
        server: &ServerEndpoint,
        action: &Action,
        origin: &str,
    ) -> Result<(), TransportError> {
        let url = server
            .action_url()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let client = self.client(server).await?;

        let mut request = client.post(url).json(&json!({
            "actionID": action.id,
            "actionName": action.name,
            "triggerSource": origin,
        }));
        if let Some(token) = &server.token {
            request = request.bearer_auth(token.expose_secret());
        }

        debug!(server = %server.id, action_id = %action.id, %origin, "firing action directly");
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.bytes().await.ok().filter(|b| !b.is_empty());
        Err(TransportError::Status { status, body })
    }
}
