//! HTTP exchange used by the connectivity probe.
//!
//! Each exchange runs on its own short-lived client so no connection or TLS
//! session outlives the probe. Challenges come back as [`Exchange::Challenged`]
//! rather than errors; the probe decides what to do with them.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    bytes::Bytes,
    hearth_config::ProbeConfig,
    reqwest::{
        ClientBuilder, Method, StatusCode,
        header::{HeaderMap, HeaderName, HeaderValue, WWW_AUTHENTICATE},
    },
    rustls::RootCertStore,
    tracing::{debug, warn},
    url::Url,
};

use crate::{
    challenge::Challenge,
    error::TransportError,
    tls::{self, TlsObservations},
    trust::SharedTrust,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

// ── Request / response ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
}

impl ProbeRequest {
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Result of one attempt at a request.
#[derive(Debug)]
pub enum Exchange {
    Response(ProbeResponse),
    /// The server challenged the request; nothing was retried.
    Challenged(Challenge),
    Failed(TransportError),
}

/// Performs a single request with the given trust. Implementations must not
/// prompt or retry.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn exchange(&self, request: &ProbeRequest, trust: &SharedTrust) -> Exchange;
}

// ── Session options ──────────────────────────────────────────────────────────

pub type ClientCustomizer = Arc<dyn Fn(ClientBuilder) -> ClientBuilder + Send + Sync>;

/// Client settings applied to every exchange before dispatch.
#[derive(Clone)]
pub struct SessionOptions {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub headers: HeaderMap,
    /// Last-word adjustment of the client builder.
    pub customizer: Option<ClientCustomizer>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            user_agent: None,
            headers: HeaderMap::new(),
            customizer: None,
        }
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .field("headers", &self.headers.len())
            .field("customizer", &self.customizer.is_some())
            .finish()
    }
}

impl SessionOptions {
    pub fn from_config(config: &ProbeConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            user_agent: config.user_agent.clone(),
            headers: header_map(&config.headers),
            customizer: None,
        }
    }

    pub fn with_customizer(
        mut self,
        customizer: impl Fn(ClientBuilder) -> ClientBuilder + Send + Sync + 'static,
    ) -> Self {
        self.customizer = Some(Arc::new(customizer));
        self
    }
}

fn header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            },
            _ => warn!(header = %name, "skipping invalid probe header"),
        }
    }
    map
}

// ── HTTP transport ───────────────────────────────────────────────────────────

/// [`ProbeTransport`] over reqwest with the exception-aware rustls config.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    options: SessionOptions,
    roots: RootCertStore,
}

impl HttpTransport {
    pub fn new(options: SessionOptions) -> Self {
        Self::with_roots(options, tls::default_roots())
    }

    pub fn with_roots(options: SessionOptions, roots: RootCertStore) -> Self {
        Self { options, roots }
    }

    fn client(
        &self,
        host: &str,
        trust: &SharedTrust,
        observations: Arc<TlsObservations>,
    ) -> Result<reqwest::Client, TransportError> {
        let tls = tls::client_config(host, self.roots.clone(), trust.clone(), observations)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let mut builder = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .timeout(self.options.timeout)
            .pool_max_idle_per_host(0)
            .default_headers(self.options.headers.clone());
        if let Some(user_agent) = &self.options.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if let Some(customize) = &self.options.customizer {
            builder = customize(builder);
        }
        builder
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))
    }
}

#[async_trait]
impl ProbeTransport for HttpTransport {
    async fn exchange(&self, request: &ProbeRequest, trust: &SharedTrust) -> Exchange {
        let host = request.url.host_str().unwrap_or_default().to_string();
        let observations = Arc::new(TlsObservations::default());
        let client = match self.client(&host, trust, Arc::clone(&observations)) {
            Ok(client) => client,
            Err(e) => return Exchange::Failed(e),
        };

        debug!(url = %request.url, method = %request.method, "sending probe request");
        let sent = client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(error) => {
                let chain = error_chain(&error);
                if let Some(evaluation) = observations.take_untrusted() {
                    return Exchange::Challenged(Challenge::ServerTrust(evaluation));
                }
                if observations.client_certificate_requested() {
                    return Exchange::Challenged(Challenge::ClientCertificate {
                        host,
                        error: chain,
                    });
                }
                debug!(url = %request.url, error = %chain, "probe request failed");
                return Exchange::Failed(TransportError::Request(chain));
            },
        };

        let status = response.status();
        let headers = response.headers().clone();
        if status == StatusCode::UNAUTHORIZED
            && let Some(challenge) = headers
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(parse_www_authenticate)
        {
            debug!(url = %request.url, kind = challenge.kind(), "server challenged probe");
            return Exchange::Challenged(challenge);
        }

        match response.bytes().await {
            Ok(body) => Exchange::Response(ProbeResponse {
                status,
                headers,
                body,
            }),
            Err(error) => Exchange::Failed(TransportError::Request(error_chain(&error))),
        }
    }
}

/// Classify a `WWW-Authenticate` value by its scheme.
pub(crate) fn parse_www_authenticate(value: &str) -> Challenge {
    let value = value.trim();
    let (scheme, params) = value.split_once(' ').unwrap_or((value, ""));
    if scheme.eq_ignore_ascii_case("basic") {
        let realm = params
            .split(',')
            .find_map(|param| {
                let (key, value) = param.trim().split_once('=')?;
                key.eq_ignore_ascii_case("realm")
                    .then(|| value.trim_matches('"').to_string())
            });
        Challenge::HttpBasic { realm }
    } else {
        Challenge::Unsupported {
            method: scheme.to_string(),
        }
    }
}

/// Error message followed by every underlying cause.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
