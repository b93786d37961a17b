use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use {
    thiserror::Error,
    tokio::sync::{oneshot, watch},
    tracing::debug,
};

use crate::{error::AuthError, trust::Fingerprint};

// ── Types ────────────────────────────────────────────────────────────────────

/// Identifier of one in-flight request within a probe session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Outcome of evaluating a server certificate that failed validation.
#[derive(Debug, Clone)]
pub struct ServerTrustEvaluation {
    pub host: String,
    pub fingerprint: Fingerprint,
    /// DER of the leaf certificate.
    pub certificate: Vec<u8>,
    /// Top-level error first, then its underlying cause when there is one.
    pub errors: Vec<String>,
}

impl ServerTrustEvaluation {
    pub fn new(host: impl Into<String>, certificate: &[u8], error: &dyn std::error::Error) -> Self {
        let mut errors = vec![error.to_string()];
        if let Some(cause) = error.source() {
            errors.push(cause.to_string());
        }
        Self {
            host: host.into(),
            fingerprint: Fingerprint::of(certificate),
            certificate: certificate.to_vec(),
            errors,
        }
    }
}

/// An authentication challenge raised by the transport mid-request.
#[derive(Debug, Clone)]
pub enum Challenge {
    /// The server certificate failed standard validation.
    ServerTrust(ServerTrustEvaluation),
    /// The server asked for HTTP basic credentials.
    HttpBasic { realm: Option<String> },
    /// The server requested a client certificate during the handshake and the
    /// request failed.
    ClientCertificate { host: String, error: String },
    /// Any other authentication scheme.
    Unsupported { method: String },
}

impl Challenge {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServerTrust(_) => "server_trust",
            Self::HttpBasic { .. } => "http_basic",
            Self::ClientCertificate { .. } => "client_certificate",
            Self::Unsupported { .. } => "unsupported",
        }
    }

    /// The failure that stands when the challenge gets default handling.
    pub(crate) fn default_failure(&self) -> AuthError {
        match self {
            Self::ServerTrust(evaluation) => AuthError::SslUntrusted(evaluation.errors.clone()),
            Self::HttpBasic { .. } => AuthError::BasicAuth,
            Self::ClientCertificate { error, .. } => {
                AuthError::Other(crate::error::TransportError::Request(error.clone()))
            },
            Self::Unsupported { method } => AuthError::AuthenticationUnsupported(method.clone()),
        }
    }
}

/// How a challenge was settled.
#[derive(Debug)]
pub enum Resolution {
    /// Credentials changed (exception added or identity imported); issue the
    /// request again.
    Retry,
    /// Continue without a credential; the transport's own failure stands.
    UseDefault,
    /// Fail the request with this error.
    Reject(AuthError),
    /// The session went away before a decision was made.
    Cancelled,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("{0} already has an outstanding challenge")]
    AlreadyPending(TaskId),
    #[error("the probe session is closed")]
    Closed,
}

// ── Pending challenges ───────────────────────────────────────────────────────

#[derive(Default)]
struct PendingState {
    resolvers: HashMap<TaskId, oneshot::Sender<Resolution>>,
    client_certificate: HashSet<TaskId>,
    closed: bool,
}

/// Per-session table correlating in-flight tasks with the resolver awaiting
/// their challenge decision. At most one resolver per task; each is consumed
/// exactly once.
pub struct PendingChallenges {
    state: Mutex<PendingState>,
    closed: watch::Sender<bool>,
}

impl Default for PendingChallenges {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            closed: watch::channel(false).0,
        }
    }
}

impl PendingChallenges {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park `task` until its challenge is resolved.
    pub fn register(&self, task: TaskId) -> Result<oneshot::Receiver<Resolution>, ChallengeError> {
        let mut state = self.lock();
        if state.closed {
            return Err(ChallengeError::Closed);
        }
        if state.resolvers.contains_key(&task) {
            return Err(ChallengeError::AlreadyPending(task));
        }
        let (tx, rx) = oneshot::channel();
        state.resolvers.insert(task, tx);
        Ok(rx)
    }

    /// Deliver the decision for `task`. Returns false when nothing was waiting,
    /// i.e. the challenge was already settled or cancelled.
    pub fn resolve(&self, task: TaskId, resolution: Resolution) -> bool {
        let Some(tx) = self.lock().resolvers.remove(&task) else {
            return false;
        };
        tx.send(resolution).is_ok()
    }

    /// Note that `task` met a client-certificate request, so its eventual
    /// failure is reported as [`AuthError::ClientCertificateRequired`].
    pub fn mark_client_certificate(&self, task: TaskId) {
        self.lock().client_certificate.insert(task);
    }

    pub fn client_certificate_requested(&self, task: TaskId) -> bool {
        self.lock().client_certificate.contains(&task)
    }

    pub fn outstanding(&self) -> usize {
        self.lock().resolvers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Completes once the session has been closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Refuse new registrations and cancel every outstanding resolver.
    /// Returns how many were cancelled.
    pub fn close(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.lock();
            state.closed = true;
            state.resolvers.drain().collect()
        };
        self.closed.send_replace(true);
        let count = drained.len();
        for (task, tx) in drained {
            debug!(%task, "cancelling outstanding challenge");
            let _ = tx.send(Resolution::Cancelled);
        }
        count
    }
}
