use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    async_trait::async_trait,
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::{debug, info, warn},
};

use crate::{
    challenge::{Challenge, PendingChallenges, Resolution, ServerTrustEvaluation, TaskId},
    error::{AuthError, IdentityError},
    identity::import_pkcs12_file,
    trust::SharedTrust,
};

/// Queue depth for challenges waiting for the user.
const CHALLENGE_QUEUE: usize = 16;

// ── Prompt ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    Accept,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateChoice {
    /// Import the PKCS#12 file at this path.
    Import(PathBuf),
    ContinueWithout,
}

/// The interactive side of trust negotiation. Each call may wait on the user
/// for as long as it takes.
#[async_trait]
pub trait TrustPrompt: Send + Sync {
    /// The certificate failed validation. Should it be trusted anyway?
    async fn confirm_server_trust(&self, evaluation: &ServerTrustEvaluation) -> TrustDecision;

    /// The server asked for a client certificate.
    async fn choose_client_certificate(&self, host: &str) -> CertificateChoice;

    /// The chosen file could not be imported; the choice is offered again.
    async fn certificate_import_failed(&self, _path: &Path, _error: &IdentityError) {}
}

// ── Negotiator ───────────────────────────────────────────────────────────────

/// Resolves authentication challenges against a candidate's trust store.
#[derive(Clone)]
pub struct TrustNegotiator {
    prompt: Arc<dyn TrustPrompt>,
}

impl TrustNegotiator {
    pub fn new(prompt: Arc<dyn TrustPrompt>) -> Self {
        Self { prompt }
    }

    /// Decide one challenge for `task`.
    pub async fn negotiate(
        &self,
        task: TaskId,
        challenge: Challenge,
        trust: &SharedTrust,
        pending: &PendingChallenges,
    ) -> Resolution {
        debug!(%task, kind = challenge.kind(), "negotiating challenge");
        match challenge {
            Challenge::ServerTrust(evaluation) => self.server_trust(evaluation, trust).await,
            Challenge::HttpBasic { realm } => {
                info!(%task, realm = realm.as_deref().unwrap_or(""), "rejecting basic auth challenge");
                Resolution::Reject(AuthError::BasicAuth)
            },
            Challenge::ClientCertificate { host, .. } => {
                pending.mark_client_certificate(task);
                self.client_certificate(&host, trust).await
            },
            Challenge::Unsupported { method } => {
                info!(%task, %method, "rejecting unsupported authentication method");
                Resolution::Reject(AuthError::AuthenticationUnsupported(method))
            },
        }
    }

    async fn server_trust(
        &self,
        evaluation: ServerTrustEvaluation,
        trust: &SharedTrust,
    ) -> Resolution {
        if trust.is_trusted(&evaluation.fingerprint) {
            return Resolution::Retry;
        }
        match self.prompt.confirm_server_trust(&evaluation).await {
            TrustDecision::Accept => {
                trust.accept(evaluation.fingerprint);
                Resolution::Retry
            },
            TrustDecision::Reject => {
                info!(host = %evaluation.host, fingerprint = %evaluation.fingerprint, "certificate rejected by user");
                Resolution::Reject(AuthError::SslUntrusted(evaluation.errors))
            },
        }
    }

    async fn client_certificate(&self, host: &str, trust: &SharedTrust) -> Resolution {
        loop {
            match self.prompt.choose_client_certificate(host).await {
                CertificateChoice::ContinueWithout => return Resolution::UseDefault,
                CertificateChoice::Import(path) => match import_pkcs12_file(&path).await {
                    Ok(identity) => {
                        trust.set_identity(identity);
                        return Resolution::Retry;
                    },
                    Err(error) => {
                        warn!(path = %path.display(), %error, "client certificate import failed");
                        self.prompt.certificate_import_failed(&path, &error).await;
                    },
                },
            }
        }
    }
}

// ── Service ──────────────────────────────────────────────────────────────────

/// A challenge parked in a session's pending table, waiting for a decision.
pub struct ChallengeRequest {
    pub task: TaskId,
    pub challenge: Challenge,
    pub trust: SharedTrust,
    pub pending: Arc<PendingChallenges>,
}

/// Handle to the task that runs interactive decisions one at a time. Cheap to
/// clone; shared by every probe that may need the user.
#[derive(Clone)]
pub struct NegotiatorHandle {
    tx: mpsc::Sender<ChallengeRequest>,
}

impl NegotiatorHandle {
    /// Spawn the decision loop for `negotiator`.
    pub fn spawn(negotiator: TrustNegotiator) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(CHALLENGE_QUEUE);
        let handle = tokio::spawn(run_negotiator(negotiator, rx));
        (Self { tx }, handle)
    }

    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::Sender<ChallengeRequest>) -> Self {
        Self { tx }
    }

    /// Queue a challenge. On failure the request is handed back.
    pub async fn submit(&self, request: ChallengeRequest) -> Result<(), ChallengeRequest> {
        self.tx.send(request).await.map_err(|e| e.0)
    }
}

async fn run_negotiator(negotiator: TrustNegotiator, mut rx: mpsc::Receiver<ChallengeRequest>) {
    while let Some(request) = rx.recv().await {
        let ChallengeRequest {
            task,
            challenge,
            trust,
            pending,
        } = request;
        if pending.is_closed() {
            debug!(%task, "session closed before its challenge was handled");
            continue;
        }
        // A prompt for a session that goes away is abandoned so later
        // challenges are not held up behind it.
        let resolution = tokio::select! {
            resolution = negotiator.negotiate(task, challenge, &trust, &pending) => resolution,
            () = pending.closed() => {
                debug!(%task, "session closed while its challenge was open, prompt abandoned");
                continue;
            },
        };
        if !pending.resolve(task, resolution) {
            debug!(%task, "challenge settled elsewhere, decision dropped");
        }
    }
    debug!("negotiator stopped");
}
