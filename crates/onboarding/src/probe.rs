use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tracing::{debug, info, warn};

use crate::{
    candidate::{CandidateState, ConnectivityCandidate},
    challenge::{Challenge, PendingChallenges, Resolution, TaskId},
    error::{AuthError, TransportError},
    negotiator::{ChallengeRequest, NegotiatorHandle},
    transport::{Exchange, ProbeRequest, ProbeResponse, ProbeTransport},
    trust::SharedTrust,
};

/// Verifies that a candidate server can be reached with the trust the user
/// is willing to extend to it.
pub struct ConnectivityProbe {
    transport: Arc<dyn ProbeTransport>,
    negotiator: NegotiatorHandle,
    next_task: AtomicU64,
}

impl ConnectivityProbe {
    pub fn new(transport: Arc<dyn ProbeTransport>, negotiator: NegotiatorHandle) -> Self {
        Self {
            transport,
            negotiator,
            next_task: AtomicU64::new(1),
        }
    }

    /// One authenticated round-trip against the candidate's URL. Reports
    /// exactly one outcome.
    pub async fn verify(&self, candidate: &ConnectivityCandidate) -> Result<(), AuthError> {
        self.verify_request(candidate, ProbeRequest::get(candidate.url().clone()))
            .await
    }

    /// Like [`verify`](Self::verify) with a caller-built request.
    pub async fn verify_request(
        &self,
        candidate: &ConnectivityCandidate,
        request: ProbeRequest,
    ) -> Result<(), AuthError> {
        candidate.set_state(CandidateState::Verifying);
        let session = ProbeSession {
            task: TaskId(self.next_task.fetch_add(1, Ordering::Relaxed)),
            pending: Arc::new(PendingChallenges::new()),
            negotiator: &self.negotiator,
            candidate,
        };

        let result = session
            .run(self.transport.as_ref(), &request, candidate.trust())
            .await;
        match &result {
            Ok(()) => {
                info!(url = %candidate.url(), "connectivity verified");
                candidate.set_state(CandidateState::Verified);
            },
            Err(error) => {
                warn!(url = %candidate.url(), %error, "connectivity probe failed");
                candidate.set_state(CandidateState::Failed);
            },
        }
        result
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

/// Owns the pending-challenge table for one probe. Dropping it cancels any
/// challenge still waiting on the negotiator, and a candidate left mid-probe
/// is marked failed.
struct ProbeSession<'a> {
    task: TaskId,
    pending: Arc<PendingChallenges>,
    negotiator: &'a NegotiatorHandle,
    candidate: &'a ConnectivityCandidate,
}

impl ProbeSession<'_> {
    async fn run(
        &self,
        transport: &dyn ProbeTransport,
        request: &ProbeRequest,
        trust: &SharedTrust,
    ) -> Result<(), AuthError> {
        let result = self.attempt(transport, request, trust).await;
        let client_certificate = self.pending.client_certificate_requested(self.task);
        match result {
            Err(error) if client_certificate && !error.is_cancelled() => {
                debug!(task = %self.task, %error, "reporting failure as client certificate required");
                Err(AuthError::ClientCertificateRequired)
            },
            other => other,
        }
    }

    async fn attempt(
        &self,
        transport: &dyn ProbeTransport,
        request: &ProbeRequest,
        trust: &SharedTrust,
    ) -> Result<(), AuthError> {
        loop {
            let challenge = match transport.exchange(request, trust).await {
                Exchange::Response(response) => return validate(response),
                Exchange::Failed(error) => return Err(error.into()),
                Exchange::Challenged(challenge) => challenge,
            };

            // A certificate that is already trusted and still fails will not
            // be fixed by asking again.
            if let Challenge::ServerTrust(evaluation) = &challenge
                && trust.is_trusted(&evaluation.fingerprint)
            {
                warn!(task = %self.task, fingerprint = %evaluation.fingerprint, "trusted certificate challenged again");
                return Err(AuthError::SslUntrusted(evaluation.errors.clone()));
            }

            match self.raise(challenge.clone(), trust).await {
                Resolution::Retry => {
                    debug!(task = %self.task, "retrying after challenge");
                },
                Resolution::UseDefault => return Err(challenge.default_failure()),
                Resolution::Reject(error) => return Err(error),
                Resolution::Cancelled => return Err(TransportError::Cancelled.into()),
            }
        }
    }

    /// Park the task and wait for the negotiator's decision.
    async fn raise(&self, challenge: Challenge, trust: &SharedTrust) -> Resolution {
        let rx = match self.pending.register(self.task) {
            Ok(rx) => rx,
            Err(error) => {
                warn!(task = %self.task, %error, "cannot register challenge");
                return Resolution::Cancelled;
            },
        };
        let request = ChallengeRequest {
            task: self.task,
            challenge,
            trust: trust.clone(),
            pending: Arc::clone(&self.pending),
        };
        if self.negotiator.submit(request).await.is_err() {
            warn!(task = %self.task, "negotiator is gone");
            self.pending.resolve(self.task, Resolution::Cancelled);
        }
        rx.await.unwrap_or(Resolution::Cancelled)
    }
}

impl Drop for ProbeSession<'_> {
    fn drop(&mut self) {
        let cancelled = self.pending.close();
        if cancelled > 0 {
            debug!(task = %self.task, cancelled, "probe session torn down with pending challenges");
        }
        if self.candidate.state() == CandidateState::Verifying {
            self.candidate.set_state(CandidateState::Failed);
        }
    }
}

fn validate(response: ProbeResponse) -> Result<(), AuthError> {
    if response.status.is_success() {
        return Ok(());
    }
    let body = (!response.body.is_empty()).then_some(response.body);
    Err(TransportError::Status {
        status: response.status,
        body,
    }
    .into())
}
