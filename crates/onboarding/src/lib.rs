//! Connectivity negotiation for onboarding a home-automation server.
//!
//! A [`ConnectivityProbe`] performs one authenticated round-trip against a
//! [`ConnectivityCandidate`]. Whenever the transport reports a challenge
//! (untrusted certificate, client-certificate request, HTTP authentication)
//! the probe parks it in its session's pending-challenge table and hands it to
//! the [`TrustNegotiator`], which may ask the user. Accepted certificates and
//! imported client identities accumulate in the candidate's trust store and
//! the request is re-evaluated.

pub mod candidate;
pub mod challenge;
pub mod error;
pub mod identity;
pub mod negotiator;
pub mod probe;
pub mod tls;
pub mod transport;
pub mod trust;

pub use {
    candidate::{CandidateState, ConnectivityCandidate},
    challenge::{Challenge, PendingChallenges, Resolution, ServerTrustEvaluation, TaskId},
    error::{AuthError, IdentityError, TransportError},
    identity::ClientIdentity,
    negotiator::{CertificateChoice, NegotiatorHandle, TrustDecision, TrustNegotiator, TrustPrompt},
    probe::ConnectivityProbe,
    transport::{
        Exchange, HttpTransport, ProbeRequest, ProbeResponse, ProbeTransport, SessionOptions,
    },
    trust::{Fingerprint, SharedTrust, TrustStore},
};
