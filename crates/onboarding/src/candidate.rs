use std::sync::{Mutex, PoisonError};

use {tracing::debug, url::Url};

use crate::trust::{SharedTrust, TrustStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    Unverified,
    Verifying,
    Verified,
    Failed,
}

/// A server being onboarded: its URL, the trust it has accumulated so far and
/// where verification stands. Lives for the duration of one onboarding
/// attempt; trust accepted by one probe is reused by the next.
#[derive(Debug)]
pub struct ConnectivityCandidate {
    url: Url,
    trust: SharedTrust,
    state: Mutex<CandidateState>,
}

impl ConnectivityCandidate {
    pub fn new(url: Url) -> Self {
        Self::with_trust(url, TrustStore::new())
    }

    /// Start from previously approved exceptions.
    pub fn with_trust(url: Url, store: TrustStore) -> Self {
        Self {
            url,
            trust: SharedTrust::new(store),
            state: Mutex::new(CandidateState::Unverified),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn trust(&self) -> &SharedTrust {
        &self.trust
    }

    pub fn state(&self) -> CandidateState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, state: CandidateState) {
        debug!(url = %self.url, ?state, "candidate state changed");
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}
