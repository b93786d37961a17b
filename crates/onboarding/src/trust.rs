use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use {
    sha2::{Digest, Sha256},
    tracing::{info, warn},
};

use crate::identity::ClientIdentity;

/// SHA-256 digest of a DER-encoded certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }

    pub fn from_hex(value: &str) -> Option<Self> {
        let bytes = hex::decode(value.trim()).ok()?;
        bytes.try_into().ok().map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Certificates the user approved despite failing validation, plus an
/// optional client identity.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    exceptions: HashSet<Fingerprint>,
    identity: Option<ClientIdentity>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from fingerprints persisted in a server entry.
    /// Malformed fingerprints are skipped.
    pub fn from_fingerprints<'a>(fingerprints: impl IntoIterator<Item = &'a str>) -> Self {
        let exceptions = fingerprints
            .into_iter()
            .filter_map(|hex| {
                let parsed = Fingerprint::from_hex(hex);
                if parsed.is_none() {
                    warn!(fingerprint = %hex, "ignoring malformed certificate fingerprint");
                }
                parsed
            })
            .collect();
        Self {
            exceptions,
            identity: None,
        }
    }

    pub fn is_trusted(&self, fingerprint: &Fingerprint) -> bool {
        self.exceptions.contains(fingerprint)
    }

    /// Returns false if the certificate was already trusted.
    pub fn add_exception(&mut self, fingerprint: Fingerprint) -> bool {
        self.exceptions.insert(fingerprint)
    }

    pub fn exceptions(&self) -> impl Iterator<Item = &Fingerprint> {
        self.exceptions.iter()
    }

    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    pub fn set_identity(&mut self, identity: ClientIdentity) {
        self.identity = Some(identity);
    }
}

/// A trust store shared between a candidate, its TLS verifier and the
/// negotiator. Only the negotiator writes to it, on explicit user approval.
#[derive(Debug, Clone, Default)]
pub struct SharedTrust(Arc<RwLock<TrustStore>>);

impl SharedTrust {
    pub fn new(store: TrustStore) -> Self {
        Self(Arc::new(RwLock::new(store)))
    }

    pub fn is_trusted(&self, fingerprint: &Fingerprint) -> bool {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_trusted(fingerprint)
    }

    /// Record a user-approved exception for `fingerprint`.
    pub fn accept(&self, fingerprint: Fingerprint) -> bool {
        let added = self
            .0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_exception(fingerprint);
        if added {
            info!(%fingerprint, "certificate exception added");
        }
        added
    }

    pub fn identity(&self) -> Option<ClientIdentity> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .identity()
            .cloned()
    }

    pub fn set_identity(&self, identity: ClientIdentity) {
        info!(subject = %identity.subject(), "client identity imported");
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_identity(identity);
    }

    /// Copy of the current store.
    pub fn snapshot(&self) -> TrustStore {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_hex_round_trip() {
        let fp = Fingerprint::of(b"certificate bytes");
        assert_eq!(fp.to_hex().len(), 64);
        assert_eq!(Fingerprint::from_hex(&fp.to_hex()), Some(fp));
        assert_eq!(Fingerprint::from_hex(&fp.to_hex().to_uppercase()), Some(fp));
        assert_eq!(Fingerprint::from_hex("abcd"), None);
        assert_eq!(Fingerprint::from_hex("zz"), None);
    }

    #[test]
    fn from_fingerprints_skips_malformed() {
        let good = Fingerprint::of(b"a");
        let hex = good.to_hex();
        let store = TrustStore::from_fingerprints([hex.as_str(), "not-hex"]);
        assert!(store.is_trusted(&good));
        assert_eq!(store.exceptions().count(), 1);
    }

    #[test]
    fn shared_accept_is_visible_to_clones() {
        let trust = SharedTrust::default();
        let other = trust.clone();
        let fp = Fingerprint::of(b"leaf");
        assert!(!other.is_trusted(&fp));
        assert!(trust.accept(fp));
        assert!(!trust.accept(fp));
        assert!(other.is_trusted(&fp));
        assert!(other.snapshot().is_trusted(&fp));
    }
}
