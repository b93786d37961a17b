//! PKCS#12 client identities.
//!
//! Files are always opened with an empty passphrase. A file that needs a real
//! passphrase is reported as [`IdentityError::WrongPassphrase`] so the caller
//! can offer another choice.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    openssl::{error::ErrorStack, pkcs12::Pkcs12},
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
        sign::CertifiedKey,
    },
    tracing::debug,
};

use crate::error::IdentityError;

const EMPTY_PASSPHRASE: &str = "";

/// A client certificate chain with its signing key, ready for TLS.
#[derive(Clone)]
pub struct ClientIdentity {
    key: Arc<CertifiedKey>,
    subject: String,
    source: Option<PathBuf>,
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("subject", &self.subject)
            .field("chain_len", &self.key.cert.len())
            .field("source", &self.source)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl ClientIdentity {
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.key)
    }

    /// Subject common name of the leaf certificate (or the full subject when
    /// it has no common name).
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// File the identity was imported from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

/// Read and parse a PKCS#12 file.
pub async fn import_pkcs12_file(path: &Path) -> Result<ClientIdentity, IdentityError> {
    let der = tokio::fs::read(path)
        .await
        .map_err(|source| IdentityError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    let mut identity = parse_pkcs12(&der)?;
    identity.source = Some(path.to_path_buf());
    debug!(path = %path.display(), subject = %identity.subject, "parsed client identity");
    Ok(identity)
}

/// Parse DER-encoded PKCS#12 data with the empty passphrase.
pub fn parse_pkcs12(der: &[u8]) -> Result<ClientIdentity, IdentityError> {
    let archive = Pkcs12::from_der(der).map_err(|e| IdentityError::Invalid(e.to_string()))?;
    let parsed = archive.parse2(EMPTY_PASSPHRASE).map_err(|e| {
        if is_mac_failure(&e) {
            IdentityError::WrongPassphrase
        } else {
            IdentityError::Invalid(e.to_string())
        }
    })?;

    let pkey = parsed.pkey.ok_or(IdentityError::MissingKey)?;
    let leaf = parsed.cert.ok_or(IdentityError::MissingCertificate)?;

    let subject = leaf
        .subject_name()
        .entries_by_nid(openssl::nid::Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
        .unwrap_or_else(|| format!("{:?}", leaf.subject_name()));

    let mut chain = vec![CertificateDer::from(der_of(leaf.to_der())?)];
    if let Some(ca) = parsed.ca {
        for cert in ca.iter() {
            chain.push(CertificateDer::from(der_of(cert.to_der())?));
        }
    }

    let pkcs8 = pkey
        .private_key_to_pkcs8()
        .map_err(|e| IdentityError::UnsupportedKey(e.to_string()))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&PrivateKeyDer::Pkcs8(
        PrivatePkcs8KeyDer::from(pkcs8),
    ))
    .map_err(|e| IdentityError::UnsupportedKey(e.to_string()))?;

    Ok(ClientIdentity {
        key: Arc::new(CertifiedKey::new(chain, signing_key)),
        subject,
        source: None,
    })
}

fn der_of(result: Result<Vec<u8>, ErrorStack>) -> Result<Vec<u8>, IdentityError> {
    result.map_err(|e| IdentityError::Invalid(e.to_string()))
}

/// OpenSSL reasons that mean the archive needs a different passphrase.
const PASSPHRASE_REASONS: &[&str] = &[
    "mac verify failure",
    "pkcs12 cipherfinal error",
    "bad decrypt",
];

fn is_mac_failure(error: &ErrorStack) -> bool {
    error.errors().iter().any(|e| {
        e.reason()
            .is_some_and(|r| PASSPHRASE_REASONS.iter().any(|known| r.contains(known)))
    })
}
