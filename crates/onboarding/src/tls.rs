//! rustls plumbing that feeds the negotiator.
//!
//! The verifier and client-certificate resolver run synchronously inside the
//! handshake, so they never prompt. They accept what the trust store already
//! allows and record everything else in [`TlsObservations`], which the
//! transport turns into a [`Challenge`](crate::Challenge) once the request
//! has failed.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use {
    rustls::{
        ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme,
        client::{
            ResolvesClientCert, WebPkiServerVerifier,
            danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        },
        crypto::CryptoProvider,
        pki_types::{CertificateDer, ServerName, UnixTime},
        sign::CertifiedKey,
    },
    tracing::{debug, trace},
};

use crate::{
    challenge::ServerTrustEvaluation,
    trust::{Fingerprint, SharedTrust},
};

/// What the handshake saw that the trust store could not settle.
#[derive(Debug, Default)]
pub struct TlsObservations {
    untrusted: Mutex<Option<ServerTrustEvaluation>>,
    client_certificate_requested: AtomicBool,
}

impl TlsObservations {
    fn record_untrusted(&self, evaluation: ServerTrustEvaluation) {
        *self
            .untrusted
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(evaluation);
    }

    pub fn take_untrusted(&self) -> Option<ServerTrustEvaluation> {
        self.untrusted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn client_certificate_requested(&self) -> bool {
        self.client_certificate_requested.load(Ordering::SeqCst)
    }
}

/// Root certificates bundled with the crate (Mozilla's set).
pub fn default_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

// ── Server verifier ──────────────────────────────────────────────────────────

/// Accepts a certificate the user has trusted, otherwise defers to standard
/// WebPKI validation and records the failure.
#[derive(Debug)]
pub struct ExceptionVerifier {
    host: String,
    inner: Arc<WebPkiServerVerifier>,
    trust: SharedTrust,
    observations: Arc<TlsObservations>,
}

impl ServerCertVerifier for ExceptionVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let fingerprint = Fingerprint::of(end_entity.as_ref());
        if self.trust.is_trusted(&fingerprint) {
            trace!(host = %self.host, %fingerprint, "certificate matches trust exception");
            return Ok(ServerCertVerified::assertion());
        }

        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            .inspect_err(|error| {
                debug!(host = %self.host, %fingerprint, %error, "certificate failed validation");
                self.observations
                    .record_untrusted(ServerTrustEvaluation::new(
                        self.host.clone(),
                        end_entity.as_ref(),
                        error,
                    ));
            })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

// ── Client certificate resolver ──────────────────────────────────────────────

/// Offers the imported identity, if any, and notes that one was requested.
#[derive(Debug)]
pub struct IdentityResolver {
    trust: SharedTrust,
    observations: Arc<TlsObservations>,
}

impl ResolvesClientCert for IdentityResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.observations
            .client_certificate_requested
            .store(true, Ordering::SeqCst);
        let identity = self.trust.identity();
        debug!(offered = identity.is_some(), "server requested a client certificate");
        identity.map(|id| id.certified_key())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

// ── Config ───────────────────────────────────────────────────────────────────

/// Build a client config for one exchange with `host`.
pub fn client_config(
    host: &str,
    roots: RootCertStore,
    trust: SharedTrust,
    observations: Arc<TlsObservations>,
) -> Result<ClientConfig, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = exception_verifier(
        host,
        roots,
        trust.clone(),
        Arc::clone(&observations),
        &provider,
    )?;
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_cert_resolver(Arc::new(IdentityResolver {
            trust,
            observations,
        }));
    Ok(config)
}

fn exception_verifier(
    host: &str,
    roots: RootCertStore,
    trust: SharedTrust,
    observations: Arc<TlsObservations>,
    provider: &Arc<CryptoProvider>,
) -> Result<ExceptionVerifier, TlsError> {
    let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(provider))
        .build()
        .map_err(|e| TlsError::General(e.to_string()))?;
    Ok(ExceptionVerifier {
        host: host.to_string(),
        inner,
        trust,
        observations,
    })
}
