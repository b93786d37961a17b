use std::{io::Write, path::Path, sync::Arc};

use {
    anyhow::{Context, Result, bail},
    async_trait::async_trait,
    hearth_config::{HearthConfig, ServerEntry},
    hearth_onboarding::{
        CertificateChoice, ConnectivityCandidate, ConnectivityProbe, HttpTransport,
        IdentityError, NegotiatorHandle, ServerTrustEvaluation, SessionOptions, TrustDecision,
        TrustNegotiator, TrustPrompt, TrustStore, identity::import_pkcs12_file,
    },
    tokio::{
        io::{AsyncBufReadExt, BufReader, Lines, Stdin},
        sync::Mutex,
    },
    tracing::warn,
    url::Url,
};

/// Asks trust questions on the terminal.
struct TerminalPrompt {
    input: Mutex<Lines<BufReader<Stdin>>>,
}

impl TerminalPrompt {
    fn new() -> Self {
        Self {
            input: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }

    async fn ask(&self, question: &str) -> String {
        print!("{question} ");
        let _ = std::io::stdout().flush();
        match self.input.lock().await.next_line().await {
            Ok(Some(line)) => line.trim().to_string(),
            _ => String::new(),
        }
    }
}

#[async_trait]
impl TrustPrompt for TerminalPrompt {
    async fn confirm_server_trust(&self, evaluation: &ServerTrustEvaluation) -> TrustDecision {
        println!("The certificate presented by {} is not trusted:", evaluation.host);
        for error in &evaluation.errors {
            println!("  - {error}");
        }
        println!("SHA-256 fingerprint: {}", evaluation.fingerprint);
        let answer = self.ask("Trust this certificate? [y/N]").await;
        if matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes") {
            TrustDecision::Accept
        } else {
            TrustDecision::Reject
        }
    }

    async fn choose_client_certificate(&self, host: &str) -> CertificateChoice {
        println!("{host} asked for a client certificate.");
        let answer = self
            .ask("Path to a PKCS#12 file (leave empty to continue without):")
            .await;
        if answer.is_empty() {
            CertificateChoice::ContinueWithout
        } else {
            CertificateChoice::Import(answer.into())
        }
    }

    async fn certificate_import_failed(&self, path: &Path, error: &IdentityError) {
        eprintln!("Could not import {}: {error}", path.display());
    }
}

pub async fn probe(url: &str, server: Option<&str>, save: bool) -> Result<()> {
    let config = hearth_config::discover_and_load();
    let url = Url::parse(url).with_context(|| format!("invalid url: {url}"))?;
    let entry = server.and_then(|id| saved_server(&config, id));

    let store = match entry {
        Some(entry) => seeded_store(entry).await,
        None => TrustStore::new(),
    };
    let candidate = ConnectivityCandidate::with_trust(url.clone(), store);

    let (negotiator, _task) =
        NegotiatorHandle::spawn(TrustNegotiator::new(Arc::new(TerminalPrompt::new())));
    let transport = HttpTransport::new(SessionOptions::from_config(&config.probe));
    let probe = ConnectivityProbe::new(Arc::new(transport), negotiator);

    if let Err(error) = probe.verify(&candidate).await {
        eprintln!("Could not verify {url}:");
        for message in error.messages() {
            eprintln!("  {message}");
        }
        if error.is_recoverable() {
            eprintln!("Run the probe again to retry the trust decision.");
        }
        bail!("connectivity probe failed");
    }
    println!("Verified {url}");

    if save {
        let id = server.map(str::to_string).unwrap_or_else(|| candidate.host().to_string());
        let trust = candidate.trust().snapshot();
        let path = hearth_config::update_config(|config| record_trust(config, &id, &url, &trust))?;
        println!("Saved trust for {id} to {}", path.display());
    }
    Ok(())
}

fn saved_server<'a>(config: &'a HearthConfig, id: &str) -> Option<&'a ServerEntry> {
    let entry = config.servers.get(id);
    if entry.is_none() {
        warn!(server = %id, "server not in config, probing without saved trust");
    }
    entry
}

/// Trust the server entry already carries.
async fn seeded_store(entry: &ServerEntry) -> TrustStore {
    let mut store =
        TrustStore::from_fingerprints(entry.trusted_certificates.iter().map(String::as_str));
    if let Some(path) = &entry.client_identity {
        match import_pkcs12_file(path).await {
            Ok(identity) => store.set_identity(identity),
            Err(e) => warn!(path = %path.display(), error = %e, "ignoring saved client identity"),
        }
    }
    store
}

fn record_trust(config: &mut HearthConfig, id: &str, url: &Url, trust: &TrustStore) {
    let entry = config
        .servers
        .entry(id.to_string())
        .or_insert_with(|| ServerEntry::new(url.as_str()));
    for fingerprint in trust.exceptions() {
        entry.trust_certificate(&fingerprint.to_hex());
    }
    if let Some(source) = trust.identity().and_then(|identity| identity.source()) {
        entry.client_identity = Some(source.to_path_buf());
    }
}

#[cfg(test)]
mod tests {
    use {super::*, hearth_onboarding::Fingerprint};

    #[test]
    fn records_new_server_with_fingerprints() {
        let mut config = HearthConfig::default();
        let mut trust = TrustStore::new();
        let fp = Fingerprint::of(b"leaf");
        trust.add_exception(fp);
        let url = Url::parse("https://home.hearth.test:8123/").unwrap();

        record_trust(&mut config, "home", &url, &trust);
        record_trust(&mut config, "home", &url, &trust);

        let entry = &config.servers["home"];
        assert_eq!(entry.url, "https://home.hearth.test:8123/");
        assert_eq!(entry.trusted_certificates, vec![fp.to_hex()]);
        assert!(entry.client_identity.is_none());
    }

    #[test]
    fn unknown_server_has_no_saved_trust() {
        let mut config = HearthConfig::default();
        config
            .servers
            .insert("home".into(), ServerEntry::new("https://home.hearth.test"));
        assert!(saved_server(&config, "home").is_some());
        assert!(saved_server(&config, "cabin").is_none());
    }

    #[test]
    fn keeps_existing_entry_settings() {
        let mut config = HearthConfig::default();
        let mut existing = ServerEntry::new("https://original.hearth.test");
        existing.trusted_certificates.push("aa".repeat(32));
        config.servers.insert("home".into(), existing);

        let mut trust = TrustStore::new();
        trust.add_exception(Fingerprint::of(b"other"));
        record_trust(
            &mut config,
            "home",
            &Url::parse("https://home.hearth.test").unwrap(),
            &trust,
        );

        let entry = &config.servers["home"];
        assert_eq!(entry.url, "https://original.hearth.test");
        assert_eq!(entry.trusted_certificates.len(), 2);
    }
}
