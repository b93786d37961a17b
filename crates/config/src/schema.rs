//! Config schema types (dispatch, probe, servers, actions).

use std::{collections::HashMap, path::PathBuf};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize, Serializer},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HearthConfig {
    pub dispatch: DispatchConfig,
    pub probe: ProbeConfig,
    /// Home-automation servers keyed by server identifier.
    pub servers: HashMap<String, ServerEntry>,
    pub actions: Vec<ActionEntry>,
}

/// Action dispatch tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Delay before a success/failure indicator clears back to idle.
    pub reset_delay_ms: u64,
    /// Upper bound on the wait for a companion-link reply.
    pub reply_timeout_ms: u64,
    /// Origin tag sent with direct action-execution calls.
    pub origin: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            reset_delay_ms: 1_000,
            reply_timeout_ms: 10_000,
            origin: "Watch".into(),
        }
    }
}

/// Connectivity probe tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub timeout_secs: u64,
    pub user_agent: Option<String>,
    /// Extra headers added to every probe request.
    pub headers: HashMap<String, String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            user_agent: None,
            headers: HashMap::new(),
        }
    }
}

/// A home-automation server the companion can talk to directly.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub url: String,

    /// Long-lived access token.
    #[serde(
        default,
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub token: Option<Secret<String>>,

    /// SHA-256 fingerprints (hex) of certificates the user accepted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trusted_certificates: Vec<String>,

    /// PKCS#12 file holding the client identity, if one was imported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_identity: Option<PathBuf>,
}

impl std::fmt::Debug for ServerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEntry")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("trusted_certificates", &self.trusted_certificates)
            .field("client_identity", &self.client_identity)
            .finish()
    }
}

impl ServerEntry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            trusted_certificates: Vec::new(),
            client_identity: None,
        }
    }

    /// Record an accepted certificate fingerprint. Returns false if it was
    /// already present.
    pub fn trust_certificate(&mut self, fingerprint: &str) -> bool {
        let fingerprint = fingerprint.to_ascii_lowercase();
        if self.trusted_certificates.contains(&fingerprint) {
            return false;
        }
        self.trusted_certificates.push(fingerprint);
        true
    }
}

/// A user-configured action record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default = "default_background")]
    pub background_color: String,
    #[serde(default = "default_foreground")]
    pub icon_color: String,
    #[serde(default = "default_foreground")]
    pub text_color: String,
    #[serde(default)]
    pub position: i32,
    #[serde(default = "default_true")]
    pub show_on_watch: bool,
    /// Identifier of the server (key in `servers`) that executes the action.
    pub server: String,
}

fn default_background() -> String {
    "#FFFFFF".into()
}

fn default_foreground() -> String {
    "#000000".into()
}

fn default_true() -> bool {
    true
}

pub fn serialize_option_secret<S: Serializer>(
    value: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(secret) => serializer.serialize_some(secret.expose_secret()),
        None => serializer.serialize_none(),
    }
}

impl HearthConfig {
    pub fn server(&self, id: &str) -> Option<&ServerEntry> {
        self.servers.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = HearthConfig::default();
        assert_eq!(cfg.dispatch.reset_delay_ms, 1_000);
        assert_eq!(cfg.dispatch.origin, "Watch");
        assert_eq!(cfg.probe.timeout_secs, 15);
        assert!(cfg.servers.is_empty());
    }

    #[test]
    fn parses_actions_with_defaults() {
        let raw = r#"
            [servers.home]
            url = "https://home.example:8123"
            token = "abc"

            [[actions]]
            id = "lights-off"
            name = "Lights off"
            server = "home"
        "#;
        let cfg: HearthConfig = toml::from_str(raw).unwrap();
        let action = &cfg.actions[0];
        assert!(action.show_on_watch);
        assert_eq!(action.background_color, "#FFFFFF");
        assert_eq!(action.position, 0);
        assert_eq!(
            cfg.server("home").unwrap().token.as_ref().unwrap().expose_secret(),
            "abc"
        );
    }

    #[test]
    fn token_round_trips_through_toml() {
        let mut cfg = HearthConfig::default();
        let mut entry = ServerEntry::new("https://h");
        entry.token = Some(Secret::new("secret-token".into()));
        cfg.servers.insert("h".into(), entry);
        let out = toml::to_string_pretty(&cfg).unwrap();
        assert!(out.contains("secret-token"));
        let back: HearthConfig = toml::from_str(&out).unwrap();
        assert!(back.server("h").unwrap().token.is_some());
    }

    #[test]
    fn debug_redacts_token() {
        let mut entry = ServerEntry::new("https://h");
        entry.token = Some(Secret::new("super-secret".into()));
        let out = format!("{entry:?}");
        assert!(out.contains("[REDACTED]"));
        assert!(!out.contains("super-secret"));
    }

    #[test]
    fn trust_certificate_dedupes_case_insensitively() {
        let mut entry = ServerEntry::new("https://h");
        assert!(entry.trust_certificate("ABCD"));
        assert!(!entry.trust_certificate("abcd"));
        assert_eq!(entry.trusted_certificates, vec!["abcd".to_string()]);
    }
}
