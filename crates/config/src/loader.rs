use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use {
    anyhow::Context,
    tracing::{debug, warn},
};

use crate::{env_subst::substitute_env, schema::HearthConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["hearth.toml", "hearth.yaml", "hearth.yml", "hearth.json"];

/// Override for the config directory, set via `set_config_dir()`.
static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Lock guarding config read-modify-write cycles.
static CONFIG_SAVE_LOCK: Mutex<()> = Mutex::new(());

/// Set a custom config directory. When set, discovery only looks in this
/// directory. Each call replaces the previous override.
pub fn set_config_dir(path: PathBuf) {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(path);
}

/// Clear the config directory override, restoring default discovery.
pub fn clear_config_dir() {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = None;
}

fn config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<HearthConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./hearth.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/hearth/hearth.{toml,yaml,yml,json}` (user-global)
///
/// A file that fails to parse is reported and replaced by defaults; a
/// missing file is not created.
pub fn discover_and_load() -> HearthConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, using defaults");
        return HearthConfig::default();
    };
    debug!(path = %path.display(), "loading config");
    match load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            HearthConfig::default()
        },
    }
}

fn find_in(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Find the first config file in standard locations.
///
/// When a config dir override is set, only that directory is searched.
fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return find_in(&dir);
    }
    find_in(Path::new(".")).or_else(|| user_config_dir().and_then(|dir| find_in(&dir)))
}

fn user_config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().join(".config").join("hearth"))
}

/// Returns the config directory: override, or `~/.config/hearth/`.
pub fn config_dir() -> Option<PathBuf> {
    config_dir_override().or_else(user_config_dir)
}

/// Returns the path of an existing config file, or the default TOML path.
pub fn find_or_default_config_path() -> PathBuf {
    if let Some(path) = find_config_file() {
        return path;
    }
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hearth.toml")
}

/// Atomically load the current config, apply `f`, and save.
///
/// Returns the path written to.
pub fn update_config(f: impl FnOnce(&mut HearthConfig)) -> anyhow::Result<PathBuf> {
    let _guard = CONFIG_SAVE_LOCK
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let mut config = match find_config_file() {
        Some(path) => load_config(&path)?,
        None => HearthConfig::default(),
    };
    f(&mut config);
    save_config_inner(&config)
}

/// Serialize `config` and write it to the discovered (or default) path.
///
/// Prefer [`update_config`] for read-modify-write cycles.
pub fn save_config(config: &HearthConfig) -> anyhow::Result<PathBuf> {
    let _guard = CONFIG_SAVE_LOCK
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    save_config_inner(config)
}

fn save_config_inner(config: &HearthConfig) -> anyhow::Result<PathBuf> {
    let path = find_or_default_config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let raw = serialize_config(config, &path)?;
    std::fs::write(&path, raw)?;

    // The file carries server tokens.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }

    debug!(path = %path.display(), "saved config");
    Ok(path)
}

fn format_of(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("toml")
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<HearthConfig> {
    match format_of(path) {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        ext => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

fn serialize_config(config: &HearthConfig, path: &Path) -> anyhow::Result<String> {
    match format_of(path) {
        "yaml" | "yml" => Ok(serde_yaml::to_string(config)?),
        "json" => Ok(serde_json::to_string_pretty(config)?),
        _ => toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("serialize config: {e}")),
    }
}
