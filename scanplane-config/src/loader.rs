use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use uuid::Uuid;

use crate::settings::ControlPlaneSettings;

pub mod env_keys {
    pub const CONFIG_PATH: &str = "SCANPLANE_CONFIG_PATH";
    pub const CONFIG_JSON: &str = "SCANPLANE_CONFIG_JSON";
    pub const CONTROLLER_ID: &str = "SCANPLANE_CONTROLLER_ID";
    pub const STANDALONE: &str = "SCANPLANE_STANDALONE";
    pub const SEED_PATH: &str = "SCANPLANE_SEED_PATH";
    pub const LOG: &str = "SCANPLANE_LOG";
    pub const SHUTDOWN_GRACE: &str = "SCANPLANE_SHUTDOWN_GRACE";
}

const DEFAULT_CONFIG_LOCATIONS: &[&str] = &[
    "scanplane.toml",
    "scanplane.json",
    "config/scanplane.toml",
    "config/scanplane.json",
];

/// Where the base settings came from before environment overrides.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SettingsSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

impl fmt::Display for SettingsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsSource::Default => f.write_str("defaults"),
            SettingsSource::EnvPath(path) => {
                write!(f, "${} ({})", env_keys::CONFIG_PATH, path.display())
            }
            SettingsSource::EnvInline => write!(f, "${}", env_keys::CONFIG_JSON),
            SettingsSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SettingsLoad {
    pub settings: ControlPlaneSettings,
    pub source: SettingsSource,
    /// Environment variables that overrode file values.
    pub overrides: Vec<&'static str>,
    /// The `.env` file that was read, if any.
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SettingsLoader {
    config_path: Option<PathBuf>,
    env_file: Option<PathBuf>,
    root: PathBuf,
    env: Option<HashMap<String, String>>,
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self {
            config_path: None,
            env_file: None,
            root: PathBuf::from("."),
            env: None,
        }
    }

    /// Load this file instead of searching for one.
    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.env_file = Some(path.into());
        self
    }

    /// Directory searched for `.env` and default config files; relative
    /// paths resolve against it.
    pub fn with_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.root = root.into();
        self
    }

    /// Use these variables instead of the process environment.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn load(&self) -> anyhow::Result<SettingsLoad> {
        let (env, env_file) = self.environment()?;
        let (mut settings, source) = self.base_settings(&env)?;
        let overrides = apply_env_overrides(&mut settings, &env)?;

        if settings.controller_id.trim().is_empty() {
            settings.controller_id = format!("scanplane-{}", Uuid::new_v4().simple());
            tracing::debug!(controller_id = %settings.controller_id, "generated controller id");
        }
        if let Some(seed) = settings.seed_path.take() {
            settings.seed_path = Some(self.resolve(&seed));
        }

        Ok(SettingsLoad {
            settings,
            source,
            overrides,
            env_file,
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// `.env` entries overlaid by the real environment.
    fn environment(&self) -> anyhow::Result<(HashMap<String, String>, Option<PathBuf>)> {
        let env_file = match &self.env_file {
            Some(path) => Some(self.resolve(path)),
            None => Some(self.root.join(".env")).filter(|path| path.is_file()),
        };

        let mut vars = HashMap::new();
        if let Some(path) = &env_file {
            let entries = dotenvy::from_path_iter(path)
                .with_context(|| format!("failed to read env file {}", path.display()))?;
            for entry in entries {
                let (key, value) = entry
                    .with_context(|| format!("invalid entry in env file {}", path.display()))?;
                vars.insert(key, value);
            }
        }
        match &self.env {
            Some(explicit) => vars.extend(explicit.clone()),
            None => vars.extend(std::env::vars()),
        }
        Ok((vars, env_file))
    }

    fn base_settings(
        &self,
        env: &HashMap<String, String>,
    ) -> anyhow::Result<(ControlPlaneSettings, SettingsSource)> {
        if let Some(path) = &self.config_path {
            let path = self.resolve(path);
            let settings = load_from_file(&path)?;
            return Ok((settings, SettingsSource::File(path)));
        }

        if let Some(raw) = non_empty(env, env_keys::CONFIG_PATH) {
            let path = self.resolve(Path::new(raw));
            let settings = load_from_file(&path)?;
            return Ok((settings, SettingsSource::EnvPath(path)));
        }

        if let Some(raw) = non_empty(env, env_keys::CONFIG_JSON) {
            let settings = parse_json(raw)
                .with_context(|| format!("failed to parse {}", env_keys::CONFIG_JSON))?;
            return Ok((settings, SettingsSource::EnvInline));
        }

        if let Some(path) = DEFAULT_CONFIG_LOCATIONS
            .iter()
            .map(|candidate| self.root.join(candidate))
            .find(|path| path.is_file())
        {
            let settings = load_from_file(&path)?;
            return Ok((settings, SettingsSource::File(path)));
        }

        Ok((ControlPlaneSettings::default(), SettingsSource::Default))
    }
}

fn non_empty<'a>(env: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    env.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn apply_env_overrides(
    settings: &mut ControlPlaneSettings,
    env: &HashMap<String, String>,
) -> anyhow::Result<Vec<&'static str>> {
    let mut applied = Vec::new();

    if let Some(id) = non_empty(env, env_keys::CONTROLLER_ID) {
        settings.controller_id = id.to_string();
        applied.push(env_keys::CONTROLLER_ID);
    }
    if let Some(raw) = non_empty(env, env_keys::STANDALONE) {
        settings.standalone = parse_bool(raw)
            .ok_or_else(|| anyhow!("{} must be a boolean, got {raw:?}", env_keys::STANDALONE))?;
        applied.push(env_keys::STANDALONE);
    }
    if let Some(path) = non_empty(env, env_keys::SEED_PATH) {
        settings.seed_path = Some(PathBuf::from(path));
        applied.push(env_keys::SEED_PATH);
    }
    if let Some(filter) = non_empty(env, env_keys::LOG) {
        settings.log_filter = Some(filter.to_string());
        applied.push(env_keys::LOG);
    }
    if let Some(raw) = non_empty(env, env_keys::SHUTDOWN_GRACE) {
        let grace = humantime::parse_duration(raw)
            .with_context(|| format!("invalid {} {raw:?}", env_keys::SHUTDOWN_GRACE))?;
        settings.control_plane.shutdown_grace_secs = grace.as_secs().max(1);
        applied.push(env_keys::SHUTDOWN_GRACE);
    }
    Ok(applied)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn load_from_file(path: &Path) -> anyhow::Result<ControlPlaneSettings> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings from {}", path.display()))?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => {
            parse_json(&contents).with_context(|| format!("invalid settings {}", path.display()))
        }
        Some("toml") => toml::from_str(&contents)
            .map_err(|err| anyhow!("invalid settings {}: {}", path.display(), err)),
        _ => parse_from_str(&contents, &path.display().to_string()),
    }
}

/// Try TOML first, then JSON.
pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<ControlPlaneSettings> {
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| {
            anyhow!(
                "failed to parse settings {origin}: toml error: {toml_err}; json error: {json_err}"
            )
        })
    })
}

fn parse_json(raw: &str) -> anyhow::Result<ControlPlaneSettings> {
    serde_json::from_str(raw).map_err(|err| anyhow!("invalid settings json: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booleans_accept_common_spellings() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn unknown_extension_falls_back_to_json() {
        let settings = parse_from_str(r#"{"controller_id": "ctl-9"}"#, "inline").unwrap();
        assert_eq!(settings.controller_id, "ctl-9");
    }
}
