use super::types::AppConfig;
use crate::environment::RuntimeEnvironment;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

lazy_static! {
    static ref ENV_VAR_PATTERN: Regex =
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid env var regex");
}

/// Nesting deeper than this is left untouched by substitution
const MAX_SUBSTITUTION_DEPTH: usize = 50;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Pick the configuration file to load.
///
/// Order: explicit path, `CONFIG_FILE` (absolute or relative to `root`),
/// `config/config.k8s.yaml` inside a cluster, then `config/config.yaml`.
pub fn resolve_config_path(
    explicit: Option<&Path>,
    root: &Path,
    environment: RuntimeEnvironment,
) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(from_env) = std::env::var("CONFIG_FILE") {
        if !from_env.trim().is_empty() {
            let path = PathBuf::from(from_env);
            return if path.is_absolute() {
                path
            } else {
                root.join(path)
            };
        }
    }
    if environment.is_kubernetes() {
        let k8s = root.join("config").join("config.k8s.yaml");
        if k8s.exists() {
            return k8s;
        }
    }
    root.join("config").join("config.yaml")
}

/// Load the configuration from disk. A missing file yields defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<(AppConfig, Option<PathBuf>), ConfigError> {
    let root = std::env::current_dir().map_err(|e| ConfigError::Io {
        path: PathBuf::from("."),
        source: e,
    })?;
    let environment = RuntimeEnvironment::detect();
    let path = resolve_config_path(explicit, &root, environment);

    if !path.exists() {
        if explicit.is_some() {
            return Err(ConfigError::Io {
                path: path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
            });
        }
        warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok((AppConfig::default(), None));
    }

    let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
        path: path.clone(),
        source: e,
    })?;
    let config = parse_config(&raw)?;
    info!(
        path = %path.display(),
        environment = environment.as_str(),
        bridges = config.bridges.len(),
        "Loaded configuration"
    );
    Ok((config, Some(path)))
}

/// Parse a YAML document, substituting environment variables first.
pub fn parse_config(raw: &str) -> Result<AppConfig, ConfigError> {
    let document: Value = serde_yaml::from_str(raw)?;
    if document.is_null() {
        return Ok(AppConfig::default());
    }
    let document = substitute_env_vars(document, &|name| std::env::var(name).ok());
    let config: AppConfig = serde_yaml::from_value(document)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    if config.engine.max_steps == 0 {
        return Err(ConfigError::Invalid(
            "engine.max_steps must be at least 1".to_string(),
        ));
    }
    if config.engine.event_buffer == 0 {
        return Err(ConfigError::Invalid(
            "engine.event_buffer must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Replace `${VAR}` and `${VAR:-default}` in every string of a YAML tree.
///
/// Unset variables without a default are kept verbatim.
pub fn substitute_env_vars(value: Value, lookup: &dyn Fn(&str) -> Option<String>) -> Value {
    substitute_at_depth(value, lookup, 0)
}

fn substitute_at_depth(value: Value, lookup: &dyn Fn(&str) -> Option<String>, depth: usize) -> Value {
    if depth > MAX_SUBSTITUTION_DEPTH {
        warn!("Config nesting exceeds {} levels, skipping env substitution", MAX_SUBSTITUTION_DEPTH);
        return value;
    }
    match value {
        Value::String(s) => Value::String(substitute_str(&s, lookup)),
        Value::Sequence(items) => Value::Sequence(
            items
                .into_iter()
                .map(|v| substitute_at_depth(v, lookup, depth + 1))
                .collect(),
        ),
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(k, v)| (k, substitute_at_depth(v, lookup, depth + 1)))
                .collect(),
        ),
        other => other,
    }
}

fn substitute_str(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |caps: &Captures| {
            let name = &caps[1];
            match (lookup(name), caps.get(2)) {
                (Some(v), _) => v,
                (None, Some(default)) => default.as_str().to_string(),
                (None, None) => {
                    warn!("Environment variable {} not set and no default provided", name);
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}
