use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use tracing::info;

use crate::auth::AuthenticatorConfig;
use crate::credentials::CredentialsConfig;
use crate::error::GatewayError;
use crate::probe::ProbeConfig;
use crate::retry::RetryConfig;
use crate::session::SessionRegistryConfig;

/// Env var naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "GATEWAY_AUTH_CONFIG";

const CONFIG_FILE_NAME: &str = "gateway-auth.json";

/// Top-level configuration file. Every section and field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayAuthConfig {
    #[serde(default)]
    pub sessions: SessionRegistryConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub auth: AuthenticatorConfig,
}

impl GatewayAuthConfig {
    /// Parse a JSON document, expanding `${VAR}` in every string value first.
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        Self::from_json_str_with(raw, |name| env::var(name).ok())
    }

    /// [`from_json_str`](Self::from_json_str) with `${NAME}` resolved through `lookup`.
    pub fn from_json_str_with<F>(raw: &str, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut value: Value = serde_json::from_str(raw)?;
        expand_value(&mut value, &lookup);
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        self.retry.validate()
    }

    /// Load from `path`, or from [`resolve_config_path`] when `None`.
    ///
    /// With no file anywhere, the built-in defaults are used.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => resolve_config_path(),
        };

        let Some(path) = path else {
            info!("No {} found; using default configuration", CONFIG_FILE_NAME);
            return Ok(Self::default());
        };

        let raw = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config = Self::from_json_str(&raw)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}

/// `$GATEWAY_AUTH_CONFIG`, then `$XDG_CONFIG_HOME/unicity/gateway-auth.json`,
/// then `./gateway-auth.json`.
///
/// An explicit env var path is returned even if the file is missing, so
/// loading reports the error instead of silently using defaults.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var(CONFIG_ENV_VAR) {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("unicity").join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from(CONFIG_FILE_NAME);
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

/// Replace `${NAME}` with the value of env var `NAME`; unknown names are kept verbatim.
pub fn expand_env_vars(input: &str) -> String {
    expand_vars_with(input, |name| env::var(name).ok())
}

/// [`expand_env_vars`] with values supplied by `lookup`.
pub fn expand_vars_with<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                name.push(c);
            }
            match lookup(&name) {
                Some(val) if closed => out.push_str(&val),
                _ => {
                    out.push_str("${");
                    out.push_str(&name);
                    if closed {
                        out.push('}');
                    }
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn expand_value<F>(value: &mut Value, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(s) => *s = expand_vars_with(s, lookup),
        Value::Array(items) => items.iter_mut().for_each(|item| expand_value(item, lookup)),
        Value::Object(map) => map.values_mut().for_each(|item| expand_value(item, lookup)),
        _ => {}
    }
}
