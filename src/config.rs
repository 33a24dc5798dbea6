use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const ENV_CLIENT_ID: &str = "MICROSOFT_APP_ID";
const ENV_CLIENT_SECRET: &str = "MICROSOFT_APP_SECRET";
const ENV_TENANT: &str = "MICROSOFT_APP_TENANT";
const ENV_REDIRECT_URI: &str = "REDIRECT_URI";
const ENV_DATABASE_PATH: &str = "ONEDRIVE_GATEWAY_DB";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

/// Process-wide settings, loaded once at startup and passed down by value.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub auth: AuthConfig,
    pub graph: GraphConfig,
    pub storage: StorageConfig,
    pub session: SessionConfig,
    pub upload: UploadConfig,
}

#[derive(Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub tenant: String,
    pub redirect_uri: Option<String>,
    pub scopes: Vec<String>,
    pub authority: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            tenant: "common".to_string(),
            redirect_uri: None,
            scopes: vec![
                "offline_access".to_string(),
                "User.Read".to_string(),
                "Files.ReadWrite.All".to_string(),
            ],
            authority: "https://login.microsoftonline.com".to_string(),
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .field("tenant", &self.tenant)
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("authority", &self.authority)
            .finish()
    }
}

impl AuthConfig {
    pub fn authorize_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/authorize",
            self.authority.trim_end_matches('/'),
            self.tenant
        )
    }

    pub fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority.trim_end_matches('/'),
            self.tenant
        )
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GraphConfig {
    pub api_root: String,
    pub request_timeout_secs: u64,
    pub upload_timeout_secs: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            api_root: "https://graph.microsoft.com/v1.0".to_string(),
            request_timeout_secs: 30,
            upload_timeout_secs: 120,
        }
    }
}

impl GraphConfig {
    pub fn drive_base(&self) -> String {
        format!("{}/me/drive", self.api_root.trim_end_matches('/'))
    }

    pub fn profile_url(&self) -> String {
        format!("{}/me", self.api_root.trim_end_matches('/'))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Falls back to the platform data directory when unset.
    pub database_path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub refresh_threshold_secs: i64,
    pub background_interval_secs: u64,
    pub background_threshold_secs: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_threshold_secs: 5 * 60,
            background_interval_secs: 5 * 60,
            background_threshold_secs: 10 * 60,
        }
    }
}

impl SessionConfig {
    pub fn refresh_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_threshold_secs)
    }

    pub fn background_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.background_threshold_secs)
    }

    pub fn background_interval(&self) -> Duration {
        Duration::from_secs(self.background_interval_secs.max(1))
    }
}

/// Server-side naming policy applied when the destination already exists.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictBehavior {
    #[default]
    Rename,
    Replace,
    Fail,
}

impl ConflictBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictBehavior::Rename => "rename",
            ConflictBehavior::Replace => "replace",
            ConflictBehavior::Fail => "fail",
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct UploadConfig {
    pub conflict_behavior: ConflictBehavior,
    pub max_chunk_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub max_concurrent: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            conflict_behavior: ConflictBehavior::Rename,
            max_chunk_attempts: 3,
            retry_base_delay_ms: 500,
            max_concurrent: 2,
        }
    }
}

impl Config {
    /// Reads `path` when it exists (defaults otherwise), then applies the
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                tracing::warn!(?path, "config file not found, using defaults");
                Config::default()
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(value) = non_empty(ENV_CLIENT_ID) {
            self.auth.client_id = value;
        }
        if let Some(value) = non_empty(ENV_CLIENT_SECRET) {
            self.auth.client_secret = Some(value);
        }
        if let Some(value) = non_empty(ENV_TENANT) {
            self.auth.tenant = value;
        }
        if let Some(value) = non_empty(ENV_REDIRECT_URI) {
            self.auth.redirect_uri = Some(value);
        }
        if let Some(value) = non_empty(ENV_DATABASE_PATH) {
            self.storage.database_path = Some(PathBuf::from(value));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "auth.client_id is required (or set {ENV_CLIENT_ID})"
            )));
        }
        if self.upload.max_chunk_attempts == 0 {
            return Err(ConfigError::Invalid(
                "upload.max_chunk_attempts must be at least 1".to_string(),
            ));
        }
        if self.upload.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "upload.max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Source of the OAuth client secret. The token client asks on every request,
/// so a rotated secret takes effect without restarting or rewriting files.
pub trait SecretProvider: Send + Sync {
    fn client_secret(&self) -> Option<String>;
}

pub struct StaticSecret(Option<String>);

impl StaticSecret {
    pub fn new(secret: Option<String>) -> Self {
        Self(secret.filter(|s| !s.trim().is_empty()))
    }
}

impl SecretProvider for StaticSecret {
    fn client_secret(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Re-reads an environment variable each time, falling back to a fixed value.
pub struct EnvSecret {
    var: String,
    fallback: Option<String>,
}

impl EnvSecret {
    pub fn new(var: impl Into<String>, fallback: Option<String>) -> Self {
        Self {
            var: var.into(),
            fallback,
        }
    }

    pub fn client_secret_from_env(fallback: Option<String>) -> Self {
        Self::new(ENV_CLIENT_SECRET, fallback)
    }
}

impl SecretProvider for EnvSecret {
    fn client_secret(&self) -> Option<String> {
        std::env::var(&self.var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.fallback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_protocol_expectations() {
        let config = Config::default();
        assert_eq!(config.session.refresh_threshold_secs, 300);
        assert_eq!(config.auth.tenant, "common");
        assert_eq!(config.upload.conflict_behavior, ConflictBehavior::Rename);
        assert_eq!(
            config.auth.token_url(),
            "https://login.microsoftonline.com/common/oauth2/v2.0/token"
        );
        assert_eq!(
            config.graph.drive_base(),
            "https://graph.microsoft.com/v1.0/me/drive"
        );
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [auth]
            client_id = "abc"

            [upload]
            conflict_behavior = "replace"
            max_concurrent = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.auth.client_id, "abc");
        assert_eq!(config.auth.tenant, "common");
        assert_eq!(config.upload.conflict_behavior, ConflictBehavior::Replace);
        assert_eq!(config.upload.max_concurrent, 4);
        assert_eq!(config.upload.max_chunk_attempts, 3);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = Config::default();
        config.auth.client_id = "from-file".to_string();
        let env: HashMap<&str, &str> = [
            ("MICROSOFT_APP_ID", "from-env"),
            ("MICROSOFT_APP_TENANT", "contoso"),
            ("MICROSOFT_APP_SECRET", "  "),
        ]
        .into_iter()
        .collect();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.auth.client_id, "from-env");
        assert_eq!(config.auth.tenant, "contoso");
        assert!(config.auth.client_secret.is_none());
    }

    #[test]
    fn validate_requires_client_id() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn debug_output_hides_secret() {
        let mut config = AuthConfig::default();
        config.client_secret = Some("hunter2".to_string());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
    }
}
