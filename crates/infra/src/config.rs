//! Configuration loading.
//!
//! Settings come from a TOML file, `~/.dprompts.toml` unless another path is
//! given:
//!
//! ```toml
//! [database]
//! host = "localhost"
//! port = 5432
//! name = "dprompts"
//! user = "postgres"
//! password = ""
//!
//! [llm]
//! api_endpoint = "http://localhost:11434/api/chat"
//! model = "llama3"
//!
//! [worker]
//! concurrency = 10
//! attempt_timeout_secs = 300
//!
//! [schemas]
//! invoice = "schemas/invoice.json"
//! ```
//!
//! Every section and field is optional. `DATABASE_URL`, when set, replaces the
//! connection settings of `[database]` (pool sizing still applies).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgConnectOptions;
use tracing::{debug, info};

use dprompts_ai::OllamaConfig;
use dprompts_core::SchemaRegistry;

pub const CONFIG_FILE_NAME: &str = ".dprompts.toml";
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("schema {name:?}: {message}")]
    Schema { name: String, message: String },

    #[error("invalid database settings: {0}")]
    Database(String),

    #[error("unable to determine the home directory")]
    NoHomeDir,
}

/// `[database]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Full connection URL; takes precedence over the individual fields.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime_secs: u64,
    pub idle_timeout_secs: u64,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            name: "dprompts".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            max_connections: 10,
            min_connections: 2,
            max_lifetime_secs: 60 * 60,
            idle_timeout_secs: 30 * 60,
            acquire_timeout_secs: 30,
        }
    }
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> Result<PgConnectOptions, ConfigError> {
        match self.url.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(url) => url
                .parse()
                .map_err(|e: sqlx::Error| ConfigError::Database(e.to_string())),
            None => Ok(PgConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .database(&self.name)
                .username(&self.user)
                .password(&self.password)),
        }
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// `[worker]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub attempt_timeout_secs: u64,
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
    /// Extra time past the attempt timeout before a running job counts as stuck.
    pub rescue_grace_secs: u64,
    pub maintenance_interval_secs: u64,
    pub completed_retention_hours: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 10,
            attempt_timeout_secs: 5 * 60,
            max_attempts: 25,
            poll_interval_ms: 1000,
            rescue_grace_secs: 60,
            maintenance_interval_secs: 60,
            completed_retention_hours: 72,
        }
    }
}

/// Whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: OllamaConfig,
    pub worker: WorkerSettings,
    /// Schema name → path of a JSON schema file.
    pub schemas: BTreeMap<String, PathBuf>,
    /// Directory relative schema paths are resolved against (the config
    /// file's directory).
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// `~/.dprompts.toml`.
pub fn default_path() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::NoHomeDir)
}

impl AppConfig {
    /// Load the configuration.
    ///
    /// An explicit `path` must exist. Without one, the default file is used if
    /// present and built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = default_path()?;
                if default.exists() {
                    Self::from_file(&default)?
                } else {
                    debug!(path = %default.display(), "no configuration file; using defaults");
                    Self::default()
                }
            }
        };

        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            if !url.trim().is_empty() {
                info!("using database url from {DATABASE_URL_ENV}");
                config.database.url = Some(url);
            }
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Read every schema file named in `[schemas]`.
    pub fn schema_registry(&self) -> Result<SchemaRegistry, ConfigError> {
        let mut schemas = BTreeMap::new();
        for (name, path) in &self.schemas {
            let path = match &self.base_dir {
                Some(base) if path.is_relative() => base.join(path),
                _ => path.clone(),
            };
            let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Schema {
                name: name.clone(),
                message: format!("{}: {e}", path.display()),
            })?;
            let schema: JsonValue =
                serde_json::from_str(&text).map_err(|e| ConfigError::Schema {
                    name: name.clone(),
                    message: format!("{}: {e}", path.display()),
                })?;
            schemas.insert(name.clone(), schema);
        }
        if !schemas.is_empty() {
            info!(count = schemas.len(), "loaded named schemas");
        }
        Ok(SchemaRegistry::new(schemas))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_file_yields_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.database.min_connections, 2);
        assert_eq!(config.worker.attempt_timeout_secs, 300);
        assert_eq!(config.worker.completed_retention_hours, 72);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [database]
            host = "db.internal"
            port = 6543

            [llm]
            model = "mistral"

            [worker]
            concurrency = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.database.host, "db.internal");
        assert_eq!(config.database.port, 6543);
        assert_eq!(config.database.user, "postgres");
        assert_eq!(config.llm.model, "mistral");
        assert!(config.llm.json_mode);
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.worker.max_attempts, 25);
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(AppConfig::from_toml("[database]\nport = \"x\"").is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = AppConfig::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn url_takes_precedence() {
        let config = DatabaseConfig {
            url: Some("postgres://u:p@example.com:5433/other".into()),
            ..Default::default()
        };
        let options = config.connect_options().unwrap();
        assert_eq!(options.get_host(), "example.com");
        assert_eq!(options.get_port(), 5433);
    }

    #[test]
    fn schemas_resolve_relative_to_config_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("invoice.json"), r#"{"type":"object"}"#).unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[schemas]\ninvoice = \"invoice.json\"\n",
        )
        .unwrap();

        let config = AppConfig::from_file(&dir.path().join("config.toml")).unwrap();
        let registry = config.schema_registry().unwrap();
        assert_eq!(registry.get("invoice"), Some(&json!({"type": "object"})));
    }

    #[test]
    fn unreadable_schema_names_the_schema() {
        let config = AppConfig::from_toml("[schemas]\nmissing = \"/nope/missing.json\"").unwrap();
        let err = config.schema_registry().unwrap_err();
        assert!(matches!(err, ConfigError::Schema { ref name, .. } if name == "missing"));
    }
}
