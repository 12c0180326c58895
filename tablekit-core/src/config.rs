use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::backend::ClientOptions;

/// Local emulator account, fixed by the store's tooling.
pub const DEV_ACCOUNT_NAME: &str = "devstoreaccount1";
pub const DEV_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
pub const DEV_TABLE_ENDPOINT: &str = "http://127.0.0.1:10002/devstoreaccount1";

const DEFAULT_PROTOCOL: &str = "https";
const DEFAULT_ENDPOINT_SUFFIX: &str = "core.windows.net";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid connection string: {reason}")]
    InvalidConnectionString { reason: String },

    #[error("Connection string has no AccountName")]
    MissingAccountName,

    #[error("Connection string has neither AccountKey nor SharedAccessSignature")]
    MissingCredentials,

    #[error("Endpoint {endpoint} is not TLS; set allow_insecure_connection to use it")]
    InsecureEndpoint { endpoint: String },

    #[error("Invalid account key: {reason}")]
    InvalidAccountKey { reason: String },

    #[error("Failed to build backend client: {reason}")]
    Client { reason: String },

    #[error("Missing required setting '{field}' (config file or {env})")]
    MissingSetting {
        field: &'static str,
        env: &'static str,
    },

    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// How requests against the store are authorized
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Account key, base64 as it appears in the connection string
    SharedKey { account_key: String },
    /// SAS token without the leading `?`
    SharedAccessSignature { token: String },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SharedKey { .. } => f.write_str("SharedKey { account_key: <redacted> }"),
            Self::SharedAccessSignature { .. } => {
                f.write_str("SharedAccessSignature { token: <redacted> }")
            }
        }
    }
}

/// Parsed table store connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub account_name: Option<String>,
    pub table_endpoint: String,
    pub credential: Credential,
    pub development_storage: bool,
}

impl ConnectionConfig {
    /// Parse `Key=Value;` pairs.
    ///
    /// Keys are case-insensitive. Values may contain `=` (base64 keys, SAS tokens).
    pub fn parse(connection_string: &str) -> Result<Self, ConfigError> {
        let mut settings = HashMap::new();
        for pair in connection_string.split(';').map(str::trim) {
            if pair.is_empty() {
                continue;
            }
            let (key, value) =
                pair.split_once('=')
                    .ok_or_else(|| ConfigError::InvalidConnectionString {
                        reason: format!("expected Key=Value, found '{pair}'"),
                    })?;
            settings.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        if settings.is_empty() {
            return Err(ConfigError::InvalidConnectionString {
                reason: "connection string is empty".to_string(),
            });
        }

        if settings
            .get("usedevelopmentstorage")
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
        {
            return Ok(Self::development_storage());
        }

        let account_name = settings.remove("accountname");
        let credential = match (
            settings.remove("accountkey"),
            settings.remove("sharedaccesssignature"),
        ) {
            (Some(account_key), _) => {
                if account_name.is_none() {
                    return Err(ConfigError::MissingAccountName);
                }
                Credential::SharedKey { account_key }
            }
            (None, Some(token)) => Credential::SharedAccessSignature {
                token: token.trim_start_matches('?').to_string(),
            },
            (None, None) => return Err(ConfigError::MissingCredentials),
        };

        let table_endpoint = match settings.remove("tableendpoint") {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => {
                let account = account_name.as_deref().ok_or(ConfigError::MissingAccountName)?;
                let protocol = settings
                    .remove("defaultendpointsprotocol")
                    .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string());
                let suffix = settings
                    .remove("endpointsuffix")
                    .unwrap_or_else(|| DEFAULT_ENDPOINT_SUFFIX.to_string());
                format!("{protocol}://{account}.table.{suffix}")
            }
        };

        if !table_endpoint.starts_with("http://") && !table_endpoint.starts_with("https://") {
            return Err(ConfigError::InvalidConnectionString {
                reason: format!("unsupported endpoint '{table_endpoint}'"),
            });
        }

        Ok(Self {
            account_name,
            table_endpoint,
            credential,
            development_storage: false,
        })
    }

    /// Local emulator on its well-known port
    pub fn development_storage() -> Self {
        Self {
            account_name: Some(DEV_ACCOUNT_NAME.to_string()),
            table_endpoint: DEV_TABLE_ENDPOINT.to_string(),
            credential: Credential::SharedKey {
                account_key: DEV_ACCOUNT_KEY.to_string(),
            },
            development_storage: true,
        }
    }

    pub fn is_insecure(&self) -> bool {
        self.table_endpoint.starts_with("http://")
    }

    /// Refuse a plain-http endpoint unless the handle's policy permits it.
    ///
    /// Development storage is always plain http and is always permitted.
    pub fn check_transport(&self, options: ClientOptions) -> Result<(), ConfigError> {
        if self.is_insecure() && !options.allow_insecure_connection && !self.development_storage {
            return Err(ConfigError::InsecureEndpoint {
                endpoint: self.table_endpoint.clone(),
            });
        }
        Ok(())
    }
}

/// Load environment variables from .env files.
///
/// Priority order (highest to lowest):
/// 1. Current directory .env
/// 2. ~/.tablekit/.env
/// 3. Environment variables already set
pub fn load_dotenv() {
    let mut loaded_from = Vec::new();

    if let Ok(path) = dotenvy::dotenv() {
        debug!("Loaded .env from current directory: {}", path.display());
        loaded_from.push(path);
    }

    if let Some(env_file) = config_dir().map(|dir| dir.join(".env")) {
        if env_file.exists() {
            // dotenvy doesn't overwrite existing vars
            match dotenvy::from_path(&env_file) {
                Ok(()) => {
                    debug!("Loaded .env from {}", env_file.display());
                    loaded_from.push(env_file);
                }
                Err(e) => debug!("Failed to load {}: {}", env_file.display(), e),
            }
        }
    }

    if loaded_from.is_empty() {
        debug!("No .env files found (current dir or ~/.tablekit)");
    }
}

/// Get the tablekit config directory path (~/.tablekit)
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tablekit"))
}

pub const ENV_CONNECTION_STRING: &str = "TABLEKIT_CONNECTION_STRING";
pub const ENV_TABLE: &str = "TABLEKIT_TABLE";
pub const ENV_ALLOW_INSECURE: &str = "TABLEKIT_ALLOW_INSECURE";

/// Repository configuration, from ~/.tablekit/config.toml plus environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    #[serde(default)]
    pub connection_string: Option<String>,

    #[serde(default)]
    pub table_name: Option<String>,

    #[serde(default)]
    pub allow_insecure_connection: bool,

    /// Provision the table before each create
    #[serde(default)]
    pub create_table_if_not_exists: bool,

    #[serde(default)]
    pub page_size: Option<u32>,

    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl TableConfig {
    /// Get config file path: ~/.tablekit/config.toml
    pub fn config_path() -> PathBuf {
        config_dir()
            .unwrap_or_else(|| PathBuf::from(".tablekit"))
            .join("config.toml")
    }

    /// Load the default config file (if any), then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            debug!("No config file at {:?}, using environment only", path);
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Environment variables override file values.
    pub fn apply_env(&mut self) {
        if let Ok(value) = env::var(ENV_CONNECTION_STRING) {
            self.connection_string = Some(value);
        }
        if let Ok(value) = env::var(ENV_TABLE) {
            self.table_name = Some(value);
        }
        if let Ok(value) = env::var(ENV_ALLOW_INSECURE) {
            self.allow_insecure_connection = matches!(value.as_str(), "1" | "true" | "TRUE");
        }
    }

    pub fn connection(&self) -> Result<ConnectionConfig, ConfigError> {
        let raw = self
            .connection_string
            .as_deref()
            .ok_or(ConfigError::MissingSetting {
                field: "connection_string",
                env: ENV_CONNECTION_STRING,
            })?;
        ConnectionConfig::parse(raw)
    }

    pub fn table_name(&self) -> Result<&str, ConfigError> {
        self.table_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or(ConfigError::MissingSetting {
                field: "table_name",
                env: ENV_TABLE,
            })
    }
}
