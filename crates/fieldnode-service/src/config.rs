//! Server configuration.

use std::path::{Path, PathBuf};

use fieldnode_types::ReadingShape;
use serde::{Deserialize, Serialize};

/// Default broker URL.
pub const DEFAULT_BROKER: &str = "mqtt://localhost:1883";
/// Default subscription topic.
pub const DEFAULT_TOPIC: &str = "sensors/environment";

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Broker session settings.
    pub mqtt: MqttConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        // Create parent directories if needed
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return any errors.
    ///
    /// With `ingest` disabled the `[mqtt]` section is not checked, since no
    /// broker session will be started.
    ///
    /// # Example
    ///
    /// ```
    /// use fieldnode_service::Config;
    ///
    /// let mut config = Config::default();
    /// config.mqtt.username = Some("collector".to_string());
    /// config.mqtt.password = Some("secret".to_string());
    /// config.validate(true).expect("userpass config should be valid");
    /// ```
    pub fn validate(&self, ingest: bool) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.storage.validate());
        if ingest {
            errors.extend(self.mqtt.validate());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl ServerConfig {
    /// Validate server configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.bind.is_empty() {
            errors.push(ValidationError::new(
                "server.bind",
                "bind address cannot be empty",
            ));
        } else {
            // Check for valid host:port format
            match self.bind.rsplit_once(':') {
                None => errors.push(ValidationError::new(
                    "server.bind",
                    format!(
                        "invalid bind address '{}': expected format 'host:port'",
                        self.bind
                    ),
                )),
                Some((_, port)) => match port.parse::<u16>() {
                    Ok(0) => errors.push(ValidationError::new("server.bind", "port cannot be 0")),
                    Err(_) => errors.push(ValidationError::new(
                        "server.bind",
                        format!("invalid port '{}': must be a number 1-65535", port),
                    )),
                    Ok(_) => {}
                },
            }
        }

        errors
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
    /// Reading shape the database is committed to.
    pub shape: ReadingShape,
    /// Retention ceiling: readings kept after each ingest.
    pub max_records: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: fieldnode_store::default_db_path(),
            shape: ReadingShape::default(),
            max_records: fieldnode_store::DEFAULT_MAX_RECORDS,
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.path",
                "database path cannot be empty",
            ));
        }

        if self.max_records == 0 {
            errors.push(ValidationError::new(
                "storage.max_records",
                "max_records must be at least 1",
            ));
        }

        errors
    }
}

/// Authentication mode names accepted in `mqtt.auth_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthModeKind {
    /// Mutual TLS with client certificates.
    Cert,
    /// API key sent as the MQTT username.
    ApiKey,
    /// Username and password.
    Userpass,
}

impl AuthModeKind {
    fn as_str(&self) -> &'static str {
        match self {
            AuthModeKind::Cert => "cert",
            AuthModeKind::ApiKey => "api_key",
            AuthModeKind::Userpass => "userpass",
        }
    }

    fn fields(&self) -> &'static [&'static str] {
        match self {
            AuthModeKind::Cert => &["ca_file", "cert_file", "key_file"],
            AuthModeKind::ApiKey => &["api_key"],
            AuthModeKind::Userpass => &["username", "password"],
        }
    }
}

impl std::fmt::Display for AuthModeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved broker authentication. Exactly one mode per process.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// Mutual TLS; paths to PEM files.
    Cert {
        ca_file: PathBuf,
        cert_file: PathBuf,
        key_file: PathBuf,
    },
    /// API key, sent as the username with an empty password.
    ApiKey { key: String },
    /// Plain credentials.
    UserPass { username: String, password: String },
}

impl AuthMode {
    /// The mode's configuration name.
    pub fn kind(&self) -> AuthModeKind {
        match self {
            AuthMode::Cert { .. } => AuthModeKind::Cert,
            AuthMode::ApiKey { .. } => AuthModeKind::ApiKey,
            AuthMode::UserPass { .. } => AuthModeKind::Userpass,
        }
    }
}

// Credentials stay out of logs.
impl std::fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMode::Cert {
                ca_file,
                cert_file,
                key_file,
            } => f
                .debug_struct("Cert")
                .field("ca_file", ca_file)
                .field("cert_file", cert_file)
                .field("key_file", key_file)
                .finish(),
            AuthMode::ApiKey { .. } => f.debug_struct("ApiKey").finish_non_exhaustive(),
            AuthMode::UserPass { username, .. } => f
                .debug_struct("UserPass")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

/// Broker session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker URL (`mqtt://host[:port]` or `mqtts://host[:port]`).
    pub broker: String,
    /// Topic to subscribe to.
    pub topic: String,
    /// MQTT client identifier.
    pub client_id: String,
    /// Keep-alive interval in seconds.
    pub keep_alive: u64,
    /// Subscription QoS (0, 1 or 2).
    pub qos: u8,
    /// Explicit authentication mode; inferred from the fields when omitted.
    pub auth_mode: Option<AuthModeKind>,
    /// CA certificate (PEM), `cert` mode.
    pub ca_file: Option<PathBuf>,
    /// Client certificate (PEM), `cert` mode.
    pub cert_file: Option<PathBuf>,
    /// Client private key (PEM), `cert` mode.
    pub key_file: Option<PathBuf>,
    /// API key, `api_key` mode.
    pub api_key: Option<String>,
    /// Username, `userpass` mode.
    pub username: Option<String>,
    /// Password, `userpass` mode.
    pub password: Option<String>,
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: DEFAULT_BROKER.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            client_id: "fieldnode-collector".to_string(),
            keep_alive: 30,
            qos: 1,
            auth_mode: None,
            ca_file: None,
            cert_file: None,
            key_file: None,
            api_key: None,
            username: None,
            password: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl MqttConfig {
    fn present_fields(&self, kind: AuthModeKind) -> Vec<&'static str> {
        let present = |field: &str| match field {
            "ca_file" => self.ca_file.is_some(),
            "cert_file" => self.cert_file.is_some(),
            "key_file" => self.key_file.is_some(),
            "api_key" => self.api_key.is_some(),
            "username" => self.username.is_some(),
            "password" => self.password.is_some(),
            _ => false,
        };
        kind.fields()
            .iter()
            .copied()
            .filter(|f| present(f))
            .collect()
    }

    /// Resolve the authentication mode.
    ///
    /// The explicit `auth_mode` wins; otherwise the mode is inferred from
    /// which fields are set. The chosen mode must have all of its fields and
    /// no field of another mode may be set.
    pub fn auth(&self) -> Result<AuthMode, Vec<ValidationError>> {
        const KINDS: [AuthModeKind; 3] = [
            AuthModeKind::Cert,
            AuthModeKind::ApiKey,
            AuthModeKind::Userpass,
        ];

        let kind = match self.auth_mode {
            Some(kind) => kind,
            None => {
                let candidates: Vec<AuthModeKind> = KINDS
                    .into_iter()
                    .filter(|k| !self.present_fields(*k).is_empty())
                    .collect();
                match candidates.as_slice() {
                    [kind] => *kind,
                    [] => {
                        return Err(vec![ValidationError::new(
                            "mqtt.auth_mode",
                            "no authentication configured: set ca_file/cert_file/key_file, \
                             api_key, or username/password",
                        )]);
                    }
                    many => {
                        let names: Vec<&str> = many.iter().map(|k| k.as_str()).collect();
                        return Err(vec![ValidationError::new(
                            "mqtt.auth_mode",
                            format!(
                                "ambiguous authentication: fields for {} are all set",
                                names.join(", ")
                            ),
                        )]);
                    }
                }
            }
        };

        let mut errors = Vec::new();
        let present = self.present_fields(kind);
        for field in kind.fields() {
            if !present.contains(field) {
                errors.push(ValidationError::new(
                    format!("mqtt.{}", field),
                    format!("required for auth_mode '{}'", kind.as_str()),
                ));
            }
        }
        for other in KINDS.into_iter().filter(|k| *k != kind) {
            for field in self.present_fields(other) {
                errors.push(ValidationError::new(
                    format!("mqtt.{}", field),
                    format!("not allowed with auth_mode '{}'", kind.as_str()),
                ));
            }
        }

        let mode = match kind {
            AuthModeKind::Cert => match (&self.ca_file, &self.cert_file, &self.key_file) {
                (Some(ca_file), Some(cert_file), Some(key_file)) => Some(AuthMode::Cert {
                    ca_file: ca_file.clone(),
                    cert_file: cert_file.clone(),
                    key_file: key_file.clone(),
                }),
                _ => None,
            },
            AuthModeKind::ApiKey => self.api_key.clone().map(|key| AuthMode::ApiKey { key }),
            AuthModeKind::Userpass => match (&self.username, &self.password) {
                (Some(username), Some(password)) => Some(AuthMode::UserPass {
                    username: username.clone(),
                    password: password.clone(),
                }),
                _ => None,
            },
        };

        match mode {
            Some(mode) if errors.is_empty() => Ok(mode),
            _ => Err(errors),
        }
    }

    /// Validate broker configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Err(e) = crate::bus::parse_broker_url(&self.broker) {
            errors.push(ValidationError::new("mqtt.broker", e));
        }

        if self.topic.is_empty() {
            errors.push(ValidationError::new("mqtt.topic", "topic cannot be empty"));
        }

        if self.client_id.is_empty() {
            errors.push(ValidationError::new(
                "mqtt.client_id",
                "client_id cannot be empty",
            ));
        }

        if self.qos > 2 {
            errors.push(ValidationError::new(
                "mqtt.qos",
                format!("invalid qos {}: must be 0, 1 or 2", self.qos),
            ));
        }

        if self.keep_alive == 0 {
            errors.push(ValidationError::new(
                "mqtt.keep_alive",
                "keep_alive must be at least 1 second",
            ));
        }

        if let Err(auth_errors) = self.auth() {
            errors.extend(auth_errors);
        }

        errors.extend(self.reconnect.validate());

        errors
    }
}

/// Reconnect policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Base delay between attempts, in seconds.
    pub delay_secs: u64,
    /// Upper bound on the delay, in seconds.
    pub max_delay_secs: u64,
    /// Add up to 25 % random jitter.
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay_secs: 5,
            max_delay_secs: 30,
            jitter: true,
        }
    }
}

impl ReconnectConfig {
    /// Validate reconnect configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.delay_secs == 0 {
            errors.push(ValidationError::new(
                "mqtt.reconnect.delay_secs",
                "delay must be at least 1 second",
            ));
        }
        if self.max_delay_secs < self.delay_secs {
            errors.push(ValidationError::new(
                "mqtt.reconnect.max_delay_secs",
                format!(
                    "max delay {} is shorter than delay {}",
                    self.max_delay_secs, self.delay_secs
                ),
            ));
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `server.bind` or `mqtt.api_key`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fieldnode")
        .join("server.toml")
}
