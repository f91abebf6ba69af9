//! Configuration management for subsysd.
use regex::Regex;
use serde::Deserialize;
use std::{
    env, fs,
    net::SocketAddr,
    path::Path,
    sync::OnceLock,
};

use crate::{
    constants::{
        CONFIG_VERSION, DEFAULT_ACCEPT_POLL, DEFAULT_CONFIG_FILE, DEFAULT_CONNECTION_TIMEOUT,
        DEFAULT_LISTEN, DEFAULT_SERVER_NAME, DEFAULT_SHUTDOWN_GRACE,
    },
    dispatcher::DispatcherConfig,
    error::ConfigError,
    timeout::Timeout,
};

/// Represents the structure of the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Configuration version.
    pub version: String,
    /// Listener and root subsystem settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Worker pool serving accepted connections.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// How long the binary waits for the tree to unwind after a shutdown request.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: Timeout,
}

/// Settings of the echo server root.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name of the root subsystem; the dispatcher is named after it.
    pub name: String,
    /// Address to bind; port 0 picks a free port.
    pub listen: SocketAddr,
    /// How often the acceptor re-checks termination while no client connects.
    pub accept_poll: Timeout,
    /// A connection idle for this long is closed.
    pub connection_timeout: Timeout,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SERVER_NAME.to_string(),
            listen: DEFAULT_LISTEN,
            accept_poll: Timeout::from_duration(DEFAULT_ACCEPT_POLL),
            connection_timeout: Timeout::from_duration(DEFAULT_CONNECTION_TIMEOUT),
        }
    }
}

fn default_shutdown_grace() -> Timeout {
    Timeout::from_duration(DEFAULT_SHUTDOWN_GRACE)
}

impl Config {
    /// Parses a YAML document after expanding `${VAR}` / `$VAR` references.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content)?;
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the semantic constraints the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != CONFIG_VERSION {
            return Err(ConfigError::Invalid(format!(
                "unsupported version '{}' (expected '{CONFIG_VERSION}')",
                self.version
            )));
        }
        if self.server.name.trim().is_empty() {
            return Err(ConfigError::Invalid("server.name must not be empty".into()));
        }
        if self.server.accept_poll.is_zero() {
            return Err(ConfigError::Invalid("server.accept_poll must be positive".into()));
        }
        if self.server.connection_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "server.connection_timeout must be positive".into(),
            ));
        }
        self.dispatcher
            .validate()
            .map_err(|err| ConfigError::Invalid(format!("dispatcher: {err}")))
    }
}

fn env_var_pattern() -> Result<&'static Regex, ConfigError> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    if let Some(re) = PATTERN.get() {
        return Ok(re);
    }
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .map_err(|err| ConfigError::Invalid(err.to_string()))?;
    Ok(PATTERN.get_or_init(|| re))
}

/// Expands environment variables within a string.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = env_var_pattern()?;
    if let Some(missing) = re
        .captures_iter(input)
        .map(|caps| caps[1].to_string())
        .find(|name| env::var(name).is_err())
    {
        return Err(ConfigError::MissingEnvVar(missing));
    }

    let result = re.replace_all(input, |caps: &regex::Captures| {
        env::var(&caps[1]).unwrap_or_default()
    });
    Ok(result.into_owned())
}

/// Loads, expands and validates the configuration file.
pub fn load_config(config_path: Option<&str>) -> Result<Config, ConfigError> {
    let config_path = Path::new(config_path.unwrap_or(DEFAULT_CONFIG_FILE));

    let content = fs::read_to_string(config_path).map_err(|e| {
        ConfigError::Read(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    Config::from_yaml(&content)
}
