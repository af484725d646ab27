//! Configuration for an export run.
//!
//! A run is configured either entirely from environment variables (the way a
//! cron job or container is usually wired) or from a TOML file. In the TOML
//! form the bind password is never stored inline: `password_env` names the
//! environment variable holding it, resolved at startup via
//! [`ExportConfig::resolve_env_vars`].

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::errors::ConfigError;

/// Environment variable names, relative to an optional prefix.
pub const ENV_URL: &str = "URL";
pub const ENV_BIND_DN: &str = "BIND_DN";
pub const ENV_PASSWORD: &str = "PASSWORD";
pub const ENV_SERVER_NAME: &str = "SERVER_NAME";
pub const ENV_BASE_DN: &str = "BASE_DN";
pub const ENV_FILTER: &str = "FILTER";
pub const ENV_PASS_FILE: &str = "PASS_FILE";
pub const ENV_ALIAS_FILE: &str = "ALIAS_FILE";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration of one export run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Directory connection and search settings.
    pub directory: DirectoryConfig,

    /// Output file settings.
    pub output: OutputConfig,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".into()
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// LDAP connection, bind and search settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Directory URL, `ldap://host[:port]` (StartTLS) or `ldaps://host[:port]`.
    pub url: String,

    /// Name the server certificate must be valid for.
    pub server_name: String,

    /// DN to bind as.
    pub bind_dn: String,

    /// Environment variable holding the bind password.
    #[serde(default = "default_password_env")]
    pub password_env: String,

    /// Search base DN; the whole subtree below it is searched.
    pub base_dn: String,

    /// LDAP search filter, e.g. `(objectClass=mailUser)`.
    pub filter: String,

    /// Names of the attributes read from each entry.
    #[serde(default)]
    pub attributes: AttributeNames,

    /// Seconds to wait for the TCP connection (default 30).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Resolved bind password (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub password: Option<String>,
}

fn default_password_env() -> String {
    ENV_PASSWORD.into()
}
fn default_connect_timeout() -> u64 {
    30
}

impl DirectoryConfig {
    /// Attribute list requested from the server, in a fixed order.
    pub fn search_attributes(&self) -> Vec<String> {
        vec![
            self.attributes.mail.clone(),
            self.attributes.password.clone(),
            self.attributes.aliases.clone(),
        ]
    }
}

impl fmt::Debug for DirectoryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryConfig")
            .field("url", &self.url)
            .field("server_name", &self.server_name)
            .field("bind_dn", &self.bind_dn)
            .field("password_env", &self.password_env)
            .field("base_dn", &self.base_dn)
            .field("filter", &self.filter)
            .field("attributes", &self.attributes)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Attribute names for the three values extracted from every entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttributeNames {
    /// Primary mail address (single-valued).
    #[serde(default = "default_mail_attr")]
    pub mail: String,

    /// Stored password hash (single-valued).
    #[serde(default = "default_password_attr")]
    pub password: String,

    /// Alias addresses the entry receives mail for (multi-valued).
    #[serde(default = "default_aliases_attr")]
    pub aliases: String,
}

fn default_mail_attr() -> String {
    "email".into()
}
fn default_password_attr() -> String {
    "userPassword".into()
}
fn default_aliases_attr() -> String {
    "emailAlias".into()
}

impl Default for AttributeNames {
    fn default() -> Self {
        Self {
            mail: default_mail_attr(),
            password: default_password_attr(),
            aliases: default_aliases_attr(),
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Where the maps are published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Credential map destination (`user:hash` lines).
    pub credential_file: PathBuf,

    /// Alias map destination. When unset only the credential map is written.
    #[serde(default)]
    pub alias_file: Option<PathBuf>,

    /// Unix permission bits of the published files (default `0o600`).
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
}

fn default_file_mode() -> u32 {
    0o600
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl ExportConfig {
    /// Build the configuration from process environment variables, each name
    /// prefixed with `prefix` (which may be empty).
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(prefix, |name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(prefix: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        info!(prefix, "loading configuration from environment");

        let required = |name: &str, field: &str| -> Result<String, ConfigError> {
            let var = format!("{prefix}{name}");
            match lookup(&var) {
                Some(val) if !val.is_empty() => {
                    debug!(field, env_name = %var, "resolved env var");
                    Ok(val)
                }
                _ => Err(ConfigError::EnvVarMissing {
                    var,
                    field: field.into(),
                }),
            }
        };

        let directory = DirectoryConfig {
            url: required(ENV_URL, "directory.url")?,
            server_name: required(ENV_SERVER_NAME, "directory.server_name")?,
            bind_dn: required(ENV_BIND_DN, "directory.bind_dn")?,
            password_env: format!("{prefix}{ENV_PASSWORD}"),
            base_dn: required(ENV_BASE_DN, "directory.base_dn")?,
            filter: required(ENV_FILTER, "directory.filter")?,
            attributes: AttributeNames::default(),
            connect_timeout_secs: default_connect_timeout(),
            password: Some(required(ENV_PASSWORD, "directory.password_env")?),
        };

        let output = OutputConfig {
            credential_file: PathBuf::from(required(ENV_PASS_FILE, "output.credential_file")?),
            alias_file: lookup(&format!("{prefix}{ENV_ALIAS_FILE}"))
                .filter(|val| !val.is_empty())
                .map(PathBuf::from),
            file_mode: default_file_mode(),
        };

        let config = Self {
            directory,
            output,
            log_level: default_log_level(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML configuration file. Secrets are left unresolved.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration file");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration file parsed");
        Ok(config)
    }

    /// Resolve `*_env` references into their secret values.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    fn resolve_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_name = &self.directory.password_env;
        match lookup(env_name) {
            Some(val) if !val.is_empty() => {
                debug!(field = "directory.password_env", env_name = %env_name, "resolved env var");
                self.directory.password = Some(val);
                Ok(())
            }
            _ => Err(ConfigError::EnvVarMissing {
                var: env_name.clone(),
                field: "directory.password_env".into(),
            }),
        }
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let dir = &self.directory;

        let url = Url::parse(&dir.url).map_err(|e| invalid("directory.url", e.to_string()))?;
        if !matches!(url.scheme(), "ldap" | "ldaps") {
            return Err(invalid(
                "directory.url",
                format!("unsupported scheme '{}', expected ldap or ldaps", url.scheme()),
            ));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(invalid("directory.url", "URL has no host".into()));
        }

        for (field, value) in [
            ("directory.server_name", &dir.server_name),
            ("directory.bind_dn", &dir.bind_dn),
            ("directory.base_dn", &dir.base_dn),
            ("directory.filter", &dir.filter),
            ("directory.attributes.mail", &dir.attributes.mail),
            ("directory.attributes.password", &dir.attributes.password),
            ("directory.attributes.aliases", &dir.attributes.aliases),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(field, "must not be empty".into()));
            }
        }

        let filter = dir.filter.trim();
        if !(filter.starts_with('(') && filter.ends_with(')')) {
            return Err(invalid(
                "directory.filter",
                "filter must be enclosed in parentheses".into(),
            ));
        }

        if dir.connect_timeout_secs == 0 {
            return Err(invalid("directory.connect_timeout_secs", "must be > 0".into()));
        }

        let out = &self.output;
        if out.credential_file.as_os_str().is_empty() {
            return Err(invalid("output.credential_file", "must not be empty".into()));
        }
        if let Some(alias_file) = &out.alias_file {
            if alias_file.as_os_str().is_empty() {
                return Err(invalid("output.alias_file", "must not be empty".into()));
            }
            if alias_file == &out.credential_file {
                return Err(invalid(
                    "output.alias_file",
                    "must differ from output.credential_file".into(),
                ));
            }
        }
        if out.file_mode > 0o777 {
            return Err(invalid(
                "output.file_mode",
                format!("{:#o} is not a valid permission mode", out.file_mode),
            ));
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Destinations in the order they are committed.
    pub fn output_files(&self) -> Vec<&Path> {
        let mut files = Vec::with_capacity(2);
        if let Some(alias_file) = &self.output.alias_file {
            files.push(alias_file.as_path());
        }
        files.push(self.output.credential_file.as_path());
        files
    }
}

fn invalid(field: &str, detail: String) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail,
    }
}
