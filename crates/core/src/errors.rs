//! Error types for the ldapmaps core library.
//!
//! Each stage of the export has its own error type derived with `thiserror`,
//! and a top-level [`ExportError`] enum unifies them for callers that want a
//! single error type.

use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for a whole export run.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Directory errors
// ---------------------------------------------------------------------------

/// Errors from talking to the LDAP directory, one variant per stage so the
/// operator can tell where the run stopped.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The directory URL could not be understood.
    #[error("invalid directory URL '{url}': {detail}")]
    InvalidUrl { url: String, detail: String },

    /// TCP connection to the server failed.
    #[error("unable to connect to ldap at '{address}': {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// TLS negotiation failed (StartTLS or LDAPS), including identity mismatch.
    #[error("unable to upgrade to tls (expected server name '{server_name}'): {source}")]
    Encrypt {
        server_name: String,
        #[source]
        source: ldap3::LdapError,
    },

    /// The simple bind was rejected.
    #[error("unable to bind as '{bind_dn}': {source}")]
    Bind {
        bind_dn: String,
        #[source]
        source: ldap3::LdapError,
    },

    /// The subtree search failed.
    #[error("unable to search under '{base_dn}' with filter '{filter}': {source}")]
    Search {
        base_dn: String,
        filter: String,
        #[source]
        source: ldap3::LdapError,
    },
}

// ---------------------------------------------------------------------------
// Publish errors
// ---------------------------------------------------------------------------

/// Errors from staging and publishing output files.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The temporary sibling of a destination could not be created.
    #[error("unable to create temporary file for '{}': {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing, flushing or syncing the temporary file failed.
    #[error("unable to write temporary file for '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Renaming the temporary file over the destination failed.
    #[error("unable to replace '{}': {source}", path.display())]
    Rename {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A later rename failed after earlier files were already replaced.
    #[error(
        "unable to replace '{}' after publishing {}: {source}",
        failed.display(),
        display_paths(published)
    )]
    PartialCommit {
        published: Vec<PathBuf>,
        failed: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("'{}'", p.display()))
        .collect::<Vec<_>>()
        .join(", ")
}
