//! ldapmaps command-line tool.
//!
//! One-shot batch job meant to be run from cron or a systemd timer: reads
//! mail users and aliases from LDAP and atomically republishes the MTA's
//! credential and alias maps. Also provides helpers to generate and validate
//! a configuration file.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ldapmaps_core::config::ExportConfig;
use ldapmaps_core::directory::LdapDirectory;
use ldapmaps_core::export::Exporter;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Export LDAP mail users and aliases into MTA credential and alias maps.
#[derive(Parser, Debug)]
#[command(name = "ldapmaps", version, about)]
struct Cli {
    /// Path to a TOML configuration file. Without it, settings are read from
    /// environment variables (URL, BIND_DN, PASSWORD, SERVER_NAME, BASE_DN,
    /// FILTER, PASS_FILE and optionally ALIAS_FILE).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Prefix prepended to every environment variable name.
    #[arg(long, global = true, default_value = "")]
    env_prefix: String,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Export the maps once and exit (default).
    Run,

    /// Load and validate the configuration without contacting the directory.
    Validate,

    /// Generate a configuration file template.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./ldapmaps.toml")]
        output: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let mut cli = Cli::parse();
    let command = cli.command.take().unwrap_or(Commands::Run);

    // The config file may carry its own log level, so it is loaded once
    // before the subscriber exists and reported after.
    let loaded = match command {
        Commands::Init { .. } => None,
        _ => Some(load_config(cli.config.as_deref(), &cli.env_prefix)),
    };
    let file_level = match (&cli.config, &loaded) {
        (Some(_), Some(Ok(config))) => Some(config.log_level.as_str()),
        _ => None,
    };
    init_tracing(log_directive(cli.log_level.as_deref(), file_level));

    match run(command, &cli, loaded) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// `--log-level` wins over the config file; `None` falls back to `RUST_LOG`.
fn log_directive<'a>(flag: Option<&'a str>, file_level: Option<&'a str>) -> Option<&'a str> {
    flag.or(file_level)
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(command: Commands, cli: &Cli, loaded: Option<Result<ExportConfig>>) -> Result<()> {
    if let Commands::Init { output } = command {
        return cmd_init(&output);
    }

    let config = match loaded {
        Some(loaded) => loaded?,
        None => load_config(cli.config.as_deref(), &cli.env_prefix)?,
    };
    log_source(cli.config.as_deref(), &cli.env_prefix);
    match command {
        Commands::Validate => cmd_validate(&config),
        _ => cmd_run(config),
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: Option<&Path>, env_prefix: &str) -> Result<ExportConfig> {
    match path {
        Some(path) => ExportConfig::load_and_resolve(path)
            .with_context(|| format!("unable to load configuration from {}", path.display())),
        None => ExportConfig::from_env(env_prefix).context("unable to parse environment"),
    }
}

fn log_source(path: Option<&Path>, env_prefix: &str) {
    match path {
        Some(path) => info!(path = %path.display(), "configuration loaded from file"),
        None => info!(prefix = env_prefix, "configuration loaded from environment"),
    }
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_run(config: ExportConfig) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        url = %config.directory.url,
        base_dn = %config.directory.base_dn,
        credential_file = %config.output.credential_file.display(),
        alias_file = ?config.output.alias_file,
        "starting export"
    );

    let mut directory = LdapDirectory::connect(&config.directory)?;
    let result = Exporter::new(config).run(&mut directory);
    directory.unbind();

    let report = result?;
    info!(
        published = report.published.len(),
        "all maps published"
    );
    Ok(())
}

fn cmd_validate(config: &ExportConfig) -> Result<()> {
    info!(
        url = %config.directory.url,
        server_name = %config.directory.server_name,
        outputs = ?config.output_files(),
        "configuration is valid"
    );
    Ok(())
}

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        bail!(
            "refusing to overwrite existing file: {}",
            output.display()
        );
    }

    std::fs::write(output, CONFIG_TEMPLATE)
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!(path = %output.display(), "configuration template written");
    Ok(())
}

const CONFIG_TEMPLATE: &str = r#"# ldapmaps configuration
#
# Run with: ldapmaps --config /etc/ldapmaps.toml

# trace, debug, info, warn, error
log_level = "info"

[directory]
# ldap:// upgrades with StartTLS, ldaps:// uses TLS from the start.
url = "ldap://ldap.example.com:389"
# Name the server certificate must be valid for.
server_name = "ldap.example.com"
bind_dn = "cn=mailsync,ou=services,dc=example,dc=com"
# Environment variable holding the bind password.
password_env = "LDAPMAPS_BIND_PASSWORD"
base_dn = "ou=people,dc=example,dc=com"
filter = "(objectClass=mailUser)"
connect_timeout_secs = 30

[directory.attributes]
mail = "email"
password = "userPassword"
aliases = "emailAlias"

[output]
credential_file = "/etc/mail/passwd"
# Remove to publish the credential map only.
alias_file = "/etc/mail/aliases"
file_mode = 0o600
"#;
