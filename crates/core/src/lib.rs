//! ldapmaps core library.
//!
//! Reads mail users and their aliases from an LDAP directory and publishes
//! them as the flat credential and alias maps a mail transfer agent reads:
//! configuration, the directory adapter, record extraction and map building,
//! atomic file publishing, and the export pipeline tying them together.

pub mod config;
pub mod directory;
pub mod errors;
pub mod export;
pub mod publish;
pub mod records;

// Re-exports for convenience.
pub use config::ExportConfig;
pub use directory::{DirectorySource, LdapDirectory, SearchRequest};
pub use errors::ExportError;
pub use export::{ExportReport, Exporter};
