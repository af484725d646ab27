//! The export pipeline: search once, build both maps, publish them.
//!
//! 1. Run the configured subtree search against a [`DirectorySource`].
//! 2. Extract a [`MailRecord`] from every entry.
//! 3. Stage, write and seal the credential map and, when configured, the
//!    alias map.
//! 4. Commit the alias map, then the credential map.
//!
//! Any error stops the run at the stage it happened in. Nothing is renamed
//! until both maps have been written and synced.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::config::ExportConfig;
use crate::directory::{DirectorySource, SearchRequest};
use crate::errors::ExportError;
use crate::publish::{Publication, StagedFile};
use crate::records::{write_aliases, write_credentials, AliasTable, MailRecord};

/// Summary of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportReport {
    /// Entries returned by the search.
    pub entries: usize,
    /// Lines written to the credential map.
    pub credential_lines: usize,
    /// Lines written to the alias map, if one is configured.
    pub alias_lines: Option<usize>,
    /// Destinations replaced, in commit order.
    pub published: Vec<PathBuf>,
}

/// Runs one export with a fixed configuration.
#[derive(Debug, Clone)]
pub struct Exporter {
    config: ExportConfig,
}

impl Exporter {
    pub fn new(config: ExportConfig) -> Self {
        Self { config }
    }

    /// Search `source` and publish the maps.
    pub fn run<S>(&self, source: &mut S) -> Result<ExportReport, ExportError>
    where
        S: DirectorySource + ?Sized,
    {
        let directory = &self.config.directory;
        let output = &self.config.output;

        let request = SearchRequest::from_config(directory);
        let entries = source.search(&request)?;

        let records: Vec<MailRecord> = entries
            .iter()
            .map(|entry| MailRecord::extract(entry, &directory.attributes))
            .collect();
        let without_mail = records.iter().filter(|r| r.mail.is_empty()).count();
        if without_mail > 0 {
            warn!(
                count = without_mail,
                attribute = %directory.attributes.mail,
                "entries without a mail value produce empty user names"
            );
        }
        debug!(records = records.len(), "extracted mail records");

        let mut credentials = StagedFile::create(&output.credential_file, output.file_mode)?;
        let credential_lines = credentials.write_with(|w| write_credentials(w, &records))?;
        let credentials = credentials.seal()?;

        let mut publication = Publication::new();
        let mut alias_lines = None;
        if let Some(alias_file) = &output.alias_file {
            let table = AliasTable::build(&records);
            let mut aliases = StagedFile::create(alias_file, output.file_mode)?;
            let lines = aliases.write_with(|w| write_aliases(w, &table))?;
            publication.add(aliases.seal()?);
            alias_lines = Some(lines);
        }
        publication.add(credentials);

        let published = publication.commit()?;

        let report = ExportReport {
            entries: entries.len(),
            credential_lines,
            alias_lines,
            published,
        };
        info!(
            entries = report.entries,
            credential_lines = report.credential_lines,
            alias_lines = ?report.alias_lines,
            "export complete"
        );
        Ok(report)
    }
}
