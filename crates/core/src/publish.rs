//! Atomic replacement of output files.
//!
//! A map is never written in place. It is staged in a hidden temporary
//! sibling of its destination, flushed and synced, and only then renamed
//! over the destination, so a reader sees either the previous file or the
//! complete new one.
//!
//! Lifecycle of one file:
//!
//! ```text
//! StagedFile::create ──▶ write_with ... ──▶ seal ──▶ SealedFile::publish
//!      (empty)              (writing)       (closed)       (published)
//! ```
//!
//! Dropping a [`StagedFile`] or [`SealedFile`] at any point before
//! `publish` removes the temporary file and leaves the destination alone.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::errors::PublishError;

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

/// A destination whose new content is being written to a temporary sibling.
#[derive(Debug)]
pub struct StagedFile {
    destination: PathBuf,
    writer: BufWriter<NamedTempFile>,
}

impl StagedFile {
    /// Create an empty temporary file next to `destination` with the given
    /// unix permission bits.
    pub fn create<P: AsRef<Path>>(destination: P, mode: u32) -> Result<Self, PublishError> {
        let destination = destination.as_ref().to_path_buf();
        let create_err = |source: io::Error| PublishError::Create {
            path: destination.clone(),
            source,
        };

        let file_name = destination.file_name().ok_or_else(|| {
            create_err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "destination has no file name",
            ))
        })?;
        let dir = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", file_name.to_string_lossy()))
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(create_err)?;
        set_mode(temp.path(), mode).map_err(create_err)?;

        debug!(
            destination = %destination.display(),
            temp = %temp.path().display(),
            "staged temporary file"
        );
        Ok(Self {
            destination,
            writer: BufWriter::new(temp),
        })
    }

    pub fn temp_path(&self) -> &Path {
        self.writer.get_ref().path()
    }

    /// Run `fill` against the buffered temp file, mapping any I/O failure to
    /// a [`PublishError::Write`] for this destination.
    pub fn write_with<F, T>(&mut self, fill: F) -> Result<T, PublishError>
    where
        F: FnOnce(&mut BufWriter<NamedTempFile>) -> io::Result<T>,
    {
        fill(&mut self.writer).map_err(|source| self.write_err(source))
    }

    /// Flush buffered data and sync the temp file to disk.
    pub fn seal(self) -> Result<SealedFile, PublishError> {
        let Self {
            destination,
            writer,
        } = self;
        let write_err = |source: io::Error| PublishError::Write {
            path: destination.clone(),
            source,
        };

        let file = writer.into_inner().map_err(|e| write_err(e.into_error()))?;
        file.as_file().sync_all().map_err(write_err)?;

        debug!(destination = %destination.display(), "sealed temporary file");
        Ok(SealedFile { destination, file })
    }

    fn write_err(&self, source: io::Error) -> PublishError {
        PublishError::Write {
            path: self.destination.clone(),
            source,
        }
    }
}

impl Write for StagedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

/// A fully written and synced temp file, ready to replace its destination.
#[derive(Debug)]
pub struct SealedFile {
    destination: PathBuf,
    file: NamedTempFile,
}

impl SealedFile {
    /// Rename the temp file over the destination in one filesystem operation.
    pub fn publish(self) -> Result<PathBuf, PublishError> {
        let Self { destination, file } = self;

        // On failure the PersistError hands the temp file back; dropping it
        // removes it from disk.
        file.persist(&destination)
            .map_err(|e| PublishError::Rename {
                path: destination.clone(),
                source: e.error,
            })?;

        sync_parent_dir(&destination);
        info!(path = %destination.display(), "published");
        Ok(destination)
    }
}

/// Persist the rename itself. Failure here does not undo the publish, so it
/// is only logged.
fn sync_parent_dir(destination: &Path) {
    #[cfg(unix)]
    {
        let dir = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            warn!(dir = %dir.display(), error = %e, "unable to sync directory after rename");
        }
    }
    #[cfg(not(unix))]
    let _ = destination;
}

/// A set of sealed files committed back to back.
///
/// Each rename is atomic on its own; the set is not. If a rename fails after
/// an earlier one succeeded the run reports [`PublishError::PartialCommit`]
/// and the maps may disagree until the next successful run.
#[derive(Debug, Default)]
pub struct Publication {
    files: Vec<SealedFile>,
}

impl Publication {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a file; files are renamed in the order they were added.
    pub fn add(&mut self, file: SealedFile) {
        self.files.push(file);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Publish every queued file. Returns the destinations in commit order.
    pub fn commit(self) -> Result<Vec<PathBuf>, PublishError> {
        let mut published = Vec::with_capacity(self.files.len());

        for file in self.files {
            match file.publish() {
                Ok(path) => published.push(path),
                Err(err) if published.is_empty() => return Err(err),
                Err(PublishError::Rename { path, source }) => {
                    debug!(
                        failed = %path.display(),
                        published = published.len(),
                        "partial publish"
                    );
                    return Err(PublishError::PartialCommit {
                        published,
                        failed: path,
                        source,
                    });
                }
                Err(err) => return Err(err),
            }
        }

        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(destination: &Path, content: &str) -> SealedFile {
        let mut staged = StagedFile::create(destination, 0o600).unwrap();
        staged
            .write_with(|w| w.write_all(content.as_bytes()))
            .unwrap();
        staged.seal().unwrap()
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect()
    }

    #[test]
    fn test_publish_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("passwd");
        std::fs::write(&dest, "old:hash\n").unwrap();

        let path = stage(&dest, "new:hash\n").publish().unwrap();
        assert_eq!(path, dest);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "new:hash\n");
        assert!(leftovers(dir.path()).is_empty());
    }

    #[test]
    fn test_temp_file_is_hidden_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("aliases");
        let staged = StagedFile::create(&dest, 0o600).unwrap();

        let temp = staged.temp_path();
        assert_eq!(temp.parent(), Some(dir.path()));
        let name = temp.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with(".aliases."));
        assert!(name.ends_with(".tmp"));
        assert!(!dest.exists());
    }

    #[test]
    fn test_empty_file_is_published() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("passwd");

        let staged = StagedFile::create(&dest, 0o600).unwrap();
        staged.seal().unwrap().publish().unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"");
    }

    #[test]
    fn test_write_failure_leaves_destination_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("passwd");
        std::fs::write(&dest, "old:hash\n").unwrap();

        let mut staged = StagedFile::create(&dest, 0o600).unwrap();
        let temp = staged.temp_path().to_path_buf();
        let err = staged
            .write_with(|w| {
                w.write_all(b"half")?;
                Err::<(), _>(io::Error::new(io::ErrorKind::Other, "disk full"))
            })
            .unwrap_err();
        assert!(matches!(err, PublishError::Write { .. }));
        drop(staged);

        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "old:hash\n");
        assert!(!temp.exists());
    }

    #[test]
    fn test_unpublished_sealed_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("passwd");
        let sealed = stage(&dest, "x:y\n");
        drop(sealed);

        assert!(!dest.exists());
        assert!(leftovers(dir.path()).is_empty());
    }

    #[test]
    fn test_create_in_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing").join("passwd");
        let err = StagedFile::create(&dest, 0o600).unwrap_err();
        assert!(matches!(err, PublishError::Create { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_published_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("aliases");
        let mut staged = StagedFile::create(&dest, 0o640).unwrap();
        staged.write_all(b"a: b@c\n").unwrap();
        staged.seal().unwrap().publish().unwrap();

        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn test_commit_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let aliases = dir.path().join("aliases");
        let passwd = dir.path().join("passwd");

        let mut publication = Publication::new();
        publication.add(stage(&aliases, "a: x@d\n"));
        publication.add(stage(&passwd, "x:h\n"));
        assert_eq!(publication.len(), 2);

        let published = publication.commit().unwrap();
        assert_eq!(published, vec![aliases.clone(), passwd.clone()]);
        assert_eq!(std::fs::read_to_string(&aliases).unwrap(), "a: x@d\n");
        assert_eq!(std::fs::read_to_string(&passwd).unwrap(), "x:h\n");
    }

    #[test]
    fn test_first_rename_failure_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        // A non-empty directory cannot be replaced by a file.
        let blocked = dir.path().join("aliases");
        std::fs::create_dir(&blocked).unwrap();
        std::fs::write(blocked.join("keep"), "").unwrap();
        let passwd = dir.path().join("passwd");
        std::fs::write(&passwd, "old:hash\n").unwrap();

        let mut publication = Publication::new();
        publication.add(stage(&blocked, "a: x@d\n"));
        publication.add(stage(&passwd, "new:hash\n"));

        let err = publication.commit().unwrap_err();
        assert!(matches!(err, PublishError::Rename { .. }));
        assert_eq!(std::fs::read_to_string(&passwd).unwrap(), "old:hash\n");
        assert!(leftovers(dir.path()).is_empty());
    }

    #[test]
    fn test_later_rename_failure_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        let aliases = dir.path().join("aliases");
        let blocked = dir.path().join("passwd");
        std::fs::create_dir(&blocked).unwrap();
        std::fs::write(blocked.join("keep"), "").unwrap();

        let mut publication = Publication::new();
        publication.add(stage(&aliases, "a: x@d\n"));
        publication.add(stage(&blocked, "x:h\n"));

        match publication.commit().unwrap_err() {
            PublishError::PartialCommit {
                published, failed, ..
            } => {
                assert_eq!(published, vec![aliases.clone()]);
                assert_eq!(failed, blocked);
            }
            other => panic!("expected partial commit, got {other}"),
        }
        assert_eq!(std::fs::read_to_string(&aliases).unwrap(), "a: x@d\n");
    }
}
