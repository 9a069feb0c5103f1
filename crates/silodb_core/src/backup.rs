//! Database backup and restore.
//!
//! A backup is a deflate-compressed ZIP of the on-disk layout:
//!
//! ```text
//! <db>/.metadata
//! <db>/<table>/.metadata
//! <db>/<table>/<rowid>.ndjson
//! ```
//!
//! Cache directories are excluded, and the KEK is never part of a backup —
//! encrypted columns stay encrypted, and the wrapped DEK in each table's
//! metadata is all a restore needs (plus the original KEK at read time).

use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::row::ROW_EXT;
use crate::table::METADATA_FILE;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Archive and restore of a database's on-disk layout.
pub struct Backup;

impl Backup {
    /// Archives `database` into a ZIP file at `path`.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::Io`] on archive or filesystem errors; a
    /// partial archive file may remain and can be overwritten by a retry.
    pub fn dump(database: &Database, path: &Path) -> CoreResult<()> {
        let mut zip = ZipWriter::new(File::create(path)?);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let db_name = database.name();

        zip.add_directory(db_name, options)?;
        append_file(
            &mut zip,
            &database.folder().join(METADATA_FILE),
            &format!("{db_name}/{METADATA_FILE}"),
            options,
        )?;

        for table in database.tables(&[])? {
            let table_prefix = format!("{db_name}/{}", table.name());
            zip.add_directory(table_prefix.as_str(), options)?;
            append_file(
                &mut zip,
                &table.folder().join(METADATA_FILE),
                &format!("{table_prefix}/{METADATA_FILE}"),
                options,
            )?;
            for row in table.rows(&[])? {
                let name = format!("{table_prefix}/{}.{ROW_EXT}", row.id());
                append_file(&mut zip, &row.path(), &name, options)?;
            }
        }

        zip.finish()?;
        tracing::info!(database = %db_name, path = %path.display(), "backup written");
        Ok(())
    }

    /// Extracts a backup archive into the storage root `storage`.
    ///
    /// Entries that would escape the storage root are rejected.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::Io`] on malformed archives or filesystem
    /// errors.
    pub fn load(path: &Path, storage: &Path) -> CoreResult<()> {
        let mut archive = ZipArchive::new(File::open(path)?)?;

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            let Some(relative) = entry.enclosed_name() else {
                return Err(CoreError::Io(io::Error::other(format!(
                    "archive entry {:?} escapes the storage root",
                    entry.name()
                ))));
            };
            let target = storage.join(relative);

            if entry.is_dir() {
                fs::create_dir_all(&target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut content = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut content)?;
            File::create(&target)?.write_all(&content)?;
        }

        tracing::info!(path = %path.display(), "backup restored");
        Ok(())
    }
}

fn append_file(
    zip: &mut ZipWriter<File>,
    source: &Path,
    name: &str,
    options: SimpleFileOptions,
) -> CoreResult<()> {
    zip.start_file(name, options)?;
    zip.write_all(&fs::read(source)?)?;
    Ok(())
}
