use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::NamedTempFile;

use crate::domain::{Product, Satellite, Timestamp};
use crate::error::ArchiveError;
use crate::timegrid;

/// Local archive layout: `{root}/{satellite}/{product}/{frame filename}`.
///
/// All writes go through a temp file in the destination directory followed
/// by a rename, so a frame is never observable half-written. A partial
/// download is therefore never "found" by a later inventory scan.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: Utf8PathBuf,
}

impl LocalStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn product_dir(&self, satellite: Satellite, product: Product) -> Utf8PathBuf {
        self.root.join(satellite.slug()).join(product.code())
    }

    pub fn frame_path(
        &self,
        satellite: Satellite,
        product: Product,
        timestamp: Timestamp,
    ) -> Utf8PathBuf {
        self.product_dir(satellite, product)
            .join(timegrid::local_filename(satellite, product, timestamp))
    }

    pub fn ensure_product_dir(
        &self,
        satellite: Satellite,
        product: Product,
    ) -> Result<Utf8PathBuf, ArchiveError> {
        let dir = self.product_dir(satellite, product);
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| ArchiveError::Filesystem(err.to_string()))?;
        Ok(dir)
    }

    /// Opens a temp file next to `dest` so the final rename stays on one
    /// filesystem.
    pub fn temp_for(dest: &Utf8Path) -> Result<NamedTempFile, ArchiveError> {
        let parent = dest
            .parent()
            .ok_or_else(|| ArchiveError::LocalWrite("destination has no parent".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| ArchiveError::Filesystem(err.to_string()))?;
        tempfile::Builder::new()
            .prefix(".sat-archive")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| ArchiveError::LocalWrite(err.to_string()))
    }

    pub fn persist(temp: NamedTempFile, dest: &Utf8Path) -> Result<(), ArchiveError> {
        if dest.as_std_path().exists() {
            fs::remove_file(dest.as_std_path())
                .map_err(|err| ArchiveError::LocalWrite(err.to_string()))?;
        }
        temp.persist(dest.as_std_path())
            .map_err(|err| ArchiveError::LocalWrite(err.to_string()))?;
        Ok(())
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), ArchiveError> {
        let temp = Self::temp_for(path)?;
        fs::write(temp.path(), content).map_err(|err| ArchiveError::LocalWrite(err.to_string()))?;
        Self::persist(temp, path)
    }
}
