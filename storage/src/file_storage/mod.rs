use std::path::{Path, PathBuf};
use tracing::{error, info, instrument, trace, warn};

use crate::storage::{Result, Storage};
use tokio::{
    fs::{self, File},
    io::copy,
};

const STAGING_DIR: &str = "staged";

/// `Storage` backed by a directory. Committed files live directly under the
/// root, in-flight transfers under `<root>/staged`.
#[derive(Clone, Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Creates the root and staging directories if missing. A node cannot
    /// work without its directory, so failure here is meant to be fatal.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if let Err(e) = std::fs::create_dir_all(root.join(STAGING_DIR)) {
            error!(root = %root.display(), error = %e, "Error while creating the root for storage");
            return Err(format!("cannot create storage root {}: {e}", root.display()).into());
        }
        info!(root = %root.display(), "Created root for storage");
        Ok(FileStorage { root })
    }
    pub fn root(&self) -> &Path {
        &self.root
    }
    fn get_committed_path(&self, file_name: &str) -> Result<PathBuf> {
        Ok(self.root.join(Self::checked_name(file_name)?))
    }
    fn get_staged_path(&self, file_name: &str) -> Result<PathBuf> {
        Ok(self.root.join(STAGING_DIR).join(Self::checked_name(file_name)?))
    }
    // file names come off the wire, keep them inside the root
    fn checked_name(file_name: &str) -> Result<&str> {
        if file_name.is_empty()
            || file_name == STAGING_DIR
            || file_name == "."
            || file_name == ".."
            || file_name.contains(['/', '\\'])
        {
            return Err(format!("invalid file name {file_name:?}").into());
        }
        Ok(file_name)
    }
}

impl Storage for FileStorage {
    #[instrument(name = "file_storage_write", skip(self, file_stream))]
    async fn write(
        &self,
        file_name: String,
        file_stream: &mut (impl tokio::io::AsyncRead + Unpin),
    ) -> Result<u64> {
        let staged_path = self.get_staged_path(&file_name)?;
        let mut staged_file = File::create(staged_path).await?;
        let writer_byte_count = copy(file_stream, &mut staged_file).await?;
        staged_file.sync_all().await?;
        info!(%file_name, bytes = writer_byte_count, "data copied successfully");
        Ok(writer_byte_count)
    }
    #[instrument(name = "file_storage_commit", skip(self))]
    async fn commit(&self, file_name: String) -> Result<bool> {
        let staged_path = self.get_staged_path(&file_name)?;
        let committed_path = self.get_committed_path(&file_name)?;
        if fs::metadata(&staged_path).await.is_ok() {
            fs::rename(staged_path, committed_path).await?;
        } else if fs::metadata(&committed_path).await.is_err() {
            return Err("File is neither staged neither commited".into());
        }
        Ok(true)
    }
    #[instrument(name = "file_storage_read", skip(self))]
    async fn read(&self, file_name: String) -> Result<Box<dyn tokio::io::AsyncRead + Unpin + Send>> {
        let file_path = self.get_committed_path(&file_name)?;
        let file = File::open(file_path).await?;
        Ok(Box::new(file))
    }
    async fn delete(&self, file_name: String) -> Result<bool> {
        let path = self.get_committed_path(&file_name)?;
        let exists = match fs::try_exists(&path).await {
            Ok(v) => v,
            Err(e) => {
                error!("error while checking if file exist e : {}", e);
                false
            }
        };
        if exists {
            fs::remove_file(path).await?;
        }
        Ok(exists)
    }
    async fn exists(&self, file_name: &str) -> Result<bool> {
        Ok(fs::try_exists(self.get_committed_path(file_name)?).await?)
    }
    #[instrument(name = "file_storage_available_files", skip(self))]
    async fn available_files(&self) -> Result<Vec<String>> {
        trace!(root = %self.root.display(), "Reading the dir to get available files");
        let mut dir_enteries = fs::read_dir(&self.root).await?;
        let mut file_names = vec![];
        while let Some(entry) = dir_enteries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(file_name) => file_names.push(file_name),
                Err(file_name) => {
                    warn!(?file_name, "Skipping file whose name is not valid UTF-8");
                }
            }
        }
        Ok(file_names)
    }
    #[instrument(name = "file_storage_file_size", skip(self))]
    async fn get_file_size(&self, file_name: &str) -> Result<u64> {
        let file_path = self.get_committed_path(file_name)?;
        let metadata = fs::metadata(file_path).await?;
        Ok(metadata.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::storage_test;

    #[tokio::test]
    async fn file_storage_test() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = FileStorage::new(dir.path())?;
        storage_test(storage).await
    }

    #[tokio::test]
    async fn names_escaping_the_root_are_refused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = FileStorage::new(dir.path())?;
        for name in ["../etc", "a/b", "", "staged", ".."] {
            assert!(storage.exists(name).await.is_err(), "{name:?} accepted");
        }
        Ok(())
    }

    #[tokio::test]
    async fn staging_dir_is_not_listed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = FileStorage::new(dir.path())?;
        std::fs::write(dir.path().join("a.txt"), b"a")?;
        assert_eq!(storage.available_files().await?, vec!["a.txt".to_owned()]);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_utf8_names_are_skipped() -> Result<()> {
        use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

        let dir = tempfile::tempdir()?;
        let storage = FileStorage::new(dir.path())?;
        std::fs::write(dir.path().join("a.txt"), b"a")?;
        std::fs::write(dir.path().join(OsStr::from_bytes(b"bad\xff.bin")), b"b")?;
        assert_eq!(storage.available_files().await?, vec!["a.txt".to_owned()]);
        Ok(())
    }

    #[test]
    fn unusable_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain-file");
        std::fs::write(&file, b"x").unwrap();
        assert!(FileStorage::new(&file).is_err());
    }
}
