use super::IdentityStore;
use crate::certificate::Identity;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// On-disk PEM store.
///
/// Every update writes the chain and key into a timestamped file
/// `<prefix>-YYYY-MM-DD-HH-MM-SS.pem` and then atomically replaces
/// `<prefix>-current.pem` with the same content. Readers only ever see the
/// old or the new `current` file. Files are created with mode 0600.
///
/// When no `current` file exists, an optional explicit cert/key file pair
/// is consulted, which lets a pre-provisioned pair seed the store.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    prefix: String,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            cert_file: None,
            key_file: None,
        }
    }

    /// Falls back to these files when no `current` file has been written.
    pub fn with_key_pair_files(
        mut self,
        cert_file: impl Into<PathBuf>,
        key_file: impl Into<PathBuf>,
    ) -> Self {
        self.cert_file = Some(cert_file.into());
        self.key_file = Some(key_file.into());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding the active pair.
    pub fn current_path(&self) -> PathBuf {
        self.dir.join(format!("{}-current.pem", self.prefix))
    }

    fn timestamped_path(&self) -> PathBuf {
        let ts = Utc::now().format("%Y-%m-%d-%H-%M-%S");
        self.dir.join(format!("{}-{ts}.pem", self.prefix))
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join(format!(".{}-current.pem.tmp", self.prefix))
    }

    async fn load_key_pair_files(&self) -> Result<Option<Identity>> {
        let (Some(cert_file), Some(key_file)) = (&self.cert_file, &self.key_file) else {
            return Ok(None);
        };
        let Some(cert) = read_optional(cert_file).await? else {
            return Ok(None);
        };
        let Some(key) = read_optional(key_file).await? else {
            return Ok(None);
        };
        debug!(cert = %cert_file.display(), key = %key_file.display(), "loaded explicit key pair files");
        Identity::from_pem(&cert, &key).map(Some)
    }
}

#[async_trait]
impl IdentityStore for FileStore {
    async fn current(&self) -> Result<Identity> {
        let path = self.current_path();
        if let Some(combined) = read_optional(&path).await? {
            debug!(path = %path.display(), "loaded current identity");
            return Identity::from_combined_pem(&combined);
        }

        if let Some(identity) = self.load_key_pair_files().await? {
            return Ok(identity);
        }

        Err(Error::NoCertKey(format!(
            "no {} and no explicit cert/key files",
            path.display()
        )))
    }

    async fn update(&self, cert_pem: &[u8], key_pem: &[u8]) -> Result<Identity> {
        let identity = Identity::from_pem_bytes(cert_pem, key_pem)?;
        let combined = identity.to_combined_pem();

        tokio::fs::create_dir_all(&self.dir).await?;

        let archived = self.timestamped_path();
        write_private(&archived, combined.as_bytes()).await?;

        let temp = self.temp_path();
        write_private(&temp, combined.as_bytes()).await?;
        let current = self.current_path();
        if let Err(e) = tokio::fs::rename(&temp, &current).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        sync_dir(&self.dir).await?;

        info!(
            path = %current.display(),
            archived = %archived.display(),
            not_after = %identity.not_after(),
            "persisted rotated identity"
        );
        Ok(identity)
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Writes and fsyncs a file readable only by its owner.
async fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    Ok(())
}

/// Flushes directory entries so a completed rename survives a crash.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
