use crate::error::{MailError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// One message in a mailbox, derived from a directory listing.
///
/// Ordinals are 1-based, assigned by ascending creation time, and valid only
/// for the enumeration they came from; the unique token is the stable
/// identity.
#[derive(Debug, Clone)]
pub struct MessageInfo {
    pub ordinal: u64,
    pub timestamp: i64,
    pub size: u64,
    pub unique_id: String,
    pub path: PathBuf,
}

/// Filesystem-backed mail storage.
///
/// Mailbox directories are created lazily and carry no index; the directory
/// listing is the index. Message files are written under the cache root
/// first and renamed into place, so a mailbox never contains a partially
/// written message.
pub struct MailStore {
    mail_root: PathBuf,
    cache_root: PathBuf,
}

impl MailStore {
    pub fn new(mail_root: impl Into<PathBuf>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            mail_root: mail_root.into(),
            cache_root: cache_root.into(),
        }
    }

    /// Create the storage and cache roots if absent.
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.mail_root).await?;
        fs::create_dir_all(&self.cache_root).await?;
        Ok(())
    }

    /// Directory for a mailbox address, created on first reference.
    pub async fn mailbox_dir(&self, address: &str) -> Result<PathBuf> {
        let dir = self.mail_root.join(address);
        if fs::metadata(&dir).await.is_err() {
            fs::create_dir_all(&dir).await.map_err(|e| {
                MailError::Storage(format!("create mailbox {}: {}", dir.display(), e))
            })?;
        }
        Ok(dir)
    }

    /// A fresh, collision-free path for a message in `address`'s mailbox.
    /// The file is not created; the name encodes the creation time and a
    /// random unique token.
    pub async fn new_message_path(&self, address: &str) -> Result<PathBuf> {
        let dir = self.mailbox_dir(address).await?;
        let secs = unix_time().as_secs();
        let token = unique_token(&dir);
        Ok(dir.join(format!("{}-{}", secs, token)))
    }

    /// A fresh, collision-free path in the staging area. Not created.
    pub fn new_cache_path(&self) -> PathBuf {
        let nanos = unix_time().as_nanos();
        let token = unique_token(&self.cache_root);
        self.cache_root.join(format!("{}-{}", nanos, token))
    }

    /// Enumerate one mailbox, ordered by ascending creation time.
    pub async fn list_messages(&self, address: &str) -> Result<Vec<MessageInfo>> {
        let dir = self.mailbox_dir(address).await?;
        let mut infos = Vec::new();

        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| MailError::Storage(format!("read mailbox {}: {}", dir.display(), e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MailError::Storage(format!("read mailbox {}: {}", dir.display(), e)))?
        {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some((stamp, token)) = name.split_once('-') else {
                continue;
            };
            let Ok(timestamp) = stamp.parse::<i64>() else {
                continue;
            };
            infos.push(MessageInfo {
                ordinal: 0,
                timestamp,
                size: meta.len(),
                unique_id: token.to_string(),
                path: entry.path(),
            });
        }

        sort_and_number(&mut infos);
        Ok(infos)
    }

    /// Enumerate several mailboxes merged into one timestamp-ordered list,
    /// for accounts that own more than one address.
    pub async fn list_messages_for(&self, addresses: &[String]) -> Result<Vec<MessageInfo>> {
        let mut infos = Vec::new();
        for address in addresses {
            infos.extend(self.list_messages(address).await?);
        }
        sort_and_number(&mut infos);
        Ok(infos)
    }

    pub async fn delete_message(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).await?;
        debug!("deleted message {}", path.display());
        Ok(())
    }
}

fn unix_time() -> std::time::Duration {
    // Clock-before-epoch is not a condition worth limping through
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// High-entropy unique token: SHA-256 over the nanosecond clock, a salt
/// derived from the target path, and 16 random bytes, URL-safe base64.
fn unique_token(salt_path: &Path) -> String {
    let mut rand_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut rand_bytes);

    let mut hasher = Sha256::new();
    hasher.update(unix_time().as_nanos().to_string().as_bytes());
    hasher.update(b"-hash-salt-");
    hasher.update(salt_path.to_string_lossy().as_bytes());
    hasher.update(rand_bytes);
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn sort_and_number(infos: &mut [MessageInfo]) {
    infos.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.unique_id.cmp(&b.unique_id))
    });
    for (i, info) in infos.iter_mut().enumerate() {
        info.ordinal = (i + 1) as u64;
    }
}

/// A file being written in the staging area.
///
/// Dropping an uncommitted `StagedFile` removes the partial file, so every
/// early-exit path cleans up automatically; only a successful
/// [`commit`](StagedFile::commit) (atomic rename into a mailbox) or an
/// explicit [`keep`](StagedFile::keep) preserves the bytes.
pub struct StagedFile {
    file: Option<fs::File>,
    path: PathBuf,
    committed: bool,
}

impl StagedFile {
    pub async fn create(path: PathBuf) -> Result<Self> {
        let file = fs::File::create(&path)
            .await
            .map_err(|e| MailError::Storage(format!("create {}: {}", path.display(), e)))?;
        Ok(Self {
            file: Some(file),
            path,
            committed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(data).await?;
        }
        Ok(())
    }

    /// Flush and atomically rename into `dest`.
    pub async fn commit(mut self, dest: &Path) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        fs::rename(&self.path, dest).await.map_err(|e| {
            MailError::Storage(format!(
                "commit {} -> {}: {}",
                self.path.display(),
                dest.display(),
                e
            ))
        })?;
        self.committed = true;
        Ok(())
    }

    /// Close the file and hand ownership of the path to the caller, who
    /// becomes responsible for deleting it (the relay's shared cache file).
    pub fn keep(mut self) -> PathBuf {
        self.file.take();
        self.committed = true;
        self.path.clone()
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> MailStore {
        MailStore::new(dir.path().join("mail"), dir.path().join("cache"))
    }

    #[tokio::test]
    async fn mailbox_dir_created_lazily() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        store.init().await.unwrap();

        assert!(!tmp.path().join("mail/a@example.com").exists());
        store.mailbox_dir("a@example.com").await.unwrap();
        assert!(tmp.path().join("mail/a@example.com").is_dir());
    }

    #[tokio::test]
    async fn staged_commit_lands_in_mailbox() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        store.init().await.unwrap();

        let mut staged = StagedFile::create(store.new_cache_path()).await.unwrap();
        staged.write_all(b"Subject: hi\r\n\r\nbody\r\n").await.unwrap();
        let dest = store.new_message_path("a@example.com").await.unwrap();
        staged.commit(&dest).await.unwrap();

        let infos = store.list_messages("a@example.com").await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].ordinal, 1);
        assert_eq!(infos[0].size, 22);
    }

    #[tokio::test]
    async fn dropped_stage_leaves_no_orphan() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        store.init().await.unwrap();

        let path = store.new_cache_path();
        {
            let mut staged = StagedFile::create(path.clone()).await.unwrap();
            staged.write_all(b"half a mess").await.unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn listing_orders_by_timestamp() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        store.init().await.unwrap();

        let dir = store.mailbox_dir("a@example.com").await.unwrap();
        fs::write(dir.join("300-ccc"), b"third").await.unwrap();
        fs::write(dir.join("100-aaa"), b"first").await.unwrap();
        fs::write(dir.join("200-bbb"), b"second!").await.unwrap();
        // Files that do not look like messages are skipped
        fs::write(dir.join("notamessage"), b"x").await.unwrap();

        let infos = store.list_messages("a@example.com").await.unwrap();
        assert_eq!(infos.len(), 3);
        assert_eq!(
            infos.iter().map(|i| i.timestamp).collect::<Vec<_>>(),
            vec![100, 200, 300]
        );
        assert_eq!(
            infos.iter().map(|i| i.ordinal).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(infos[1].size, 7);
        assert_eq!(infos[2].unique_id, "ccc");
    }

    #[tokio::test]
    async fn merged_listing_resorts_across_addresses() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        store.init().await.unwrap();

        let a = store.mailbox_dir("a@example.com").await.unwrap();
        let b = store.mailbox_dir("b@example.com").await.unwrap();
        fs::write(a.join("200-aa"), b"x").await.unwrap();
        fs::write(b.join("100-bb"), b"y").await.unwrap();
        fs::write(a.join("300-cc"), b"z").await.unwrap();

        let infos = store
            .list_messages_for(&["a@example.com".to_string(), "b@example.com".to_string()])
            .await
            .unwrap();
        assert_eq!(
            infos.iter().map(|i| i.timestamp).collect::<Vec<_>>(),
            vec![100, 200, 300]
        );
        assert_eq!(
            infos.iter().map(|i| i.ordinal).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn concurrent_stagings_all_commit() {
        let tmp = TempDir::new().unwrap();
        let store = std::sync::Arc::new(test_store(&tmp));
        store.init().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut staged = StagedFile::create(store.new_cache_path()).await.unwrap();
                staged
                    .write_all(format!("message {}\r\n", i).as_bytes())
                    .await
                    .unwrap();
                let dest = store.new_message_path("shared@example.com").await.unwrap();
                staged.commit(&dest).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let infos = store.list_messages("shared@example.com").await.unwrap();
        assert_eq!(infos.len(), 20);

        let mut tokens: Vec<_> = infos.iter().map(|i| i.unique_id.clone()).collect();
        tokens.sort();
        tokens.dedup();
        assert_eq!(tokens.len(), 20, "unique tokens must not collide");
    }
}
