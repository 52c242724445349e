use async_trait::async_trait;
use log::debug;
use sessioncore::store::{KeyValueStore, Result, StoreError};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const VALUE_SUFFIX: &str = ".bin";
const TEMP_SUFFIX: &str = ".tmp";

/// Local-filesystem key-value store. One file per key; the file name is the
/// hex encoding of the key so arbitrary keys map to safe names.
pub struct FileStore {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub async fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let base_path = path.into();
        fs::create_dir_all(&base_path).await?;
        debug!(target: "Store/File", "Using {}", base_path.display());
        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn file_name(key: &str) -> String {
        format!("{}{VALUE_SUFFIX}", hex::encode(key.as_bytes()))
    }

    fn key_from_file_name(name: &str) -> Option<String> {
        let encoded = name.strip_suffix(VALUE_SUFFIX)?;
        let bytes = hex::decode(encoded).ok()?;
        String::from_utf8(bytes).ok()
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_path.join(Self::file_name(key))
    }

    /// Writes to a sibling temp file, syncs it, then renames over the target
    /// so readers see either the old value or the new one.
    async fn write_atomic(&self, path: &Path, value: &[u8]) -> Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(TEMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(value).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn remove_file(path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_atomic(&self.path_for(key), value).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        Self::remove_file(&self.path_for(key)).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let _guard = self.write_lock.lock().await;

        let mut doomed = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(Self::key_from_file_name) else {
                continue;
            };
            if key.starts_with(prefix) {
                doomed.push(entry.path());
            }
        }

        let mut removed = 0;
        for path in doomed {
            if Self::remove_file(&path).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn probe(&self) -> Result<()> {
        fs::metadata(&self.base_path).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
