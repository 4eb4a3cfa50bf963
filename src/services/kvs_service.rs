//! Plain key-value blob storage under a reserved directory of the root.
//!
//! No eviction and no reconciliation: the reconciler never walks this
//! directory.

use crate::services::{
    namespace::{KVS_DIR_NAME, to_fs_path},
    storage_service::{StorageError, StorageResult},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut};
use std::{io, path::PathBuf, sync::Arc};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::RwLock,
};
use tracing::error;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct KvsService {
    dir: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl KvsService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            dir: root.into().join(KVS_DIR_NAME),
            lock: Arc::new(RwLock::new(())),
        }
    }

    fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = to_fs_path(key);
        if relative.as_os_str().is_empty() {
            return Err(StorageError::BadFormData("empty key".into()));
        }
        Ok(self.dir.join(relative))
    }

    /// Store the streamed body under `key`, replacing any previous value.
    pub async fn set<S>(&self, key: &str, stream: S) -> StorageResult<()>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let path = self.key_path(key)?;
        let _guard = self.lock.write().await;

        let parent = path.parent().map(PathBuf::from).unwrap_or_else(|| self.dir.clone());
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| StorageError::io(&parent, e))?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path)
            .await
            .map_err(|e| StorageError::io(&tmp_path, e))?;

        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let written = match chunk {
                Ok(chunk) => file.write_all(&chunk).await,
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                let _ = fs::remove_file(&tmp_path).await;
                error!(key, %err, "Fail to copy data");
                return Err(StorageError::io(&tmp_path, err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::io(&tmp_path, err));
        }
        drop(file);

        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| StorageError::io(&path, e))
    }

    /// Open the blob under `key` for streaming, with its modification time.
    pub async fn get(&self, key: &str) -> StorageResult<(File, DateTime<Utc>)> {
        let path = self.key_path(key)?;
        let _guard = self.lock.read().await;

        let meta = match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Err(StorageError::NotFound),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound);
            }
            Err(err) => {
                error!(path = %path.display(), %err, "Fail to get stat of file");
                return Err(StorageError::io(&path, err));
            }
        };
        let mod_time = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                StorageError::NotFound
            } else {
                StorageError::io(&path, err)
            }
        })?;
        Ok((file, mod_time))
    }

    /// Remove the blob under `key`. Missing keys are not an error.
    pub async fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key)?;
        let _guard = self.lock.write().await;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                error!(path = %path.display(), %err, "Fail to remove file");
                Err(StorageError::io(&path, err))
            }
        }
    }
}
