//! src/services/storage_service.rs
//!
//! StorageService: the orchestrator behind the HTTP surface. It owns the
//! storage root and wires the namespace sanitizer, transform engine,
//! archive manager, recency cache and reconciler together behind three
//! operations: create, get and clean.
//!
//! Uploads land under `root/{dir}/{YYYY}/{MM}/{DD}/` either as a single
//! uniquely named file or, for extracted zips, as an archive directory.

use crate::{
    models::{stored::StoredContent, transform::TransformRequest},
    services::{
        archive::{ArchiveError, ArchiveManager},
        cache::{RecencyCache, SWEEP_INTERVAL},
        context::ServiceContext,
        kvs_service::KvsService,
        namespace::{
            ARCHIVE_DIR_PREFIX, KVS_DIR_NAME, date_shard_path, is_archive_dir_name, to_fs_path,
            to_url_path,
        },
        reconciler::{DEFAULT_CHUNK_SIZE, PassSummary, Reconciler},
        transform::{TransformEngine, TransformError},
        verifier::Verifier,
    },
};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut};
use parking_lot::Mutex;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Served name of an archive directory recompressed for download.
const ARCHIVE_DOWNLOAD_NAME: &str = "archive.zip";
/// Entry point served for an archive directory requested with a trailing `/`.
const ARCHIVE_INDEX_FILE: &str = "index.html";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("directory name `{0}` is reserved")]
    BadDirName(String),
    #[error("uploaded file is not acceptable")]
    BadFile,
    #[error("bad form data: {0}")]
    BadFormData(String),
    #[error("object not found")]
    NotFound,
    #[error("service not available")]
    ServiceUnavailable,
    #[error("i/o failed at `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl StorageError {
    pub fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Like [`StorageError::io`], but a missing file is reported as `NotFound`.
    fn read(path: &Path, source: io::Error) -> Self {
        if source.kind() == ErrorKind::NotFound {
            Self::NotFound
        } else {
            Self::io(path, source)
        }
    }

    /// Stable wire code reported to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadDirName(_) => "bad_dir_name",
            Self::BadFile => "bad_file",
            Self::BadFormData(_) => "bad_form_data",
            Self::NotFound => "object_not_found",
            Self::ServiceUnavailable
            | Self::Io { .. }
            | Self::Transform(_)
            | Self::Archive(_) => "server_not_available",
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Tunables for a [`StorageService`].
#[derive(Clone, Debug)]
pub struct StoreSettings {
    pub root: PathBuf,
    /// Upload normalize bound. Zero on both axes disables normalizing.
    pub img_max_width: u32,
    pub img_max_height: u32,
    pub watermark_path: Option<PathBuf>,
    pub watermark_opacity: f32,
    /// URL path prefixes whose images always get the watermark.
    pub watermark_dirs: Vec<String>,
    /// Zero disables the cache.
    pub cache_count: usize,
    pub cache_ttl: Duration,
    pub clean_chunk_size: usize,
    /// Objects younger than this are never offered to the verifier.
    pub clean_min_age: Duration,
    /// Run reconciliation passes inline instead of in the background.
    pub sync_jobs: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/files"),
            img_max_width: 0,
            img_max_height: 0,
            watermark_path: None,
            watermark_opacity: 1.0,
            watermark_dirs: Vec::new(),
            cache_count: 0,
            cache_ttl: Duration::from_secs(600),
            clean_chunk_size: DEFAULT_CHUNK_SIZE,
            clean_min_age: Duration::from_secs(24 * 60 * 60),
            sync_jobs: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StorageService {
    /// Root directory every stored object lives under.
    pub base_path: PathBuf,

    pub kvs: KvsService,

    settings: Arc<StoreSettings>,
    cache: Arc<RecencyCache>,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
    engine: Arc<TransformEngine>,
    archives: ArchiveManager,
    reconciler: Arc<Reconciler>,
    ctx: Arc<ServiceContext>,
}

impl StorageService {
    /// Prepare the root, load the watermark and start the cache sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn open(settings: StoreSettings, verifier: Arc<dyn Verifier>) -> StorageResult<Self> {
        let root = settings.root.clone();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::io(&root, e))?;

        let ctx = Arc::new(ServiceContext::new());
        if let Some(wm_path) = &settings.watermark_path {
            match ctx.load_watermark(wm_path) {
                Ok(()) => info!(path = %wm_path.display(), "watermark loaded"),
                Err(err) => error!(%err, path = %wm_path.display(), "Fail to load watermark"),
            }
        }

        let (cache, sweeper) = RecencyCache::spawn(
            settings.cache_count,
            settings.cache_ttl,
            SWEEP_INTERVAL,
            ctx.child_token(),
        );

        let engine = Arc::new(TransformEngine::new(ctx.clone(), settings.watermark_opacity));
        let reconciler = Arc::new(Reconciler::new(
            root.clone(),
            verifier,
            ctx.clone(),
            settings.clean_min_age,
        ));

        Ok(Self {
            kvs: KvsService::new(root.clone()),
            base_path: root,
            settings: Arc::new(settings),
            cache,
            sweeper: Arc::new(Mutex::new(sweeper)),
            engine,
            archives: ArchiveManager::new(),
            reconciler,
            ctx,
        })
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    /// Reject target directories that could collide with reserved names.
    fn ensure_dir_allowed(dir: &str) -> StorageResult<()> {
        if dir.contains(ARCHIVE_DIR_PREFIX) {
            return Err(StorageError::BadDirName(dir.to_owned()));
        }
        if to_url_path(dir).split('/').next() == Some(KVS_DIR_NAME) {
            return Err(StorageError::BadDirName(dir.to_owned()));
        }
        Ok(())
    }

    /// Store an in-memory upload. See [`StorageService::create_stream`].
    pub async fn create(
        &self,
        dir: &str,
        file_name: &str,
        data: Bytes,
        skip_normalize: bool,
        unzip: bool,
    ) -> StorageResult<String> {
        let stream = futures::stream::once(async move { Ok::<_, io::Error>(data) });
        self.create_stream(dir, file_name, stream, skip_normalize, unzip)
            .await
    }

    /// Store a streamed upload under `dir` and today's date shard.
    ///
    /// Only the extension of `file_name` is kept. With `unzip` and a `.zip`
    /// extension the archive is extracted into a fresh archive directory and
    /// the returned URL path ends with `/`. Otherwise the file is written
    /// under a unique name and, unless `skip_normalize`, shrunk in place to
    /// the configured maximum size.
    pub async fn create_stream<S>(
        &self,
        dir: &str,
        file_name: &str,
        stream: S,
        skip_normalize: bool,
        unzip: bool,
    ) -> StorageResult<String>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        Self::ensure_dir_allowed(dir)?;

        let date_path = date_shard_path();
        let target_dir = self
            .base_path
            .join(to_fs_path(dir))
            .join(to_fs_path(&date_path));
        fs::create_dir_all(&target_dir)
            .await
            .map_err(|e| StorageError::io(&target_dir, e))?;

        let ext = file_extension(file_name);
        let url_dir = [to_url_path(dir), date_path]
            .into_iter()
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/");

        if unzip && ext == ".zip" {
            let name = self.extract_upload(&target_dir, stream).await?;
            return Ok(format!("{url_dir}/{name}/"));
        }

        let name = format!("{}{ext}", Uuid::new_v4().simple());
        let file_path = target_dir.join(&name);
        write_stream(&target_dir, &file_path, stream).await?;

        if !skip_normalize {
            self.normalize(&file_path).await?;
        }

        Ok(format!("{url_dir}/{name}"))
    }

    async fn extract_upload<S>(&self, target_dir: &Path, stream: S) -> StorageResult<String>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let mut archive = BytesMut::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(upload_read_error)?;
            archive.extend_from_slice(&chunk);
        }

        let name = format!("{ARCHIVE_DIR_PREFIX}{}", Uuid::new_v4().simple());
        let dest = target_dir.join(&name);
        fs::create_dir(&dest)
            .await
            .map_err(|e| StorageError::io(&dest, e))?;

        let archives = self.archives;
        let archive = archive.freeze();
        let extract_dest = dest.clone();
        let result =
            tokio::task::spawn_blocking(move || archives.extract(&archive, &extract_dest)).await;

        let err = match result {
            Ok(Ok(files)) => {
                debug!(dir = %dest.display(), files, "zip extracted");
                return Ok(name);
            }
            Ok(Err(ArchiveError::Zip(err))) => {
                warn!(%err, "uploaded zip is unreadable");
                StorageError::BadFile
            }
            Ok(Err(err)) => {
                error!(%err, dir = %dest.display(), "Fail to extract zip");
                StorageError::Archive(err)
            }
            Err(err) => {
                error!(%err, "zip extraction task failed");
                StorageError::ServiceUnavailable
            }
        };

        if let Err(rm_err) = fs::remove_dir_all(&dest).await {
            warn!(%rm_err, dir = %dest.display(), "Fail to remove partial extraction");
        }
        Err(err)
    }

    /// Shrink a fresh upload in place to the configured bound.
    async fn normalize(&self, file_path: &Path) -> StorageResult<()> {
        let (max_w, max_h) = (self.settings.img_max_width, self.settings.img_max_height);
        if max_w == 0 && max_h == 0 {
            return Ok(());
        }

        let engine = self.engine.clone();
        let path = file_path.to_path_buf();
        let params = TransformRequest::fit(max_w, max_h);
        let result = tokio::task::spawn_blocking(move || engine.handle(&path, None, &params)).await;

        let err = match result {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(err)) => {
                error!(%err, "Fail to normalize upload");
                StorageError::Transform(err)
            }
            Err(err) => {
                error!(%err, "normalize task failed");
                StorageError::ServiceUnavailable
            }
        };
        let _ = fs::remove_file(file_path).await;
        Err(err)
    }

    /// Resolve `path` and produce the body to serve.
    ///
    /// Archive directories are served as a fresh zip when `download` is set,
    /// or through their `index.html` when the path ends with `/`. Non-empty
    /// `params` transform raster images; anything that cannot be transformed
    /// is served verbatim.
    pub async fn get(
        &self,
        path: &str,
        params: &TransformRequest,
        download: bool,
    ) -> StorageResult<StoredContent> {
        let key = RecencyCache::generate_key(path, params, download);
        if let Some(hit) = self.cache.get_and_refresh(&key) {
            return Ok(hit);
        }

        let url_path = to_url_path(path);
        if url_path.is_empty() {
            return Err(StorageError::NotFound);
        }
        let mut params = *params;
        let mut file_path = self.base_path.join(to_fs_path(path));

        let meta = fs::metadata(&file_path)
            .await
            .map_err(|e| StorageError::read(&file_path, e))?;

        if meta.is_dir() {
            let dir_name = url_path.rsplit('/').next().unwrap_or_default();
            if !is_archive_dir_name(dir_name) {
                return Err(StorageError::NotFound);
            }
            if download {
                let content = self.compress(&file_path).await?;
                self.cache
                    .set(&key, &content.name, content.mod_time, content.content.clone());
                return Ok(content);
            }
            if !path.ends_with('/') {
                return Err(StorageError::NotFound);
            }
            file_path.push(ARCHIVE_INDEX_FILE);
            params = TransformRequest::default();
        }

        if self.is_watermark_forced(&url_path) {
            params.watermark = true;
        }

        let meta = fs::metadata(&file_path)
            .await
            .map_err(|e| StorageError::read(&file_path, e))?;
        if !meta.is_file() {
            return Err(StorageError::NotFound);
        }

        let content = match self.transformed(&file_path, &params).await? {
            Some(content) => content,
            None => fs::read(&file_path)
                .await
                .map(Bytes::from)
                .map_err(|e| StorageError::read(&file_path, e))?,
        };

        let name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mod_time = if download {
            Utc::now()
        } else {
            meta.modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now())
        };

        self.cache.set(&key, &name, mod_time, content.clone());

        Ok(StoredContent {
            name,
            mod_time,
            content,
        })
    }

    async fn transformed(
        &self,
        file_path: &Path,
        params: &TransformRequest,
    ) -> StorageResult<Option<Bytes>> {
        if params.is_empty() {
            return Ok(None);
        }

        let engine = self.engine.clone();
        let path = file_path.to_path_buf();
        let params = *params;
        let result = tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            engine
                .handle(&path, Some(&mut buf), &params)
                .map(|changed| changed.then_some(buf))
        })
        .await;

        match result {
            Ok(Ok(buf)) => Ok(buf.map(Bytes::from)),
            Ok(Err(err)) => {
                error!(%err, "Fail to transform image");
                Err(StorageError::Transform(err))
            }
            Err(err) => {
                error!(%err, "transform task failed");
                Err(StorageError::ServiceUnavailable)
            }
        }
    }

    async fn compress(&self, dir: &Path) -> StorageResult<StoredContent> {
        let archives = self.archives;
        let dir = dir.to_path_buf();
        let buf = tokio::task::spawn_blocking(move || archives.compress_dir(&dir))
            .await
            .map_err(|err| {
                error!(%err, "compress task failed");
                StorageError::ServiceUnavailable
            })?
            .inspect_err(|err| error!(%err, "Fail to compress dir"))?;

        Ok(StoredContent {
            name: ARCHIVE_DOWNLOAD_NAME.to_owned(),
            mod_time: Utc::now(),
            content: Bytes::from(buf),
        })
    }

    fn is_watermark_forced(&self, url_path: &str) -> bool {
        self.settings.watermark_dirs.iter().any(|prefix| {
            let prefix = to_url_path(prefix);
            !prefix.is_empty()
                && url_path
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        })
    }

    /// Start one reconciliation pass.
    ///
    /// A zero `chunk_size` uses the configured one. In synchronous mode the
    /// pass runs to completion and its summary is returned; otherwise it runs
    /// in the background and `None` is returned immediately.
    pub async fn clean(&self, chunk_size: usize) -> Option<PassSummary> {
        if self.ctx.is_stopped() {
            warn!("shutting down, reconciliation skipped");
            return None;
        }

        let chunk_size = if chunk_size == 0 {
            self.settings.clean_chunk_size
        } else {
            chunk_size
        };
        let reconciler = self.reconciler.clone();

        if self.settings.sync_jobs {
            self.ctx
                .run_job(async move { reconciler.run_pass(chunk_size).await })
                .await
        } else {
            self.ctx.spawn_job(async move {
                reconciler.run_pass(chunk_size).await;
            });
            None
        }
    }

    /// Raise the stop signal, stop the cache sweeper and wait for every
    /// outstanding reconciliation pass.
    pub async fn stop_and_wait_jobs(&self) {
        self.ctx.stop_and_wait().await;

        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            if let Err(err) = handle.await {
                warn!(%err, "cache sweeper ended abnormally");
            }
        }
        info!("background jobs finished");
    }
}

/// Lowercased extension of `file_name` with its dot, or empty when it has
/// none or it is not plain alphanumeric.
fn file_extension(file_name: &str) -> String {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or_default();
    match base.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.bytes().all(|b| b.is_ascii_alphanumeric()) =>
        {
            format!(".{}", ext.to_ascii_lowercase())
        }
        _ => String::new(),
    }
}

/// Write `stream` to a temp file in `dir` and rename it to `dest`.
/// A failure while reading the upload body is the client's: truncated,
/// malformed or over the size limit.
fn upload_read_error(err: io::Error) -> StorageError {
    warn!(%err, "Fail to read upload body");
    StorageError::BadFormData(err.to_string())
}

async fn write_stream<S>(dir: &Path, dest: &Path, stream: S) -> StorageResult<()>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
    let mut file = File::create(&tmp_path)
        .await
        .map_err(|e| StorageError::io(&tmp_path, e))?;

    pin_mut!(stream);
    while let Some(chunk_res) = stream.next().await {
        let chunk = match chunk_res {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(upload_read_error(err));
            }
        };
        if let Err(err) = file.write_all(&chunk).await {
            let _ = fs::remove_file(&tmp_path).await;
            error!(%err, path = %tmp_path.display(), "Fail to copy data");
            return Err(StorageError::io(&tmp_path, err));
        }
    }
    if let Err(err) = file.flush().await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(StorageError::io(&tmp_path, err));
    }
    if let Err(err) = file.sync_all().await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(StorageError::io(&tmp_path, err));
    }
    drop(file);

    if let Err(err) = fs::rename(&tmp_path, dest).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(StorageError::io(dest, err));
    }
    Ok(())
}
