//! src/services/reconciler.rs
//!
//! Background reconciliation of the on-disk inventory against the external
//! verifier.
//!
//! A pass walks the storage root depth-first, collects candidate paths into
//! batches, asks the verifier which of them are orphans, deletes those, and
//! finally prunes directories the deletions left empty. Archive directories
//! are submitted (and deleted) as one unit. The stop signal is checked at
//! every walk step and before every verifier call.
//!
//! Filesystem walks run on the blocking pool; only verifier calls and
//! deletions run on the async side.

use crate::services::{
    context::ServiceContext,
    namespace::{KVS_DIR_NAME, is_archive_dir_name, to_fs_path},
    verifier::Verifier,
};
use std::{
    collections::{HashMap, HashSet},
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant, SystemTime},
};
use tokio::{fs, sync::mpsc};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Chunk size used when a caller passes zero.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Full batches the walker may queue ahead of the verifier.
const BATCH_QUEUE_DEPTH: usize = 1;

/// Outcome of one completed pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Candidates submitted to the verifier.
    pub examined: u64,
    /// Candidates the verifier released and that were deleted.
    pub removed: u64,
    /// Directories pruned after deletion.
    pub pruned_dirs: u64,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct Reconciler {
    root: PathBuf,
    verifier: Arc<dyn Verifier>,
    ctx: Arc<ServiceContext>,
    /// Objects younger than this are never submitted.
    min_age: Duration,
    running: AtomicBool,
}

/// Resets the running flag when a pass ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Reconciler {
    pub fn new(
        root: impl Into<PathBuf>,
        verifier: Arc<dyn Verifier>,
        ctx: Arc<ServiceContext>,
        min_age: Duration,
    ) -> Self {
        Self {
            root: root.into(),
            verifier,
            ctx,
            min_age,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one pass. Returns `None` when another pass is already running,
    /// the walk failed, or the pass was stopped before it could finish.
    pub async fn run_pass(&self, chunk_size: usize) -> Option<PassSummary> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("reconciliation pass already running, skipping");
            return None;
        }
        let _guard = RunningGuard(&self.running);

        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        let started = Instant::now();
        let mut summary = PassSummary::default();

        if !self.walk(chunk_size, &mut summary).await {
            return None;
        }

        if self.ctx.is_stopped() {
            info!(
                examined = summary.examined,
                removed = summary.removed,
                "reconciliation pass stopped early"
            );
            return None;
        }

        let (root, ctx) = (self.root.clone(), self.ctx.clone());
        match tokio::task::spawn_blocking(move || prune_empty_dirs(&root, &ctx)).await {
            Ok(Ok(pruned)) => summary.pruned_dirs = pruned,
            Ok(Err(err)) => {
                error!(%err, root = %self.root.display(), "Fail to remove empty dirs");
                return None;
            }
            Err(err) => {
                error!(%err, "prune task panicked");
                return None;
            }
        }

        summary.elapsed = started.elapsed();
        info!(
            examined = summary.examined,
            removed = summary.removed,
            pruned_dirs = summary.pruned_dirs,
            elapsed = ?summary.elapsed,
            "Cleaned"
        );
        Some(summary)
    }

    /// Walk the root on a blocking thread, flushing batches as the walker
    /// hands them over. Returns `false` if the walk itself failed; the batch
    /// being filled at that point is dropped unflushed.
    async fn walk(&self, chunk_size: usize, summary: &mut PassSummary) -> bool {
        let (tx, mut rx) = mpsc::channel(BATCH_QUEUE_DEPTH);
        let walker = Walker {
            root: self.root.clone(),
            ctx: self.ctx.clone(),
            min_age: self.min_age,
            chunk_size,
        };
        let walk = tokio::task::spawn_blocking(move || walker.run(&tx));

        while let Some(batch) = rx.recv().await {
            summary.removed += self.flush(batch).await;
        }

        match walk.await {
            Ok(Ok(examined)) => {
                summary.examined = examined;
                true
            }
            Ok(Err(err)) => {
                error!(%err, root = %self.root.display(), "Fail to walk dir");
                false
            }
            Err(err) => {
                error!(%err, "walk task panicked");
                false
            }
        }
    }

    /// Submit `batch` to the verifier and delete what it releases. A failed
    /// verifier call keeps the whole batch.
    async fn flush(&self, paths: Vec<String>) -> u64 {
        if paths.is_empty() || self.ctx.is_stopped() {
            return 0;
        }

        let released = match self.verifier.check(&paths).await {
            Ok(released) => released,
            Err(err) => {
                warn!(%err, batch = paths.len(), "verifier unavailable, keeping batch");
                return 0;
            }
        };

        let submitted: HashSet<&str> = paths.iter().map(String::as_str).collect();
        let mut removed = 0;
        for path in released {
            if !submitted.contains(path.as_str()) {
                warn!(path = %path, "verifier released a path that was not submitted, ignoring");
                continue;
            }
            let target = self.root.join(to_fs_path(&path));
            match remove_path(&target).await {
                Ok(()) => {
                    debug!(path = %path, "removed orphan");
                    removed += 1;
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %path, "orphan already gone");
                }
                Err(err) => error!(%err, path = %path, "Fail to remove path"),
            }
        }
        removed
    }
}

/// Blocking half of a pass: walks the tree and hands full batches of
/// candidates to the async side.
struct Walker {
    root: PathBuf,
    ctx: Arc<ServiceContext>,
    min_age: Duration,
    chunk_size: usize,
}

impl Walker {
    /// Returns the number of candidates collected. Stops early on the stop
    /// signal or when the receiving side is gone.
    fn run(self, tx: &mpsc::Sender<Vec<String>>) -> Result<u64, walkdir::Error> {
        let now = SystemTime::now();
        let mut examined = 0;
        let mut batch: Vec<String> = Vec::with_capacity(self.chunk_size);
        let mut entries = WalkDir::new(&self.root).min_depth(1).into_iter();

        while let Some(entry) = entries.next() {
            if self.ctx.is_stopped() {
                break;
            }
            let entry = entry?;

            let Some(relative) = self.relative_url(entry.path()) else {
                continue;
            };

            if entry.file_type().is_dir() {
                if entry.depth() == 1 && entry.file_name() == KVS_DIR_NAME {
                    entries.skip_current_dir();
                    continue;
                }
                if !is_archive_dir_name(&entry.file_name().to_string_lossy()) {
                    continue;
                }
                entries.skip_current_dir();
                if !self.old_enough(&entry, now) {
                    continue;
                }
                batch.push(format!("{relative}/"));
            } else {
                if !self.old_enough(&entry, now) {
                    continue;
                }
                batch.push(relative);
            }
            examined += 1;

            if batch.len() >= self.chunk_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(self.chunk_size));
                if tx.blocking_send(full).is_err() {
                    return Ok(examined);
                }
            }
        }

        if !batch.is_empty() {
            let _ = tx.blocking_send(batch);
        }
        Ok(examined)
    }

    fn relative_url(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let url = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        (!url.is_empty()).then_some(url)
    }

    fn old_enough(&self, entry: &walkdir::DirEntry, now: SystemTime) -> bool {
        if self.min_age.is_zero() {
            return true;
        }
        entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age >= self.min_age)
    }
}

/// Remove directories with no remaining children, innermost first, until
/// only non-empty directories (and the root) are left.
fn prune_empty_dirs(root: &Path, ctx: &ServiceContext) -> Result<u64, walkdir::Error> {
    let mut children: HashMap<PathBuf, usize> = HashMap::new();

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry?;
        let path = entry.path();
        match path.parent() {
            Some(parent) if parent != root => {
                *children.entry(parent.to_path_buf()).or_insert(0) += 1;
            }
            _ => {}
        }
        if entry.file_type().is_dir() {
            children.entry(path.to_path_buf()).or_insert(0);
        }
    }

    // Every iteration removes one key, so the loop ends after at most
    // `children.len()` rounds.
    let mut pruned = 0;
    let mut empty: Vec<PathBuf> = children
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(dir, _)| dir.clone())
        .collect();

    while let Some(dir) = empty.pop() {
        if ctx.is_stopped() {
            break;
        }
        children.remove(&dir);

        if let Err(err) = std::fs::remove_dir(&dir) {
            // A failed removal leaves the parent's count untouched, so
            // the parent is not pruned either.
            warn!(%err, dir = %dir.display(), "Fail to remove empty dir");
            continue;
        }
        pruned += 1;

        let Some(parent) = dir.parent() else {
            continue;
        };
        if let Some(count) = children.get_mut(parent) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                empty.push(parent.to_path_buf());
            }
        }
    }

    Ok(pruned)
}

async fn remove_path(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path).await?.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn walker(root: &Path, ctx: Arc<ServiceContext>, chunk_size: usize) -> Walker {
        Walker {
            root: root.to_path_buf(),
            ctx,
            min_age: Duration::ZERO,
            chunk_size,
        }
    }

    fn touch(root: &Path, names: &[&str]) {
        for name in names {
            std::fs::write(root.join(name), b"x").unwrap();
        }
    }

    #[test]
    fn walker_sends_full_batches_then_the_rest() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), &["a", "b", "c"]);
        let (tx, mut rx) = mpsc::channel(8);

        let examined = walker(dir.path(), Arc::new(ServiceContext::new()), 2)
            .run(&tx)
            .unwrap();
        drop(tx);

        assert_eq!(examined, 3);
        let mut sizes = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![2, 1]);
    }

    #[test]
    fn stopped_walker_collects_nothing() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), &["a", "b"]);
        let ctx = Arc::new(ServiceContext::new());
        ctx.request_stop();
        let (tx, mut rx) = mpsc::channel(8);

        assert_eq!(walker(dir.path(), ctx, 1).run(&tx).unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn walker_ends_when_receiver_is_gone() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), &["a", "b", "c"]);
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        let examined = walker(dir.path(), Arc::new(ServiceContext::new()), 1)
            .run(&tx)
            .unwrap();
        assert_eq!(examined, 1);
    }

    #[test]
    fn prune_removes_nested_empty_dirs_only() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        std::fs::create_dir_all(dir.path().join("d")).unwrap();
        touch(dir.path(), &["d/keep"]);

        let pruned = prune_empty_dirs(dir.path(), &ServiceContext::new()).unwrap();

        assert_eq!(pruned, 3);
        assert!(!dir.path().join("a").exists());
        assert!(dir.path().join("d/keep").exists());
    }

    #[test]
    fn prune_does_nothing_once_stopped() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        let ctx = ServiceContext::new();
        ctx.request_stop();

        assert_eq!(prune_empty_dirs(dir.path(), &ctx).unwrap(), 0);
        assert!(dir.path().join("a/b").is_dir());
    }
}
