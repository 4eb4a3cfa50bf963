//! Process-level state shared by the orchestrator, the transform engine and
//! the reconciler: the stop signal, the outstanding-work tracker and the
//! optional watermark image.
//!
//! One instance is owned by `StorageService` and handed to collaborators
//! behind an `Arc`.

use image::DynamicImage;
use parking_lot::RwLock;
use std::{future::Future, path::Path, sync::Arc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

#[derive(Debug, Default)]
pub struct ServiceContext {
    stop: CancellationToken,
    jobs: TaskTracker,
    watermark: RwLock<Option<Arc<DynamicImage>>>,
}

impl ServiceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once shutdown has been requested. Background work polls this
    /// between steps and winds down early.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Token cancelled together with the stop signal.
    pub fn child_token(&self) -> CancellationToken {
        self.stop.child_token()
    }

    /// Run `fut` on the runtime, counted as outstanding work.
    pub fn spawn_job<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.jobs.spawn(fut);
    }

    /// Await `fut` inline while counting it as outstanding work.
    pub async fn run_job<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        self.jobs.track_future(fut).await
    }

    pub fn outstanding_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Raise the stop signal without waiting. Running jobs notice it at
    /// their next check.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Raise the stop signal and wait for every tracked job to finish.
    pub async fn stop_and_wait(&self) {
        self.request_stop();
        self.jobs.close();
        self.jobs.wait().await;
    }

    /// Decode the watermark at `path` and keep it for the process lifetime.
    pub fn load_watermark(&self, path: &Path) -> Result<(), image::ImageError> {
        let img = image::open(path)?;
        *self.watermark.write() = Some(Arc::new(img));
        Ok(())
    }

    pub fn set_watermark(&self, img: DynamicImage) {
        *self.watermark.write() = Some(Arc::new(img));
    }

    pub fn watermark(&self) -> Option<Arc<DynamicImage>> {
        self.watermark.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn stop_waits_for_spawned_jobs() {
        let ctx = Arc::new(ServiceContext::new());
        let token = ctx.child_token();

        ctx.spawn_job(async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        assert_eq!(ctx.outstanding_jobs(), 1);
        assert!(!ctx.is_stopped());

        ctx.stop_and_wait().await;

        assert!(ctx.is_stopped());
        assert_eq!(ctx.outstanding_jobs(), 0);
    }

    #[test]
    fn watermark_starts_empty() {
        let ctx = ServiceContext::new();
        assert!(ctx.watermark().is_none());
        ctx.set_watermark(DynamicImage::new_rgba8(4, 4));
        assert_eq!(ctx.watermark().map(|w| w.width()), Some(4));
    }
}
