//! Storage service test utilities.

use file_store::{
    routes::routes::routes,
    services::{
        storage_service::{StorageService, StoreSettings},
        verifier::{OfflineVerifier, Verifier},
    },
};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tempfile::TempDir;

/// A storage service rooted in a temporary directory.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestStore {
    pub service: StorageService,
    root: PathBuf,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestStore {
    /// Defaults suited to tests: passes run inline and every object is old
    /// enough to be reconciled.
    pub async fn new() -> Self {
        Self::with(|_| {}, Arc::new(OfflineVerifier::new())).await
    }

    pub async fn with_settings(configure: impl FnOnce(&mut StoreSettings)) -> Self {
        Self::with(configure, Arc::new(OfflineVerifier::new())).await
    }

    pub async fn with(
        configure: impl FnOnce(&mut StoreSettings),
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let root = temp_dir.path().join("files");

        let mut settings = StoreSettings {
            root: root.clone(),
            clean_min_age: Duration::ZERO,
            sync_jobs: true,
            ..StoreSettings::default()
        };
        configure(&mut settings);

        let service = StorageService::open(settings, verifier)
            .await
            .expect("Failed to open storage");

        Self {
            service,
            root,
            _temp_dir: temp_dir,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn router(&self) -> axum::Router {
        self.router_with_cors(false)
    }

    pub fn router_with_cors(&self, cors: bool) -> axum::Router {
        routes(16 * 1024 * 1024, cors).with_state(self.service.clone())
    }

    /// Write `content` at `rel` beneath the root, creating parents.
    pub fn put_file(&self, rel: &str, content: &[u8]) {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dirs");
        }
        fs::write(&path, content).expect("write file");
    }

    pub fn put_dir(&self, rel: &str) {
        fs::create_dir_all(self.root.join(rel)).expect("create dir");
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.root.join(rel).exists()
    }

    /// Names directly under the root, sorted.
    pub fn top_level(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.root)
            .expect("read root")
            .map(|e| e.expect("dir entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}
