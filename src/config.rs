use crate::services::{reconciler::DEFAULT_CHUNK_SIZE, storage_service::StoreSettings};
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

const DEFAULT_MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    /// Verifier endpoint. Unset means nothing is ever reconciled away.
    pub clean_api_url: Option<String>,
    pub img_max_width: u32,
    pub img_max_height: u32,
    pub wm_path: Option<String>,
    pub wm_opacity: f32,
    pub wm_dir_paths: Vec<String>,
    pub cache_count: usize,
    pub cache_ttl_secs: u64,
    pub clean_chunk_size: usize,
    pub clean_min_age_secs: u64,
    pub max_upload_bytes: usize,
    /// Answer CORS preflights and allow any origin.
    pub http_cors: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "File storage daemon")]
pub struct Args {
    /// Host to bind to (overrides FILE_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Storage root directory (overrides FILE_STORE_DIR_PATH)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Verifier endpoint used by reconciliation (overrides FILE_STORE_CLEAN_API_URL)
    #[arg(long)]
    pub clean_api_url: Option<String>,

    /// Maximum width uploads are shrunk to (overrides FILE_STORE_IMG_MAX_WIDTH)
    #[arg(long)]
    pub img_max_width: Option<u32>,

    /// Maximum height uploads are shrunk to (overrides FILE_STORE_IMG_MAX_HEIGHT)
    #[arg(long)]
    pub img_max_height: Option<u32>,

    /// Watermark image (overrides FILE_STORE_WM_PATH)
    #[arg(long)]
    pub wm_path: Option<String>,

    /// Watermark opacity in 0..=1 (overrides FILE_STORE_WM_OPACITY)
    #[arg(long)]
    pub wm_opacity: Option<f32>,

    /// `;`-separated path prefixes that always get the watermark
    /// (overrides FILE_STORE_WM_DIR_PATHS)
    #[arg(long)]
    pub wm_dir_paths: Option<String>,

    /// Cached response count, 0 disables (overrides FILE_STORE_CACHE_COUNT)
    #[arg(long)]
    pub cache_count: Option<usize>,

    /// Idle seconds before a cached response expires (overrides FILE_STORE_CACHE_TTL_SECS)
    #[arg(long)]
    pub cache_ttl_secs: Option<u64>,

    /// Paths per verifier call (overrides FILE_STORE_CLEAN_CHUNK_SIZE)
    #[arg(long)]
    pub clean_chunk_size: Option<usize>,

    /// Minimum object age in seconds before reconciliation may remove it
    /// (overrides FILE_STORE_CLEAN_MIN_AGE_SECS)
    #[arg(long)]
    pub clean_min_age_secs: Option<u64>,

    /// Request body limit in bytes (overrides FILE_STORE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Enable permissive CORS headers (overrides FILE_STORE_HTTP_CORS)
    #[arg(long)]
    pub http_cors: Option<bool>,
}

/// Read and parse `name`, falling back to `default` when it is unset.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {name} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {name}")),
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn split_prefixes(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .collect()
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::from_args(Args::parse())
    }

    /// Merge already-parsed CLI args over the environment.
    pub fn from_args(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env_string("FILE_STORE_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = env_parse("FILE_STORE_PORT", 3000u16)?;
        let env_storage =
            env_string("FILE_STORE_DIR_PATH").unwrap_or_else(|| "./data/files".into());
        let wm_dirs = args
            .wm_dir_paths
            .or_else(|| env_string("FILE_STORE_WM_DIR_PATHS"))
            .map(|v| split_prefixes(&v))
            .unwrap_or_default();

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            clean_api_url: args
                .clean_api_url
                .or_else(|| env_string("FILE_STORE_CLEAN_API_URL")),
            img_max_width: match args.img_max_width {
                Some(v) => v,
                None => env_parse("FILE_STORE_IMG_MAX_WIDTH", 0)?,
            },
            img_max_height: match args.img_max_height {
                Some(v) => v,
                None => env_parse("FILE_STORE_IMG_MAX_HEIGHT", 0)?,
            },
            wm_path: args.wm_path.or_else(|| env_string("FILE_STORE_WM_PATH")),
            wm_opacity: match args.wm_opacity {
                Some(v) => v,
                None => env_parse("FILE_STORE_WM_OPACITY", 1.0)?,
            },
            wm_dir_paths: wm_dirs,
            cache_count: match args.cache_count {
                Some(v) => v,
                None => env_parse("FILE_STORE_CACHE_COUNT", 0)?,
            },
            cache_ttl_secs: match args.cache_ttl_secs {
                Some(v) => v,
                None => env_parse("FILE_STORE_CACHE_TTL_SECS", 600)?,
            },
            clean_chunk_size: match args.clean_chunk_size {
                Some(v) => v,
                None => env_parse("FILE_STORE_CLEAN_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            },
            clean_min_age_secs: match args.clean_min_age_secs {
                Some(v) => v,
                None => env_parse("FILE_STORE_CLEAN_MIN_AGE_SECS", 24 * 60 * 60)?,
            },
            max_upload_bytes: match args.max_upload_bytes {
                Some(v) => v,
                None => env_parse("FILE_STORE_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
            },
            http_cors: match args.http_cors {
                Some(v) => v,
                None => env_parse("FILE_STORE_HTTP_CORS", false)?,
            },
        };

        if !(0.0..=1.0).contains(&cfg.wm_opacity) {
            anyhow::bail!("watermark opacity {} is outside 0..=1", cfg.wm_opacity);
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Settings for the storage orchestrator.
    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            root: PathBuf::from(&self.storage_dir),
            img_max_width: self.img_max_width,
            img_max_height: self.img_max_height,
            watermark_path: self.wm_path.as_ref().map(PathBuf::from),
            watermark_opacity: self.wm_opacity,
            watermark_dirs: self.wm_dir_paths.clone(),
            cache_count: self.cache_count,
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            clean_chunk_size: self.clean_chunk_size,
            clean_min_age: Duration::from_secs(self.clean_min_age_secs),
            sync_jobs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_args_override_and_settings_follow() {
        let args = Args {
            host: Some("127.0.0.1".into()),
            port: Some(8080),
            storage_dir: Some("/tmp/files".into()),
            img_max_width: Some(1920),
            img_max_height: Some(1080),
            wm_opacity: Some(0.5),
            wm_dir_paths: Some(" photos/public ; ;brand".into()),
            cache_count: Some(10),
            cache_ttl_secs: Some(30),
            clean_chunk_size: Some(50),
            clean_min_age_secs: Some(0),
            max_upload_bytes: Some(1024),
            http_cors: Some(true),
            ..Args::default()
        };
        let cfg = AppConfig::from_args(args).unwrap();

        assert_eq!(cfg.addr(), "127.0.0.1:8080");
        assert!(cfg.http_cors);
        assert_eq!(cfg.wm_dir_paths, vec!["photos/public", "brand"]);

        let settings = cfg.store_settings();
        assert_eq!(settings.root, PathBuf::from("/tmp/files"));
        assert_eq!(settings.img_max_width, 1920);
        assert_eq!(settings.cache_ttl, Duration::from_secs(30));
        assert_eq!(settings.clean_chunk_size, 50);
        assert!(settings.clean_min_age.is_zero());
        assert!(!settings.sync_jobs);
    }

    #[test]
    fn opacity_out_of_range_is_rejected() {
        let args = Args {
            wm_opacity: Some(1.5),
            ..Args::default()
        };
        assert!(AppConfig::from_args(args).is_err());
    }

    #[test]
    fn prefixes_split_on_semicolons() {
        assert_eq!(split_prefixes("a;b/c; ;"), vec!["a", "b/c"]);
        assert!(split_prefixes("").is_empty());
    }
}
