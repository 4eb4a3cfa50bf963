//! Test fixtures: encoded images, zip archives and verifier doubles.

use async_trait::async_trait;
use file_store::services::verifier::{OfflineVerifier, Verifier, VerifierError};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    io::{Cursor, Read, Write},
    sync::Arc,
    time::Duration,
};
use zip::{ZipArchive, ZipWriter, write::SimpleFileOptions};

/// Solid-color PNG of the given size.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb(color));
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .expect("encode png fixture");
    buf
}

#[allow(dead_code)]
pub fn decode(bytes: &[u8]) -> DynamicImage {
    image::load_from_memory(bytes).expect("decode image")
}

/// Build a zip holding `entries` (name, content) in order.
#[allow(dead_code)]
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .expect("start zip entry");
        writer.write_all(content).expect("write zip entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

/// Every file in a zip, keyed by its entry name.
#[allow(dead_code)]
pub fn unzip_map(bytes: &[u8]) -> BTreeMap<String, Vec<u8>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).expect("open zip");
    let mut out = BTreeMap::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).expect("zip entry");
        if file.is_dir() {
            continue;
        }
        let mut content = Vec::new();
        file.read_to_end(&mut content).expect("read zip entry");
        out.insert(file.name().to_owned(), content);
    }
    out
}

/// Content set used by the archive round-trip tests.
#[allow(dead_code)]
pub fn site_entries() -> Vec<(&'static str, &'static [u8])> {
    vec![
        ("index.html", b"<h1>index</h1>".as_slice()),
        ("abc/file.txt", b"file".as_slice()),
        ("abc/qwe/x.txt", b"deep".as_slice()),
        ("todo.txt", b"todo".as_slice()),
    ]
}

/// Offline verifier that records every batch, releasing all of it or none.
#[allow(dead_code)]
pub fn recording_verifier(
    release_all: bool,
) -> (Arc<OfflineVerifier>, Arc<Mutex<Vec<Vec<String>>>>) {
    let calls: Arc<Mutex<Vec<Vec<String>>>> = Arc::default();
    let seen = calls.clone();
    let verifier = OfflineVerifier::with_handler(move |paths| {
        seen.lock().push(paths.to_vec());
        if release_all { paths.to_vec() } else { Vec::new() }
    });
    (Arc::new(verifier), calls)
}

/// Verifier whose every call fails.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct FailingVerifier;

#[async_trait]
impl Verifier for FailingVerifier {
    async fn check(&self, _paths: &[String]) -> Result<Vec<String>, VerifierError> {
        Err(VerifierError::Status {
            status: reqwest::StatusCode::BAD_GATEWAY,
            body: "upstream down".into(),
        })
    }
}

/// Verifier that waits before releasing everything, to hold a pass open.
#[allow(dead_code)]
#[derive(Debug)]
pub struct SlowVerifier(pub Duration);

#[async_trait]
impl Verifier for SlowVerifier {
    async fn check(&self, paths: &[String]) -> Result<Vec<String>, VerifierError> {
        tokio::time::sleep(self.0).await;
        Ok(paths.to_vec())
    }
}
