//! HTTP handlers for uploading, serving and reconciling stored objects.
//! Storage concerns are delegated to `StorageService`; this layer only parses
//! requests and builds conditional-GET aware responses.

use crate::{
    errors::AppError,
    models::{
        stored::StoredContent,
        transform::{ResizeMethod, TransformRequest},
    },
    services::storage_service::StorageService,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    response::Response,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::io::{self, ErrorKind};
use tracing::{debug, warn};

/// Query params accepted by `GET /{*path}`. Every field is parsed leniently:
/// malformed numbers count as zero, unknown methods as `fill`.
#[derive(Debug, Default, Deserialize)]
pub struct GetObjectQuery {
    pub w: Option<String>,
    pub h: Option<String>,
    pub m: Option<String>,
    pub blur: Option<String>,
    pub grayscale: Option<String>,
    /// Attachment name stem. Non-empty triggers a download.
    pub download: Option<String>,
}

impl GetObjectQuery {
    pub fn transform_request(&self) -> TransformRequest {
        TransformRequest {
            method: self
                .m
                .as_deref()
                .map(ResizeMethod::parse_lenient)
                .unwrap_or_default(),
            width: parse_dimension(self.w.as_deref()),
            height: parse_dimension(self.h.as_deref()),
            blur: self
                .blur
                .as_deref()
                .and_then(|v| v.trim().parse::<f32>().ok())
                .unwrap_or(0.0),
            grayscale: self.grayscale.as_deref().is_some_and(parse_flag),
            watermark: false,
        }
    }

    pub fn download_name(&self) -> Option<&str> {
        self.download
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub path: String,
}

fn parse_dimension(value: Option<&str>) -> u32 {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|v| v.clamp(0, i64::from(u32::MAX)) as u32)
        .unwrap_or(0)
}

pub(crate) fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "t" | "on" | "yes"
    )
}

/// `POST /` multipart upload with fields `dir`, `file`, `no_cut` and
/// `extract_zip`.
///
/// A `file` part that follows `dir` is streamed straight to disk with the
/// flags seen so far. One that arrives before `dir` is buffered until the
/// form ends.
pub async fn upload_object(
    State(service): State<StorageService>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut dir: Option<String> = None;
    let mut stored: Option<String> = None;
    let mut buffered: Option<(String, Bytes)> = None;
    let mut no_cut = false;
    let mut extract_zip = false;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "Fail to parse multipart form");
                return Err(AppError::bad_request("bad_form_data", err.body_text()));
            }
        };

        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "file" if stored.is_some() || buffered.is_some() => {
                debug!("ignoring repeated file field");
            }
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_owned();
                match dir.as_deref() {
                    Some(dir) => {
                        let chunks =
                            field.map_err(|err| io::Error::new(ErrorKind::InvalidData, err));
                        let path = service
                            .create_stream(dir, &file_name, chunks, no_cut, extract_zip)
                            .await?;
                        stored = Some(path);
                    }
                    None => {
                        let data = field.bytes().await.map_err(|err| {
                            warn!(%err, "Fail to read uploaded file");
                            AppError::bad_request("bad_file", err.body_text())
                        })?;
                        buffered = Some((file_name, data));
                    }
                }
            }
            "dir" | "no_cut" | "extract_zip" => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request("bad_form_data", err.body_text()))?;
                match name.as_str() {
                    "dir" => dir = Some(value),
                    "no_cut" => no_cut = parse_flag(&value),
                    _ => extract_zip = parse_flag(&value),
                }
            }
            other => debug!(field = other, "ignoring unknown form field"),
        }
    }

    let Some(dir) = dir else {
        return Err(AppError::bad_request("bad_form_data", "field `dir` is required"));
    };
    let path = match (stored, buffered) {
        (Some(path), _) => path,
        (None, Some((file_name, data))) => {
            service
                .create(&dir, &file_name, data, no_cut, extract_zip)
                .await?
        }
        (None, None) => {
            return Err(AppError::bad_request("bad_file", "field `file` is required"));
        }
    };

    Ok(Json(UploadResponse { path }))
}

/// `GET /{*path}`: serve a stored object, optionally transformed or as an
/// attachment.
pub async fn get_object(
    State(service): State<StorageService>,
    Path(path): Path<String>,
    Query(query): Query<GetObjectQuery>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    // The captured path loses a trailing slash; it selects an archive's index.
    let mut path = path;
    if uri.path().ends_with('/') && !path.ends_with('/') {
        path.push('/');
    }

    let params = query.transform_request();
    let download = query.download_name();
    let stored = service.get(&path, &params, download.is_some()).await?;

    Ok(content_response(&headers, stored, download))
}

/// `GET /clean`: start one reconciliation pass with the default chunk size.
pub async fn clean(State(service): State<StorageService>) -> StatusCode {
    service.clean(0).await;
    StatusCode::OK
}

/// Build a 200 (or 304) response for `stored`, honoring `If-None-Match` and
/// `If-Modified-Since` from the request.
pub(crate) fn content_response(
    req_headers: &HeaderMap,
    stored: StoredContent,
    download: Option<&str>,
) -> Response {
    let etag = format!("\"{:x}\"", md5::compute(&stored.content));
    let not_modified = is_not_modified(req_headers, &etag, stored.mod_time);

    let mut response = if not_modified {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NOT_MODIFIED;
        response
    } else {
        let len = stored.content.len();
        let mut response = Response::new(Body::from(stored.content));
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        response
    };

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&etag) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&http_date(stored.mod_time)) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    if not_modified {
        return response;
    }

    match download {
        Some(stem) => {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            let disposition = format!(
                "attachment; filename=\"{}{}\"",
                header_safe(stem),
                extension_of(&stored.name)
            );
            if let Ok(value) = HeaderValue::from_str(&disposition) {
                headers.insert(header::CONTENT_DISPOSITION, value);
            }
        }
        None => {
            let mime = mime_guess::from_path(&stored.name).first_or_octet_stream();
            let value = HeaderValue::from_str(mime.essence_str())
                .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
            headers.insert(header::CONTENT_TYPE, value);
        }
    }

    response
}

fn is_not_modified(headers: &HeaderMap, etag: &str, mod_time: DateTime<Utc>) -> bool {
    if let Some(value) = headers.get(header::IF_NONE_MATCH) {
        let Ok(value) = value.to_str() else {
            return false;
        };
        return value
            .split(',')
            .map(str::trim)
            .any(|candidate| candidate == "*" || candidate == etag);
    }

    not_modified_since(headers, mod_time)
}

/// True when `If-Modified-Since` is present and not older than `mod_time`,
/// compared at whole-second precision.
pub(crate) fn not_modified_since(headers: &HeaderMap, mod_time: DateTime<Utc>) -> bool {
    headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .is_some_and(|since| mod_time.timestamp() <= since.timestamp())
}

/// IMF-fixdate, as used by `Last-Modified`.
pub(crate) fn http_date(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn extension_of(name: &str) -> String {
    std::path::Path::new(name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

/// Drop characters that would break out of a quoted header parameter.
pub(crate) fn header_safe(v: &str) -> String {
    v.chars()
        .filter(|c| *c != '"' && *c != '\\' && !c.is_control())
        .collect()
}
