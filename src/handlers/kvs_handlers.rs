//! HTTP handlers for the key-value blob store mounted at `/kvs/{key}`.

use crate::{
    errors::AppError,
    handlers::object_handlers::{header_safe, http_date, not_modified_since},
    services::storage_service::StorageService,
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use serde::Deserialize;
use std::io;
use tokio_util::io::ReaderStream;

#[derive(Debug, Default, Deserialize)]
pub struct KvsGetQuery {
    pub download: Option<String>,
}

/// `POST /kvs/{key}`: store the raw request body.
pub async fn kvs_set(
    State(service): State<StorageService>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let stream = futures::stream::once(async move { Ok::<_, io::Error>(body) });
    service.kvs.set(&key, stream).await?;
    Ok(StatusCode::OK)
}

/// `GET /kvs/{key}`: stream the stored body back.
pub async fn kvs_get(
    State(service): State<StorageService>,
    Path(key): Path<String>,
    Query(query): Query<KvsGetQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let (file, mod_time) = service.kvs.get(&key).await?;

    let mut response = if not_modified_since(&headers, mod_time) {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NOT_MODIFIED;
        response
    } else {
        Response::new(Body::from_stream(ReaderStream::new(file)))
    };

    let resp_headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&http_date(mod_time)) {
        resp_headers.insert(header::LAST_MODIFIED, value);
    }

    let download = query
        .download
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty());
    match download {
        Some(name) => {
            resp_headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            let disposition = format!("attachment; filename=\"{}\"", header_safe(name));
            if let Ok(value) = HeaderValue::from_str(&disposition) {
                resp_headers.insert(header::CONTENT_DISPOSITION, value);
            }
        }
        None => {
            let mime = mime_guess::from_path(&key).first_or_octet_stream();
            if let Ok(value) = HeaderValue::from_str(mime.essence_str()) {
                resp_headers.insert(header::CONTENT_TYPE, value);
            }
        }
    }

    Ok(response)
}

/// `DELETE /kvs/{key}`
pub async fn kvs_remove(
    State(service): State<StorageService>,
    Path(key): Path<String>,
) -> Result<StatusCode, AppError> {
    service.kvs.remove(&key).await?;
    Ok(StatusCode::OK)
}
