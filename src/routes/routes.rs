//! Route table for the file store.
//!
//!   - `POST   /`            multipart upload
//!   - `GET    /clean`       start a reconciliation pass
//!   - `GET    /healthz`, `GET /readyz`
//!   - `POST|GET|DELETE /kvs/{key}`  key-value blobs
//!   - `GET    /{*path}`     serve a stored object
//!
//! Static routes take precedence over the catch-all. With `cors` every
//! route answers preflights and carries permissive CORS headers.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        kvs_handlers::{kvs_get, kvs_remove, kvs_set},
        object_handlers::{clean, get_object, upload_object},
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

/// Build the router. Request bodies are capped at `max_upload_bytes`.
pub fn routes(max_upload_bytes: usize, cors: bool) -> Router<StorageService> {
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/clean", get(clean))
        .route(
            "/kvs/{key}",
            post(kvs_set).get(kvs_get).delete(kvs_remove),
        )
        .route("/", post(upload_object))
        .route("/{*path}", get(get_object))
        .layer(DefaultBodyLimit::max(max_upload_bytes));

    if cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}
