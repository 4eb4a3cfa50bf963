//! File-storage daemon: date-sharded uploads, on-the-fly image transforms,
//! zip archive directories, a recency cache and background reconciliation
//! against an external verifier.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
