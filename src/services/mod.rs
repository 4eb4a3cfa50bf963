pub mod archive;
pub mod cache;
pub mod context;
pub mod kvs_service;
pub mod namespace;
pub mod reconciler;
pub mod storage_service;
pub mod transform;
pub mod verifier;
