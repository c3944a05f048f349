//! Secure file-upload gateway: clients obtain presigned URLs, upload
//! straight to the blob store, then finalize through the service, which
//! verifies content and schedules an asynchronous scan before anything
//! becomes downloadable.

pub mod api;
pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod meta_store;
pub mod pg_database;
pub mod policy;
pub mod queue;
pub mod quota;
pub mod rate_limit;
pub mod s3_client;
pub mod scanner;
pub mod service;
