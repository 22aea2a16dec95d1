//! Location photo ingestion: provider metadata → validated downloads →
//! durable blob copies → merged location records, run in rate-limited
//! batches off the request path.
pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod model;
pub mod photos;
pub mod pipeline;
pub mod places;
pub mod runner;
pub mod status;
pub mod storage;
