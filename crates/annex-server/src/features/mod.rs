//! Feature modules implementing the ingestion API
//!
//! Each feature is a vertical slice with its own commands, queries, and
//! routes. Commands are write paths with validation and a standalone
//! `handle` function; queries are read paths in the same shape.

pub mod datasets;

use axum::Router;

use crate::config::IngestConfig;
use crate::db::DatasetStore;
use crate::mq::JobPublisher;
use crate::storage::Storage;

/// Shared state for all feature routes.
#[derive(Clone)]
pub struct FeatureState {
    /// Dataset record store backed by PostgreSQL.
    pub store: DatasetStore,
    /// S3-compatible object store for staged file uploads.
    pub storage: Storage,
    /// Durable queue publisher for transform jobs.
    pub publisher: JobPublisher,
    /// Staging and fan-out settings.
    pub ingest: IngestConfig,
}

/// Creates the main API router with all feature routes mounted.
pub fn api_routes() -> Router<FeatureState> {
    Router::new().nest("/datasets", datasets::routes::dataset_routes())
}
