//! Dataset ingestion feature
//!
//! Covers the whole producer side of the pipeline: multipart intake,
//! record creation, staging, object-store upload, and transform job
//! publication, plus a presigned-download read path.

pub mod commands;
pub mod queries;
pub mod routes;
