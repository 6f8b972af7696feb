//! Annex Common Library
//!
//! Shared types, utilities, and error handling for the Annex project.
//!
//! # Overview
//!
//! This crate provides common functionality used across all Annex workspace members:
//!
//! - **Wire Types**: The dataset record snapshot and transform job message
//!   exchanged between the API server and the worker
//! - **Fan-out**: Bounded-concurrency, index-stable batch execution
//! - **Logging**: Centralized tracing initialization
//!
//! # Example
//!
//! ```no_run
//! use annex_common::types::{Dataset, TransformJob};
//!
//! fn describe(job: &TransformJob) -> String {
//!     format!("dataset {} with {} objects", job.dataset.name, job.keys.len())
//! }
//! ```

pub mod fanout;
pub mod logging;
pub mod types;
