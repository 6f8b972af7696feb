//! Transform step
//!
//! The transform is the seam between the generic consume loop and whatever
//! processing a deployment does with a fetched dataset. The loop owns
//! fetching, acknowledgement, and retries; implementations only see the job
//! and its local files.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use annex_common::types::TransformJob;

#[async_trait]
pub trait Transform: Send + Sync {
    /// Process one fetched dataset. `files` is index-aligned with
    /// `job.keys`. Returning an error sends the delivery through the retry
    /// path.
    async fn run(&self, job: &TransformJob, files: &[PathBuf]) -> anyhow::Result<()>;
}

/// Default transform: logs what was fetched and succeeds.
pub struct NoopTransform;

#[async_trait]
impl Transform for NoopTransform {
    async fn run(&self, job: &TransformJob, files: &[PathBuf]) -> anyhow::Result<()> {
        let total_bytes: u64 = files
            .iter()
            .filter_map(|path| std::fs::metadata(path).ok())
            .map(|meta| meta.len())
            .sum();

        info!(
            dataset_id = job.dataset.id,
            dataset = %job.dataset.name,
            files = files.len(),
            total_bytes,
            "Transform complete (noop)"
        );

        Ok(())
    }
}
