//! Object store client and batch uploader
//!
//! Staged files are transferred to one pre-existing bucket under
//! deterministic keys of the form `{project_id}/{dataset_name}/{file_name}`.
//! Uploading never deletes the local staged file; staging-directory cleanup
//! belongs to the orchestrator.

use anyhow::{anyhow, Context, Result};
use aws_sdk_s3::{
    config::{Credentials, Region},
    presigning::PresigningConfig,
    primitives::ByteStream,
    Client,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use annex_common::fanout;

pub mod config;
pub mod content_type;

pub use content_type::detect_content_type;

#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
}

impl Storage {
    pub async fn new(config: config::StorageConfig) -> Result<Self> {
        debug!("Initializing storage with config: {:?}", config);

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "annex-storage",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Storage client initialized for bucket: {}", config.bucket);

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }

    /// Deterministic object key for one uploaded file.
    ///
    /// Derived from the file's base name only: two files with identical
    /// names in the same batch produce the same key. Downstream consumers
    /// depend on this exact scheme, so it is not disambiguated here.
    pub fn build_key(&self, project_id: i64, dataset_name: &str, file_name: &str) -> String {
        format!("{}/{}/{}", project_id, dataset_name, file_name)
    }

    /// Streamed PUT of one staged file under `key`.
    #[instrument(skip(self))]
    pub async fn upload_file(&self, key: &str, path: &Path) -> Result<()> {
        let content_type = detect_content_type(path).await;

        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("Failed to open staged file {}", path.display()))?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body);

        if let Some(ct) = content_type {
            request = request.content_type(ct);
        }

        request
            .send()
            .await
            .with_context(|| format!("Failed to upload to s3://{}/{}", self.bucket, key))?;

        debug!("Uploaded {} to s3://{}/{}", path.display(), self.bucket, key);

        Ok(())
    }

    /// Upload every staged file under its deterministic key, at most `limit`
    /// transfers in flight.
    ///
    /// The returned key list is index-aligned with `paths`: each worker
    /// writes into its own pre-allocated slot, so ordering survives
    /// unordered completion. The first error aborts the batch; objects
    /// already uploaded are left in the store, since a retried request
    /// produces the same keys and overwrites them.
    #[instrument(skip(self, paths, cancel), fields(files = paths.len()))]
    pub async fn upload_batch(
        &self,
        project_id: i64,
        dataset_name: &str,
        paths: &[PathBuf],
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let items: Vec<(String, PathBuf)> = paths
            .iter()
            .map(|path| {
                let file_name = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .ok_or_else(|| anyhow!("Staged path {} has no file name", path.display()))?;
                Ok((
                    self.build_key(project_id, dataset_name, file_name),
                    path.clone(),
                ))
            })
            .collect::<Result<_>>()?;

        let outcome = fanout::run_indexed(items, limit, cancel, |_, (key, path)| async move {
            match self.upload_file(&key, &path).await {
                Ok(()) => Ok(key),
                Err(err) => {
                    warn!(key = %key, error = %err, "Upload failed");
                    Err(err)
                }
            }
        })
        .await;

        let keys = outcome.into_result()?;
        info!(
            "Uploaded {} files for dataset '{}' in project {}",
            keys.len(),
            dataset_name,
            project_id
        );

        Ok(keys)
    }

    /// Check whether an object exists under `key`.
    #[instrument(skip(self))]
    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.to_string().contains("NotFound") || e.to_string().contains("404") {
                    Ok(false)
                } else {
                    Err(anyhow!("Failed to check S3 object existence: {}", e))
                }
            }
        }
    }

    /// Temporary signed GET URL for one object.
    #[instrument(skip(self))]
    pub async fn generate_presigned_url(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<String> {
        let presigning_config = PresigningConfig::expires_in(expires_in)
            .context("Failed to create presigning config")?;

        let presigned_request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .context("Failed to generate presigned URL")?;

        Ok(presigned_request.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_storage() -> Storage {
        Storage {
            client: Client::from_conf(
                aws_sdk_s3::Config::builder()
                    .region(Region::new("us-east-1"))
                    .build(),
            ),
            bucket: "test-bucket".to_string(),
        }
    }

    #[test]
    fn test_build_key() {
        let storage = test_storage();
        assert_eq!(storage.build_key(7, "demo", "a.txt"), "7/demo/a.txt");
        assert_eq!(storage.build_key(7, "demo", "b.png"), "7/demo/b.png");
    }

    #[test]
    fn test_build_key_collides_on_duplicate_names() {
        // Keys derive from the base name only; duplicates collide. This
        // pins current behavior, not a correctness guarantee.
        let storage = test_storage();
        let first = storage.build_key(7, "demo", "a.txt");
        let second = storage.build_key(7, "demo", "a.txt");
        assert_eq!(first, second);
    }
}
