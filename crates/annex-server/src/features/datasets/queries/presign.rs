use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::storage::Storage;

const DEFAULT_EXPIRY_SECS: u64 = 3600;
const MAX_EXPIRY_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresignFileQuery {
    pub project_id: i64,
    pub dataset_name: String,
    pub file_name: String,
    pub expires_in: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresignFileResponse {
    pub key: String,
    pub presigned_url: String,
    pub expires_in: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum PresignFileError {
    #[error("Project id must be a positive integer")]
    ProjectRequired,
    #[error("Dataset name is required and cannot be empty")]
    DatasetNameRequired,
    #[error("File name is required and cannot be empty")]
    FileNameRequired,
    #[error("Expiry must be between 1 and {MAX_EXPIRY_SECS} seconds")]
    ExpiryOutOfRange,
    #[error("File not found")]
    NotFound,
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl PresignFileQuery {
    pub fn validate(&self) -> Result<(), PresignFileError> {
        if self.project_id <= 0 {
            return Err(PresignFileError::ProjectRequired);
        }
        if self.dataset_name.trim().is_empty() {
            return Err(PresignFileError::DatasetNameRequired);
        }
        if self.file_name.trim().is_empty() {
            return Err(PresignFileError::FileNameRequired);
        }
        if let Some(secs) = self.expires_in {
            if secs == 0 || secs > MAX_EXPIRY_SECS {
                return Err(PresignFileError::ExpiryOutOfRange);
            }
        }
        Ok(())
    }
}

#[tracing::instrument(skip(storage, query))]
pub async fn handle(
    storage: &Storage,
    query: PresignFileQuery,
) -> Result<PresignFileResponse, PresignFileError> {
    query.validate()?;

    let key = storage.build_key(query.project_id, &query.dataset_name, &query.file_name);

    if !storage.exists(&key).await? {
        return Err(PresignFileError::NotFound);
    }

    let expires_in = query.expires_in.unwrap_or(DEFAULT_EXPIRY_SECS);
    let presigned_url = storage
        .generate_presigned_url(&key, Duration::from_secs(expires_in))
        .await?;

    Ok(PresignFileResponse {
        key,
        presigned_url,
        expires_in,
    })
}
