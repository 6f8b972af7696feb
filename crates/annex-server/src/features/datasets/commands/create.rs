use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use annex_common::types::{Dataset, TransformJob, TRANSFORM_QUEUE};

use crate::db::{DbError, NewDataset};
use crate::features::FeatureState;
use crate::mq::MqError;
use crate::staging::{self, StagingError, UploadedFile};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDatasetCommand {
    pub project_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub format_version: String,
    #[serde(skip)]
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, thiserror::Error)]
pub enum CreateDatasetError {
    #[error("Project id must be a positive integer")]
    ProjectRequired,
    #[error("Dataset name is required and cannot be empty")]
    NameRequired,
    #[error("Format version is required and cannot be empty")]
    FormatVersionRequired,
    #[error("At least one file is required")]
    FilesRequired,
    #[error("A dataset named '{0}' already exists in this project")]
    DuplicateName(String),
    #[error("Database error: {0}")]
    Record(#[source] DbError),
    #[error("Staging error: {0}")]
    Staging(#[from] StagingError),
    #[error("Upload error: {0}")]
    Upload(#[from] anyhow::Error),
    #[error("Queue error: {0}")]
    Publish(#[from] MqError),
}

impl CreateDatasetCommand {
    pub fn validate(&self) -> Result<(), CreateDatasetError> {
        if self.project_id <= 0 {
            return Err(CreateDatasetError::ProjectRequired);
        }
        if self.name.trim().is_empty() {
            return Err(CreateDatasetError::NameRequired);
        }
        if self.format_version.trim().is_empty() {
            return Err(CreateDatasetError::FormatVersionRequired);
        }
        if self.files.is_empty() {
            return Err(CreateDatasetError::FilesRequired);
        }
        Ok(())
    }
}

/// Run the full ingestion hand-off for one dataset.
///
/// Order matters: the record is created first so a client-visible duplicate
/// check happens before any file I/O; files are then staged and uploaded,
/// and the transform job is published last, only after every object is in
/// the store. A failure after record creation leaves the record in status
/// 'pending' with no published job. The staging directory is removed on
/// every exit path by its guard.
#[tracing::instrument(skip(state, command), fields(project_id = command.project_id, name = %command.name, files = command.files.len()))]
pub async fn handle(
    state: &FeatureState,
    command: CreateDatasetCommand,
) -> Result<Dataset, CreateDatasetError> {
    command.validate()?;

    let exists = state
        .store
        .exists_by_name_and_project(&command.name, command.project_id)
        .await
        .map_err(CreateDatasetError::Record)?;
    if exists {
        return Err(CreateDatasetError::DuplicateName(command.name));
    }

    let record = state
        .store
        .create(&NewDataset {
            project_id: command.project_id,
            name: command.name.clone(),
            description: command.description.clone(),
            format_version: command.format_version.clone(),
        })
        .await
        .map_err(|err| match err {
            // Lost the race against a concurrent create with the same name.
            DbError::Duplicate(_) => CreateDatasetError::DuplicateName(command.name.clone()),
            other => CreateDatasetError::Record(other),
        })?;

    // One token spans staging and upload so the first failure in either
    // phase stops scheduling new work in both.
    let cancel = CancellationToken::new();

    let (staging_dir, staged_paths) = staging::stage_files(
        state.ingest.temp_dir.as_deref(),
        command.files,
        state.ingest.fan_out_limit,
        &cancel,
    )
    .await?;

    let keys = state
        .storage
        .upload_batch(
            record.project_id,
            &record.name,
            &staged_paths,
            state.ingest.fan_out_limit,
            &cancel,
        )
        .await?;

    // Local copies served their purpose once the objects are stored.
    drop(staging_dir);

    state.publisher.declare_queue(TRANSFORM_QUEUE).await?;

    let job = TransformJob {
        dataset: record.clone(),
        keys,
    };
    state.publisher.publish(TRANSFORM_QUEUE, &job).await?;

    tracing::info!(
        dataset_id = record.id,
        keys = job.keys.len(),
        "Dataset created and transform job published"
    );

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> CreateDatasetCommand {
        CreateDatasetCommand {
            project_id: 7,
            name: "demo".to_string(),
            description: Some("demo dataset".to_string()),
            format_version: "v1".to_string(),
            files: vec![UploadedFile {
                file_name: "a.txt".to_string(),
                content: b"alpha".to_vec(),
            }],
        }
    }

    #[test]
    fn test_validation_success() {
        assert!(command().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_nonpositive_project() {
        let mut cmd = command();
        cmd.project_id = 0;
        assert!(matches!(
            cmd.validate(),
            Err(CreateDatasetError::ProjectRequired)
        ));
    }

    #[test]
    fn test_validation_rejects_blank_name() {
        let mut cmd = command();
        cmd.name = "   ".to_string();
        assert!(matches!(cmd.validate(), Err(CreateDatasetError::NameRequired)));
    }

    #[test]
    fn test_validation_rejects_empty_format_version() {
        let mut cmd = command();
        cmd.format_version = String::new();
        assert!(matches!(
            cmd.validate(),
            Err(CreateDatasetError::FormatVersionRequired)
        ));
    }

    #[test]
    fn test_validation_rejects_empty_file_list() {
        let mut cmd = command();
        cmd.files.clear();
        assert!(matches!(
            cmd.validate(),
            Err(CreateDatasetError::FilesRequired)
        ));
    }
}
