use axum::{
    extract::{Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use crate::api::response::{ApiResponse, ErrorResponse};
use crate::staging::UploadedFile;

use super::{
    commands::{CreateDatasetCommand, CreateDatasetError},
    queries::{PresignFileError, PresignFileQuery},
};
use crate::features::FeatureState;

pub fn dataset_routes() -> Router<FeatureState> {
    Router::new()
        .route("/", post(create_dataset))
        .route("/presign", get(presign_file))
}

/// Pull the dataset metadata fields and file parts out of the multipart
/// body. Field order is not assumed; file order is preserved as received.
async fn parse_create_multipart(
    mut multipart: Multipart,
) -> Result<CreateDatasetCommand, DatasetApiError> {
    let mut project_id: Option<i64> = None;
    let mut name: Option<String> = None;
    let mut description: Option<String> = None;
    let mut format_version: Option<String> = None;
    let mut files: Vec<UploadedFile> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| DatasetApiError::Multipart(format!("Failed to read multipart field: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "project_id" => {
                let text = field.text().await.map_err(|e| {
                    DatasetApiError::Multipart(format!("Failed to read project_id: {e}"))
                })?;
                project_id = Some(text.trim().parse().map_err(|_| {
                    DatasetApiError::Multipart(format!("project_id is not an integer: '{text}'"))
                })?);
            }
            "name" => {
                name = Some(field.text().await.map_err(|e| {
                    DatasetApiError::Multipart(format!("Failed to read name: {e}"))
                })?);
            }
            "description" => {
                description = Some(field.text().await.map_err(|e| {
                    DatasetApiError::Multipart(format!("Failed to read description: {e}"))
                })?);
            }
            "format_version" => {
                format_version = Some(field.text().await.map_err(|e| {
                    DatasetApiError::Multipart(format!("Failed to read format_version: {e}"))
                })?);
            }
            "files" => {
                let file_name = field
                    .file_name()
                    .map(|s| s.to_string())
                    .ok_or_else(|| {
                        DatasetApiError::Multipart("File part is missing a filename".to_string())
                    })?;
                let data = field.bytes().await.map_err(|e| {
                    DatasetApiError::Multipart(format!(
                        "Failed to read file '{file_name}': {e}"
                    ))
                })?;
                files.push(UploadedFile {
                    file_name,
                    content: data.to_vec(),
                });
            }
            _ => {
                // Unknown parts are ignored rather than rejected.
            }
        }
    }

    Ok(CreateDatasetCommand {
        project_id: project_id
            .ok_or_else(|| DatasetApiError::Multipart("Missing field 'project_id'".to_string()))?,
        name: name.ok_or_else(|| DatasetApiError::Multipart("Missing field 'name'".to_string()))?,
        description,
        format_version: format_version.ok_or_else(|| {
            DatasetApiError::Multipart("Missing field 'format_version'".to_string())
        })?,
        files,
    })
}

#[tracing::instrument(skip(state, multipart))]
async fn create_dataset(
    State(state): State<FeatureState>,
    multipart: Multipart,
) -> Result<Response, DatasetApiError> {
    let command = parse_create_multipart(multipart).await?;

    let dataset = super::commands::create::handle(&state, command).await?;

    tracing::info!(
        dataset_id = dataset.id,
        project_id = dataset.project_id,
        name = %dataset.name,
        "Dataset created via API"
    );

    Ok((StatusCode::CREATED, Json(ApiResponse::success(dataset))).into_response())
}

#[tracing::instrument(skip(state))]
async fn presign_file(
    State(state): State<FeatureState>,
    Query(query): Query<PresignFileQuery>,
) -> Result<Response, DatasetApiError> {
    let response = super::queries::presign::handle(&state.storage, query).await?;

    tracing::debug!(
        key = %response.key,
        expires_in = response.expires_in,
        "Presigned download URL generated via API"
    );

    Ok((StatusCode::OK, Json(ApiResponse::success(response))).into_response())
}

#[derive(Debug)]
enum DatasetApiError {
    Multipart(String),
    Create(CreateDatasetError),
    Presign(PresignFileError),
}

impl From<CreateDatasetError> for DatasetApiError {
    fn from(err: CreateDatasetError) -> Self {
        Self::Create(err)
    }
}

impl From<PresignFileError> for DatasetApiError {
    fn from(err: PresignFileError) -> Self {
        Self::Presign(err)
    }
}

impl IntoResponse for DatasetApiError {
    fn into_response(self) -> Response {
        match self {
            DatasetApiError::Multipart(ref message) => {
                let error = ErrorResponse::new("INVALID_REQUEST", message);
                (StatusCode::BAD_REQUEST, Json(error)).into_response()
            }

            DatasetApiError::Create(CreateDatasetError::ProjectRequired)
            | DatasetApiError::Create(CreateDatasetError::NameRequired)
            | DatasetApiError::Create(CreateDatasetError::FormatVersionRequired)
            | DatasetApiError::Create(CreateDatasetError::FilesRequired) => {
                let error = ErrorResponse::new("VALIDATION_ERROR", self.to_string());
                (StatusCode::BAD_REQUEST, Json(error)).into_response()
            }
            DatasetApiError::Create(CreateDatasetError::DuplicateName(_)) => {
                let error = ErrorResponse::new("DUPLICATE_DATASET", self.to_string());
                (StatusCode::CONFLICT, Json(error)).into_response()
            }
            DatasetApiError::Create(CreateDatasetError::Record(_)) => {
                tracing::error!("Database error during dataset creation: {}", self);
                let error = ErrorResponse::new("DATABASE_ERROR", "A database error occurred");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(error)).into_response()
            }
            DatasetApiError::Create(CreateDatasetError::Staging(_))
            | DatasetApiError::Create(CreateDatasetError::Upload(_)) => {
                tracing::error!("Storage error during dataset creation: {}", self);
                let error = ErrorResponse::new("STORAGE_ERROR", "A storage error occurred");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(error)).into_response()
            }
            DatasetApiError::Create(CreateDatasetError::Publish(_)) => {
                tracing::error!("Queue error during dataset creation: {}", self);
                let error = ErrorResponse::new("QUEUE_ERROR", "A queue error occurred");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(error)).into_response()
            }

            DatasetApiError::Presign(PresignFileError::ProjectRequired)
            | DatasetApiError::Presign(PresignFileError::DatasetNameRequired)
            | DatasetApiError::Presign(PresignFileError::FileNameRequired)
            | DatasetApiError::Presign(PresignFileError::ExpiryOutOfRange) => {
                let error = ErrorResponse::new("VALIDATION_ERROR", self.to_string());
                (StatusCode::BAD_REQUEST, Json(error)).into_response()
            }
            DatasetApiError::Presign(PresignFileError::NotFound) => {
                let error = ErrorResponse::new("NOT_FOUND", "File not found");
                (StatusCode::NOT_FOUND, Json(error)).into_response()
            }
            DatasetApiError::Presign(PresignFileError::Storage(_)) => {
                tracing::error!("Storage error during presign: {}", self);
                let error = ErrorResponse::new("STORAGE_ERROR", "A storage error occurred");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(error)).into_response()
            }
        }
    }
}

impl std::fmt::Display for DatasetApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Multipart(message) => write!(f, "{}", message),
            Self::Create(e) => write!(f, "{}", e),
            Self::Presign(e) => write!(f, "{}", e),
        }
    }
}
