//! Dataset record store
//!
//! The only writes the ingestion pipeline performs against the database:
//! creating a dataset record and checking name uniqueness within a project.
//! The record's `status` defaults to `pending` and is not touched here; the
//! worker owns later transitions.

use sqlx::{PgPool, Row};
use tracing::instrument;

use annex_common::types::Dataset;

use super::{DbError, DbResult};

/// Parameters for creating a dataset record
#[derive(Debug, Clone)]
pub struct NewDataset {
    pub project_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub format_version: String,
}

/// Narrow handle over the `datasets` table
#[derive(Clone)]
pub struct DatasetStore {
    pool: PgPool,
}

impl DatasetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a dataset record and read back the stored row.
    ///
    /// A unique-constraint violation on `(project_id, name)` surfaces as
    /// [`DbError::Duplicate`]; every other failure as [`DbError::Sqlx`].
    #[instrument(skip(self), fields(project_id = new.project_id, name = %new.name))]
    pub async fn create(&self, new: &NewDataset) -> DbResult<Dataset> {
        let row = sqlx::query(
            r#"
            INSERT INTO datasets (project_id, name, description, format_version)
            VALUES ($1, $2, $3, $4)
            RETURNING id, project_id, name, description, format_version, status,
                      created_at, updated_at
            "#,
        )
        .bind(new.project_id)
        .bind(&new.name)
        .bind(&new.description)
        .bind(&new.format_version)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DbError::duplicate("Dataset", &new.name)
            }
            _ => DbError::Sqlx(err),
        })?;

        Ok(Dataset {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            format_version: row.try_get("format_version")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Duplicate-name guard, checked before any file I/O begins.
    #[instrument(skip(self))]
    pub async fn exists_by_name_and_project(
        &self,
        name: &str,
        project_id: i64,
    ) -> DbResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM datasets
                WHERE name = $1 AND project_id = $2
            ) AS "exists"
            "#,
        )
        .bind(name)
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("exists")?)
    }
}
