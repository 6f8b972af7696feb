//! Intake stager
//!
//! Copies uploaded file contents into a private per-request temporary
//! directory before transfer to the object store. The directory is created
//! here with restrictive permissions; its lifetime is owned by the returned
//! [`TempDir`] guard, so it is removed exactly once on every exit path of
//! the orchestrator. Disk usage is proportional to the total upload size for
//! the lifetime of the request.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use annex_common::fanout;

/// One uploaded file as received from the multipart intake, ordering and
/// original filename intact.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Failed to create staging directory: {0}")]
    CreateDir(#[source] std::io::Error),

    #[error("Uploaded file has no usable name: '{0}'")]
    InvalidFileName(String),

    #[error("Failed to write staged file: {0}")]
    Write(#[from] std::io::Error),
}

/// Stage `files` into a fresh private directory, at most `limit` writes in
/// flight.
///
/// Returns the directory guard and the staged paths, index-aligned with the
/// input. On any write failure the whole operation fails with the first
/// error and the partially populated directory is removed (the guard drops
/// here). Two files with the same base name stage to the same path; the
/// later write wins, mirroring the object-key collision downstream.
#[instrument(skip(files, cancel), fields(files = files.len()))]
pub async fn stage_files(
    base_dir: Option<&Path>,
    files: Vec<UploadedFile>,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<(TempDir, Vec<PathBuf>), StagingError> {
    let dir = create_staging_dir(base_dir)?;

    // Resolve target paths up front so a bad filename fails before any I/O.
    let targets: Vec<(PathBuf, Vec<u8>)> = files
        .into_iter()
        .map(|file| {
            let base = sanitize_file_name(&file.file_name)
                .ok_or_else(|| StagingError::InvalidFileName(file.file_name.clone()))?;
            Ok((dir.path().join(base), file.content))
        })
        .collect::<Result<_, StagingError>>()?;

    let outcome = fanout::run_indexed(targets, limit, cancel, |_, (path, content)| async move {
        match tokio::fs::write(&path, &content).await {
            Ok(()) => Ok(path),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Staging write failed");
                Err(err)
            }
        }
    })
    .await;

    let paths = outcome.into_result().map_err(StagingError::Write)?;

    debug!(
        "Staged {} files under {}",
        paths.len(),
        dir.path().display()
    );

    Ok((dir, paths))
}

fn create_staging_dir(base_dir: Option<&Path>) -> Result<TempDir, StagingError> {
    let mut builder = tempfile::Builder::new();
    let prefix = Uuid::new_v4().to_string();
    builder.prefix(&prefix);

    let dir = match base_dir {
        Some(base) => {
            std::fs::create_dir_all(base).map_err(StagingError::CreateDir)?;
            builder.tempdir_in(base).map_err(StagingError::CreateDir)?
        }
        None => builder.tempdir().map_err(StagingError::CreateDir)?,
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))
            .map_err(StagingError::CreateDir)?;
    }

    Ok(dir)
}

/// Reduce a client-supplied filename to its base name, discarding any path
/// components the client may have sent.
fn sanitize_file_name(name: &str) -> Option<&str> {
    Path::new(name)
        .file_name()
        .and_then(|base| base.to_str())
        .filter(|base| !base.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(name: &str, content: &[u8]) -> UploadedFile {
        UploadedFile {
            file_name: name.to_string(),
            content: content.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_staging_preserves_input_order() {
        let cancel = CancellationToken::new();
        let files = vec![
            upload("a.txt", b"alpha"),
            upload("b.png", b"bravo"),
            upload("c.csv", b"charlie"),
        ];

        let (dir, paths) = stage_files(None, files, 2, &cancel).await.unwrap();

        assert_eq!(paths.len(), 3);
        assert_eq!(paths[0].file_name().unwrap(), "a.txt");
        assert_eq!(paths[1].file_name().unwrap(), "b.png");
        assert_eq!(paths[2].file_name().unwrap(), "c.csv");
        assert_eq!(std::fs::read(&paths[1]).unwrap(), b"bravo");
        assert!(paths.iter().all(|p| p.starts_with(dir.path())));
    }

    #[tokio::test]
    async fn test_staging_under_configured_base_dir() {
        let base = tempfile::tempdir().unwrap();
        let nested = base.path().join("staging");
        let cancel = CancellationToken::new();

        let (dir, paths) = stage_files(Some(&nested), vec![upload("a.txt", b"x")], 1, &cancel)
            .await
            .unwrap();

        assert!(dir.path().starts_with(&nested));
        assert!(paths[0].exists());
    }

    #[tokio::test]
    async fn test_dropping_guard_removes_directory() {
        let cancel = CancellationToken::new();
        let (dir, paths) = stage_files(None, vec![upload("a.txt", b"x")], 1, &cancel)
            .await
            .unwrap();

        let dir_path = dir.path().to_path_buf();
        assert!(dir_path.exists());
        drop(dir);
        assert!(!dir_path.exists());
        assert!(!paths[0].exists());
    }

    #[tokio::test]
    async fn test_invalid_file_name_fails_before_io() {
        let cancel = CancellationToken::new();
        let result = stage_files(None, vec![upload("..", b"x")], 1, &cancel).await;
        assert!(matches!(result, Err(StagingError::InvalidFileName(_))));
    }

    #[tokio::test]
    async fn test_path_components_are_discarded() {
        let cancel = CancellationToken::new();
        let (dir, paths) = stage_files(
            None,
            vec![upload("../../etc/passwd.txt", b"x")],
            1,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(paths[0].parent().unwrap(), dir.path());
        assert_eq!(paths[0].file_name().unwrap(), "passwd.txt");
    }

    #[tokio::test]
    async fn test_duplicate_names_collide_last_write_wins() {
        // Same base name stages to the same path. Pinned behavior: the
        // object-key scheme downstream collides identically.
        let cancel = CancellationToken::new();
        let (_dir, paths) = stage_files(
            None,
            vec![upload("a.txt", b"first"), upload("a.txt", b"second")],
            1,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(paths[0], paths[1]);
        assert_eq!(std::fs::read(&paths[1]).unwrap(), b"second");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_staging_dir_permissions_are_restrictive() {
        use std::os::unix::fs::PermissionsExt;

        let cancel = CancellationToken::new();
        let (dir, _paths) = stage_files(None, vec![upload("a.txt", b"x")], 1, &cancel)
            .await
            .unwrap();

        let mode = std::fs::metadata(dir.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_files_any_limit_stays_index_stable() {
        for limit in [1usize, 3, 16] {
            let cancel = CancellationToken::new();
            let files: Vec<UploadedFile> = (0..24)
                .map(|i| upload(&format!("file-{i}.bin"), format!("payload-{i}").as_bytes()))
                .collect();

            let (_dir, paths) = stage_files(None, files, limit, &cancel).await.unwrap();

            for (i, path) in paths.iter().enumerate() {
                assert_eq!(
                    path.file_name().unwrap().to_str().unwrap(),
                    format!("file-{i}.bin")
                );
                assert_eq!(std::fs::read(path).unwrap(), format!("payload-{i}").as_bytes());
            }
        }
    }
}
