//! Object fetcher
//!
//! Mirrors a job's object keys under a local root directory, preserving the
//! key path structure so the transform step sees the same layout the
//! producer uploaded.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use aws_sdk_s3::{
    config::{Credentials, Region},
    Client,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use annex_common::fanout::{self, BatchOutcome};

use crate::config::S3Settings;

#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    bucket: String,
}

impl Fetcher {
    pub fn new(settings: &S3Settings) -> Self {
        let credentials = Credentials::new(
            &settings.access_key,
            &settings.secret_key,
            None,
            None,
            "annex-worker",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(settings.region.clone()))
            .force_path_style(settings.path_style);

        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket.clone(),
        }
    }

    /// Local destination for `key` under `root`, mirroring the key's path
    /// segments. Parent directories are created here.
    ///
    /// Keys arrive over the queue, so they are untrusted: any `.` or `..`
    /// component is rejected rather than resolved, keeping every
    /// destination inside `root`.
    pub fn prepare_local_path(root: &Path, key: &str) -> Result<PathBuf> {
        let relative = key.trim_start_matches('/');
        if relative.is_empty() {
            anyhow::bail!("Object key is empty");
        }

        let has_non_normal = Path::new(relative)
            .components()
            .any(|component| !matches!(component, std::path::Component::Normal(_)));
        if has_non_normal {
            anyhow::bail!("Object key '{key}' contains invalid path components");
        }

        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        Ok(path)
    }

    /// GET one object and write it to `path`.
    #[instrument(skip(self, path))]
    pub async fn download_to(&self, key: &str, path: &Path) -> Result<()> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to fetch s3://{}/{}", self.bucket, key))?;

        let data = response
            .body
            .collect()
            .await
            .with_context(|| format!("Failed to read body of s3://{}/{}", self.bucket, key))?;

        tokio::fs::write(path, data.into_bytes())
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        debug!("Fetched s3://{}/{} to {}", self.bucket, key, path.display());

        Ok(())
    }

    /// Fetch every key under `root`, at most `limit` downloads in flight.
    ///
    /// Slots in the outcome are index-aligned with `keys`. The first
    /// failure cancels siblings that have not started, but completed slots
    /// are retained so the caller can see exactly which files made it to
    /// disk before the batch failed.
    #[instrument(skip(self, keys, root, cancel), fields(keys = keys.len()))]
    pub async fn fetch_batch(
        &self,
        keys: &[String],
        root: &Path,
        limit: usize,
        cancel: &CancellationToken,
    ) -> BatchOutcome<PathBuf, anyhow::Error> {
        let root = root.to_path_buf();

        fanout::run_indexed(keys.to_vec(), limit, cancel, |_, key| {
            let root = root.clone();
            async move {
                let path = Self::prepare_local_path(&root, &key)?;
                match self.download_to(&key, &path).await {
                    Ok(()) => Ok(path),
                    Err(err) => {
                        warn!(key = %key, error = %err, "Fetch failed");
                        Err(err)
                    }
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_path_mirrors_key_segments() {
        let root = tempfile::tempdir().unwrap();
        let path = Fetcher::prepare_local_path(root.path(), "7/demo/a.txt").unwrap();

        assert_eq!(path, root.path().join("7/demo/a.txt"));
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn test_leading_slash_is_stripped() {
        let root = tempfile::tempdir().unwrap();
        let path = Fetcher::prepare_local_path(root.path(), "/7/demo/a.txt").unwrap();

        assert!(path.starts_with(root.path()));
        assert_eq!(path, root.path().join("7/demo/a.txt"));
    }

    #[test]
    fn test_empty_key_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        assert!(Fetcher::prepare_local_path(root.path(), "").is_err());
        assert!(Fetcher::prepare_local_path(root.path(), "/").is_err());
    }

    #[test]
    fn test_parent_components_are_rejected() {
        // Keys come off the queue untrusted; a traversal component must not
        // resolve to a destination outside the working root.
        let root = tempfile::tempdir().unwrap();
        assert!(Fetcher::prepare_local_path(root.path(), "../escape.txt").is_err());
        assert!(Fetcher::prepare_local_path(root.path(), "7/../../escape.txt").is_err());
        assert!(Fetcher::prepare_local_path(root.path(), "7/./demo/a.txt").is_err());
    }

    fn stub_settings(addr: std::net::SocketAddr) -> S3Settings {
        S3Settings {
            endpoint: Some(format!("http://{addr}")),
            region: "us-east-1".to_string(),
            bucket: "annex-test".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: true,
        }
    }

    /// Minimal path-style object store: 200 with a fixed body for any key,
    /// 404 NoSuchKey for keys containing "missing".
    async fn spawn_stub_store() -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        let Ok(n) = socket.read(&mut chunk).await else {
                            return;
                        };
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.windows(4).any(|window| window == b"\r\n\r\n") {
                            break;
                        }
                    }

                    let request_line = String::from_utf8_lossy(&buf);
                    let request_line = request_line.lines().next().unwrap_or("");
                    let response = if request_line.contains("missing") {
                        let body = concat!(
                            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>",
                            "<Error><Code>NoSuchKey</Code>",
                            "<Message>The specified key does not exist.</Message></Error>",
                        );
                        format!(
                            "HTTP/1.1 404 Not Found\r\nContent-Type: application/xml\r\n\
                             Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else {
                        let body = "payload";
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\n\
                             Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    };

                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_fetch_batch_mirrors_all_keys_on_success() {
        let addr = spawn_stub_store().await;
        let root = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(&stub_settings(addr));
        let cancel = CancellationToken::new();

        let keys = vec!["7/demo/a.txt".to_string(), "7/demo/b.png".to_string()];
        let paths = fetcher
            .fetch_batch(&keys, root.path(), 2, &cancel)
            .await
            .into_result()
            .unwrap();

        assert_eq!(paths[0], root.path().join("7/demo/a.txt"));
        assert_eq!(paths[1], root.path().join("7/demo/b.png"));
        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_fetch_batch_retains_completed_paths_on_failure() {
        // Three keys, last one missing from the store: the batch reports
        // the error, and the two files fetched before it stay in their
        // index-aligned slots on disk.
        let addr = spawn_stub_store().await;
        let root = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(&stub_settings(addr));
        let cancel = CancellationToken::new();

        let keys = vec![
            "7/demo/a.txt".to_string(),
            "7/demo/b.png".to_string(),
            "7/demo/missing.bin".to_string(),
        ];
        let outcome = fetcher.fetch_batch(&keys, root.path(), 1, &cancel).await;

        assert!(outcome.first_error.is_some());
        let expected_a = root.path().join("7/demo/a.txt");
        let expected_b = root.path().join("7/demo/b.png");
        assert_eq!(outcome.slots[0].as_deref(), Some(expected_a.as_path()));
        assert_eq!(outcome.slots[1].as_deref(), Some(expected_b.as_path()));
        assert!(outcome.slots[2].is_none());
        assert_eq!(std::fs::read(&expected_a).unwrap(), b"payload");
        assert_eq!(std::fs::read(&expected_b).unwrap(), b"payload");
    }
}
