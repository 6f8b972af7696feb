//! Wire types shared by the API server and the dataset worker
//!
//! The JSON shape of these types is the contract carried over the durable
//! queue. Field names and ordering of `keys` must stay stable; the worker
//! decodes exactly what the server publishes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable queue carrying transform jobs, declared by the publisher and
/// consumed by the worker.
pub const TRANSFORM_QUEUE: &str = "dataset.transform";

/// Terminal queue for jobs that exhausted their retry budget or could not
/// be decoded.
pub const TRANSFORM_DEAD_QUEUE: &str = "dataset.transform.dead";

/// Persisted dataset record, owned by the record store.
///
/// The ingestion pipeline treats a record as an immutable snapshot once
/// created; the worker is expected to transition `status` after processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub format_version: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One unit of asynchronous work: a dataset snapshot plus the ordered list
/// of object keys uploaded for it.
///
/// `keys[i]` corresponds to the i-th file the client uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformJob {
    pub dataset: Dataset,
    pub keys: Vec<String>,
}

impl TransformJob {
    pub fn new(dataset: Dataset, keys: Vec<String>) -> Self {
        Self { dataset, keys }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_dataset() -> Dataset {
        Dataset {
            id: 42,
            project_id: 7,
            name: "demo".to_string(),
            description: None,
            format_version: "1.0".to_string(),
            status: "pending".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_transform_job_round_trip() {
        let job = TransformJob::new(
            sample_dataset(),
            vec!["7/demo/a.txt".to_string(), "7/demo/b.png".to_string()],
        );

        let encoded = serde_json::to_vec(&job).unwrap();
        let decoded: TransformJob = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(decoded, job);
        assert_eq!(decoded.keys, job.keys);
    }

    #[test]
    fn test_transform_job_wire_field_names() {
        let job = TransformJob::new(sample_dataset(), vec!["7/demo/a.txt".to_string()]);
        let value = serde_json::to_value(&job).unwrap();

        let dataset = value.get("dataset").unwrap();
        for field in [
            "id",
            "project_id",
            "name",
            "description",
            "format_version",
            "status",
            "created_at",
            "updated_at",
        ] {
            assert!(dataset.get(field).is_some(), "missing field {field}");
        }
        assert!(dataset.get("description").unwrap().is_null());
        assert_eq!(value.get("keys").unwrap().as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_key_order_survives_decode() {
        let keys: Vec<String> = (0..50).map(|i| format!("7/demo/file-{i}.txt")).collect();
        let job = TransformJob::new(sample_dataset(), keys.clone());

        let decoded: TransformJob =
            serde_json::from_slice(&serde_json::to_vec(&job).unwrap()).unwrap();
        assert_eq!(decoded.keys, keys);
    }
}
