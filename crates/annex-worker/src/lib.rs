//! Annex Worker Library
//!
//! Consumer side of the ingestion pipeline. The worker pulls transform jobs
//! from the durable queue, mirrors the referenced objects into a local
//! working directory, runs the transform step, and acknowledges the
//! delivery. Failures are retried with a bounded attempt budget and
//! exponential backoff; exhausted or undecodable jobs land on the
//! dead-letter queue.

pub mod config;
pub mod consumer;
pub mod fetcher;
pub mod transform;
