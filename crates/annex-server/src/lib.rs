//! Annex Server Library
//!
//! HTTP server for registering datasets and staging their files into object
//! storage.
//!
//! # Overview
//!
//! The server exposes a multipart intake endpoint for dataset creation. Each
//! request flows through the ingestion pipeline:
//!
//! - **Record Store**: a `datasets` row is created in PostgreSQL (SQLx)
//! - **Intake Stager**: uploaded files are copied to a private temporary
//!   directory under bounded concurrency
//! - **Object Store Uploader**: staged files are transferred to an
//!   S3-compatible bucket under deterministic keys
//! - **Job Publisher**: one transform job referencing the dataset record and
//!   the uploaded keys is published to a durable AMQP queue
//!
//! The temporary directory is removed on every exit path, success or error.
//! The pipeline is not transactional: an upload or publish failure leaves
//! the dataset record in its pending status with no corresponding job.
//!
//! # Framework Stack
//!
//! - **Axum**: HTTP routing and multipart extraction
//! - **SQLx**: PostgreSQL access and migrations
//! - **aws-sdk-s3**: object storage client
//! - **lapin**: AMQP publisher

pub mod api;
pub mod config;
pub mod db;
pub mod features;
pub mod mq;
pub mod staging;
pub mod storage;
