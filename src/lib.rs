//! # contractq
//!
//! Asynchronous contract-document pipeline: OCR extraction, validation,
//! purchase-order generation and notifications, moved by durable queues.
//!
//! Contracts live in a document store with a versioned conditioned write
//! (Postgres JSONB), tasks live in pgmq. In-memory implementations of both
//! back the tests.

pub mod admission;
pub mod breaker;
pub mod collab;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod model;
pub mod ocr;
pub mod queue;
pub mod retry;
pub mod router;
pub mod store;
pub mod telemetry;
pub mod validation;

pub use error::{Error, Failure, Result};
