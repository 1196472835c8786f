//! This crate provides h5lens, a server for browsing and extracting bounded views of HDF5
//! datasets held in S3 compatible object storage. Clients never download whole files: each
//! request names a file and a dataset path, and receives a size-limited matrix window, line
//! profile, heatmap, preview or streamed CSV export, serialized as JSON-safe values.
//!
//! Every operation is planned against the dataset shape before any element is read, so
//! requests that would exceed the configured ceilings fail early with a structured error.
//! Results are cached in tiers keyed by the object version, so replacing a file invalidates
//! everything derived from it.
//!
//! h5lens is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime.
//! * [Axum](axum) web framework, built by the Tokio team, on top of the [hyper] HTTP library.
//! * [Serde](serde) performs serialisation of JSON response data.
//! * [AWS SDK for S3](aws-sdk-s3) is used to interact with S3-compatible object stores.
//! * [ndarray] provides [NumPy](https://numpy.org)-like n-dimensional arrays used for slicing
//!   and statistics.
//! * [lru] bounds the result cache tiers, the opened file tier and the per-file block cache.
//! * [zune-inflate](zune_inflate) decompresses deflated HDF5 chunks.
//!
//! HDF5 containers are read by the [h5] module, a pure Rust reader which fetches only the
//! byte ranges it needs through [range_reader].

pub mod app;
pub mod app_state;
pub mod array;
pub mod axes;
pub mod cache;
pub mod cli;
pub mod dataset;
pub mod error;
pub mod explorer;
pub mod export;
pub mod h5;
pub mod heatmap;
pub mod limits;
pub mod line;
pub mod matrix;
pub mod metrics;
pub mod models;
pub mod preview;
pub mod range_reader;
pub mod request;
pub mod resource_manager;
pub mod s3_client;
pub mod sanitize;
pub mod server;
pub mod stats;
pub mod store;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod validated_query;
