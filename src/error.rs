//! Error handling.

use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_smithy_types::byte_stream::error::Error as ByteStreamError;
use axum::{
    extract::rejection::QueryRejection,
    http::header,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use ndarray::ShapeError;
use serde::{Deserialize, Serialize};
use std::error::Error;
use thiserror::Error;
use tokio::sync::AcquireError;
use tracing::{event, Level};
use zune_inflate::errors::InflateDecodeErrors;

use crate::limits::Limit;

/// h5lens error type
///
/// This type encapsulates the various errors that may occur.
/// Each variant maps to a stable error code and an HTTP status.
#[derive(Debug, Error)]
pub enum H5LensError {
    /// A query parameter could not be parsed or is contradictory
    #[error("invalid parameter `{field}`: {reason}")]
    InvalidParameter { field: String, reason: String },

    /// Error deserialising the query string
    #[error("query string is not valid")]
    QueryRejection(#[from] QueryRejection),

    /// Error validating a parsed request
    #[error("request parameters are not valid")]
    RequestValidation(#[from] validator::ValidationErrors),

    /// The dataset type does not support the requested operation
    #[error("{operation} is not supported for dtype {dtype}")]
    UnsupportedDtype { operation: &'static str, dtype: String },

    /// Error creating an ndarray view from a shape
    #[error("failed to create array from shape")]
    ShapeInvalid(#[from] ShapeError),

    /// A window offset lies beyond the axis extent
    #[error("offset {offset} is outside axis {axis} of length {extent}")]
    OutOfRange {
        axis: usize,
        offset: usize,
        extent: usize,
    },

    /// A requested size crosses a configured ceiling
    #[error("requested {requested} exceeds {limit} ({allowed})")]
    LimitExceeded {
        limit: Limit,
        requested: u64,
        allowed: u64,
    },

    /// Series requested for comparison cannot be overlaid
    #[error("cannot compare with {path}: {reason}")]
    IncompatibleCompare { path: String, reason: String },

    /// Path does not resolve to a group or dataset
    #[error("{path} not found")]
    NotFound { path: String },

    /// Storage or format level read failure
    #[error("failed to read {context}")]
    UpstreamRead { context: String },

    /// Error retrieving object metadata from S3
    #[error("error retrieving object metadata from S3 storage")]
    S3HeadObject(#[from] SdkError<HeadObjectError>),

    /// Error retrieving an object from S3
    #[error("error retrieving object from S3 storage")]
    S3GetObject(#[from] SdkError<GetObjectError>),

    /// Error reading object data from S3
    #[error("error receiving object from S3 storage")]
    S3ByteStream(#[from] ByteStreamError),

    /// Local I/O error while receiving an object range
    #[error("error buffering object data")]
    Io(#[from] std::io::Error),

    /// The object is not a readable HDF5 container
    #[error("invalid HDF5 structure: {0}")]
    Hdf5Format(String),

    /// A chunk could not be inflated
    #[error("failed to decompress chunk")]
    DecompressionZune(#[from] InflateDecodeErrors),

    /// Error acquiring a semaphore
    #[error("error acquiring resources")]
    SemaphoreAcquireError(#[from] AcquireError),

    /// A blocking extraction task failed to complete
    #[error("extraction task failed")]
    TaskJoin(#[from] tokio::task::JoinError),

    /// Error serialising a payload
    #[error("failed to serialise payload")]
    Serialisation(#[from] serde_json::Error),

    /// Error converting between integer types
    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),
}

impl H5LensError {
    /// Shorthand for an [H5LensError::InvalidParameter].
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an [H5LensError::NotFound].
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Shorthand for an [H5LensError::UpstreamRead].
    pub fn upstream(context: impl Into<String>) -> Self {
        Self::UpstreamRead {
            context: context.into(),
        }
    }

    /// Stable, machine readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParameter { .. }
            | Self::QueryRejection(_)
            | Self::RequestValidation(_)
            | Self::UnsupportedDtype { .. }
            | Self::ShapeInvalid(_) => "validation_error",
            Self::OutOfRange { .. } => "out_of_range",
            Self::LimitExceeded { .. } => "limit_exceeded",
            Self::IncompatibleCompare { .. } => "incompatible_compare",
            Self::NotFound { .. } => "not_found",
            Self::S3HeadObject(err) if is_s3_not_found(err) => "not_found",
            Self::S3GetObject(SdkError::ServiceError(err))
                if matches!(err.err(), GetObjectError::NoSuchKey(_)) =>
            {
                "not_found"
            }
            Self::UpstreamRead { .. }
            | Self::S3HeadObject(_)
            | Self::S3GetObject(_)
            | Self::S3ByteStream(_)
            | Self::Io(_)
            | Self::Hdf5Format(_)
            | Self::DecompressionZune(_) => "upstream_read_error",
            Self::SemaphoreAcquireError(_)
            | Self::TaskJoin(_)
            | Self::Serialisation(_)
            | Self::TryFromInt(_) => "internal_error",
        }
    }
}

fn is_s3_not_found(error: &SdkError<HeadObjectError>) -> bool {
    match error {
        SdkError::ServiceError(err) => matches!(err.err(), HeadObjectError::NotFound(_)),
        _ => false,
    }
}

impl IntoResponse for H5LensError {
    /// Convert from an `H5LensError` into an [axum::response::Response].
    fn into_response(self) -> Response {
        ErrorResponse::from(self).into_response()
    }
}

/// Structured details attached to limit errors
#[derive(Debug, Deserialize, PartialEq, Serialize)]
struct LimitDetails {
    limit: String,
    requested: u64,
    allowed: u64,
}

/// Body of error response
#[derive(Deserialize, Serialize)]
struct ErrorBody {
    /// Stable error code
    code: String,

    /// Main error message
    message: String,

    /// Optional list of causes
    #[serde(skip_serializing_if = "Option::is_none")]
    caused_by: Option<Vec<String>>,

    /// Ceiling details for limit errors
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<LimitDetails>,
}

impl ErrorBody {
    /// Return a new ErrorBody carrying the full cause chain.
    fn new(error: &H5LensError) -> Self {
        let message = error.to_string();
        let mut caused_by = None;
        let mut current = error.source();
        while let Some(source) = current {
            let mut causes: Vec<String> = caused_by.unwrap_or_default();
            causes.push(source.to_string());
            caused_by = Some(causes);
            current = source.source();
        }
        // Remove duplicate entries.
        if let Some(caused_by) = caused_by.as_mut() {
            caused_by.dedup()
        }
        let details = match error {
            H5LensError::LimitExceeded {
                limit,
                requested,
                allowed,
            } => Some(LimitDetails {
                limit: limit.to_string(),
                requested: *requested,
                allowed: *allowed,
            }),
            _ => None,
        };
        ErrorBody {
            code: error.code().to_string(),
            message,
            caused_by,
            details,
        }
    }

    /// Return an ErrorBody that does not leak storage internals.
    fn opaque(error: &H5LensError, message: &str) -> Self {
        ErrorBody {
            code: error.code().to_string(),
            message: message.to_string(),
            caused_by: None,
            details: None,
        }
    }
}

/// A response to send in error cases
#[derive(Deserialize, Serialize)]
struct ErrorResponse {
    /// HTTP status of the response
    #[serde(skip)]
    status: StatusCode,

    /// Response body
    error: ErrorBody,
}

impl From<H5LensError> for ErrorResponse {
    /// Convert from an `H5LensError` into an `ErrorResponse`.
    fn from(error: H5LensError) -> Self {
        let (status, body) = match error.code() {
            "validation_error" | "out_of_range" | "limit_exceeded" | "incompatible_compare" => {
                (StatusCode::BAD_REQUEST, ErrorBody::new(&error))
            }
            "not_found" => (StatusCode::NOT_FOUND, ErrorBody::new(&error)),
            "upstream_read_error" => (
                StatusCode::BAD_GATEWAY,
                ErrorBody::opaque(&error, "failed to read data from storage"),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::opaque(&error, "internal server error"),
            ),
        };

        // Log server errors with their full context.
        if status.is_server_error() {
            event!(Level::ERROR, "{}", error.to_string());
            let mut current = error.source();
            while let Some(source) = current {
                event!(Level::ERROR, "Caused by: {}", source.to_string());
                current = source.source();
            }
        }

        ErrorResponse {
            status,
            error: body,
        }
    }
}

impl IntoResponse for ErrorResponse {
    /// Convert from an `ErrorResponse` into an `axum::response::Response`.
    ///
    /// Renders the response as JSON.
    fn into_response(self) -> Response {
        let json_body = serde_json::to_string_pretty(&self);
        match json_body {
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialise error response: {}", err),
            )
                .into_response(),
            Ok(json_body) => (
                self.status,
                [(&header::CONTENT_TYPE, mime::APPLICATION_JSON.to_string())],
                json_body,
            )
                .into_response(),
        }
    }
}
