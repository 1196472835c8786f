//! Axum extractor that parses and validates query parameters

use crate::error::H5LensError;
use crate::request::FromQuery;

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Query},
    http::request::Parts,
};

/// An axum extractor based on the Query extractor. The raw string parameters are parsed into a
/// typed request with [FromQuery] and then validated using the validator crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatedQuery<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ValidatedQuery<T>
where
    T: FromQuery,
    S: Send + Sync,
{
    type Rejection = H5LensError;

    /// Extract a `ValidatedQuery` from request parts.
    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(raw) = Query::<T::Raw>::from_request_parts(parts, state).await?;
        let value = T::from_raw(raw)?;
        value.validate()?;
        Ok(ValidatedQuery(value))
    }
}

#[cfg(test)]
mod tests {
    // https://github.com/tokio-rs/axum/blob/main/examples/testing/src/main.rs

    use super::*;
    use crate::request::HeatmapRequest;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
        response::Response,
        routing::get,
        Router,
    };
    use regex::Regex;
    use tower::ServiceExt; // for `oneshot` and `ready`

    // Handler function that accepts a ValidatedQuery extractor.
    async fn test_handler(ValidatedQuery(request): ValidatedQuery<HeatmapRequest>) -> String {
        format!(
            "path: {} max_size: {:?} stats: {}",
            request.path, request.max_size, request.include_stats
        )
    }

    // Build a router and make a oneshot request.
    async fn request(query: &str) -> Response {
        Router::new()
            .route("/", get(test_handler))
            .oneshot(
                Request::builder()
                    .uri(format!("/?{}", query))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    // Jump through the hoops to get the body as a string.
    async fn body_string(response: Response) -> String {
        String::from_utf8(
            hyper::body::to_bytes(response.into_body())
                .await
                .unwrap()
                .to_vec(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn ok() {
        let response = request("file=a.h5&path=/x&max_size=%20256&include_stats=0").await;

        assert_eq!(response.status(), StatusCode::OK);

        let body = body_string(response).await;
        assert_eq!(&body[..], "path: /x max_size: Some(256) stats: false");
    }

    #[tokio::test]
    async fn malformed_integer() {
        let response = request("file=a.h5&path=/x&max_size=big").await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_string(response).await;
        let re = Regex::new(r#""code": "validation_error""#).unwrap();
        assert!(re.is_match(&body[..]), "body: {body}");
        let re = Regex::new(r".*max_size.*is not a valid integer.*").unwrap();
        assert!(re.is_match(&body[..]), "body: {body}");
    }

    #[tokio::test]
    async fn missing_file() {
        let response = request("path=/x").await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_string(response).await;
        let re = Regex::new(r".*invalid parameter `file`.*").unwrap();
        assert!(re.is_match(&body[..]), "body: {body}");
    }

    #[tokio::test]
    async fn max_size_too_small() {
        let response = request("file=a.h5&path=/x&max_size=0").await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_string(response).await;
        let re = Regex::new(r".*request parameters are not valid.*").unwrap();
        assert!(re.is_match(&body[..]), "body: {body}");
        let re = Regex::new(r".*max_size: Validation error: range.*").unwrap();
        assert!(re.is_match(&body[..]), "body: {body}");
    }
}
