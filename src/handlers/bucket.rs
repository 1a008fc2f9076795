//! Bucket-level S3 API handlers.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::Response;

use super::{connect, encoded_response, empty_response, reject_field_errors, run, xml_response, S3Request};
use crate::errors::S3Error;
use crate::gateway::model::*;
use crate::xml::{format_result_xml, parse_location_constraint};
use crate::AppState;

/// `max-keys` when the request does not name one.
pub const DEFAULT_MAX_KEYS: i64 = 1000;

// -- List parameter validation ------------------------------------------------

/// Parse `max-keys`: absent or empty means [`DEFAULT_MAX_KEYS`], anything
/// that is not an integer in `0..=i32::MAX` is rejected.
pub fn validate_max_keys(raw: Option<&str>) -> Result<i64, S3Error> {
    let Some(raw) = raw.filter(|r| !r.is_empty()) else {
        return Ok(DEFAULT_MAX_KEYS);
    };
    match raw.parse::<i64>() {
        Ok(n) if (0..=i64::from(i32::MAX)).contains(&n) => Ok(n),
        _ => Err(S3Error::InvalidMaxKeys {
            value: raw.to_string(),
        }),
    }
}

/// `encoding-type` must be absent, empty or `url`.
pub fn validate_encoding_type(raw: Option<&str>) -> Result<(), S3Error> {
    match raw {
        None | Some("") | Some("url") => Ok(()),
        Some(other) => Err(S3Error::InvalidEncodingMethod {
            value: other.to_string(),
        }),
    }
}

// -- Handlers -----------------------------------------------------------------

/// `GET /` -- ListBuckets.
#[utoipa::path(
    get,
    path = "/",
    tag = "Bucket",
    operation_id = "ListBuckets",
    responses(
        (status = 200, description = "List of buckets", content_type = "application/xml"),
        (status = 403, description = "Access denied")
    )
)]
pub async fn list_buckets(state: Arc<AppState>, req: S3Request<'_>) -> Result<Response, S3Error> {
    let backend = connect(&state, req.identity).await?;
    let reply = run(req.identity, "list_buckets", backend.list_buckets(ListBucketsInput {})).await?;
    let xml = format_result_xml(&reply.output, "ListAllMyBucketsResult", true)?;
    Ok(xml_response(reply.headers, xml))
}

/// `PUT /{bucket}` -- CreateBucket.
#[utoipa::path(
    put,
    path = "/{bucket}",
    tag = "Bucket",
    operation_id = "CreateBucket",
    params(("bucket" = String, Path, description = "Bucket name")),
    responses(
        (status = 200, description = "Bucket created"),
        (status = 400, description = "Malformed CreateBucketConfiguration"),
        (status = 409, description = "Bucket already exists")
    )
)]
pub async fn create_bucket(
    state: Arc<AppState>,
    bucket: &str,
    req: S3Request<'_>,
) -> Result<Response, S3Error> {
    let location_constraint = parse_location_constraint(req.body).map_err(|_| S3Error::MalformedXML)?;
    let (mut input, errors) = req.decode::<CreateBucketInput>();
    reject_field_errors(errors)?;
    input.bucket = bucket.to_string();
    input.location_constraint = location_constraint;

    let backend = connect(&state, req.identity).await?;
    let reply = run(req.identity, "create_bucket", backend.create_bucket(input)).await?;
    encoded_response(reply)
}

/// `HEAD /{bucket}` -- HeadBucket.  Failures carry no body.
#[utoipa::path(
    head,
    path = "/{bucket}",
    tag = "Bucket",
    operation_id = "HeadBucket",
    params(("bucket" = String, Path, description = "Bucket name")),
    responses(
        (status = 200, description = "Bucket exists"),
        (status = 404, description = "Bucket not found")
    )
)]
pub async fn head_bucket(state: Arc<AppState>, bucket: &str, req: S3Request<'_>) -> Response {
    let result = async {
        let backend = connect(&state, req.identity).await?;
        let input = HeadBucketInput {
            bucket: bucket.to_string(),
        };
        run(req.identity, "head_bucket", backend.head_bucket(input)).await
    }
    .await;

    match result {
        Ok(reply) => empty_response(StatusCode::OK, reply.headers),
        Err(e) => e.into_head_response(),
    }
}

/// `DELETE /{bucket}` -- DeleteBucket.
#[utoipa::path(
    delete,
    path = "/{bucket}",
    tag = "Bucket",
    operation_id = "DeleteBucket",
    params(("bucket" = String, Path, description = "Bucket name")),
    responses(
        (status = 204, description = "Bucket deleted"),
        (status = 404, description = "Bucket not found"),
        (status = 409, description = "Bucket not empty")
    )
)]
pub async fn delete_bucket(
    state: Arc<AppState>,
    bucket: &str,
    req: S3Request<'_>,
) -> Result<Response, S3Error> {
    let backend = connect(&state, req.identity).await?;
    let input = DeleteBucketInput {
        bucket: bucket.to_string(),
    };
    let reply = run(req.identity, "delete_bucket", backend.delete_bucket(input)).await?;
    Ok(empty_response(StatusCode::NO_CONTENT, reply.headers))
}

/// `GET /{bucket}` -- ListObjects (marker pagination).
#[utoipa::path(
    get,
    path = "/{bucket}",
    tag = "Bucket",
    operation_id = "ListObjects",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("prefix" = Option<String>, Query, description = "Key prefix filter"),
        ("delimiter" = Option<String>, Query, description = "Grouping delimiter"),
        ("marker" = Option<String>, Query, description = "Start listing after this key"),
        ("max-keys" = Option<i64>, Query, description = "Maximum keys to return"),
        ("encoding-type" = Option<String>, Query, description = "Only `url` is accepted"),
    ),
    responses(
        (status = 200, description = "Object listing", content_type = "application/xml"),
        (status = 400, description = "Invalid list parameters"),
        (status = 404, description = "Bucket not found")
    )
)]
pub async fn list_objects(
    state: Arc<AppState>,
    bucket: &str,
    req: S3Request<'_>,
) -> Result<Response, S3Error> {
    let max_keys = validate_max_keys(req.query_value("max-keys"))?;
    validate_encoding_type(req.query_value("encoding-type"))?;

    let (mut input, _) = req.decode::<ListObjectsInput>();
    input.bucket = bucket.to_string();
    input.max_keys = Some(max_keys);

    let backend = connect(&state, req.identity).await?;
    let reply = run(req.identity, "list_objects", backend.list_objects(input)).await?;
    let xml = format_result_xml(&reply.output, "ListBucketResult", true)?;
    Ok(xml_response(reply.headers, xml))
}

/// `GET /{bucket}?list-type=2` -- ListObjectsV2 (continuation tokens).
pub async fn list_objects_v2(
    state: Arc<AppState>,
    bucket: &str,
    req: S3Request<'_>,
) -> Result<Response, S3Error> {
    let max_keys = validate_max_keys(req.query_value("max-keys"))?;
    validate_encoding_type(req.query_value("encoding-type"))?;
    if req.query_value("continuation-token") == Some("") {
        return Err(S3Error::IncorrectContinuationToken);
    }

    let (mut input, _) = req.decode::<ListObjectsV2Input>();
    input.bucket = bucket.to_string();
    input.max_keys = Some(max_keys);

    let backend = connect(&state, req.identity).await?;
    let reply = run(req.identity, "list_objects_v2", backend.list_objects_v2(input)).await?;
    let xml = format_result_xml(&reply.output, "ListBucketResult", true)?;
    Ok(xml_response(reply.headers, xml))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_keys_default() {
        assert_eq!(validate_max_keys(None).unwrap(), 1000);
        assert_eq!(validate_max_keys(Some("")).unwrap(), 1000);
    }

    #[test]
    fn test_max_keys_valid() {
        assert_eq!(validate_max_keys(Some("0")).unwrap(), 0);
        assert_eq!(validate_max_keys(Some("25")).unwrap(), 25);
        assert_eq!(validate_max_keys(Some("2147483647")).unwrap(), 2_147_483_647);
    }

    #[test]
    fn test_max_keys_invalid() {
        for raw in ["abc", "-1", "2147483648", "1.5"] {
            let err = validate_max_keys(Some(raw)).unwrap_err();
            assert!(matches!(err, S3Error::InvalidMaxKeys { ref value } if value == raw), "{raw}");
        }
    }

    #[test]
    fn test_encoding_type() {
        assert!(validate_encoding_type(None).is_ok());
        assert!(validate_encoding_type(Some("")).is_ok());
        assert!(validate_encoding_type(Some("url")).is_ok());
        let err = validate_encoding_type(Some("base64")).unwrap_err();
        assert_eq!(err.code(), "InvalidArgument");
    }
}
