//! Object-level S3 API handlers.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use md5::{Digest, Md5};

use super::{connect, encoded_response, reject_field_errors, run, S3Request};
use crate::codec::FieldError;
use crate::errors::S3Error;
use crate::gateway::model::*;
use crate::metrics::{record_bytes_received, record_bytes_sent};
use crate::AppState;

// -- Request classification ---------------------------------------------------

/// A PUT is a copy when `x-amz-copy-source` names a `bucket/key` pair,
/// either literally or URL-encoded.
pub fn is_copy_request(headers: &HeaderMap) -> bool {
    headers
        .get("x-amz-copy-source")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|src| src.contains('/') || src.contains("%2F") || src.contains("%2f"))
}

// -- Content-MD5 --------------------------------------------------------------

/// Check `Content-MD5` against the body.
///
/// A header that failed to decode as base64, or decodes to anything but
/// 16 bytes, is `InvalidDigest`; a well-formed digest of other content is
/// `BadDigest`.
fn check_content_md5(
    digest: Option<&[u8]>,
    errors: &[FieldError],
    body: &[u8],
) -> Result<(), S3Error> {
    if errors.iter().any(|e| e.location_name == "Content-MD5") {
        return Err(S3Error::InvalidDigest);
    }
    let Some(digest) = digest else {
        return Ok(());
    };
    if digest.len() != 16 {
        return Err(S3Error::InvalidDigest);
    }
    if Md5::digest(body).as_slice() != digest {
        return Err(S3Error::BadDigest);
    }
    Ok(())
}

// -- Handlers -----------------------------------------------------------------

/// `PUT /{bucket}/{key}` -- PutObject.
#[utoipa::path(
    put,
    path = "/{bucket}/{key}",
    tag = "Object",
    operation_id = "PutObject",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object key"),
    ),
    responses(
        (status = 200, description = "Object stored"),
        (status = 400, description = "Invalid or mismatched Content-MD5"),
        (status = 404, description = "Bucket not found")
    )
)]
pub async fn put_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    req: S3Request<'_>,
) -> Result<Response, S3Error> {
    let (mut input, errors) = req.decode::<PutObjectInput>();
    check_content_md5(input.content_md5.as_deref(), &errors, req.body)?;
    reject_field_errors(errors)?;
    input.bucket = bucket.to_string();
    input.key = key.to_string();

    record_bytes_received(req.body.len());
    let backend = connect(&state, req.identity).await?;
    let reply = run(req.identity, "put_object", backend.put_object(input)).await?;
    encoded_response(reply)
}

/// `PUT /{bucket}/{key}` with `x-amz-copy-source` -- CopyObject.
///
/// Shares its route with PutObject, so it has no OpenAPI entry of its own.
pub async fn copy_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    req: S3Request<'_>,
) -> Result<Response, S3Error> {
    let (mut input, errors) = req.decode::<CopyObjectInput>();
    reject_field_errors(errors)?;
    input.bucket = bucket.to_string();
    input.key = key.to_string();

    let backend = connect(&state, req.identity).await?;
    let reply = run(req.identity, "copy_object", backend.copy_object(input)).await?;
    let mut resp = encoded_response(reply)?;
    resp.headers_mut()
        .insert("content-type", HeaderValue::from_static("application/xml"));
    Ok(resp)
}

/// `GET /{bucket}/{key}` -- GetObject.
#[utoipa::path(
    get,
    path = "/{bucket}/{key}",
    tag = "Object",
    operation_id = "GetObject",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object key"),
    ),
    responses(
        (status = 200, description = "Object data"),
        (status = 206, description = "Partial content (range request)"),
        (status = 304, description = "Not modified"),
        (status = 404, description = "Object not found")
    )
)]
pub async fn get_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    req: S3Request<'_>,
) -> Result<Response, S3Error> {
    let (mut input, _) = req.decode::<GetObjectInput>();
    input.bucket = bucket.to_string();
    input.key = key.to_string();

    let backend = connect(&state, req.identity).await?;
    let reply = run(req.identity, "get_object", backend.get_object(input)).await?;
    if let Some(body) = &reply.output.body {
        record_bytes_sent(body.len());
    }
    let partial = reply.output.content_range.is_some();
    let mut resp = encoded_response(reply)?;
    if partial {
        *resp.status_mut() = StatusCode::PARTIAL_CONTENT;
    }
    Ok(resp)
}

/// `HEAD /{bucket}/{key}` -- HeadObject.  Failures carry no body.
#[utoipa::path(
    head,
    path = "/{bucket}/{key}",
    tag = "Object",
    operation_id = "HeadObject",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object key"),
    ),
    responses(
        (status = 200, description = "Object metadata"),
        (status = 404, description = "Object not found")
    )
)]
pub async fn head_object(state: Arc<AppState>, bucket: &str, key: &str, req: S3Request<'_>) -> Response {
    let result = async {
        let (mut input, _) = req.decode::<HeadObjectInput>();
        input.bucket = bucket.to_string();
        input.key = key.to_string();
        let backend = connect(&state, req.identity).await?;
        let reply = run(req.identity, "head_object", backend.head_object(input)).await?;
        encoded_response(reply)
    }
    .await;

    result.unwrap_or_else(S3Error::into_head_response)
}

/// `DELETE /{bucket}/{key}` -- DeleteObject.
#[utoipa::path(
    delete,
    path = "/{bucket}/{key}",
    tag = "Object",
    operation_id = "DeleteObject",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object key"),
    ),
    responses(
        (status = 204, description = "Object deleted")
    )
)]
pub async fn delete_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    req: S3Request<'_>,
) -> Result<Response, S3Error> {
    let (mut input, _) = req.decode::<DeleteObjectInput>();
    input.bucket = bucket.to_string();
    input.key = key.to_string();

    let backend = connect(&state, req.identity).await?;
    let reply = run(req.identity, "delete_object", backend.delete_object(input)).await?;
    let mut resp = encoded_response(reply)?;
    *resp.status_mut() = StatusCode::NO_CONTENT;
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    fn copy_headers(source: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-amz-copy-source", source.parse().unwrap());
        headers
    }

    #[test]
    fn test_is_copy_request() {
        assert!(is_copy_request(&copy_headers("src-bucket/key.txt")));
        assert!(is_copy_request(&copy_headers("/src-bucket/key.txt")));
        assert!(is_copy_request(&copy_headers("src-bucket%2Fkey.txt")));
        assert!(!is_copy_request(&copy_headers("just-a-name")));
        assert!(!is_copy_request(&HeaderMap::new()));
    }

    #[test]
    fn test_content_md5_absent() {
        assert!(check_content_md5(None, &[], b"hello").is_ok());
    }

    #[test]
    fn test_content_md5_match() {
        let digest = Md5::digest(b"hello");
        assert!(check_content_md5(Some(digest.as_slice()), &[], b"hello").is_ok());
    }

    #[test]
    fn test_content_md5_mismatch() {
        let digest = Md5::digest(b"hello");
        let err = check_content_md5(Some(digest.as_slice()), &[], b"world").unwrap_err();
        assert_eq!(err.code(), "BadDigest");
    }

    #[test]
    fn test_content_md5_wrong_length() {
        let short = BASE64.decode("aGVsbG8=").unwrap();
        let err = check_content_md5(Some(&short), &[], b"hello").unwrap_err();
        assert_eq!(err.code(), "InvalidDigest");
    }

    #[test]
    fn test_content_md5_undecodable() {
        let errors = vec![FieldError {
            field: "ContentMD5",
            location_name: "Content-MD5",
            value: "!!".into(),
            reason: "invalid base64".into(),
        }];
        let err = check_content_md5(None, &errors, b"hello").unwrap_err();
        assert_eq!(err.code(), "InvalidDigest");
    }
}
