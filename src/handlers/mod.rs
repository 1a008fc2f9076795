//! S3 API handlers.
//!
//! Every handler follows the same pipeline: resolve the caller's backend
//! from the registry, decode the uniform input with [`crate::codec`],
//! run the backend call under the gateway deadline and encode the
//! uniform output back onto the response.

pub mod application;
pub mod bucket;
pub mod object;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec::{decode, encode, FieldError, RequestParts, Shape};
use crate::credentials::ResolvedCredential;
use crate::errors::S3Error;
use crate::gateway::{with_deadline, within_deadline, BackendFuture, BackendProtocol, Reply};
use crate::metrics::record_backend_call;
use crate::AppState;

/// Authenticated caller, attached to the request by the auth middleware.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Platform access key the request was signed with.
    pub access_key: String,
    pub credential: ResolvedCredential,
    /// Shared by credential lookup, backend construction and the backend call.
    pub deadline: Instant,
}

/// Request pieces every handler needs.
pub struct S3Request<'a> {
    pub identity: &'a Identity,
    pub headers: &'a HeaderMap,
    pub query: &'a [(String, String)],
    pub body: &'a Bytes,
}

impl S3Request<'_> {
    fn parts(&self) -> RequestParts<'_> {
        RequestParts {
            headers: self.headers,
            query: self.query,
            body: self.body,
        }
    }

    /// Decode a uniform input, returning the per-field failures.
    pub(crate) fn decode<T: Shape + Default>(&self) -> (T, Vec<FieldError>) {
        let mut input = T::default();
        let errors = decode(&mut input, &self.parts());
        for e in &errors {
            debug!("decode: {}", e);
        }
        (input, errors)
    }

    pub(crate) fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Construct the caller's backend.
pub(crate) async fn connect(
    state: &AppState,
    identity: &Identity,
) -> Result<Box<dyn BackendProtocol>, S3Error> {
    let cred = &identity.credential;
    let resolving = state
        .registry
        .resolve(&cred.engine, cred.backend.clone(), &cred.region);
    let backend = within_deadline(identity.deadline, resolving)
        .await?
        .map_err(|e| {
            warn!("backend unavailable for {}: {}", identity.access_key, e);
            e
        })?;
    Ok(backend)
}

/// Run one backend call under the deadline and count its outcome.
pub(crate) async fn run<T>(
    identity: &Identity,
    operation: &'static str,
    call: BackendFuture<'_, T>,
) -> Result<Reply<T>, S3Error> {
    let engine = identity.credential.engine.as_str();
    match with_deadline(identity.deadline, call).await {
        Ok(reply) => {
            record_backend_call(engine, operation, "ok");
            Ok(reply)
        }
        Err(failure) => {
            record_backend_call(engine, operation, &failure.error.code);
            debug!("{} {} failed: {}", engine, operation, failure);
            Err(failure.into())
        }
    }
}

/// Reject the first per-field decode failure.
pub(crate) fn reject_field_errors(errors: Vec<FieldError>) -> Result<(), S3Error> {
    match errors.into_iter().next() {
        None => Ok(()),
        Some(e) => Err(S3Error::InvalidRequestParameter {
            argument_name: Some(e.location_name.to_string()),
            argument_value: Some(e.value),
        }),
    }
}

// -- Response helpers --------------------------------------------------------

/// Encode a uniform output onto a 200 response carrying the correlation
/// headers of the backend call.
pub(crate) fn encoded_response<T: Shape>(reply: Reply<T>) -> Result<Response, S3Error> {
    let encoded = encode(reply.output)?;
    let mut headers = reply.headers;
    headers.extend(encoded.headers);
    let body = match encoded.body {
        Some(bytes) => Body::from(bytes),
        None => Body::empty(),
    };
    Ok((StatusCode::OK, headers, body).into_response())
}

/// A 200 XML document response.
pub(crate) fn xml_response(mut headers: HeaderMap, xml: String) -> Response {
    headers.insert("content-type", HeaderValue::from_static("application/xml"));
    (StatusCode::OK, headers, xml).into_response()
}

/// An empty response with the given status.
pub(crate) fn empty_response(status: StatusCode, headers: HeaderMap) -> Response {
    (status, headers).into_response()
}
