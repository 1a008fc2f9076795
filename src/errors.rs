//! S3-compatible error types.
//!
//! Every variant maps to a well-known S3 error code.  The enum
//! implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(S3Error::InvalidRegion)`.  Backend failures arrive as
//! [`Failure`] and are rendered with the backend's own code, status and
//! correlation ids.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, SecondsFormat, Utc};
use http::HeaderMap;
use thiserror::Error;

use crate::auth::{AuthError, MAX_SKEW_SECS};
use crate::codec::CodecError;
use crate::credentials::CredentialError;
use crate::gateway::{Failure, RegistryError, HOST_ID_HEADER, REQUEST_ID_HEADER};
use crate::xml::{render_error, ErrorDocument};

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Generate a host ID from a random UUID.
pub fn generate_host_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Gateway-side S3 errors.
#[derive(Debug, Error)]
pub enum S3Error {
    #[error("All access to this object has been disabled")]
    AllAccessDisabled,

    #[error("Region does not match.")]
    InvalidRegion,

    #[error("The difference between the request time and the server's time is too large.")]
    RequestTimeTooSkewed {
        request_time: DateTime<Utc>,
        server_time: DateTime<Utc>,
    },

    #[error("Query-string authentication version 4 requires the X-Amz-Algorithm, X-Amz-Credential, X-Amz-Signature, X-Amz-Date, X-Amz-SignedHeaders, and X-Amz-Expires parameters.")]
    InvalidQueryParams,

    #[error("X-Amz-Algorithm only supports \"AWS4-HMAC-SHA256\".")]
    InvalidQuerySignatureAlgo,

    #[error("X-Amz-Date must be in the ISO8601 Long Format \"yyyyMMdd'T'HHmmss'Z'\"")]
    MalformedPresignedDate,

    #[error("X-Amz-Expires should be a number")]
    MalformedExpires,

    #[error("X-Amz-Expires must be non-negative")]
    NegativeExpires,

    #[error("X-Amz-Expires must be less than a week (in seconds) that is 7 days")]
    MaximumExpires,

    #[error("Request is not valid yet")]
    RequestNotReadyYet,

    #[error("Request has expired")]
    ExpiredPresignRequest,

    #[error("Server not initialized, please try again.")]
    ServerNotInitialized,

    #[error("The request parameters are invalid.")]
    InvalidRequestParameter {
        argument_name: Option<String>,
        argument_value: Option<String>,
    },

    #[error("The continuation token provided is incorrect")]
    IncorrectContinuationToken,

    #[error("Argument maxKeys must be an integer between 0 and 2147483647")]
    InvalidMaxKeys { value: String },

    #[error("Invalid Encoding Method specified in Request")]
    InvalidEncodingMethod { value: String },

    #[error("The XML you provided was not well-formed or did not validate against our published schema.")]
    MalformedXML,

    #[error("The Content-MD5 you specified is not valid.")]
    InvalidDigest,

    #[error("The Content-MD5 you specified did not match what we received.")]
    BadDigest,

    #[error("The specified method is not allowed against this resource.")]
    MethodNotAllowed,

    #[error("An application with these backend credentials already exists.")]
    AccessKeyCreated,

    #[error("Your proposed upload exceeds the maximum allowed object size.")]
    EntityTooLarge,

    /// A backend call failed; rendered with the backend's code and ids.
    #[error("{0}")]
    Backend(Failure),

    /// Catch-all for unexpected internal errors.
    #[error("We encountered an internal error, please try again.")]
    InternalError(#[from] anyhow::Error),
}

impl S3Error {
    /// Return the S3 XML error code string.
    pub fn code(&self) -> &str {
        match self {
            S3Error::AllAccessDisabled => "AllAccessDisabled",
            S3Error::InvalidRegion => "InvalidRegion",
            S3Error::RequestTimeTooSkewed { .. } => "RequestTimeTooSkewed",
            S3Error::InvalidQueryParams
            | S3Error::InvalidQuerySignatureAlgo
            | S3Error::MalformedPresignedDate
            | S3Error::MalformedExpires
            | S3Error::NegativeExpires
            | S3Error::MaximumExpires => "AuthorizationQueryParametersError",
            S3Error::RequestNotReadyYet | S3Error::ExpiredPresignRequest => "AccessDenied",
            S3Error::ServerNotInitialized => "XS3AdapterServerNotInitialized",
            S3Error::InvalidRequestParameter { .. }
            | S3Error::IncorrectContinuationToken
            | S3Error::InvalidMaxKeys { .. }
            | S3Error::InvalidEncodingMethod { .. } => "InvalidArgument",
            S3Error::MalformedXML => "MalformedXML",
            S3Error::InvalidDigest => "InvalidDigest",
            S3Error::BadDigest => "BadDigest",
            S3Error::MethodNotAllowed => "MethodNotAllowed",
            S3Error::AccessKeyCreated => "AccessKeyCreated",
            S3Error::EntityTooLarge => "EntityTooLarge",
            S3Error::Backend(failure) => &failure.error.code,
            S3Error::InternalError(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            S3Error::AllAccessDisabled => StatusCode::FORBIDDEN,
            S3Error::InvalidRegion => StatusCode::BAD_REQUEST,
            S3Error::RequestTimeTooSkewed { .. } => StatusCode::FORBIDDEN,
            S3Error::InvalidQueryParams
            | S3Error::InvalidQuerySignatureAlgo
            | S3Error::MalformedPresignedDate
            | S3Error::MalformedExpires
            | S3Error::NegativeExpires
            | S3Error::MaximumExpires => StatusCode::BAD_REQUEST,
            S3Error::RequestNotReadyYet | S3Error::ExpiredPresignRequest => StatusCode::FORBIDDEN,
            S3Error::ServerNotInitialized => StatusCode::SERVICE_UNAVAILABLE,
            S3Error::InvalidRequestParameter { .. }
            | S3Error::IncorrectContinuationToken
            | S3Error::InvalidMaxKeys { .. }
            | S3Error::InvalidEncodingMethod { .. } => StatusCode::BAD_REQUEST,
            S3Error::MalformedXML
            | S3Error::InvalidDigest
            | S3Error::BadDigest
            | S3Error::EntityTooLarge => StatusCode::BAD_REQUEST,
            S3Error::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            S3Error::AccessKeyCreated => StatusCode::CONFLICT,
            S3Error::Backend(failure) => {
                let status = match failure.error.status {
                    0 => standard_status(&failure.error.code).unwrap_or(400),
                    s => s,
                };
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            S3Error::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            S3Error::Backend(failure) => failure.error.message.clone(),
            other => other.to_string(),
        }
    }

    fn argument(&self) -> (Option<&str>, Option<&str>) {
        match self {
            S3Error::InvalidRequestParameter {
                argument_name,
                argument_value,
            } => (argument_name.as_deref(), argument_value.as_deref()),
            S3Error::InvalidMaxKeys { value } => (Some("max-keys"), Some(value)),
            S3Error::InvalidEncodingMethod { value } => (Some("encoding-type"), Some(value)),
            _ => (None, None),
        }
    }

    /// Status and correlation headers only, for HEAD requests.
    pub fn into_head_response(self) -> Response {
        let (status, headers) = self.status_and_headers();
        (status, headers).into_response()
    }

    fn status_and_headers(&self) -> (StatusCode, HeaderMap) {
        let mut headers = match self {
            S3Error::Backend(failure) => failure.headers.clone(),
            _ => HeaderMap::new(),
        };
        if !headers.contains_key(REQUEST_ID_HEADER) {
            if let Ok(v) = HeaderValue::from_str(&generate_request_id()) {
                headers.insert(REQUEST_ID_HEADER, v);
            }
        }
        if !headers.contains_key(HOST_ID_HEADER) {
            if let Ok(v) = HeaderValue::from_str(&generate_host_id()) {
                headers.insert(HOST_ID_HEADER, v);
            }
        }
        if let Ok(v) = HeaderValue::from_str(&httpdate::fmt_http_date(std::time::SystemTime::now())) {
            headers.insert(http::header::DATE, v);
        }
        headers.insert(http::header::SERVER, HeaderValue::from_static("S3Adapter"));
        (self.status_code(), headers)
    }
}

impl From<AuthError> for S3Error {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::RequestTimeTooSkewed {
                request_time,
                server_time,
            } => S3Error::RequestTimeTooSkewed {
                request_time,
                server_time,
            },
            AuthError::InvalidQueryParams => S3Error::InvalidQueryParams,
            AuthError::InvalidQuerySignatureAlgo => S3Error::InvalidQuerySignatureAlgo,
            AuthError::MalformedPresignedDate => S3Error::MalformedPresignedDate,
            AuthError::MalformedExpires => S3Error::MalformedExpires,
            AuthError::NegativeExpires => S3Error::NegativeExpires,
            AuthError::MaximumExpires => S3Error::MaximumExpires,
            AuthError::RequestNotReadyYet => S3Error::RequestNotReadyYet,
            AuthError::ExpiredPresignRequest => S3Error::ExpiredPresignRequest,
            AuthError::MalformedAuthorization(_)
            | AuthError::AccessKeyMismatch
            | AuthError::MissingDate
            | AuthError::MalformedDate
            | AuthError::SignatureMismatch => S3Error::AllAccessDisabled,
        }
    }
}

impl From<Failure> for S3Error {
    fn from(failure: Failure) -> Self {
        S3Error::Backend(failure)
    }
}

impl From<RegistryError> for S3Error {
    fn from(_: RegistryError) -> Self {
        S3Error::ServerNotInitialized
    }
}

impl From<CodecError> for S3Error {
    fn from(err: CodecError) -> Self {
        S3Error::InternalError(err.into())
    }
}

impl From<CredentialError> for S3Error {
    fn from(err: CredentialError) -> Self {
        S3Error::InternalError(err.into())
    }
}

impl IntoResponse for S3Error {
    fn into_response(self) -> Response {
        let (status, mut headers) = self.status_and_headers();
        let request_id = header_or_empty(&headers, REQUEST_ID_HEADER);
        let host_id = header_or_empty(&headers, HOST_ID_HEADER);

        let (request_time, server_time) = match &self {
            S3Error::RequestTimeTooSkewed {
                request_time,
                server_time,
            } => (
                Some(request_time.to_rfc3339_opts(SecondsFormat::Secs, true)),
                Some(server_time.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ),
            _ => (None, None),
        };
        let (argument_name, argument_value) = self.argument();
        let message = self.message();

        let body = render_error(&ErrorDocument {
            code: self.code(),
            message: &message,
            request_time: request_time.as_deref(),
            server_time: server_time.as_deref(),
            max_allowed_skew_ms: request_time.as_ref().map(|_| MAX_SKEW_SECS * 1000),
            argument_name,
            argument_value,
            request_id: &request_id,
            host_id: &host_id,
        });

        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/xml"),
        );
        (status, headers, body).into_response()
    }
}

fn header_or_empty(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

// -- Standard vocabulary --

/// Official S3 error codes and their HTTP statuses.
pub const AWS_STD_ERRORS: &[(&str, u16)] = &[
    ("AccessDenied", 403),
    ("AccountProblem", 403),
    ("AllAccessDisabled", 403),
    ("AmbiguousGrantByEmailAddress", 400),
    ("AuthorizationHeaderMalformed", 400),
    ("AuthorizationQueryParametersError", 400),
    ("BadDigest", 400),
    ("BucketAlreadyExists", 409),
    ("BucketAlreadyOwnedByYou", 409),
    ("BucketNotEmpty", 409),
    ("CredentialsNotSupported", 400),
    ("CrossLocationLoggingProhibited", 403),
    ("EntityTooSmall", 400),
    ("EntityTooLarge", 400),
    ("ExpiredToken", 400),
    ("IllegalLocationConstraintException", 400),
    ("IllegalVersioningConfigurationException", 400),
    ("IncompleteBody", 400),
    ("IncorrectNumberOfFilesInPostRequest", 400),
    ("InlineDataTooLarge", 400),
    ("InternalError", 500),
    ("InvalidAccessKeyId", 403),
    ("InvalidArgument", 400),
    ("InvalidBucketName", 400),
    ("InvalidBucketState", 409),
    ("InvalidDigest", 400),
    ("InvalidEncryptionAlgorithmError", 400),
    ("InvalidLocationConstraint", 400),
    ("InvalidObjectState", 403),
    ("InvalidPart", 400),
    ("InvalidPartOrder", 400),
    ("InvalidPayer", 403),
    ("InvalidPolicyDocument", 400),
    ("InvalidRange", 416),
    ("InvalidRegion", 400),
    ("InvalidRequest", 400),
    ("InvalidSecurity", 403),
    ("InvalidSOAPRequest", 400),
    ("InvalidStorageClass", 400),
    ("InvalidTag", 400),
    ("InvalidTargetBucketForLogging", 400),
    ("InvalidToken", 400),
    ("InvalidURI", 400),
    ("KeyTooLongError", 400),
    ("MalformedACLError", 400),
    ("MalformedPOSTRequest", 400),
    ("MalformedXML", 400),
    ("MaxMessageLengthExceeded", 400),
    ("MaxPostPreDataLengthExceededError", 400),
    ("MetadataTooLarge", 400),
    ("MethodNotAllowed", 405),
    ("MissingContentLength", 411),
    ("MissingRequestBodyError", 400),
    ("MissingSecurityElement", 400),
    ("MissingSecurityHeader", 400),
    ("NoLoggingStatusForKey", 400),
    ("NoSuchBucket", 404),
    ("NoSuchBucketPolicy", 404),
    ("NoSuchCORSConfiguration", 404),
    ("NoSuchKey", 404),
    ("NoSuchLifecycleConfiguration", 404),
    ("NoSuchObjectLockConfiguration", 404),
    ("NoSuchTagSet", 404),
    ("NoSuchUpload", 404),
    ("NoSuchVersion", 404),
    ("NoSuchWebsiteConfiguration", 404),
    ("NotImplemented", 501),
    ("NotModified", 304),
    ("NotSignedUp", 403),
    ("ObjectLockConfigurationNotFoundError", 404),
    ("OperationAborted", 409),
    ("OwnershipControlsNotFoundError", 404),
    ("PermanentRedirect", 301),
    ("PreconditionFailed", 412),
    ("Redirect", 307),
    ("ReplicationConfigurationNotFoundError", 404),
    ("RequestIsNotMultiPartContent", 400),
    ("RequestTimeout", 400),
    ("RequestTimeTooSkewed", 403),
    ("RequestTorrentOfBucketError", 400),
    ("RestoreAlreadyInProgress", 409),
    ("ServerSideEncryptionConfigurationNotFoundError", 404),
    ("ServiceUnavailable", 503),
    ("SignatureDoesNotMatch", 403),
    ("SlowDown", 503),
    ("TemporaryRedirect", 307),
    ("TokenRefreshRequired", 400),
    ("TooManyBuckets", 400),
    ("UnexpectedContent", 400),
    ("UnresolvableGrantByEmailAddress", 400),
    ("UserKeyMustBeSpecified", 400),
];

/// HTTP status of a standard S3 error code.
pub fn standard_status(code: &str) -> Option<u16> {
    AWS_STD_ERRORS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, status)| *status)
}

/// Whether `code` belongs to the standard S3 vocabulary.
pub fn is_standard_code(code: &str) -> bool {
    standard_status(code).is_some()
}
