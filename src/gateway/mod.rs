//! Backend registry and the uniform backend protocol.
//!
//! A [`BackendRegistry`] maps an engine name (`"s3"`, `"cos"`, ...) to a
//! [`BackendFactory`].  It is filled once in `main` and then shared
//! read-only through the application state.  Resolving an engine with a
//! set of credentials yields a boxed [`BackendProtocol`] that speaks the
//! backend's native API and translates everything back into the uniform
//! shapes of [`model`].

pub mod cos;
pub mod model;
pub mod s3;

use http::{HeaderMap, HeaderValue};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{canonical_header_key, Metadata};
use crate::config::GatewayConfig;
use crate::errors::{generate_host_id, generate_request_id};
use model::*;

/// Normalized request-id response header.
pub const REQUEST_ID_HEADER: &str = "x-amz-request-id";

/// Normalized trace/host-id response header.
pub const HOST_ID_HEADER: &str = "x-amz-id-2";

// -- Credentials --------------------------------------------------------------

/// Backend credentials for a single request.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// -- Normalized errors --------------------------------------------------------

/// The only error shape that leaves a backend adapter.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct NormalizedError {
    pub code: String,
    pub message: String,
    pub status: u16,
    pub request_id: String,
    pub host_id: String,
    /// The native error this was translated from, if any.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl NormalizedError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, status: u16) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status,
            request_id: String::new(),
            host_id: String::new(),
            source: None,
        }
    }

    /// Capability the backend does not implement.
    pub fn unsupported() -> Self {
        Self::new("ErrUnsupported", "The Function Not Implemented", 501)
    }

    /// Uniform input without a bucket or key.
    pub fn miss_params() -> Self {
        Self::new("ErrMissParams", "Miss Params", 400)
    }

    /// Backend call exceeded the gateway deadline.
    pub fn request_timeout() -> Self {
        Self::new(
            "RequestTimeout",
            "Your socket connection to the server was not read from or written to within the timeout period.",
            400,
        )
    }

    /// Native error without a structured code.  The original is kept as
    /// the source.
    pub fn untranslated(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        let mut e = Self::new("ErrNotFoundError", "Not Found S3 Error,please see OrgErr", 400);
        e.source = Some(err.into());
        e
    }

    pub fn with_ids(mut self, request_id: Option<&str>, host_id: Option<&str>) -> Self {
        if let Some(id) = request_id {
            self.request_id = id.to_string();
        }
        if let Some(id) = host_id {
            self.host_id = id.to_string();
        }
        self
    }
}

impl From<MetadataError> for NormalizedError {
    fn from(err: MetadataError) -> Self {
        let message = err.to_string();
        let mut e = Self::new("InvalidArgument", message, 400);
        e.source = Some(Box::new(err));
        e
    }
}

// -- Call outcomes ------------------------------------------------------------

/// Successful backend call: uniform output plus correlation headers.
#[derive(Debug)]
pub struct Reply<T> {
    pub output: T,
    pub headers: HeaderMap,
}

impl<T> Reply<T> {
    pub fn new(output: T, request_id: Option<&str>, host_id: Option<&str>) -> Self {
        Self {
            output,
            headers: correlation_headers(request_id, host_id),
        }
    }
}

/// Failed backend call: normalized error plus correlation headers.
#[derive(Debug)]
pub struct Failure {
    pub error: NormalizedError,
    pub headers: HeaderMap,
}

impl From<NormalizedError> for Failure {
    fn from(mut error: NormalizedError) -> Self {
        if error.request_id.is_empty() {
            error.request_id = generate_request_id();
        }
        if error.host_id.is_empty() {
            error.host_id = generate_host_id();
        }
        let headers = correlation_headers(Some(&error.request_id), Some(&error.host_id));
        Self { error, headers }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

pub type BackendResult<T> = Result<Reply<T>, Failure>;

pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = BackendResult<T>> + Send + 'a>>;

/// Build the two normalized correlation headers, generating ids the
/// backend did not supply.
pub fn correlation_headers(request_id: Option<&str>, host_id: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let request_id = request_id
        .filter(|id| !id.is_empty())
        .and_then(|id| HeaderValue::from_str(id).ok())
        .unwrap_or_else(|| HeaderValue::from_str(&generate_request_id()).unwrap_or(HeaderValue::from_static("0")));
    let host_id = host_id
        .filter(|id| !id.is_empty())
        .and_then(|id| HeaderValue::from_str(id).ok())
        .unwrap_or_else(|| HeaderValue::from_str(&generate_host_id()).unwrap_or(HeaderValue::from_static("0")));
    headers.insert(REQUEST_ID_HEADER, request_id);
    headers.insert(HOST_ID_HEADER, host_id);
    headers
}

/// Request deadline: `gateway.request_timeout` from the moment the
/// request is first looked at.
pub fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout
}

/// Run one gateway step (credential lookup, backend construction) so that
/// it fails with `RequestTimeout` once `deadline` passes.
pub async fn within_deadline<F: Future>(deadline: Instant, step: F) -> Result<F::Output, Failure> {
    match tokio::time::timeout_at(deadline, step).await {
        Ok(output) => Ok(output),
        Err(_) => {
            warn!("request deadline passed");
            Err(NormalizedError::request_timeout().into())
        }
    }
}

/// Run a backend call under the request deadline.
pub async fn with_deadline<T>(deadline: Instant, call: BackendFuture<'_, T>) -> BackendResult<T> {
    within_deadline(deadline, call).await?
}

/// Reject uniform inputs that lack a required bucket or key.
pub fn require(value: &str) -> Result<(), Failure> {
    if value.is_empty() {
        return Err(NormalizedError::miss_params().into());
    }
    Ok(())
}

// -- Protocol -----------------------------------------------------------------

/// Uniform capability set every backend implements.
///
/// There are no default methods: a backend that lacks a capability says
/// so explicitly by returning [`NormalizedError::unsupported`].
pub trait BackendProtocol: Send + Sync {
    /// Whether this backend may serve traffic.
    fn production(&self) -> bool;

    fn create_bucket(&self, input: CreateBucketInput) -> BackendFuture<'_, CreateBucketOutput>;

    fn head_bucket(&self, input: HeadBucketInput) -> BackendFuture<'_, HeadBucketOutput>;

    fn delete_bucket(&self, input: DeleteBucketInput) -> BackendFuture<'_, DeleteBucketOutput>;

    fn list_objects(&self, input: ListObjectsInput) -> BackendFuture<'_, ListObjectsOutput>;

    fn list_objects_v2(&self, input: ListObjectsV2Input) -> BackendFuture<'_, ListObjectsV2Output>;

    fn list_buckets(&self, input: ListBucketsInput) -> BackendFuture<'_, ListBucketsOutput>;

    fn put_object(&self, input: PutObjectInput) -> BackendFuture<'_, PutObjectOutput>;

    fn head_object(&self, input: HeadObjectInput) -> BackendFuture<'_, HeadObjectOutput>;

    fn get_object(&self, input: GetObjectInput) -> BackendFuture<'_, GetObjectOutput>;

    fn delete_object(&self, input: DeleteObjectInput) -> BackendFuture<'_, DeleteObjectOutput>;

    fn copy_object(&self, input: CopyObjectInput) -> BackendFuture<'_, CopyObjectOutput>;
}

pub type ConnectFuture<'a> =
    Pin<Box<dyn Future<Output = anyhow::Result<Box<dyn BackendProtocol>>> + Send + 'a>>;

/// Builds a [`BackendProtocol`] bound to one set of credentials.
pub trait BackendFactory: Send + Sync + 'static {
    fn connect(&self, credentials: Credentials, region: String) -> ConnectFuture<'_>;
}

// -- Registry -----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Unknown engine, or an engine that is not production-ready.
    #[error("no gateway registered for engine {0:?}")]
    GatewayNotFound(String),

    #[error("failed to construct backend {engine:?}: {source}")]
    Connect {
        engine: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Engine name -> factory.  Populated at startup, read-only afterwards.
#[derive(Default)]
pub struct BackendRegistry {
    factories: HashMap<String, Arc<dyn BackendFactory>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `s3` and `cos` engines.
    pub fn with_defaults(config: &GatewayConfig) -> Self {
        let mut registry = Self::new();
        registry.register(s3::ENGINE, s3::S3Factory::new(config.s3_endpoint.clone()));
        registry.register(
            cos::ENGINE,
            cos::CosFactory::new(config.cos_service_url.clone(), config.debug),
        );
        registry
    }

    /// Register `factory` under `engine`.  Registering the same name
    /// again replaces the earlier factory.
    pub fn register(&mut self, engine: impl Into<String>, factory: impl BackendFactory) {
        let engine = engine.into();
        debug!("registering backend engine {}", engine);
        self.factories.insert(engine, Arc::new(factory));
    }

    pub fn contains(&self, engine: &str) -> bool {
        self.factories.contains_key(engine)
    }

    /// Registered engine names, sorted.
    pub fn engines(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Construct a backend for `engine` bound to `credentials` and `region`.
    pub async fn resolve(
        &self,
        engine: &str,
        credentials: Credentials,
        region: &str,
    ) -> Result<Box<dyn BackendProtocol>, RegistryError> {
        let factory = self
            .factories
            .get(engine)
            .ok_or_else(|| RegistryError::GatewayNotFound(engine.to_string()))?;

        let backend = factory
            .connect(credentials, region.to_string())
            .await
            .map_err(|source| RegistryError::Connect {
                engine: engine.to_string(),
                source,
            })?;

        if !backend.production() {
            warn!("backend engine {} is not production-ready", engine);
            return Err(RegistryError::GatewayNotFound(engine.to_string()));
        }
        Ok(backend)
    }
}

// -- Metadata translation -----------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
#[error("metadata key {key:?} cannot be translated to the {prefix} prefix")]
pub struct MetadataError {
    pub key: String,
    pub prefix: &'static str,
}

/// Turn uniform metadata into native `(header, value)` pairs under
/// `native_prefix`.  Keys containing `_` are rejected.
pub fn to_native_metadata(
    metadata: &Metadata,
    native_prefix: &'static str,
) -> Result<Vec<(String, String)>, MetadataError> {
    metadata
        .iter()
        .map(|(key, value)| {
            if key.contains('_') {
                return Err(MetadataError {
                    key: key.clone(),
                    prefix: native_prefix,
                });
            }
            Ok((format!("{native_prefix}{key}"), value.clone()))
        })
        .collect()
}

/// Collect native metadata headers under `native_prefix` into uniform
/// metadata.
pub fn from_native_metadata(headers: &HeaderMap, native_prefix: &str) -> Option<Metadata> {
    let prefix = native_prefix.to_ascii_lowercase();
    let mut out = Metadata::new();
    for (name, value) in headers {
        let name = name.as_str();
        if name.len() > prefix.len() && name.starts_with(&prefix) {
            out.entry(canonical_header_key(&name[prefix.len()..]))
                .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
    }
    (!out.is_empty()).then_some(out)
}
