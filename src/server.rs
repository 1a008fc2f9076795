//! Axum router construction and S3 route mapping.
//!
//! The [`app`] function wires every S3-compatible endpoint to its handler
//! and returns a ready-to-serve [`axum::Router`].
//!
//! S3 distinguishes operations by method, path depth and query
//! parameters.  Each path shape gets one handler that resolves the
//! addressed bucket and key (path-style or virtual-host style) and then
//! dispatches on the method.

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, RawQuery, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, Method, Request},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Extension, Json, Router,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use utoipa::OpenApi;

use crate::auth::{
    classify, parse_raw_query, AuthType, AuthorizationHeaderFields, SignatureEngine, SigningContext,
};
use crate::config::Config;
use crate::errors::{generate_host_id, generate_request_id, S3Error};
use crate::gateway::{deadline_after, within_deadline, HOST_ID_HEADER, REQUEST_ID_HEADER};
use crate::handlers::{application, bucket, object, Identity, S3Request};
use crate::metrics::{metrics_handler, metrics_middleware, record_auth_failure};
use crate::AppState;

/// Reported by `GET /version`.
pub const BUILD_NAME: &str = env!("CARGO_PKG_NAME");
pub const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const BUILD_TIME: &str = match option_env!("S3ADAPTER_BUILD_TIME") {
    Some(t) => t,
    None => "",
};

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the gateway's S3-compatible API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "S3Adapter S3-Compatible API",
        version = "0.1.0",
        description = "S3-compatible gateway in front of pluggable object-storage backends"
    ),
    paths(
        version,
        // Applications
        crate::handlers::application::put_application,
        crate::handlers::application::delete_application,
        // Bucket operations
        crate::handlers::bucket::list_buckets,
        crate::handlers::bucket::create_bucket,
        crate::handlers::bucket::head_bucket,
        crate::handlers::bucket::delete_bucket,
        crate::handlers::bucket::list_objects,
        // Object operations
        crate::handlers::object::put_object,
        crate::handlers::object::get_object,
        crate::handlers::object::head_object,
        crate::handlers::object::delete_object,
    ),
    tags(
        (name = "Service", description = "Gateway endpoints"),
        (name = "Application", description = "Platform key management"),
        (name = "Bucket", description = "S3 bucket operations"),
        (name = "Object", description = "S3 object operations"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with all S3-compatible routes.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    let limit = body_limit(&state.config);

    let mut router = Router::new()
        .route("/version", get(version))
        .route("/openapi.json", get(openapi_json));
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .route("/", any(handle_service))
        .route("/:bucket", any(handle_bucket))
        // Wildcard key captures slashes.
        .route("/:bucket/*key", any(handle_object))
        .with_state(state.clone())
        // Layer ordering: inner layers run first, outer layers wrap them.
        // auth_middleware is innermost (closest to handlers, after routing).
        .layer(middleware::from_fn_with_state(state, auth_middleware))
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(middleware::from_fn(access_log_middleware))
        // metrics_middleware is outer (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(limit))
}

fn body_limit(config: &Config) -> usize {
    usize::try_from(config.server.max_object_size).unwrap_or(usize::MAX)
}

// -- Common headers middleware -----------------------------------------------

/// Adds the S3 response headers every response carries:
/// - `x-amz-request-id` / `x-amz-id-2`, unless a backend already set them
/// - `Date` and `Server`
async fn common_headers_middleware(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

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

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(v) = HeaderValue::from_str(&date) {
        headers.insert(header::DATE, v);
    }
    headers.insert(header::SERVER, HeaderValue::from_static("S3Adapter"));

    response
}

// -- Access log middleware ----------------------------------------------------

/// One `info` event per request.
async fn access_log_middleware(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().to_string();
    let host = header_or_default(req.headers(), header::HOST.as_str());
    let user_agent = header_or_default(req.headers(), header::USER_AGENT.as_str());
    let (bucket, object) = split_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;

    info!(
        method = %method,
        host = %host,
        uri = %uri,
        ua = %user_agent,
        bucket = %bucket,
        object = %object,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "http"
    );
    response
}

fn header_or_default(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Path-style bucket and object of a request path.
fn split_path(path: &str) -> (String, String) {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((bucket, object)) => (bucket.to_string(), object.to_string()),
        None => (trimmed.to_string(), String::new()),
    }
}

// -- Auth middleware ---------------------------------------------------------

/// Paths that bypass authentication.
const AUTH_SKIP_PATHS: &[&str] = &["/version", "/metrics", "/openapi.json"];

/// SigV4 authentication middleware.
///
/// Runs before handlers.  Classifies the request, looks up the platform
/// key, enforces the configured region and verifies the header or
/// presigned signature.  On success the caller's [`Identity`] is attached
/// as a request extension.
///
/// Skips auth for the gateway endpoints and for application
/// registration (`PUT /`).
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, S3Error> {
    let path = req.uri().path();
    if AUTH_SKIP_PATHS.contains(&path) || is_registration(&req, &state.config.server.endpoint) {
        return Ok(next.run(req).await);
    }

    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, body_limit(&state.config))
        .await
        .map_err(|_| S3Error::EntityTooLarge)?;

    let identity = authenticate(&state, &parts, &body).await.map_err(|e| {
        debug!("auth rejected {} {}: {}", parts.method, parts.uri, e.code());
        record_auth_failure(e.code());
        e
    })?;

    let mut req = Request::from_parts(parts, Body::from(body));
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

fn is_registration(req: &Request<Body>, endpoint: &str) -> bool {
    req.method() == Method::PUT
        && req.uri().path() == "/"
        && virtual_host_bucket(req.headers(), endpoint).is_none()
}

async fn authenticate(state: &AppState, parts: &Parts, body: &[u8]) -> Result<Identity, S3Error> {
    let deadline = deadline_after(state.config.gateway.request_timeout());
    let raw_query = parts.uri.query().unwrap_or("");
    let query = parse_raw_query(raw_query);

    let auth_type = classify(&parts.method, &parts.headers, &query);
    let fields = match auth_type {
        AuthType::SignedV4 => {
            let value = parts
                .headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            AuthorizationHeaderFields::parse(value)?
        }
        AuthType::PresignedV4 => AuthorizationHeaderFields::from_presigned_query(&query)?,
        other => {
            debug!("unsupported auth type {}", other.as_str());
            return Err(S3Error::AllAccessDisabled);
        }
    };

    let lookup = state.credentials.lookup(&fields.access_key_id);
    let Some(credential) = within_deadline(deadline, lookup).await?? else {
        return Err(S3Error::AllAccessDisabled);
    };
    if fields.region != state.config.server.region {
        return Err(S3Error::InvalidRegion);
    }

    let ctx = SigningContext {
        method: parts.method.as_str(),
        path: parts.uri.path(),
        raw_query,
        headers: &parts.headers,
        authority: parts.uri.authority().map(|a| a.as_str()),
        body,
    };
    let engine = SignatureEngine::new(
        &fields.access_key_id,
        &credential.secret_key,
        &state.config.server.region,
    );
    let now = Utc::now();
    if auth_type == AuthType::SignedV4 {
        engine.verify_header(&ctx, now)?;
    } else {
        engine.verify_presigned(&ctx, now)?;
    }

    debug!("auth OK for access key {}", fields.access_key_id);
    Ok(Identity {
        access_key: fields.access_key_id,
        credential,
        deadline,
    })
}

// -- Gateway endpoints -------------------------------------------------------

/// `GET /version` -- build information.
#[utoipa::path(
    get,
    path = "/version",
    tag = "Service",
    operation_id = "Version",
    responses(
        (status = 200, description = "`{name} ok` with X-Build-* headers")
    )
)]
async fn version() -> impl IntoResponse {
    (
        [
            ("X-Build-Name", BUILD_NAME),
            ("X-Build-Time", BUILD_TIME),
            ("X-Build-Version", BUILD_VERSION),
        ],
        format!("{BUILD_NAME} ok"),
    )
}

async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

// -- Addressing ---------------------------------------------------------------

/// What a request addresses once virtual-host style is folded in.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Service,
    Bucket(String),
    Object(String, String),
}

/// Bucket named by a `{bucket}.{endpoint}[:port]` host, if any.
fn virtual_host_bucket(headers: &HeaderMap, endpoint: &str) -> Option<String> {
    if endpoint.is_empty() {
        return None;
    }
    let host = headers.get(header::HOST)?.to_str().ok()?;
    let host = host.split(':').next().unwrap_or(host);
    let bucket = host.strip_suffix(endpoint)?.strip_suffix('.')?;
    (!bucket.is_empty()).then(|| bucket.to_string())
}

/// Resolve the target from the host and the captured path segments.
fn resolve_target(
    endpoint: &str,
    headers: &HeaderMap,
    first: Option<String>,
    rest: Option<String>,
) -> Target {
    match virtual_host_bucket(headers, endpoint) {
        Some(bucket) => match (first, rest) {
            (None, _) => Target::Bucket(bucket),
            (Some(key), None) => Target::Object(bucket, key),
            (Some(first), Some(rest)) => Target::Object(bucket, format!("{first}/{rest}")),
        },
        None => match (first, rest) {
            (None, _) => Target::Service,
            (Some(bucket), None) => Target::Bucket(bucket),
            (Some(bucket), Some(key)) => Target::Object(bucket, key),
        },
    }
}

// -- Dispatch -----------------------------------------------------------------

/// `/` -- ListBuckets, PutApplication, DeleteApplication.
async fn handle_service(
    State(state): State<Arc<AppState>>,
    identity: Option<Extension<Identity>>,
    method: Method,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let target = resolve_target(&state.config.server.endpoint, &headers, None, None);
    dispatch(state, identity, method, target, raw_query, headers, body).await
}

/// `/:bucket` -- bucket operations.
async fn handle_bucket(
    State(state): State<Arc<AppState>>,
    identity: Option<Extension<Identity>>,
    method: Method,
    Path(bucket): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let target = resolve_target(&state.config.server.endpoint, &headers, Some(bucket), None);
    dispatch(state, identity, method, target, raw_query, headers, body).await
}

/// `/:bucket/*key` -- object operations.
async fn handle_object(
    State(state): State<Arc<AppState>>,
    identity: Option<Extension<Identity>>,
    method: Method,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let target = resolve_target(&state.config.server.endpoint, &headers, Some(bucket), Some(key));
    dispatch(state, identity, method, target, raw_query, headers, body).await
}

/// Route one request to its handler:
/// - `GET /` -> ListBuckets, `PUT /` -> PutApplication, `DELETE /` -> DeleteApplication
/// - `GET /{bucket}` -> ListObjects, or ListObjectsV2 with `list-type=2`
/// - `PUT|HEAD|DELETE /{bucket}` -> CreateBucket, HeadBucket, DeleteBucket
/// - `PUT /{bucket}/{key}` -> CopyObject when `x-amz-copy-source` names a source, else PutObject
/// - `GET|HEAD|DELETE /{bucket}/{key}` -> GetObject, HeadObject, DeleteObject
async fn dispatch(
    state: Arc<AppState>,
    identity: Option<Extension<Identity>>,
    method: Method,
    target: Target,
    raw_query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if target == Target::Service && method == Method::PUT {
        return application::put_application(state, &body)
            .await
            .unwrap_or_else(IntoResponse::into_response);
    }

    let Some(Extension(identity)) = identity else {
        return S3Error::AllAccessDisabled.into_response();
    };
    let query = parse_raw_query(raw_query.as_deref().unwrap_or(""));
    let req = S3Request {
        identity: &identity,
        headers: &headers,
        query: &query,
        body: &body,
    };

    let result = match (&target, &method) {
        (Target::Service, &Method::GET) => bucket::list_buckets(state, req).await,
        (Target::Service, &Method::DELETE) => application::delete_application(state, &identity).await,

        (Target::Bucket(b), &Method::GET) => {
            if req.query_value("list-type") == Some("2") {
                bucket::list_objects_v2(state, b, req).await
            } else {
                bucket::list_objects(state, b, req).await
            }
        }
        (Target::Bucket(b), &Method::PUT) => bucket::create_bucket(state, b, req).await,
        (Target::Bucket(b), &Method::HEAD) => return bucket::head_bucket(state, b, req).await,
        (Target::Bucket(b), &Method::DELETE) => bucket::delete_bucket(state, b, req).await,

        (Target::Object(b, k), &Method::GET) => object::get_object(state, b, k, req).await,
        (Target::Object(b, k), &Method::PUT) => {
            if object::is_copy_request(&headers) {
                object::copy_object(state, b, k, req).await
            } else {
                object::put_object(state, b, k, req).await
            }
        }
        (Target::Object(b, k), &Method::HEAD) => return object::head_object(state, b, k, req).await,
        (Target::Object(b, k), &Method::DELETE) => object::delete_object(state, b, k, req).await,

        _ => Err(S3Error::MethodNotAllowed),
    };
    result.unwrap_or_else(IntoResponse::into_response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ISO8601_BASIC;
    use crate::credentials::{
        Application, CredentialResolver, ResolvedCredential, SqliteCredentialStore, StoreFuture,
    };
    use crate::gateway::tests::FakeFactory;
    use crate::gateway::{BackendRegistry, Credentials};
    use axum::http::{HeaderName, StatusCode};
    use sha2::{Digest, Sha256};
    use std::time::Duration;
    use tower::ServiceExt;

    const AK: &str = "PLATFORMACCESSKEY001";
    const SK: &str = "platform-secret-key-0000000000000000000";
    const REGION: &str = "us-east-1";
    const HOST: &str = "localhost:9091";

    /// Credential store whose lookups stall before answering.
    struct SlowResolver {
        inner: SqliteCredentialStore,
        delay: Duration,
    }

    impl CredentialResolver for SlowResolver {
        fn lookup(&self, access_key: &str) -> StoreFuture<'_, Option<ResolvedCredential>> {
            let access_key = access_key.to_string();
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                self.inner.lookup(&access_key).await
            })
        }

        fn insert(&self, app: Application) -> StoreFuture<'_, ()> {
            self.inner.insert(app)
        }

        fn delete(&self, access_key: &str) -> StoreFuture<'_, bool> {
            self.inner.delete(access_key)
        }

        fn backend_registered(&self, engine: &str, backend: &Credentials) -> StoreFuture<'_, bool> {
            self.inner.backend_registered(engine, backend)
        }
    }

    async fn test_app(config: Config) -> (Router, tempfile::TempDir) {
        test_app_with(config, FakeFactory::production(), None).await
    }

    async fn test_app_with(
        config: Config,
        factory: FakeFactory,
        lookup_delay: Option<Duration>,
    ) -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.db");
        let store = SqliteCredentialStore::new(path.to_str().unwrap()).unwrap();
        store
            .insert(Application {
                access_key: AK.into(),
                secret_key: SK.into(),
                engine: "fake".into(),
                engine_access_key: "backend-ak".into(),
                engine_secret_key: "backend-sk".into(),
                engine_region: REGION.into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let credentials: Arc<dyn CredentialResolver> = match lookup_delay {
            Some(delay) => Arc::new(SlowResolver { inner: store, delay }),
            None => Arc::new(store),
        };
        let mut registry = BackendRegistry::new();
        registry.register("fake", factory);
        let state = Arc::new(AppState {
            config,
            registry: Arc::new(registry),
            credentials,
        });
        (app(state), dir)
    }

    /// Build a header-signed request.
    fn signed_with(
        access_key: &str,
        secret_key: &str,
        region: &str,
        method: &str,
        uri: &str,
        extra: &[(&str, &str)],
        body: &[u8],
    ) -> Request<Body> {
        let now = Utc::now();
        let mut headers = HeaderMap::new();
        headers.insert("host", HOST.parse().unwrap());
        headers.insert("x-amz-date", now.format(ISO8601_BASIC).to_string().parse().unwrap());
        headers.insert(
            "x-amz-content-sha256",
            hex::encode(Sha256::digest(body)).parse().unwrap(),
        );
        for (k, v) in extra {
            headers.insert(HeaderName::from_bytes(k.as_bytes()).unwrap(), v.parse().unwrap());
        }

        let (path, query) = uri.split_once('?').unwrap_or((uri, ""));
        let ctx = SigningContext {
            method,
            path,
            raw_query: query,
            headers: &headers,
            authority: None,
            body,
        };
        let authorization = SignatureEngine::new(access_key, secret_key, region).authorization(&ctx, &now, None);
        headers.insert("authorization", authorization.parse().unwrap());

        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_vec()))
            .unwrap();
        *req.headers_mut() = headers;
        req
    }

    fn signed(method: &str, uri: &str, extra: &[(&str, &str)], body: &[u8]) -> Request<Body> {
        signed_with(AK, SK, REGION, method, uri, extra, body)
    }

    async fn body_string(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn element<'a>(xml: &'a str, tag: &str) -> &'a str {
        let open = format!("<{tag}>");
        let start = xml.find(&open).unwrap() + open.len();
        let end = xml[start..].find(&format!("</{tag}>")).unwrap();
        &xml[start..start + end]
    }

    #[test]
    fn test_virtual_host_bucket() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "photos.s3.example.com:9091".parse().unwrap());
        assert_eq!(virtual_host_bucket(&headers, "s3.example.com").as_deref(), Some("photos"));
        assert_eq!(virtual_host_bucket(&headers, ""), None);

        headers.insert("host", "s3.example.com".parse().unwrap());
        assert_eq!(virtual_host_bucket(&headers, "s3.example.com"), None);
        headers.insert("host", "a.b.s3.example.com".parse().unwrap());
        assert_eq!(virtual_host_bucket(&headers, "s3.example.com").as_deref(), Some("a.b"));
    }

    #[test]
    fn test_resolve_target() {
        let headers = HeaderMap::new();
        assert_eq!(resolve_target("", &headers, None, None), Target::Service);
        assert_eq!(
            resolve_target("", &headers, Some("b".into()), Some("k/x".into())),
            Target::Object("b".into(), "k/x".into())
        );

        let mut vhost = HeaderMap::new();
        vhost.insert("host", "b.s3.local".parse().unwrap());
        assert_eq!(resolve_target("s3.local", &vhost, None, None), Target::Bucket("b".into()));
        assert_eq!(
            resolve_target("s3.local", &vhost, Some("dir".into()), Some("file".into())),
            Target::Object("b".into(), "dir/file".into())
        );
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/"), (String::new(), String::new()));
        assert_eq!(split_path("/b"), ("b".to_string(), String::new()));
        assert_eq!(split_path("/b/k/x"), ("b".to_string(), "k/x".to_string()));
    }

    #[tokio::test]
    async fn test_version_is_unauthenticated() {
        let (app, _dir) = test_app(Config::default()).await;
        let resp = app
            .oneshot(Request::get("/version").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-build-name"], "s3adapter");
        assert!(resp.headers().contains_key(REQUEST_ID_HEADER));
        assert_eq!(body_string(resp).await, "s3adapter ok");
    }

    #[tokio::test]
    async fn test_openapi_json() {
        let (app, _dir) = test_app(Config::default()).await;
        let resp = app
            .oneshot(Request::get("/openapi.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_string(resp).await.contains("ListBuckets"));
    }

    #[tokio::test]
    async fn test_anonymous_request_denied() {
        let (app, _dir) = test_app(Config::default()).await;
        let resp = app
            .oneshot(Request::get("/bucket").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body = body_string(resp).await;
        assert!(body.contains("<Code>AllAccessDisabled</Code>"));
    }

    #[tokio::test]
    async fn test_unknown_access_key_denied() {
        let (app, _dir) = test_app(Config::default()).await;
        let req = signed_with("NOSUCHKEY", SK, REGION, "GET", "/bucket", &[], b"");
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(body_string(resp).await.contains("<Code>AllAccessDisabled</Code>"));
    }

    #[tokio::test]
    async fn test_bad_signature_denied() {
        let (app, _dir) = test_app(Config::default()).await;
        let req = signed_with(AK, "wrong-secret", REGION, "GET", "/bucket", &[], b"");
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(body_string(resp).await.contains("<Code>AllAccessDisabled</Code>"));
    }

    #[tokio::test]
    async fn test_wrong_region_rejected() {
        let (app, _dir) = test_app(Config::default()).await;
        let req = signed_with(AK, SK, "eu-west-1", "GET", "/bucket", &[], b"");
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(resp).await.contains("<Code>InvalidRegion</Code>"));
    }

    #[tokio::test]
    async fn test_put_then_get_object() {
        let (app, _dir) = test_app(Config::default()).await;

        let put = signed(
            "PUT",
            "/bucket/dir/hello.txt",
            &[("x-amz-meta-color", "blue")],
            b"hello world",
        );
        let resp = app.clone().oneshot(put).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["etag"], "\"fake-etag\"");
        assert_eq!(resp.headers()[REQUEST_ID_HEADER], "FAKEREQUESTID");
        assert_eq!(resp.headers()[HOST_ID_HEADER], "fake-host-id");

        let get = signed("GET", "/bucket/dir/hello.txt", &[], b"");
        let resp = app.oneshot(get).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-amz-meta-color"], "blue");
        assert_eq!(body_string(resp).await, "hello world");
    }

    #[tokio::test]
    async fn test_get_missing_object() {
        let (app, _dir) = test_app(Config::default()).await;
        let resp = app.oneshot(signed("GET", "/bucket/nope", &[], b"")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(body_string(resp).await.contains("<Code>NoSuchKey</Code>"));
    }

    #[tokio::test]
    async fn test_head_errors_have_no_body() {
        let (app, _dir) = test_app(Config::default()).await;
        let resp = app
            .clone()
            .oneshot(signed("HEAD", "/missing", &[], b""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers()[REQUEST_ID_HEADER], "FAKEREQUESTID");
        assert!(body_string(resp).await.is_empty());

        let resp = app.oneshot(signed("HEAD", "/bucket/none", &[], b"")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(body_string(resp).await.is_empty());
    }

    #[tokio::test]
    async fn test_create_bucket_echoes_location() {
        let (app, _dir) = test_app(Config::default()).await;
        let body = b"<CreateBucketConfiguration><LocationConstraint>eu-west-1</LocationConstraint></CreateBucketConfiguration>";
        let resp = app.oneshot(signed("PUT", "/newbucket", &[], body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["location"], "/newbucket");
    }

    #[tokio::test]
    async fn test_create_bucket_malformed_xml() {
        let (app, _dir) = test_app(Config::default()).await;
        let resp = app
            .oneshot(signed("PUT", "/newbucket", &[], b"<CreateBucketConfiguration>"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(resp).await.contains("<Code>MalformedXML</Code>"));
    }

    #[tokio::test]
    async fn test_list_objects() {
        let (app, _dir) = test_app(Config::default()).await;
        app.clone()
            .oneshot(signed("PUT", "/bucket/a.txt", &[], b"a"))
            .await
            .unwrap();

        let resp = app.oneshot(signed("GET", "/bucket?prefix=", &[], b"")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "application/xml");
        let body = body_string(resp).await;
        assert!(body.starts_with("<?xml"));
        assert!(body.contains(r#"<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">"#));
        assert!(body.contains("<Key>a.txt</Key>"));
        assert!(body.contains("<MaxKeys>1000</MaxKeys>"));
    }

    #[tokio::test]
    async fn test_list_objects_invalid_max_keys() {
        let (app, _dir) = test_app(Config::default()).await;
        let resp = app
            .oneshot(signed("GET", "/bucket?max-keys=lots", &[], b""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_string(resp).await;
        assert!(body.contains("<Code>InvalidArgument</Code>"));
        assert!(body.contains("<ArgumentValue>lots</ArgumentValue>"));
    }

    #[tokio::test]
    async fn test_list_objects_invalid_encoding() {
        let (app, _dir) = test_app(Config::default()).await;
        let resp = app
            .oneshot(signed("GET", "/bucket?encoding-type=gzip", &[], b""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(resp).await.contains("Invalid Encoding Method"));
    }

    #[tokio::test]
    async fn test_list_objects_v2_empty_token() {
        let (app, _dir) = test_app(Config::default()).await;
        let resp = app
            .oneshot(signed("GET", "/bucket?continuation-token=&list-type=2", &[], b""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(resp).await.contains("continuation token"));
    }

    #[tokio::test]
    async fn test_list_objects_v2_unsupported_backend() {
        let (app, _dir) = test_app(Config::default()).await;
        let resp = app
            .oneshot(signed("GET", "/bucket?list-type=2", &[], b""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
        assert!(body_string(resp).await.contains("<Code>ErrUnsupported</Code>"));
    }

    #[tokio::test]
    async fn test_put_object_bad_digest() {
        let (app, _dir) = test_app(Config::default()).await;
        // base64(md5("other"))
        let resp = app
            .oneshot(signed(
                "PUT",
                "/bucket/k",
                &[("content-md5", "eV8yArF8trw9S3cdjGyerw==")],
                b"hello",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(resp).await.contains("<Code>BadDigest</Code>"));
    }

    #[tokio::test]
    async fn test_put_object_invalid_digest() {
        let (app, _dir) = test_app(Config::default()).await;
        let resp = app
            .oneshot(signed("PUT", "/bucket/k", &[("content-md5", "not-base64!")], b"hello"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(resp).await.contains("<Code>InvalidDigest</Code>"));
    }

    #[tokio::test]
    async fn test_copy_object() {
        let (app, _dir) = test_app(Config::default()).await;
        let resp = app
            .oneshot(signed("PUT", "/bucket/dst", &[("x-amz-copy-source", "bucket/src")], b""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        assert!(body.contains("<CopyObjectResult>"));
        assert!(body.contains("copied"));
    }

    #[tokio::test]
    async fn test_delete_object_no_content() {
        let (app, _dir) = test_app(Config::default()).await;
        let resp = app.oneshot(signed("DELETE", "/bucket/k", &[], b"")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let (app, _dir) = test_app(Config::default()).await;
        let resp = app.oneshot(signed("POST", "/bucket", &[], b"")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_presigned_get() {
        let (app, _dir) = test_app(Config::default()).await;
        app.clone()
            .oneshot(signed("PUT", "/bucket/shared.txt", &[], b"shared"))
            .await
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("host", HOST.parse().unwrap());
        let ctx = SigningContext {
            method: "GET",
            path: "/bucket/shared.txt",
            raw_query: "",
            headers: &headers,
            authority: None,
            body: b"",
        };
        let query = SignatureEngine::new(AK, SK, REGION).presign(&ctx, &Utc::now(), 300);
        let req = Request::get(format!("/bucket/shared.txt?{query}"))
            .header("host", HOST)
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "shared");
    }

    fn one_second_deadline() -> Config {
        let mut config = Config::default();
        config.gateway.request_timeout = 1;
        config
    }

    async fn assert_request_timeout(app: Router, req: Request<Body>) {
        let resp = tokio::time::timeout(Duration::from_secs(10), app.oneshot(req))
            .await
            .expect("request outlived its deadline")
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(resp).await.contains("<Code>RequestTimeout</Code>"));
    }

    #[tokio::test]
    async fn test_backend_construction_bounded_by_deadline() {
        let factory = FakeFactory {
            connect_delay: Some(Duration::from_secs(3600)),
            ..FakeFactory::production()
        };
        let (app, _dir) = test_app_with(one_second_deadline(), factory, None).await;
        assert_request_timeout(app, signed("GET", "/", &[], b"")).await;
    }

    #[tokio::test]
    async fn test_slow_backend_call_times_out() {
        let factory = FakeFactory {
            call_delay: Some(Duration::from_secs(3600)),
            ..FakeFactory::production()
        };
        let (app, _dir) = test_app_with(one_second_deadline(), factory, None).await;
        assert_request_timeout(app, signed("GET", "/bucket", &[], b"")).await;
    }

    #[tokio::test]
    async fn test_credential_lookup_bounded_by_deadline() {
        let (app, _dir) = test_app_with(
            one_second_deadline(),
            FakeFactory::production(),
            Some(Duration::from_secs(3600)),
        )
        .await;
        assert_request_timeout(app, signed("GET", "/bucket", &[], b"")).await;
    }

    #[tokio::test]
    async fn test_deadline_spans_lookup_and_construction() {
        // Each step alone fits in the deadline, together they do not.
        let factory = FakeFactory {
            connect_delay: Some(Duration::from_millis(700)),
            ..FakeFactory::production()
        };
        let (app, _dir) = test_app_with(
            one_second_deadline(),
            factory,
            Some(Duration::from_millis(700)),
        )
        .await;
        assert_request_timeout(app, signed("GET", "/bucket", &[], b"")).await;
    }

    #[tokio::test]
    async fn test_virtual_host_addressing() {
        let mut config = Config::default();
        config.server.endpoint = "s3.local".into();
        let (app, _dir) = test_app(config).await;

        let put = signed("PUT", "/photo.jpg", &[("host", "pics.s3.local:9091")], b"jpeg");
        let resp = app.clone().oneshot(put).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(signed("GET", "/pics/photo.jpg", &[], b""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "jpeg");
    }

    #[tokio::test]
    async fn test_application_lifecycle() {
        let (app, _dir) = test_app(Config::default()).await;
        let body = "<CreateApplicationConfiguration>\
            <AccessKey>other-ak</AccessKey><SecretKey>other-sk</SecretKey>\
            <Region>us-east-1</Region><Engine>fake</Engine><AppName>demo</AppName>\
            </CreateApplicationConfiguration>";

        // Registration is unsigned.
        let resp = app
            .clone()
            .oneshot(Request::put("/").body(Body::from(body)).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let xml = body_string(resp).await;
        assert!(xml.contains("<CreateApplicationResult"));
        let new_ak = element(&xml, "AccessKey").to_string();
        let new_sk = element(&xml, "SecretKey").to_string();
        assert_eq!(new_ak.len(), 20);
        assert_eq!(new_sk.len(), 40);

        // Same backend credentials again.
        let resp = app
            .clone()
            .oneshot(Request::put("/").body(Body::from(body)).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        // The new keys work...
        let req = signed_with(&new_ak, &new_sk, REGION, "HEAD", "/bucket", &[], b"");
        assert_eq!(app.clone().oneshot(req).await.unwrap().status(), StatusCode::OK);

        // ...until the application deletes itself.
        let req = signed_with(&new_ak, &new_sk, REGION, "DELETE", "/", &[], b"");
        assert_eq!(app.clone().oneshot(req).await.unwrap().status(), StatusCode::OK);
        let req = signed_with(&new_ak, &new_sk, REGION, "HEAD", "/bucket", &[], b"");
        assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_put_application_rejects_bad_input() {
        let (app, _dir) = test_app(Config::default()).await;

        let resp = app
            .clone()
            .oneshot(Request::put("/").body(Body::from("<not-xml")).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(resp).await.contains("<Code>MalformedXML</Code>"));

        let unknown_engine = "<CreateApplicationConfiguration>\
            <AccessKey>a</AccessKey><SecretKey>s</SecretKey>\
            <Region>us-east-1</Region><Engine>azure</Engine>\
            </CreateApplicationConfiguration>";
        let resp = app
            .oneshot(Request::put("/").body(Body::from(unknown_engine)).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_string(resp).await;
        assert!(body.contains("<Code>InvalidArgument</Code>"));
        assert!(body.contains("<ArgumentValue>azure</ArgumentValue>"));
    }

    #[tokio::test]
    async fn test_credential_store_is_shared() {
        let (app, dir) = test_app(Config::default()).await;
        drop(app);
        let store = SqliteCredentialStore::new(dir.path().join("creds.db").to_str().unwrap()).unwrap();
        assert!(store.lookup(AK).await.unwrap().is_some());
    }
}
