//! Tencent Cloud COS backend.
//!
//! Speaks the COS XML API directly over `reqwest`.  Every request is
//! signed with the COS HMAC-SHA1 scheme and sent to
//! `https://{bucket}.cos.{region}.myqcloud.com`; ListBuckets goes to the
//! configured service endpoint instead.
//!
//! Header mapping:
//!   `x-amz-acl` / `x-amz-grant-*`  ->  `x-cos-acl` / `x-cos-grant-*`
//!   `x-amz-meta-*`                 <-> `x-cos-meta-*`
//!   `x-cos-request-id`             ->  `x-amz-request-id`
//!   `x-cos-trace-id`               ->  `x-amz-id-2`

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use http::{HeaderMap, Method, StatusCode};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use super::model::*;
use super::{
    from_native_metadata, require, to_native_metadata, BackendFactory, BackendFuture,
    BackendProtocol, ConnectFuture, Credentials, Failure, NormalizedError, Reply,
};
use crate::codec::{format_time, parse_time, Metadata, TimestampFormat};

/// Engine name in the registry.
pub const ENGINE: &str = "cos";

/// Per-bucket endpoint template.
const BUCKET_URL: &str = "https://{bucket}.cos.{region}.myqcloud.com";

const META_PREFIX: &str = "x-cos-meta-";

/// COS rejects larger pages.
const COS_MAX_KEYS: i64 = 1000;

/// Lifetime of one request signature.
const SIGNATURE_TTL_SECS: i64 = 3600;

const REQUEST_ID: &str = "x-cos-request-id";
const TRACE_ID: &str = "x-cos-trace-id";
const SECURITY_TOKEN: &str = "x-cos-security-token";

/// Headers (besides `x-cos-*`) covered by the signature.
const SIGNED_HEADERS: &[&str] = &[
    "cache-control",
    "content-disposition",
    "content-encoding",
    "content-md5",
    "content-type",
    "expires",
    "if-match",
    "if-modified-since",
    "if-none-match",
    "if-unmodified-since",
    "range",
];

/// Unreserved characters stay literal, everything else is `%XX`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const PATH: &AsciiSet = &COMPONENT.remove(b'/');

type HmacSha1 = Hmac<Sha1>;

// -- COS XML response types ---------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CosErrorResponse {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    request_id: String,
    #[serde(default)]
    trace_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CosOwner {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(default)]
    display_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CosObject {
    #[serde(default)]
    key: String,
    #[serde(default)]
    last_modified: String,
    #[serde(rename = "ETag", default)]
    etag: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    owner: Option<CosOwner>,
    #[serde(default)]
    storage_class: String,
}

#[derive(Debug, Default, Deserialize)]
struct CosCommonPrefix {
    #[serde(rename = "Prefix", default)]
    prefix: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CosListBucketResult {
    #[serde(default)]
    name: String,
    #[serde(default)]
    prefix: String,
    #[serde(default)]
    marker: String,
    #[serde(default)]
    next_marker: String,
    #[serde(default)]
    delimiter: String,
    #[serde(default)]
    max_keys: i64,
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    encoding_type: String,
    #[serde(default)]
    contents: Vec<CosObject>,
    #[serde(default)]
    common_prefixes: Vec<CosCommonPrefix>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CosBucket {
    #[serde(default)]
    name: String,
    #[serde(default)]
    creation_date: String,
}

#[derive(Debug, Default, Deserialize)]
struct CosBuckets {
    #[serde(rename = "Bucket", default)]
    bucket: Vec<CosBucket>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CosListAllMyBucketsResult {
    #[serde(default)]
    owner: Option<CosOwner>,
    #[serde(default)]
    buckets: CosBuckets,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CosCopyObjectResult {
    #[serde(rename = "ETag", default)]
    etag: String,
    #[serde(default)]
    last_modified: String,
}

// -- Signing ------------------------------------------------------------------

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn encode(s: &str) -> String {
    utf8_percent_encode(s, COMPONENT).to_string()
}

/// Lowercase and encode `(name, value)` pairs, sorted by name.  Returns
/// the `;`-joined name list and the `&`-joined `name=value` block.
fn format_pairs(pairs: &[(String, String)]) -> (String, String) {
    let mut encoded: Vec<(String, String)> = pairs
        .iter()
        .map(|(k, v)| (encode(&k.to_ascii_lowercase()), encode(v)))
        .collect();
    encoded.sort();
    let list = encoded
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let block = encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    (list, block)
}

/// Build the COS `Authorization` value for a request valid over
/// `[start, end]` (unix seconds).
///
/// `path` is the decoded request path; `headers` are the headers to sign,
/// `host` included.
pub fn authorization(
    credentials: &Credentials,
    method: &Method,
    path: &str,
    query: &[(String, String)],
    headers: &[(String, String)],
    start: i64,
    end: i64,
) -> String {
    let key_time = format!("{start};{end}");
    let (param_list, params) = format_pairs(query);
    let (header_list, header_block) = format_pairs(headers);

    let http_string = format!(
        "{}\n{}\n{}\n{}\n",
        method.as_str().to_ascii_lowercase(),
        path,
        params,
        header_block
    );
    let string_to_sign = format!(
        "sha1\n{}\n{}\n",
        key_time,
        hex::encode(Sha1::digest(http_string.as_bytes()))
    );

    let sign_key = hex::encode(hmac_sha1(
        credentials.secret_access_key.as_bytes(),
        key_time.as_bytes(),
    ));
    let signature = hex::encode(hmac_sha1(sign_key.as_bytes(), string_to_sign.as_bytes()));

    format!(
        "q-sign-algorithm=sha1&q-ak={}&q-sign-time={key_time}&q-key-time={key_time}\
         &q-header-list={header_list}&q-url-param-list={param_list}&q-signature={signature}",
        credentials.access_key_id
    )
}

fn is_signed_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    (name.starts_with("x-cos-") && name != SECURITY_TOKEN) || SIGNED_HEADERS.contains(&name.as_str())
}

// -- Translation helpers ------------------------------------------------------

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn reply<T>(output: T, headers: &HeaderMap) -> Reply<T> {
    Reply::new(output, header_str(headers, REQUEST_ID), header_str(headers, TRACE_ID))
}

/// Failure for anything that is not a COS error document.
fn untranslated(
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    headers: &HeaderMap,
) -> Failure {
    NormalizedError::untranslated(err)
        .with_ids(header_str(headers, REQUEST_ID), header_str(headers, TRACE_ID))
        .into()
}

/// Map a non-2xx COS response to a [`Failure`].
///
/// The error document supplies code, message and ids; headers fill in
/// missing ids.  Bodiless responses (HEAD) get a code derived from the
/// status.
fn translate_error(status: u16, headers: &HeaderMap, body: &[u8]) -> Failure {
    let doc: CosErrorResponse = quick_xml::de::from_reader(body).unwrap_or_default();

    let code = if doc.code.is_empty() {
        StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .map(|r| r.replace(' ', ""))
            .unwrap_or_else(|| "ErrNotFoundError".to_string())
    } else {
        doc.code
    };
    let request_id = non_empty(doc.request_id).or_else(|| header_str(headers, REQUEST_ID).map(str::to_string));
    let trace_id = non_empty(doc.trace_id).or_else(|| header_str(headers, TRACE_ID).map(str::to_string));

    NormalizedError::new(code, doc.message, status)
        .with_ids(request_id.as_deref(), trace_id.as_deref())
        .into()
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

fn parse_xml<T: DeserializeOwned>(body: &[u8], headers: &HeaderMap) -> Result<T, Failure> {
    quick_xml::de::from_reader(body).map_err(|e| untranslated(e, headers))
}

/// RFC 3339 timestamp from a list document.
fn list_time(raw: &str) -> Option<DateTime<Utc>> {
    let t = parse_time(raw, TimestampFormat::Iso8601);
    if t.is_none() {
        warn!("COS returned unparseable timestamp {:?}", raw);
    }
    t
}

fn http_date(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(|t| format_time(&t, TimestampFormat::Rfc822))
}

fn owner(o: CosOwner) -> Owner {
    Owner {
        id: Some(o.id),
        display_name: Some(o.display_name),
    }
}

fn object(o: CosObject) -> Object {
    Object {
        last_modified: list_time(&o.last_modified),
        key: o.key,
        etag: non_empty(o.etag),
        size: o.size,
        storage_class: non_empty(o.storage_class),
        owner: o.owner.map(owner),
    }
}

fn list_objects_output(result: CosListBucketResult) -> ListObjectsOutput {
    ListObjectsOutput {
        name: result.name,
        prefix: result.prefix,
        marker: result.marker,
        next_marker: non_empty(result.next_marker),
        max_keys: result.max_keys,
        delimiter: non_empty(result.delimiter),
        is_truncated: result.is_truncated,
        encoding_type: non_empty(result.encoding_type),
        contents: result.contents.into_iter().map(object).collect(),
        common_prefixes: result
            .common_prefixes
            .into_iter()
            .map(|p| CommonPrefix { prefix: p.prefix })
            .collect(),
    }
}

fn list_buckets_output(result: CosListAllMyBucketsResult) -> ListBucketsOutput {
    let bucket = result
        .buckets
        .bucket
        .into_iter()
        .map(|b| Bucket {
            creation_date: list_time(&b.creation_date).unwrap_or_default(),
            name: b.name,
        })
        .collect();
    ListBucketsOutput {
        owner: result.owner.map(owner),
        buckets: BucketList { bucket },
    }
}

/// Object attributes from COS response headers.
fn object_head(headers: &HeaderMap) -> HeadObjectOutput {
    let text = |name: &str| header_str(headers, name).map(str::to_string);
    let time = |name: &str| header_str(headers, name).and_then(|v| parse_time(v, TimestampFormat::Rfc822));
    HeadObjectOutput {
        accept_ranges: text("accept-ranges"),
        cache_control: text("cache-control"),
        content_disposition: text("content-disposition"),
        content_encoding: text("content-encoding"),
        content_language: text("content-language"),
        content_length: header_str(headers, "content-length").and_then(|v| v.parse().ok()),
        content_type: text("content-type"),
        delete_marker: None,
        etag: text("etag"),
        expires: time("expires"),
        last_modified: time("last-modified"),
        metadata: from_native_metadata(headers, META_PREFIX),
        server_side_encryption: text("x-cos-server-side-encryption"),
        storage_class: text("x-cos-storage-class"),
        version_id: text("x-cos-version-id"),
        website_redirect_location: text("x-cos-website-redirect-location"),
    }
}

/// Rewrite an S3 copy source (`[/]bucket/key[?versionId=..]`, possibly
/// percent-encoded) as `{bucket}.cos.{region}.myqcloud.com/{key}`.
fn cos_copy_source(source: &str, region: &str) -> Option<String> {
    let decoded = percent_decode_str(source).decode_utf8_lossy();
    let (path, version) = match decoded.split_once("?versionId=") {
        Some((path, version)) => (path, Some(version)),
        None => (decoded.as_ref(), None),
    };
    let (bucket, key) = path.trim_start_matches('/').split_once('/')?;
    if bucket.is_empty() || key.is_empty() {
        return None;
    }

    let host = if bucket.ends_with(".myqcloud.com") {
        bucket.to_string()
    } else {
        format!("{bucket}.cos.{region}.myqcloud.com")
    };
    let mut out = format!("{host}/{}", utf8_percent_encode(key, PATH));
    if let Some(version) = version {
        out.push_str("?versionId=");
        out.push_str(version);
    }
    Some(out)
}

fn metadata_headers(metadata: Option<&Metadata>) -> Result<Vec<(String, String)>, Failure> {
    match metadata {
        Some(m) => to_native_metadata(m, META_PREFIX).map_err(|e| NormalizedError::from(e).into()),
        None => Ok(Vec::new()),
    }
}

// -- Requests -----------------------------------------------------------------

/// One COS call before signing.
struct CosRequest {
    method: Method,
    url: String,
    /// Decoded path, as signed.
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
}

impl CosRequest {
    fn new(method: Method, base: &str, key: &str) -> Self {
        let path = format!("/{key}");
        Self {
            method,
            url: format!("{}{}", base.trim_end_matches('/'), utf8_percent_encode(&path, PATH)),
            path,
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    fn query(mut self, name: &str, value: Option<String>) -> Self {
        if let Some(value) = value {
            self.query.push((name.to_string(), value));
        }
        self
    }

    fn header(mut self, name: &str, value: Option<String>) -> Self {
        if let Some(value) = value {
            self.headers.push((name.to_string(), value));
        }
        self
    }

    fn headers(mut self, pairs: Vec<(String, String)>) -> Self {
        self.headers.extend(pairs);
        self
    }

    fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }
}

// -- Factory ------------------------------------------------------------------

/// Builds [`CosBackend`]s.
pub struct CosFactory {
    service_url: String,
    debug: bool,
}

impl CosFactory {
    pub fn new(service_url: String, debug: bool) -> Self {
        Self { service_url, debug }
    }
}

impl BackendFactory for CosFactory {
    fn connect(&self, credentials: Credentials, region: String) -> ConnectFuture<'_> {
        Box::pin(async move {
            let backend = CosBackend::new(credentials, region, self.service_url.clone(), self.debug)?;
            Ok(Box::new(backend) as Box<dyn BackendProtocol>)
        })
    }
}

/// Backend that forwards operations to Tencent Cloud COS.
pub struct CosBackend {
    client: reqwest::Client,
    credentials: Credentials,
    region: String,
    service_url: String,
    bucket_url: String,
    /// Log every request and response.
    debug: bool,
}

impl CosBackend {
    pub fn new(
        credentials: Credentials,
        region: String,
        service_url: String,
        debug: bool,
    ) -> anyhow::Result<Self> {
        if region.is_empty() {
            anyhow::bail!("COS backend requires a region");
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        debug!("COS backend initialized: region={} service={}", region, service_url);

        Ok(Self {
            client,
            credentials,
            region,
            service_url,
            bucket_url: BUCKET_URL.to_string(),
            debug,
        })
    }

    /// Override the per-bucket endpoint template.  `{bucket}` and
    /// `{region}` are substituted.
    pub fn with_bucket_url(mut self, template: impl Into<String>) -> Self {
        self.bucket_url = template.into();
        self
    }

    fn bucket_base(&self, bucket: &str) -> String {
        self.bucket_url
            .replace("{bucket}", bucket)
            .replace("{region}", &self.region)
    }

    /// Sign and send `req`, returning the response headers and the full
    /// body of a 2xx answer.
    async fn send(&self, op: &str, req: CosRequest) -> Result<(HeaderMap, Bytes), Failure> {
        let empty = HeaderMap::new();
        let url = reqwest::Url::parse(&req.url).map_err(|e| untranslated(e, &empty))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            _ => String::new(),
        };

        let mut signed: Vec<(String, String)> = req
            .headers
            .iter()
            .filter(|(name, _)| is_signed_header(name))
            .cloned()
            .collect();
        signed.push(("host".to_string(), host));
        let start = Utc::now().timestamp();
        let auth = authorization(
            &self.credentials,
            &req.method,
            &req.path,
            &req.query,
            &signed,
            start,
            start + SIGNATURE_TTL_SECS,
        );

        if self.debug {
            debug!(
                "COS {} request: {} {} query={:?} headers={:?}",
                op, req.method, req.url, req.query, req.headers
            );
        }

        let mut builder = self
            .client
            .request(req.method, url)
            .header(http::header::AUTHORIZATION, auth);
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &self.credentials.session_token {
            builder = builder.header(SECURITY_TOKEN, token.as_str());
        }
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let resp = builder.send().await.map_err(|e| {
            warn!("COS {} transport error: {}", op, e);
            untranslated(e, &empty)
        })?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(|e| untranslated(e, &headers))?;

        if self.debug {
            debug!(
                "COS {} response: status={} headers={:?} body={} bytes",
                op,
                status,
                headers,
                body.len()
            );
        }

        if !status.is_success() {
            let failure = translate_error(status.as_u16(), &headers, &body);
            warn!("COS {} failed: {}", op, failure);
            return Err(failure);
        }
        Ok((headers, body))
    }
}

// -- Protocol -----------------------------------------------------------------

impl BackendProtocol for CosBackend {
    fn production(&self) -> bool {
        true
    }

    fn create_bucket(&self, input: CreateBucketInput) -> BackendFuture<'_, CreateBucketOutput> {
        Box::pin(async move {
            require(&input.bucket)?;
            debug!("COS create_bucket: bucket={}", input.bucket);

            let req = CosRequest::new(Method::PUT, &self.bucket_base(&input.bucket), "")
                .header("x-cos-acl", input.acl)
                .header("x-cos-grant-read", input.grant_read)
                .header("x-cos-grant-write", input.grant_write)
                .header("x-cos-grant-full-control", input.grant_full_control);
            let (headers, _) = self.send("create_bucket", req).await?;

            info!("COS bucket created: {}", input.bucket);
            Ok(reply(
                CreateBucketOutput {
                    location: Some(self.region.clone()),
                },
                &headers,
            ))
        })
    }

    fn head_bucket(&self, input: HeadBucketInput) -> BackendFuture<'_, HeadBucketOutput> {
        Box::pin(async move {
            require(&input.bucket)?;
            debug!("COS head_bucket: bucket={}", input.bucket);

            let req = CosRequest::new(Method::HEAD, &self.bucket_base(&input.bucket), "");
            let (headers, _) = self.send("head_bucket", req).await?;
            Ok(reply(HeadBucketOutput {}, &headers))
        })
    }

    fn delete_bucket(&self, input: DeleteBucketInput) -> BackendFuture<'_, DeleteBucketOutput> {
        Box::pin(async move {
            require(&input.bucket)?;
            debug!("COS delete_bucket: bucket={}", input.bucket);

            let req = CosRequest::new(Method::DELETE, &self.bucket_base(&input.bucket), "");
            let (headers, _) = self.send("delete_bucket", req).await?;
            Ok(reply(DeleteBucketOutput {}, &headers))
        })
    }

    fn list_objects(&self, input: ListObjectsInput) -> BackendFuture<'_, ListObjectsOutput> {
        Box::pin(async move {
            require(&input.bucket)?;
            debug!("COS list_objects: bucket={} prefix={:?}", input.bucket, input.prefix);

            let req = CosRequest::new(Method::GET, &self.bucket_base(&input.bucket), "")
                .query("delimiter", input.delimiter)
                .query("encoding-type", input.encoding_type)
                .query("marker", input.marker)
                .query(
                    "max-keys",
                    input.max_keys.map(|n| n.clamp(0, COS_MAX_KEYS).to_string()),
                )
                .query("prefix", input.prefix);
            let (headers, body) = self.send("list_objects", req).await?;

            let result: CosListBucketResult = parse_xml(&body, &headers)?;
            Ok(reply(list_objects_output(result), &headers))
        })
    }

    fn list_objects_v2(&self, input: ListObjectsV2Input) -> BackendFuture<'_, ListObjectsV2Output> {
        Box::pin(async move {
            debug!("COS list_objects_v2 unsupported: bucket={}", input.bucket);
            Err(NormalizedError::unsupported().into())
        })
    }

    fn list_buckets(&self, _input: ListBucketsInput) -> BackendFuture<'_, ListBucketsOutput> {
        Box::pin(async move {
            debug!("COS list_buckets");

            let req = CosRequest::new(Method::GET, &self.service_url, "");
            let (headers, body) = self.send("list_buckets", req).await?;

            let result: CosListAllMyBucketsResult = parse_xml(&body, &headers)?;
            Ok(reply(list_buckets_output(result), &headers))
        })
    }

    fn put_object(&self, input: PutObjectInput) -> BackendFuture<'_, PutObjectOutput> {
        Box::pin(async move {
            require(&input.bucket)?;
            require(&input.key)?;
            debug!("COS put_object: bucket={} key={}", input.bucket, input.key);

            let meta = metadata_headers(input.metadata.as_ref())?;
            let req = CosRequest::new(Method::PUT, &self.bucket_base(&input.bucket), &input.key)
                .header("x-cos-acl", input.acl)
                .header("x-cos-grant-read", input.grant_read)
                .header("x-cos-grant-full-control", input.grant_full_control)
                .header("cache-control", input.cache_control)
                .header("content-disposition", input.content_disposition)
                .header("content-encoding", input.content_encoding)
                .header("content-type", input.content_type)
                .header("content-md5", input.content_md5.map(|d| BASE64.encode(d)))
                .header("expires", http_date(input.expires))
                .header("x-cos-storage-class", input.storage_class)
                .header("x-cos-server-side-encryption", input.server_side_encryption)
                .headers(meta)
                .body(input.body.unwrap_or_default());
            let (headers, _) = self.send("put_object", req).await?;

            let output = PutObjectOutput {
                etag: header_str(&headers, "etag").map(str::to_string),
                expiration: None,
                server_side_encryption: header_str(&headers, "x-cos-server-side-encryption")
                    .map(str::to_string),
                version_id: header_str(&headers, "x-cos-version-id").map(str::to_string),
            };
            Ok(reply(output, &headers))
        })
    }

    fn head_object(&self, input: HeadObjectInput) -> BackendFuture<'_, HeadObjectOutput> {
        Box::pin(async move {
            require(&input.bucket)?;
            require(&input.key)?;
            debug!("COS head_object: bucket={} key={}", input.bucket, input.key);

            let req = CosRequest::new(Method::HEAD, &self.bucket_base(&input.bucket), &input.key)
                .query("versionId", input.version_id)
                .header("if-modified-since", http_date(input.if_modified_since))
                .header("if-unmodified-since", http_date(input.if_unmodified_since))
                .header("if-match", input.if_match)
                .header("if-none-match", input.if_none_match);
            let (headers, _) = self.send("head_object", req).await?;

            let output = object_head(&headers);
            if output.last_modified.is_none() {
                return Err(untranslated("COS HEAD response has no valid Last-Modified", &headers));
            }
            if output.content_length.is_none() {
                return Err(untranslated("COS HEAD response has no valid Content-Length", &headers));
            }
            Ok(reply(output, &headers))
        })
    }

    fn get_object(&self, input: GetObjectInput) -> BackendFuture<'_, GetObjectOutput> {
        Box::pin(async move {
            require(&input.bucket)?;
            require(&input.key)?;
            debug!("COS get_object: bucket={} key={}", input.bucket, input.key);

            let req = CosRequest::new(Method::GET, &self.bucket_base(&input.bucket), &input.key)
                .query("response-cache-control", input.response_cache_control)
                .query("response-content-disposition", input.response_content_disposition)
                .query("response-content-encoding", input.response_content_encoding)
                .query("response-content-language", input.response_content_language)
                .query("response-content-type", input.response_content_type)
                .query("response-expires", http_date(input.response_expires))
                .query("versionId", input.version_id)
                .header("if-modified-since", http_date(input.if_modified_since))
                .header("if-unmodified-since", http_date(input.if_unmodified_since))
                .header("if-match", input.if_match)
                .header("if-none-match", input.if_none_match)
                .header("range", input.range);
            let (headers, body) = self.send("get_object", req).await?;

            let output = GetObjectOutput {
                head: object_head(&headers),
                body: Some(body),
                content_range: header_str(&headers, "content-range").map(str::to_string),
            };
            Ok(reply(output, &headers))
        })
    }

    fn delete_object(&self, input: DeleteObjectInput) -> BackendFuture<'_, DeleteObjectOutput> {
        Box::pin(async move {
            require(&input.bucket)?;
            require(&input.key)?;
            debug!("COS delete_object: bucket={} key={}", input.bucket, input.key);

            let req = CosRequest::new(Method::DELETE, &self.bucket_base(&input.bucket), &input.key)
                .query("versionId", input.version_id);
            let (headers, _) = self.send("delete_object", req).await?;

            let output = DeleteObjectOutput {
                delete_marker: header_str(&headers, "x-cos-delete-marker").map(|v| v == "true"),
                version_id: header_str(&headers, "x-cos-version-id").map(str::to_string),
            };
            Ok(reply(output, &headers))
        })
    }

    fn copy_object(&self, input: CopyObjectInput) -> BackendFuture<'_, CopyObjectOutput> {
        Box::pin(async move {
            require(&input.bucket)?;
            require(&input.key)?;
            let raw_source = input.copy_source.unwrap_or_default();
            require(&raw_source)?;
            let source = cos_copy_source(&raw_source, &self.region).ok_or_else(|| {
                Failure::from(NormalizedError::new(
                    "InvalidArgument",
                    "Copy Source must mention the source bucket and key: sourcebucket/sourcekey",
                    400,
                ))
            })?;
            debug!("COS copy_object: src={} dst={}/{}", source, input.bucket, input.key);

            let meta = metadata_headers(input.metadata.as_ref())?;
            let req = CosRequest::new(Method::PUT, &self.bucket_base(&input.bucket), &input.key)
                .header("x-cos-copy-source", Some(source))
                .header("x-cos-acl", input.acl)
                .header("x-cos-grant-full-control", input.grant_full_control)
                .header("x-cos-grant-read", input.grant_read)
                .header("x-cos-storage-class", input.storage_class)
                .header("x-cos-copy-source-if-match", input.copy_source_if_match)
                .header(
                    "x-cos-copy-source-if-modified-since",
                    http_date(input.copy_source_if_modified_since),
                )
                .header("x-cos-copy-source-if-none-match", input.copy_source_if_none_match)
                .header(
                    "x-cos-copy-source-if-unmodified-since",
                    http_date(input.copy_source_if_unmodified_since),
                )
                .header("x-cos-metadata-directive", input.metadata_directive)
                .header("x-cos-server-side-encryption", input.server_side_encryption)
                .header("cache-control", input.cache_control)
                .header("content-disposition", input.content_disposition)
                .header("content-encoding", input.content_encoding)
                .header("content-type", input.content_type)
                .header("expires", http_date(input.expires))
                .headers(meta);
            let (headers, body) = self.send("copy_object", req).await?;

            let result: CosCopyObjectResult = parse_xml(&body, &headers)?;
            let last_modified = parse_time(&result.last_modified, TimestampFormat::Iso8601)
                .ok_or_else(|| {
                    untranslated(
                        format!("COS copy result has invalid LastModified {:?}", result.last_modified),
                        &headers,
                    )
                })?;

            let output = CopyObjectOutput {
                copy_object_result: Some(CopyObjectResult {
                    etag: non_empty(result.etag),
                    last_modified: Some(last_modified),
                }),
                copy_source_version_id: None,
                expiration: None,
                server_side_encryption: header_str(&headers, "x-cos-server-side-encryption")
                    .map(str::to_string),
                version_id: header_str(&headers, "x-cos-version-id").map(str::to_string),
            };
            Ok(reply(output, &headers))
        })
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{HOST_ID_HEADER, REQUEST_ID_HEADER};
    use axum::body::Body;
    use axum::extract::Request;
    use axum::response::Response;
    use chrono::TimeZone;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn header_map(items: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in items {
            headers.insert(
                http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        headers
    }

    // -- Signing -------------------------------------------------------------

    #[test]
    fn test_authorization_reference_vector() {
        let creds = Credentials::new(
            "AKIDQjz3ltompVjBni5LitkWHFlFpwkn9U5q",
            "BQYIM75p8x0iWVFSIgqEKwFprpRSVHlz",
        );
        let headers = pairs(&[
            ("Date", "Thu, 16 May 2019 03:15:06 GMT"),
            ("Host", "examplebucket-1250000000.cos.ap-beijing.myqcloud.com"),
            ("Content-Type", "text/plain"),
            ("Content-Length", "13"),
            ("Content-MD5", "mQ/fVh815F3k6TAUm8m0eg=="),
            ("x-cos-acl", "private"),
            ("x-cos-grant-read", "uin=\"100000000011\""),
        ]);
        let auth = authorization(
            &creds,
            &Method::PUT,
            "/exampleobject(腾讯云)",
            &[],
            &headers,
            1557989151,
            1557996351,
        );
        assert_eq!(
            auth,
            "q-sign-algorithm=sha1&q-ak=AKIDQjz3ltompVjBni5LitkWHFlFpwkn9U5q\
             &q-sign-time=1557989151;1557996351&q-key-time=1557989151;1557996351\
             &q-header-list=content-length;content-md5;content-type;date;host;x-cos-acl;x-cos-grant-read\
             &q-url-param-list=&q-signature=d72ee925da29ab8e8db16fd9a1f567e1ba281e6a"
        );
    }

    #[test]
    fn test_sign_key_derivation() {
        let key = hex::encode(hmac_sha1(
            b"BQYIM75p8x0iWVFSIgqEKwFprpRSVHlz",
            b"1557989151;1557996351",
        ));
        assert_eq!(key, "eb2519b498b02ac213cb1f3d1a3d27a3b3c9bc5f");
    }

    #[test]
    fn test_format_pairs_sorts_and_encodes() {
        let (list, block) = format_pairs(&pairs(&[
            ("Prefix", "a b/c"),
            ("max-keys", "10"),
            ("delimiter", "/"),
        ]));
        assert_eq!(list, "delimiter;max-keys;prefix");
        assert_eq!(block, "delimiter=%2F&max-keys=10&prefix=a%20b%2Fc");
    }

    #[test]
    fn test_signed_header_selection() {
        assert!(is_signed_header("x-cos-acl"));
        assert!(is_signed_header("Content-Type"));
        assert!(is_signed_header("x-cos-meta-Color"));
        assert!(!is_signed_header(SECURITY_TOKEN));
        assert!(!is_signed_header("content-length"));
        assert!(!is_signed_header("user-agent"));
    }

    // -- Translation ---------------------------------------------------------

    #[test]
    fn test_translate_error_document() {
        let body = br#"<?xml version="1.0" encoding="UTF-8"?>
<Error>
  <Code>NoSuchBucket</Code>
  <Message>The specified bucket does not exist.</Message>
  <Resource>demo-1250000000.cos.ap-guangzhou.myqcloud.com</Resource>
  <RequestId>NWQ1YzA4ZjNfMmE</RequestId>
  <TraceId>OGVmYzZiMmQzYjA2</TraceId>
</Error>"#;
        let headers = header_map(&[(REQUEST_ID, "from-header")]);
        let failure = translate_error(404, &headers, body);
        assert_eq!(failure.error.code, "NoSuchBucket");
        assert_eq!(failure.error.message, "The specified bucket does not exist.");
        assert_eq!(failure.error.status, 404);
        assert_eq!(failure.headers[REQUEST_ID_HEADER], "NWQ1YzA4ZjNfMmE");
        assert_eq!(failure.headers[HOST_ID_HEADER], "OGVmYzZiMmQzYjA2");
    }

    #[test]
    fn test_translate_bodiless_error_uses_headers() {
        let headers = header_map(&[(REQUEST_ID, "cos-req"), (TRACE_ID, "cos-trace")]);
        let failure = translate_error(404, &headers, b"");
        assert_eq!(failure.error.code, "NotFound");
        assert_eq!(failure.error.status, 404);
        assert_eq!(failure.error.request_id, "cos-req");
        assert_eq!(failure.headers[HOST_ID_HEADER], "cos-trace");

        let failure = translate_error(412, &HeaderMap::new(), b"");
        assert_eq!(failure.error.code, "PreconditionFailed");
        assert_eq!(failure.headers[REQUEST_ID_HEADER].len(), 16);
    }

    #[test]
    fn test_untranslated_transport_error() {
        let failure = untranslated("connection refused", &HeaderMap::new());
        assert_eq!(failure.error.code, "ErrNotFoundError");
        assert_eq!(failure.error.message, "Not Found S3 Error,please see OrgErr");
        assert_eq!(failure.error.status, 400);
    }

    #[test]
    fn test_list_objects_document() {
        let body = br#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <Name>demo-1250000000</Name>
  <Prefix>photos/</Prefix>
  <Marker></Marker>
  <MaxKeys>2</MaxKeys>
  <Delimiter>/</Delimiter>
  <IsTruncated>true</IsTruncated>
  <NextMarker>photos/b.jpg</NextMarker>
  <Contents>
    <Key>photos/a.jpg</Key>
    <LastModified>2019-06-13T08:30:15.000Z</LastModified>
    <ETag>"abc"</ETag>
    <Size>42</Size>
    <Owner><ID>1250000000</ID><DisplayName>1250000000</DisplayName></Owner>
    <StorageClass>STANDARD</StorageClass>
  </Contents>
  <Contents>
    <Key>photos/b.jpg</Key>
    <LastModified>not-a-date</LastModified>
    <ETag>"def"</ETag>
    <Size>7</Size>
    <StorageClass>STANDARD</StorageClass>
  </Contents>
  <CommonPrefixes><Prefix>photos/2019/</Prefix></CommonPrefixes>
  <CommonPrefixes><Prefix>photos/2020/</Prefix></CommonPrefixes>
</ListBucketResult>"#;
        let result: CosListBucketResult = parse_xml(body, &HeaderMap::new()).unwrap();
        let out = list_objects_output(result);

        assert_eq!(out.name, "demo-1250000000");
        assert_eq!(out.prefix, "photos/");
        assert_eq!(out.marker, "");
        assert_eq!(out.next_marker.as_deref(), Some("photos/b.jpg"));
        assert_eq!(out.delimiter.as_deref(), Some("/"));
        assert_eq!(out.max_keys, 2);
        assert!(out.is_truncated);
        assert_eq!(out.encoding_type, None);
        assert_eq!(out.contents.len(), 2);

        let first = &out.contents[0];
        assert_eq!(first.key, "photos/a.jpg");
        assert_eq!(first.size, 42);
        assert_eq!(first.etag.as_deref(), Some("\"abc\""));
        assert_eq!(
            first.last_modified,
            Some(Utc.with_ymd_and_hms(2019, 6, 13, 8, 30, 15).unwrap())
        );
        assert_eq!(first.owner.as_ref().unwrap().id.as_deref(), Some("1250000000"));
        assert_eq!(out.contents[1].last_modified, None);
        assert_eq!(out.contents[1].owner, None);

        let prefixes: Vec<&str> = out.common_prefixes.iter().map(|p| p.prefix.as_str()).collect();
        assert_eq!(prefixes, vec!["photos/2019/", "photos/2020/"]);
    }

    #[test]
    fn test_list_buckets_document() {
        let body = br#"<ListAllMyBucketsResult>
  <Owner><ID>qcs::cam::uin/100000000001:uin/100000000001</ID><DisplayName>100000000001</DisplayName></Owner>
  <Buckets>
    <Bucket><Name>a-1250000000</Name><Location>ap-guangzhou</Location><CreationDate>2019-05-24T11:20:10Z</CreationDate></Bucket>
    <Bucket><Name>b-1250000000</Name><Location>ap-beijing</Location><CreationDate>2020-01-01T00:00:00Z</CreationDate></Bucket>
  </Buckets>
</ListAllMyBucketsResult>"#;
        let result: CosListAllMyBucketsResult = parse_xml(body, &HeaderMap::new()).unwrap();
        let out = list_buckets_output(result);
        assert_eq!(out.owner.unwrap().display_name.as_deref(), Some("100000000001"));
        assert_eq!(out.buckets.bucket.len(), 2);
        assert_eq!(out.buckets.bucket[0].name, "a-1250000000");
        assert_eq!(
            out.buckets.bucket[0].creation_date,
            Utc.with_ymd_and_hms(2019, 5, 24, 11, 20, 10).unwrap()
        );
    }

    #[test]
    fn test_malformed_list_document_is_untranslated() {
        let headers = header_map(&[(REQUEST_ID, "cos-req")]);
        let failure = parse_xml::<CosListBucketResult>(b"<ListBucketResult><MaxKeys>many", &headers)
            .unwrap_err();
        assert_eq!(failure.error.code, "ErrNotFoundError");
        assert_eq!(failure.error.request_id, "cos-req");
    }

    #[test]
    fn test_object_head_from_headers() {
        let headers = header_map(&[
            ("content-length", "5"),
            ("content-type", "text/plain"),
            ("etag", "\"5d41402abc4b2a76b9719d911017c592\""),
            ("last-modified", "Thu, 16 May 2019 03:15:06 GMT"),
            ("x-cos-meta-color", "blue"),
            ("x-cos-meta-owner-name", "alice"),
            ("x-cos-storage-class", "STANDARD_IA"),
            ("x-cos-version-id", "v1"),
        ]);
        let head = object_head(&headers);
        assert_eq!(head.content_length, Some(5));
        assert_eq!(head.content_type.as_deref(), Some("text/plain"));
        assert_eq!(
            head.last_modified,
            Some(Utc.with_ymd_and_hms(2019, 5, 16, 3, 15, 6).unwrap())
        );
        assert_eq!(head.storage_class.as_deref(), Some("STANDARD_IA"));
        assert_eq!(head.version_id.as_deref(), Some("v1"));
        let meta = head.metadata.unwrap();
        assert_eq!(meta.get("Color").map(String::as_str), Some("blue"));
        assert_eq!(meta.get("Owner-Name").map(String::as_str), Some("alice"));
    }

    #[test]
    fn test_copy_source_rewrite() {
        assert_eq!(
            cos_copy_source("/src-125/dir/a b.txt", "ap-guangzhou").as_deref(),
            Some("src-125.cos.ap-guangzhou.myqcloud.com/dir/a%20b.txt")
        );
        assert_eq!(
            cos_copy_source("src-125%2Fdir%2Fa.txt?versionId=v2", "ap-beijing").as_deref(),
            Some("src-125.cos.ap-beijing.myqcloud.com/dir/a.txt?versionId=v2")
        );
        assert_eq!(
            cos_copy_source("src-125.cos.ap-shanghai.myqcloud.com/a.txt", "ap-beijing").as_deref(),
            Some("src-125.cos.ap-shanghai.myqcloud.com/a.txt")
        );
        assert_eq!(cos_copy_source("no-key", "ap-beijing"), None);
        assert_eq!(cos_copy_source("/bucket/", "ap-beijing"), None);
    }

    #[test]
    fn test_new_requires_region() {
        let err = CosBackend::new(
            Credentials::new("ak", "sk"),
            String::new(),
            "http://service.cos.myqcloud.com".into(),
            false,
        );
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_list_objects_v2_unsupported() {
        let backend = CosBackend::new(
            Credentials::new("ak", "sk"),
            "ap-guangzhou".into(),
            "http://service.cos.myqcloud.com".into(),
            false,
        )
        .unwrap();
        let failure = backend
            .list_objects_v2(ListObjectsV2Input {
                bucket: "demo".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(failure.error.code, "ErrUnsupported");
        assert_eq!(failure.error.status, 501);
    }

    // -- Against a local fake COS endpoint -----------------------------------

    async fn fake_cos(req: Request) -> Response {
        let auth = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !auth.starts_with("q-sign-algorithm=sha1&q-ak=AKIDtest&") || !auth.contains("host") {
            return Response::builder().status(403).body(Body::empty()).unwrap();
        }

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let color = req
            .headers()
            .get("x-cos-meta-color")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match (method, path.as_str()) {
            (Method::PUT, "/demo/a.txt") => {
                let mut resp = Response::builder()
                    .status(200)
                    .header("etag", "\"5d41402abc4b2a76b9719d911017c592\"")
                    .header(REQUEST_ID, "put-req")
                    .header(TRACE_ID, "put-trace");
                if let Some(color) = color {
                    resp = resp.header("x-test-echo-color", color);
                }
                resp.body(Body::empty()).unwrap()
            }
            (Method::GET, "/demo/a.txt") => Response::builder()
                .status(200)
                .header("content-type", "text/plain")
                .header("last-modified", "Thu, 16 May 2019 03:15:06 GMT")
                .header("x-cos-meta-color", "blue")
                .header(REQUEST_ID, "get-req")
                .body(Body::from("hello"))
                .unwrap(),
            (Method::GET, "/demo/") => Response::builder()
                .status(200)
                .header("content-type", "application/xml")
                .body(Body::from(
                    "<ListBucketResult><Name>demo</Name><Prefix></Prefix><Marker></Marker>\
                     <MaxKeys>1000</MaxKeys><IsTruncated>false</IsTruncated>\
                     <Contents><Key>a.txt</Key><LastModified>2019-06-13T08:30:15.000Z</LastModified>\
                     <ETag>\"x\"</ETag><Size>5</Size><StorageClass>STANDARD</StorageClass></Contents>\
                     </ListBucketResult>",
                ))
                .unwrap(),
            _ => Response::builder()
                .status(404)
                .header(REQUEST_ID, "miss-req")
                .header(TRACE_ID, "miss-trace")
                .body(Body::from(
                    "<Error><Code>NoSuchKey</Code><Message>The specified key does not exist.</Message></Error>",
                ))
                .unwrap(),
        }
    }

    async fn fake_backend() -> CosBackend {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, axum::Router::new().fallback(fake_cos))
                .await
                .unwrap();
        });
        CosBackend::new(
            Credentials::new("AKIDtest", "secret"),
            "ap-guangzhou".into(),
            format!("http://{addr}"),
            true,
        )
        .unwrap()
        .with_bucket_url(format!("http://{addr}/{{bucket}}"))
    }

    #[tokio::test]
    async fn test_put_and_get_against_fake_endpoint() {
        let backend = fake_backend().await;

        let mut meta = Metadata::new();
        meta.insert("Color".into(), "blue".into());
        let put = backend
            .put_object(PutObjectInput {
                bucket: "demo".into(),
                key: "a.txt".into(),
                body: Some(Bytes::from_static(b"hello")),
                metadata: Some(meta),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            put.output.etag.as_deref(),
            Some("\"5d41402abc4b2a76b9719d911017c592\"")
        );
        assert_eq!(put.headers[REQUEST_ID_HEADER], "put-req");
        assert_eq!(put.headers[HOST_ID_HEADER], "put-trace");

        let get = backend
            .get_object(GetObjectInput {
                bucket: "demo".into(),
                key: "a.txt".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(get.output.body.as_deref(), Some(&b"hello"[..]));
        assert_eq!(
            get.output.head.metadata.unwrap().get("Color").map(String::as_str),
            Some("blue")
        );
        assert_eq!(get.headers[REQUEST_ID_HEADER], "get-req");
    }

    #[tokio::test]
    async fn test_list_and_missing_key_against_fake_endpoint() {
        let backend = fake_backend().await;

        let list = backend
            .list_objects(ListObjectsInput {
                bucket: "demo".into(),
                max_keys: Some(5000),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(list.output.name, "demo");
        assert_eq!(list.output.contents.len(), 1);
        assert_eq!(list.output.contents[0].key, "a.txt");

        let failure = backend
            .get_object(GetObjectInput {
                bucket: "demo".into(),
                key: "missing.txt".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(failure.error.code, "NoSuchKey");
        assert_eq!(failure.error.status, 404);
        assert_eq!(failure.headers[REQUEST_ID_HEADER], "miss-req");
        assert_eq!(failure.headers[HOST_ID_HEADER], "miss-trace");
    }

    #[tokio::test]
    async fn test_underscore_metadata_rejected_before_sending() {
        let backend = fake_backend().await;
        let mut meta = Metadata::new();
        meta.insert("Bad_key".into(), "x".into());
        let failure = backend
            .put_object(PutObjectInput {
                bucket: "demo".into(),
                key: "a.txt".into(),
                metadata: Some(meta),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(failure.error.code, "InvalidArgument");
    }
}
