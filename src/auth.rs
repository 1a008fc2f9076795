//! AWS Signature Version 4 authentication.
//!
//! Two pieces live here:
//! - [`classify`] decides which authentication scheme a request uses.
//! - [`SignatureEngine`] builds canonical requests, derives signing keys
//!   and verifies header-signed requests and presigned URLs.
//!
//! The algorithm follows the AWS SigV4 specification:
//! 1. Build a canonical request
//! 2. Build a string-to-sign
//! 3. Derive a signing key via HMAC chain
//! 4. Compute and compare the signature

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use http::{HeaderMap, Method};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Signing algorithm name.
pub const SIGN_V4_ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Payload token for presigned URLs.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// `x-amz-content-sha256` value announcing chunked streaming uploads.
pub const STREAMING_PAYLOAD: &str = "STREAMING-AWS4-HMAC-SHA256-PAYLOAD";

/// Service name in the credential scope.
const SERVICE: &str = "s3";

/// Clock skew tolerance for header-based auth, in seconds.
pub const MAX_SKEW_SECS: i64 = 900;

/// Maximum presigned URL expiration (7 days).
const MAX_PRESIGNED_EXPIRES: i64 = 604_800;

/// Basic ISO8601 format used by `X-Amz-Date`.
pub const ISO8601_BASIC: &str = "%Y%m%dT%H%M%SZ";

/// Presigned query parameters.
const AMZ_ALGORITHM: &str = "X-Amz-Algorithm";
const AMZ_CREDENTIAL: &str = "X-Amz-Credential";
const AMZ_DATE: &str = "X-Amz-Date";
const AMZ_EXPIRES: &str = "X-Amz-Expires";
const AMZ_SIGNED_HEADERS: &str = "X-Amz-SignedHeaders";
const AMZ_SIGNATURE: &str = "X-Amz-Signature";

/// Everything except the RFC 3986 unreserved set.
const S3_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Same as [`S3_ENCODE`] but keeps `/` literal, for paths.
const S3_ENCODE_PATH: &AsciiSet = &S3_ENCODE.remove(b'/');

// ── Errors ──────────────────────────────────────────────────────────

/// Why a request failed authentication.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed authorization: {0}")]
    MalformedAuthorization(String),

    #[error("access key does not match the signing credential")]
    AccessKeyMismatch,

    #[error("request carries neither X-Amz-Date nor Date")]
    MissingDate,

    #[error("request date is malformed")]
    MalformedDate,

    #[error("request time {request_time} is too far from server time {server_time}")]
    RequestTimeTooSkewed {
        request_time: DateTime<Utc>,
        server_time: DateTime<Utc>,
    },

    #[error("signature does not match")]
    SignatureMismatch,

    #[error("missing presigned query parameters")]
    InvalidQueryParams,

    #[error("unsupported presigned signature algorithm")]
    InvalidQuerySignatureAlgo,

    #[error("malformed X-Amz-Date")]
    MalformedPresignedDate,

    #[error("X-Amz-Expires is not a number")]
    MalformedExpires,

    #[error("X-Amz-Expires is negative")]
    NegativeExpires,

    #[error("X-Amz-Expires exceeds one week")]
    MaximumExpires,

    #[error("presigned request is not valid yet")]
    RequestNotReadyYet,

    #[error("presigned request has expired")]
    ExpiredPresignRequest,
}

// ── Classification ──────────────────────────────────────────────────

/// Authentication scheme of an incoming request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Anonymous,
    SignedV4,
    PresignedV4,
    SignedV2,
    PresignedV2,
    StreamingSignedV4,
    PostPolicySignedV4,
    Sts,
    Unknown,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::Anonymous => "anonymous",
            AuthType::SignedV4 => "signed-v4",
            AuthType::PresignedV4 => "presigned-v4",
            AuthType::SignedV2 => "signed-v2",
            AuthType::PresignedV2 => "presigned-v2",
            AuthType::StreamingSignedV4 => "streaming-signed-v4",
            AuthType::PostPolicySignedV4 => "post-policy",
            AuthType::Sts => "sts",
            AuthType::Unknown => "unknown",
        }
    }
}

/// Classify a request by its authentication material.  First match wins.
pub fn classify(method: &Method, headers: &HeaderMap, query: &[(String, String)]) -> AuthType {
    let authorization = header_str(headers, "authorization");
    let has_query = |name: &str| query.iter().any(|(k, _)| k == name);

    if let Some(auth) = authorization {
        if !auth.starts_with(SIGN_V4_ALGORITHM) && auth.starts_with("AWS") {
            return AuthType::SignedV2;
        }
    }
    if has_query("AWSAccessKeyId") {
        return AuthType::PresignedV2;
    }
    if header_str(headers, "x-amz-content-sha256") == Some(STREAMING_PAYLOAD)
        && *method == Method::PUT
    {
        return AuthType::StreamingSignedV4;
    }
    if authorization.is_some_and(|a| a.starts_with(SIGN_V4_ALGORITHM)) {
        return AuthType::SignedV4;
    }
    if has_query(AMZ_CREDENTIAL) {
        return AuthType::PresignedV4;
    }
    if header_str(headers, "content-type").is_some_and(|c| c.contains("multipart/form-data"))
        && *method == Method::POST
    {
        return AuthType::PostPolicySignedV4;
    }
    if has_query("Action") {
        return AuthType::Sts;
    }
    if authorization.is_none() {
        return AuthType::Anonymous;
    }
    AuthType::Unknown
}

// ── Parsed authorization ────────────────────────────────────────────

/// The (Credential, SignedHeaders, Signature) triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationHeaderFields {
    pub access_key_id: String,
    /// YYYYMMDD
    pub date_stamp: String,
    pub region: String,
    pub service: String,
    /// Lowercase header names, in the order given.
    pub signed_headers: Vec<String>,
    /// Hex signature.
    pub signature: String,
}

impl AuthorizationHeaderFields {
    /// Parse an `Authorization` header value.
    ///
    /// ```text
    /// AWS4-HMAC-SHA256 Credential=AKID/20130524/us-east-1/s3/aws4_request, SignedHeaders=host;x-amz-date, Signature=abcdef...
    /// ```
    pub fn parse(header: &str) -> Result<Self, AuthError> {
        let rest = header
            .strip_prefix(SIGN_V4_ALGORITHM)
            .and_then(|r| r.strip_prefix(' '))
            .ok_or_else(|| malformed("missing AWS4-HMAC-SHA256 prefix"))?;
        let rest: String = rest.chars().filter(|c| *c != ' ').collect();

        let fields: Vec<&str> = rest.split(',').collect();
        if fields.len() != 3 {
            return Err(malformed("expected Credential, SignedHeaders and Signature"));
        }

        let mut credential = None;
        let mut signed_headers = None;
        let mut signature = None;
        for field in fields {
            let kv: Vec<&str> = field.split('=').collect();
            if kv.len() != 2 {
                return Err(malformed("field is not key=value"));
            }
            match kv[0] {
                "Credential" => credential = Some(kv[1]),
                "SignedHeaders" => signed_headers = Some(kv[1]),
                "Signature" => signature = Some(kv[1]),
                other => return Err(malformed(&format!("unexpected field {other}"))),
            }
        }

        Self::from_parts(
            credential.ok_or_else(|| malformed("missing Credential"))?,
            signed_headers.ok_or_else(|| malformed("missing SignedHeaders"))?,
            signature.ok_or_else(|| malformed("missing Signature"))?,
        )
    }

    /// Rebuild the fields from presigned query parameters.
    pub fn from_presigned_query(query: &[(String, String)]) -> Result<Self, AuthError> {
        let get = |name: &str| {
            query
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .ok_or(AuthError::InvalidQueryParams)
        };
        Self::from_parts(
            get(AMZ_CREDENTIAL)?,
            get(AMZ_SIGNED_HEADERS)?,
            get(AMZ_SIGNATURE)?,
        )
    }

    fn from_parts(credential: &str, signed_headers: &str, signature: &str) -> Result<Self, AuthError> {
        let parts: Vec<&str> = credential.split('/').collect();
        if parts.len() != 5 || parts[4] != "aws4_request" || parts[0].is_empty() {
            return Err(malformed("invalid Credential scope"));
        }
        if signed_headers.is_empty() || signature.is_empty() {
            return Err(malformed("empty SignedHeaders or Signature"));
        }
        Ok(Self {
            access_key_id: parts[0].to_string(),
            date_stamp: parts[1].to_string(),
            region: parts[2].to_string(),
            service: parts[3].to_string(),
            signed_headers: signed_headers
                .split(';')
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            signature: signature.to_string(),
        })
    }
}

fn malformed(reason: &str) -> AuthError {
    AuthError::MalformedAuthorization(reason.to_string())
}

// ── Signing context ─────────────────────────────────────────────────

/// Read-only view of one request for canonicalization.
#[derive(Debug, Clone, Copy)]
pub struct SigningContext<'a> {
    pub method: &'a str,
    /// Raw (possibly percent-encoded) path.
    pub path: &'a str,
    /// Raw query string without the leading `?`.
    pub raw_query: &'a str,
    pub headers: &'a HeaderMap,
    /// Host used when the request has no `Host` header (HTTP/2).
    pub authority: Option<&'a str>,
    pub body: &'a [u8],
}

/// How the payload enters the canonical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadMode {
    /// Header signing: hash of the body.
    Hashed,
    /// Query signing: [`UNSIGNED_PAYLOAD`].
    Unsigned,
}

impl SigningContext<'_> {
    fn payload_hash(&self, mode: PayloadMode) -> String {
        match mode {
            PayloadMode::Unsigned => UNSIGNED_PAYLOAD.to_string(),
            PayloadMode::Hashed => {
                if header_str(self.headers, "x-amz-content-sha256") == Some(UNSIGNED_PAYLOAD) {
                    UNSIGNED_PAYLOAD.to_string()
                } else {
                    hex::encode(Sha256::digest(self.body))
                }
            }
        }
    }

    /// Effective request time: `X-Amz-Date`, else `Date`.
    pub fn request_time(&self) -> Result<DateTime<Utc>, AuthError> {
        if let Some(amz) = header_str(self.headers, "x-amz-date") {
            return parse_iso8601_basic(amz).ok_or(AuthError::MalformedDate);
        }
        if let Some(date) = header_str(self.headers, "date") {
            return httpdate::parse_http_date(date)
                .map(DateTime::<Utc>::from)
                .map_err(|_| AuthError::MalformedDate);
        }
        Err(AuthError::MissingDate)
    }
}

// ── Canonical request construction ──────────────────────────────────

/// Canonical URI: decode, clean `.`/`..`, re-encode with `/` kept.
pub fn canonical_uri(raw_path: &str) -> String {
    let decoded = percent_decode_str(raw_path).decode_utf8_lossy();
    let mut segments: Vec<&str> = Vec::new();
    for seg in decoded.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut cleaned = format!("/{}", segments.join("/"));
    if decoded.ends_with('/') && cleaned != "/" {
        cleaned.push('/');
    }
    utf8_percent_encode(&cleaned, S3_ENCODE_PATH).to_string()
}

/// Canonical query string: S3-encode every key and value, sort the
/// `key=value` pairs.  `X-Amz-Signature` is dropped when `presigned`.
pub fn canonical_query(raw_query: &str, presigned: bool) -> String {
    let mut pairs: Vec<String> = parse_raw_query(raw_query)
        .into_iter()
        .filter(|(k, _)| !(presigned && k == AMZ_SIGNATURE))
        .map(|(k, v)| format!("{}={}", s3_encode(&k), s3_encode(&v)))
        .collect();
    pairs.sort();
    pairs.join("&")
}

/// Canonical header block and the signed-header list.
///
/// With `signed` the named headers are used, otherwise every header on
/// the request.  Returns `(headers, "h1;h2;...")`; the header block has
/// no trailing newline.
pub fn canonical_headers(ctx: &SigningContext<'_>, signed: Option<&[String]>) -> (String, String) {
    let mut all: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in ctx.headers {
        all.entry(name.as_str().to_string())
            .or_default()
            .push(collapse_whitespace(&String::from_utf8_lossy(value.as_bytes())));
    }
    if !all.contains_key("host") {
        if let Some(authority) = ctx.authority {
            all.insert("host".to_string(), vec![authority.to_string()]);
        }
    }

    let names: Vec<String> = match signed {
        Some(list) => {
            let mut names: Vec<String> = list.iter().map(|n| n.to_ascii_lowercase()).collect();
            names.sort();
            names.dedup();
            names
        }
        None => all.keys().cloned().collect(),
    };

    let block = names
        .iter()
        .map(|name| {
            let mut values = all.get(name).cloned().unwrap_or_default();
            values.sort();
            format!("{name}:{}", values.join(","))
        })
        .collect::<Vec<_>>()
        .join("\n");

    (block, names.join(";"))
}

fn canonical_request(
    ctx: &SigningContext<'_>,
    signed: Option<&[String]>,
    mode: PayloadMode,
) -> (String, String) {
    let (headers, signed_list) = canonical_headers(ctx, signed);
    let request = format!(
        "{}\n{}\n{}\n{}\n\n{}\n{}",
        ctx.method,
        canonical_uri(ctx.path),
        canonical_query(ctx.raw_query, mode == PayloadMode::Unsigned),
        headers,
        signed_list,
        ctx.payload_hash(mode),
    );
    (request, signed_list)
}

// ── String to sign & signing key ────────────────────────────────────

/// `YYYYMMDD/region/s3/aws4_request`
pub fn credential_scope(t: &DateTime<Utc>, region: &str) -> String {
    format!("{}/{region}/{SERVICE}/aws4_request", t.format("%Y%m%d"))
}

/// Build the string to sign.
///
/// ```text
/// AWS4-HMAC-SHA256 + '\n' +
/// Timestamp + '\n' +
/// CredentialScope + '\n' +
/// HexEncode(SHA256(CanonicalRequest))
/// ```
pub fn string_to_sign(t: &DateTime<Utc>, scope: &str, canonical_request: &str) -> String {
    let hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    format!(
        "{SIGN_V4_ALGORITHM}\n{}\n{scope}\n{hash}",
        t.format(ISO8601_BASIC)
    )
}

/// Derive the signing key.
///
/// ```text
/// kDate    = HMAC-SHA256("AWS4" + secret, dateStamp)
/// kRegion  = HMAC-SHA256(kDate, region)
/// kService = HMAC-SHA256(kRegion, "s3")
/// kSigning = HMAC-SHA256(kService, "aws4_request")
/// ```
pub fn derive_signing_key(secret_key: &str, t: &DateTime<Utc>, region: &str) -> Vec<u8> {
    let date = t.format("%Y%m%d").to_string();
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Compare two strings in constant time.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// ── Signature engine ────────────────────────────────────────────────

/// Signs and verifies requests for one credential in one region.
#[derive(Debug, Clone, Copy)]
pub struct SignatureEngine<'a> {
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub region: &'a str,
}

impl<'a> SignatureEngine<'a> {
    pub fn new(access_key: &'a str, secret_key: &'a str, region: &'a str) -> Self {
        Self {
            access_key,
            secret_key,
            region,
        }
    }

    fn signature(
        &self,
        ctx: &SigningContext<'_>,
        t: &DateTime<Utc>,
        signed: Option<&[String]>,
        mode: PayloadMode,
    ) -> (String, String) {
        let (request, signed_list) = canonical_request(ctx, signed, mode);
        let scope = credential_scope(t, self.region);
        let sts = string_to_sign(t, &scope, &request);
        let key = derive_signing_key(self.secret_key, t, self.region);
        (hex::encode(hmac_sha256(&key, sts.as_bytes())), signed_list)
    }

    /// `Authorization` header value for the request at time `t`.
    pub fn authorization(
        &self,
        ctx: &SigningContext<'_>,
        t: &DateTime<Utc>,
        signed: Option<&[String]>,
    ) -> String {
        let (signature, signed_list) = self.signature(ctx, t, signed, PayloadMode::Hashed);
        format!(
            "{SIGN_V4_ALGORITHM} Credential={}/{}, SignedHeaders={signed_list}, Signature={signature}",
            self.access_key,
            credential_scope(t, self.region),
        )
    }

    /// Verify a header-signed request.
    pub fn verify_header(&self, ctx: &SigningContext<'_>, now: DateTime<Utc>) -> Result<(), AuthError> {
        let received = header_str(ctx.headers, "authorization")
            .ok_or_else(|| malformed("missing Authorization header"))?;
        let fields = AuthorizationHeaderFields::parse(received)?;
        if fields.access_key_id != self.access_key {
            return Err(AuthError::AccessKeyMismatch);
        }

        let t = ctx.request_time()?;
        if (t - now).num_milliseconds().abs() > MAX_SKEW_SECS * 1000 {
            return Err(AuthError::RequestTimeTooSkewed {
                request_time: t,
                server_time: now,
            });
        }

        let expected = self.authorization(ctx, &t, Some(&fields.signed_headers));
        if constant_time_eq(&compact(&expected), &compact(received)) {
            Ok(())
        } else {
            Err(AuthError::SignatureMismatch)
        }
    }

    /// Verify a presigned (query-signed) request.
    pub fn verify_presigned(&self, ctx: &SigningContext<'_>, now: DateTime<Utc>) -> Result<(), AuthError> {
        let query = parse_raw_query(ctx.raw_query);
        let get = |name: &str| query.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());

        let required = [
            AMZ_ALGORITHM,
            AMZ_CREDENTIAL,
            AMZ_DATE,
            AMZ_EXPIRES,
            AMZ_SIGNED_HEADERS,
            AMZ_SIGNATURE,
        ];
        if required.iter().any(|name| get(name).is_none()) {
            return Err(AuthError::InvalidQueryParams);
        }

        if get(AMZ_ALGORITHM) != Some(SIGN_V4_ALGORITHM) {
            return Err(AuthError::InvalidQuerySignatureAlgo);
        }
        let t = get(AMZ_DATE)
            .and_then(parse_iso8601_basic)
            .ok_or(AuthError::MalformedPresignedDate)?;
        let expires: i64 = get(AMZ_EXPIRES)
            .unwrap_or_default()
            .parse()
            .map_err(|_| AuthError::MalformedExpires)?;
        if expires < 0 {
            return Err(AuthError::NegativeExpires);
        }
        if expires > MAX_PRESIGNED_EXPIRES {
            return Err(AuthError::MaximumExpires);
        }

        let fields = AuthorizationHeaderFields::from_presigned_query(&query)
            .map_err(|_| AuthError::InvalidQueryParams)?;
        if fields.access_key_id != self.access_key {
            return Err(AuthError::AccessKeyMismatch);
        }

        if t > now + max_skew() {
            return Err(AuthError::RequestNotReadyYet);
        }
        if now - t > Duration::seconds(expires) {
            return Err(AuthError::ExpiredPresignRequest);
        }

        let (expected, _) = self.signature(ctx, &t, Some(&fields.signed_headers), PayloadMode::Unsigned);
        if constant_time_eq(&expected, &fields.signature) {
            Ok(())
        } else {
            Err(AuthError::ExpiredPresignRequest)
        }
    }

    /// Presign `ctx` at time `t`, returning the full query string with
    /// the `X-Amz-*` parameters and signature appended to
    /// `ctx.raw_query`.
    pub fn presign(&self, ctx: &SigningContext<'_>, t: &DateTime<Utc>, expires: i64) -> String {
        let signed = vec!["host".to_string()];
        let credential = format!("{}/{}", self.access_key, credential_scope(t, self.region));
        let mut query = ctx.raw_query.to_string();
        for (k, v) in [
            (AMZ_ALGORITHM, SIGN_V4_ALGORITHM.to_string()),
            (AMZ_CREDENTIAL, credential),
            (AMZ_DATE, t.format(ISO8601_BASIC).to_string()),
            (AMZ_EXPIRES, expires.to_string()),
            (AMZ_SIGNED_HEADERS, signed.join(";")),
        ] {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(&format!("{k}={}", s3_encode(&v)));
        }

        let unsigned = SigningContext {
            raw_query: &query,
            ..*ctx
        };
        let (signature, _) = self.signature(&unsigned, t, Some(&signed), PayloadMode::Unsigned);
        format!("{query}&{AMZ_SIGNATURE}={signature}")
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// S3 URI encoding: everything but `A-Za-z0-9-_.~`, uppercase hex.
pub fn s3_encode(input: &str) -> String {
    utf8_percent_encode(input, S3_ENCODE).to_string()
}

/// Split and percent-decode a raw query string.  Keys without `=` get an
/// empty value; `+` decodes to a space.
pub fn parse_raw_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (k, v) = part.split_once('=').unwrap_or((part, ""));
            (query_decode(k), query_decode(v))
        })
        .collect()
}

fn query_decode(s: &str) -> String {
    percent_decode_str(&s.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

/// Parse `YYYYMMDDTHHMMSSZ`.
pub fn parse_iso8601_basic(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, ISO8601_BASIC)
        .ok()
        .map(|t| t.and_utc())
}

fn max_skew() -> Duration {
    Duration::seconds(MAX_SKEW_SECS)
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Trim and collapse runs of whitespace to one space.
fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Authorization value with spaces after the algorithm removed, so that
/// `a, b` and `a,b` separators compare equal.
fn compact(auth: &str) -> String {
    match auth.strip_prefix(SIGN_V4_ALGORITHM) {
        Some(rest) => {
            let rest: String = rest.chars().filter(|c| *c != ' ').collect();
            format!("{SIGN_V4_ALGORITHM} {rest}")
        }
        None => auth.to_string(),
    }
}

// ── Tests ───────────────────────────────────────────────────────────
