//! Declarative binding between uniform operation shapes and HTTP.
//!
//! Every input/output type in [`crate::gateway::model`] carries a static
//! table of [`Field`] descriptors.  Each descriptor names where the value
//! lives on the wire (a single header, a prefixed header map, a query
//! parameter, or the payload) and holds an accessor into the struct.  The
//! two generic functions in this module, [`decode`] and [`encode`], walk
//! those tables; nothing is inspected at runtime beyond the table itself.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use std::collections::BTreeMap;
use thiserror::Error;

/// XML declaration prepended to every structured payload.
pub const XML_HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Uniform user metadata: canonical key suffix -> value.
pub type Metadata = BTreeMap<String, String>;

// ── Descriptors ─────────────────────────────────────────────────────

/// Where a field is carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// A single named header.
    Header,
    /// Every header that starts with the given prefix.
    Headers,
    /// A single named query parameter.
    QueryString,
    /// The request or response body.
    Payload,
}

/// Wire format for timestamp fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampFormat {
    /// `Mon, 02 Jan 2006 15:04:05 GMT`
    Rfc822,
    /// `2006-01-02T15:04:05Z`
    Iso8601,
    /// Seconds since the epoch.
    UnixTimestamp,
}

/// Typed accessor into a shape.
///
/// Each accessor returns a mutable reference to the `Option` slot that
/// holds the field, so the same table drives both decoding and encoding.
pub enum Slot<T> {
    Str(fn(&mut T) -> &mut Option<String>),
    Bool(fn(&mut T) -> &mut Option<bool>),
    Int(fn(&mut T) -> &mut Option<i64>),
    Float(fn(&mut T) -> &mut Option<f64>),
    Time(fn(&mut T) -> &mut Option<DateTime<Utc>>, Option<TimestampFormat>),
    Blob(fn(&mut T) -> &mut Option<Vec<u8>>),
    Json(fn(&mut T) -> &mut Option<serde_json::Value>),
    Map(fn(&mut T) -> &mut Option<Metadata>),
    Stream(fn(&mut T) -> &mut Option<Bytes>),
    /// Structured payload; the accessor renders it as an XML fragment.
    Structure(fn(&mut T) -> Result<Option<String>, CodecError>),
}

/// One row of a shape's descriptor table.
pub struct Field<T: 'static> {
    /// Field name used when reporting failures.
    pub name: &'static str,
    pub location: Location,
    /// Header name, header prefix, or query parameter name.
    pub location_name: &'static str,
    pub slot: Slot<T>,
}

impl<T> Field<T> {
    pub const fn header(name: &'static str, location_name: &'static str, slot: Slot<T>) -> Self {
        Self {
            name,
            location: Location::Header,
            location_name,
            slot,
        }
    }

    pub const fn headers(name: &'static str, prefix: &'static str, slot: Slot<T>) -> Self {
        Self {
            name,
            location: Location::Headers,
            location_name: prefix,
            slot,
        }
    }

    pub const fn query(name: &'static str, location_name: &'static str, slot: Slot<T>) -> Self {
        Self {
            name,
            location: Location::QueryString,
            location_name,
            slot,
        }
    }

    pub const fn payload(name: &'static str, slot: Slot<T>) -> Self {
        Self {
            name,
            location: Location::Payload,
            location_name: "",
            slot,
        }
    }
}

/// A uniform struct that can be bound to HTTP.
pub trait Shape: Sized + 'static {
    /// The descriptor table, built at compile time.
    const FIELDS: &'static [Field<Self>];
}

// ── Errors ──────────────────────────────────────────────────────────

/// A single field that failed to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Field name from the descriptor.
    pub field: &'static str,
    /// Wire name (header or query parameter).
    pub location_name: &'static str,
    /// Raw value that failed to convert.
    pub value: String,
    pub reason: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.field, self.location_name, self.reason)
    }
}

/// Hard failure while encoding a response.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported payload type for field {field}")]
    UnsupportedPayload { field: &'static str },

    #[error("unsupported value type for field {field} at {location:?}")]
    UnsupportedValue {
        field: &'static str,
        location: Location,
    },

    #[error("invalid header value for field {field}")]
    InvalidHeader { field: &'static str },

    #[error("unable to encode JSON value for field {field}: {source}")]
    Json {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("unable to serialize XML payload: {0}")]
    Xml(String),
}

// ── Request side ────────────────────────────────────────────────────

/// Borrowed view of the parts of a request the codec reads.
pub struct RequestParts<'a> {
    pub headers: &'a HeaderMap,
    /// Decoded query pairs in request order.
    pub query: &'a [(String, String)],
    /// Request body; bound fields receive a cheap clone of the handle so
    /// the body can still be read afterwards.
    pub body: &'a Bytes,
}

impl RequestParts<'_> {
    fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn header_value(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
    }
}

/// Bind request values into `target`.
///
/// Conversion failures are collected per field and do not stop decoding of
/// the remaining fields.  An absent header or query parameter leaves the
/// slot untouched; a present but empty one only binds string fields.
pub fn decode<T: Shape>(target: &mut T, parts: &RequestParts<'_>) -> Vec<FieldError> {
    let mut errors = Vec::new();

    for field in T::FIELDS {
        let result = match field.location {
            Location::Header => match parts.header_value(field.location_name) {
                Some(raw) => set_value(target, field, &raw),
                None => Ok(()),
            },
            Location::QueryString => match parts.query_value(field.location_name) {
                Some(raw) => set_value(target, field, raw),
                None => Ok(()),
            },
            Location::Headers => decode_header_map(target, field, parts.headers),
            Location::Payload => decode_payload(target, field, parts.body),
        };

        if let Err((value, reason)) = result {
            errors.push(FieldError {
                field: field.name,
                location_name: field.location_name,
                value,
                reason,
            });
        }
    }

    errors
}

type DecodeResult = Result<(), (String, String)>;

fn set_value<T>(target: &mut T, field: &Field<T>, raw: &str) -> DecodeResult {
    let fail = |reason: String| (raw.to_string(), reason);

    if raw.is_empty() && !matches!(field.slot, Slot::Str(_)) {
        return Ok(());
    }

    match &field.slot {
        Slot::Str(get) => *get(target) = Some(raw.to_string()),
        Slot::Bool(get) => *get(target) = Some(parse_bool(raw).ok_or_else(|| fail("invalid boolean".into()))?),
        Slot::Int(get) => {
            *get(target) = Some(raw.trim().parse::<i64>().map_err(|e| fail(e.to_string()))?)
        }
        Slot::Float(get) => {
            *get(target) = Some(raw.trim().parse::<f64>().map_err(|e| fail(e.to_string()))?)
        }
        Slot::Time(get, format) => {
            let format = format.unwrap_or(TimestampFormat::Rfc822);
            *get(target) = Some(parse_time(raw, format).ok_or_else(|| fail("invalid timestamp".into()))?)
        }
        Slot::Blob(get) => {
            *get(target) = Some(BASE64.decode(raw.trim()).map_err(|e| fail(e.to_string()))?)
        }
        Slot::Json(get) => {
            let escaped = field.location == Location::Header;
            *get(target) = Some(decode_json(raw, escaped).map_err(fail)?)
        }
        Slot::Map(_) | Slot::Stream(_) | Slot::Structure(_) => {
            return Err(fail(format!(
                "unsupported value type at {:?}",
                field.location
            )))
        }
    }
    Ok(())
}

fn decode_header_map<T>(target: &mut T, field: &Field<T>, headers: &HeaderMap) -> DecodeResult {
    let Slot::Map(get) = &field.slot else {
        return Err((String::new(), "headers location requires a map field".into()));
    };

    let prefix = field.location_name.to_ascii_lowercase();
    let mut out = Metadata::new();
    for name in headers.keys() {
        let lower = name.as_str();
        if lower.len() > prefix.len() && lower.starts_with(&prefix) {
            // First value wins when a header repeats.
            if let Some(value) = headers.get(name) {
                out.insert(
                    canonical_header_key(&lower[prefix.len()..]),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                );
            }
        }
    }

    if !out.is_empty() {
        *get(target) = Some(out);
    }
    Ok(())
}

fn decode_payload<T>(target: &mut T, field: &Field<T>, body: &Bytes) -> DecodeResult {
    match &field.slot {
        // Structured bodies are parsed by the caller.
        Slot::Structure(_) => Ok(()),
        Slot::Stream(get) => {
            *get(target) = Some(body.clone());
            Ok(())
        }
        Slot::Str(get) => {
            *get(target) = Some(String::from_utf8_lossy(body).into_owned());
            Ok(())
        }
        _ => Err((String::new(), "unknown payload type".into())),
    }
}

// ── Response side ───────────────────────────────────────────────────

/// HTTP pieces produced from an output shape.
#[derive(Debug, Default)]
pub struct Encoded {
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// Write every set field of `source` onto response headers and body.
///
/// Header values are trimmed.  A structured payload is rendered as XML
/// with the XML declaration prepended.  A payload field whose type cannot
/// be written is a hard error.
pub fn encode<T: Shape>(mut source: T) -> Result<Encoded, CodecError> {
    let mut out = Encoded::default();

    for field in T::FIELDS {
        match field.location {
            Location::Header => {
                if let Some(value) = format_value(&mut source, field)? {
                    append_header(&mut out.headers, field.name, field.location_name, &value)?;
                }
            }
            Location::Headers => {
                let Slot::Map(get) = &field.slot else {
                    return Err(CodecError::UnsupportedValue {
                        field: field.name,
                        location: field.location,
                    });
                };
                if let Some(map) = get(&mut source).take() {
                    for (key, value) in map {
                        let name = format!("{}{}", field.location_name, key.trim());
                        append_header(&mut out.headers, field.name, &name, &value)?;
                    }
                }
            }
            Location::Payload => encode_payload(&mut source, field, &mut out)?,
            // Responses never carry query parameters.
            Location::QueryString => {}
        }
    }

    Ok(out)
}

fn encode_payload<T>(source: &mut T, field: &Field<T>, out: &mut Encoded) -> Result<(), CodecError> {
    match &field.slot {
        Slot::Stream(get) => {
            if let Some(body) = get(source).take() {
                out.body = Some(body);
            }
        }
        Slot::Str(get) => {
            if let Some(text) = get(source).take() {
                out.body = Some(Bytes::from(text));
            }
        }
        Slot::Structure(render) => {
            if let Some(fragment) = render(source)? {
                out.body = Some(Bytes::from(format!("{XML_HEADER}{fragment}")));
                out.headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/xml"));
            }
        }
        _ => return Err(CodecError::UnsupportedPayload { field: field.name }),
    }
    Ok(())
}

fn format_value<T>(source: &mut T, field: &Field<T>) -> Result<Option<String>, CodecError> {
    let value = match &field.slot {
        Slot::Str(get) => get(source).take(),
        Slot::Bool(get) => get(source).map(|b| b.to_string()),
        Slot::Int(get) => get(source).map(|i| i.to_string()),
        Slot::Float(get) => get(source).map(|f| f.to_string()),
        Slot::Time(get, format) => {
            let format = format.unwrap_or(match field.location {
                Location::QueryString => TimestampFormat::Iso8601,
                _ => TimestampFormat::Rfc822,
            });
            get(source).map(|t| format_time(&t, format))
        }
        Slot::Blob(get) => get(source).take().map(|b| BASE64.encode(b)),
        Slot::Json(get) => match get(source).take() {
            Some(value) if !is_empty_json(&value) => {
                let escaped = field.location == Location::Header;
                Some(encode_json(&value, escaped).map_err(|source| CodecError::Json {
                    field: field.name,
                    source,
                })?)
            }
            _ => None,
        },
        Slot::Map(_) | Slot::Stream(_) | Slot::Structure(_) => {
            return Err(CodecError::UnsupportedValue {
                field: field.name,
                location: field.location,
            })
        }
    };
    Ok(value)
}

fn append_header(
    headers: &mut HeaderMap,
    field: &'static str,
    name: &str,
    value: &str,
) -> Result<(), CodecError> {
    let name = HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|_| CodecError::InvalidHeader { field })?;
    let value =
        HeaderValue::from_str(value.trim()).map_err(|_| CodecError::InvalidHeader { field })?;
    headers.append(name, value);
    Ok(())
}

// ── Conversions ─────────────────────────────────────────────────────

/// Canonical MIME header key: `content-type` -> `Content-Type`.
pub fn canonical_header_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = true;
    for ch in key.chars() {
        if upper {
            out.extend(ch.to_uppercase());
        } else {
            out.extend(ch.to_lowercase());
        }
        upper = ch == '-';
    }
    out
}

/// Accepts the same spellings as Go's `strconv.ParseBool`.
fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Parse a timestamp in the given wire format.
pub fn parse_time(raw: &str, format: TimestampFormat) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    match format {
        TimestampFormat::Rfc822 => DateTime::parse_from_rfc2822(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        TimestampFormat::Iso8601 => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        TimestampFormat::UnixTimestamp => {
            let secs: f64 = raw.parse().ok()?;
            if !secs.is_finite() {
                return None;
            }
            let floor = secs.floor();
            let mut whole = floor as i64;
            let mut nanos = ((secs - floor) * 1e9).round() as u32;
            if nanos >= 1_000_000_000 {
                whole += 1;
                nanos = 0;
            }
            Utc.timestamp_opt(whole, nanos).single()
        }
    }
}

/// Format a timestamp in the given wire format.
pub fn format_time(t: &DateTime<Utc>, format: TimestampFormat) -> String {
    match format {
        TimestampFormat::Rfc822 => t.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        TimestampFormat::Iso8601 => t.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        TimestampFormat::UnixTimestamp => t.timestamp().to_string(),
    }
}

fn decode_json(raw: &str, base64_escaped: bool) -> Result<serde_json::Value, String> {
    let bytes = if base64_escaped {
        BASE64.decode(raw.trim()).map_err(|e| e.to_string())?
    } else {
        raw.as_bytes().to_vec()
    };
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

fn encode_json(value: &serde_json::Value, base64_escaped: bool) -> Result<String, serde_json::Error> {
    let text = serde_json::to_string(value)?;
    Ok(if base64_escaped {
        BASE64.encode(text)
    } else {
        text
    })
}

fn is_empty_json(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

// ── Tests ───────────────────────────────────────────────────────────
