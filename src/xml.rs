//! S3 XML rendering and request-body parsing.
//!
//! Error documents and small fixed results are written event by event
//! with `quick-xml`'s writer.  List results go through `quick_xml::se`
//! and [`format_result_xml`], which renames the root element the same way
//! the reference service does.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize, Serializer};
use std::io::Cursor;

use crate::codec::{CodecError, XML_HEADER};

/// Namespace attached to S3 result documents.
pub const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

// ── Error response ──────────────────────────────────────────────────

/// Fields of an S3 `<Error>` document.  Optional members are omitted
/// when `None`.
#[derive(Debug, Default)]
pub struct ErrorDocument<'a> {
    pub code: &'a str,
    pub message: &'a str,
    pub request_time: Option<&'a str>,
    pub server_time: Option<&'a str>,
    pub max_allowed_skew_ms: Option<i64>,
    pub argument_name: Option<&'a str>,
    pub argument_value: Option<&'a str>,
    pub request_id: &'a str,
    pub host_id: &'a str,
}

/// Render an S3 `<Error>` XML document.
///
/// ```xml
/// <?xml version="1.0" encoding="UTF-8"?>
/// <Error>
///   <Code>NoSuchBucket</Code>
///   <Message>The specified bucket does not exist</Message>
///   <RequestId>4442587FB7D0A2F9</RequestId>
///   <HostId>5f1c...</HostId>
/// </Error>
/// ```
pub fn render_error(doc: &ErrorDocument<'_>) -> String {
    let mut writer = new_writer();

    writer
        .write_event(Event::Start(BytesStart::new("Error")))
        .expect("start Error");
    write_text_element(&mut writer, "Code", doc.code);
    write_text_element(&mut writer, "Message", doc.message);

    let skew = doc.max_allowed_skew_ms.map(|ms| ms.to_string());
    let optional = [
        ("RequestTime", doc.request_time),
        ("ServerTime", doc.server_time),
        ("MaxAllowedSkewMilliseconds", skew.as_deref()),
        ("ArgumentName", doc.argument_name),
        ("ArgumentValue", doc.argument_value),
    ];
    for (tag, value) in optional {
        if let Some(value) = value {
            write_text_element(&mut writer, tag, value);
        }
    }

    write_text_element(&mut writer, "RequestId", doc.request_id);
    write_text_element(&mut writer, "HostId", doc.host_id);
    writer
        .write_event(Event::End(BytesEnd::new("Error")))
        .expect("end Error");

    finish(writer)
}

// ── Serde-backed results ────────────────────────────────────────────

/// Serialize `value` as a top-level result document named `result_name`.
///
/// The type's own element name is replaced by `result_name`, the S3
/// namespace is added when `with_xmlns` is set, and escaped quotes are
/// written as `&quot;`.
pub fn format_result_xml<T: Serialize>(
    value: &T,
    result_name: &str,
    with_xmlns: bool,
) -> Result<String, CodecError> {
    let body = quick_xml::se::to_string(value).map_err(|e| CodecError::Xml(e.to_string()))?;

    let natural = type_element_name::<T>();
    let open = if with_xmlns {
        format!(r#"<{result_name} xmlns="{S3_XMLNS}">"#)
    } else {
        format!("<{result_name}>")
    };

    let body = if let Some(rest) = body.strip_prefix(&format!("<{natural}>")) {
        let inner = rest
            .strip_suffix(&format!("</{natural}>"))
            .unwrap_or(rest);
        format!("{open}{inner}</{result_name}>")
    } else if body == format!("<{natural}/>") {
        format!("{open}</{result_name}>")
    } else {
        body
    };

    Ok(format!("{XML_HEADER}{}", body.replace("&#34;", "&quot;")))
}

/// Serialize `value` as an XML fragment rooted at `root`, without the
/// XML declaration.
pub fn to_xml_fragment<T: Serialize>(value: &T, root: &str) -> Result<String, CodecError> {
    quick_xml::se::to_string_with_root(root, value)
        .map(|s| s.replace("&#34;", "&quot;"))
        .map_err(|e| CodecError::Xml(e.to_string()))
}

/// Last path segment of the type name, which is what `quick_xml::se`
/// uses as the root element.
fn type_element_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// `serialize_with` helper: S3 list timestamps, `2019-06-13T08:30:15.000Z`.
pub fn iso8601_millis<S: Serializer>(
    t: &chrono::DateTime<chrono::Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}

/// `serialize_with` helper for optional timestamps.
pub fn iso8601_millis_opt<S: Serializer>(
    t: &Option<chrono::DateTime<chrono::Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match t {
        Some(t) => iso8601_millis(t, serializer),
        None => serializer.serialize_none(),
    }
}

// ── CreateApplicationResult ─────────────────────────────────────────

/// Render the `<CreateApplicationResult>` returned by `PUT /`.
pub fn render_create_application_result(access_key: &str, secret_key: &str) -> String {
    let mut writer = new_writer();

    let root = BytesStart::new("CreateApplicationResult").with_attributes([("xmlns", S3_XMLNS)]);
    writer.write_event(Event::Start(root)).expect("start root");
    write_text_element(&mut writer, "AccessKey", access_key);
    write_text_element(&mut writer, "SecretKey", secret_key);
    writer
        .write_event(Event::End(BytesEnd::new("CreateApplicationResult")))
        .expect("end root");

    finish(writer)
}

// ── Request bodies ──────────────────────────────────────────────────

/// Body of `PUT /` (application registration).
///
/// `AccessKey`, `SecretKey` and `Region` are the backend credentials the
/// gateway will use for the new application.
#[derive(Debug, Default, Deserialize, PartialEq, Eq, garde::Validate)]
#[serde(rename = "CreateApplicationConfiguration", rename_all = "PascalCase")]
pub struct CreateApplicationConfiguration {
    #[serde(default)]
    #[garde(length(min = 1, max = 128))]
    pub access_key: String,
    #[serde(default)]
    #[garde(length(min = 1, max = 128))]
    pub secret_key: String,
    #[serde(default)]
    #[garde(length(min = 1, max = 64), pattern(r"^[a-z0-9-]+$"))]
    pub region: String,
    #[serde(default)]
    #[garde(length(min = 1, max = 32), pattern(r"^[a-z0-9]+$"))]
    pub engine: String,
    #[serde(default)]
    #[garde(length(max = 128))]
    pub app_name: String,
    #[serde(default)]
    #[garde(length(max = 1024))]
    pub app_remark: String,
}

/// Parse a `<CreateApplicationConfiguration>` document.
pub fn parse_create_application(body: &[u8]) -> Result<CreateApplicationConfiguration, CodecError> {
    quick_xml::de::from_reader(body).map_err(|e| CodecError::Xml(e.to_string()))
}

/// Extract `<LocationConstraint>` from a `<CreateBucketConfiguration>`
/// body.
///
/// Returns `Ok(None)` for an empty body or an empty constraint and `Err`
/// when the document is not well-formed.
pub fn parse_location_constraint(body: &[u8]) -> Result<Option<String>, CodecError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    let mut reader = Reader::from_reader(body);
    let mut buf = Vec::new();
    let mut in_location = false;
    let mut found = None;
    let mut depth = 0usize;
    let mut saw_root = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                depth += 1;
                saw_root = true;
                in_location = e.name().as_ref() == b"LocationConstraint";
            }
            Ok(Event::Empty(_)) => saw_root = true,
            Ok(Event::Text(ref e)) if in_location => {
                let text = e
                    .unescape()
                    .map_err(|e| CodecError::Xml(e.to_string()))?
                    .trim()
                    .to_string();
                if !text.is_empty() {
                    found = Some(text);
                }
            }
            Ok(Event::End(_)) => {
                depth = depth.saturating_sub(1);
                in_location = false;
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(CodecError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !saw_root || depth != 0 {
        return Err(CodecError::Xml("unexpected end of document".into()));
    }
    Ok(found)
}

// ── Helpers ─────────────────────────────────────────────────────────

fn new_writer() -> Writer<Cursor<Vec<u8>>> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .expect("xml decl");
    writer
}

fn finish(writer: Writer<Cursor<Vec<u8>>>) -> String {
    String::from_utf8(writer.into_inner().into_inner()).expect("valid utf-8")
}

/// Write a `<tag>text</tag>` element.
fn write_text_element(writer: &mut Writer<Cursor<Vec<u8>>>, tag: &str, text: &str) {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .expect("start tag");
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .expect("text");
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .expect("end tag");
}
