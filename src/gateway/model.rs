//! Uniform operation shapes shared by every backend.
//!
//! Inputs are filled from the HTTP request by [`crate::codec::decode`]
//! (plus the bucket and key taken from the path); outputs are written
//! back by [`crate::codec::encode`] or, for list results, serialized as
//! XML.  Every optional field distinguishes "never set" (`None`) from
//! "set to empty" (`Some("")`).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::codec::{CodecError, Field, Metadata, Shape, Slot, TimestampFormat};
use crate::xml::{iso8601_millis, iso8601_millis_opt, to_xml_fragment};

const META_PREFIX: &str = "x-amz-meta-";

// ── Shared list elements ────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Owner {
    #[serde(rename = "ID", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "DisplayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Object {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(
        rename = "LastModified",
        serialize_with = "iso8601_millis_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(rename = "ETag", skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(rename = "Size")]
    pub size: i64,
    #[serde(rename = "StorageClass", skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(rename = "Owner", skip_serializing_if = "Option::is_none")]
    pub owner: Option<Owner>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommonPrefix {
    #[serde(rename = "Prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "CreationDate", serialize_with = "iso8601_millis")]
    pub creation_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BucketList {
    #[serde(rename = "Bucket")]
    pub bucket: Vec<Bucket>,
}

// ── Bucket operations ───────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CreateBucketInput {
    pub bucket: String,
    /// From the optional `<CreateBucketConfiguration>` body.
    pub location_constraint: Option<String>,
    pub acl: Option<String>,
    pub grant_full_control: Option<String>,
    pub grant_read: Option<String>,
    pub grant_read_acp: Option<String>,
    pub grant_write: Option<String>,
    pub grant_write_acp: Option<String>,
}

impl Shape for CreateBucketInput {
    const FIELDS: &'static [Field<Self>] = &[
        Field::header("ACL", "x-amz-acl", Slot::Str(|s| &mut s.acl)),
        Field::header("GrantFullControl", "x-amz-grant-full-control", Slot::Str(|s| &mut s.grant_full_control)),
        Field::header("GrantRead", "x-amz-grant-read", Slot::Str(|s| &mut s.grant_read)),
        Field::header("GrantReadACP", "x-amz-grant-read-acp", Slot::Str(|s| &mut s.grant_read_acp)),
        Field::header("GrantWrite", "x-amz-grant-write", Slot::Str(|s| &mut s.grant_write)),
        Field::header("GrantWriteACP", "x-amz-grant-write-acp", Slot::Str(|s| &mut s.grant_write_acp)),
    ];
}

#[derive(Debug, Clone, Default)]
pub struct CreateBucketOutput {
    pub location: Option<String>,
}

impl Shape for CreateBucketOutput {
    const FIELDS: &'static [Field<Self>] =
        &[Field::header("Location", "Location", Slot::Str(|s| &mut s.location))];
}

#[derive(Debug, Clone, Default)]
pub struct HeadBucketInput {
    pub bucket: String,
}

#[derive(Debug, Clone, Default)]
pub struct HeadBucketOutput {}

#[derive(Debug, Clone, Default)]
pub struct DeleteBucketInput {
    pub bucket: String,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteBucketOutput {}

#[derive(Debug, Clone, Default)]
pub struct ListObjectsInput {
    pub bucket: String,
    pub delimiter: Option<String>,
    pub encoding_type: Option<String>,
    pub marker: Option<String>,
    pub max_keys: Option<i64>,
    pub prefix: Option<String>,
}

impl Shape for ListObjectsInput {
    const FIELDS: &'static [Field<Self>] = &[
        Field::query("Delimiter", "delimiter", Slot::Str(|s| &mut s.delimiter)),
        Field::query("EncodingType", "encoding-type", Slot::Str(|s| &mut s.encoding_type)),
        Field::query("Marker", "marker", Slot::Str(|s| &mut s.marker)),
        Field::query("MaxKeys", "max-keys", Slot::Int(|s| &mut s.max_keys)),
        Field::query("Prefix", "prefix", Slot::Str(|s| &mut s.prefix)),
    ];
}

/// Serialized as `<ListBucketResult>`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListObjectsOutput {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Prefix")]
    pub prefix: String,
    #[serde(rename = "Marker")]
    pub marker: String,
    #[serde(rename = "NextMarker", skip_serializing_if = "Option::is_none")]
    pub next_marker: Option<String>,
    #[serde(rename = "MaxKeys")]
    pub max_keys: i64,
    #[serde(rename = "Delimiter", skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
    #[serde(rename = "IsTruncated")]
    pub is_truncated: bool,
    #[serde(rename = "EncodingType", skip_serializing_if = "Option::is_none")]
    pub encoding_type: Option<String>,
    #[serde(rename = "Contents")]
    pub contents: Vec<Object>,
    #[serde(rename = "CommonPrefixes")]
    pub common_prefixes: Vec<CommonPrefix>,
}

#[derive(Debug, Clone, Default)]
pub struct ListObjectsV2Input {
    pub bucket: String,
    pub continuation_token: Option<String>,
    pub delimiter: Option<String>,
    pub encoding_type: Option<String>,
    pub fetch_owner: Option<bool>,
    pub max_keys: Option<i64>,
    pub prefix: Option<String>,
    pub start_after: Option<String>,
}

impl Shape for ListObjectsV2Input {
    const FIELDS: &'static [Field<Self>] = &[
        Field::query("ContinuationToken", "continuation-token", Slot::Str(|s| &mut s.continuation_token)),
        Field::query("Delimiter", "delimiter", Slot::Str(|s| &mut s.delimiter)),
        Field::query("EncodingType", "encoding-type", Slot::Str(|s| &mut s.encoding_type)),
        Field::query("FetchOwner", "fetch-owner", Slot::Bool(|s| &mut s.fetch_owner)),
        Field::query("MaxKeys", "max-keys", Slot::Int(|s| &mut s.max_keys)),
        Field::query("Prefix", "prefix", Slot::Str(|s| &mut s.prefix)),
        Field::query("StartAfter", "start-after", Slot::Str(|s| &mut s.start_after)),
    ];
}

/// Serialized as `<ListBucketResult>`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListObjectsV2Output {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Prefix")]
    pub prefix: String,
    #[serde(rename = "Delimiter", skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
    #[serde(rename = "MaxKeys")]
    pub max_keys: i64,
    #[serde(rename = "KeyCount")]
    pub key_count: i64,
    #[serde(rename = "IsTruncated")]
    pub is_truncated: bool,
    #[serde(rename = "ContinuationToken", skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
    #[serde(rename = "NextContinuationToken", skip_serializing_if = "Option::is_none")]
    pub next_continuation_token: Option<String>,
    #[serde(rename = "StartAfter", skip_serializing_if = "Option::is_none")]
    pub start_after: Option<String>,
    #[serde(rename = "EncodingType", skip_serializing_if = "Option::is_none")]
    pub encoding_type: Option<String>,
    #[serde(rename = "Contents")]
    pub contents: Vec<Object>,
    #[serde(rename = "CommonPrefixes")]
    pub common_prefixes: Vec<CommonPrefix>,
}

#[derive(Debug, Clone, Default)]
pub struct ListBucketsInput {}

/// Serialized as `<ListAllMyBucketsResult>`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListBucketsOutput {
    #[serde(rename = "Owner", skip_serializing_if = "Option::is_none")]
    pub owner: Option<Owner>,
    #[serde(rename = "Buckets")]
    pub buckets: BucketList,
}

// ── Object operations ───────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct PutObjectInput {
    pub bucket: String,
    pub key: String,
    pub body: Option<Bytes>,
    pub acl: Option<String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_length: Option<i64>,
    /// Raw digest bytes; the header carries them base64-encoded.
    pub content_md5: Option<Vec<u8>>,
    pub content_type: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub grant_full_control: Option<String>,
    pub grant_read: Option<String>,
    pub grant_read_acp: Option<String>,
    pub grant_write_acp: Option<String>,
    pub metadata: Option<Metadata>,
    pub server_side_encryption: Option<String>,
    pub ssekms_encryption_context: Option<serde_json::Value>,
    pub storage_class: Option<String>,
    pub tagging: Option<String>,
    pub website_redirect_location: Option<String>,
}

impl Shape for PutObjectInput {
    const FIELDS: &'static [Field<Self>] = &[
        Field::payload("Body", Slot::Stream(|s| &mut s.body)),
        Field::header("ACL", "x-amz-acl", Slot::Str(|s| &mut s.acl)),
        Field::header("CacheControl", "Cache-Control", Slot::Str(|s| &mut s.cache_control)),
        Field::header("ContentDisposition", "Content-Disposition", Slot::Str(|s| &mut s.content_disposition)),
        Field::header("ContentEncoding", "Content-Encoding", Slot::Str(|s| &mut s.content_encoding)),
        Field::header("ContentLanguage", "Content-Language", Slot::Str(|s| &mut s.content_language)),
        Field::header("ContentLength", "Content-Length", Slot::Int(|s| &mut s.content_length)),
        Field::header("ContentMD5", "Content-MD5", Slot::Blob(|s| &mut s.content_md5)),
        Field::header("ContentType", "Content-Type", Slot::Str(|s| &mut s.content_type)),
        Field::header("Expires", "Expires", Slot::Time(|s| &mut s.expires, None)),
        Field::header("GrantFullControl", "x-amz-grant-full-control", Slot::Str(|s| &mut s.grant_full_control)),
        Field::header("GrantRead", "x-amz-grant-read", Slot::Str(|s| &mut s.grant_read)),
        Field::header("GrantReadACP", "x-amz-grant-read-acp", Slot::Str(|s| &mut s.grant_read_acp)),
        Field::header("GrantWriteACP", "x-amz-grant-write-acp", Slot::Str(|s| &mut s.grant_write_acp)),
        Field::headers("Metadata", META_PREFIX, Slot::Map(|s| &mut s.metadata)),
        Field::header("ServerSideEncryption", "x-amz-server-side-encryption", Slot::Str(|s| &mut s.server_side_encryption)),
        Field::header("SSEKMSEncryptionContext", "x-amz-server-side-encryption-context", Slot::Json(|s| &mut s.ssekms_encryption_context)),
        Field::header("StorageClass", "x-amz-storage-class", Slot::Str(|s| &mut s.storage_class)),
        Field::header("Tagging", "x-amz-tagging", Slot::Str(|s| &mut s.tagging)),
        Field::header("WebsiteRedirectLocation", "x-amz-website-redirect-location", Slot::Str(|s| &mut s.website_redirect_location)),
    ];
}

#[derive(Debug, Clone, Default)]
pub struct PutObjectOutput {
    pub etag: Option<String>,
    pub expiration: Option<String>,
    pub server_side_encryption: Option<String>,
    pub version_id: Option<String>,
}

impl Shape for PutObjectOutput {
    const FIELDS: &'static [Field<Self>] = &[
        Field::header("ETag", "ETag", Slot::Str(|s| &mut s.etag)),
        Field::header("Expiration", "x-amz-expiration", Slot::Str(|s| &mut s.expiration)),
        Field::header("ServerSideEncryption", "x-amz-server-side-encryption", Slot::Str(|s| &mut s.server_side_encryption)),
        Field::header("VersionId", "x-amz-version-id", Slot::Str(|s| &mut s.version_id)),
    ];
}

#[derive(Debug, Clone, Default)]
pub struct HeadObjectInput {
    pub bucket: String,
    pub key: String,
    pub if_match: Option<String>,
    pub if_modified_since: Option<DateTime<Utc>>,
    pub if_none_match: Option<String>,
    pub if_unmodified_since: Option<DateTime<Utc>>,
    pub part_number: Option<i64>,
    pub range: Option<String>,
    pub version_id: Option<String>,
}

impl Shape for HeadObjectInput {
    const FIELDS: &'static [Field<Self>] = &[
        Field::header("IfMatch", "If-Match", Slot::Str(|s| &mut s.if_match)),
        Field::header("IfModifiedSince", "If-Modified-Since", Slot::Time(|s| &mut s.if_modified_since, None)),
        Field::header("IfNoneMatch", "If-None-Match", Slot::Str(|s| &mut s.if_none_match)),
        Field::header("IfUnmodifiedSince", "If-Unmodified-Since", Slot::Time(|s| &mut s.if_unmodified_since, None)),
        Field::query("PartNumber", "partNumber", Slot::Int(|s| &mut s.part_number)),
        Field::header("Range", "Range", Slot::Str(|s| &mut s.range)),
        Field::query("VersionId", "versionId", Slot::Str(|s| &mut s.version_id)),
    ];
}

/// Object attributes common to HEAD and GET responses.
#[derive(Debug, Clone, Default)]
pub struct HeadObjectOutput {
    pub accept_ranges: Option<String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_length: Option<i64>,
    pub content_type: Option<String>,
    pub delete_marker: Option<bool>,
    pub etag: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    pub metadata: Option<Metadata>,
    pub server_side_encryption: Option<String>,
    pub storage_class: Option<String>,
    pub version_id: Option<String>,
    pub website_redirect_location: Option<String>,
}

impl Shape for HeadObjectOutput {
    const FIELDS: &'static [Field<Self>] = &[
        Field::header("AcceptRanges", "accept-ranges", Slot::Str(|s| &mut s.accept_ranges)),
        Field::header("CacheControl", "Cache-Control", Slot::Str(|s| &mut s.cache_control)),
        Field::header("ContentDisposition", "Content-Disposition", Slot::Str(|s| &mut s.content_disposition)),
        Field::header("ContentEncoding", "Content-Encoding", Slot::Str(|s| &mut s.content_encoding)),
        Field::header("ContentLanguage", "Content-Language", Slot::Str(|s| &mut s.content_language)),
        Field::header("ContentLength", "Content-Length", Slot::Int(|s| &mut s.content_length)),
        Field::header("ContentType", "Content-Type", Slot::Str(|s| &mut s.content_type)),
        Field::header("DeleteMarker", "x-amz-delete-marker", Slot::Bool(|s| &mut s.delete_marker)),
        Field::header("ETag", "ETag", Slot::Str(|s| &mut s.etag)),
        Field::header("Expires", "Expires", Slot::Time(|s| &mut s.expires, None)),
        Field::header("LastModified", "Last-Modified", Slot::Time(|s| &mut s.last_modified, None)),
        Field::headers("Metadata", META_PREFIX, Slot::Map(|s| &mut s.metadata)),
        Field::header("ServerSideEncryption", "x-amz-server-side-encryption", Slot::Str(|s| &mut s.server_side_encryption)),
        Field::header("StorageClass", "x-amz-storage-class", Slot::Str(|s| &mut s.storage_class)),
        Field::header("VersionId", "x-amz-version-id", Slot::Str(|s| &mut s.version_id)),
        Field::header("WebsiteRedirectLocation", "x-amz-website-redirect-location", Slot::Str(|s| &mut s.website_redirect_location)),
    ];
}

#[derive(Debug, Clone, Default)]
pub struct GetObjectInput {
    pub bucket: String,
    pub key: String,
    pub if_match: Option<String>,
    pub if_modified_since: Option<DateTime<Utc>>,
    pub if_none_match: Option<String>,
    pub if_unmodified_since: Option<DateTime<Utc>>,
    pub part_number: Option<i64>,
    pub range: Option<String>,
    pub response_cache_control: Option<String>,
    pub response_content_disposition: Option<String>,
    pub response_content_encoding: Option<String>,
    pub response_content_language: Option<String>,
    pub response_content_type: Option<String>,
    pub response_expires: Option<DateTime<Utc>>,
    pub version_id: Option<String>,
}

impl Shape for GetObjectInput {
    const FIELDS: &'static [Field<Self>] = &[
        Field::header("IfMatch", "If-Match", Slot::Str(|s| &mut s.if_match)),
        Field::header("IfModifiedSince", "If-Modified-Since", Slot::Time(|s| &mut s.if_modified_since, None)),
        Field::header("IfNoneMatch", "If-None-Match", Slot::Str(|s| &mut s.if_none_match)),
        Field::header("IfUnmodifiedSince", "If-Unmodified-Since", Slot::Time(|s| &mut s.if_unmodified_since, None)),
        Field::query("PartNumber", "partNumber", Slot::Int(|s| &mut s.part_number)),
        Field::header("Range", "Range", Slot::Str(|s| &mut s.range)),
        Field::query("ResponseCacheControl", "response-cache-control", Slot::Str(|s| &mut s.response_cache_control)),
        Field::query("ResponseContentDisposition", "response-content-disposition", Slot::Str(|s| &mut s.response_content_disposition)),
        Field::query("ResponseContentEncoding", "response-content-encoding", Slot::Str(|s| &mut s.response_content_encoding)),
        Field::query("ResponseContentLanguage", "response-content-language", Slot::Str(|s| &mut s.response_content_language)),
        Field::query("ResponseContentType", "response-content-type", Slot::Str(|s| &mut s.response_content_type)),
        Field::query(
            "ResponseExpires",
            "response-expires",
            Slot::Time(|s| &mut s.response_expires, Some(TimestampFormat::Rfc822)),
        ),
        Field::query("VersionId", "versionId", Slot::Str(|s| &mut s.version_id)),
    ];
}

#[derive(Debug, Clone, Default)]
pub struct GetObjectOutput {
    pub head: HeadObjectOutput,
    pub body: Option<Bytes>,
    pub content_range: Option<String>,
}

impl Shape for GetObjectOutput {
    const FIELDS: &'static [Field<Self>] = &[
        Field::payload("Body", Slot::Stream(|s| &mut s.body)),
        Field::header("AcceptRanges", "accept-ranges", Slot::Str(|s| &mut s.head.accept_ranges)),
        Field::header("CacheControl", "Cache-Control", Slot::Str(|s| &mut s.head.cache_control)),
        Field::header("ContentDisposition", "Content-Disposition", Slot::Str(|s| &mut s.head.content_disposition)),
        Field::header("ContentEncoding", "Content-Encoding", Slot::Str(|s| &mut s.head.content_encoding)),
        Field::header("ContentLanguage", "Content-Language", Slot::Str(|s| &mut s.head.content_language)),
        Field::header("ContentLength", "Content-Length", Slot::Int(|s| &mut s.head.content_length)),
        Field::header("ContentRange", "Content-Range", Slot::Str(|s| &mut s.content_range)),
        Field::header("ContentType", "Content-Type", Slot::Str(|s| &mut s.head.content_type)),
        Field::header("DeleteMarker", "x-amz-delete-marker", Slot::Bool(|s| &mut s.head.delete_marker)),
        Field::header("ETag", "ETag", Slot::Str(|s| &mut s.head.etag)),
        Field::header("Expires", "Expires", Slot::Time(|s| &mut s.head.expires, None)),
        Field::header("LastModified", "Last-Modified", Slot::Time(|s| &mut s.head.last_modified, None)),
        Field::headers("Metadata", META_PREFIX, Slot::Map(|s| &mut s.head.metadata)),
        Field::header("ServerSideEncryption", "x-amz-server-side-encryption", Slot::Str(|s| &mut s.head.server_side_encryption)),
        Field::header("StorageClass", "x-amz-storage-class", Slot::Str(|s| &mut s.head.storage_class)),
        Field::header("VersionId", "x-amz-version-id", Slot::Str(|s| &mut s.head.version_id)),
        Field::header("WebsiteRedirectLocation", "x-amz-website-redirect-location", Slot::Str(|s| &mut s.head.website_redirect_location)),
    ];
}

#[derive(Debug, Clone, Default)]
pub struct DeleteObjectInput {
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
}

impl Shape for DeleteObjectInput {
    const FIELDS: &'static [Field<Self>] =
        &[Field::query("VersionId", "versionId", Slot::Str(|s| &mut s.version_id))];
}

#[derive(Debug, Clone, Default)]
pub struct DeleteObjectOutput {
    pub delete_marker: Option<bool>,
    pub version_id: Option<String>,
}

impl Shape for DeleteObjectOutput {
    const FIELDS: &'static [Field<Self>] = &[
        Field::header("DeleteMarker", "x-amz-delete-marker", Slot::Bool(|s| &mut s.delete_marker)),
        Field::header("VersionId", "x-amz-version-id", Slot::Str(|s| &mut s.version_id)),
    ];
}

#[derive(Debug, Clone, Default)]
pub struct CopyObjectInput {
    pub bucket: String,
    pub key: String,
    pub acl: Option<String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_type: Option<String>,
    pub copy_source: Option<String>,
    pub copy_source_if_match: Option<String>,
    pub copy_source_if_modified_since: Option<DateTime<Utc>>,
    pub copy_source_if_none_match: Option<String>,
    pub copy_source_if_unmodified_since: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub grant_full_control: Option<String>,
    pub grant_read: Option<String>,
    pub grant_read_acp: Option<String>,
    pub grant_write_acp: Option<String>,
    pub metadata: Option<Metadata>,
    pub metadata_directive: Option<String>,
    pub server_side_encryption: Option<String>,
    pub storage_class: Option<String>,
    pub tagging: Option<String>,
    pub tagging_directive: Option<String>,
}

impl Shape for CopyObjectInput {
    const FIELDS: &'static [Field<Self>] = &[
        Field::header("ACL", "x-amz-acl", Slot::Str(|s| &mut s.acl)),
        Field::header("CacheControl", "Cache-Control", Slot::Str(|s| &mut s.cache_control)),
        Field::header("ContentDisposition", "Content-Disposition", Slot::Str(|s| &mut s.content_disposition)),
        Field::header("ContentEncoding", "Content-Encoding", Slot::Str(|s| &mut s.content_encoding)),
        Field::header("ContentType", "Content-Type", Slot::Str(|s| &mut s.content_type)),
        Field::header("CopySource", "x-amz-copy-source", Slot::Str(|s| &mut s.copy_source)),
        Field::header("CopySourceIfMatch", "x-amz-copy-source-if-match", Slot::Str(|s| &mut s.copy_source_if_match)),
        Field::header(
            "CopySourceIfModifiedSince",
            "x-amz-copy-source-if-modified-since",
            Slot::Time(|s| &mut s.copy_source_if_modified_since, None),
        ),
        Field::header("CopySourceIfNoneMatch", "x-amz-copy-source-if-none-match", Slot::Str(|s| &mut s.copy_source_if_none_match)),
        Field::header(
            "CopySourceIfUnmodifiedSince",
            "x-amz-copy-source-if-unmodified-since",
            Slot::Time(|s| &mut s.copy_source_if_unmodified_since, None),
        ),
        Field::header("Expires", "Expires", Slot::Time(|s| &mut s.expires, None)),
        Field::header("GrantFullControl", "x-amz-grant-full-control", Slot::Str(|s| &mut s.grant_full_control)),
        Field::header("GrantRead", "x-amz-grant-read", Slot::Str(|s| &mut s.grant_read)),
        Field::header("GrantReadACP", "x-amz-grant-read-acp", Slot::Str(|s| &mut s.grant_read_acp)),
        Field::header("GrantWriteACP", "x-amz-grant-write-acp", Slot::Str(|s| &mut s.grant_write_acp)),
        Field::headers("Metadata", META_PREFIX, Slot::Map(|s| &mut s.metadata)),
        Field::header("MetadataDirective", "x-amz-metadata-directive", Slot::Str(|s| &mut s.metadata_directive)),
        Field::header("ServerSideEncryption", "x-amz-server-side-encryption", Slot::Str(|s| &mut s.server_side_encryption)),
        Field::header("StorageClass", "x-amz-storage-class", Slot::Str(|s| &mut s.storage_class)),
        Field::header("Tagging", "x-amz-tagging", Slot::Str(|s| &mut s.tagging)),
        Field::header("TaggingDirective", "x-amz-tagging-directive", Slot::Str(|s| &mut s.tagging_directive)),
    ];
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CopyObjectResult {
    #[serde(rename = "ETag", skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(
        rename = "LastModified",
        serialize_with = "iso8601_millis_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct CopyObjectOutput {
    pub copy_object_result: Option<CopyObjectResult>,
    pub copy_source_version_id: Option<String>,
    pub expiration: Option<String>,
    pub server_side_encryption: Option<String>,
    pub version_id: Option<String>,
}

impl Shape for CopyObjectOutput {
    const FIELDS: &'static [Field<Self>] = &[
        Field::payload("CopyObjectResult", Slot::Structure(render_copy_result)),
        Field::header("CopySourceVersionId", "x-amz-copy-source-version-id", Slot::Str(|s| &mut s.copy_source_version_id)),
        Field::header("Expiration", "x-amz-expiration", Slot::Str(|s| &mut s.expiration)),
        Field::header("ServerSideEncryption", "x-amz-server-side-encryption", Slot::Str(|s| &mut s.server_side_encryption)),
        Field::header("VersionId", "x-amz-version-id", Slot::Str(|s| &mut s.version_id)),
    ];
}

fn render_copy_result(s: &mut CopyObjectOutput) -> Result<Option<String>, CodecError> {
    s.copy_object_result
        .take()
        .map(|r| to_xml_fragment(&r, "CopyObjectResult"))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode, RequestParts};
    use chrono::TimeZone;
    use http::HeaderMap;

    #[test]
    fn test_put_object_input_decodes_headers_and_body() {
        let mut headers = HeaderMap::new();
        headers.insert("x-amz-acl", "public-read".parse().unwrap());
        headers.insert("content-type", "text/plain".parse().unwrap());
        headers.insert("x-amz-meta-color", "blue".parse().unwrap());
        headers.insert("x-amz-storage-class", "STANDARD_IA".parse().unwrap());
        let body = Bytes::from_static(b"hello");

        let mut input = PutObjectInput::default();
        let errors = decode(
            &mut input,
            &RequestParts {
                headers: &headers,
                query: &[],
                body: &body,
            },
        );

        assert!(errors.is_empty());
        assert_eq!(input.acl.as_deref(), Some("public-read"));
        assert_eq!(input.content_type.as_deref(), Some("text/plain"));
        assert_eq!(input.storage_class.as_deref(), Some("STANDARD_IA"));
        assert_eq!(
            input.metadata.unwrap().get("Color").map(String::as_str),
            Some("blue")
        );
        assert_eq!(input.body.as_deref(), Some(&b"hello"[..]));
        assert!(input.grant_read.is_none());
    }

    #[test]
    fn test_list_objects_bad_max_keys_reported() {
        let query = vec![
            ("max-keys".to_string(), "lots".to_string()),
            ("prefix".to_string(), "photos/".to_string()),
        ];
        let headers = HeaderMap::new();
        let body = Bytes::new();
        let mut input = ListObjectsInput::default();
        let errors = decode(
            &mut input,
            &RequestParts {
                headers: &headers,
                query: &query,
                body: &body,
            },
        );
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].location_name, "max-keys");
        assert_eq!(input.prefix.as_deref(), Some("photos/"));
    }

    #[test]
    fn test_get_object_output_encodes_body_and_headers() {
        let out = GetObjectOutput {
            head: HeadObjectOutput {
                content_length: Some(5),
                etag: Some("\"abc\"".into()),
                last_modified: Some(Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap()),
                ..Default::default()
            },
            body: Some(Bytes::from_static(b"hello")),
            content_range: None,
        };
        let encoded = encode(out).unwrap();
        assert_eq!(encoded.headers["etag"], "\"abc\"");
        assert_eq!(encoded.headers["last-modified"], "Thu, 02 Jan 2020 03:04:05 GMT");
        assert_eq!(encoded.body.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_copy_object_output_renders_result_payload() {
        let out = CopyObjectOutput {
            copy_object_result: Some(CopyObjectResult {
                etag: Some("\"abc\"".into()),
                last_modified: Some(Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap()),
            }),
            version_id: Some("v1".into()),
            ..Default::default()
        };
        let encoded = encode(out).unwrap();
        let body = String::from_utf8(encoded.body.unwrap().to_vec()).unwrap();
        assert!(body.starts_with("<?xml"));
        assert!(body.contains("<CopyObjectResult>"));
        assert!(body.contains("<LastModified>2020-01-02T03:04:05.000Z</LastModified>"));
        assert_eq!(encoded.headers["x-amz-version-id"], "v1");
    }
}
