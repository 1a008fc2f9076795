//! AWS S3 backend.
//!
//! Forwards every uniform operation to S3 (or an S3-compatible endpoint)
//! through the AWS SDK for Rust.  The client is built per credential set
//! with static credentials; the SDK's own request id and extended
//! request id become the correlation headers.

use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::{RequestId, RequestIdExt};
use aws_sdk_s3::primitives::{ByteStream, DateTime as SmithyDateTime};
use aws_sdk_s3::types::{
    BucketCannedAcl, BucketLocationConstraint, CreateBucketConfiguration, EncodingType,
    MetadataDirective, ObjectCannedAcl, ServerSideEncryption, StorageClass, TaggingDirective,
};
use aws_sdk_s3::Client;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::model::*;
use super::{
    require, BackendFactory, BackendFuture, BackendProtocol, ConnectFuture, Credentials, Failure,
    NormalizedError, Reply,
};
use crate::codec::{canonical_header_key, parse_time, Metadata, TimestampFormat};
use crate::errors::standard_status;

/// Engine name in the registry.
pub const ENGINE: &str = "s3";

/// Region used when the credential row carries none.
const FALLBACK_REGION: &str = "us-east-1";

/// Builds [`S3Backend`]s.
pub struct S3Factory {
    /// Custom S3-compatible endpoint (e.g. MinIO, LocalStack).
    endpoint: Option<String>,
}

impl S3Factory {
    pub fn new(endpoint: Option<String>) -> Self {
        Self { endpoint }
    }
}

impl BackendFactory for S3Factory {
    fn connect(&self, credentials: Credentials, region: String) -> ConnectFuture<'_> {
        Box::pin(async move {
            let backend = S3Backend::new(credentials, region, self.endpoint.clone()).await?;
            Ok(Box::new(backend) as Box<dyn BackendProtocol>)
        })
    }
}

/// Backend that forwards operations to AWS S3.
pub struct S3Backend {
    client: Client,
}

impl S3Backend {
    /// Build an S3 client bound to `credentials` in `region`.
    pub async fn new(
        credentials: Credentials,
        region: String,
        endpoint_url: Option<String>,
    ) -> anyhow::Result<Self> {
        let region = if region.is_empty() {
            FALLBACK_REGION.to_string()
        } else {
            region
        };

        let creds = aws_sdk_s3::config::Credentials::new(
            credentials.access_key_id,
            credentials.secret_access_key,
            credentials.session_token,
            None, // expiry
            "s3adapter",
        );
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()))
            .credentials_provider(creds);

        if let Some(ref endpoint) = endpoint_url {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        let sdk_config = config_loader.load().await;

        // Custom endpoints are usually path-style only.
        let s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(endpoint_url.is_some());

        let client = Client::from_conf(s3_config_builder.build());

        debug!("S3 backend initialized: region={} endpoint={:?}", region, endpoint_url);

        Ok(Self { client })
    }
}

// -- Translation helpers ------------------------------------------------------

/// Map an SDK failure to a [`Failure`] with the SDK's correlation ids.
fn translate<E>(op: &str, err: SdkError<E>) -> Failure
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let request_id = err.request_id().map(str::to_string);
    let host_id = err.extended_request_id().map(str::to_string);
    let status = err.raw_response().map(|r| r.status().as_u16());

    let normalized = match err.code() {
        Some(code) => {
            let status = status.or_else(|| standard_status(code)).unwrap_or(400);
            NormalizedError::new(code, err.message().unwrap_or_default(), status)
        }
        None => NormalizedError::untranslated(DisplayErrorContext(&err).to_string()),
    };
    warn!("S3 {} failed: {}", op, DisplayErrorContext(&err));

    normalized
        .with_ids(request_id.as_deref(), host_id.as_deref())
        .into()
}

fn reply<T, R: RequestId + RequestIdExt>(output: T, resp: &R) -> Reply<T> {
    Reply::new(output, resp.request_id(), resp.extended_request_id())
}

fn to_smithy_time(t: Option<DateTime<Utc>>) -> Option<SmithyDateTime> {
    t.map(|t| SmithyDateTime::from_millis(t.timestamp_millis()))
}

fn from_smithy_time(t: Option<&SmithyDateTime>) -> Option<DateTime<Utc>> {
    t.and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
}

fn to_max_keys(max_keys: Option<i64>) -> Option<i32> {
    max_keys.map(|n| n.clamp(0, i32::MAX as i64) as i32)
}

/// `partNumber` must fit the SDK's `i32`; anything else is rejected.
fn to_part_number(part_number: Option<i64>) -> Result<Option<i32>, Failure> {
    part_number
        .map(|n| {
            i32::try_from(n).map_err(|_| {
                NormalizedError::new(
                    "InvalidArgument",
                    "Part number must be an integer between 1 and 10000, inclusive",
                    400,
                )
                .into()
            })
        })
        .transpose()
}

/// SDK metadata map (lowercase keys) to uniform metadata.
fn from_sdk_metadata(metadata: Option<&HashMap<String, String>>) -> Option<Metadata> {
    let metadata = metadata.filter(|m| !m.is_empty())?;
    Some(
        metadata
            .iter()
            .map(|(k, v)| (canonical_header_key(k), v.clone()))
            .collect(),
    )
}

fn to_sdk_metadata(metadata: Option<Metadata>) -> Option<HashMap<String, String>> {
    metadata.map(|m| m.into_iter().collect())
}

fn owner(o: Option<&aws_sdk_s3::types::Owner>) -> Option<Owner> {
    o.map(|o| Owner {
        id: o.id().map(str::to_string),
        display_name: o.display_name().map(str::to_string),
    })
}

fn object(o: &aws_sdk_s3::types::Object) -> Object {
    Object {
        key: o.key().unwrap_or_default().to_string(),
        last_modified: from_smithy_time(o.last_modified()),
        etag: o.e_tag().map(str::to_string),
        size: o.size().unwrap_or_default(),
        storage_class: o.storage_class().map(|s| s.as_str().to_string()),
        owner: owner(o.owner()),
    }
}

fn common_prefix(p: &aws_sdk_s3::types::CommonPrefix) -> CommonPrefix {
    CommonPrefix {
        prefix: p.prefix().unwrap_or_default().to_string(),
    }
}

fn base64_encode(data: impl AsRef<[u8]>) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// The attribute accessors shared by HeadObject and GetObject outputs.
macro_rules! head_output {
    ($resp:expr) => {
        HeadObjectOutput {
            accept_ranges: $resp.accept_ranges().map(str::to_string),
            cache_control: $resp.cache_control().map(str::to_string),
            content_disposition: $resp.content_disposition().map(str::to_string),
            content_encoding: $resp.content_encoding().map(str::to_string),
            content_language: $resp.content_language().map(str::to_string),
            content_length: $resp.content_length(),
            content_type: $resp.content_type().map(str::to_string),
            delete_marker: $resp.delete_marker(),
            etag: $resp.e_tag().map(str::to_string),
            expires: $resp
                .expires_string()
                .and_then(|s| parse_time(s, TimestampFormat::Rfc822)),
            last_modified: from_smithy_time($resp.last_modified()),
            metadata: from_sdk_metadata($resp.metadata()),
            server_side_encryption: $resp.server_side_encryption().map(|s| s.as_str().to_string()),
            storage_class: $resp.storage_class().map(|s| s.as_str().to_string()),
            version_id: $resp.version_id().map(str::to_string),
            website_redirect_location: $resp.website_redirect_location().map(str::to_string),
        }
    };
}

// -- Protocol -----------------------------------------------------------------

impl BackendProtocol for S3Backend {
    fn production(&self) -> bool {
        true
    }

    fn create_bucket(&self, input: CreateBucketInput) -> BackendFuture<'_, CreateBucketOutput> {
        Box::pin(async move {
            require(&input.bucket)?;
            debug!("S3 create_bucket: bucket={}", input.bucket);

            let configuration = input
                .location_constraint
                .filter(|l| !l.is_empty())
                .map(|l| {
                    CreateBucketConfiguration::builder()
                        .location_constraint(BucketLocationConstraint::from(l.as_str()))
                        .build()
                });

            let resp = self
                .client
                .create_bucket()
                .bucket(&input.bucket)
                .set_create_bucket_configuration(configuration)
                .set_acl(input.acl.as_deref().map(BucketCannedAcl::from))
                .set_grant_full_control(input.grant_full_control)
                .set_grant_read(input.grant_read)
                .set_grant_read_acp(input.grant_read_acp)
                .set_grant_write(input.grant_write)
                .set_grant_write_acp(input.grant_write_acp)
                .send()
                .await
                .map_err(|e| translate("create_bucket", e))?;

            info!("S3 bucket created: {}", input.bucket);
            Ok(reply(
                CreateBucketOutput {
                    location: resp.location().map(str::to_string),
                },
                &resp,
            ))
        })
    }

    fn head_bucket(&self, input: HeadBucketInput) -> BackendFuture<'_, HeadBucketOutput> {
        Box::pin(async move {
            require(&input.bucket)?;
            debug!("S3 head_bucket: bucket={}", input.bucket);

            let resp = self
                .client
                .head_bucket()
                .bucket(&input.bucket)
                .send()
                .await
                .map_err(|e| translate("head_bucket", e))?;
            Ok(reply(HeadBucketOutput {}, &resp))
        })
    }

    fn delete_bucket(&self, input: DeleteBucketInput) -> BackendFuture<'_, DeleteBucketOutput> {
        Box::pin(async move {
            require(&input.bucket)?;
            debug!("S3 delete_bucket: bucket={}", input.bucket);

            let resp = self
                .client
                .delete_bucket()
                .bucket(&input.bucket)
                .send()
                .await
                .map_err(|e| translate("delete_bucket", e))?;
            Ok(reply(DeleteBucketOutput {}, &resp))
        })
    }

    fn list_objects(&self, input: ListObjectsInput) -> BackendFuture<'_, ListObjectsOutput> {
        Box::pin(async move {
            require(&input.bucket)?;
            debug!("S3 list_objects: bucket={} prefix={:?}", input.bucket, input.prefix);

            let resp = self
                .client
                .list_objects()
                .bucket(&input.bucket)
                .set_delimiter(input.delimiter)
                .set_encoding_type(input.encoding_type.as_deref().map(EncodingType::from))
                .set_marker(input.marker)
                .set_max_keys(to_max_keys(input.max_keys))
                .set_prefix(input.prefix)
                .send()
                .await
                .map_err(|e| translate("list_objects", e))?;

            let output = ListObjectsOutput {
                name: resp.name().unwrap_or(input.bucket.as_str()).to_string(),
                prefix: resp.prefix().unwrap_or_default().to_string(),
                marker: resp.marker().unwrap_or_default().to_string(),
                next_marker: resp.next_marker().map(str::to_string),
                max_keys: resp.max_keys().unwrap_or_default() as i64,
                delimiter: resp.delimiter().map(str::to_string),
                is_truncated: resp.is_truncated().unwrap_or_default(),
                encoding_type: resp.encoding_type().map(|e| e.as_str().to_string()),
                contents: resp.contents().iter().map(object).collect(),
                common_prefixes: resp.common_prefixes().iter().map(common_prefix).collect(),
            };
            Ok(reply(output, &resp))
        })
    }

    fn list_objects_v2(&self, input: ListObjectsV2Input) -> BackendFuture<'_, ListObjectsV2Output> {
        Box::pin(async move {
            require(&input.bucket)?;
            debug!("S3 list_objects_v2: bucket={} prefix={:?}", input.bucket, input.prefix);

            let resp = self
                .client
                .list_objects_v2()
                .bucket(&input.bucket)
                .set_continuation_token(input.continuation_token)
                .set_delimiter(input.delimiter)
                .set_encoding_type(input.encoding_type.as_deref().map(EncodingType::from))
                .set_fetch_owner(input.fetch_owner)
                .set_max_keys(to_max_keys(input.max_keys))
                .set_prefix(input.prefix)
                .set_start_after(input.start_after)
                .send()
                .await
                .map_err(|e| translate("list_objects_v2", e))?;

            let output = ListObjectsV2Output {
                name: resp.name().unwrap_or(input.bucket.as_str()).to_string(),
                prefix: resp.prefix().unwrap_or_default().to_string(),
                delimiter: resp.delimiter().map(str::to_string),
                max_keys: resp.max_keys().unwrap_or_default() as i64,
                key_count: resp.key_count().unwrap_or_default() as i64,
                is_truncated: resp.is_truncated().unwrap_or_default(),
                continuation_token: resp.continuation_token().map(str::to_string),
                next_continuation_token: resp.next_continuation_token().map(str::to_string),
                start_after: resp.start_after().map(str::to_string),
                encoding_type: resp.encoding_type().map(|e| e.as_str().to_string()),
                contents: resp.contents().iter().map(object).collect(),
                common_prefixes: resp.common_prefixes().iter().map(common_prefix).collect(),
            };
            Ok(reply(output, &resp))
        })
    }

    fn list_buckets(&self, _input: ListBucketsInput) -> BackendFuture<'_, ListBucketsOutput> {
        Box::pin(async move {
            debug!("S3 list_buckets");

            let resp = self
                .client
                .list_buckets()
                .send()
                .await
                .map_err(|e| translate("list_buckets", e))?;

            let buckets = resp
                .buckets()
                .iter()
                .map(|b| Bucket {
                    name: b.name().unwrap_or_default().to_string(),
                    creation_date: from_smithy_time(b.creation_date()).unwrap_or_default(),
                })
                .collect();
            let output = ListBucketsOutput {
                owner: owner(resp.owner()),
                buckets: BucketList { bucket: buckets },
            };
            Ok(reply(output, &resp))
        })
    }

    fn put_object(&self, input: PutObjectInput) -> BackendFuture<'_, PutObjectOutput> {
        Box::pin(async move {
            require(&input.bucket)?;
            require(&input.key)?;
            debug!("S3 put_object: bucket={} key={}", input.bucket, input.key);

            let resp = self
                .client
                .put_object()
                .bucket(&input.bucket)
                .key(&input.key)
                .body(ByteStream::from(input.body.unwrap_or_default()))
                .set_acl(input.acl.as_deref().map(ObjectCannedAcl::from))
                .set_cache_control(input.cache_control)
                .set_content_disposition(input.content_disposition)
                .set_content_encoding(input.content_encoding)
                .set_content_language(input.content_language)
                .set_content_length(input.content_length)
                .set_content_md5(input.content_md5.map(base64_encode))
                .set_content_type(input.content_type)
                .set_expires(to_smithy_time(input.expires))
                .set_grant_full_control(input.grant_full_control)
                .set_grant_read(input.grant_read)
                .set_grant_read_acp(input.grant_read_acp)
                .set_grant_write_acp(input.grant_write_acp)
                .set_metadata(to_sdk_metadata(input.metadata))
                .set_server_side_encryption(
                    input.server_side_encryption.as_deref().map(ServerSideEncryption::from),
                )
                .set_ssekms_encryption_context(
                    input.ssekms_encryption_context.map(|v| base64_encode(v.to_string())),
                )
                .set_storage_class(input.storage_class.as_deref().map(StorageClass::from))
                .set_tagging(input.tagging)
                .set_website_redirect_location(input.website_redirect_location)
                .send()
                .await
                .map_err(|e| translate("put_object", e))?;

            let output = PutObjectOutput {
                etag: resp.e_tag().map(str::to_string),
                expiration: resp.expiration().map(str::to_string),
                server_side_encryption: resp.server_side_encryption().map(|s| s.as_str().to_string()),
                version_id: resp.version_id().map(str::to_string),
            };
            Ok(reply(output, &resp))
        })
    }

    fn head_object(&self, input: HeadObjectInput) -> BackendFuture<'_, HeadObjectOutput> {
        Box::pin(async move {
            require(&input.bucket)?;
            require(&input.key)?;
            debug!("S3 head_object: bucket={} key={}", input.bucket, input.key);
            let part_number = to_part_number(input.part_number)?;

            let resp = self
                .client
                .head_object()
                .bucket(&input.bucket)
                .key(&input.key)
                .set_if_match(input.if_match)
                .set_if_modified_since(to_smithy_time(input.if_modified_since))
                .set_if_none_match(input.if_none_match)
                .set_if_unmodified_since(to_smithy_time(input.if_unmodified_since))
                .set_part_number(part_number)
                .set_range(input.range)
                .set_version_id(input.version_id)
                .send()
                .await
                .map_err(|e| translate("head_object", e))?;

            let output = head_output!(resp);
            Ok(reply(output, &resp))
        })
    }

    fn get_object(&self, input: GetObjectInput) -> BackendFuture<'_, GetObjectOutput> {
        Box::pin(async move {
            require(&input.bucket)?;
            require(&input.key)?;
            debug!("S3 get_object: bucket={} key={}", input.bucket, input.key);
            let part_number = to_part_number(input.part_number)?;

            let resp = self
                .client
                .get_object()
                .bucket(&input.bucket)
                .key(&input.key)
                .set_if_match(input.if_match)
                .set_if_modified_since(to_smithy_time(input.if_modified_since))
                .set_if_none_match(input.if_none_match)
                .set_if_unmodified_since(to_smithy_time(input.if_unmodified_since))
                .set_part_number(part_number)
                .set_range(input.range)
                .set_response_cache_control(input.response_cache_control)
                .set_response_content_disposition(input.response_content_disposition)
                .set_response_content_encoding(input.response_content_encoding)
                .set_response_content_language(input.response_content_language)
                .set_response_content_type(input.response_content_type)
                .set_response_expires(to_smithy_time(input.response_expires))
                .set_version_id(input.version_id)
                .send()
                .await
                .map_err(|e| translate("get_object", e))?;

            let head = head_output!(resp);
            let content_range = resp.content_range().map(str::to_string);
            let request_id = resp.request_id().map(str::to_string);
            let host_id = resp.extended_request_id().map(str::to_string);

            let body = resp.body.collect().await.map_err(|e| {
                Failure::from(
                    NormalizedError::untranslated(e.to_string())
                        .with_ids(request_id.as_deref(), host_id.as_deref()),
                )
            })?;

            Ok(Reply::new(
                GetObjectOutput {
                    head,
                    body: Some(body.into_bytes()),
                    content_range,
                },
                request_id.as_deref(),
                host_id.as_deref(),
            ))
        })
    }

    fn delete_object(&self, input: DeleteObjectInput) -> BackendFuture<'_, DeleteObjectOutput> {
        Box::pin(async move {
            require(&input.bucket)?;
            require(&input.key)?;
            debug!("S3 delete_object: bucket={} key={}", input.bucket, input.key);

            let resp = self
                .client
                .delete_object()
                .bucket(&input.bucket)
                .key(&input.key)
                .set_version_id(input.version_id)
                .send()
                .await
                .map_err(|e| translate("delete_object", e))?;

            let output = DeleteObjectOutput {
                delete_marker: resp.delete_marker(),
                version_id: resp.version_id().map(str::to_string),
            };
            Ok(reply(output, &resp))
        })
    }

    fn copy_object(&self, input: CopyObjectInput) -> BackendFuture<'_, CopyObjectOutput> {
        Box::pin(async move {
            require(&input.bucket)?;
            require(&input.key)?;
            let copy_source = input.copy_source.unwrap_or_default();
            require(&copy_source)?;
            debug!(
                "S3 copy_object: src={} dst={}/{}",
                copy_source, input.bucket, input.key
            );

            let resp = self
                .client
                .copy_object()
                .bucket(&input.bucket)
                .key(&input.key)
                .copy_source(copy_source)
                .set_acl(input.acl.as_deref().map(ObjectCannedAcl::from))
                .set_cache_control(input.cache_control)
                .set_content_disposition(input.content_disposition)
                .set_content_encoding(input.content_encoding)
                .set_content_type(input.content_type)
                .set_copy_source_if_match(input.copy_source_if_match)
                .set_copy_source_if_modified_since(to_smithy_time(input.copy_source_if_modified_since))
                .set_copy_source_if_none_match(input.copy_source_if_none_match)
                .set_copy_source_if_unmodified_since(to_smithy_time(
                    input.copy_source_if_unmodified_since,
                ))
                .set_expires(to_smithy_time(input.expires))
                .set_grant_full_control(input.grant_full_control)
                .set_grant_read(input.grant_read)
                .set_grant_read_acp(input.grant_read_acp)
                .set_grant_write_acp(input.grant_write_acp)
                .set_metadata(to_sdk_metadata(input.metadata))
                .set_metadata_directive(input.metadata_directive.as_deref().map(MetadataDirective::from))
                .set_server_side_encryption(
                    input.server_side_encryption.as_deref().map(ServerSideEncryption::from),
                )
                .set_storage_class(input.storage_class.as_deref().map(StorageClass::from))
                .set_tagging(input.tagging)
                .set_tagging_directive(input.tagging_directive.as_deref().map(TaggingDirective::from))
                .send()
                .await
                .map_err(|e| translate("copy_object", e))?;

            let output = CopyObjectOutput {
                copy_object_result: resp.copy_object_result().map(|r| CopyObjectResult {
                    etag: r.e_tag().map(str::to_string),
                    last_modified: from_smithy_time(r.last_modified()),
                }),
                copy_source_version_id: resp.copy_source_version_id().map(str::to_string),
                expiration: resp.expiration().map(str::to_string),
                server_side_encryption: resp.server_side_encryption().map(|s| s.as_str().to_string()),
                version_id: resp.version_id().map(str::to_string),
            };
            Ok(reply(output, &resp))
        })
    }
}

// -- Tests --------------------------------------------------------------------
