//! `ObjectStore` on top of `aws-sdk-s3`.
//!
//! Works with AWS itself and with S3-compatible servers (MinIO, Ceph,
//! Garage, ...) through a custom endpoint.
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use aws_credential_types::Credentials as AwsCredentials;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime};
use aws_sdk_s3::Client;
use aws_types::region::Region as AwsRegion;
use bytes::Bytes;
use futures_util::FutureExt;
use percent_encoding::utf8_percent_encode;
use tokio::io::AsyncWriteExt;

use super::*;
use crate::davpath::PATH_ENCODE_SET;

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Region, `us-east-1` if empty.
    pub region: String,
    /// Endpoint of an S3-compatible server.
    pub endpoint_url: Option<String>,
    /// Address buckets as `endpoint/bucket` instead of `bucket.endpoint`.
    pub force_path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        S3Config {
            region: "us-east-1".to_string(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

/// One client, bound to one set of credentials.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
}

/// A connector for [`ConnectionPool::new`] that builds an `S3Store` for
/// each set of credentials.
pub fn connector(
    cfg: S3Config,
) -> impl Fn(&Credentials) -> StoreResult<Arc<dyn ObjectStore>> + Send + Sync + 'static {
    move |creds| Ok(Arc::new(S3Store::new(creds, &cfg)) as Arc<dyn ObjectStore>)
}

fn systemtime(t: Option<&DateTime>) -> SystemTime {
    t.and_then(|t| SystemTime::try_from(*t).ok())
        .unwrap_or(UNIX_EPOCH)
}

fn unquote(etag: Option<&str>) -> String {
    etag.unwrap_or_default().trim_matches('"').to_string()
}

fn store_error<E, R>(e: SdkError<E, R>, what: &str) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    // HEAD responses have no body, the code is derived from the status.
    match e.as_service_error().and_then(|s| s.code()) {
        Some("NoSuchBucket") => StoreError::NoSuchBucket(what.to_string()),
        Some("NoSuchKey") | Some("NotFound") => StoreError::NoSuchKey(what.to_string()),
        Some("AccessDenied")
        | Some("Forbidden")
        | Some("InvalidAccessKeyId")
        | Some("SignatureDoesNotMatch") => StoreError::AccessDenied,
        _ => StoreError::Other(format!("{what}: {}", DisplayErrorContext(&e))),
    }
}

// Not found, as opposed to failed.
fn absent<T>(r: StoreResult<T>) -> StoreResult<Option<T>> {
    match r {
        Ok(t) => Ok(Some(t)),
        Err(StoreError::NoSuchKey(_)) | Err(StoreError::NoSuchBucket(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

impl S3Store {
    pub fn new(creds: &Credentials, cfg: &S3Config) -> S3Store {
        let credentials = AwsCredentials::new(
            &creds.access_key,
            &creds.secret,
            None,
            None,
            "s3dav",
        );
        let region = if cfg.region.is_empty() {
            "us-east-1".to_string()
        } else {
            cfg.region.clone()
        };
        let mut builder = aws_sdk_s3::config::Builder::new()
            .region(AwsRegion::new(region))
            .credentials_provider(credentials)
            .force_path_style(cfg.force_path_style)
            .behavior_version_latest();
        if let Some(endpoint_url) = cfg.endpoint_url.as_deref().filter(|e| !e.is_empty()) {
            builder = builder.endpoint_url(endpoint_url);
        }
        S3Store {
            client: Client::from_conf(builder.build()),
        }
    }

    async fn head(&self, bucket: &str, key: &str) -> StoreResult<ObjectInfo> {
        let resp = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| store_error(e, &format!("{bucket}/{key}")))?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size: resp.content_length().unwrap_or(0).max(0) as u64,
            last_modified: systemtime(resp.last_modified()),
            etag: unquote(resp.e_tag()),
        })
    }
}

impl ObjectStore for S3Store {
    fn list_buckets(&self) -> StoreFuture<'_, Vec<BucketInfo>> {
        async move {
            trace!("STORE: list_buckets");
            let resp = self
                .client
                .list_buckets()
                .send()
                .await
                .map_err(|e| store_error(e, "list buckets"))?;
            Ok(resp
                .buckets()
                .iter()
                .filter_map(|b| {
                    Some(BucketInfo {
                        name: b.name()?.to_string(),
                        created: systemtime(b.creation_date()),
                    })
                })
                .collect())
        }
        .boxed()
    }

    fn get_bucket<'a>(&'a self, bucket: &'a str) -> StoreFuture<'a, Option<BucketInfo>> {
        async move {
            let buckets = self.list_buckets().await?;
            Ok(buckets.into_iter().find(|b| b.name == bucket))
        }
        .boxed()
    }

    fn create_bucket<'a>(&'a self, bucket: &'a str) -> StoreFuture<'a, ()> {
        async move {
            trace!("STORE: create_bucket {bucket}");
            self.client
                .create_bucket()
                .bucket(bucket)
                .send()
                .await
                .map_err(|e| store_error(e, bucket))?;
            Ok(())
        }
        .boxed()
    }

    fn delete_bucket<'a>(&'a self, bucket: &'a str) -> StoreFuture<'a, ()> {
        async move {
            trace!("STORE: delete_bucket {bucket}");
            self.client
                .delete_bucket()
                .bucket(bucket)
                .send()
                .await
                .map_err(|e| store_error(e, bucket))?;
            Ok(())
        }
        .boxed()
    }

    fn list_keys<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> StoreFuture<'a, Vec<ObjectInfo>> {
        async move {
            trace!("STORE: list_keys {bucket} {prefix:?}");
            let mut keys = Vec::new();
            let mut continuation_token: Option<String> = None;
            loop {
                let mut request = self
                    .client
                    .list_objects_v2()
                    .bucket(bucket)
                    .prefix(prefix);
                if let Some(token) = &continuation_token {
                    request = request.continuation_token(token);
                }
                let resp = request.send().await.map_err(|e| store_error(e, bucket))?;
                for object in resp.contents() {
                    let key = match object.key() {
                        Some(k) => k,
                        None => continue,
                    };
                    keys.push(ObjectInfo {
                        key: key.to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                        last_modified: systemtime(object.last_modified()),
                        etag: unquote(object.e_tag()),
                    });
                }
                if resp.is_truncated() == Some(true) {
                    continuation_token = resp.next_continuation_token().map(|t| t.to_string());
                    if continuation_token.is_none() {
                        break;
                    }
                } else {
                    break;
                }
            }
            keys.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(keys)
        }
        .boxed()
    }

    fn get_key<'a>(&'a self, bucket: &'a str, key: &'a str) -> StoreFuture<'a, Option<ObjectInfo>> {
        async move { absent(self.head(bucket, key).await) }.boxed()
    }

    fn fetch_to_file<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        local: &'a Path,
    ) -> StoreFuture<'a, ()> {
        async move {
            trace!("STORE: fetch {bucket}/{key} -> {local:?}");
            let resp = self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| store_error(e, &format!("{bucket}/{key}")))?;
            let mut body = resp.body;
            let mut file = tokio::fs::File::create(local).await?;
            while let Some(chunk) = body
                .try_next()
                .await
                .map_err(|e| StoreError::Other(format!("{bucket}/{key}: {e}")))?
            {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok(())
        }
        .boxed()
    }

    fn put_from_file<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        local: &'a Path,
    ) -> StoreFuture<'a, ObjectInfo> {
        async move {
            trace!("STORE: put {local:?} -> {bucket}/{key}");
            let body = ByteStream::from_path(local)
                .await
                .map_err(|e| StoreError::Other(format!("{local:?}: {e}")))?;
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(body)
                .send()
                .await
                .map_err(|e| store_error(e, &format!("{bucket}/{key}")))?;
            self.head(bucket, key).await
        }
        .boxed()
    }

    fn put_bytes<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        data: Bytes,
    ) -> StoreFuture<'a, ObjectInfo> {
        async move {
            trace!("STORE: put {} bytes -> {bucket}/{key}", data.len());
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| store_error(e, &format!("{bucket}/{key}")))?;
            self.head(bucket, key).await
        }
        .boxed()
    }

    fn copy_key<'a>(
        &'a self,
        src_bucket: &'a str,
        src_key: &'a str,
        dst_bucket: &'a str,
        dst_key: &'a str,
    ) -> StoreFuture<'a, ()> {
        async move {
            trace!("STORE: copy {src_bucket}/{src_key} -> {dst_bucket}/{dst_key}");
            let source = format!(
                "{}/{}",
                src_bucket,
                utf8_percent_encode(src_key, PATH_ENCODE_SET)
            );
            self.client
                .copy_object()
                .copy_source(source)
                .bucket(dst_bucket)
                .key(dst_key)
                .send()
                .await
                .map_err(|e| store_error(e, &format!("{src_bucket}/{src_key}")))?;
            Ok(())
        }
        .boxed()
    }

    fn delete_key<'a>(&'a self, bucket: &'a str, key: &'a str) -> StoreFuture<'a, ()> {
        async move {
            trace!("STORE: delete {bucket}/{key}");
            self.client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| store_error(e, &format!("{bucket}/{key}")))?;
            Ok(())
        }
        .boxed()
    }
}
