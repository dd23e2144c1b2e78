//! S3-compatible object storage backend
//!
//! Serves both `s3://` roots and `gs://` roots; the latter go through the
//! GCS XML interoperability endpoint with HMAC credentials supplied the
//! usual AWS way (`AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`).
//!
//! The client is blocking: each call drives its request on a private tokio
//! runtime. Do not call it from inside another tokio runtime.

use super::{validate_path, PathIter, StorageClient, StorageSystem};
use crate::error::{RegistryError, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::collections::VecDeque;
use tokio::runtime::Runtime;
use tracing::{debug, info};

const GCS_ENDPOINT: &str = "https://storage.googleapis.com";

/// Overrides the endpoint, e.g. for MinIO or LocalStack
pub const ENDPOINT_ENV: &str = "CARDVAULT_S3_ENDPOINT";

pub struct ObjectStorage {
    client: Client,
    runtime: Runtime,
    bucket: String,
    prefix: String,
    system: StorageSystem,
}

impl ObjectStorage {
    pub fn s3(bucket: &str, prefix: &str) -> Result<Self> {
        let endpoint = std::env::var(ENDPOINT_ENV).ok();
        Self::connect(StorageSystem::S3, bucket, prefix, endpoint)
    }

    pub fn gcs(bucket: &str, prefix: &str) -> Result<Self> {
        let endpoint = std::env::var(ENDPOINT_ENV)
            .ok()
            .or_else(|| Some(GCS_ENDPOINT.to_string()));
        Self::connect(StorageSystem::Gcs, bucket, prefix, endpoint)
    }

    fn connect(
        system: StorageSystem,
        bucket: &str,
        prefix: &str,
        endpoint: Option<String>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;

        let sdk_config = runtime.block_on(aws_config::defaults(BehaviorVersion::latest()).load());

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if sdk_config.region().is_none() {
            builder = builder.region(Region::new("auto"));
        }
        if let Some(endpoint) = endpoint {
            debug!("Using object storage endpoint {}", endpoint);
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        info!(
            "Object storage ready: {:?} bucket={} prefix={}",
            system, bucket, prefix
        );

        Ok(ObjectStorage {
            client: Client::from_conf(builder.build()),
            runtime,
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
            system,
        })
    }

    fn key(&self, path: &str) -> Result<String> {
        validate_path(path)?;
        if self.prefix.is_empty() {
            Ok(path.to_string())
        } else {
            Ok(format!("{}/{}", self.prefix, path))
        }
    }

    fn strip_key<'k>(&self, key: &'k str) -> &'k str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix)
                .map(|rest| rest.trim_start_matches('/'))
                .unwrap_or(key)
        }
    }
}

/// Timeouts, dispatch failures, throttling and 5xx are worth retrying
fn classify<E>(path: &str, err: SdkError<E>) -> RegistryError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            status == 429 || status >= 500
        }
        _ => false,
    };
    let message = DisplayErrorContext(&err).to_string();
    if transient {
        RegistryError::transient(path, message)
    } else {
        RegistryError::storage(path, message)
    }
}

impl StorageClient for ObjectStorage {
    fn system(&self) -> StorageSystem {
        self.system
    }

    fn root_uri(&self) -> String {
        let scheme = match self.system {
            StorageSystem::Gcs => "gs",
            _ => "s3",
        };
        if self.prefix.is_empty() {
            format!("{}://{}", scheme, self.bucket)
        } else {
            format!("{}://{}/{}", scheme, self.bucket, self.prefix)
        }
    }

    fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        let key = self.key(path)?;
        self.runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .body(ByteStream::from(data.to_vec()))
                    .send(),
            )
            .map_err(|e| classify(path, e))?;
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        let key = self.key(path)?;
        self.runtime.block_on(async {
            let output = match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
            {
                Ok(output) => output,
                Err(err) => {
                    if err
                        .as_service_error()
                        .map(|e| e.is_no_such_key())
                        .unwrap_or(false)
                    {
                        return Err(RegistryError::NotFound(format!(
                            "no artifact at '{}'",
                            path
                        )));
                    }
                    return Err(classify(path, err));
                }
            };

            let body = output
                .body
                .collect()
                .await
                .map_err(|e| RegistryError::transient(path, e.to_string()))?;
            Ok(body.into_bytes().to_vec())
        })
    }

    fn exists(&self, path: &str) -> Result<bool> {
        match self.size(path) {
            Ok(_) => Ok(true),
            Err(RegistryError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn size(&self, path: &str) -> Result<u64> {
        let key = self.key(path)?;
        let result = self.runtime.block_on(
            self.client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send(),
        );

        match result {
            Ok(output) => output
                .content_length()
                .map(|len| len.max(0) as u64)
                .ok_or_else(|| RegistryError::storage(path, "object has no content length")),
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Err(RegistryError::NotFound(format!("no artifact at '{}'", path)))
                } else {
                    Err(classify(path, err))
                }
            }
        }
    }

    fn list(&self, prefix: &str) -> Result<PathIter<'_>> {
        let full_prefix = if self.prefix.is_empty() {
            prefix.to_string()
        } else {
            format!("{}/{}", self.prefix, prefix)
        };

        Ok(Box::new(ObjectListing {
            storage: self,
            prefix: full_prefix,
            token: None,
            buffer: VecDeque::new(),
            done: false,
        }))
    }

    fn delete(&self, path: &str) -> Result<()> {
        let key = self.key(path)?;
        self.runtime
            .block_on(
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send(),
            )
            .map_err(|e| classify(path, e))?;
        Ok(())
    }
}

/// Page-at-a-time listing; one `ListObjectsV2` call per exhausted page
struct ObjectListing<'a> {
    storage: &'a ObjectStorage,
    prefix: String,
    token: Option<String>,
    buffer: VecDeque<String>,
    done: bool,
}

impl ObjectListing<'_> {
    fn fetch_page(&mut self) -> Result<()> {
        let output = self
            .storage
            .runtime
            .block_on(
                self.storage
                    .client
                    .list_objects_v2()
                    .bucket(&self.storage.bucket)
                    .prefix(&self.prefix)
                    .set_continuation_token(self.token.take())
                    .send(),
            )
            .map_err(|e| classify(&self.prefix, e))?;

        for object in output.contents() {
            if let Some(key) = object.key() {
                self.buffer.push_back(self.storage.strip_key(key).to_string());
            }
        }

        self.token = output.next_continuation_token().map(str::to_string);
        self.done = !output.is_truncated().unwrap_or(false) || self.token.is_none();
        Ok(())
    }
}

impl Iterator for ObjectListing<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(key) = self.buffer.pop_front() {
                return Some(Ok(key));
            }
            if self.done {
                return None;
            }
            if let Err(err) = self.fetch_page() {
                self.done = true;
                return Some(Err(err));
            }
        }
    }
}
