use crate::config::S3Config;
use crate::error::{AggregatorError, Result, StoreOperation};
use crate::object_store::{decode_text, ObjectStore};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use tracing::{debug, info, instrument, warn};

/// S3 accepts at most this many keys per DeleteObjects request
const MAX_DELETE_BATCH: usize = 1000;

/// S3-backed object store
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            region = %config.region,
            endpoint_url = config.endpoint_url.as_deref().unwrap_or("default"),
            "S3 object store initialized"
        );

        Ok(Self { client })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn list(&self, bucket: &str) -> Result<Vec<String>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page
                .map_err(|e| AggregatorError::store(StoreOperation::List, bucket, None, DisplayErrorContext(e)))?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(String::from)),
            );
        }

        debug!(bucket = %bucket, count = keys.len(), "Listed bucket");
        Ok(keys)
    }

    async fn get_text(&self, bucket: &str, key: &str) -> Result<String> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                AggregatorError::store(StoreOperation::Get, bucket, Some(key), DisplayErrorContext(e))
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| AggregatorError::store(StoreOperation::Get, bucket, Some(key), e))?
            .into_bytes();

        let (text, lossy) = decode_text(&bytes);
        if lossy {
            warn!(bucket = %bucket, key = %key, "Object is not valid UTF-8, decoded lossily");
        }
        Ok(text)
    }

    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn put_text(&self, bucket: &str, key: &str, body: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body.as_bytes().to_vec()))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| AggregatorError::store(StoreOperation::Put, bucket, Some(key), DisplayErrorContext(e)))?;

        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(AggregatorError::store(
                        StoreOperation::Exists,
                        bucket,
                        Some(key),
                        DisplayErrorContext(e),
                    ))
                }
            }
        }
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn delete_batch(&self, bucket: &str, keys: &[String]) -> Result<()> {
        for chunk in keys.chunks(MAX_DELETE_BATCH) {
            let objects = chunk
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| AggregatorError::store(StoreOperation::Delete, bucket, None, e))?;

            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(false)
                .build()
                .map_err(|e| AggregatorError::store(StoreOperation::Delete, bucket, None, e))?;

            let response = self
                .client
                .delete_objects()
                .bucket(bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| {
                    AggregatorError::store(StoreOperation::Delete, bucket, None, DisplayErrorContext(e))
                })?;

            // DeleteObjects reports per-key failures in a successful response
            let failed: Vec<String> = response
                .errors()
                .iter()
                .map(|err| {
                    format!(
                        "{} ({})",
                        err.key().unwrap_or("?"),
                        err.code().unwrap_or("unknown")
                    )
                })
                .collect();

            if !failed.is_empty() {
                warn!(bucket = %bucket, failed = failed.len(), "Some objects were not deleted");
                return Err(AggregatorError::store(
                    StoreOperation::Delete,
                    bucket,
                    None,
                    format!("failed to delete {}", failed.join(", ")),
                ));
            }

            debug!(bucket = %bucket, deleted = response.deleted().len(), "Deleted batch");
        }

        Ok(())
    }
}
