//! Publishing of function bundles to the asset bucket.
//!
//! Bundles are content addressed: each is stored under `<sha256>.zip`, so a
//! bundle already present is never uploaded again. Publishing only copies
//! bytes; it never creates or changes stack resources.

use crate::config::AssetsConfig;
use crate::tools::{fingerprint_bytes, ArtifactRef};
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

const CONTENT_TYPE: &str = "application/zip";

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to read artifact {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact {path} changed since assembly: expected {expected}, found {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Failed to publish {key}: {source:#}")]
    Store {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Object store holding published bundles.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()>;
}

/// S3-backed [`AssetStore`].
pub struct S3AssetStore {
    client: S3Client,
    bucket: String,
    multipart_threshold_bytes: usize,
    part_size_bytes: usize,
}

impl S3AssetStore {
    pub async fn new(config: &AssetsConfig) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.staging_bucket,
            region = %config.region,
            "Asset store initialized"
        );

        Ok(Self {
            client,
            bucket: config.staging_bucket.clone(),
            multipart_threshold_bytes: config.multipart_threshold_bytes,
            part_size_bytes: config.part_size_bytes,
        })
    }

    async fn simple_upload(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(CONTENT_TYPE)
            .send()
            .await
            .context("Failed to upload asset")?;

        Ok(())
    }

    /// Upload in parts. A started upload that fails is aborted, so no
    /// orphaned parts are left billed in the bucket.
    async fn multipart_upload(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(CONTENT_TYPE)
            .send()
            .await
            .context("Failed to create multipart upload")?;

        let upload_id = create_response
            .upload_id()
            .context("No upload ID in response")?;

        or_abort(self.upload_parts(key, upload_id, &body), || {
            self.abort_multipart_upload(key, upload_id)
        })
        .await
    }

    async fn upload_parts(&self, key: &str, upload_id: &str, body: &[u8]) -> Result<()> {
        let mut completed_parts = Vec::new();
        for (index, chunk) in body.chunks(self.part_size_bytes).enumerate() {
            let part_number = i32::try_from(index + 1).context("Too many upload parts")?;

            let response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .context("Failed to upload part")?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .context("Failed to complete multipart upload")?;

        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .context("Failed to abort multipart upload")?;

        warn!(bucket = %self.bucket, key = %key, "Multipart upload aborted");
        Ok(())
    }
}

/// Await `work`; if it fails, run `abort` and return the original error.
async fn or_abort<T, W, A, F>(work: W, abort: A) -> Result<T>
where
    W: Future<Output = Result<T>>,
    A: FnOnce() -> F,
    F: Future<Output = Result<()>>,
{
    match work.await {
        Ok(value) => Ok(value),
        Err(e) => {
            if let Err(abort_error) = abort().await {
                warn!(error = %abort_error, "Cleanup after failed upload also failed");
            }
            Err(e)
        }
    }
}

#[async_trait]
impl AssetStore for S3AssetStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(e).context("Failed to check asset existence")
                }
            }
        }
    }

    #[instrument(skip(self, body), fields(bucket = %self.bucket, size_bytes = body.len()))]
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        if body.len() > self.multipart_threshold_bytes {
            self.multipart_upload(key, body).await
        } else {
            self.simple_upload(key, body).await
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Uploaded { bytes: u64 },
    AlreadyPresent,
}

/// Totals of one publish run.
///
/// The `infra.assets.*` counters only reach a backend when the host installs
/// a `metrics` recorder, so the CLI logs this summary instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub uploaded: usize,
    pub already_present: usize,
    pub bytes: u64,
}

impl PublishSummary {
    pub fn from_outcomes(outcomes: &[(ArtifactRef, PublishOutcome)]) -> Self {
        outcomes
            .iter()
            .fold(Self::default(), |mut summary, (_, outcome)| {
                match outcome {
                    PublishOutcome::Uploaded { bytes } => {
                        summary.uploaded += 1;
                        summary.bytes += bytes;
                    }
                    PublishOutcome::AlreadyPresent => summary.already_present += 1,
                }
                summary
            })
    }
}

/// Uploads a stack's artifacts with bounded concurrency.
pub struct AssetPublisher<S> {
    store: S,
    concurrency: usize,
}

impl<S: AssetStore> AssetPublisher<S> {
    pub fn new(store: S, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Publish every artifact, stopping at the first failure.
    ///
    /// Outcomes are returned in completion order.
    #[instrument(
        skip(self, artifacts),
        fields(artifacts = artifacts.len(), concurrency = self.concurrency)
    )]
    pub async fn publish(
        &self,
        artifacts: &[ArtifactRef],
    ) -> Result<Vec<(ArtifactRef, PublishOutcome)>, PublishError> {
        stream::iter(artifacts)
            .map(|artifact| async move {
                let outcome = self.publish_one(artifact).await?;
                Ok::<_, PublishError>((artifact.clone(), outcome))
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await
    }

    async fn publish_one(&self, artifact: &ArtifactRef) -> Result<PublishOutcome, PublishError> {
        let path = artifact.path();
        let body = tokio::fs::read(path).await.map_err(|source| PublishError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let actual = fingerprint_bytes(&body);
        if actual != artifact.content_hash() {
            metrics::counter!("infra.assets.stale").increment(1);
            return Err(PublishError::HashMismatch {
                path: path.to_path_buf(),
                expected: artifact.content_hash().to_string(),
                actual,
            });
        }

        let key = artifact.deploy_key();
        let store_error = |source| PublishError::Store {
            key: key.clone(),
            source,
        };

        if self.store.exists(&key).await.map_err(store_error)? {
            metrics::counter!("infra.assets.skipped").increment(1);
            debug!(key = %key, path = %path.display(), "Asset already published");
            return Ok(PublishOutcome::AlreadyPresent);
        }

        let size_bytes = body.len() as u64;
        self.store.put(&key, body).await.map_err(store_error)?;

        metrics::counter!("infra.assets.uploaded").increment(1);
        metrics::counter!("infra.assets.bytes").increment(size_bytes);
        info!(
            key = %key,
            path = %path.display(),
            size_bytes = size_bytes,
            "Asset published"
        );

        Ok(PublishOutcome::Uploaded { bytes: size_bytes })
    }
}
