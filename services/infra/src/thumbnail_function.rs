//! Thumbnail generation subscribed to the upload topic.
//!
//! One invocation per topic message; invocations are independent and may run
//! concurrently in any order. The function reads the source object and writes
//! the thumbnail under the destination prefix.

use crate::config::LogLevel;
use crate::function::{declare_function, fingerprint_artifact, FunctionSettings};
use crate::model::{
    AssemblyError, EventKind, Expr, Grant, Resource, ResourceRef, RetryPolicy, StackBuilder,
    Subscription,
};
use crate::tools::path_glob;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_THUMBNAIL_SIZE: u32 = 128;

const TIMEOUT: Duration = Duration::from_secs(5);
const MEMORY_MB: u32 = 256;

/// Object and bucket read actions.
pub const READ_ACTIONS: [&str; 3] = ["s3:GetObject*", "s3:GetBucket*", "s3:List*"];

/// Object write actions. The `PutObject` family is listed out so that
/// `PutObjectAcl` stays excluded.
pub const WRITE_ACTIONS: [&str; 7] = [
    "s3:DeleteObject*",
    "s3:PutObject",
    "s3:PutObjectLegalHold",
    "s3:PutObjectRetention",
    "s3:PutObjectTagging",
    "s3:PutObjectVersionTagging",
    "s3:Abort*",
];

#[derive(Debug, Clone)]
pub struct ThumbnailFunctionProps {
    pub topic: ResourceRef,
    pub destination_bucket: ResourceRef,
    /// Prefix the uploaded source images live under.
    pub source_prefix: String,
    pub destination_prefix: String,
    /// Default [`DEFAULT_THUMBNAIL_SIZE`].
    pub width: Option<u32>,
    /// Default [`DEFAULT_THUMBNAIL_SIZE`].
    pub height: Option<u32>,
    /// Default INFO.
    pub log_level: Option<LogLevel>,
    pub service_name: String,
    pub artifact_path: PathBuf,
    pub layer_export_name: String,
    pub retry: RetryPolicy,
    /// Read only under `source_prefix` and write only under
    /// `destination_prefix`. Off by default, which grants read/write on the
    /// whole bucket.
    pub scope_grant_to_prefix: bool,
}

#[derive(Debug, Clone)]
pub struct ThumbnailFunction {
    pub function: ResourceRef,
    pub role: ResourceRef,
    pub width: u32,
    pub height: u32,
}

impl ThumbnailFunction {
    pub fn declare(
        stack: &mut StackBuilder,
        id: &str,
        props: ThumbnailFunctionProps,
    ) -> Result<Self, AssemblyError> {
        let width = props.width.unwrap_or(DEFAULT_THUMBNAIL_SIZE);
        let height = props.height.unwrap_or(DEFAULT_THUMBNAIL_SIZE);
        let log_level = props.log_level.unwrap_or_default();
        let artifact = fingerprint_artifact(&props.artifact_path)?;

        let mut scope = stack.scope(id);
        let bucket = &props.destination_bucket;

        let declared = declare_function(
            &mut scope,
            "ThumbnailFunction",
            FunctionSettings {
                artifact,
                timeout: TIMEOUT,
                memory_mb: MEMORY_MB,
                layer_export_name: props.layer_export_name.clone(),
                environment: BTreeMap::from([
                    ("LOG_LEVEL".to_string(), Expr::literal(log_level.as_str())),
                    (
                        "POWERTOOLS_SERVICE_NAME".to_string(),
                        Expr::literal(props.service_name.clone()),
                    ),
                    ("THUMBNAIL_WIDTH".to_string(), Expr::literal(width.to_string())),
                    ("THUMBNAIL_HEIGHT".to_string(), Expr::literal(height.to_string())),
                    ("THUMBNAIL_BUCKET".to_string(), bucket.name()),
                    (
                        "THUMBNAIL_PREFIX".to_string(),
                        Expr::literal(props.destination_prefix.clone()),
                    ),
                ]),
                retry: props.retry,
            },
        )?;

        let objects = |prefix: Option<&str>| {
            Expr::join([bucket.arn(), Expr::literal(format!("/{}", path_glob(prefix)))])
        };
        if props.scope_grant_to_prefix {
            scope.grant(Grant::new(
                &declared.role,
                READ_ACTIONS,
                vec![bucket.arn(), objects(Some(props.source_prefix.as_str()))],
            ));
            scope.grant(Grant::new(
                &declared.role,
                WRITE_ACTIONS,
                vec![objects(Some(props.destination_prefix.as_str()))],
            ));
        } else {
            warn!(
                bucket = %bucket,
                prefix = %props.destination_prefix,
                "Thumbnail function may read and write the whole destination bucket"
            );
            scope.grant(Grant::new(
                &declared.role,
                READ_ACTIONS.iter().chain(WRITE_ACTIONS.iter()).copied(),
                vec![bucket.arn(), objects(None)],
            ));
        }

        scope.subscribe(Subscription {
            publisher: props.topic.clone(),
            subscriber: declared.function.clone(),
            events: BTreeSet::from([EventKind::Message]),
            filter: None,
        });

        info!(
            function = %declared.function,
            width = width,
            height = height,
            prefix = %props.destination_prefix,
            "Declared thumbnail function"
        );

        Ok(Self {
            function: declared.function,
            role: declared.role,
            width,
            height,
        })
    }
}
