//! Image store that announces new uploads on a topic.
//!
//! A function subscribed to object-creation events under the upload prefix
//! forwards `{Bucket, Key}` of every recognized image to the topic. It may
//! publish to the topic and nothing else.

use crate::config::LogLevel;
use crate::function::{declare_function, fingerprint_artifact, FunctionSettings};
use crate::model::{
    AssemblyError, BucketProps, EventKind, Expr, Grant, KeyFilter, Resource, ResourceRef,
    RetryPolicy, StackBuilder, Subscription,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_PREFIX: &str = "images/";
pub const DEFAULT_SUFFIXES: [&str; 2] = [".jpg", ".png"];

const TIMEOUT: Duration = Duration::from_secs(3);
const MEMORY_MB: u32 = 128;

/// Leaves room for `-images-`, a 12-digit account and the longest region
/// within the 63-character bucket name limit.
const NAME_PREFIX_MAX_LEN: usize = 28;

/// `<stack>-images-<account>-<region>`, lowercased.
///
/// Built from pseudo parameters only, so the bucket's ARN can be written out
/// without referencing the bucket resource.
pub fn bucket_name(stack_name: &str) -> Expr {
    let mut prefix: String = stack_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    prefix.truncate(NAME_PREFIX_MAX_LEN);
    let prefix = prefix.trim_matches('-');
    let prefix = if prefix.is_empty() { "stack" } else { prefix };

    Expr::join([
        Expr::literal(format!("{}-images-", prefix)),
        Expr::account_id(),
        Expr::literal("-"),
        Expr::region(),
    ])
}

#[derive(Debug, Clone)]
pub struct ObservableBucketProps {
    /// Upload key prefix, default [`DEFAULT_PREFIX`].
    pub prefix: Option<String>,
    /// Recognized suffixes, default [`DEFAULT_SUFFIXES`].
    pub suffixes: Option<Vec<String>>,
    /// Default INFO.
    pub log_level: Option<LogLevel>,
    pub service_name: String,
    pub artifact_path: PathBuf,
    pub layer_export_name: String,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct ObservableBucket {
    pub bucket: ResourceRef,
    pub topic: ResourceRef,
    pub function: ResourceRef,
    prefix: String,
    filters: Vec<KeyFilter>,
}

impl ObservableBucket {
    pub fn declare(
        stack: &mut StackBuilder,
        id: &str,
        props: ObservableBucketProps,
    ) -> Result<Self, AssemblyError> {
        let prefix = props.prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string());
        let suffixes = props
            .suffixes
            .unwrap_or_else(|| DEFAULT_SUFFIXES.iter().map(|s| s.to_string()).collect());
        let log_level = props.log_level.unwrap_or_default();
        let artifact = fingerprint_artifact(&props.artifact_path)?;

        let name = bucket_name(stack.name());
        let mut scope = stack.scope(id);

        let bucket = scope.add(
            "ImageBucket",
            Resource::Bucket(BucketProps {
                bucket_name: Some(name),
                versioned: true,
                s3_managed_encryption: true,
                block_public_access: true,
            }),
        )?;
        let topic = scope.add("ImageUploadedTopic", Resource::Topic)?;

        let declared = declare_function(
            &mut scope,
            "S3ImageUploadFunction",
            FunctionSettings {
                artifact,
                timeout: TIMEOUT,
                memory_mb: MEMORY_MB,
                layer_export_name: props.layer_export_name,
                environment: BTreeMap::from([
                    ("SNS_TOPIC_ARN".to_string(), topic.arn()),
                    ("LOG_LEVEL".to_string(), Expr::literal(log_level.as_str())),
                    ("POWERTOOLS_SERVICE_NAME".to_string(), Expr::literal(props.service_name)),
                ]),
                retry: props.retry,
            },
        )?;

        scope.grant(Grant::new(&declared.role, ["sns:Publish"], vec![topic.arn()]));

        let filters: Vec<KeyFilter> = suffixes
            .iter()
            .map(|suffix| KeyFilter::new(&prefix, suffix.as_str()))
            .collect();
        for filter in &filters {
            scope.subscribe(Subscription {
                publisher: bucket.clone(),
                subscriber: declared.function.clone(),
                events: BTreeSet::from([EventKind::ObjectCreated]),
                filter: Some(filter.clone()),
            });
        }

        info!(
            bucket = %bucket,
            topic = %topic,
            prefix = %prefix,
            suffixes = ?suffixes,
            "Declared observable bucket"
        );

        Ok(Self {
            bucket,
            topic,
            function: declared.function,
            prefix,
            filters,
        })
    }

    /// Upload prefix as configured (trailing separator kept).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn filters(&self) -> &[KeyFilter] {
        &self.filters
    }

    /// Whether creating `key` notifies the topic.
    pub fn notifies(&self, key: &str) -> bool {
        self.filters.iter().any(|f| f.matches(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StackDescription;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn artifact() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"upload handler bundle").unwrap();
        file
    }

    fn props(path: PathBuf) -> ObservableBucketProps {
        ObservableBucketProps {
            prefix: None,
            suffixes: None,
            log_level: None,
            service_name: "image-upload".to_string(),
            artifact_path: path,
            layer_export_name: "PowertoolsLayer".to_string(),
            retry: RetryPolicy::default(),
        }
    }

    fn declare(props: ObservableBucketProps) -> (StackDescription, ObservableBucket) {
        let mut stack = StackBuilder::new("Test", "assets");
        let unit = ObservableBucket::declare(&mut stack, "ObservableBucket", props).unwrap();
        (stack.build(), unit)
    }

    #[test]
    fn test_defaults() {
        let file = artifact();
        let (_, unit) = declare(props(file.path().to_path_buf()));

        assert_eq!(unit.prefix(), "images/");
        assert_eq!(unit.filters().len(), 2);
        assert!(unit.notifies("images/foo.jpg"));
        assert!(unit.notifies("images/foo.png"));
        assert!(!unit.notifies("images/foo.gif"));
        assert!(!unit.notifies("other/foo.jpg"));
    }

    #[test]
    fn test_bucket_is_private_encrypted_versioned() {
        let file = artifact();
        let (description, unit) = declare(props(file.path().to_path_buf()));

        assert_eq!(
            description.get(unit.bucket.id()),
            Some(&Resource::Bucket(BucketProps {
                bucket_name: Some(bucket_name("Test")),
                versioned: true,
                s3_managed_encryption: true,
                block_public_access: true,
            }))
        );
    }

    #[test]
    fn test_bucket_name_is_lowercase_and_bounded() {
        assert_eq!(
            bucket_name("ImageUploadStack"),
            Expr::join([
                Expr::literal("imageuploadstack-images-"),
                Expr::account_id(),
                Expr::literal("-"),
                Expr::region(),
            ])
        );

        match bucket_name("My_Very-Long.Stack-Name-That-Keeps-Going") {
            Expr::Join(parts) => {
                let prefix = parts[0].as_literal().unwrap();
                assert_eq!(prefix, "my-very-long-stack-name-that-images-");
                assert!(prefix.len() <= NAME_PREFIX_MAX_LEN + "-images-".len());
            }
            other => panic!("Expected join, got {:?}", other),
        }
    }

    #[test]
    fn test_one_subscription_per_suffix() {
        let file = artifact();
        let (description, unit) = declare(props(file.path().to_path_buf()));

        let subs = description.subscriptions();
        assert_eq!(subs.len(), 2);
        for sub in subs {
            assert_eq!(sub.publisher, unit.bucket);
            assert_eq!(sub.subscriber, unit.function);
            assert!(sub.events.contains(&EventKind::ObjectCreated));
        }
        let suffixes: Vec<_> = subs
            .iter()
            .filter_map(|s| s.filter.as_ref().map(|f| f.suffix().to_string()))
            .collect();
        assert_eq!(suffixes, vec![".jpg", ".png"]);
    }

    #[test]
    fn test_function_may_only_publish() {
        let file = artifact();
        let (description, unit) = declare(props(file.path().to_path_buf()));

        let role = match description.get(unit.function.id()) {
            Some(Resource::Function(f)) => {
                assert_eq!(f.timeout, Duration::from_secs(3));
                assert_eq!(f.memory_mb, 128);
                assert_eq!(f.environment["SNS_TOPIC_ARN"], unit.topic.arn());
                assert_eq!(f.environment["LOG_LEVEL"], Expr::literal("INFO"));
                f.role.clone()
            }
            other => panic!("Expected function, got {:?}", other),
        };

        let topic_grants: Vec<_> = description
            .grants_for(&role)
            .filter(|g| g.resources.contains(&unit.topic.arn()))
            .collect();
        assert_eq!(topic_grants.len(), 1);
        assert_eq!(
            topic_grants[0].actions.iter().collect::<Vec<_>>(),
            vec!["sns:Publish"]
        );
        assert!(description
            .grants_for(&role)
            .all(|g| !g.resources.iter().any(|r| r == &unit.bucket.arn())));
    }

    #[test]
    fn test_custom_prefix_and_log_level() {
        let file = artifact();
        let mut p = props(file.path().to_path_buf());
        p.prefix = Some("uploads/".to_string());
        p.log_level = Some(LogLevel::Debug);
        let (description, unit) = declare(p);

        assert!(unit.notifies("uploads/cat.jpg"));
        assert!(!unit.notifies("images/cat.jpg"));
        match description.get(unit.function.id()) {
            Some(Resource::Function(f)) => {
                assert_eq!(f.environment["LOG_LEVEL"], Expr::literal("DEBUG"))
            }
            other => panic!("Expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_artifact_declares_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = StackBuilder::new("Test", "assets");

        let result = ObservableBucket::declare(
            &mut stack,
            "ObservableBucket",
            props(dir.path().join("missing.zip")),
        );

        assert!(matches!(result, Err(AssemblyError::Artifact { .. })));
        assert_eq!(stack.build().resources().count(), 0);
    }
}
