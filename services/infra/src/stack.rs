//! Top-level assembly of the image pipeline.
//!
//! ```text
//!                 ┌──────────────────┐  ObjectCreated   ┌──────────────┐
//!  PUT /images/ ─▶│ ImageBucket      │─────────────────▶│ Upload       │
//!   {item}        │  images/*.jpg    │                  │ Function     │
//!  (gateway)      │  images/*.png    │                  └──────┬───────┘
//!                 └──────────────────┘                         │ publish
//!                          ▲                                   ▼
//!                          │ thumbnails/           ┌──────────────────┐
//!                 ┌────────┴─────────┐  Message    │ ImageUploaded    │
//!                 │ Thumbnail        │◀────────────│ Topic            │
//!                 │ Function         │             └──────────────────┘
//!                 └──────────────────┘
//! ```

use crate::config::Config;
use crate::model::{AssemblyError, StackBuilder, StackDescription};
use crate::observable_bucket::{ObservableBucket, ObservableBucketProps};
use crate::thumbnail_function::{ThumbnailFunction, ThumbnailFunctionProps};
use crate::upload_api::{ImageUploadApi, ImageUploadApiProps};
use std::time::Duration;
use tracing::info;

pub struct ImageStack;

impl ImageStack {
    /// Assemble the stack description.
    ///
    /// Configuration is validated before anything is declared; any error
    /// discards the whole assembly.
    pub fn synth(config: &Config) -> Result<StackDescription, AssemblyError> {
        config.validate()?;
        let (user_pool_arn, audience) = config.validate_identity()?;

        let retry = config.retry_policy();
        let mut stack = StackBuilder::new(&config.stack.name, &config.assets.staging_bucket);

        let observable = ObservableBucket::declare(
            &mut stack,
            "ObservableBucket",
            ObservableBucketProps {
                prefix: config.storage.prefix.clone(),
                suffixes: Some(config.storage.suffixes.clone()),
                log_level: config.functions.log_level,
                service_name: config.functions.service_name.clone(),
                artifact_path: config.asset_path(&config.storage.upload_handler_asset),
                layer_export_name: config.functions.layer_export_name.clone(),
                retry,
            },
        )?;

        ThumbnailFunction::declare(
            &mut stack,
            "ThumbnailFunction",
            ThumbnailFunctionProps {
                topic: observable.topic.clone(),
                destination_bucket: observable.bucket.clone(),
                source_prefix: observable.prefix().to_string(),
                destination_prefix: config.thumbnails.prefix.clone(),
                width: config.thumbnails.width,
                height: config.thumbnails.height,
                log_level: config.functions.log_level,
                service_name: config.functions.service_name.clone(),
                artifact_path: config.asset_path(&config.thumbnails.asset),
                layer_export_name: config.functions.layer_export_name.clone(),
                retry,
                scope_grant_to_prefix: config.thumbnails.scope_grant_to_prefix,
            },
        )?;

        let api = ImageUploadApi::declare(
            &mut stack,
            "ImageUploadApi",
            ImageUploadApiProps {
                bucket: observable.bucket.clone(),
                user_pool_arn: user_pool_arn.to_string(),
                audience: audience.to_string(),
                prefix: Some(observable.prefix().to_string()),
                throttling_rate_limit: config.api.throttling_rate_limit,
                throttling_burst_limit: config.api.throttling_burst_limit,
                authorizer_cache_ttl: config.api.authorizer_cache_ttl_secs.map(Duration::from_secs),
                stage_name: config.api.stage_name.clone(),
            },
        )?;

        stack.output(
            "ImageBucketName",
            observable.bucket.name(),
            "Bucket receiving uploads and thumbnails",
        )?;
        stack.output(
            "ImageUploadedTopicArn",
            observable.topic.arn(),
            "Topic announcing new uploads",
        )?;
        stack.output("UploadApiId", api.api.name(), "Upload REST API id")?;
        stack.output("UploadApiStage", api.stage.name(), "Deployed stage of the upload API")?;

        let description = stack.build();
        info!(
            stack = %description.name(),
            resources = description.resources().count(),
            artifacts = description.artifacts().len(),
            "Stack assembled"
        );

        Ok(description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigValidationError;
    use crate::model::{Expr, Resource, ResourceKind};
    use std::fs;
    use tempfile::TempDir;

    const POOL_ARN: &str =
        "arn:aws:cognito-idp:us-east-1:123456789012:userpool/us-east-1_AbCdEf123";

    fn asset_root() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for rel in [
            "assets/s3-image-upload-lambda/dist/package.zip",
            "assets/thumbnail_lambda/dist/package.zip",
        ] {
            let path = dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, rel.as_bytes()).unwrap();
        }
        dir
    }

    fn config(root: &TempDir) -> Config {
        let mut config = Config::default();
        config.stack.asset_root = root.path().to_path_buf();
        config.identity.user_pool_arn = Some(POOL_ARN.to_string());
        config.identity.audience = Some("client-id".to_string());
        config
    }

    #[test]
    fn test_missing_audience_aborts_assembly() {
        let root = asset_root();
        let mut config = config(&root);
        config.identity.audience = None;

        let err = ImageStack::synth(&config).unwrap_err();
        assert!(matches!(
            &err,
            AssemblyError::Config(ConfigValidationError::MissingField(field))
                if field == "identity.audience (audience)"
        ));
        assert_eq!(
            err.to_string(),
            "Missing required configuration: identity.audience (audience)"
        );
    }

    #[test]
    fn test_missing_user_pool_aborts_assembly() {
        let root = asset_root();
        let mut config = config(&root);
        config.identity.user_pool_arn = None;

        assert!(matches!(
            ImageStack::synth(&config),
            Err(AssemblyError::Config(ConfigValidationError::MissingField(field)))
                if field == "identity.user_pool_arn (cognitoUserPoolArn)"
        ));
    }

    #[test]
    fn test_missing_bundle_aborts_assembly() {
        let root = asset_root();
        fs::remove_file(root.path().join("assets/thumbnail_lambda/dist/package.zip")).unwrap();

        assert!(matches!(
            ImageStack::synth(&config(&root)),
            Err(AssemblyError::Artifact { .. })
        ));
    }

    #[test]
    fn test_assembles_all_units() {
        let root = asset_root();
        let description = ImageStack::synth(&config(&root)).unwrap();

        assert_eq!(description.name(), "ImageUploadStack");
        assert_eq!(description.resources_of(ResourceKind::Bucket).count(), 1);
        assert_eq!(description.resources_of(ResourceKind::Topic).count(), 1);
        assert_eq!(description.resources_of(ResourceKind::Function).count(), 2);
        assert_eq!(description.artifacts().len(), 2);
        // two object-created subscriptions plus the topic subscription
        assert_eq!(description.subscriptions().len(), 3);
        assert_eq!(description.outputs().len(), 4);
    }

    #[test]
    fn test_upload_endpoint_end_to_end() {
        let root = asset_root();
        let description = ImageStack::synth(&config(&root)).unwrap();

        let methods: Vec<_> = description.methods().collect();
        assert_eq!(methods.len(), 1);
        let (_, method) = methods[0];
        assert_eq!(method.http_method, "PUT");
        assert_eq!(
            description.resource_path(&method.resource).as_deref(),
            Some("/images/{item}")
        );

        let authorizer = method.authorizer.as_ref().unwrap();
        match description.get(authorizer.id()) {
            Some(Resource::Authorizer(auth)) => {
                assert_eq!(auth.identity_source, "method.request.header.Authorization");
                assert_eq!(auth.provider_arns, vec![Expr::literal(POOL_ARN)]);
            }
            other => panic!("Expected authorizer, got {:?}", other),
        }

        let role = &method.integration.credentials_role;
        let grants: Vec<_> = description.grants_for(role).collect();
        assert_eq!(grants.len(), 1);
        assert_eq!(
            grants[0].resources,
            vec![Expr::join([
                Expr::GetAtt("ObservableBucketImageBucket".into(), "Arn".into()),
                Expr::literal("/images/*"),
            ])]
        );
    }

    #[test]
    fn test_assembly_is_deterministic() {
        let root = asset_root();
        let config = config(&root);

        let first = ImageStack::synth(&config).unwrap();
        let second = ImageStack::synth(&config).unwrap();
        assert_eq!(
            first.artifacts().iter().map(|a| a.content_hash()).collect::<Vec<_>>(),
            second.artifacts().iter().map(|a| a.content_hash()).collect::<Vec<_>>()
        );
        assert_eq!(
            first.resources().map(|(id, _)| id).collect::<Vec<_>>(),
            second.resources().map(|(id, _)| id).collect::<Vec<_>>()
        );
    }
}
