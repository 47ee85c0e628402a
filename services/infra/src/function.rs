//! Compute trigger declaration shared by the pipeline units.

use crate::model::{
    AssemblyError, Expr, FunctionProps, Grant, Resource, ResourceRef, RetryPolicy, RoleProps, Scope,
};
use crate::tools::ArtifactRef;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const RUNTIME: &str = "python3.8";
pub const HANDLER: &str = "handler.lambda_handler";

const BASIC_EXECUTION_POLICY: &str = ":iam::aws:policy/service-role/AWSLambdaBasicExecutionRole";

/// Fingerprint a packaged bundle, mapping I/O failures to an assembly error.
pub fn fingerprint_artifact(path: &Path) -> Result<ArtifactRef, AssemblyError> {
    ArtifactRef::from_path(path).map_err(|source| AssemblyError::Artifact {
        path: path.to_path_buf(),
        source,
    })
}

/// Everything that differs between the pipeline's functions.
#[derive(Debug, Clone)]
pub struct FunctionSettings {
    pub artifact: ArtifactRef,
    pub timeout: Duration,
    pub memory_mb: u32,
    pub layer_export_name: String,
    pub environment: BTreeMap<String, Expr>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct DeclaredFunction {
    pub function: ResourceRef,
    /// Execution role; grants for the function attach here.
    pub role: ResourceRef,
    /// Version pinned to the bundle's content hash.
    pub version: ResourceRef,
}

/// Declare a traced function with its role, pinned version and retry policy.
pub fn declare_function(
    scope: &mut Scope<'_>,
    id: &str,
    settings: FunctionSettings,
) -> Result<DeclaredFunction, AssemblyError> {
    let role = scope.add(
        &format!("{}ServiceRole", id),
        Resource::Role(RoleProps {
            assumed_by: "lambda.amazonaws.com".to_string(),
            managed_policy_arns: vec![Expr::join([
                Expr::literal("arn:"),
                Expr::partition(),
                Expr::literal(BASIC_EXECUTION_POLICY),
            ])],
        }),
    )?;

    let code_sha256 = settings.artifact.content_hash().to_string();
    let function = scope.add(
        id,
        Resource::Function(FunctionProps {
            runtime: RUNTIME.to_string(),
            handler: HANDLER.to_string(),
            code: settings.artifact.clone(),
            role: role.clone(),
            timeout: settings.timeout,
            memory_mb: settings.memory_mb,
            tracing_active: true,
            layers: vec![Expr::ImportValue(settings.layer_export_name)],
            environment: settings.environment,
        }),
    )?;

    // Active tracing needs the role to ship segments.
    scope.grant(Grant::new(
        &role,
        ["xray:PutTraceSegments", "xray:PutTelemetryRecords"],
        vec![Expr::literal("*")],
    ));

    let version = scope.add(
        &format!("{}CurrentVersion", id),
        Resource::FunctionVersion {
            function: function.clone(),
            code_sha256: code_sha256.clone(),
        },
    )?;
    scope.add(
        &format!("{}EventInvokeConfig", id),
        Resource::EventInvokeConfig {
            function: function.clone(),
            retry: settings.retry,
        },
    )?;
    scope.add_artifact(settings.artifact);

    debug!(
        function = %function,
        code_sha256 = %code_sha256,
        timeout_secs = settings.timeout.as_secs(),
        memory_mb = settings.memory_mb,
        "Declared function"
    );

    Ok(DeclaredFunction {
        function,
        role,
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StackBuilder;
    use crate::tools::fingerprint_bytes;
    use std::io::Write;

    #[test]
    fn test_declares_role_version_and_retry_policy() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"bundle").unwrap();
        let artifact = fingerprint_artifact(file.path()).unwrap();

        let mut stack = StackBuilder::new("Test", "assets");
        let declared = {
            let mut scope = stack.scope("Unit");
            declare_function(
                &mut scope,
                "Handler",
                FunctionSettings {
                    artifact,
                    timeout: Duration::from_secs(3),
                    memory_mb: 128,
                    layer_export_name: "LayerExport".to_string(),
                    environment: BTreeMap::new(),
                    retry: RetryPolicy::default(),
                },
            )
            .unwrap()
        };
        let description = stack.build();

        assert_eq!(declared.function.id(), "UnitHandler");
        assert_eq!(declared.role.id(), "UnitHandlerServiceRole");
        match description.get(declared.version.id()) {
            Some(Resource::FunctionVersion { code_sha256, .. }) => {
                assert_eq!(code_sha256, &fingerprint_bytes(b"bundle"));
            }
            other => panic!("Expected version, got {:?}", other),
        }
        assert!(matches!(
            description.get("UnitHandlerEventInvokeConfig"),
            Some(Resource::EventInvokeConfig { retry, .. }) if retry.retry_attempts == 2
        ));
        assert_eq!(description.artifacts().len(), 1);
        assert_eq!(description.grants_for(&declared.role).count(), 1);
    }

    #[test]
    fn test_missing_artifact_is_assembly_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dist/package.zip");

        match fingerprint_artifact(&path) {
            Err(AssemblyError::Artifact { path: p, .. }) => assert_eq!(p, path),
            other => panic!("Expected artifact error, got {:?}", other),
        }
    }
}
