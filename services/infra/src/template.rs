//! Rendering and writing of the provider template.
//!
//! This is the only place the assembled description leaves the process.
//! Grants become one IAM policy per role; subscriptions become bucket
//! notification rules, topic subscriptions and invoke permissions.

use crate::model::{
    BucketProps, EventKind, Expr, Grant, Resource, ResourceRef, StackDescription, Subscription,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, trace};

const FORMAT_VERSION: &str = "2010-09-09";
const POLICY_VERSION: &str = "2012-10-17";

#[derive(Error, Debug)]
pub enum SynthError {
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Render the description as a CloudFormation template.
pub fn render(description: &StackDescription) -> Value {
    let mut resources = Map::new();
    let events = EventWiring::collect(description);
    let policies = policies_by_role(description.grants());

    for (id, resource) in description.resources() {
        let mut entry = json!({
            "Type": resource.kind().type_name(),
            "Properties": properties(description, resource),
        });

        match resource {
            Resource::Bucket(_) => {
                if let Some(rules) = events.bucket_rules.get(id) {
                    entry["Properties"]["NotificationConfiguration"] =
                        json!({ "LambdaConfigurations": rules });
                    if let Some(depends_on) = events.bucket_depends_on.get(id) {
                        entry["DependsOn"] = json!(depends_on);
                    }
                }
            }
            Resource::Function(f) => {
                if policies.contains_key(f.role.id()) {
                    entry["DependsOn"] = json!([policy_id(&f.role), f.role.id()]);
                }
            }
            Resource::Authorizer(auth) => {
                entry["Metadata"] = json!({ "Audience": auth.audience });
            }
            Resource::Deployment { depends_on, .. } => {
                let ids: Vec<&str> = depends_on.iter().map(ResourceRef::id).collect();
                entry["DependsOn"] = json!(ids);
            }
            _ => {}
        }

        resources.insert(id.to_string(), entry);
    }

    for (role_id, (role, grants)) in &policies {
        let statements: Vec<Value> = grants.iter().copied().map(statement).collect();
        resources.insert(
            policy_id(role),
            json!({
                "Type": "AWS::IAM::Policy",
                "Properties": {
                    "PolicyName": policy_id(role),
                    "PolicyDocument": { "Version": POLICY_VERSION, "Statement": statements },
                    "Roles": [role.name().to_json()],
                },
            }),
        );
        trace!(role = %role_id, statements = grants.len(), "Rendered policy");
    }

    for (id, entry) in events.extra_resources {
        resources.insert(id, entry);
    }

    let outputs: Map<String, Value> = description
        .outputs()
        .iter()
        .map(|o| {
            (
                o.id.clone(),
                json!({ "Description": o.description, "Value": o.value.to_json() }),
            )
        })
        .collect();

    let artifacts: Vec<Value> = description
        .artifacts()
        .iter()
        .map(|a| {
            json!({
                "Path": a.path().display().to_string(),
                "ContentHash": a.content_hash(),
                "DeployKey": a.deploy_key(),
            })
        })
        .collect();

    json!({
        "AWSTemplateFormatVersion": FORMAT_VERSION,
        "Description": format!("{} image upload and thumbnail pipeline", description.name()),
        "Metadata": { "Artifacts": artifacts },
        "Resources": resources,
        "Outputs": outputs,
    })
}

fn properties(description: &StackDescription, resource: &Resource) -> Value {
    match resource {
        Resource::Bucket(b) => {
            let mut props = Map::new();
            if let Some(name) = &b.bucket_name {
                props.insert("BucketName".into(), name.to_json());
            }
            if b.versioned {
                props.insert("VersioningConfiguration".into(), json!({ "Status": "Enabled" }));
            }
            if b.s3_managed_encryption {
                props.insert(
                    "BucketEncryption".into(),
                    json!({
                        "ServerSideEncryptionConfiguration": [
                            { "ServerSideEncryptionByDefault": { "SSEAlgorithm": "AES256" } }
                        ]
                    }),
                );
            }
            if b.block_public_access {
                props.insert(
                    "PublicAccessBlockConfiguration".into(),
                    json!({
                        "BlockPublicAcls": true,
                        "BlockPublicPolicy": true,
                        "IgnorePublicAcls": true,
                        "RestrictPublicBuckets": true,
                    }),
                );
            }
            Value::Object(props)
        }
        Resource::Topic => json!({}),
        Resource::Function(f) => {
            let variables: Map<String, Value> = f
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect();
            json!({
                "Runtime": f.runtime,
                "Handler": f.handler,
                "Code": {
                    "S3Bucket": description.asset_bucket(),
                    "S3Key": f.code.deploy_key(),
                },
                "Role": f.role.arn().to_json(),
                "Timeout": f.timeout.as_secs(),
                "MemorySize": f.memory_mb,
                "TracingConfig": {
                    "Mode": if f.tracing_active { "Active" } else { "PassThrough" },
                },
                "Layers": exprs(&f.layers),
                "Environment": { "Variables": variables },
            })
        }
        Resource::FunctionVersion {
            function,
            code_sha256,
        } => json!({
            "FunctionName": function.name().to_json(),
            "CodeSha256": code_sha256,
        }),
        Resource::EventInvokeConfig { function, retry } => json!({
            "FunctionName": function.name().to_json(),
            "Qualifier": "$LATEST",
            "MaximumRetryAttempts": retry.retry_attempts,
            "MaximumEventAgeInSeconds": retry.max_event_age.as_secs(),
        }),
        Resource::Role(r) => {
            let mut props = json!({
                "AssumeRolePolicyDocument": {
                    "Version": POLICY_VERSION,
                    "Statement": [{
                        "Action": "sts:AssumeRole",
                        "Effect": "Allow",
                        "Principal": { "Service": r.assumed_by },
                    }],
                },
            });
            if !r.managed_policy_arns.is_empty() {
                props["ManagedPolicyArns"] = json!(exprs(&r.managed_policy_arns));
            }
            props
        }
        Resource::RestApi(api) => json!({
            "Name": api.name,
            "BinaryMediaTypes": api.binary_media_types,
        }),
        Resource::ApiResource(decl) => {
            let parent = match &decl.parent {
                Some(p) => p.name(),
                None => Expr::GetAtt(decl.api.id().to_string(), "RootResourceId".to_string()),
            };
            json!({
                "RestApiId": decl.api.name().to_json(),
                "ParentId": parent.to_json(),
                "PathPart": decl.path_part,
            })
        }
        Resource::Method(m) => {
            let integration = &m.integration;
            let uri = Expr::join([
                Expr::literal("arn:"),
                Expr::partition(),
                Expr::literal(":apigateway:"),
                Expr::region(),
                Expr::literal(format!(":{}:path/{}", integration.service, integration.path)),
            ]);
            let integration_parameters: Map<String, Value> = integration
                .request_parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect();

            let mut integration_responses = vec![json!({
                "StatusCode": integration.responses.default_status().to_string()
            })];
            for rule in integration.responses.rules() {
                integration_responses.push(json!({
                    "SelectionPattern": rule.upstream.selection_pattern(),
                    "StatusCode": rule.status.to_string(),
                    "ResponseTemplates": rule.templates,
                }));
            }

            let method_responses: Vec<Value> = m
                .method_responses
                .iter()
                .map(|r| {
                    if r.error_model {
                        json!({
                            "StatusCode": r.status_code.to_string(),
                            "ResponseModels": { "application/json": "Error" },
                        })
                    } else {
                        json!({ "StatusCode": r.status_code.to_string() })
                    }
                })
                .collect();

            let mut props = json!({
                "RestApiId": m.api.name().to_json(),
                "ResourceId": m.resource.name().to_json(),
                "HttpMethod": m.http_method,
                "AuthorizationType": "NONE",
                "RequestParameters": m.request_parameters,
                "Integration": {
                    "Type": "AWS",
                    "IntegrationHttpMethod": integration.integration_http_method,
                    "Uri": uri.to_json(),
                    "Credentials": integration.credentials_role.arn().to_json(),
                    "RequestParameters": integration_parameters,
                    "IntegrationResponses": integration_responses,
                },
                "MethodResponses": method_responses,
            });
            if let Some(authorizer) = &m.authorizer {
                props["AuthorizationType"] = json!("COGNITO_USER_POOLS");
                props["AuthorizerId"] = authorizer.name().to_json();
            }
            props
        }
        Resource::Authorizer(a) => json!({
            "Name": a.name,
            "RestApiId": a.api.name().to_json(),
            "Type": "COGNITO_USER_POOLS",
            "ProviderARNs": exprs(&a.provider_arns),
            "IdentitySource": a.identity_source,
            "AuthorizerResultTtlInSeconds": a.results_cache_ttl.as_secs(),
        }),
        Resource::GatewayResponse {
            api,
            response_type,
            templates,
        } => json!({
            "RestApiId": api.name().to_json(),
            "ResponseType": response_type,
            "ResponseTemplates": templates,
        }),
        Resource::Deployment { api, .. } => json!({
            "RestApiId": api.name().to_json(),
        }),
        Resource::Stage(s) => json!({
            "RestApiId": s.api.name().to_json(),
            "DeploymentId": s.deployment.name().to_json(),
            "StageName": s.stage_name,
            "MethodSettings": [{
                "ResourcePath": "/*",
                "HttpMethod": "*",
                "ThrottlingRateLimit": s.throttle.rate_limit,
                "ThrottlingBurstLimit": s.throttle.burst_limit,
            }],
        }),
    }
}

fn exprs(values: &[Expr]) -> Vec<Value> {
    values.iter().map(Expr::to_json).collect()
}

fn policy_id(role: &ResourceRef) -> String {
    format!("{}DefaultPolicy", role.id())
}

fn statement(grant: &Grant) -> Value {
    json!({
        "Effect": "Allow",
        "Action": grant.actions,
        "Resource": exprs(&grant.resources),
    })
}

fn policies_by_role(grants: &[Grant]) -> BTreeMap<String, (ResourceRef, Vec<&Grant>)> {
    let mut policies: BTreeMap<String, (ResourceRef, Vec<&Grant>)> = BTreeMap::new();
    for grant in grants {
        policies
            .entry(grant.principal.id().to_string())
            .or_insert_with(|| (grant.principal.clone(), Vec::new()))
            .1
            .push(grant);
    }
    policies
}

/// Provider resources derived from the declared subscriptions.
#[derive(Default)]
struct EventWiring {
    bucket_rules: BTreeMap<String, Vec<Value>>,
    bucket_depends_on: BTreeMap<String, Vec<String>>,
    extra_resources: Vec<(String, Value)>,
}

impl EventWiring {
    fn collect(description: &StackDescription) -> Self {
        let mut wiring = Self::default();

        for sub in description.subscriptions() {
            for event in &sub.events {
                match event {
                    EventKind::ObjectCreated => wiring.object_created(description, sub),
                    EventKind::Message => wiring.message(sub),
                }
            }
        }

        wiring
    }

    /// The bucket waits for its invoke permissions, so the permissions must
    /// not reference the bucket resource.
    fn object_created(&mut self, description: &StackDescription, sub: &Subscription) {
        let mut rules = Vec::new();
        if let Some(filter) = &sub.filter {
            if !filter.key_prefix().is_empty() {
                rules.push(json!({ "Name": "prefix", "Value": filter.key_prefix() }));
            }
            if !filter.suffix().is_empty() {
                rules.push(json!({ "Name": "suffix", "Value": filter.suffix() }));
            }
        }

        let mut rule = json!({
            "Event": "s3:ObjectCreated:*",
            "Function": sub.subscriber.arn().to_json(),
        });
        if !rules.is_empty() {
            rule["Filter"] = json!({ "S3Key": { "Rules": rules } });
        }

        let bucket = sub.publisher.id().to_string();
        self.bucket_rules.entry(bucket.clone()).or_default().push(rule);

        let source_arn = match description.get(sub.publisher.id()) {
            Some(Resource::Bucket(BucketProps {
                bucket_name: Some(name),
                ..
            })) => Some(Expr::join([
                Expr::literal("arn:"),
                Expr::partition(),
                Expr::literal(":s3:::"),
                name.clone(),
            ])),
            _ => None,
        };
        let permission = self.permission(sub, "s3.amazonaws.com", source_arn);
        let depends = self.bucket_depends_on.entry(bucket).or_default();
        if !depends.contains(&permission) {
            depends.push(permission);
        }
    }

    fn message(&mut self, sub: &Subscription) {
        let id = format!("{}Subscription{}", sub.subscriber.id(), sub.publisher.id());
        if self.contains(&id) {
            return;
        }
        self.extra_resources.push((
            id,
            json!({
                "Type": "AWS::SNS::Subscription",
                "Properties": {
                    "Protocol": "lambda",
                    "TopicArn": sub.publisher.arn().to_json(),
                    "Endpoint": sub.subscriber.arn().to_json(),
                },
            }),
        ));
        self.permission(sub, "sns.amazonaws.com", Some(sub.publisher.arn()));
    }

    /// Invoke permission for `sub`; one per publisher/subscriber pair.
    ///
    /// Without a source ARN the permission is scoped to the account only.
    fn permission(
        &mut self,
        sub: &Subscription,
        principal: &str,
        source_arn: Option<Expr>,
    ) -> String {
        let id = format!("{}AllowInvoke{}", sub.subscriber.id(), sub.publisher.id());
        if !self.contains(&id) {
            let mut properties = json!({
                "Action": "lambda:InvokeFunction",
                "FunctionName": sub.subscriber.arn().to_json(),
                "Principal": principal,
                "SourceAccount": Expr::account_id().to_json(),
            });
            if let Some(arn) = source_arn {
                properties["SourceArn"] = arn.to_json();
            }
            self.extra_resources.push((
                id.clone(),
                json!({ "Type": "AWS::Lambda::Permission", "Properties": properties }),
            ));
        }
        id
    }

    fn contains(&self, id: &str) -> bool {
        self.extra_resources.iter().any(|(rid, _)| rid == id)
    }
}

/// Files written by [`Synthesizer::apply`].
#[derive(Debug, Clone)]
pub struct SynthOutput {
    pub template_path: PathBuf,
    pub manifest_path: PathBuf,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Manifest<'a> {
    stack: &'a str,
    template: String,
    asset_bucket: &'a str,
    synthesized_at: DateTime<Utc>,
    artifacts: Vec<ManifestArtifact>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ManifestArtifact {
    path: PathBuf,
    content_hash: String,
    deploy_key: String,
}

/// Writes the template and manifest for an assembled stack.
pub struct Synthesizer {
    out_dir: PathBuf,
}

impl Synthesizer {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Write `<stack>.template.json` and `manifest.json`.
    ///
    /// Each file is written next to its destination and renamed into place.
    pub fn apply(&self, description: &StackDescription) -> Result<SynthOutput, SynthError> {
        fs::create_dir_all(&self.out_dir).map_err(|source| SynthError::Io {
            path: self.out_dir.clone(),
            source,
        })?;

        let template_name = format!("{}.template.json", description.name());
        let template = serde_json::to_vec_pretty(&render(description)).map_err(|source| {
            SynthError::Serialize {
                what: "template",
                source,
            }
        })?;

        let manifest = Manifest {
            stack: description.name(),
            template: template_name.clone(),
            asset_bucket: description.asset_bucket(),
            synthesized_at: Utc::now(),
            artifacts: description
                .artifacts()
                .iter()
                .map(|a| ManifestArtifact {
                    path: a.path().to_path_buf(),
                    content_hash: a.content_hash().to_string(),
                    deploy_key: a.deploy_key(),
                })
                .collect(),
        };
        let manifest = serde_json::to_vec_pretty(&manifest).map_err(|source| SynthError::Serialize {
            what: "manifest",
            source,
        })?;

        let template_path = self.out_dir.join(&template_name);
        let manifest_path = self.out_dir.join("manifest.json");
        write_atomic(&template_path, &template)?;
        write_atomic(&manifest_path, &manifest)?;

        info!(
            template = %template_path.display(),
            manifest = %manifest_path.display(),
            "Stack synthesized"
        );

        Ok(SynthOutput {
            template_path,
            manifest_path,
        })
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SynthError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)
        .and_then(|_| fs::rename(&tmp, path))
        .map_err(|source| SynthError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::observable_bucket::bucket_name;
    use crate::stack::ImageStack;
    use crate::upload_api::{GATEWAY_ERROR_TEMPLATE, UPSTREAM_ERROR_TEMPLATE};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    type Graph = BTreeMap<String, BTreeSet<String>>;

    fn references(value: &Value, out: &mut BTreeSet<String>) {
        match value {
            Value::Object(map) => {
                for (key, v) in map {
                    match (key.as_str(), v) {
                        ("Ref", Value::String(id)) => {
                            out.insert(id.clone());
                        }
                        ("Fn::GetAtt", Value::Array(parts)) => {
                            if let Some(Value::String(id)) = parts.first() {
                                out.insert(id.clone());
                            }
                        }
                        _ => references(v, out),
                    }
                }
            }
            Value::Array(items) => items.iter().for_each(|v| references(v, out)),
            _ => {}
        }
    }

    /// Edges from each resource to the resources it refers to or waits for.
    fn dependency_graph(template: &Value) -> Graph {
        let resources = template["Resources"].as_object().unwrap();
        resources
            .iter()
            .map(|(id, resource)| {
                let mut deps = BTreeSet::new();
                references(&resource["Properties"], &mut deps);
                match &resource["DependsOn"] {
                    Value::String(dep) => {
                        deps.insert(dep.clone());
                    }
                    Value::Array(list) => {
                        deps.extend(list.iter().filter_map(|d| d.as_str().map(String::from)))
                    }
                    _ => {}
                }
                deps.retain(|dep| resources.contains_key(dep));
                (id.clone(), deps)
            })
            .collect()
    }

    fn find_cycle(graph: &Graph) -> Option<Vec<String>> {
        fn visit<'a>(
            node: &'a str,
            graph: &'a Graph,
            path: &mut Vec<&'a str>,
            done: &mut BTreeSet<&'a str>,
        ) -> Option<Vec<String>> {
            if let Some(start) = path.iter().position(|n| *n == node) {
                return Some(path[start..].iter().map(|n| n.to_string()).collect());
            }
            if done.contains(node) {
                return None;
            }
            path.push(node);
            for next in graph.get(node).into_iter().flatten() {
                if let Some(cycle) = visit(next, graph, path, done) {
                    return Some(cycle);
                }
            }
            path.pop();
            done.insert(node);
            None
        }

        let mut done = BTreeSet::new();
        for node in graph.keys() {
            if let Some(cycle) = visit(node, graph, &mut Vec::new(), &mut done) {
                return Some(cycle);
            }
        }
        None
    }

    const POOL_ARN: &str =
        "arn:aws:cognito-idp:us-east-1:123456789012:userpool/us-east-1_AbCdEf123";

    fn assembled() -> (TempDir, StackDescription) {
        let dir = tempfile::tempdir().unwrap();
        for rel in [
            "assets/s3-image-upload-lambda/dist/package.zip",
            "assets/thumbnail_lambda/dist/package.zip",
        ] {
            let path = dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, rel.as_bytes()).unwrap();
        }

        let mut config = Config::default();
        config.stack.asset_root = dir.path().to_path_buf();
        config.identity.user_pool_arn = Some(POOL_ARN.to_string());
        config.identity.audience = Some("client-id".to_string());

        let description = ImageStack::synth(&config).unwrap();
        (dir, description)
    }

    #[test]
    fn test_bucket_notifications_rendered() {
        let (_dir, description) = assembled();
        let template = render(&description);

        let bucket = &template["Resources"]["ObservableBucketImageBucket"];
        assert_eq!(bucket["Type"], "AWS::S3::Bucket");
        assert_eq!(bucket["Properties"]["VersioningConfiguration"]["Status"], "Enabled");

        let rules = bucket["Properties"]["NotificationConfiguration"]["LambdaConfigurations"]
            .as_array()
            .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0]["Event"], "s3:ObjectCreated:*");
        assert_eq!(
            rules[0]["Filter"]["S3Key"]["Rules"],
            json!([
                { "Name": "prefix", "Value": "images/" },
                { "Name": "suffix", "Value": ".jpg" },
            ])
        );

        let permission =
            "ObservableBucketS3ImageUploadFunctionAllowInvokeObservableBucketImageBucket";
        assert_eq!(bucket["DependsOn"], json!([permission]));
        assert_eq!(
            template["Resources"][permission]["Properties"]["Principal"],
            "s3.amazonaws.com"
        );
    }

    #[test]
    fn test_cycle_detection_finds_mutual_dependency() {
        let template = json!({
            "Resources": {
                "Bucket": { "Properties": {}, "DependsOn": ["Permission"] },
                "Permission": {
                    "Properties": { "SourceArn": { "Fn::GetAtt": ["Bucket", "Arn"] } }
                },
            }
        });
        assert!(find_cycle(&dependency_graph(&template)).is_some());
    }

    #[test]
    fn test_rendered_template_has_no_dependency_cycle() {
        let (_dir, description) = assembled();
        let graph = dependency_graph(&render(&description));

        let bucket = "ObservableBucketImageBucket";
        let permission =
            "ObservableBucketS3ImageUploadFunctionAllowInvokeObservableBucketImageBucket";
        assert!(graph[bucket].contains(permission));
        assert!(!graph[permission].contains(bucket));
        assert_eq!(find_cycle(&graph), None);
    }

    #[test]
    fn test_bucket_permission_uses_bucket_name() {
        let (_dir, description) = assembled();
        let template = render(&description);
        let name = bucket_name("ImageUploadStack");

        let bucket = &template["Resources"]["ObservableBucketImageBucket"];
        assert_eq!(bucket["Properties"]["BucketName"], name.to_json());

        let permission = &template["Resources"]
            ["ObservableBucketS3ImageUploadFunctionAllowInvokeObservableBucketImageBucket"];
        assert_eq!(
            permission["Properties"]["SourceArn"],
            Expr::join([
                Expr::literal("arn:"),
                Expr::partition(),
                Expr::literal(":s3:::"),
                name,
            ])
            .to_json()
        );
        assert_eq!(
            permission["Properties"]["SourceAccount"],
            json!({ "Ref": "AWS::AccountId" })
        );
    }

    #[test]
    fn test_error_envelopes_and_media_types_rendered() {
        let (_dir, description) = assembled();
        let template = render(&description);
        let resources = &template["Resources"];

        assert_eq!(
            resources["ImageUploadApiRestApi"]["Properties"]["BinaryMediaTypes"],
            json!(["*/*"])
        );
        for id in ["ImageUploadApiDefault4XX", "ImageUploadApiDefault5XX"] {
            assert_eq!(
                resources[id]["Properties"]["ResponseTemplates"],
                json!({ "application/json": GATEWAY_ERROR_TEMPLATE })
            );
        }

        let responses = resources["ImageUploadApiImagesItemPut"]["Properties"]["Integration"]
            ["IntegrationResponses"]
            .as_array()
            .unwrap();
        let errors: Vec<_> = responses
            .iter()
            .filter(|r| r.get("SelectionPattern").is_some())
            .collect();
        assert_eq!(errors.len(), 3);
        for response in errors {
            assert_eq!(
                response["ResponseTemplates"],
                json!({ "application/xml": UPSTREAM_ERROR_TEMPLATE })
            );
        }
    }

    #[test]
    fn test_topic_subscription_rendered() {
        let (_dir, description) = assembled();
        let template = render(&description);
        let resources = template["Resources"].as_object().unwrap();

        let subs: Vec<_> = resources
            .values()
            .filter(|r| r["Type"] == "AWS::SNS::Subscription")
            .collect();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0]["Properties"]["Protocol"], "lambda");
        assert_eq!(
            subs[0]["Properties"]["TopicArn"],
            json!({ "Ref": "ObservableBucketImageUploadedTopic" })
        );
    }

    #[test]
    fn test_method_rendered_with_authorizer_and_responses() {
        let (_dir, description) = assembled();
        let template = render(&description);

        let method = &template["Resources"]["ImageUploadApiImagesItemPut"]["Properties"];
        assert_eq!(method["HttpMethod"], "PUT");
        assert_eq!(method["AuthorizationType"], "COGNITO_USER_POOLS");
        assert_eq!(method["AuthorizerId"], json!({ "Ref": "ImageUploadApiAuthorizer" }));
        assert_eq!(method["RequestParameters"]["method.request.path.item"], true);

        let patterns: Vec<_> = method["Integration"]["IntegrationResponses"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|r| r["SelectionPattern"].as_str())
            .collect();
        assert_eq!(patterns, vec!["403", "400", "5\\d\\d"]);

        let authorizer = &template["Resources"]["ImageUploadApiAuthorizer"];
        assert_eq!(
            authorizer["Properties"]["IdentitySource"],
            "method.request.header.Authorization"
        );
        assert_eq!(authorizer["Properties"]["AuthorizerResultTtlInSeconds"], 3600);
        assert_eq!(authorizer["Metadata"]["Audience"], "client-id");
    }

    #[test]
    fn test_policies_rendered_per_role() {
        let (_dir, description) = assembled();
        let template = render(&description);

        let policy = &template["Resources"]["ImageUploadApiUploadRoleDefaultPolicy"];
        assert_eq!(policy["Type"], "AWS::IAM::Policy");
        let statement = &policy["Properties"]["PolicyDocument"]["Statement"][0];
        assert_eq!(statement["Action"], json!(["s3:GetObject", "s3:PutObject"]));

        let function = &template["Resources"]["ObservableBucketS3ImageUploadFunction"];
        assert_eq!(
            function["DependsOn"],
            json!([
                "ObservableBucketS3ImageUploadFunctionServiceRoleDefaultPolicy",
                "ObservableBucketS3ImageUploadFunctionServiceRole"
            ])
        );
        assert_eq!(function["Properties"]["Timeout"], 3);
        assert_eq!(function["Properties"]["TracingConfig"]["Mode"], "Active");
    }

    #[test]
    fn test_apply_writes_template_and_manifest() {
        let (_dir, description) = assembled();
        let out = tempfile::tempdir().unwrap();

        let output = Synthesizer::new(out.path().join("out")).apply(&description).unwrap();
        assert!(output.template_path.ends_with("ImageUploadStack.template.json"));

        let template: Value =
            serde_json::from_slice(&fs::read(&output.template_path).unwrap()).unwrap();
        assert_eq!(template, render(&description));

        let manifest: Value =
            serde_json::from_slice(&fs::read(&output.manifest_path).unwrap()).unwrap();
        assert_eq!(manifest["stack"], "ImageUploadStack");
        assert_eq!(manifest["artifacts"].as_array().unwrap().len(), 2);
        assert_eq!(
            manifest["artifacts"][0]["contentHash"],
            description.artifacts()[0].content_hash()
        );
    }
}
