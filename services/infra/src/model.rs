//! Typed resource graph for the image pipeline stack.
//!
//! Units declare resources into a [`StackBuilder`]; `build()` freezes the
//! result into a [`StackDescription`] that nothing mutates afterwards. The
//! description is turned into a provider template by [`crate::template`].

use crate::config::ConfigValidationError;
use crate::tools::{rstrip_slash, ArtifactRef};
use crate::upload_api::ResponseMapping;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that abort assembly. No description is produced when one occurs.
#[derive(Error, Debug)]
pub enum AssemblyError {
    #[error(transparent)]
    Config(#[from] ConfigValidationError),

    #[error("Failed to fingerprint artifact {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Duplicate logical id: {0}")]
    DuplicateId(String),

    #[error("Invalid logical id {0:?}: only ASCII letters and digits are allowed")]
    InvalidId(String),
}

/// A property value: a literal or a reference resolved at provisioning time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal(String),
    /// `Ref` of a resource or pseudo parameter.
    Ref(String),
    /// Attribute of a resource.
    GetAtt(String, String),
    /// Value exported by another stack.
    ImportValue(String),
    /// Concatenation without separator.
    Join(Vec<Expr>),
}

impl Expr {
    pub fn literal(value: impl Into<String>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn join(parts: impl IntoIterator<Item = Expr>) -> Self {
        Expr::Join(parts.into_iter().collect())
    }

    /// The `AWS::Partition` pseudo parameter.
    pub fn partition() -> Self {
        Expr::Ref("AWS::Partition".to_string())
    }

    /// The `AWS::Region` pseudo parameter.
    pub fn region() -> Self {
        Expr::Ref("AWS::Region".to_string())
    }

    /// The `AWS::AccountId` pseudo parameter.
    pub fn account_id() -> Self {
        Expr::Ref("AWS::AccountId".to_string())
    }

    pub fn as_literal(&self) -> Option<&str> {
        match self {
            Expr::Literal(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Expr::Literal(s) => Value::String(s.clone()),
            Expr::Ref(id) => json!({ "Ref": id }),
            Expr::GetAtt(id, attr) => json!({ "Fn::GetAtt": [id, attr] }),
            Expr::ImportValue(name) => json!({ "Fn::ImportValue": name }),
            Expr::Join(parts) => {
                let parts: Vec<Value> = parts.iter().map(Expr::to_json).collect();
                json!({ "Fn::Join": ["", parts] })
            }
        }
    }
}

impl From<&str> for Expr {
    fn from(s: &str) -> Self {
        Expr::literal(s)
    }
}

impl From<String> for Expr {
    fn from(s: String) -> Self {
        Expr::Literal(s)
    }
}

/// Resource types the stack can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Bucket,
    Topic,
    Function,
    FunctionVersion,
    EventInvokeConfig,
    Role,
    RestApi,
    ApiResource,
    Method,
    Authorizer,
    GatewayResponse,
    Deployment,
    Stage,
}

impl ResourceKind {
    pub fn type_name(self) -> &'static str {
        match self {
            ResourceKind::Bucket => "AWS::S3::Bucket",
            ResourceKind::Topic => "AWS::SNS::Topic",
            ResourceKind::Function => "AWS::Lambda::Function",
            ResourceKind::FunctionVersion => "AWS::Lambda::Version",
            ResourceKind::EventInvokeConfig => "AWS::Lambda::EventInvokeConfig",
            ResourceKind::Role => "AWS::IAM::Role",
            ResourceKind::RestApi => "AWS::ApiGateway::RestApi",
            ResourceKind::ApiResource => "AWS::ApiGateway::Resource",
            ResourceKind::Method => "AWS::ApiGateway::Method",
            ResourceKind::Authorizer => "AWS::ApiGateway::Authorizer",
            ResourceKind::GatewayResponse => "AWS::ApiGateway::GatewayResponse",
            ResourceKind::Deployment => "AWS::ApiGateway::Deployment",
            ResourceKind::Stage => "AWS::ApiGateway::Stage",
        }
    }
}

/// Handle to a declared resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    id: String,
    kind: ResourceKind,
}

impl ResourceRef {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// The resource's ARN. A topic's `Ref` already is its ARN.
    pub fn arn(&self) -> Expr {
        match self.kind {
            ResourceKind::Topic => Expr::Ref(self.id.clone()),
            _ => Expr::GetAtt(self.id.clone(), "Arn".to_string()),
        }
    }

    /// The resource's physical name or id.
    pub fn name(&self) -> Expr {
        match self.kind {
            ResourceKind::Topic => Expr::GetAtt(self.id.clone(), "TopicName".to_string()),
            _ => Expr::Ref(self.id.clone()),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Private object store.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketProps {
    /// Physical name. Must not reference other resources of the stack.
    pub bucket_name: Option<Expr>,
    pub versioned: bool,
    /// Server-side encryption with store-managed keys.
    pub s3_managed_encryption: bool,
    pub block_public_access: bool,
}

/// Lambda-style compute trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionProps {
    pub runtime: String,
    pub handler: String,
    pub code: ArtifactRef,
    pub role: ResourceRef,
    pub timeout: Duration,
    pub memory_mb: u32,
    pub tracing_active: bool,
    pub layers: Vec<Expr>,
    pub environment: BTreeMap<String, Expr>,
}

/// Retry policy for asynchronous event delivery to a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_attempts: u32,
    pub max_event_age: Duration,
}

impl RetryPolicy {
    pub const MAX_RETRY_ATTEMPTS: u32 = 2;
    pub const MIN_EVENT_AGE: Duration = Duration::from_secs(60);
    pub const MAX_EVENT_AGE: Duration = Duration::from_secs(6 * 60 * 60);
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_attempts: Self::MAX_RETRY_ATTEMPTS,
            max_event_age: Self::MAX_EVENT_AGE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoleProps {
    /// Service principal allowed to assume the role.
    pub assumed_by: String,
    pub managed_policy_arns: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestApiProps {
    pub name: String,
    pub binary_media_types: Vec<String>,
}

/// Steady-state rate and burst allowance for a deployed stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleSettings {
    pub rate_limit: f64,
    pub burst_limit: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageProps {
    pub api: ResourceRef,
    pub deployment: ResourceRef,
    pub stage_name: String,
    pub throttle: ThrottleSettings,
}

/// Bearer-token authorizer backed by an external identity provider.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizerProps {
    pub api: ResourceRef,
    pub name: String,
    pub provider_arns: Vec<Expr>,
    /// e.g. `method.request.header.Authorization`
    pub identity_source: String,
    pub results_cache_ttl: Duration,
    pub audience: String,
}

/// Direct service integration performed by the gateway itself.
#[derive(Debug, Clone, PartialEq)]
pub struct AwsIntegration {
    pub service: String,
    pub integration_http_method: String,
    /// Path below the service endpoint, e.g. `{bucket}/images/{key}`.
    pub path: String,
    pub credentials_role: ResourceRef,
    pub request_parameters: BTreeMap<String, Expr>,
    pub responses: ResponseMapping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodResponse {
    pub status_code: u16,
    /// Whether the body is described by the built-in error model.
    pub error_model: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodProps {
    pub api: ResourceRef,
    pub resource: ResourceRef,
    pub http_method: String,
    pub authorizer: Option<ResourceRef>,
    /// Request parameters and whether each is required.
    pub request_parameters: BTreeMap<String, bool>,
    pub integration: AwsIntegration,
    pub method_responses: Vec<MethodResponse>,
}

impl MethodProps {
    pub fn requires_parameter(&self, name: &str) -> bool {
        self.request_parameters.get(name).copied().unwrap_or(false)
    }
}

/// One path segment of the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResourceDecl {
    pub api: ResourceRef,
    /// `None` for children of the API root.
    pub parent: Option<ResourceRef>,
    pub path_part: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Bucket(BucketProps),
    Topic,
    Function(FunctionProps),
    FunctionVersion {
        function: ResourceRef,
        code_sha256: String,
    },
    EventInvokeConfig {
        function: ResourceRef,
        retry: RetryPolicy,
    },
    Role(RoleProps),
    RestApi(RestApiProps),
    ApiResource(ApiResourceDecl),
    Method(MethodProps),
    Authorizer(AuthorizerProps),
    GatewayResponse {
        api: ResourceRef,
        response_type: String,
        templates: BTreeMap<String, String>,
    },
    Deployment {
        api: ResourceRef,
        depends_on: Vec<ResourceRef>,
    },
    Stage(StageProps),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Bucket(_) => ResourceKind::Bucket,
            Resource::Topic => ResourceKind::Topic,
            Resource::Function(_) => ResourceKind::Function,
            Resource::FunctionVersion { .. } => ResourceKind::FunctionVersion,
            Resource::EventInvokeConfig { .. } => ResourceKind::EventInvokeConfig,
            Resource::Role(_) => ResourceKind::Role,
            Resource::RestApi(_) => ResourceKind::RestApi,
            Resource::ApiResource(_) => ResourceKind::ApiResource,
            Resource::Method(_) => ResourceKind::Method,
            Resource::Authorizer(_) => ResourceKind::Authorizer,
            Resource::GatewayResponse { .. } => ResourceKind::GatewayResponse,
            Resource::Deployment { .. } => ResourceKind::Deployment,
            Resource::Stage(_) => ResourceKind::Stage,
        }
    }
}

/// Object key scope for object-creation events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyFilter {
    prefix: String,
    suffix: String,
}

impl KeyFilter {
    /// The prefix is stored without its trailing separator.
    pub fn new(prefix: &str, suffix: impl Into<String>) -> Self {
        Self {
            prefix: rstrip_slash(prefix).to_string(),
            suffix: suffix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Prefix as handed to the store's notification filter.
    pub fn key_prefix(&self) -> String {
        if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        key.starts_with(&self.key_prefix()) && key.ends_with(&self.suffix)
    }
}

/// Permission for `principal` to perform `actions` on `resources`.
#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    pub principal: ResourceRef,
    pub actions: BTreeSet<String>,
    pub resources: Vec<Expr>,
}

impl Grant {
    pub fn new<I, S>(principal: &ResourceRef, actions: I, resources: Vec<Expr>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            principal: principal.clone(),
            actions: actions.into_iter().map(Into::into).collect(),
            resources,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// An object was written to a store.
    ObjectCreated,
    /// A message was published to a channel.
    Message,
}

/// `subscriber` is invoked for each matching event of `publisher`.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub publisher: ResourceRef,
    pub subscriber: ResourceRef,
    pub events: BTreeSet<EventKind>,
    pub filter: Option<KeyFilter>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub id: String,
    pub value: Expr,
    pub description: String,
}

/// Mutable collector used while units declare their resources.
#[derive(Debug)]
pub struct StackBuilder {
    name: String,
    asset_bucket: String,
    resources: Vec<(String, Resource)>,
    ids: HashSet<String>,
    grants: Vec<Grant>,
    subscriptions: Vec<Subscription>,
    artifacts: Vec<ArtifactRef>,
    outputs: Vec<Output>,
}

impl StackBuilder {
    pub fn new(name: impl Into<String>, asset_bucket: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            asset_bucket: asset_bucket.into(),
            resources: Vec::new(),
            ids: HashSet::new(),
            grants: Vec::new(),
            subscriptions: Vec::new(),
            artifacts: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Scope whose logical ids are prefixed with `id`.
    pub fn scope(&mut self, id: &str) -> Scope<'_> {
        Scope {
            prefix: id.to_string(),
            builder: self,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn asset_bucket(&self) -> &str {
        &self.asset_bucket
    }

    pub fn add(
        &mut self,
        id: impl Into<String>,
        resource: Resource,
    ) -> Result<ResourceRef, AssemblyError> {
        let id = id.into();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AssemblyError::InvalidId(id));
        }
        if !self.ids.insert(id.clone()) {
            return Err(AssemblyError::DuplicateId(id));
        }

        let kind = resource.kind();
        self.resources.push((id.clone(), resource));
        Ok(ResourceRef { id, kind })
    }

    pub fn grant(&mut self, grant: Grant) {
        self.grants.push(grant);
    }

    pub fn subscribe(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    pub fn add_artifact(&mut self, artifact: ArtifactRef) {
        if !self.artifacts.contains(&artifact) {
            self.artifacts.push(artifact);
        }
    }

    pub fn output(
        &mut self,
        id: impl Into<String>,
        value: Expr,
        description: impl Into<String>,
    ) -> Result<(), AssemblyError> {
        let id = id.into();
        if self.outputs.iter().any(|o| o.id == id) {
            return Err(AssemblyError::DuplicateId(id));
        }
        self.outputs.push(Output {
            id,
            value,
            description: description.into(),
        });
        Ok(())
    }

    pub fn build(self) -> StackDescription {
        StackDescription {
            name: self.name,
            asset_bucket: self.asset_bucket,
            resources: self.resources,
            grants: self.grants,
            subscriptions: self.subscriptions,
            artifacts: self.artifacts,
            outputs: self.outputs,
        }
    }
}

/// Construct scope over a [`StackBuilder`].
pub struct Scope<'a> {
    builder: &'a mut StackBuilder,
    prefix: String,
}

impl Scope<'_> {
    pub fn add(&mut self, id: &str, resource: Resource) -> Result<ResourceRef, AssemblyError> {
        let id = format!("{}{}", self.prefix, id);
        self.builder.add(id, resource)
    }

    pub fn grant(&mut self, grant: Grant) {
        self.builder.grant(grant);
    }

    pub fn subscribe(&mut self, subscription: Subscription) {
        self.builder.subscribe(subscription);
    }

    pub fn add_artifact(&mut self, artifact: ArtifactRef) {
        self.builder.add_artifact(artifact);
    }

    pub fn stack_name(&self) -> &str {
        self.builder.name()
    }

    pub fn asset_bucket(&self) -> &str {
        self.builder.asset_bucket()
    }
}

/// Immutable end-state description of the stack.
#[derive(Debug, Clone)]
pub struct StackDescription {
    name: String,
    asset_bucket: String,
    resources: Vec<(String, Resource)>,
    grants: Vec<Grant>,
    subscriptions: Vec<Subscription>,
    artifacts: Vec<ArtifactRef>,
    outputs: Vec<Output>,
}

impl StackDescription {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bucket the function bundles are published to.
    pub fn asset_bucket(&self) -> &str {
        &self.asset_bucket
    }

    /// Resources in declaration order.
    pub fn resources(&self) -> impl Iterator<Item = (&str, &Resource)> {
        self.resources.iter().map(|(id, r)| (id.as_str(), r))
    }

    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.resources.iter().find(|(rid, _)| rid == id).map(|(_, r)| r)
    }

    pub fn resources_of(&self, kind: ResourceKind) -> impl Iterator<Item = (&str, &Resource)> {
        self.resources().filter(move |(_, r)| r.kind() == kind)
    }

    pub fn grants(&self) -> &[Grant] {
        &self.grants
    }

    pub fn grants_for<'a>(&'a self, principal: &'a ResourceRef) -> impl Iterator<Item = &'a Grant> {
        self.grants.iter().filter(move |g| &g.principal == principal)
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn artifacts(&self) -> &[ArtifactRef] {
        &self.artifacts
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub fn methods(&self) -> impl Iterator<Item = (&str, &MethodProps)> {
        self.resources().filter_map(|(id, r)| match r {
            Resource::Method(m) => Some((id, m)),
            _ => None,
        })
    }

    /// Full request path of an API resource, e.g. `/images/{item}`.
    pub fn resource_path(&self, resource: &ResourceRef) -> Option<String> {
        let mut parts = Vec::new();
        let mut current = Some(resource.clone());

        while let Some(r) = current {
            match self.get(r.id())? {
                Resource::ApiResource(decl) => {
                    parts.push(decl.path_part.clone());
                    current = decl.parent.clone();
                }
                _ => return None,
            }
        }

        parts.reverse();
        Some(format!("/{}", parts.join("/")))
    }
}
