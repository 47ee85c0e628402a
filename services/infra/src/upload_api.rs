//! Upload gateway: `PUT /images/{item}` writes straight into the image store.
//!
//! Requests are authorized with bearer tokens issued by an external user pool
//! and throttled at the stage. The gateway assumes a role that may only read
//! and write objects under the configured prefix. Upstream store responses
//! are mapped onto a small fixed set of status codes by [`ResponseMapping`].

use crate::model::{
    ApiResourceDecl, AssemblyError, AuthorizerProps, AwsIntegration, Expr, Grant, MethodProps,
    MethodResponse, Resource, ResourceRef, RestApiProps, RoleProps, StackBuilder, StageProps,
    ThrottleSettings,
};
use crate::tools::{path_glob, rstrip_slash};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

/// Body template of gateway-generated 4XX/5XX responses.
pub const GATEWAY_ERROR_TEMPLATE: &str = r#"{"message": $context.error.messageString }"#;

/// Body template wrapping an upstream store error.
pub const UPSTREAM_ERROR_TEMPLATE: &str = r#"{"message": "$util.base64Encode($input.body)"}"#;

pub const DEFAULT_THROTTLING_RATE_LIMIT: f64 = 10.0;
pub const DEFAULT_THROTTLING_BURST_LIMIT: u32 = 5;
pub const DEFAULT_AUTHORIZER_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

const AUTHORIZATION_HEADER: &str = "method.request.header.Authorization";
const ITEM_PARAMETER: &str = "method.request.path.item";

/// Inclusive range of upstream status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRange {
    start: u16,
    end: u16,
}

impl StatusRange {
    pub fn exact(code: u16) -> Self {
        Self { start: code, end: code }
    }

    /// Every code of a class, e.g. `class(5)` is `500..=599`.
    pub fn class(digit: u16) -> Self {
        Self {
            start: digit * 100,
            end: digit * 100 + 99,
        }
    }

    pub fn contains(&self, code: u16) -> bool {
        (self.start..=self.end).contains(&code)
    }

    /// Regex the gateway matches against the upstream status.
    pub fn selection_pattern(&self) -> String {
        if self.start == self.end {
            self.start.to_string()
        } else {
            format!("{}\\d\\d", self.start / 100)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRule {
    pub upstream: StatusRange,
    pub status: u16,
    /// Response template keyed by upstream content type.
    pub templates: BTreeMap<String, String>,
}

/// Status-range to canonical-code table of an integration.
///
/// Rules are tried in order; an upstream status no rule covers gets the
/// default response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMapping {
    default_status: u16,
    rules: Vec<ResponseRule>,
}

impl ResponseMapping {
    pub fn new(default_status: u16) -> Self {
        Self {
            default_status,
            rules: Vec::new(),
        }
    }

    pub fn rule(
        mut self,
        upstream: StatusRange,
        status: u16,
        templates: BTreeMap<String, String>,
    ) -> Self {
        self.rules.push(ResponseRule {
            upstream,
            status,
            templates,
        });
        self
    }

    /// 200 on success; 403, 400 and any 5xx (collapsed to 500) carry the
    /// upstream message in a `{"message": ...}` envelope.
    pub fn upload_defaults() -> Self {
        let envelope = || {
            BTreeMap::from([(
                "application/xml".to_string(),
                UPSTREAM_ERROR_TEMPLATE.to_string(),
            )])
        };

        Self::new(200)
            .rule(StatusRange::exact(403), 403, envelope())
            .rule(StatusRange::exact(400), 400, envelope())
            .rule(StatusRange::class(5), 500, envelope())
    }

    pub fn default_status(&self) -> u16 {
        self.default_status
    }

    pub fn rules(&self) -> &[ResponseRule] {
        &self.rules
    }

    /// Canonical status returned to the client for an upstream status.
    pub fn resolve(&self, upstream: u16) -> u16 {
        self.rules
            .iter()
            .find(|r| r.upstream.contains(upstream))
            .map(|r| r.status)
            .unwrap_or(self.default_status)
    }

    /// Every status the method can answer with, default first.
    pub fn status_codes(&self) -> Vec<u16> {
        let mut codes = vec![self.default_status];
        for rule in &self.rules {
            if !codes.contains(&rule.status) {
                codes.push(rule.status);
            }
        }
        codes
    }
}

/// Inputs of the upload gateway. `None` fields take the documented defaults.
#[derive(Debug, Clone)]
pub struct ImageUploadApiProps {
    pub bucket: ResourceRef,
    pub user_pool_arn: String,
    pub audience: String,
    /// Key prefix uploads are written under; `None` writes at the store root.
    pub prefix: Option<String>,
    /// Default [`DEFAULT_THROTTLING_RATE_LIMIT`].
    pub throttling_rate_limit: Option<f64>,
    /// Default [`DEFAULT_THROTTLING_BURST_LIMIT`].
    pub throttling_burst_limit: Option<u32>,
    /// Default [`DEFAULT_AUTHORIZER_CACHE_TTL`].
    pub authorizer_cache_ttl: Option<Duration>,
    pub stage_name: String,
}

/// Handles to the declared gateway.
#[derive(Debug, Clone)]
pub struct ImageUploadApi {
    pub api: ResourceRef,
    pub item_resource: ResourceRef,
    pub method: ResourceRef,
    pub authorizer: ResourceRef,
    pub role: ResourceRef,
    pub stage: ResourceRef,
    /// Object glob the gateway role may write to.
    pub path_glob: String,
}

impl ImageUploadApi {
    pub fn declare(
        stack: &mut StackBuilder,
        id: &str,
        props: ImageUploadApiProps,
    ) -> Result<Self, AssemblyError> {
        let prefix = props.prefix.as_deref().filter(|p| !p.is_empty());
        let throttle = ThrottleSettings {
            rate_limit: props
                .throttling_rate_limit
                .unwrap_or(DEFAULT_THROTTLING_RATE_LIMIT),
            burst_limit: props
                .throttling_burst_limit
                .unwrap_or(DEFAULT_THROTTLING_BURST_LIMIT),
        };
        let cache_ttl = props
            .authorizer_cache_ttl
            .unwrap_or(DEFAULT_AUTHORIZER_CACHE_TTL);

        let mut scope = stack.scope(id);

        let api = scope.add(
            "RestApi",
            Resource::RestApi(RestApiProps {
                name: format!("{}RestApi", id),
                binary_media_types: vec!["*/*".to_string()],
            }),
        )?;

        let gateway_responses = [("Default4XX", "DEFAULT_4XX"), ("Default5XX", "DEFAULT_5XX")];
        for (response_id, response_type) in gateway_responses {
            scope.add(
                response_id,
                Resource::GatewayResponse {
                    api: api.clone(),
                    response_type: response_type.to_string(),
                    templates: BTreeMap::from([(
                        "application/json".to_string(),
                        GATEWAY_ERROR_TEMPLATE.to_string(),
                    )]),
                },
            )?;
        }

        let images = scope.add(
            "Images",
            Resource::ApiResource(ApiResourceDecl {
                api: api.clone(),
                parent: None,
                path_part: "images".to_string(),
            }),
        )?;
        let item_resource = scope.add(
            "ImagesItem",
            Resource::ApiResource(ApiResourceDecl {
                api: api.clone(),
                parent: Some(images),
                path_part: "{item}".to_string(),
            }),
        )?;

        let glob = path_glob(prefix);
        let role = scope.add(
            "UploadRole",
            Resource::Role(RoleProps {
                assumed_by: "apigateway.amazonaws.com".to_string(),
                managed_policy_arns: Vec::new(),
            }),
        )?;
        scope.grant(Grant::new(
            &role,
            ["s3:PutObject", "s3:GetObject"],
            vec![Expr::join([
                props.bucket.arn(),
                Expr::literal(format!("/{}", glob)),
            ])],
        ));

        let authorizer = scope.add(
            "Authorizer",
            Resource::Authorizer(AuthorizerProps {
                api: api.clone(),
                name: "CognitoUserPoolsAuthorizer".to_string(),
                provider_arns: vec![Expr::literal(props.user_pool_arn.clone())],
                identity_source: AUTHORIZATION_HEADER.to_string(),
                results_cache_ttl: cache_ttl,
                audience: props.audience.clone(),
            }),
        )?;

        let key_path = prefix
            .map(|p| format!("{}/", rstrip_slash(p)))
            .unwrap_or_default();
        let responses = ResponseMapping::upload_defaults();
        let method_responses = responses
            .status_codes()
            .into_iter()
            .map(|status_code| MethodResponse {
                status_code,
                error_model: status_code != responses.default_status(),
            })
            .collect();

        let method = scope.add(
            "ImagesItemPut",
            Resource::Method(MethodProps {
                api: api.clone(),
                resource: item_resource.clone(),
                http_method: "PUT".to_string(),
                authorizer: Some(authorizer.clone()),
                request_parameters: BTreeMap::from([(ITEM_PARAMETER.to_string(), true)]),
                integration: AwsIntegration {
                    service: "s3".to_string(),
                    integration_http_method: "PUT".to_string(),
                    path: format!("{{bucket}}/{}{{key}}", key_path),
                    credentials_role: role.clone(),
                    request_parameters: BTreeMap::from([
                        (
                            "integration.request.path.bucket".to_string(),
                            Expr::join([
                                Expr::literal("'"),
                                props.bucket.name(),
                                Expr::literal("'"),
                            ]),
                        ),
                        (
                            "integration.request.path.key".to_string(),
                            Expr::literal(ITEM_PARAMETER),
                        ),
                    ]),
                    responses,
                },
                method_responses,
            }),
        )?;

        let deployment = scope.add(
            "Deployment",
            Resource::Deployment {
                api: api.clone(),
                depends_on: vec![method.clone()],
            },
        )?;
        let stage = scope.add(
            "Stage",
            Resource::Stage(StageProps {
                api: api.clone(),
                deployment,
                stage_name: props.stage_name.clone(),
                throttle,
            }),
        )?;

        info!(
            api = %api,
            glob = %glob,
            rate_limit = throttle.rate_limit,
            burst_limit = throttle.burst_limit,
            "Declared upload gateway"
        );

        Ok(Self {
            api,
            item_resource,
            method,
            authorizer,
            role,
            stage,
            path_glob: glob,
        })
    }
}
