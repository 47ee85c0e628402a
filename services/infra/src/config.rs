//! Assembly configuration.
//!
//! Loaded from configuration files, `INFRA__*` environment variables and
//! command-line context overrides. Optional values stay `None` here and are
//! resolved to their defaults by the unit that consumes them.

use crate::model::RetryPolicy;
use config::{Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required configuration: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Log level handed to the compute functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum LogLevel {
    #[serde(rename = "DEBUG", alias = "debug")]
    Debug,
    #[default]
    #[serde(rename = "INFO", alias = "info")]
    Info,
    #[serde(rename = "ERROR", alias = "error")]
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Main configuration for the stack assembly
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub stack: StackConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub thumbnails: ThumbnailConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub functions: FunctionsConfig,
    #[serde(default)]
    pub assets: AssetsConfig,
}

/// Logging for the assembly tool itself
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StackConfig {
    /// Stack name, also the template file name
    #[serde(default = "default_stack_name")]
    pub name: String,
    /// Directory the artifact paths are relative to
    #[serde(default = "default_asset_root")]
    pub asset_root: PathBuf,
}

/// External identity provider. Both values are required for assembly.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct IdentityConfig {
    /// ARN of the user pool that issues bearer tokens
    pub user_pool_arn: Option<String>,
    /// Audience (app client id) the tokens are issued for
    pub audience: Option<String>,
}

/// Upload store and its notification unit
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Key prefix of uploaded images (default `images/`)
    pub prefix: Option<String>,
    /// Recognized image suffixes
    #[serde(default = "default_suffixes")]
    pub suffixes: Vec<String>,
    /// Packaged upload-notification handler
    #[serde(default = "default_upload_handler_asset")]
    pub upload_handler_asset: PathBuf,
}

/// Thumbnail generation unit
#[derive(Debug, Clone, Deserialize)]
pub struct ThumbnailConfig {
    /// Output width in pixels (default 128)
    pub width: Option<u32>,
    /// Output height in pixels (default 128)
    pub height: Option<u32>,
    /// Destination key prefix
    #[serde(default = "default_thumbnail_prefix")]
    pub prefix: String,
    /// Packaged thumbnail handler
    #[serde(default = "default_thumbnail_asset")]
    pub asset: PathBuf,
    /// Read only under the upload prefix and write only under `prefix`,
    /// instead of read/write on the whole store
    #[serde(default)]
    pub scope_grant_to_prefix: bool,
}

/// Upload gateway
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Steady-state requests per second (default 10)
    pub throttling_rate_limit: Option<f64>,
    /// Burst allowance (default 5)
    pub throttling_burst_limit: Option<u32>,
    /// Authorizer result cache TTL in seconds (default 3600)
    pub authorizer_cache_ttl_secs: Option<u64>,
    /// Deployed stage name
    #[serde(default = "default_stage_name")]
    pub stage_name: String,
}

/// Settings shared by the compute functions
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionsConfig {
    /// LOG_LEVEL passed to the functions (default INFO)
    pub log_level: Option<LogLevel>,
    /// POWERTOOLS_SERVICE_NAME passed to the functions
    #[serde(default = "default_function_service_name")]
    pub service_name: String,
    /// Export name of the powertools layer ARN
    #[serde(default = "default_layer_export_name")]
    pub layer_export_name: String,
    /// Retries for failed asynchronous invocations (default 2)
    pub retry_attempts: Option<u32>,
    /// Maximum age of an event before it is dropped, in seconds (default 21600)
    pub max_event_age_secs: Option<u64>,
}

/// Staging bucket for packaged bundles
#[derive(Debug, Clone, Deserialize)]
pub struct AssetsConfig {
    /// Bucket the bundles are published to and deployed from
    #[serde(default = "default_staging_bucket")]
    pub staging_bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Upload concurrency limit
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_stack_name() -> String {
    "ImageUploadStack".to_string()
}

fn default_asset_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_suffixes() -> Vec<String> {
    vec![".jpg".to_string(), ".png".to_string()]
}

fn default_upload_handler_asset() -> PathBuf {
    PathBuf::from("assets/s3-image-upload-lambda/dist/package.zip")
}

fn default_thumbnail_prefix() -> String {
    "thumbnails/".to_string()
}

fn default_thumbnail_asset() -> PathBuf {
    PathBuf::from("assets/thumbnail_lambda/dist/package.zip")
}

fn default_stage_name() -> String {
    "prod".to_string()
}

fn default_function_service_name() -> String {
    "image-upload".to_string()
}

fn default_layer_export_name() -> String {
    "LayerVersionArn-serverlessrepo-aws-lambda-powertools-python-layer".to_string()
}

fn default_staging_bucket() -> String {
    "image-infra-assets".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            name: default_stack_name(),
            asset_root: default_asset_root(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            suffixes: default_suffixes(),
            upload_handler_asset: default_upload_handler_asset(),
        }
    }
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            prefix: default_thumbnail_prefix(),
            asset: default_thumbnail_asset(),
            scope_grant_to_prefix: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            throttling_rate_limit: None,
            throttling_burst_limit: None,
            authorizer_cache_ttl_secs: None,
            stage_name: default_stage_name(),
        }
    }
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            service_name: default_function_service_name(),
            layer_export_name: default_layer_export_name(),
            retry_attempts: None,
            max_event_age_secs: None,
        }
    }
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            staging_bucket: default_staging_bucket(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            upload_concurrency: default_upload_concurrency(),
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
        }
    }
}

/// Map command-line context keys to configuration keys.
///
/// `cognitoUserPoolArn` and `audience` are accepted as shorthands.
pub fn context_key(key: &str) -> &str {
    match key {
        "cognitoUserPoolArn" => "identity.user_pool_arn",
        "audience" => "identity.audience",
        other => other,
    }
}

impl Config {
    /// Load configuration from files, environment and context overrides.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/infra` and `/etc/image-infra/infra` (optional)
    /// 2. Environment variables, e.g. `INFRA__IDENTITY__AUDIENCE`
    /// 3. `overrides` given as `(key, value)` pairs
    pub fn load(overrides: &[(String, String)]) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(File::with_name("config/infra").required(false))
            .add_source(File::with_name("/etc/image-infra/infra").required(false))
            .add_source(
                Environment::with_prefix("INFRA")
                    .separator("__")
                    .try_parsing(true),
            );

        for (key, value) in overrides {
            builder = builder.set_override(context_key(key), value.as_str())?;
        }

        builder.build()?.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.validate_identity()?;

        if self.storage.suffixes.is_empty() {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.suffixes".to_string(),
                message: "At least one suffix is required".to_string(),
            });
        }
        let is_extension = |s: &str| s.starts_with('.') && s.len() >= 2;
        if let Some(bad) = self.storage.suffixes.iter().find(|s| !is_extension(s.as_str())) {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.suffixes".to_string(),
                message: format!("Suffix {:?} must be a file extension such as \".jpg\"", bad),
            });
        }

        if self.thumbnails.width == Some(0) || self.thumbnails.height == Some(0) {
            return Err(ConfigValidationError::InvalidValue {
                field: "thumbnails.width/height".to_string(),
                message: "Dimensions must be greater than 0".to_string(),
            });
        }

        if let Some(rate) = self.api.throttling_rate_limit {
            if rate.is_nan() || rate <= 0.0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: "api.throttling_rate_limit".to_string(),
                    message: "Rate limit must be greater than 0".to_string(),
                });
            }
        }
        if self.api.stage_name.is_empty() {
            return Err(ConfigValidationError::MissingField("api.stage_name".to_string()));
        }

        if let Some(attempts) = self.functions.retry_attempts {
            if attempts > RetryPolicy::MAX_RETRY_ATTEMPTS {
                return Err(ConfigValidationError::InvalidValue {
                    field: "functions.retry_attempts".to_string(),
                    message: format!(
                        "At most {} retries are allowed",
                        RetryPolicy::MAX_RETRY_ATTEMPTS
                    ),
                });
            }
        }
        if let Some(age) = self.functions.max_event_age_secs.map(Duration::from_secs) {
            if age < RetryPolicy::MIN_EVENT_AGE || age > RetryPolicy::MAX_EVENT_AGE {
                return Err(ConfigValidationError::InvalidValue {
                    field: "functions.max_event_age_secs".to_string(),
                    message: format!(
                        "Must be between {} and {} seconds",
                        RetryPolicy::MIN_EVENT_AGE.as_secs(),
                        RetryPolicy::MAX_EVENT_AGE.as_secs()
                    ),
                });
            }
        }

        if self.assets.staging_bucket.is_empty() {
            return Err(ConfigValidationError::MissingField("assets.staging_bucket".to_string()));
        }
        if self.assets.upload_concurrency == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "assets.upload_concurrency".to_string(),
                message: "Concurrency must be greater than 0".to_string(),
            });
        }
        if self.assets.part_size_bytes < MIN_PART_SIZE {
            return Err(ConfigValidationError::InvalidValue {
                field: "assets.part_size_bytes".to_string(),
                message: format!("Part size must be at least {} bytes", MIN_PART_SIZE),
            });
        }

        Ok(())
    }

    /// Check the two identity values the upload gateway cannot be built
    /// without, returning the user pool ARN and the audience.
    pub fn validate_identity(&self) -> Result<(&str, &str), ConfigValidationError> {
        let arn = match self.identity.user_pool_arn.as_deref() {
            Some(arn) if !arn.is_empty() => arn,
            _ => {
                return Err(ConfigValidationError::MissingField(
                    "identity.user_pool_arn (cognitoUserPoolArn)".to_string(),
                ))
            }
        };
        if !is_user_pool_arn(arn) {
            return Err(ConfigValidationError::InvalidValue {
                field: "identity.user_pool_arn".to_string(),
                message: format!("{:?} is not a user pool ARN", arn),
            });
        }

        match self.identity.audience.as_deref() {
            Some(audience) if !audience.is_empty() => Ok((arn, audience)),
            _ => Err(ConfigValidationError::MissingField(
                "identity.audience (audience)".to_string(),
            )),
        }
    }

    /// Event delivery retry policy for the compute functions.
    pub fn retry_policy(&self) -> RetryPolicy {
        let default = RetryPolicy::default();
        RetryPolicy {
            retry_attempts: self.functions.retry_attempts.unwrap_or(default.retry_attempts),
            max_event_age: self
                .functions
                .max_event_age_secs
                .map(Duration::from_secs)
                .unwrap_or(default.max_event_age),
        }
    }

    /// Resolve an artifact path against the asset root.
    pub fn asset_path(&self, relative: &std::path::Path) -> PathBuf {
        self.stack.asset_root.join(relative)
    }
}

/// `arn:<partition>:cognito-idp:<region>:<account>:userpool/<pool-id>`
fn is_user_pool_arn(arn: &str) -> bool {
    let parts: Vec<&str> = arn.splitn(6, ':').collect();
    match parts.as_slice() {
        ["arn", partition, "cognito-idp", region, account, resource] => {
            !partition.is_empty()
                && !region.is_empty()
                && !account.is_empty()
                && resource
                    .strip_prefix("userpool/")
                    .map(|id| !id.is_empty())
                    .unwrap_or(false)
        }
        _ => false,
    }
}
