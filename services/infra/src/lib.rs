//! Image Infra
//!
//! Declarative assembly of the image upload and thumbnail pipeline. The
//! stack is described as a typed resource graph, rendered into a provider
//! template, and its function bundles are published to an asset bucket.
//! Nothing here calls a provisioning API; the template is handed to the
//! provider's deployment engine.
//!
//! ## Features
//!
//! - **Observable bucket**: a private image store whose uploads under a
//!   prefix are announced on a topic
//! - **Thumbnail function**: subscribed to the topic, writes thumbnails back
//!   to the store
//! - **Upload API**: authenticated, throttled `PUT /images/{item}` writing
//!   straight into the store
//! - **Content-addressed bundles**: every function bundle is fingerprinted at
//!   assembly and deployed under its hash
//!
//! ## Flow
//!
//! ```text
//! Config ──▶ ImageStack::synth ──▶ StackDescription ─┬─▶ Synthesizer ──▶ <out>/*.json
//!                                                   │
//!                                                   └─▶ AssetPublisher ──▶ asset bucket
//! ```

pub mod config;
pub mod function;
pub mod model;
pub mod observable_bucket;
pub mod publisher;
pub mod stack;
pub mod template;
pub mod thumbnail_function;
pub mod tools;
pub mod upload_api;

pub use config::{Config, ConfigValidationError, LogLevel};
pub use model::{
    AssemblyError, Expr, KeyFilter, Resource, ResourceKind, ResourceRef, StackDescription,
};
pub use observable_bucket::{ObservableBucket, ObservableBucketProps};
pub use publisher::{
    AssetPublisher, AssetStore, PublishError, PublishOutcome, PublishSummary, S3AssetStore,
};
pub use stack::ImageStack;
pub use template::{render, SynthError, SynthOutput, Synthesizer};
pub use thumbnail_function::{ThumbnailFunction, ThumbnailFunctionProps};
pub use tools::{fingerprint, ArtifactRef};
pub use upload_api::{ImageUploadApi, ImageUploadApiProps, ResponseMapping, StatusRange};
