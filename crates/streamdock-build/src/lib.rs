//! Streamdock image build pipeline
//!
//! This crate turns a streaming job build request into a pushed container image:
//! workspace preparation, pod template export, artifact packaging, Dockerfile
//! rendering, and pull/build/push against a container engine with progress
//! notifications delivered to a registered observer.

pub mod auth;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod packager;
pub mod pipeline;
pub mod progress;
pub mod request;
pub mod session;
pub mod step;
pub mod tag;
pub mod template;

pub use auth::{RegistryAuth, extract_registry};
pub use context::ContextBuilder;
pub use dispatcher::{DispatcherConfig, NotificationDispatcher, ProgressObserver};
pub use engine::{ContainerClient, ContainerConnector, DockerClient, DockerConnector};
pub use error::{BuildError, BuildResult, PipelineError, StageError};
pub use manifest::{DockerfileRenderer, ManifestRenderer, RenderedManifest};
pub use packager::{ArtifactPackager, LocalArtifactPackager, PackagedArtifact};
pub use pipeline::BuildPipeline;
pub use progress::{EventSink, Phase, PhaseTracker, ProgressEvent, ProgressSnapshot, ProgressTracker};
pub use request::{
    BuildRequest, BuildResponse, DependencySpec, DevelopmentMode, JobSource, PipelineConfig,
    RegistryConfig, TemplateSpec,
};
pub use session::ContainerSession;
pub use step::{Step, StepRecord, StepResult, StepRunner};
pub use tag::{compile_tag, split_digest, split_image_tag, validate_tag};
pub use template::{TemplateExporter, WorkspaceTemplateExporter};
