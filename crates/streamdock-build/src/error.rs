use crate::step::Step;
use std::path::PathBuf;
use thiserror::Error;

/// ビルドコンテキスト作成・認証・タグ検証など、ステップ内部の補助処理のエラー
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Build context directory not found: {0}")]
    ContextNotFound(PathBuf),

    #[error("Invalid build configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid image tag: {tag}")]
    InvalidTag { tag: String },

    #[error("Registry authentication failed for {registry}: {message}")]
    AuthFailed { registry: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BuildResult<T> = std::result::Result<T, BuildError>;

/// ステップ単位のエラー
///
/// 7 つのステップそれぞれに 1 つのバリアントが対応し、
/// 下位コラボレーターのエラーを `source` として保持する。
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Workspace error: {message}")]
    Workspace {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Template export error: {message}")]
    TemplateExport {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Packaging error: {message}")]
    Packaging {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Manifest render error: {message}")]
    ManifestRender {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Pull error: {message}")]
    Pull {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Build error: {message}")]
    Build {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Push error: {message}")]
    Push {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

impl StageError {
    /// ステップに対応するバリアントでエラーを作成
    pub fn new(step: Step, message: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        let message = message.into();
        let source = source.into();
        match step {
            Step::InitWorkspace => StageError::Workspace { message, source },
            Step::ExportTemplates => StageError::TemplateExport { message, source },
            Step::PackageArtifact => StageError::Packaging { message, source },
            Step::RenderManifest => StageError::ManifestRender { message, source },
            Step::PullBaseImage => StageError::Pull { message, source },
            Step::BuildImage => StageError::Build { message, source },
            Step::PushImage => StageError::Push { message, source },
        }
    }

    /// このエラーを発生させたステップ
    pub fn step(&self) -> Step {
        match self {
            StageError::Workspace { .. } => Step::InitWorkspace,
            StageError::TemplateExport { .. } => Step::ExportTemplates,
            StageError::Packaging { .. } => Step::PackageArtifact,
            StageError::ManifestRender { .. } => Step::RenderManifest,
            StageError::Pull { .. } => Step::PullBaseImage,
            StageError::Build { .. } => Step::BuildImage,
            StageError::Push { .. } => Step::PushImage,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StageError::Workspace { message, .. }
            | StageError::TemplateExport { message, .. }
            | StageError::Packaging { message, .. }
            | StageError::ManifestRender { message, .. }
            | StageError::Pull { message, .. }
            | StageError::Build { message, .. }
            | StageError::Push { message, .. } => message,
        }
    }

    /// 根本原因のメッセージ
    pub fn root_cause(&self) -> String {
        match self {
            StageError::Workspace { source, .. }
            | StageError::TemplateExport { source, .. }
            | StageError::Packaging { source, .. }
            | StageError::ManifestRender { source, .. }
            | StageError::Pull { source, .. }
            | StageError::Build { source, .. }
            | StageError::Push { source, .. } => source.root_cause().to_string(),
        }
    }
}

/// パイプライン全体の終端エラー
///
/// どのステップで失敗したかと、その理由を保持する。
#[derive(Debug, Error)]
#[error("step {}/{} ({}) failed: {message}", .step.index(), Step::COUNT, .step.name())]
pub struct PipelineError {
    pub step: Step,
    pub message: String,
    #[source]
    pub source: StageError,
}

impl PipelineError {
    pub fn new(source: StageError) -> Self {
        Self {
            step: source.step(),
            message: source.message().to_string(),
            source,
        }
    }

    /// ユーザー向けの分かりやすいエラーメッセージ
    pub fn user_message(&self) -> String {
        let cause = self.source.root_cause();
        let hint = match &self.source {
            StageError::Workspace { .. } => {
                "Check that the workspace root is writable.\n  \
                 Override it with --workspace or STREAMDOCK_WORKSPACE."
            }
            StageError::TemplateExport { .. } => {
                "Check the pod templates in the request file; each must be a YAML mapping."
            }
            StageError::Packaging { .. } => {
                "Check the job artifact and dependency paths in the request file."
            }
            StageError::ManifestRender { .. } => {
                "Check the base image and the artifact produced by the packaging step."
            }
            StageError::Pull { .. } => {
                "Make sure the container engine is running (docker ps)\n  \
                 and that the base image reference exists."
            }
            StageError::Build { .. } => {
                "Inspect the generated Dockerfile in the workspace directory."
            }
            StageError::Push { .. } => {
                "Check the registry address and credentials\n  \
                 (STREAMDOCK_REGISTRY_USERNAME / STREAMDOCK_REGISTRY_PASSWORD)."
            }
        };

        format!(
            "Step {}/{} `{}` failed: {}\n\
             \n\
             Cause: {}\n\
             \n\
             Hint:\n  {}",
            self.step.index(),
            Step::COUNT,
            self.step.name(),
            self.message,
            cause,
            hint
        )
    }
}
