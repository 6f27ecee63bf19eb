//! ビルドパイプライン
//!
//! ワークスペース初期化 → テンプレート書き出し → パッケージング → Dockerfile 生成
//! → ベースイメージ pull → ビルド → push の 7 ステップを順に実行する。
//! どこかで失敗したら以降のステップは実行しない。

use crate::auth::RegistryAuth;
use crate::dispatcher::{NotificationDispatcher, ProgressObserver};
use crate::engine::ContainerConnector;
use crate::error::{PipelineError, StageError};
use crate::manifest::{DockerfileRenderer, ManifestRenderer};
use crate::packager::{ArtifactPackager, LocalArtifactPackager};
use crate::progress::{Phase, ProgressTracker};
use crate::request::{BuildRequest, BuildResponse};
use crate::session::ContainerSession;
use crate::step::{Step, StepRunner};
use crate::tag::compile_tag;
use crate::template::{TemplateExporter, WorkspaceTemplateExporter};
use anyhow::Context as _;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// 1 リクエスト分のビルドパイプライン
///
/// リクエストごとに作成し、`run` で消費する。
pub struct BuildPipeline<C> {
    workspace_root: PathBuf,
    connector: C,
    dispatcher: Arc<NotificationDispatcher>,
    packager: Box<dyn ArtifactPackager>,
    exporter: Box<dyn TemplateExporter>,
    renderer: Box<dyn ManifestRenderer>,
}

impl<C: ContainerConnector> BuildPipeline<C> {
    /// 既定のコラボレーターでパイプラインを作成
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        connector: C,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            connector,
            dispatcher,
            packager: Box::new(LocalArtifactPackager),
            exporter: Box::new(WorkspaceTemplateExporter),
            renderer: Box::new(DockerfileRenderer),
        }
    }

    pub fn with_packager(mut self, packager: impl ArtifactPackager + 'static) -> Self {
        self.packager = Box::new(packager);
        self
    }

    pub fn with_exporter(mut self, exporter: impl TemplateExporter + 'static) -> Self {
        self.exporter = Box::new(exporter);
        self
    }

    pub fn with_renderer(mut self, renderer: impl ManifestRenderer + 'static) -> Self {
        self.renderer = Box::new(renderer);
        self
    }

    /// 進捗オブザーバーを登録
    pub fn register_progress_observer(&self, observer: impl ProgressObserver + 'static) {
        self.dispatcher.register_observer(observer);
    }

    /// パイプラインを実行
    pub async fn run(self, request: &BuildRequest) -> Result<BuildResponse, PipelineError> {
        let mut runner = StepRunner::new();
        let progress = ProgressTracker::new(self.dispatcher.clone());
        let session = ContainerSession::new(self.connector, RegistryAuth::new(&request.registry));
        let image_tag = compile_tag(
            &request.raw_image_tag(),
            &request.registry.namespace,
            &request.registry.address,
        );

        tracing::info!(
            cluster = %request.cluster_id,
            namespace = %request.namespace,
            image = %image_tag,
            "Starting build pipeline"
        );

        macro_rules! abort {
            () => {
                return Err(runner.into_error().unwrap_or_else(|| {
                    PipelineError::new(StageError::new(
                        Step::InitWorkspace,
                        "pipeline aborted",
                        anyhow::anyhow!("no failure was recorded"),
                    ))
                }))
            };
        }

        // 1. ワークスペース
        let workspace_root = &self.workspace_root;
        let Some(workspace) = runner
            .execute_step(Step::InitWorkspace, || async move {
                request
                    .workspace_dir(workspace_root)
                    .and_then(recreate_workspace)
                    .map_err(|e| StageError::new(Step::InitWorkspace, "failed to prepare workspace", e))
            })
            .await
        else {
            abort!()
        };

        let workspace_dir = workspace.as_path();

        // 2. テンプレート
        let template_paths = match request.templates.as_ref().filter(|_| request.has_templates()) {
            None => {
                runner.skip_step(Step::ExportTemplates);
                BTreeMap::new()
            }
            Some(templates) => {
                let exporter = &self.exporter;
                let Some(paths) = runner
                    .execute_step(Step::ExportTemplates, || async move {
                        exporter.export_templates(workspace_dir, templates).map_err(|e| {
                            StageError::new(Step::ExportTemplates, "failed to export templates", e)
                        })
                    })
                    .await
                else {
                    abort!()
                };
                paths
            }
        };

        // 3. パッケージング
        let packager = &self.packager;
        let Some(artifact) = runner
            .execute_step(Step::PackageArtifact, || async move {
                packager.package_artifact(request, workspace_dir).map_err(|e| {
                    StageError::new(
                        Step::PackageArtifact,
                        format!("failed to package {:?} job {}", request.mode, request.app_name),
                        e,
                    )
                })
            })
            .await
        else {
            abort!()
        };

        // 4. Dockerfile
        let renderer = &self.renderer;
        let artifact = &artifact;
        let Some(manifest) = runner
            .execute_step(Step::RenderManifest, || async move {
                renderer
                    .render_manifest(
                        workspace_dir,
                        &request.base_image,
                        artifact,
                        request.integrate_platform,
                    )
                    .map_err(|e| {
                        StageError::new(Step::RenderManifest, "failed to render Dockerfile", e)
                    })
            })
            .await
        else {
            abort!()
        };

        // 5. ベースイメージ pull
        let pull = progress.phase(Phase::Pull);
        if runner
            .execute_step(Step::PullBaseImage, || session.pull(&request.base_image, pull))
            .await
            .is_none()
        {
            abort!()
        }

        // 6. ビルド
        let build = progress.phase(Phase::Build);
        let tags = [image_tag.clone()];
        let Some(image_id) = runner
            .execute_step(Step::BuildImage, || {
                session.build(workspace_dir, &manifest.path, &tags, build)
            })
            .await
        else {
            abort!()
        };

        // 7. push
        let push = progress.phase(Phase::Push);
        if runner
            .execute_step(Step::PushImage, || session.push(&image_tag, push))
            .await
            .is_none()
        {
            abort!()
        }

        tracing::info!(image = %image_tag, id = %image_id, "Build pipeline finished");

        Ok(BuildResponse {
            workspace_path: workspace,
            image_tag,
            image_id,
            template_paths,
            artifact_image_path: manifest.artifact_image_path,
        })
    }
}

/// ワークスペースを空の状態で作り直す
fn recreate_workspace(workspace: PathBuf) -> anyhow::Result<PathBuf> {
    if workspace.exists() {
        std::fs::remove_dir_all(&workspace)
            .with_context(|| format!("Failed to remove {}", workspace.display()))?;
    }
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("Failed to create {}", workspace.display()))?;
    tracing::debug!(path = %workspace.display(), "Workspace ready");
    Ok(workspace)
}
