//! Dockerfile の生成
//!
//! Tera テンプレートでワークスペース内に Dockerfile を書き出す。

use crate::packager::PackagedArtifact;
use anyhow::{Context as _, bail};
use std::path::{Path, PathBuf};
use tera::{Context, Tera};

/// イメージ内のユーザー jar の置き場所
pub const USRLIB_DIR: &str = "/opt/flink/usrlib";

/// イメージ内の追加ライブラリの置き場所
pub const LIB_DIR: &str = "/opt/flink/lib";

const DOCKERFILE_TEMPLATE: &str = r#"FROM {{ base_image }}
RUN mkdir -p {{ usrlib_dir }}
COPY {{ artifact }} {{ usrlib_dir }}/{{ artifact_name }}
{%- if job_definition %}
COPY {{ job_definition }} {{ usrlib_dir }}/{{ job_definition_name }}
{%- endif %}
{%- for lib in libs %}
COPY {{ lib }} {{ lib_dir }}/
{%- endfor %}
{%- if integrate_platform %}
ENV HADOOP_CLASSPATH={{ lib_dir }}/*
ENV FLINK_ENV_JAVA_OPTS="-Dstreamdock.platform.integration=true"
{%- endif %}
"#;

/// 書き出したマニフェスト
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedManifest {
    pub path: PathBuf,
    pub content: String,
    /// `local:///opt/flink/usrlib/<jar>` 形式のジョブ jar のパス
    pub artifact_image_path: String,
}

/// マニフェストを生成するコラボレーター
pub trait ManifestRenderer: Send + Sync {
    fn render_manifest(
        &self,
        workspace: &Path,
        base_image: &str,
        artifact: &PackagedArtifact,
        integrate_platform: bool,
    ) -> anyhow::Result<RenderedManifest>;
}

#[derive(Debug, Clone, Default)]
pub struct DockerfileRenderer;

/// ワークスペースからの相対パス（`/` 区切り）
fn relative(workspace: &Path, path: &Path) -> anyhow::Result<String> {
    let rel = path.strip_prefix(workspace).with_context(|| {
        format!(
            "{} is outside of the workspace {}",
            path.display(),
            workspace.display()
        )
    })?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

fn file_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("Invalid file path: {}", path.display()))
}

impl ManifestRenderer for DockerfileRenderer {
    fn render_manifest(
        &self,
        workspace: &Path,
        base_image: &str,
        artifact: &PackagedArtifact,
        integrate_platform: bool,
    ) -> anyhow::Result<RenderedManifest> {
        if base_image.trim().is_empty() {
            bail!("base image must not be empty");
        }

        let artifact_name = file_name(&artifact.path)?;
        let libs = artifact
            .extra_libs
            .iter()
            .map(|lib| relative(workspace, lib))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut context = Context::new();
        context.insert("base_image", base_image.trim());
        context.insert("usrlib_dir", USRLIB_DIR);
        context.insert("lib_dir", LIB_DIR);
        context.insert("artifact", &relative(workspace, &artifact.path)?);
        context.insert("artifact_name", &artifact_name);
        context.insert("libs", &libs);
        context.insert("integrate_platform", &integrate_platform);
        match &artifact.job_definition {
            Some(definition) => {
                context.insert("job_definition", &relative(workspace, definition)?);
                context.insert("job_definition_name", &file_name(definition)?);
            }
            None => context.insert("job_definition", &false),
        }

        let content = Tera::one_off(DOCKERFILE_TEMPLATE, &context, false)
            .context("Failed to render Dockerfile")?;

        let path = workspace.join("Dockerfile");
        std::fs::write(&path, &content)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Rendered Dockerfile");

        Ok(RenderedManifest {
            path,
            content,
            artifact_image_path: format!("local://{}/{}", USRLIB_DIR, artifact_name),
        })
    }
}
