//! ジョブ成果物のパッケージング

use crate::request::{BuildRequest, DevelopmentMode};
use anyhow::{Context as _, bail};
use std::path::{Path, PathBuf};

/// パッケージングの結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedArtifact {
    /// メインのジョブ jar
    pub path: PathBuf,
    /// イメージの lib に追加する jar
    pub extra_libs: Vec<PathBuf>,
    /// 宣言的ジョブの定義ファイル
    pub job_definition: Option<PathBuf>,
}

/// ジョブ成果物を作るコラボレーター
pub trait ArtifactPackager: Send + Sync {
    fn package_artifact(
        &self,
        request: &BuildRequest,
        output_dir: &Path,
    ) -> anyhow::Result<PackagedArtifact>;
}

/// ビルド済みの jar をワークスペースに集める
#[derive(Debug, Clone, Default)]
pub struct LocalArtifactPackager;

/// 宣言的ジョブの定義ファイル名
pub const JOB_DEFINITION_FILE: &str = "job.sql";

impl LocalArtifactPackager {
    fn copy_into(src: &Path, dir: &Path, name: Option<&str>) -> anyhow::Result<PathBuf> {
        if !src.is_file() {
            bail!("File not found: {}", src.display());
        }
        let file_name = match name {
            Some(name) => name.to_string(),
            None => src
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .with_context(|| format!("Invalid file path: {}", src.display()))?,
        };
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let dest = dir.join(file_name);
        std::fs::copy(src, &dest)
            .with_context(|| format!("Failed to copy {} to {}", src.display(), dest.display()))?;
        Ok(dest)
    }
}

/// アプリ名からファイル名に使える jar 名を作る
fn jar_name(app_name: &str) -> String {
    let name: String = app_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let name = name.trim_matches('-');
    if name.is_empty() {
        "job.jar".to_string()
    } else {
        format!("{}.jar", name)
    }
}

impl ArtifactPackager for LocalArtifactPackager {
    fn package_artifact(
        &self,
        request: &BuildRequest,
        output_dir: &Path,
    ) -> anyhow::Result<PackagedArtifact> {
        if request.main_class.trim().is_empty() {
            bail!("main class must not be empty");
        }

        let (path, job_definition) = match request.mode {
            DevelopmentMode::CustomCode => {
                let path = Self::copy_into(
                    &request.job.jar,
                    output_dir,
                    Some(&jar_name(&request.app_name)),
                )
                .context("Failed to package the job jar")?;
                (path, None)
            }
            DevelopmentMode::DeclarativeJob => {
                let definition = request
                    .job
                    .definition
                    .as_deref()
                    .filter(|d| !d.trim().is_empty())
                    .context("declarative jobs require a job definition")?;
                let path = Self::copy_into(&request.job.jar, output_dir, None)
                    .context("Failed to package the job runner jar")?;
                let definition_path = output_dir.join(JOB_DEFINITION_FILE);
                std::fs::write(&definition_path, definition).with_context(|| {
                    format!("Failed to write {}", definition_path.display())
                })?;
                (path, Some(definition_path))
            }
        };

        let lib_dir = output_dir.join("lib");
        let mut extra_libs = Vec::new();
        for jar in &request.dependency.jars {
            extra_libs.push(
                Self::copy_into(jar, &lib_dir, None).context("Failed to collect dependency jar")?,
            );
        }
        if request.integrate_platform {
            for jar in &request.integration_libs {
                extra_libs.push(
                    Self::copy_into(jar, &lib_dir, None)
                        .context("Failed to collect platform integration library")?,
                );
            }
        }

        tracing::info!(
            artifact = %path.display(),
            extra_libs = extra_libs.len(),
            "Packaged job artifact"
        );

        Ok(PackagedArtifact {
            path,
            extra_libs,
            job_definition,
        })
    }
}
