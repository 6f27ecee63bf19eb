use crate::error::{BuildError, BuildResult};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::path::Path;
use tar::Builder;

/// ビルドコンテキストのサイズ警告の閾値
const MAX_CONTEXT_SIZE: usize = 500 * 1024 * 1024; // 500MB

pub struct ContextBuilder;

impl ContextBuilder {
    /// ワークスペースをtar.gzアーカイブのビルドコンテキストにする
    ///
    /// マニフェストはアーカイブ直下の `Dockerfile` として格納される。
    pub fn create_context(context_path: &Path, manifest_path: &Path) -> BuildResult<Vec<u8>> {
        tracing::debug!("Creating build context from: {}", context_path.display());

        if !context_path.is_dir() {
            return Err(BuildError::ContextNotFound(context_path.to_path_buf()));
        }

        let manifest_in_place = manifest_path.parent() == Some(context_path)
            && manifest_path.file_name().is_some_and(|n| n == "Dockerfile");

        let mut archive_data = Vec::new();
        {
            let encoder = GzEncoder::new(&mut archive_data, Compression::default());
            let mut tar = Builder::new(encoder);

            tar.append_dir_all(".", context_path)?;

            if !manifest_in_place {
                let manifest = std::fs::read(manifest_path)?;

                let mut header = tar::Header::new_gnu();
                header.set_path("Dockerfile").map_err(|e| {
                    BuildError::InvalidConfig(format!("Failed to set Dockerfile path: {}", e))
                })?;
                header.set_size(manifest.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();

                tar.append(&header, &manifest[..])?;
            }

            tar.into_inner()?.finish()?;
        }

        tracing::debug!("Build context created: {} bytes", archive_data.len());

        if archive_data.len() > MAX_CONTEXT_SIZE {
            tracing::warn!(
                "Build context is large ({}MB); consider trimming the workspace",
                archive_data.len() / 1024 / 1024
            );
        }

        Ok(archive_data)
    }
}
