//! リクエストファイルの探索と読み込み

use std::path::{Path, PathBuf};
use streamdock_build::{BuildRequest, DispatcherConfig, PipelineConfig};
use thiserror::Error;

/// リクエストファイル名
pub const REQUEST_FILE: &str = "streamdock.yaml";

pub const ENV_REGISTRY_USERNAME: &str = "STREAMDOCK_REGISTRY_USERNAME";
pub const ENV_REGISTRY_PASSWORD: &str = "STREAMDOCK_REGISTRY_PASSWORD";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Request file not found: {0}")]
    RequestNotFound(PathBuf),

    #[error(
        "No request file found. Looked in:\n\
        - ./streamdock.yaml\n\
        - ./.streamdock/streamdock.yaml\n\
        - <config dir>/streamdock/streamdock.yaml\n\
        Pass --request or set STREAMDOCK_REQUEST to use another file"
    )]
    NoRequestFile,

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// リクエストファイルを探す
///
/// 以下の優先順位で検索:
/// 1. `--request` フラグ（または STREAMDOCK_REQUEST 環境変数）
/// 2. カレントディレクトリの streamdock.yaml
/// 3. ./.streamdock/streamdock.yaml
/// 4. ~/.config/streamdock/streamdock.yaml
pub fn find_request_file(explicit: Option<&Path>) -> Result<PathBuf> {
    let current_dir = std::env::current_dir()?;
    find_request_file_in(explicit, &current_dir, dirs::config_dir().as_deref())
}

fn find_request_file_in(
    explicit: Option<&Path>,
    current_dir: &Path,
    config_dir: Option<&Path>,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::RequestNotFound(path.to_path_buf()));
    }

    let candidates = [
        current_dir.join(REQUEST_FILE),
        current_dir.join(".streamdock").join(REQUEST_FILE),
    ];
    let global = config_dir.map(|d| d.join("streamdock").join(REQUEST_FILE));

    candidates
        .into_iter()
        .chain(global)
        .find(|path| path.is_file())
        .ok_or(ConfigError::NoRequestFile)
}

/// リクエストを読み込み、環境変数による上書きを適用
pub fn load_request(path: &Path) -> Result<BuildRequest> {
    let content = std::fs::read_to_string(path)?;
    let mut request: BuildRequest =
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    // 相対パスはリクエストファイルの場所を基準にする
    if let Some(base) = path.parent() {
        resolve_paths(&mut request, base);
    }
    apply_env_overrides(&mut request);

    tracing::debug!(path = %path.display(), cluster = %request.cluster_id, "Loaded build request");
    Ok(request)
}

fn resolve_paths(request: &mut BuildRequest, base: &Path) {
    let resolve = |p: &mut PathBuf| {
        if p.is_relative() {
            *p = base.join(&*p);
        }
    };
    resolve(&mut request.job.jar);
    request.dependency.jars.iter_mut().for_each(resolve);
    request.integration_libs.iter_mut().for_each(resolve);
}

fn apply_env_overrides(request: &mut BuildRequest) {
    if let Some(username) = non_empty_env(ENV_REGISTRY_USERNAME) {
        request.registry.username = Some(username);
    }
    if let Some(password) = non_empty_env(ENV_REGISTRY_PASSWORD) {
        request.registry.password = Some(password);
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// パイプライン設定を組み立てる
///
/// ワークスペースは `--workspace`（または STREAMDOCK_WORKSPACE）、
/// 未指定ならデータディレクトリ配下。
pub fn pipeline_config(workspace: Option<PathBuf>, workers: Option<usize>) -> PipelineConfig {
    let defaults = PipelineConfig::default();
    PipelineConfig {
        workspace_root: workspace.unwrap_or(defaults.workspace_root),
        dispatcher: DispatcherConfig {
            workers,
            ..defaults.dispatcher
        },
    }
}
