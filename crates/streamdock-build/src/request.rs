//! ビルドリクエストとレスポンス

use crate::dispatcher::DispatcherConfig;
use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// ジョブの開発モード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DevelopmentMode {
    /// SQL などの宣言的ジョブ。ランナー jar とジョブ定義をパッケージする
    DeclarativeJob,
    /// ユーザーがビルドした jar をそのままパッケージする
    CustomCode,
}

/// 依存関係
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// 追加でイメージに含める jar
    #[serde(default)]
    pub jars: Vec<PathBuf>,
}

/// ジョブ本体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSource {
    /// `custom-code` ではユーザー jar、`declarative-job` ではランナー jar
    pub jar: PathBuf,
    /// `declarative-job` のジョブ定義（SQL 等）
    #[serde(default)]
    pub definition: Option<String>,
}

/// レジストリ設定
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// 例: `registry.example.com`。空ならレジストリ接頭辞を付けない
    #[serde(default)]
    pub address: String,
    /// イメージのネームスペース
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

/// Pod / JobManager / TaskManager のテンプレート
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateSpec {
    pub templates: BTreeMap<String, serde_yaml::Value>,
}

impl TemplateSpec {
    /// 中身のあるテンプレートが 1 つもないか
    pub fn is_empty(&self) -> bool {
        self.templates.values().all(|v| v.is_null())
    }
}

/// 何をビルドするかの記述。作成後は変更しない
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub cluster_id: String,
    pub namespace: String,
    pub app_name: String,
    pub main_class: String,
    pub mode: DevelopmentMode,
    pub job: JobSource,
    #[serde(default)]
    pub dependency: DependencySpec,
    /// ベースイメージ（例: `flink:1.18`）
    pub base_image: String,
    /// 省略時は `streamdock-{namespace}-{cluster_id}`
    #[serde(default)]
    pub image_tag: Option<String>,
    #[serde(default)]
    pub templates: Option<TemplateSpec>,
    #[serde(default)]
    pub registry: RegistryConfig,
    /// プラットフォーム統合ライブラリ（Hadoop 等）をイメージに含める
    #[serde(default)]
    pub integrate_platform: bool,
    #[serde(default)]
    pub integration_libs: Vec<PathBuf>,
}

impl BuildRequest {
    /// ワークスペースディレクトリ名
    pub fn workspace_name(&self) -> String {
        format!("{}@{}", self.cluster_id, self.namespace)
    }

    /// `root` 直下のワークスペースディレクトリ
    ///
    /// クラスタ ID とネームスペースはそのままディレクトリ名になるため、
    /// パス区切りや `.` 始まりの値は受け付けない。
    pub fn workspace_dir(&self, root: &Path) -> anyhow::Result<PathBuf> {
        check_identifier("cluster_id", &self.cluster_id)?;
        check_identifier("namespace", &self.namespace)?;
        Ok(root.join(self.workspace_name()))
    }

    /// タグ組み立て前の生のタグ
    pub fn raw_image_tag(&self) -> String {
        self.image_tag
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| format!("streamdock-{}-{}", self.namespace, self.cluster_id))
    }

    pub fn has_templates(&self) -> bool {
        self.templates.as_ref().is_some_and(|t| !t.is_empty())
    }
}

fn check_identifier(field: &str, value: &str) -> anyhow::Result<()> {
    if value.trim().is_empty() {
        bail!("{} must not be empty", field);
    }
    if value.starts_with('.') || value.contains(['/', '\\']) || value.contains("..") {
        bail!("{} must be a plain name, got {:?}", field, value);
    }
    Ok(())
}

/// 全ステップ成功時の成果物
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResponse {
    pub workspace_path: PathBuf,
    pub image_tag: String,
    pub image_id: String,
    pub template_paths: BTreeMap<String, PathBuf>,
    /// イメージ内でのジョブ jar のパス
    pub artifact_image_path: String,
}

/// パイプラインの設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub workspace_root: PathBuf,
    pub dispatcher: DispatcherConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let workspace_root = dirs::data_dir()
            .map(|d| d.join("streamdock"))
            .unwrap_or_else(|| PathBuf::from(".streamdock"))
            .join("workspace");
        Self {
            workspace_root,
            dispatcher: DispatcherConfig::default(),
        }
    }
}
