//! Pod テンプレートの書き出し

use crate::request::TemplateSpec;
use anyhow::{Context as _, bail};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// テンプレートをワークスペースに書き出すコラボレーター
pub trait TemplateExporter: Send + Sync {
    fn export_templates(
        &self,
        workspace: &Path,
        templates: &TemplateSpec,
    ) -> anyhow::Result<BTreeMap<String, PathBuf>>;
}

/// 各テンプレートを `<workspace>/<name>.yaml` として書き出す
#[derive(Debug, Clone, Default)]
pub struct WorkspaceTemplateExporter;

impl TemplateExporter for WorkspaceTemplateExporter {
    fn export_templates(
        &self,
        workspace: &Path,
        templates: &TemplateSpec,
    ) -> anyhow::Result<BTreeMap<String, PathBuf>> {
        let mut exported = BTreeMap::new();

        for (name, value) in &templates.templates {
            if value.is_null() {
                continue;
            }
            if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
                bail!("Invalid template name: {:?}", name);
            }
            if !value.is_mapping() {
                bail!("Template '{}' must be a YAML mapping", name);
            }

            let content = serde_yaml::to_string(value)
                .with_context(|| format!("Failed to serialize template '{}'", name))?;
            let path = workspace.join(format!("{}.yaml", name));
            std::fs::write(&path, content)
                .with_context(|| format!("Failed to write {}", path.display()))?;

            tracing::debug!(template = %name, path = %path.display(), "Exported template");
            exported.insert(name.clone(), path);
        }

        Ok(exported)
    }
}
