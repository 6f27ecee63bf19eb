//! パイプラインのステップ実行
//!
//! 順序付きのステップを 1 つずつ実行し、最初の失敗で以降のステップを打ち切る。
//! 各ステップの結果は [`StepRecord`] として記録され、終端エラーは最後の記録から導出される。

use crate::error::{PipelineError, StageError};
use std::fmt;
use std::future::Future;
use tracing::Instrument;

/// ビルドパイプラインの 7 ステップ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    InitWorkspace,
    ExportTemplates,
    PackageArtifact,
    RenderManifest,
    PullBaseImage,
    BuildImage,
    PushImage,
}

impl Step {
    pub const COUNT: usize = 7;

    pub const ALL: [Step; Step::COUNT] = [
        Step::InitWorkspace,
        Step::ExportTemplates,
        Step::PackageArtifact,
        Step::RenderManifest,
        Step::PullBaseImage,
        Step::BuildImage,
        Step::PushImage,
    ];

    /// 1 始まりのステップ番号
    pub fn index(self) -> usize {
        match self {
            Step::InitWorkspace => 1,
            Step::ExportTemplates => 2,
            Step::PackageArtifact => 3,
            Step::RenderManifest => 4,
            Step::PullBaseImage => 5,
            Step::BuildImage => 6,
            Step::PushImage => 7,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Step::InitWorkspace => "init-workspace",
            Step::ExportTemplates => "export-templates",
            Step::PackageArtifact => "package-artifact",
            Step::RenderManifest => "render-manifest",
            Step::PullBaseImage => "pull-base-image",
            Step::BuildImage => "build-image",
            Step::PushImage => "push-image",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// 1 ステップの実行結果
#[derive(Debug)]
pub enum StepResult {
    Success,
    Skipped,
    Failed(StageError),
}

impl StepResult {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepResult::Failed(_))
    }
}

#[derive(Debug)]
pub struct StepRecord {
    pub step: Step,
    pub result: StepResult,
}

/// 順序付きステップランナー
///
/// ランナー自身はエラーを返さない。`execute_step` が `None` を返したら、
/// 呼び出し側は `into_error` で終端エラーを取り出して中断する。
#[derive(Debug, Default)]
pub struct StepRunner {
    records: Vec<StepRecord>,
}

impl StepRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// ステップを実行して結果を記録
    ///
    /// 既に失敗が記録されている場合は `action` を実行せずに `None` を返す。
    pub async fn execute_step<T, F, Fut>(&mut self, step: Step, action: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        if self.is_failed() {
            tracing::debug!(step = %step, "Not running step after an earlier failure");
            return None;
        }

        let span = tracing::info_span!("step", index = step.index(), name = step.name());
        tracing::info!(parent: &span, "Step {}/{} started", step.index(), Step::COUNT);

        match action().instrument(span.clone()).await {
            Ok(value) => {
                tracing::info!(parent: &span, "Step {}/{} succeeded", step.index(), Step::COUNT);
                self.records.push(StepRecord {
                    step,
                    result: StepResult::Success,
                });
                Some(value)
            }
            Err(e) => {
                tracing::error!(parent: &span, error = %e, "Step {}/{} failed", step.index(), Step::COUNT);
                self.records.push(StepRecord {
                    step,
                    result: StepResult::Failed(e),
                });
                None
            }
        }
    }

    /// 前提条件を満たさないステップをスキップとして記録
    pub fn skip_step(&mut self, step: Step) {
        if self.is_failed() {
            return;
        }
        tracing::info!(step = %step, "Step {}/{} skipped", step.index(), Step::COUNT);
        self.records.push(StepRecord {
            step,
            result: StepResult::Skipped,
        });
    }

    /// 直近の失敗
    pub fn current_error(&self) -> Option<&StageError> {
        match self.records.last() {
            Some(StepRecord {
                result: StepResult::Failed(e),
                ..
            }) => Some(e),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.records.last().is_some_and(|r| r.result.is_failed())
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    /// 終端エラーを取り出す
    pub fn into_error(mut self) -> Option<PipelineError> {
        match self.records.pop() {
            Some(StepRecord {
                result: StepResult::Failed(e),
                ..
            }) => Some(PipelineError::new(e)),
            _ => None,
        }
    }
}
