//! pull / build / push の進捗集計
//!
//! 各フェーズの状態はイミュータブルな [`ProgressSnapshot`] として `ArcSwap` に置き、
//! 更新時は新しいスナップショットを丸ごと差し替える。読み手は常に更新前か更新後の
//! どちらかの完全な状態を見る。

use crate::dispatcher::NotificationDispatcher;
use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// 進捗を持つフェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Pull,
    Build,
    Push,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Pull, Phase::Build, Phase::Push];

    pub(crate) fn slot(self) -> usize {
        match self {
            Phase::Pull => 0,
            Phase::Build => 1,
            Phase::Push => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Pull => "pull",
            Phase::Build => "build",
            Phase::Push => "push",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// コンテナエンジンが発行する低レベルイベント
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// レイヤー単位の転送状況（pull / push）
    Layer {
        id: String,
        status: String,
        current: u64,
        total: u64,
    },
    /// Dockerfile の命令の開始（build）
    Instruction {
        index: Option<(u32, u32)>,
        text: String,
    },
    /// その他のステータス行
    Status(String),
    /// 終端イベント
    Complete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerProgress {
    pub status: String,
    pub current: u64,
    pub total: u64,
}

/// あるフェーズのある時点の進捗
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub phase: Phase,
    /// 適用済みイベント数。フェーズ内で単調増加する
    pub sequence: u64,
    pub status: Option<String>,
    pub layers: BTreeMap<String, LayerProgress>,
    pub current_instruction: Option<String>,
    pub instruction_index: Option<(u32, u32)>,
    pub complete: bool,
}

impl ProgressSnapshot {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            sequence: 0,
            status: None,
            layers: BTreeMap::new(),
            current_instruction: None,
            instruction_index: None,
            complete: false,
        }
    }

    pub fn bytes_current(&self) -> u64 {
        self.layers.values().map(|l| l.current).sum()
    }

    pub fn bytes_total(&self) -> u64 {
        self.layers.values().map(|l| l.total).sum()
    }

    /// 0〜100 の進捗率。分母が分からない場合は `None`
    pub fn percent(&self) -> Option<u8> {
        if self.complete {
            return Some(100);
        }
        if let Some((n, m)) = self.instruction_index
            && m > 0
        {
            // 実行中の命令はまだ終わっていない
            return Some(((n.saturating_sub(1) as u64 * 100) / m as u64).min(100) as u8);
        }
        let total = self.bytes_total();
        if total == 0 {
            return None;
        }
        Some(((self.bytes_current() * 100) / total).min(100) as u8)
    }

    /// イベントを適用した新しいスナップショットを返す
    ///
    /// 完了済みのスナップショットにはどのイベントも作用しない。
    pub fn apply(&self, event: &ProgressEvent) -> Option<Self> {
        if self.complete {
            return None;
        }

        let mut next = self.clone();
        next.sequence += 1;
        match event {
            ProgressEvent::Layer {
                id,
                status,
                current,
                total,
            } => {
                let layer = next.layers.entry(id.clone()).or_default();
                layer.status = status.clone();
                layer.current = layer.current.max(*current);
                layer.total = layer.total.max(*total);
                if layer.total > 0 {
                    layer.current = layer.current.min(layer.total);
                }
            }
            ProgressEvent::Instruction { index, text } => {
                next.current_instruction = Some(text.clone());
                if index.is_some() {
                    next.instruction_index = *index;
                }
            }
            ProgressEvent::Status(status) => {
                next.status = Some(status.clone());
            }
            ProgressEvent::Complete => {
                next.complete = true;
                for layer in next.layers.values_mut() {
                    if layer.total > 0 {
                        layer.current = layer.total;
                    }
                }
            }
        }
        Some(next)
    }
}

/// 1 フェーズ分の進捗トラッカー
///
/// 書き込みはそのフェーズを駆動するエンジン側のタスクだけが行う。
/// 読み取りはどのスレッドからでも可能。
pub struct PhaseTracker {
    phase: Phase,
    run: u64,
    state: ArcSwap<ProgressSnapshot>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl PhaseTracker {
    fn new(phase: Phase, run: u64, dispatcher: Arc<NotificationDispatcher>) -> Self {
        Self {
            phase,
            run,
            state: ArcSwap::from_pointee(ProgressSnapshot::new(phase)),
            dispatcher,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// イベントを取り込み、変化があれば通知を投入
    pub fn update(&self, event: ProgressEvent) {
        let current = self.state.load();
        let Some(next) = current.apply(&event) else {
            return;
        };
        let next = Arc::new(next);
        self.state.store(next.clone());
        self.dispatcher.submit(self.run, self.phase, next);
    }

    pub fn snapshot(&self) -> Arc<ProgressSnapshot> {
        self.state.load_full()
    }

    /// 終端イベントを適用し、最終スナップショットを同期的に配信
    pub fn finish(&self) -> Arc<ProgressSnapshot> {
        let current = self.state.load_full();
        let last = match current.apply(&ProgressEvent::Complete) {
            Some(next) => {
                let next = Arc::new(next);
                self.state.store(next.clone());
                next
            }
            None => current,
        };
        self.dispatcher.deliver_now(self.run, self.phase, last.clone());
        last
    }

    /// エンジンに渡すイベントシンク
    pub fn sink(self: &Arc<Self>) -> EventSink {
        let tracker = self.clone();
        Arc::new(move |event| tracker.update(event))
    }
}

/// エンジンのコールバックスレッドから呼ばれるイベント受け口
pub type EventSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// 1 回のパイプライン実行で使う 3 フェーズ分のトラッカー
pub struct ProgressTracker {
    phases: [Arc<PhaseTracker>; 3],
}

impl ProgressTracker {
    pub fn new(dispatcher: Arc<NotificationDispatcher>) -> Self {
        let run = dispatcher.next_run_id();
        let phases = Phase::ALL.map(|p| Arc::new(PhaseTracker::new(p, run, dispatcher.clone())));
        Self { phases }
    }

    pub fn phase(&self, phase: Phase) -> &Arc<PhaseTracker> {
        &self.phases[phase.slot()]
    }

    pub fn snapshot(&self, phase: Phase) -> Arc<ProgressSnapshot> {
        self.phase(phase).snapshot()
    }
}

/// `Step 3/7 : RUN make` 形式のビルド出力を解析
pub fn parse_build_step(line: &str) -> Option<ProgressEvent> {
    let rest = line.trim().strip_prefix("Step ")?;
    let (counter, text) = rest.split_once(" : ")?;
    let (n, m) = counter.split_once('/')?;
    let n = n.trim().parse().ok()?;
    let m = m.trim().parse().ok()?;
    Some(ProgressEvent::Instruction {
        index: Some((n, m)),
        text: text.trim().to_string(),
    })
}
