//! 進捗通知のディスパッチャ
//!
//! 有界キューとワーカースレッドのプールでオブザーバーを非同期に呼び出す。
//! キューが満杯のときは最も古い通知を捨てて新しい通知を入れるため、
//! 生産者（エンジンのコールバックスレッド）がブロックすることはない。

use crate::progress::{Phase, ProgressSnapshot};
use arc_swap::ArcSwapOption;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

/// ワーカー数の上限
const MAX_WORKERS: usize = 32;

/// 通知キューの既定の容量
const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// 進捗を受け取るオブザーバー
///
/// エラーやパニックはログに残して無視される。
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, phase: Phase, snapshot: &ProgressSnapshot) -> anyhow::Result<()>;
}

impl<F> ProgressObserver for F
where
    F: Fn(Phase, &ProgressSnapshot) -> anyhow::Result<()> + Send + Sync,
{
    fn on_progress(&self, phase: Phase, snapshot: &ProgressSnapshot) -> anyhow::Result<()> {
        self(phase, snapshot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// `None` なら利用可能な並列度から決める
    pub workers: Option<usize>,
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl DispatcherConfig {
    pub fn worker_count(&self) -> usize {
        let n = self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        n.clamp(1, MAX_WORKERS)
    }
}

struct Notification {
    run: u64,
    phase: Phase,
    snapshot: Arc<ProgressSnapshot>,
}

/// フェーズごとに最後に配信した位置
#[derive(Default)]
struct Cursor {
    run: u64,
    sequence: u64,
}

struct Shared {
    observer: ArcSwapOption<Box<dyn ProgressObserver>>,
    cursors: [Mutex<Cursor>; 3],
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn deliver(&self, n: Notification) {
        let Some(observer) = self.observer.load_full() else {
            return;
        };

        // 同じフェーズの配信は直列化し、古いスナップショットは捨てる
        let mut cursor = self.cursors[n.phase.slot()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if n.run < cursor.run || (n.run == cursor.run && n.snapshot.sequence <= cursor.sequence) {
            tracing::trace!(phase = %n.phase, sequence = n.snapshot.sequence, "Discarding stale progress");
            return;
        }
        cursor.run = n.run;
        cursor.sequence = n.snapshot.sequence;

        match catch_unwind(AssertUnwindSafe(|| observer.on_progress(n.phase, &n.snapshot))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(phase = %n.phase, error = %e, "Progress observer failed");
            }
            Err(_) => {
                tracing::warn!(phase = %n.phase, "Progress observer panicked");
            }
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

enum Mode {
    Inline,
    Pool {
        sender: ArcSwapOption<Sender<Notification>>,
        receiver: Receiver<Notification>,
        workers: Mutex<Vec<JoinHandle<()>>>,
    },
}

/// 進捗通知のディスパッチャ
///
/// コンポジションルートで 1 つ作り、パイプラインに注入する。
pub struct NotificationDispatcher {
    shared: Arc<Shared>,
    mode: Mode,
    next_run: AtomicU64,
}

impl NotificationDispatcher {
    /// ワーカープールを起動
    pub fn new(config: &DispatcherConfig) -> std::io::Result<Self> {
        let shared = Arc::new(Shared::new());
        let (sender, receiver) = channel::bounded(config.queue_capacity.max(1));

        let count = config.worker_count();
        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let rx: Receiver<Notification> = receiver.clone();
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("streamdock-notify-{}", i))
                .spawn(move || {
                    while let Ok(n) = rx.recv() {
                        shared.deliver(n);
                    }
                })?;
            workers.push(handle);
        }

        tracing::debug!(
            workers = count,
            capacity = config.queue_capacity,
            "Notification dispatcher started"
        );

        Ok(Self {
            shared,
            mode: Mode::Pool {
                sender: ArcSwapOption::from_pointee(sender),
                receiver,
                workers: Mutex::new(workers),
            },
            next_run: AtomicU64::new(1),
        })
    }

    /// 呼び出しスレッド上で即座に配信する（テスト用）
    pub fn inline() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            mode: Mode::Inline,
            next_run: AtomicU64::new(1),
        }
    }

    /// オブザーバーを登録（既存のものは置き換え）
    pub fn register_observer(&self, observer: impl ProgressObserver + 'static) {
        let observer: Box<dyn ProgressObserver> = Box::new(observer);
        self.shared.observer.store(Some(Arc::new(observer)));
    }

    pub(crate) fn next_run_id(&self) -> u64 {
        self.next_run.fetch_add(1, Ordering::Relaxed)
    }

    /// 通知を投入（ブロックしない）
    pub(crate) fn submit(&self, run: u64, phase: Phase, snapshot: Arc<ProgressSnapshot>) {
        let n = Notification {
            run,
            phase,
            snapshot,
        };
        match &self.mode {
            Mode::Inline => self.shared.deliver(n),
            Mode::Pool {
                sender, receiver, ..
            } => {
                let Some(tx) = sender.load_full() else {
                    return;
                };
                let mut pending = n;
                loop {
                    match tx.try_send(pending) {
                        Ok(()) => return,
                        Err(TrySendError::Full(n)) => {
                            // 最も古い通知を捨てて空きを作る
                            if receiver.try_recv().is_ok() {
                                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                            }
                            pending = n;
                        }
                        Err(TrySendError::Disconnected(_)) => return,
                    }
                }
            }
        }
    }

    /// キューを経由せずに呼び出しスレッドで配信
    pub(crate) fn deliver_now(&self, run: u64, phase: Phase, snapshot: Arc<ProgressSnapshot>) {
        self.shared.deliver(Notification {
            run,
            phase,
            snapshot,
        });
    }

    /// 配信された通知の数
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    /// キューあふれで捨てられた通知の数
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// キューを処理し切ってからワーカーを停止
    pub fn shutdown(&self) {
        if let Mode::Pool {
            sender, workers, ..
        } = &self.mode
        {
            sender.store(None);
            let handles: Vec<_> = workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
                .collect();
            for handle in handles {
                if handle.join().is_err() {
                    tracing::warn!("Notification worker terminated abnormally");
                }
            }
        }
    }
}

impl Shared {
    fn new() -> Self {
        Self {
            observer: ArcSwapOption::empty(),
            cursors: Default::default(),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
