//! ターミナルへの進捗表示

use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;
use streamdock_build::{Phase, ProgressObserver, ProgressSnapshot};

/// pull / build / push それぞれのスピナー
///
/// 通知ワーカーから呼ばれるため、クローンしたものをオブザーバーとして登録する。
#[derive(Clone)]
pub struct TerminalProgress {
    multi: MultiProgress,
    bars: [ProgressBar; 3],
}

impl TerminalProgress {
    pub fn new() -> Self {
        let multi = MultiProgress::new();
        let bars = Phase::ALL.map(|phase| {
            let pb = multi.add(ProgressBar::new_spinner());
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} [{elapsed_precise}] {prefix:>5.bold} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.set_prefix(phase.name());
            pb.set_message("waiting...".dimmed().to_string());
            pb
        });
        Self { multi, bars }
    }

    fn bar(&self, phase: Phase) -> &ProgressBar {
        match phase {
            Phase::Pull => &self.bars[0],
            Phase::Build => &self.bars[1],
            Phase::Push => &self.bars[2],
        }
    }

    /// スピナーの描画を止めて結果を出力できるようにする
    pub fn clear(&self) {
        if let Err(e) = self.multi.clear() {
            tracing::debug!(error = %e, "Failed to clear progress bars");
        }
    }

    /// 完了していないスピナーを失敗として止める
    pub fn abandon(&self, reason: &str) {
        for pb in &self.bars {
            if !pb.is_finished() {
                pb.abandon_with_message(format!("{} {}", "✗".red(), reason));
            }
        }
    }
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// スナップショットを 1 行のメッセージにする
pub fn describe(snapshot: &ProgressSnapshot) -> String {
    if snapshot.complete {
        return format!("{} {} complete", "✓".green(), snapshot.phase);
    }

    let mut parts = Vec::new();
    match snapshot.phase {
        Phase::Build => {
            if let Some((n, m)) = snapshot.instruction_index {
                parts.push(format!("[{}/{}]", n, m));
            }
            if let Some(instruction) = &snapshot.current_instruction {
                parts.push(instruction.clone());
            }
        }
        Phase::Pull | Phase::Push => {
            if let Some(status) = &snapshot.status {
                parts.push(status.clone());
            }
            if snapshot.bytes_total() > 0 {
                parts.push(format!(
                    "{}/{}",
                    format_bytes(snapshot.bytes_current()),
                    format_bytes(snapshot.bytes_total())
                ));
            }
        }
    }
    if let Some(percent) = snapshot.percent() {
        parts.push(format!("({}%)", percent));
    }

    if parts.is_empty() {
        "starting...".to_string()
    } else {
        parts.join(" ")
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

impl ProgressObserver for TerminalProgress {
    fn on_progress(&self, phase: Phase, snapshot: &ProgressSnapshot) -> anyhow::Result<()> {
        let pb = self.bar(phase);
        if pb.is_finished() {
            return Ok(());
        }
        if snapshot.complete {
            pb.finish_with_message(describe(snapshot));
        } else {
            pb.enable_steady_tick(Duration::from_millis(120));
            pb.set_message(describe(snapshot));
        }
        Ok(())
    }
}
