// 传输进度
//
// 引擎在每个分片确认后更新；可以挂一个父进度用于汇总多个并发文件

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// 计算平均速度 (bytes/s)，耗时为 0 时返回 0
pub fn compute_speed(uploaded_bytes: u64, elapsed_secs: f64) -> u64 {
    if elapsed_secs <= 0.0 || !elapsed_secs.is_finite() {
        return 0;
    }
    (uploaded_bytes as f64 / elapsed_secs) as u64
}

/// 传输进度
///
/// 不变式：0 <= uploaded <= total
#[derive(Debug)]
pub struct TransferProgress {
    uploaded: AtomicU64,
    total: AtomicU64,
    started_at: Mutex<Instant>,
    parent: Option<Arc<TransferProgress>>,
}

impl TransferProgress {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            uploaded: AtomicU64::new(0),
            total: AtomicU64::new(total_bytes),
            started_at: Mutex::new(Instant::now()),
            parent: None,
        }
    }

    /// 创建挂在 parent 下的子进度，子进度的增减同步到 parent
    pub fn with_parent(total_bytes: u64, parent: Arc<TransferProgress>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::new(total_bytes)
        }
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded.load(Ordering::SeqCst)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// 重新开始计数
    ///
    /// 已计入父进度的字节会被扣回
    pub fn reset(&self, total_bytes: u64) {
        self.set_uploaded(0);
        self.total.store(total_bytes, Ordering::SeqCst);
        *self.started_at.lock() = Instant::now();
    }

    /// 增加已上传字节，超过总量时截断
    pub fn add(&self, bytes: u64) {
        let total = self.total_bytes();
        let previous = self
            .uploaded
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_add(bytes).min(total))
            })
            .unwrap_or_else(|current| current);
        let applied = previous.saturating_add(bytes).min(total) - previous;
        if let Some(parent) = &self.parent {
            parent.add(applied);
        }
    }

    /// 直接设置已上传字节（服务器指示续传或重建会话时）
    pub fn set_uploaded(&self, bytes: u64) {
        let value = bytes.min(self.total_bytes());
        let previous = self.uploaded.swap(value, Ordering::SeqCst);
        if let Some(parent) = &self.parent {
            if value >= previous {
                parent.add(value - previous);
            } else {
                parent.subtract(previous - value);
            }
        }
    }

    fn subtract(&self, bytes: u64) {
        let previous = self
            .uploaded
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(bytes))
            })
            .unwrap_or_else(|current| current);
        if let Some(parent) = &self.parent {
            parent.subtract(previous.min(bytes));
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.lock().elapsed()
    }

    /// 平均速度 (bytes/s)
    pub fn speed(&self) -> u64 {
        compute_speed(self.uploaded_bytes(), self.elapsed().as_secs_f64())
    }

    /// 完成百分比 (0.0 - 100.0)，空文件视为 100
    pub fn percent(&self) -> f64 {
        let total = self.total_bytes();
        if total == 0 {
            return 100.0;
        }
        self.uploaded_bytes() as f64 / total as f64 * 100.0
    }

    /// 预计剩余时间（秒），速度为 0 时无法估算
    pub fn eta(&self) -> Option<u64> {
        let speed = self.speed();
        if speed == 0 {
            return None;
        }
        let remaining = self.total_bytes().saturating_sub(self.uploaded_bytes());
        Some(remaining / speed)
    }
}
