// 并发调度器
//
// 限制同时进行的文件上传数量：
// - Semaphore 控制宽度，超出宽度的任务排队等待而不是被拒绝
// - 每个任务结束后把结果推入完成队列，wait_all 按完成顺序收集
// - 任务 panic 被捕获为失败结果，不会让 wait_all 永远等待

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error};

/// 默认并发宽度
pub const DEFAULT_SCHEDULER_WIDTH: usize = 10;

/// 已提交任务的句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub id: u64,
    pub label: String,
}

/// 已完成任务
#[derive(Debug)]
pub struct CompletedTask<T> {
    pub id: u64,
    pub label: String,
    /// panic 时为 Err(panic 信息)
    pub result: Result<T, String>,
}

/// 并发调度器
pub struct ConcurrencyScheduler<T> {
    width: usize,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    completed_tx: mpsc::UnboundedSender<CompletedTask<T>>,
    completed_rx: mpsc::UnboundedReceiver<CompletedTask<T>>,
    next_id: u64,
    /// 已提交但尚未被 wait_all 收走的任务数
    pending: usize,
}

impl<T: Send + 'static> ConcurrencyScheduler<T> {
    pub fn new(width: usize) -> Self {
        let width = width.max(1);
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        Self {
            width,
            semaphore: Arc::new(Semaphore::new(width)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            completed_tx,
            completed_rx,
            next_id: 0,
            pending: 0,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// 当前正在执行的任务数
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// 观察到的最大并发数
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// 尚未收集结果的任务数
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// 提交任务，立即返回；没有空闲槽位时任务在后台排队
    pub fn submit<F>(&mut self, label: impl Into<String>, task: F) -> TaskHandle
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.next_id += 1;
        self.pending += 1;
        let handle = TaskHandle {
            id: self.next_id,
            label: label.into(),
        };

        let semaphore = self.semaphore.clone();
        let in_flight = self.in_flight.clone();
        let peak = self.peak_in_flight.clone();
        let tx = self.completed_tx.clone();
        let id = handle.id;
        let label = handle.label.clone();

        tokio::spawn(async move {
            // 调度器存活期间信号量不会关闭
            let _permit = semaphore.acquire_owned().await.ok();

            let running = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(running, Ordering::SeqCst);
            debug!("任务开始: #{} {} (并发 {})", id, label, running);

            let result = AssertUnwindSafe(task)
                .catch_unwind()
                .await
                .map_err(|panic| {
                    let message = panic_message(panic.as_ref());
                    error!("任务异常退出: #{} {} - {}", id, label, message);
                    message
                });

            in_flight.fetch_sub(1, Ordering::SeqCst);
            let _ = tx.send(CompletedTask { id, label, result });
        });

        handle
    }

    /// 等待所有已提交任务完成，按完成顺序返回
    pub async fn wait_all(&mut self) -> Vec<CompletedTask<T>> {
        let mut results = Vec::with_capacity(self.pending);
        while self.pending > 0 {
            match self.completed_rx.recv().await {
                Some(done) => {
                    self.pending -= 1;
                    results.push(done);
                }
                None => break,
            }
        }
        results
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_fifteen_tasks_width_ten() {
        let mut scheduler = ConcurrencyScheduler::new(DEFAULT_SCHEDULER_WIDTH);
        let in_flight = scheduler.in_flight.clone();
        let max_sampled = Arc::new(AtomicUsize::new(0));

        for i in 0..15u64 {
            let in_flight = in_flight.clone();
            let max_sampled = max_sampled.clone();
            scheduler.submit(format!("file-{}", i), async move {
                // 任务内部采样当前并发数
                max_sampled.fetch_max(in_flight.load(Ordering::SeqCst), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100 + i * 10)).await;
                max_sampled.fetch_max(in_flight.load(Ordering::SeqCst), Ordering::SeqCst);
                i
            });
        }
        assert_eq!(scheduler.pending(), 15);

        let results = scheduler.wait_all().await;
        assert_eq!(results.len(), 15);
        assert!(results.iter().all(|r| r.result.is_ok()));
        assert!(max_sampled.load(Ordering::SeqCst) <= 10);
        assert_eq!(scheduler.peak_in_flight(), 10);
        assert_eq!(scheduler.in_flight(), 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_in_completion_order() {
        let mut scheduler = ConcurrencyScheduler::new(4);
        for (label, delay) in [("slow", 300u64), ("fast", 100), ("medium", 200)] {
            scheduler.submit(label, async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                label
            });
        }

        let order: Vec<_> = scheduler
            .wait_all()
            .await
            .into_iter()
            .map(|r| r.result.unwrap())
            .collect();
        assert_eq!(order, vec!["fast", "medium", "slow"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submissions_beyond_width_queue() {
        let mut scheduler = ConcurrencyScheduler::new(1);
        scheduler.submit("a", async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            1
        });
        scheduler.submit("b", async { 2 });

        let results = scheduler.wait_all().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].label, "a");
        assert_eq!(scheduler.peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_panic_is_reported() {
        let mut scheduler: ConcurrencyScheduler<u32> = ConcurrencyScheduler::new(2);
        scheduler.submit("ok", async { 1 });
        scheduler.submit("boom", async { panic!("disk on fire") });

        let results = scheduler.wait_all().await;
        assert_eq!(results.len(), 2);
        let failed = results.iter().find(|r| r.label == "boom").unwrap();
        assert_eq!(failed.result.as_ref().unwrap_err(), "disk on fire");
    }

    #[tokio::test]
    async fn test_wait_all_with_nothing_submitted() {
        let mut scheduler: ConcurrencyScheduler<()> = ConcurrencyScheduler::new(0);
        assert_eq!(scheduler.width(), 1);
        assert!(scheduler.wait_all().await.is_empty());
    }
}
